//! OpenStackBaremetalSet provisioning the node set's hosts

use async_trait::async_trait;
use kube::api::{Api, DynamicObject};
use kube::{Client, ResourceExt};
use serde_json::{json, Value};
use tracing::debug;

use dataplane_common::crd::OpenStackDataPlaneNodeSet;
use dataplane_common::kube_utils::{apply_if_changed, baremetal_set_resource, dynamic_ready};
use dataplane_common::Error;

use super::owned_object;
use crate::orchestrator::{BareMetalProvisioner, Reservation, Reservations};

const STAGE: &str = "baremetal";

fn ctlplane(reservations: &[Reservation]) -> Option<&Reservation> {
    reservations
        .iter()
        .find(|r| r.network.eq_ignore_ascii_case("ctlplane"))
}

/// `address/prefix`, taking the prefix length from the subnet CIDR
fn with_prefix(reservation: &Reservation) -> String {
    match reservation.cidr.as_deref().and_then(|c| c.split_once('/')) {
        Some((_, prefix)) => format!("{}/{prefix}", reservation.address),
        None => reservation.address.clone(),
    }
}

/// Spec of the bare metal set built from the node set's template
///
/// Hosts without a declared control plane address get the one reserved on
/// the ctlplane network. The DNS servers become the hosts' bootstrap DNS.
pub fn baremetal_set_spec(
    node_set: &OpenStackDataPlaneNodeSet,
    reservations: &Reservations,
    server_addresses: &[String],
) -> Result<Value, Error> {
    let name = node_set.name_any();
    let template = &node_set.spec.baremetal_set_template;
    let mut spec = serde_json::to_value(template)?;

    let mut gateway = template.ctlplane_gateway.clone();
    let mut domain = None;
    for (host, bmh) in &template.baremetal_hosts {
        let reserved = reservations.get(host).and_then(|r| ctlplane(r));
        let address = match (&bmh.ctl_plane_ip, reserved) {
            (Some(ip), _) if !ip.is_empty() => ip.clone(),
            (_, Some(r)) => with_prefix(r),
            _ => {
                return Err(Error::dependency(
                    &name,
                    STAGE,
                    format!("no control plane address for host {host}"),
                ))
            }
        };
        if let Some(r) = reserved {
            gateway = gateway.or_else(|| r.gateway.clone());
            domain = domain.or_else(|| r.dns_domain.clone());
        }
        spec["baremetalHosts"][host]["ctlPlaneIP"] = json!(address);

        let network_data = node_set
            .spec
            .nodes
            .iter()
            .find(|(key, node)| node.host_name_or(key.as_str()) == host.as_str())
            .and_then(|(_, node)| node.preprovisioning_network_data_name.as_deref());
        if let Some(secret) = network_data {
            spec["baremetalHosts"][host]["networkData"] = json!({ "name": secret });
        }
    }

    if let Some(gateway) = gateway {
        spec["ctlplaneGateway"] = json!(gateway);
    }
    if let Some(domain) = domain {
        spec["domainName"] = json!(domain);
    }
    spec["bootstrapDns"] = json!(server_addresses);
    if template.deployment_ssh_secret.is_none() {
        spec["deploymentSSHSecret"] = json!(node_set.spec.node_template.ansible_ssh_private_key_secret);
    }
    Ok(spec)
}

/// Applies the bare metal set and reports its readiness
pub struct KubeBareMetalProvisioner {
    client: Client,
    field_manager: String,
}

impl KubeBareMetalProvisioner {
    /// Create a new bare metal provisioner
    pub fn new(client: Client, field_manager: &str) -> Self {
        Self {
            client,
            field_manager: field_manager.to_string(),
        }
    }
}

#[async_trait]
impl BareMetalProvisioner for KubeBareMetalProvisioner {
    async fn deploy(
        &self,
        node_set: &OpenStackDataPlaneNodeSet,
        reservations: &Reservations,
        server_addresses: &[String],
    ) -> Result<bool, Error> {
        let name = node_set.name_any();
        let namespace = node_set.namespace().ok_or(Error::MissingNamespace)?;
        let resource = baremetal_set_resource();
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), &namespace, &resource);

        let spec = baremetal_set_spec(node_set, reservations, server_addresses)?;
        let desired = owned_object(&resource, &name, node_set, spec)?;
        let (set, changed) = apply_if_changed(&api, &name, &desired, &self.field_manager).await?;

        let ready = !changed && dynamic_ready(&set);
        debug!(node_set = %name, changed, ready, "OpenStackBaremetalSet reconciled");
        Ok(ready)
    }
}
