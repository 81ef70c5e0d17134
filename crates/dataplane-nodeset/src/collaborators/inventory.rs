//! Ansible inventory rendered into an owned Secret
//!
//! The inventory has one group named after the node set. Group variables
//! hold the container images, the template's Ansible variables and the DNS
//! servers; host variables hold connection settings, per-network addresses
//! and each node's own variables, which win over the group's.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, ResourceExt};
use serde_json::{json, Value};
use tracing::debug;

use dataplane_common::config::ImageDefaults;
use dataplane_common::crd::OpenStackDataPlaneNodeSet;
use dataplane_common::kube_utils::owner_reference;
use dataplane_common::Error;

use super::node_set_labels;
use crate::orchestrator::{InventoryGenerator, Reservations};

/// Key of the rendered inventory inside the Secret
pub const INVENTORY_KEY: &str = "inventory";

/// Name of the Secret holding a node set's inventory
pub fn inventory_secret_name(node_set: &str) -> String {
    format!("dataplanenodeset-{node_set}")
}

fn prefix_len(cidr: &str) -> Option<&str> {
    cidr.split_once('/').map(|(_, p)| p)
}

/// Render the inventory as YAML
pub fn render_inventory(
    node_set: &OpenStackDataPlaneNodeSet,
    reservations: &Reservations,
    server_addresses: &[String],
    images: &ImageDefaults,
) -> Result<String, Error> {
    let name = node_set.name_any();
    let template = &node_set.spec.node_template;

    let mut group_vars: BTreeMap<String, Value> = images
        .ansible_vars()
        .into_iter()
        .map(|(k, v)| (k, Value::String(v)))
        .collect();
    group_vars.extend(template.ansible.ansible_vars.clone());
    group_vars.insert("edpm_tls_certs_enabled".into(), json!(node_set.spec.tls_enabled));
    if !server_addresses.is_empty() {
        group_vars.insert("dns_servers".into(), json!(server_addresses));
    }
    if let Some(user) = &template.ansible.ansible_user {
        group_vars.insert("ansible_user".into(), json!(user));
    }
    if let Some(port) = template.ansible.ansible_port {
        group_vars.insert("ansible_port".into(), json!(port));
    }

    let mut hosts: BTreeMap<String, BTreeMap<String, Value>> = BTreeMap::new();
    for (key, node) in &node_set.spec.nodes {
        let host = node.host_name_or(key);
        let mut vars = BTreeMap::new();
        let node_reservations = reservations.get(host).map(Vec::as_slice).unwrap_or_default();

        for r in node_reservations {
            let net = r.network.to_lowercase();
            vars.insert(format!("{net}_ip"), json!(r.address));
            if let Some(prefix) = r.cidr.as_deref().and_then(prefix_len) {
                vars.insert(format!("{net}_cidr"), json!(prefix));
            }
        }

        let ctlplane = node_reservations
            .iter()
            .find(|r| r.network.eq_ignore_ascii_case("ctlplane"));
        let ansible_host = node
            .ansible
            .ansible_host
            .clone()
            .or_else(|| ctlplane.map(|r| r.address.clone()))
            .unwrap_or_else(|| host.to_string());
        vars.insert("ansible_host".into(), json!(ansible_host));

        let short = host.split('.').next().unwrap_or(host);
        let canonical = match ctlplane.and_then(|r| r.dns_domain.as_deref()) {
            Some(domain) => format!("{short}.{domain}"),
            None => host.to_string(),
        };
        vars.insert("canonical_hostname".into(), json!(canonical));

        if let Some(user) = &node.ansible.ansible_user {
            vars.insert("ansible_user".into(), json!(user));
        }
        if let Some(port) = node.ansible.ansible_port {
            vars.insert("ansible_port".into(), json!(port));
        }
        if let Some(network) = node
            .management_network
            .as_ref()
            .or(template.management_network.as_ref())
        {
            vars.insert("management_network".into(), json!(network));
        }
        vars.extend(node.ansible.ansible_vars.clone());
        hosts.insert(host.to_string(), vars);
    }

    let inventory = BTreeMap::from([(
        name.clone(),
        json!({ "vars": group_vars, "hosts": hosts }),
    )]);
    serde_yaml::to_string(&inventory).map_err(|e| Error::inventory(&name, e.to_string()))
}

/// Writes the rendered inventory to `dataplanenodeset-<name>`
pub struct KubeInventoryGenerator {
    client: Client,
    field_manager: String,
}

impl KubeInventoryGenerator {
    /// Create a new inventory generator
    pub fn new(client: Client, field_manager: &str) -> Self {
        Self {
            client,
            field_manager: field_manager.to_string(),
        }
    }
}

#[async_trait]
impl InventoryGenerator for KubeInventoryGenerator {
    async fn generate(
        &self,
        node_set: &OpenStackDataPlaneNodeSet,
        reservations: &Reservations,
        server_addresses: &[String],
        images: &ImageDefaults,
    ) -> Result<String, Error> {
        let name = node_set.name_any();
        let namespace = node_set.namespace().ok_or(Error::MissingNamespace)?;

        let rendered = render_inventory(node_set, reservations, server_addresses, images)?;
        let max = usize::try_from(node_set.spec.secret_max_size).unwrap_or(0);
        if rendered.len() > max {
            return Err(Error::inventory(
                &name,
                format!(
                    "inventory is {} bytes, larger than secretMaxSize {max}",
                    rendered.len()
                ),
            ));
        }

        let secret_name = inventory_secret_name(&name);
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &namespace);
        let bytes = ByteString(rendered.into_bytes());

        if let Some(live) = api.get_opt(&secret_name).await? {
            let same_data = live
                .data
                .as_ref()
                .and_then(|d| d.get(INVENTORY_KEY))
                .is_some_and(|v| *v == bytes);
            let owned = live
                .owner_references()
                .iter()
                .any(|o| Some(&o.uid) == node_set.metadata.uid.as_ref());
            if same_data && owned {
                return Ok(secret_name);
            }
        }

        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(secret_name.clone()),
                namespace: Some(namespace),
                labels: Some(node_set_labels(node_set)),
                owner_references: Some(vec![owner_reference(node_set)?]),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(INVENTORY_KEY.to_string(), bytes)])),
            ..Default::default()
        };
        api.patch(
            &secret_name,
            &PatchParams::apply(&self.field_manager).force(),
            &Patch::Apply(&secret),
        )
        .await?;
        debug!(node_set = %name, secret = %secret_name, "inventory written");
        Ok(secret_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::fixtures::{node_set, reservations};
    use crate::orchestrator::Reservation;

    fn parse(yaml: &str) -> Value {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn inventory_groups_hosts_under_node_set() {
        let mut ns = node_set("edge-a");
        ns.spec.node_template.ansible.ansible_user = Some("cloud-admin".into());
        ns.spec
            .node_template
            .ansible
            .ansible_vars
            .insert("edpm_network_config_template".into(), json!("templates/net.j2"));

        let yaml = render_inventory(
            &ns,
            &reservations(),
            &["192.168.122.80".to_string()],
            &ImageDefaults::default(),
        )
        .unwrap();
        let inv = parse(&yaml);

        let vars = &inv["edge-a"]["vars"];
        assert_eq!(vars["ansible_user"], "cloud-admin");
        assert_eq!(vars["dns_servers"], json!(["192.168.122.80"]));
        assert_eq!(vars["edpm_network_config_template"], "templates/net.j2");
        assert!(vars["edpm_nova_compute_image"].is_string());

        let host = &inv["edge-a"]["hosts"]["compute-0"];
        assert_eq!(host["ansible_host"], "192.168.122.100");
        assert_eq!(host["ctlplane_ip"], "192.168.122.100");
        assert_eq!(host["canonical_hostname"], "compute-0.ctlplane.example.com");
    }

    #[test]
    fn node_vars_override_connection_defaults() {
        let mut ns = node_set("edge-a");
        let node = ns.spec.nodes.get_mut("compute-0").unwrap();
        node.ansible.ansible_host = Some("10.1.1.1".into());
        node.ansible.ansible_vars.insert("edpm_kernel_args".into(), json!("hugepages=4"));

        let mut reserved = reservations();
        reserved.get_mut("compute-0").unwrap().push(Reservation {
            network: "InternalApi".into(),
            subnet: "subnet1".into(),
            address: "172.17.0.100".into(),
            cidr: Some("172.17.0.0/24".into()),
            ..Default::default()
        });

        let inv = parse(&render_inventory(&ns, &reserved, &[], &ImageDefaults::default()).unwrap());

        let host = &inv["edge-a"]["hosts"]["compute-0"];
        assert_eq!(host["ansible_host"], "10.1.1.1");
        assert_eq!(host["internalapi_ip"], "172.17.0.100");
        assert_eq!(host["internalapi_cidr"], "24");
        assert_eq!(host["edpm_kernel_args"], "hugepages=4");
        assert!(inv["edge-a"]["vars"].get("dns_servers").is_none());
    }

    #[test]
    fn secret_name_is_prefixed() {
        assert_eq!(inventory_secret_name("edge-a"), "dataplanenodeset-edge-a");
    }
}
