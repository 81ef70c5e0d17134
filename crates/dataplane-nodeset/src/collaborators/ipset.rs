//! One IPSet per node, reserving an address on every network the node joins

use async_trait::async_trait;
use kube::api::{Api, DynamicObject};
use kube::{Client, ResourceExt};
use serde_json::{json, Value};
use tracing::debug;

use dataplane_common::crd::OpenStackDataPlaneNodeSet;
use dataplane_common::kube_utils::{apply_if_changed, dynamic_ready, ip_set_resource};
use dataplane_common::Error;

use super::owned_object;
use crate::orchestrator::{IpSetEnsurer, IpSetOutcome, Reservation, Reservations};

/// Creates and reads IPSets
pub struct KubeIpSetEnsurer {
    client: Client,
    field_manager: String,
}

impl KubeIpSetEnsurer {
    /// Create a new IPSet ensurer
    pub fn new(client: Client, field_manager: &str) -> Self {
        Self {
            client,
            field_manager: field_manager.to_string(),
        }
    }
}

#[async_trait]
impl IpSetEnsurer for KubeIpSetEnsurer {
    async fn ensure(&self, node_set: &OpenStackDataPlaneNodeSet) -> Result<IpSetOutcome, Error> {
        let namespace = node_set.namespace().ok_or(Error::MissingNamespace)?;
        let resource = ip_set_resource();
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), &namespace, &resource);

        let mut outcome = IpSetOutcome {
            ready: true,
            ..Default::default()
        };
        for (key, node) in &node_set.spec.nodes {
            let networks = node.effective_networks(&node_set.spec.node_template);
            if networks.is_empty() {
                continue;
            }
            let host = node.host_name_or(key);
            let desired = owned_object(
                &resource,
                host,
                node_set,
                json!({ "networks": networks, "immutable": false }),
            )?;
            let (ip_set, changed) =
                apply_if_changed(&api, host, &desired, &self.field_manager).await?;

            if !changed && dynamic_ready(&ip_set) {
                outcome
                    .reservations
                    .insert(host.to_string(), parse_reservations(&ip_set.data));
            } else {
                debug!(node_set = %node_set.name_any(), ip_set = %host, "IPSet not ready");
                outcome.ready = false;
            }
        }
        Ok(outcome)
    }
}

/// Reservations listed under `status.reservations`
pub fn parse_reservations(data: &Value) -> Vec<Reservation> {
    let text = |r: &Value, field: &str| r.get(field).and_then(Value::as_str).map(str::to_string);
    data.pointer("/status/reservations")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|r| {
            Some(Reservation {
                network: text(r, "net")?,
                subnet: text(r, "subnet").unwrap_or_default(),
                address: text(r, "address")?,
                dns_domain: text(r, "dnsDomain"),
                gateway: text(r, "gateway"),
                cidr: text(r, "cidr"),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reservations_are_read_from_status() {
        let data = json!({"status": {"reservations": [
            {"net": "ctlplane", "subnet": "subnet1", "address": "192.168.122.100",
             "dnsDomain": "ctlplane.example.com", "gateway": "192.168.122.1", "cidr": "192.168.122.0/24"},
            {"net": "internalapi", "subnet": "subnet1", "address": "172.17.0.100"},
            {"subnet": "broken"}
        ]}});

        let reservations = parse_reservations(&data);

        assert_eq!(reservations.len(), 2);
        assert_eq!(reservations[0].network, "ctlplane");
        assert_eq!(reservations[0].cidr.as_deref(), Some("192.168.122.0/24"));
        assert_eq!(reservations[1].dns_domain, None);
    }

    #[test]
    fn missing_status_has_no_reservations() {
        assert!(parse_reservations(&json!({"spec": {}})).is_empty());
    }
}
