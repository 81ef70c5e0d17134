//! Kubernetes-backed implementations of the pipeline collaborators
//!
//! Each collaborator owns a clone of the kube [`Client`] and talks to the
//! API server directly. Objects created on behalf of a node set carry its
//! name as a label and a controller owner reference, so they are garbage
//! collected with it and routed back to it by the owner watch.

mod baremetal;
mod dns;
mod identity;
mod inventory;
mod ipset;
mod secret;
mod services;

use std::collections::BTreeMap;
use std::sync::Arc;

use kube::discovery::ApiResource;
use kube::{Client, ResourceExt};
use serde_json::{json, Value};

use dataplane_common::crd::OpenStackDataPlaneNodeSet;
use dataplane_common::kube_utils::owner_reference;
use dataplane_common::{Error, NODE_SET_LABEL_KEY};

use crate::orchestrator::Collaborators;

pub use baremetal::{baremetal_set_spec, KubeBareMetalProvisioner};
pub use dns::{dns_records, DnsRecords, KubeDnsDataEnsurer};
pub use identity::KubeIdentityProvisioner;
pub use inventory::{inventory_secret_name, render_inventory, KubeInventoryGenerator};
pub use ipset::{parse_reservations, KubeIpSetEnsurer};
pub use secret::{missing_keys, KubeSecretVerifier};
pub use services::{validate_service, KubeServiceEnsurer};

/// Build the production collaborators sharing one client
pub fn kube_collaborators(client: Client, field_manager: &str) -> Collaborators {
    Collaborators {
        services: Arc::new(KubeServiceEnsurer::new(client.clone())),
        ip_sets: Arc::new(KubeIpSetEnsurer::new(client.clone(), field_manager)),
        dns: Arc::new(KubeDnsDataEnsurer::new(client.clone(), field_manager)),
        secrets: Arc::new(KubeSecretVerifier::new(client.clone())),
        identity: Arc::new(KubeIdentityProvisioner::new(client.clone(), field_manager)),
        bare_metal: Arc::new(KubeBareMetalProvisioner::new(client.clone(), field_manager)),
        inventory: Arc::new(KubeInventoryGenerator::new(client, field_manager)),
    }
}

/// Labels put on every object generated for a node set
pub(crate) fn node_set_labels(node_set: &OpenStackDataPlaneNodeSet) -> BTreeMap<String, String> {
    BTreeMap::from([(NODE_SET_LABEL_KEY.to_string(), node_set.name_any())])
}

/// Full object body for server-side apply of an owned dynamic resource
pub(crate) fn owned_object(
    resource: &ApiResource,
    name: &str,
    node_set: &OpenStackDataPlaneNodeSet,
    spec: Value,
) -> Result<Value, Error> {
    Ok(json!({
        "apiVersion": resource.api_version,
        "kind": resource.kind,
        "metadata": {
            "name": name,
            "namespace": node_set.namespace(),
            "labels": node_set_labels(node_set),
            "ownerReferences": [owner_reference(node_set)?],
        },
        "spec": spec,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::fixtures::node_set;
    use dataplane_common::kube_utils::ip_set_resource;

    #[test]
    fn owned_object_carries_labels_and_owner() {
        let ns = node_set("edge-a");
        let obj = owned_object(&ip_set_resource(), "compute-0", &ns, json!({"networks": []}))
            .unwrap();

        assert_eq!(obj["apiVersion"], "network.openstack.org/v1beta1");
        assert_eq!(obj["metadata"]["namespace"], "openstack");
        assert_eq!(obj["metadata"]["labels"][NODE_SET_LABEL_KEY], "edge-a");
        assert_eq!(obj["metadata"]["ownerReferences"][0]["uid"], "uid-edge-a");
        assert_eq!(obj["metadata"]["ownerReferences"][0]["controller"], true);
    }
}
