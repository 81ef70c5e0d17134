//! Kubernetes helpers shared by the controller and its collaborators
//!
//! Most sub-resources belong to other operators, so they are addressed as
//! [`DynamicObject`]s through the [`ApiResource`] descriptors below instead
//! of generated Rust types.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, DynamicObject, Patch, PatchParams};
use kube::discovery::ApiResource;
use kube::Resource;
use serde_json::Value;
use tracing::debug;

use crate::crd::OpenStackDataPlaneNodeSet;
use crate::Error;

/// Group of the network operator's resources
pub const NETWORK_GROUP: &str = "network.openstack.org";
/// Group of the bare metal operator's resources
pub const BAREMETAL_GROUP: &str = "baremetal.openstack.org";
/// Group of the execution job resources
pub const ANSIBLEEE_GROUP: &str = "ansibleee.openstack.org";
/// Group of this operator's resources
pub const DATAPLANE_GROUP: &str = "dataplane.openstack.org";

fn resource(group: &str, kind: &str, plural: &str) -> ApiResource {
    ApiResource {
        group: group.to_string(),
        version: "v1beta1".to_string(),
        api_version: format!("{group}/v1beta1"),
        kind: kind.to_string(),
        plural: plural.to_string(),
    }
}

/// Per-node network reservation
pub fn ip_set_resource() -> ApiResource {
    resource(NETWORK_GROUP, "IPSet", "ipsets")
}

/// DNS records published for a node set
pub fn dns_data_resource() -> ApiResource {
    resource(NETWORK_GROUP, "DNSData", "dnsdata")
}

/// DNS server instance serving the records
pub fn dns_masq_resource() -> ApiResource {
    resource(NETWORK_GROUP, "DNSMasq", "dnsmasqs")
}

/// Bare metal set provisioning the nodes
pub fn baremetal_set_resource() -> ApiResource {
    resource(BAREMETAL_GROUP, "OpenStackBaremetalSet", "openstackbaremetalsets")
}

/// Service definition run against nodes
pub fn dataplane_service_resource() -> ApiResource {
    resource(
        DATAPLANE_GROUP,
        "OpenStackDataPlaneService",
        "openstackdataplaneservices",
    )
}

/// Ansible execution job
pub fn ansible_ee_resource() -> ApiResource {
    resource(ANSIBLEEE_GROUP, "OpenStackAnsibleEE", "openstackansibleees")
}

/// Controller owner reference pointing at the node set
///
/// Garbage collection deletes every object carrying it when the node set goes away.
pub fn owner_reference(node_set: &OpenStackDataPlaneNodeSet) -> Result<OwnerReference, Error> {
    node_set.controller_owner_ref(&()).ok_or_else(|| {
        Error::internal_with_context(
            "owner_reference",
            format!(
                "node set {} has no uid yet",
                node_set.meta().name.as_deref().unwrap_or_default()
            ),
        )
    })
}

/// True when every field in `desired` is present with the same value in `actual`
///
/// Objects compare field by field, so values the API server defaulted into
/// `actual` do not count as drift. Arrays and scalars must match exactly.
pub fn json_contains(actual: &Value, desired: &Value) -> bool {
    match (actual, desired) {
        (Value::Object(a), Value::Object(d)) => d
            .iter()
            .all(|(k, dv)| a.get(k).is_some_and(|av| json_contains(av, dv))),
        (Value::Array(a), Value::Array(d)) => {
            a.len() == d.len() && a.iter().zip(d).all(|(av, dv)| json_contains(av, dv))
        }
        _ => actual == desired,
    }
}

/// JSON merge patch turning `old` into `new`
///
/// Unchanged keys are left out and keys missing from `new` become `null`,
/// so the patch also removes entries the API server would otherwise keep.
pub fn merge_patch(old: &Value, new: &Value) -> Value {
    match (old, new) {
        (Value::Object(o), Value::Object(n)) => {
            let mut patch = serde_json::Map::new();
            for (key, nv) in n {
                match o.get(key) {
                    Some(ov) if ov == nv => {}
                    Some(ov) if ov.is_object() && nv.is_object() => {
                        patch.insert(key.clone(), merge_patch(ov, nv));
                    }
                    _ => {
                        patch.insert(key.clone(), nv.clone());
                    }
                }
            }
            for key in o.keys().filter(|k| !n.contains_key(*k)) {
                patch.insert(key.clone(), Value::Null);
            }
            Value::Object(patch)
        }
        _ => new.clone(),
    }
}

/// True when the object's `status.conditions` has `Ready=True`
pub fn dynamic_ready(obj: &DynamicObject) -> bool {
    obj.data
        .pointer("/status/conditions")
        .and_then(Value::as_array)
        .is_some_and(|conds| {
            conds.iter().any(|c| {
                c.get("type").and_then(Value::as_str) == Some("Ready")
                    && c.get("status").and_then(Value::as_str) == Some("True")
            })
        })
}

/// Server-side apply `desired` unless the live object already matches it
///
/// Only `spec`, labels and owner references are compared. Returns the live
/// object and whether a write happened, so callers can tell a freshly
/// changed object apart from a settled one.
pub async fn apply_if_changed(
    api: &Api<DynamicObject>,
    name: &str,
    desired: &Value,
    field_manager: &str,
) -> Result<(DynamicObject, bool), Error> {
    if let Some(existing) = api.get_opt(name).await? {
        let live = serde_json::to_value(&existing)?;
        let unchanged = ["spec", "metadata/labels", "metadata/ownerReferences"]
            .iter()
            .all(|path| {
                let pointer = format!("/{path}");
                match desired.pointer(&pointer) {
                    Some(want) => live
                        .pointer(&pointer)
                        .is_some_and(|have| json_contains(have, want)),
                    None => true,
                }
            });
        if unchanged {
            return Ok((existing, false));
        }
    }

    debug!(name = %name, "applying changed object");
    let applied = api
        .patch(
            name,
            &PatchParams::apply(field_manager).force(),
            &Patch::Apply(desired),
        )
        .await?;
    Ok((applied, true))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_contains_ignores_defaulted_fields() {
        let actual = json!({"spec": {"networks": [{"name": "ctlplane", "subnetName": "subnet1", "defaultRoute": false}], "immutable": true}});
        let desired = json!({"spec": {"networks": [{"name": "ctlplane", "subnetName": "subnet1"}]}});
        assert!(json_contains(&actual, &desired));
    }

    #[test]
    fn json_contains_detects_changed_values_and_lengths() {
        let actual = json!({"hosts": [{"ip": "10.0.0.1"}]});
        assert!(!json_contains(&actual, &json!({"hosts": [{"ip": "10.0.0.2"}]})));
        assert!(!json_contains(
            &actual,
            &json!({"hosts": [{"ip": "10.0.0.1"}, {"ip": "10.0.0.2"}]})
        ));
        assert!(!json_contains(&actual, &json!({"missing": 1})));
    }

    #[test]
    fn merge_patch_sets_removed_keys_to_null() {
        let old = json!({"deployed": true, "deploymentStatuses": {"d1": [], "d2": []}, "configHash": "a"});
        let new = json!({"deployed": true, "deploymentStatuses": {"d2": []}, "configHash": "b"});
        assert_eq!(
            merge_patch(&old, &new),
            json!({"deploymentStatuses": {"d1": null}, "configHash": "b"})
        );
    }

    #[test]
    fn merge_patch_replaces_arrays_whole() {
        let old = json!({"conditions": [{"type": "Ready"}]});
        let new = json!({"conditions": [{"type": "Ready"}, {"type": "InputReady"}]});
        assert_eq!(merge_patch(&old, &new), new);
    }

    #[test]
    fn dynamic_ready_reads_status_conditions() {
        let ar = ip_set_resource();
        let mut obj = DynamicObject::new("compute-0", &ar);
        assert!(!dynamic_ready(&obj));

        obj.data = json!({"status": {"conditions": [
            {"type": "ReservationReady", "status": "True"},
            {"type": "Ready", "status": "False"}
        ]}});
        assert!(!dynamic_ready(&obj));

        obj.data = json!({"status": {"conditions": [{"type": "Ready", "status": "True"}]}});
        assert!(dynamic_ready(&obj));
    }

    #[test]
    fn resources_use_v1beta1() {
        let ar = baremetal_set_resource();
        assert_eq!(ar.api_version, "baremetal.openstack.org/v1beta1");
        assert_eq!(ar.plural, "openstackbaremetalsets");
        assert_eq!(dns_data_resource().kind, "DNSData");
    }

    #[test]
    fn owner_reference_requires_uid() {
        let node_set: OpenStackDataPlaneNodeSet = serde_json::from_value(json!({
            "apiVersion": "dataplane.openstack.org/v1beta1",
            "kind": "OpenStackDataPlaneNodeSet",
            "metadata": {"name": "edge-a", "namespace": "openstack"},
            "spec": {"nodeTemplate": {"ansibleSSHPrivateKeySecret": "key"}, "nodes": {}}
        }))
        .unwrap();
        assert!(owner_reference(&node_set).is_err());

        let mut with_uid = node_set.clone();
        with_uid.metadata.uid = Some("1234".into());
        let owner = owner_reference(&with_uid).unwrap();
        assert_eq!(owner.kind, "OpenStackDataPlaneNodeSet");
        assert_eq!(owner.controller, Some(true));
    }
}
