//! Drift detection hash
//!
//! The config hash covers only the node template and the per-node map. Tags,
//! environment overrides and the service list can change without forcing a
//! redeploy, so they stay out of the digest.
//!
//! The input is encoded as JSON with object keys sorted at every depth, so
//! the digest does not depend on field or map insertion order.

use std::fmt::Write;

use aws_lc_rs::digest;
use serde::Serialize;

use crate::crd::{NodeSection, NodeTemplate, OpenStackDataPlaneNodeSetSpec};
use crate::Error;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HashedConfig<'a> {
    node_template: &'a NodeTemplate,
    nodes: &'a std::collections::BTreeMap<String, NodeSection>,
}

/// Hash the redeploy-relevant part of a node set spec
///
/// Returns a lowercase hex SHA-256 digest.
pub fn config_hash(spec: &OpenStackDataPlaneNodeSetSpec) -> Result<String, Error> {
    let mut canonical = serde_json::to_value(HashedConfig {
        node_template: &spec.node_template,
        nodes: &spec.nodes,
    })
    .map_err(|e| Error::serialization_for_kind("OpenStackDataPlaneNodeSet", e.to_string()))?;
    sort_keys(&mut canonical);
    let encoded = serde_json::to_vec(&canonical)?;
    Ok(hex_digest(&encoded))
}

// serde_json keeps insertion order when another crate turns on `preserve_order`
fn sort_keys(value: &mut serde_json::Value) {
    match value {
        serde_json::Value::Object(map) => {
            let mut entries: Vec<_> = std::mem::take(map).into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            for (key, mut child) in entries {
                sort_keys(&mut child);
                map.insert(key, child);
            }
        }
        serde_json::Value::Array(items) => items.iter_mut().for_each(sort_keys),
        _ => {}
    }
}

fn hex_digest(input: &[u8]) -> String {
    let hash = digest::digest(&digest::SHA256, input);
    hash.as_ref()
        .iter()
        .fold(String::with_capacity(64), |mut s, b| {
            let _ = write!(s, "{:02x}", b);
            s
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{AnsibleOpts, NetworkRef};
    use k8s_openapi::api::core::v1::EnvVar;
    use std::collections::BTreeMap;

    fn spec() -> OpenStackDataPlaneNodeSetSpec {
        serde_json::from_value(serde_json::json!({
            "nodeTemplate": {
                "ansibleSSHPrivateKeySecret": "dataplane-ansible-ssh",
                "ansible": { "ansibleUser": "cloud-admin", "ansibleVars": { "b": 1, "a": 2 } }
            },
            "nodes": {
                "compute-0": { "hostName": "compute-0" },
                "compute-1": { "hostName": "compute-1" }
            }
        }))
        .unwrap()
    }

    #[test]
    fn hash_is_stable_and_hex() {
        let h = config_hash(&spec()).unwrap();
        assert_eq!(h, config_hash(&spec()).unwrap());
        assert_eq!(h.len(), 64);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn tags_env_and_services_do_not_affect_hash() {
        let base = config_hash(&spec()).unwrap();

        let mut changed = spec();
        changed.tags = vec!["edge".into()];
        changed.env = vec![EnvVar {
            name: "ANSIBLE_FORCE_COLOR".into(),
            value: Some("True".into()),
            ..Default::default()
        }];
        changed.services = vec!["bootstrap".into()];
        changed.network_attachments = vec!["ctlplane".into()];

        assert_eq!(config_hash(&changed).unwrap(), base);
    }

    #[test]
    fn template_change_changes_hash() {
        let base = config_hash(&spec()).unwrap();
        let mut changed = spec();
        changed.node_template.ansible.ansible_user = Some("root".into());
        assert_ne!(config_hash(&changed).unwrap(), base);
    }

    #[test]
    fn node_override_change_changes_hash() {
        let base = config_hash(&spec()).unwrap();
        let mut changed = spec();
        changed
            .nodes
            .get_mut("compute-1")
            .unwrap()
            .networks
            .push(NetworkRef {
                name: "internalapi".into(),
                subnet_name: "subnet1".into(),
                ..Default::default()
            });
        assert_ne!(config_hash(&changed).unwrap(), base);
    }

    #[test]
    fn map_insertion_order_does_not_matter() {
        let mut vars_ab = BTreeMap::new();
        vars_ab.insert("a".to_string(), serde_json::json!(1));
        vars_ab.insert("b".to_string(), serde_json::json!({"y": 1, "x": 2}));
        let mut vars_ba = BTreeMap::new();
        vars_ba.insert("b".to_string(), serde_json::json!({"x": 2, "y": 1}));
        vars_ba.insert("a".to_string(), serde_json::json!(1));

        let mut one = spec();
        one.node_template.ansible = AnsibleOpts {
            ansible_vars: vars_ab,
            ..Default::default()
        };
        let mut two = spec();
        two.node_template.ansible = AnsibleOpts {
            ansible_vars: vars_ba,
            ..Default::default()
        };

        assert_eq!(config_hash(&one).unwrap(), config_hash(&two).unwrap());
    }

    #[test]
    fn adding_a_node_changes_hash() {
        let base = config_hash(&spec()).unwrap();
        let mut changed = spec();
        changed.nodes.insert("compute-2".into(), Default::default());
        assert_ne!(config_hash(&changed).unwrap(), base);
    }
}
