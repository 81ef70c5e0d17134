//! OpenStackDataPlaneDeployment CRD types
//!
//! A deployment is one execution attempt against a list of node sets. It is
//! owned by a different controller; the node set controller only reads it
//! to fold completion state back into node set status.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::condition::{ConditionSet, READY};

/// One execution attempt targeting a set of node sets
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "dataplane.openstack.org",
    version = "v1beta1",
    kind = "OpenStackDataPlaneDeployment",
    plural = "openstackdataplanedeployments",
    shortname = "osdpd",
    namespaced,
    status = "OpenStackDataPlaneDeploymentStatus",
    printcolumn = r#"{"name":"NodeSets","type":"string","jsonPath":".spec.nodeSets"}"#,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.conditions[0].status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct OpenStackDataPlaneDeploymentSpec {
    /// Node sets this deployment runs against
    #[serde(default)]
    pub node_sets: Vec<String>,

    /// Services to run instead of each node set's own list
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub services_override: Vec<String>,
}

/// Observed state of a deployment
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OpenStackDataPlaneDeploymentStatus {
    /// Overall conditions, `Ready` first
    #[serde(default)]
    pub conditions: ConditionSet,

    /// Every targeted node set finished
    #[serde(default)]
    pub deployed: bool,

    /// ConfigMap content hashes used by this deployment
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config_map_hashes: BTreeMap<String, String>,

    /// Secret content hashes used by this deployment
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub secret_hashes: BTreeMap<String, String>,

    /// Node set config hash deployed, keyed by node set name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_set_hashes: BTreeMap<String, String>,

    /// Per node set condition snapshots
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_set_conditions: BTreeMap<String, ConditionSet>,
}

impl OpenStackDataPlaneDeployment {
    /// True when this deployment lists `node_set` as a target
    pub fn targets(&self, node_set: &str) -> bool {
        self.spec.node_sets.iter().any(|n| n == node_set)
    }

    /// True when the API server has marked this deployment for deletion
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Transition time of this deployment's own Ready condition
    pub fn ready_transition_time(&self) -> Option<DateTime<Utc>> {
        self.status
            .as_ref()
            .and_then(|s| s.conditions.get(READY))
            .map(|c| c.last_transition_time)
    }

    /// True when this deployment finished for `node_set`
    ///
    /// Either the whole deployment is done or the node set's own snapshot
    /// reports Ready.
    pub fn completed_for(&self, node_set: &str) -> bool {
        self.status.as_ref().is_some_and(|s| {
            s.deployed
                || s.node_set_conditions
                    .get(node_set)
                    .is_some_and(|c| c.is_true(READY))
        })
    }

    /// Config hash this deployment recorded for `node_set`
    pub fn hash_for(&self, node_set: &str) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.node_set_hashes.get(node_set))
            .map(String::as_str)
    }

    /// True when the overall Ready condition is an error
    pub fn is_failed(&self) -> bool {
        self.status
            .as_ref()
            .and_then(|s| s.conditions.get(READY))
            .is_some_and(|c| c.is_error())
    }
}
