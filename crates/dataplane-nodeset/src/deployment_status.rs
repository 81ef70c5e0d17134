//! Folds sibling deployment outcomes into node set status
//!
//! Deployments are visited oldest to newest by the transition time of their
//! own Ready condition, so hashes recorded by later deployments overwrite
//! earlier ones and readiness reflects the most recent attempt.

use std::cmp::Ordering;

use dataplane_common::crd::{OpenStackDataPlaneDeployment, OpenStackDataPlaneNodeSetStatus};
use kube::ResourceExt;
use tracing::debug;

/// Outcome of folding deployments into a node set
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeploymentSummary {
    /// At least one live deployment targets the node set
    pub exists: bool,
    /// The most recent targeting deployment completed for the node set
    pub ready: bool,
    /// The most recent targeting deployment failed
    pub failed: bool,
}

/// Order deployments oldest first
///
/// Deployments without a Ready condition sort after those with one. Equal or
/// missing times fall back to creation time and then name, giving a total
/// order that is stable across passes.
fn oldest_first(a: &OpenStackDataPlaneDeployment, b: &OpenStackDataPlaneDeployment) -> Ordering {
    let by_ready = match (a.ready_transition_time(), b.ready_transition_time()) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    };
    by_ready
        .then_with(|| {
            let created = |d: &OpenStackDataPlaneDeployment| {
                d.metadata.creation_timestamp.as_ref().map(|t| t.0)
            };
            created(a).cmp(&created(b))
        })
        .then_with(|| a.name_any().cmp(&b.name_any()))
}

/// Merge the deployments targeting `node_set` into `status`
///
/// Deleting deployments and those not listing the node set are ignored.
/// Completed deployments contribute their ConfigMap and Secret hashes and set
/// `deployed_config_hash`; every visited deployment stores its condition
/// snapshot in `deployment_statuses`. Those three maps are rebuilt from the
/// listed deployments, so entries of deleted or retargeted deployments drop
/// out. `deployed_config_hash` persists across passes.
pub fn fold_deployments(
    node_set: &str,
    mut deployments: Vec<OpenStackDataPlaneDeployment>,
    status: &mut OpenStackDataPlaneNodeSetStatus,
) -> DeploymentSummary {
    status.deployment_statuses.clear();
    status.config_map_hashes.clear();
    status.secret_hashes.clear();

    deployments.retain(|d| !d.is_deleting() && d.targets(node_set));
    deployments.sort_by(oldest_first);

    let mut summary = DeploymentSummary::default();
    for deployment in &deployments {
        let name = deployment.name_any();
        summary.exists = true;
        summary.ready = false;

        let Some(deployment_status) = deployment.status.as_ref() else {
            summary.failed = false;
            status
                .deployment_statuses
                .insert(name, Default::default());
            continue;
        };

        if deployment.completed_for(node_set) {
            summary.ready = true;
            status.config_map_hashes.extend(
                deployment_status
                    .config_map_hashes
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone())),
            );
            status.secret_hashes.extend(
                deployment_status
                    .secret_hashes
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone())),
            );
            status.deployed_config_hash = deployment.hash_for(node_set).unwrap_or_default().to_string();
        }

        status.deployment_statuses.insert(
            name.clone(),
            deployment_status
                .node_set_conditions
                .get(node_set)
                .cloned()
                .unwrap_or_default(),
        );

        summary.failed = deployment.is_failed();
        debug!(deployment = %name, ready = summary.ready, failed = summary.failed, "folded deployment");
    }
    summary
}
