//! OpenStackDataPlaneNodeSet controller
//!
//! The reconciler drives each node set's dependencies (services, IP
//! reservations, DNS data, credentials, identity, bare metal, inventory),
//! folds sibling deployments into its status and maps changes on related
//! objects back to the node sets that reference them.

#![deny(missing_docs)]

pub mod collaborators;
pub mod controller;
pub mod deployment_status;
pub mod orchestrator;
pub mod watch;

pub use controller::{error_policy, reconcile, Context, ContextBuilder, KubeClient, KubeClientImpl};
pub use deployment_status::{fold_deployments, DeploymentSummary};
pub use orchestrator::{Collaborators, Halt, Orchestrator, Timings};
pub use watch::{
    requests_for, spawn_failed_pod_diagnostics, ReverseIndex, SharedReverseIndex, WatchedObject,
};
