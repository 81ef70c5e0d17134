//! Custom Resource Definitions for the dataplane operator
//!
//! `OpenStackDataPlaneNodeSet` is reconciled by this operator.
//! `OpenStackDataPlaneDeployment` is only read.

mod deployment;
mod nodeset;
mod types;

pub use deployment::{
    OpenStackDataPlaneDeployment, OpenStackDataPlaneDeploymentSpec,
    OpenStackDataPlaneDeploymentStatus,
};
pub use nodeset::{
    BaremetalHost, BaremetalSetTemplate, ExecutionSpec, NodeSection, NodeTemplate,
    OpenStackDataPlaneNodeSet, OpenStackDataPlaneNodeSetSpec, OpenStackDataPlaneNodeSetStatus,
    DEFAULT_SECRET_MAX_SIZE, DEFAULT_SERVICES, NODE_SET_READY_MESSAGE,
};
pub use types::{
    AnsibleOpts, AnsibleVarsFromSource, Condition, ConditionSeverity, ConditionStatus,
    LocalObjectRef, NetworkRef,
};
