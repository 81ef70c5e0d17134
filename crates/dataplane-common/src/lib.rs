//! Common types for the dataplane operator: CRDs, conditions, errors and utilities

#![deny(missing_docs)]

pub mod condition;
pub mod config;
pub mod crd;
pub mod error;
pub mod hash;
pub mod kube_utils;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Field manager used for server-side apply and status patches
pub const DEFAULT_FIELD_MANAGER: &str = "dataplane-operator";

/// Label carried by execution pods, valued with the deployment name
pub const DEPLOYMENT_LABEL_KEY: &str = "openstackdataplanedeployment";

/// Label carried by objects generated for a node set, valued with its name
pub const NODE_SET_LABEL_KEY: &str = "openstackdataplanenodeset";
