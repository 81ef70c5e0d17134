//! Supporting types shared by the dataplane CRDs

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition status following Kubernetes conventions
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// How bad a False condition is
///
/// True and Unknown conditions carry no severity.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionSeverity {
    /// Blocks progress until someone intervenes
    Error,
    /// Degraded but progressing
    Warning,
    /// Expected transient state (waiting on a dependency)
    Info,
}

impl std::fmt::Display for ConditionSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error => write!(f, "Error"),
            Self::Warning => write!(f, "Warning"),
            Self::Info => write!(f, "Info"),
        }
    }
}

/// Kubernetes-style condition for status reporting
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Condition {
    /// Type of condition (e.g., Ready, InputReady)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Severity, only set on False conditions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<ConditionSeverity>,

    /// Machine-readable reason for the condition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition transitioned
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            severity: None,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }

    /// Attach a severity (builder style)
    pub fn with_severity(mut self, severity: ConditionSeverity) -> Self {
        self.severity = Some(severity);
        self
    }

    /// True when this is a False condition with Error severity
    pub fn is_error(&self) -> bool {
        self.status == ConditionStatus::False && self.severity == Some(ConditionSeverity::Error)
    }
}

/// Reference to a ConfigMap or Secret by name
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LocalObjectRef {
    /// Name of the referenced object in the node set's namespace
    pub name: String,
    /// Whether the reference may be absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optional: Option<bool>,
}

/// Source of extra Ansible variables
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AnsibleVarsFromSource {
    /// Prefix prepended to every key read from the source
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    /// ConfigMap to read variables from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_map_ref: Option<LocalObjectRef>,
    /// Secret to read variables from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<LocalObjectRef>,
}

/// Ansible connection settings and variables for a node or the template
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AnsibleOpts {
    /// Remote user
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ansible_user: Option<String>,
    /// Address Ansible connects to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ansible_host: Option<String>,
    /// SSH port
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ansible_port: Option<u16>,
    /// Inline variables
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub ansible_vars: BTreeMap<String, serde_json::Value>,
    /// Variables loaded from ConfigMaps and Secrets
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ansible_vars_from: Vec<AnsibleVarsFromSource>,
}

/// A network a node attaches to
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkRef {
    /// Network name (e.g. "ctlplane", "internalapi")
    pub name: String,
    /// Subnet within the network to allocate from
    pub subnet_name: String,
    /// Fixed address instead of allocating one
    #[serde(default, rename = "fixedIP", skip_serializing_if = "Option::is_none")]
    pub fixed_ip: Option<String>,
    /// Whether this network carries the default route
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_route: Option<bool>,
}
