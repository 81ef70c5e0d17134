//! OpenStackDataPlaneNodeSet CRD types
//!
//! A node set declares a group of compute nodes that share a node template.
//! Per-node entries override template fields. The status records everything
//! the controller learned while bringing the nodes up (reservations, DNS,
//! deployment outcomes) plus the drift hashes.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::EnvVar;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{AnsibleOpts, NetworkRef};
use crate::condition::{
    ConditionSet, BAREMETAL_PROVISION_READY, DEPLOYMENT_READY, DNS_DATA_READY, INPUT_READY,
    IP_RESERVATION_READY, READY, SERVICE_ACCOUNT_READY, SETUP_READY,
};

/// Default maximum size of a generated secret (just under 1 MiB)
pub const DEFAULT_SECRET_MAX_SIZE: i64 = 1_048_576;

/// Services run against a node set when none are listed
pub const DEFAULT_SERVICES: &[&str] = &[
    "download-cache",
    "bootstrap",
    "configure-network",
    "validate-network",
    "install-os",
    "configure-os",
    "ssh-known-hosts",
    "run-os",
    "reboot-os",
    "install-certs",
    "ovn",
    "neutron-metadata",
    "libvirt",
    "nova",
    "telemetry",
];

// =============================================================================
// Bare metal template
// =============================================================================

/// One bare metal host to provision
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BaremetalHost {
    /// Control plane address to assign
    #[serde(default, rename = "ctlPlaneIP", skip_serializing_if = "Option::is_none")]
    pub ctl_plane_ip: Option<String>,
    /// Labels used to pick a BareMetalHost
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub bmh_label_selector: BTreeMap<String, String>,
}

/// Template for the OpenStackBaremetalSet created for non pre-provisioned nodes
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BaremetalSetTemplate {
    /// Hosts keyed by node name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub baremetal_hosts: BTreeMap<String, BaremetalHost>,
    /// OS image to deploy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_image: Option<String>,
    /// Interface attached to the control plane network
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ctlplane_interface: Option<String>,
    /// Control plane gateway
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ctlplane_gateway: Option<String>,
    /// Namespace holding the BareMetalHosts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bmh_namespace: Option<String>,
    /// User created on the provisioned hosts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_user_name: Option<String>,
    /// Secret holding the SSH key injected into provisioned hosts
    #[serde(default, rename = "deploymentSSHSecret", skip_serializing_if = "Option::is_none")]
    pub deployment_ssh_secret: Option<String>,
    /// Provision server serving the OS image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provision_server_name: Option<String>,
}

// =============================================================================
// Node template and per-node overrides
// =============================================================================

/// Defaults applied to every node in the set
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeTemplate {
    /// Secret holding the SSH private key Ansible connects with
    #[serde(rename = "ansibleSSHPrivateKeySecret")]
    pub ansible_ssh_private_key_secret: String,
    /// Network used to reach the nodes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub management_network: Option<String>,
    /// Networks every node attaches to
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub networks: Vec<NetworkRef>,
    /// Ansible connection settings and variables
    #[serde(default)]
    pub ansible: AnsibleOpts,
    /// Extra volumes mounted into execution pods
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_mounts: Vec<serde_json::Value>,
}

/// Per-node values overriding the template
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeSection {
    /// Host name (defaults to the node key)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_name: Option<String>,
    /// Networks for this node, replacing the template's list
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub networks: Vec<NetworkRef>,
    /// Network used to reach this node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub management_network: Option<String>,
    /// Ansible settings for this node
    #[serde(default)]
    pub ansible: AnsibleOpts,
    /// SSH key secret for this node
    #[serde(
        default,
        rename = "ansibleSSHPrivateKeySecret",
        skip_serializing_if = "Option::is_none"
    )]
    pub ansible_ssh_private_key_secret: Option<String>,
    /// Network data secret used while provisioning this node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preprovisioning_network_data_name: Option<String>,
}

impl NodeSection {
    /// Host name, defaulting to the node's key in `nodes`
    pub fn host_name_or<'a>(&'a self, key: &'a str) -> &'a str {
        self.host_name
            .as_deref()
            .filter(|h| !h.is_empty())
            .unwrap_or(key)
    }

    /// Networks for this node, falling back to the template
    pub fn effective_networks<'a>(&'a self, template: &'a NodeTemplate) -> &'a [NetworkRef] {
        if self.networks.is_empty() {
            &template.networks
        } else {
            &self.networks
        }
    }
}

// =============================================================================
// CRD
// =============================================================================

/// Desired state of a group of data plane nodes
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "dataplane.openstack.org",
    version = "v1beta1",
    kind = "OpenStackDataPlaneNodeSet",
    plural = "openstackdataplanenodesets",
    shortname = "osdpns",
    shortname = "osdpnodeset",
    namespaced,
    status = "OpenStackDataPlaneNodeSetStatus",
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.conditions[0].status"}"#,
    printcolumn = r#"{"name":"Message","type":"string","jsonPath":".status.conditions[0].message"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct OpenStackDataPlaneNodeSetSpec {
    /// Template for the bare metal set (ignored when pre-provisioned)
    #[serde(default)]
    pub baremetal_set_template: BaremetalSetTemplate,

    /// Defaults for every node
    pub node_template: NodeTemplate,

    /// Nodes keyed by name
    pub nodes: BTreeMap<String, NodeSection>,

    /// Maximum size in bytes of a generated secret
    #[serde(default = "default_secret_max_size")]
    pub secret_max_size: i64,

    /// Nodes already have an operating system installed
    #[serde(default)]
    pub pre_provisioned: bool,

    /// Environment passed to execution pods
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,

    /// NetworkAttachmentDefinitions attached to execution pods
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub network_attachments: Vec<String>,

    /// Services deployed to the nodes, in order
    #[serde(default = "default_services")]
    pub services: Vec<String>,

    /// Whether TLS is enabled for the node set
    #[serde(default = "default_true")]
    pub tls_enabled: bool,

    /// Free-form tags
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

fn default_secret_max_size() -> i64 {
    DEFAULT_SECRET_MAX_SIZE
}

fn default_services() -> Vec<String> {
    DEFAULT_SERVICES.iter().map(|s| s.to_string()).collect()
}

fn default_true() -> bool {
    true
}

/// Observed state of a node set
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OpenStackDataPlaneNodeSetStatus {
    /// Conditions, `Ready` first
    #[serde(default)]
    pub conditions: ConditionSet,

    /// Generation the conditions describe
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Latest deployment completed with the current configuration
    #[serde(default)]
    pub deployed: bool,

    /// Per-deployment condition snapshots keyed by deployment name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub deployment_statuses: BTreeMap<String, ConditionSet>,

    /// DNS server addresses for the cluster
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dns_cluster_addresses: Vec<String>,

    /// Search domain of the control plane network
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ctlplane_search_domain: String,

    /// Host names: node name → network name → host name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub all_hostnames: BTreeMap<String, BTreeMap<String, String>>,

    /// Addresses: node name → network name → IP
    #[serde(default, rename = "allIPs", skip_serializing_if = "BTreeMap::is_empty")]
    pub all_ips: BTreeMap<String, BTreeMap<String, String>>,

    /// ConfigMap content hashes reported by completed deployments
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config_map_hashes: BTreeMap<String, String>,

    /// Secret content hashes reported by completed deployments
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub secret_hashes: BTreeMap<String, String>,

    /// Hash of the current node template and nodes
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub config_hash: String,

    /// Hash confirmed by the most recent completed deployment
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub deployed_config_hash: String,
}

/// Message on `Ready` when every sub-condition is True
pub const NODE_SET_READY_MESSAGE: &str = "NodeSet Ready";

/// Fields handed to downstream execution jobs
#[derive(Clone, Debug, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSpec {
    /// NetworkAttachmentDefinitions for the runner pod
    pub network_attachments: Vec<String>,
    /// Extra mounts for the runner pod
    pub extra_mounts: Vec<serde_json::Value>,
    /// Environment for the runner pod
    pub env: Vec<EnvVar>,
    /// ServiceAccount the runner pod uses
    pub service_account_name: String,
}

impl OpenStackDataPlaneNodeSet {
    /// True when the Ready condition is True
    pub fn is_ready(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| s.conditions.is_true(READY))
    }

    /// True when the bare metal template declares at least one host
    pub fn has_bare_metal_hosts(&self) -> bool {
        !self.spec.baremetal_set_template.baremetal_hosts.is_empty()
    }

    /// Fresh condition set for a reconcile pass, every condition Unknown
    pub fn init_conditions(&self) -> ConditionSet {
        let mut types = vec![
            DEPLOYMENT_READY,
            INPUT_READY,
            SETUP_READY,
            IP_RESERVATION_READY,
            DNS_DATA_READY,
            SERVICE_ACCOUNT_READY,
        ];
        if self.has_bare_metal_hosts() {
            types.push(BAREMETAL_PROVISION_READY);
        }
        ConditionSet::init(types)
    }

    /// Fields passed through to the execution jobs
    pub fn execution_spec(&self) -> ExecutionSpec {
        ExecutionSpec {
            network_attachments: self.spec.network_attachments.clone(),
            extra_mounts: self.spec.node_template.extra_mounts.clone(),
            env: self.spec.env.clone(),
            service_account_name: self.metadata.name.clone().unwrap_or_default(),
        }
    }

    /// SSH key secrets named by the template and by node overrides
    pub fn ssh_key_secret_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::with_capacity(self.spec.nodes.len() + 1);
        if !self.spec.node_template.ansible_ssh_private_key_secret.is_empty() {
            names.push(&self.spec.node_template.ansible_ssh_private_key_secret);
        }
        names.extend(
            self.spec
                .nodes
                .values()
                .filter_map(|n| n.ansible_ssh_private_key_secret.as_deref())
                .filter(|s| !s.is_empty()),
        );
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> serde_json::Value {
        serde_json::json!({
            "apiVersion": "dataplane.openstack.org/v1beta1",
            "kind": "OpenStackDataPlaneNodeSet",
            "metadata": { "name": "edge-a", "namespace": "openstack" },
            "spec": {
                "nodeTemplate": { "ansibleSSHPrivateKeySecret": "dataplane-ansible-ssh" },
                "nodes": { "compute-0": { "hostName": "compute-0" } }
            }
        })
    }

    #[test]
    fn defaults_fill_in_when_fields_are_omitted() {
        let ns: OpenStackDataPlaneNodeSet = serde_json::from_value(minimal()).unwrap();
        assert_eq!(ns.spec.secret_max_size, DEFAULT_SECRET_MAX_SIZE);
        assert!(ns.spec.tls_enabled);
        assert!(!ns.spec.pre_provisioned);
        assert_eq!(ns.spec.services.len(), DEFAULT_SERVICES.len());
        assert_eq!(ns.spec.services[0], "download-cache");
    }

    #[test]
    fn conditions_include_baremetal_only_with_hosts() {
        let mut ns: OpenStackDataPlaneNodeSet = serde_json::from_value(minimal()).unwrap();
        assert!(ns.init_conditions().get(BAREMETAL_PROVISION_READY).is_none());
        assert_eq!(ns.init_conditions().len(), 7);

        ns.spec
            .baremetal_set_template
            .baremetal_hosts
            .insert("compute-0".into(), BaremetalHost::default());
        assert!(ns.init_conditions().is_unknown(BAREMETAL_PROVISION_READY));
    }

    #[test]
    fn execution_spec_uses_node_set_name_as_service_account() {
        let ns: OpenStackDataPlaneNodeSet = serde_json::from_value(minimal()).unwrap();
        assert_eq!(ns.execution_spec().service_account_name, "edge-a");
    }

    #[test]
    fn ssh_key_secrets_include_node_overrides() {
        let mut ns: OpenStackDataPlaneNodeSet = serde_json::from_value(minimal()).unwrap();
        ns.spec.nodes.insert(
            "compute-1".into(),
            NodeSection {
                ansible_ssh_private_key_secret: Some("compute-1-key".into()),
                ..Default::default()
            },
        );
        assert_eq!(
            ns.ssh_key_secret_names(),
            vec!["dataplane-ansible-ssh", "compute-1-key"]
        );
    }

    #[test]
    fn node_networks_fall_back_to_template() {
        let template = NodeTemplate {
            networks: vec![NetworkRef {
                name: "ctlplane".into(),
                subnet_name: "subnet1".into(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let node = NodeSection::default();
        assert_eq!(node.effective_networks(&template).len(), 1);
    }

    #[test]
    fn status_uses_wire_names() {
        let status = OpenStackDataPlaneNodeSetStatus {
            all_ips: BTreeMap::from([(
                "compute-0".to_string(),
                BTreeMap::from([("ctlplane".to_string(), "192.168.122.100".to_string())]),
            )]),
            config_hash: "abc".into(),
            ..Default::default()
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["allIPs"]["compute-0"]["ctlplane"], "192.168.122.100");
        assert_eq!(json["configHash"], "abc");
        assert!(json.get("deployedConfigHash").is_none());
    }

    #[test]
    fn crd_schema_covers_env_and_condition_times() {
        use kube::CustomResourceExt;

        let crd = serde_json::to_value(OpenStackDataPlaneNodeSet::crd()).unwrap();
        let schema = crd
            .pointer("/spec/versions/0/schema/openAPIV3Schema/properties")
            .unwrap();

        assert_eq!(schema.pointer("/spec/properties/env/type").unwrap(), "array");
        assert_eq!(
            schema
                .pointer("/status/properties/conditions/items/properties/lastTransitionTime/format")
                .unwrap(),
            "date-time"
        );
    }
}
