//! Dependency orchestration for a node set
//!
//! Every pass walks the same stages in the same order:
//!
//! 1. services exist and are well formed
//! 2. IP reservations for every node
//! 3. DNS data built from the reservations
//! 4. SSH key secret present with the required keys
//! 5. ServiceAccount and RoleBinding
//! 6. fast path when the current configuration is already deployed
//! 7. bare metal provisioning (skipped for pre-provisioned nodes)
//! 8. inventory generation
//!
//! A stage either hands data to the next one or halts the pass with a
//! [`Halt`]. Before halting it records exactly one condition update, so the
//! status written at the end of the pass always explains why it stopped.

use std::collections::BTreeMap;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use kube::ResourceExt;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use dataplane_common::condition::{
    BAREMETAL_PROVISION_READY, DEPLOYMENT_READY, DNS_DATA_READY, ERROR_REASON, INPUT_READY,
    IP_RESERVATION_READY, NOT_REQUESTED_REASON, REQUESTED_REASON, SERVICE_ACCOUNT_READY,
    SETUP_READY,
};
use dataplane_common::config::ImageDefaults;
use dataplane_common::crd::{
    Condition, ConditionSeverity, ConditionStatus, OpenStackDataPlaneNodeSet,
    OpenStackDataPlaneNodeSetStatus,
};
use dataplane_common::Error;

/// Secret key holding the Ansible SSH private key
pub const SSH_PRIVATE_KEY: &str = "ssh-privatekey";
/// Secret key holding the authorized keys injected into provisioned hosts
pub const SSH_AUTHORIZED_KEYS: &str = "authorized_keys";

// =============================================================================
// Collaborator data
// =============================================================================

/// One address reserved for a node on one network
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Reservation {
    /// Network name
    pub network: String,
    /// Subnet the address came from
    pub subnet: String,
    /// Reserved address
    pub address: String,
    /// DNS domain of the network
    pub dns_domain: Option<String>,
    /// Subnet gateway
    pub gateway: Option<String>,
    /// Subnet CIDR
    pub cidr: Option<String>,
}

/// Reservations keyed by node name
pub type Reservations = BTreeMap<String, Vec<Reservation>>;

/// Result of ensuring IP reservations
#[derive(Clone, Debug, Default, PartialEq)]
pub struct IpSetOutcome {
    /// Reservations that have been allocated so far
    pub reservations: Reservations,
    /// Every node has its reservations
    pub ready: bool,
}

/// Result of ensuring DNS data
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DnsOutcome {
    /// DNS data has been published
    pub ready: bool,
    /// Cluster-facing DNS service addresses
    pub cluster_addresses: Vec<String>,
    /// DNS server addresses handed to provisioned hosts
    pub server_addresses: Vec<String>,
    /// Search domain of the control plane network
    pub ctlplane_search_domain: String,
    /// node → network → host name
    pub hostnames: BTreeMap<String, BTreeMap<String, String>>,
    /// node → network → address
    pub all_ips: BTreeMap<String, BTreeMap<String, String>>,
}

/// Result of checking the SSH key secret
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SecretCheck {
    /// Secret exists with every required key
    Present,
    /// Secret or some required key is missing, with a description of what
    Missing(String),
}

/// Result of creating or patching the identity objects
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Provisioned {
    /// Objects already matched the desired state
    Unchanged,
    /// Objects were created or patched during this call
    Changed,
}

// =============================================================================
// Collaborator traits
// =============================================================================

/// Validates the services listed on a node set
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ServiceEnsurer: Send + Sync {
    /// Fail when a listed service is missing or malformed
    async fn ensure(&self, node_set: &OpenStackDataPlaneNodeSet) -> Result<(), Error>;
}

/// Reserves network addresses for every node
#[cfg_attr(test, automock)]
#[async_trait]
pub trait IpSetEnsurer: Send + Sync {
    /// Create or update one IPSet per node and collect the reservations
    async fn ensure(&self, node_set: &OpenStackDataPlaneNodeSet) -> Result<IpSetOutcome, Error>;
}

/// Publishes DNS records for the reserved addresses
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DnsDataEnsurer: Send + Sync {
    /// Create or update the node set's DNSData and resolve server addresses
    async fn ensure(
        &self,
        node_set: &OpenStackDataPlaneNodeSet,
        reservations: &Reservations,
    ) -> Result<DnsOutcome, Error>;
}

/// Checks a credential secret
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SecretVerifier: Send + Sync {
    /// Look the secret up, giving up after `timeout`
    ///
    /// A missing secret, missing keys or a timed out lookup are
    /// [`SecretCheck::Missing`]; any other failure is an error.
    async fn verify(
        &self,
        namespace: &str,
        name: &str,
        required_keys: &[String],
        timeout: Duration,
    ) -> Result<SecretCheck, Error>;
}

/// Provisions the ServiceAccount and RoleBinding used by execution jobs
#[cfg_attr(test, automock)]
#[async_trait]
pub trait IdentityProvisioner: Send + Sync {
    /// Create or patch both objects
    async fn create_or_patch(
        &self,
        node_set: &OpenStackDataPlaneNodeSet,
    ) -> Result<Provisioned, Error>;
}

/// Provisions bare metal hosts
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BareMetalProvisioner: Send + Sync {
    /// Create or update the bare metal set; returns true once provisioned
    async fn deploy(
        &self,
        node_set: &OpenStackDataPlaneNodeSet,
        reservations: &Reservations,
        server_addresses: &[String],
    ) -> Result<bool, Error>;
}

/// Renders the Ansible inventory consumed by execution jobs
#[cfg_attr(test, automock)]
#[async_trait]
pub trait InventoryGenerator: Send + Sync {
    /// Write the inventory and return the name of the object holding it
    async fn generate(
        &self,
        node_set: &OpenStackDataPlaneNodeSet,
        reservations: &Reservations,
        server_addresses: &[String],
        images: &ImageDefaults,
    ) -> Result<String, Error>;
}

/// Every collaborator the orchestrator drives
#[derive(Clone)]
pub struct Collaborators {
    /// Service validation
    pub services: Arc<dyn ServiceEnsurer>,
    /// IP reservations
    pub ip_sets: Arc<dyn IpSetEnsurer>,
    /// DNS data
    pub dns: Arc<dyn DnsDataEnsurer>,
    /// Credential checks
    pub secrets: Arc<dyn SecretVerifier>,
    /// ServiceAccount and RoleBinding
    pub identity: Arc<dyn IdentityProvisioner>,
    /// Bare metal provisioning
    pub bare_metal: Arc<dyn BareMetalProvisioner>,
    /// Inventory generation
    pub inventory: Arc<dyn InventoryGenerator>,
}

// =============================================================================
// Pipeline
// =============================================================================

/// Why a pass stopped before reaching the end of the pipeline
#[derive(Debug)]
pub enum Halt {
    /// A dependency is not ready yet; try again after the delay
    Wait(Duration),
    /// A stage failed; its condition already carries the error
    Fail(Error),
    /// Configuration already deployed; skipped stages keep their previous conditions
    AlreadyDeployed,
}

/// Delays and bounds used by the pipeline
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Timings {
    /// Requeue delay while IP, DNS or bare metal work is in progress
    pub dependency_requeue: Duration,
    /// Bound on the secret lookup and the window before a missing secret is an error
    pub credential_timeout: Duration,
    /// Requeue delay after the identity objects changed
    pub identity_requeue: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            dependency_requeue: Duration::from_secs(10),
            credential_timeout: Duration::from_secs(5),
            identity_requeue: Duration::from_secs(10),
        }
    }
}

type Stage<T = ()> = ControlFlow<Halt, T>;

/// Runs the dependency stages for one pass
pub struct Orchestrator<'a> {
    collaborators: &'a Collaborators,
    images: &'a ImageDefaults,
    timings: &'a Timings,
}

impl<'a> Orchestrator<'a> {
    /// Create an orchestrator over the given collaborators
    pub fn new(
        collaborators: &'a Collaborators,
        images: &'a ImageDefaults,
        timings: &'a Timings,
    ) -> Self {
        Self {
            collaborators,
            images,
            timings,
        }
    }

    /// Run every stage, writing conditions and resolved data into `status`
    ///
    /// `previous` is the status read at the start of the pass. It decides the
    /// fast path and how long a missing credential has been waited on.
    pub async fn run(
        &self,
        node_set: &OpenStackDataPlaneNodeSet,
        previous: &OpenStackDataPlaneNodeSetStatus,
        status: &mut OpenStackDataPlaneNodeSetStatus,
    ) -> Stage {
        self.ensure_services(node_set, status).await?;
        let reservations = self.ensure_ip_sets(node_set, status).await?;
        let server_addresses = self.ensure_dns(node_set, &reservations, status).await?;
        self.verify_credentials(node_set, previous, status).await?;
        self.provision_identity(node_set, status).await?;

        if fast_path_applies(node_set, previous, status) {
            info!(node_set = %node_set.name_any(), "NodeSet already deployed");
            let skipped: Vec<&str> = [BAREMETAL_PROVISION_READY, SETUP_READY, DEPLOYMENT_READY]
                .into_iter()
                .filter(|t| status.conditions.get(t).is_some())
                .collect();
            status.conditions.carry_forward(&previous.conditions, &skipped);
            return ControlFlow::Break(Halt::AlreadyDeployed);
        }

        self.provision_bare_metal(node_set, &reservations, &server_addresses, status)
            .await?;
        self.generate_inventory(node_set, &reservations, &server_addresses, status)
            .await
    }

    async fn ensure_services(
        &self,
        node_set: &OpenStackDataPlaneNodeSet,
        status: &mut OpenStackDataPlaneNodeSetStatus,
    ) -> Stage {
        if let Err(e) = self.collaborators.services.ensure(node_set).await {
            status.conditions.mark_false(
                SETUP_READY,
                ERROR_REASON,
                ConditionSeverity::Error,
                format!("DataPlaneNodeSet error occurred {e}"),
            );
            return ControlFlow::Break(Halt::Fail(e));
        }
        ControlFlow::Continue(())
    }

    async fn ensure_ip_sets(
        &self,
        node_set: &OpenStackDataPlaneNodeSet,
        status: &mut OpenStackDataPlaneNodeSetStatus,
    ) -> Stage<Reservations> {
        match self.collaborators.ip_sets.ensure(node_set).await {
            Ok(outcome) if outcome.ready => {
                status
                    .conditions
                    .mark_true(IP_RESERVATION_READY, "NodeSetIPReservationReady ready");
                ControlFlow::Continue(outcome.reservations)
            }
            Ok(_) => {
                status.conditions.mark_false(
                    IP_RESERVATION_READY,
                    REQUESTED_REASON,
                    ConditionSeverity::Info,
                    "NodeSetIPReservationReady not yet ready",
                );
                ControlFlow::Break(Halt::Wait(self.timings.dependency_requeue))
            }
            Err(e) => {
                status.conditions.mark_false(
                    IP_RESERVATION_READY,
                    ERROR_REASON,
                    ConditionSeverity::Error,
                    format!("NodeSetIPReservationReady error occurred {e}"),
                );
                ControlFlow::Break(Halt::Fail(e))
            }
        }
    }

    async fn ensure_dns(
        &self,
        node_set: &OpenStackDataPlaneNodeSet,
        reservations: &Reservations,
        status: &mut OpenStackDataPlaneNodeSetStatus,
    ) -> Stage<Vec<String>> {
        match self.collaborators.dns.ensure(node_set, reservations).await {
            Ok(dns) if dns.ready => {
                status
                    .conditions
                    .mark_true(DNS_DATA_READY, "NodeSetDNSDataReady ready");
                status.dns_cluster_addresses = dns.cluster_addresses;
                status.ctlplane_search_domain = dns.ctlplane_search_domain;
                status.all_hostnames = dns.hostnames;
                status.all_ips = dns.all_ips;
                ControlFlow::Continue(dns.server_addresses)
            }
            Ok(_) => {
                status.conditions.mark_false(
                    DNS_DATA_READY,
                    REQUESTED_REASON,
                    ConditionSeverity::Info,
                    "NodeSetDNSDataReady not yet ready",
                );
                ControlFlow::Break(Halt::Wait(self.timings.dependency_requeue))
            }
            Err(e) => {
                status.conditions.mark_false(
                    DNS_DATA_READY,
                    ERROR_REASON,
                    ConditionSeverity::Error,
                    format!("NodeSetDNSDataReady error occurred {e}"),
                );
                ControlFlow::Break(Halt::Fail(e))
            }
        }
    }

    async fn verify_credentials(
        &self,
        node_set: &OpenStackDataPlaneNodeSet,
        previous: &OpenStackDataPlaneNodeSetStatus,
        status: &mut OpenStackDataPlaneNodeSetStatus,
    ) -> Stage {
        let secret_name = &node_set.spec.node_template.ansible_ssh_private_key_secret;
        let namespace = node_set.namespace().unwrap_or_default();
        let mut required = vec![SSH_PRIVATE_KEY.to_string()];
        if !node_set.spec.pre_provisioned {
            required.push(SSH_AUTHORIZED_KEYS.to_string());
        }

        let timeout = self.timings.credential_timeout;
        let checked = self
            .collaborators
            .secrets
            .verify(&namespace, secret_name, &required, timeout)
            .await;

        match checked {
            Ok(SecretCheck::Present) => {
                status
                    .conditions
                    .mark_true(INPUT_READY, "Input data complete");
                ControlFlow::Continue(())
            }
            Ok(SecretCheck::Missing(detail)) => {
                let message = format!("Input data resources missing: secret/{secret_name} {detail}");
                if still_waiting(previous, timeout) {
                    debug!(secret = %secret_name, "waiting for SSH key secret");
                    status.conditions.mark_false(
                        INPUT_READY,
                        REQUESTED_REASON,
                        ConditionSeverity::Info,
                        message,
                    );
                    ControlFlow::Break(Halt::Wait(timeout))
                } else {
                    status.conditions.mark_false(
                        INPUT_READY,
                        ERROR_REASON,
                        ConditionSeverity::Error,
                        message.clone(),
                    );
                    ControlFlow::Break(Halt::Fail(Error::input_invalid(message)))
                }
            }
            Err(e) => {
                status.conditions.mark_false(
                    INPUT_READY,
                    ERROR_REASON,
                    ConditionSeverity::Error,
                    e.to_string(),
                );
                ControlFlow::Break(Halt::Fail(e))
            }
        }
    }

    async fn provision_identity(
        &self,
        node_set: &OpenStackDataPlaneNodeSet,
        status: &mut OpenStackDataPlaneNodeSetStatus,
    ) -> Stage {
        match self.collaborators.identity.create_or_patch(node_set).await {
            Ok(Provisioned::Unchanged) => {
                status
                    .conditions
                    .mark_true(SERVICE_ACCOUNT_READY, "ServiceAccount created");
                ControlFlow::Continue(())
            }
            Ok(Provisioned::Changed) => {
                status.conditions.mark_false(
                    SERVICE_ACCOUNT_READY,
                    REQUESTED_REASON,
                    ConditionSeverity::Info,
                    "ServiceAccount creation in progress",
                );
                ControlFlow::Break(Halt::Wait(self.timings.identity_requeue))
            }
            Err(e) => {
                status.conditions.mark_false(
                    SERVICE_ACCOUNT_READY,
                    ERROR_REASON,
                    ConditionSeverity::Warning,
                    format!("ServiceAccount error occurred {e}"),
                );
                ControlFlow::Break(Halt::Fail(e))
            }
        }
    }

    async fn provision_bare_metal(
        &self,
        node_set: &OpenStackDataPlaneNodeSet,
        reservations: &Reservations,
        server_addresses: &[String],
        status: &mut OpenStackDataPlaneNodeSetStatus,
    ) -> Stage {
        if !node_set.has_bare_metal_hosts() {
            return ControlFlow::Continue(());
        }
        if node_set.spec.pre_provisioned {
            status.conditions.set(Condition::new(
                BAREMETAL_PROVISION_READY,
                ConditionStatus::True,
                NOT_REQUESTED_REASON,
                "Nodes are pre-provisioned",
            ));
            return ControlFlow::Continue(());
        }

        match self
            .collaborators
            .bare_metal
            .deploy(node_set, reservations, server_addresses)
            .await
        {
            Ok(true) => {
                status
                    .conditions
                    .mark_true(BAREMETAL_PROVISION_READY, "NodeSet baremetal provisioning ready");
                ControlFlow::Continue(())
            }
            Ok(false) => {
                status.conditions.mark_false(
                    BAREMETAL_PROVISION_READY,
                    REQUESTED_REASON,
                    ConditionSeverity::Info,
                    "NodeSet baremetal provisioning not yet ready",
                );
                ControlFlow::Break(Halt::Wait(self.timings.dependency_requeue))
            }
            Err(e) => {
                status.conditions.mark_false(
                    BAREMETAL_PROVISION_READY,
                    ERROR_REASON,
                    ConditionSeverity::Error,
                    format!("NodeSet baremetal provisioning error occurred {e}"),
                );
                ControlFlow::Break(Halt::Fail(e))
            }
        }
    }

    async fn generate_inventory(
        &self,
        node_set: &OpenStackDataPlaneNodeSet,
        reservations: &Reservations,
        server_addresses: &[String],
        status: &mut OpenStackDataPlaneNodeSetStatus,
    ) -> Stage {
        match self
            .collaborators
            .inventory
            .generate(node_set, reservations, server_addresses, self.images)
            .await
        {
            Ok(inventory) => {
                debug!(node_set = %node_set.name_any(), inventory = %inventory, "inventory generated");
                status.conditions.mark_true(SETUP_READY, "Setup complete");
                ControlFlow::Continue(())
            }
            Err(e) => {
                status.conditions.mark_false(
                    SETUP_READY,
                    ERROR_REASON,
                    ConditionSeverity::Error,
                    format!(
                        "DataPlaneNodeSet error occurred Unable to generate inventory for {}",
                        node_set.name_any()
                    ),
                );
                ControlFlow::Break(Halt::Fail(e))
            }
        }
    }
}

/// Deployed with the current configuration and not being deleted
fn fast_path_applies(
    node_set: &OpenStackDataPlaneNodeSet,
    previous: &OpenStackDataPlaneNodeSetStatus,
    status: &OpenStackDataPlaneNodeSetStatus,
) -> bool {
    previous.deployed
        && node_set.metadata.deletion_timestamp.is_none()
        && !status.config_hash.is_empty()
        && status.config_hash == previous.deployed_config_hash
}

/// The previous pass has not yet spent the whole credential wait window
fn still_waiting(previous: &OpenStackDataPlaneNodeSetStatus, timeout: Duration) -> bool {
    let Some(since) = previous
        .conditions
        .get(INPUT_READY)
        .filter(|c| c.status == ConditionStatus::False)
        .map(|c| c.last_transition_time)
    else {
        return true;
    };
    // Negative elapsed time (clock skew) counts as still inside the window
    (Utc::now() - since)
        .to_std()
        .map_or(true, |elapsed| elapsed < timeout)
}

#[cfg(test)]
pub(crate) mod fixtures {
    //! Mock collaborators and sample objects shared by the crate's tests

    use super::*;
    use dataplane_common::crd::OpenStackDataPlaneNodeSetSpec;

    pub(crate) fn node_set(name: &str) -> OpenStackDataPlaneNodeSet {
        let spec: OpenStackDataPlaneNodeSetSpec = serde_json::from_value(serde_json::json!({
            "preProvisioned": true,
            "nodeTemplate": {
                "ansibleSSHPrivateKeySecret": "dataplane-ansible-ssh",
                "networks": [{"name": "ctlplane", "subnetName": "subnet1"}]
            },
            "nodes": {"compute-0": {"hostName": "compute-0"}}
        }))
        .unwrap();
        let mut ns = OpenStackDataPlaneNodeSet::new(name, spec);
        ns.metadata.namespace = Some("openstack".into());
        ns.metadata.uid = Some(format!("uid-{name}"));
        ns.metadata.resource_version = Some("100".into());
        ns.metadata.generation = Some(1);
        ns
    }

    pub(crate) fn reservations() -> Reservations {
        BTreeMap::from([(
            "compute-0".to_string(),
            vec![Reservation {
                network: "ctlplane".into(),
                subnet: "subnet1".into(),
                address: "192.168.122.100".into(),
                dns_domain: Some("ctlplane.example.com".into()),
                ..Default::default()
            }],
        )])
    }

    /// Mocks that all report ready; replace a field to vary one stage
    pub(crate) struct Mocks {
        pub services: MockServiceEnsurer,
        pub ip_sets: MockIpSetEnsurer,
        pub dns: MockDnsDataEnsurer,
        pub secrets: MockSecretVerifier,
        pub identity: MockIdentityProvisioner,
        pub bare_metal: MockBareMetalProvisioner,
        pub inventory: MockInventoryGenerator,
    }

    impl Mocks {
        pub(crate) fn ready() -> Self {
            let mut services = MockServiceEnsurer::new();
            services.expect_ensure().returning(|_| Ok(()));

            let mut ip_sets = MockIpSetEnsurer::new();
            ip_sets.expect_ensure().returning(|_| {
                Ok(IpSetOutcome {
                    reservations: reservations(),
                    ready: true,
                })
            });

            let mut dns = MockDnsDataEnsurer::new();
            dns.expect_ensure().returning(|_, _| {
                Ok(DnsOutcome {
                    ready: true,
                    cluster_addresses: vec!["172.30.0.10".into()],
                    server_addresses: vec!["192.168.122.80".into()],
                    ctlplane_search_domain: "ctlplane.example.com".into(),
                    hostnames: BTreeMap::from([(
                        "compute-0".to_string(),
                        BTreeMap::from([(
                            "ctlplane".to_string(),
                            "compute-0.ctlplane.example.com".to_string(),
                        )]),
                    )]),
                    all_ips: BTreeMap::from([(
                        "compute-0".to_string(),
                        BTreeMap::from([("ctlplane".to_string(), "192.168.122.100".to_string())]),
                    )]),
                })
            });

            let mut secrets = MockSecretVerifier::new();
            secrets
                .expect_verify()
                .returning(|_, _, _, _| Ok(SecretCheck::Present));

            let mut identity = MockIdentityProvisioner::new();
            identity
                .expect_create_or_patch()
                .returning(|_| Ok(Provisioned::Unchanged));

            let mut bare_metal = MockBareMetalProvisioner::new();
            bare_metal.expect_deploy().returning(|_, _, _| Ok(true));

            let mut inventory = MockInventoryGenerator::new();
            inventory
                .expect_generate()
                .returning(|ns, _, _, _| Ok(format!("dataplanenodeset-{}", ns.name_any())));

            Self {
                services,
                ip_sets,
                dns,
                secrets,
                identity,
                bare_metal,
                inventory,
            }
        }

        pub(crate) fn into_collaborators(self) -> Collaborators {
            Collaborators {
                services: Arc::new(self.services),
                ip_sets: Arc::new(self.ip_sets),
                dns: Arc::new(self.dns),
                secrets: Arc::new(self.secrets),
                identity: Arc::new(self.identity),
                bare_metal: Arc::new(self.bare_metal),
                inventory: Arc::new(self.inventory),
            }
        }
    }
}
