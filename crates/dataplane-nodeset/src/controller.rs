//! OpenStackDataPlaneNodeSet controller implementation
//!
//! A pass re-reads the node set, rebuilds its conditions from scratch, runs
//! the dependency pipeline, folds sibling deployments into the status and
//! then writes the status exactly once. The write carries the resource
//! version read at the start of the pass, so a concurrent writer makes the
//! whole pass retry instead of being merged with.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use dataplane_common::condition::{
    DEPLOYMENT_READY, ERROR_REASON, NOT_REQUESTED_REASON, REQUESTED_REASON, SETUP_READY,
};
use dataplane_common::config::ImageDefaults;
use dataplane_common::crd::{
    ConditionSeverity, OpenStackDataPlaneDeployment, OpenStackDataPlaneNodeSet,
    OpenStackDataPlaneNodeSetStatus, NODE_SET_READY_MESSAGE,
};
use dataplane_common::hash::config_hash;
use dataplane_common::kube_utils::merge_patch;
use dataplane_common::{Error, DEFAULT_FIELD_MANAGER, DEPLOYMENT_LABEL_KEY};

use crate::collaborators::kube_collaborators;
use crate::deployment_status::fold_deployments;
use crate::orchestrator::{Collaborators, Halt, Orchestrator, Timings};

/// Requeue delay after a failed pass
const ERROR_REQUEUE: Duration = Duration::from_secs(30);

/// Requeue delay after losing a status write race
const CONFLICT_REQUEUE: Duration = Duration::from_secs(1);

const DEPLOYMENT_FAILED_MESSAGE: &str = "check deploymentStatuses for more details";

/// Trait abstracting Kubernetes client operations for the node set controller
///
/// This trait allows mocking the Kubernetes client in tests while using
/// the real client in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Get a node set, `None` when it no longer exists
    async fn get_node_set(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<OpenStackDataPlaneNodeSet>, Error>;

    /// Write the node set status
    ///
    /// The patch only carries what changed between `previous` and `status`.
    /// When `resource_version` is set the write fails with 409 Conflict if
    /// the object moved on since it was read.
    async fn patch_node_set_status(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<String>,
        previous: &OpenStackDataPlaneNodeSetStatus,
        status: &OpenStackDataPlaneNodeSetStatus,
    ) -> Result<(), Error>;

    /// List every deployment in a namespace
    async fn list_deployments(
        &self,
        namespace: &str,
    ) -> Result<Vec<OpenStackDataPlaneDeployment>, Error>;

    /// List failed execution pods labelled with a deployment's name
    async fn list_failed_pods(&self, namespace: &str, deployment: &str) -> Result<Vec<Pod>, Error>;
}

/// Real Kubernetes client implementation
pub struct KubeClientImpl {
    client: Client,
    field_manager: String,
}

impl KubeClientImpl {
    /// Create a new KubeClientImpl wrapping the given kube Client
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self {
            client,
            field_manager: field_manager.into(),
        }
    }
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn get_node_set(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<OpenStackDataPlaneNodeSet>, Error> {
        let api: Api<OpenStackDataPlaneNodeSet> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn patch_node_set_status(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<String>,
        previous: &OpenStackDataPlaneNodeSetStatus,
        status: &OpenStackDataPlaneNodeSetStatus,
    ) -> Result<(), Error> {
        let api: Api<OpenStackDataPlaneNodeSet> = Api::namespaced(self.client.clone(), namespace);

        let mut patch = serde_json::json!({
            "status": merge_patch(&serde_json::to_value(previous)?, &serde_json::to_value(status)?)
        });
        if let Some(rv) = resource_version {
            patch["metadata"] = serde_json::json!({ "resourceVersion": rv });
        }

        let params = PatchParams {
            field_manager: Some(self.field_manager.clone()),
            ..Default::default()
        };
        api.patch_status(name, &params, &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn list_deployments(
        &self,
        namespace: &str,
    ) -> Result<Vec<OpenStackDataPlaneDeployment>, Error> {
        let api: Api<OpenStackDataPlaneDeployment> =
            Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn list_failed_pods(&self, namespace: &str, deployment: &str) -> Result<Vec<Pod>, Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = ListParams::default()
            .labels(&format!("{DEPLOYMENT_LABEL_KEY}={deployment}"))
            .fields("status.phase=Failed");
        Ok(api.list(&params).await?.items)
    }
}

/// Shared context for the node set controller
///
/// Use [`ContextBuilder`] to construct instances:
///
/// ```text
/// let ctx = Context::builder(client)
///     .images(ImageDefaults::from_env())
///     .build();
/// ```
pub struct Context {
    /// Kubernetes client for API operations (trait object for testability)
    pub kube: Arc<dyn KubeClient>,
    /// Collaborators driven by the dependency pipeline
    pub collaborators: Collaborators,
    /// Container images written into generated inventories
    pub images: ImageDefaults,
    /// Requeue delays and the credential wait window
    pub timings: Timings,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client) -> ContextBuilder {
        ContextBuilder::new(client)
    }

    /// Create a context for testing with mock clients
    #[cfg(test)]
    pub fn for_testing(kube: Arc<dyn KubeClient>, collaborators: Collaborators) -> Self {
        Self {
            kube,
            collaborators,
            images: ImageDefaults::default(),
            timings: Timings::default(),
        }
    }
}

/// Builder for constructing [`Context`] instances
pub struct ContextBuilder {
    client: Client,
    field_manager: String,
    images: ImageDefaults,
    timings: Timings,
    kube: Option<Arc<dyn KubeClient>>,
    collaborators: Option<Collaborators>,
}

impl ContextBuilder {
    fn new(client: Client) -> Self {
        Self {
            client,
            field_manager: DEFAULT_FIELD_MANAGER.to_string(),
            images: ImageDefaults::default(),
            timings: Timings::default(),
            kube: None,
            collaborators: None,
        }
    }

    /// Field manager for server-side apply and status writes
    pub fn field_manager(mut self, field_manager: impl Into<String>) -> Self {
        self.field_manager = field_manager.into();
        self
    }

    /// Images written into generated inventories
    pub fn images(mut self, images: ImageDefaults) -> Self {
        self.images = images;
        self
    }

    /// Bound on the SSH key secret lookup and its wait window
    pub fn credential_timeout(mut self, timeout: Duration) -> Self {
        self.timings.credential_timeout = timeout;
        self
    }

    /// Override the Kubernetes client (primarily for testing)
    pub fn kube_client(mut self, kube: Arc<dyn KubeClient>) -> Self {
        self.kube = Some(kube);
        self
    }

    /// Override the pipeline collaborators (primarily for testing)
    pub fn collaborators(mut self, collaborators: Collaborators) -> Self {
        self.collaborators = Some(collaborators);
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        let kube = self.kube.unwrap_or_else(|| {
            Arc::new(KubeClientImpl::new(
                self.client.clone(),
                self.field_manager.clone(),
            ))
        });
        let collaborators = self
            .collaborators
            .unwrap_or_else(|| kube_collaborators(self.client.clone(), &self.field_manager));
        Context {
            kube,
            collaborators,
            images: self.images,
            timings: self.timings,
        }
    }
}

/// Reconcile a node set
///
/// Returns the next requeue action. Waiting on a dependency is not an
/// error; a failed stage is returned as one after its condition was written.
#[instrument(skip(node_set, ctx), fields(node_set = %node_set.name_any()))]
pub async fn reconcile(
    node_set: Arc<OpenStackDataPlaneNodeSet>,
    ctx: Arc<Context>,
) -> Result<Action, Error> {
    let name = node_set.name_any();
    let namespace = node_set.namespace().ok_or(Error::MissingNamespace)?;
    info!("Reconciling NodeSet");

    let Some(current) = ctx.kube.get_node_set(&namespace, &name).await? else {
        debug!("NodeSet no longer exists");
        return Ok(Action::await_change());
    };

    let previous = current.status.clone().unwrap_or_default();
    let mut status = previous.clone();
    status.conditions = current.init_conditions();
    status.observed_generation = current.metadata.generation;
    status.conditions.mark_false(
        SETUP_READY,
        REQUESTED_REASON,
        ConditionSeverity::Info,
        "Setup started",
    );

    let outcome = match config_hash(&current.spec) {
        Ok(hash) => {
            status.config_hash = hash;
            run_pass(&current, &previous, &mut status, &ctx).await
        }
        Err(e) => {
            status.conditions.mark_false(
                SETUP_READY,
                ERROR_REASON,
                ConditionSeverity::Error,
                format!("DataPlaneNodeSet error occurred {e}"),
            );
            ControlFlow::Break(Halt::Fail(e))
        }
    };

    status
        .conditions
        .finalize(&previous.conditions, NODE_SET_READY_MESSAGE);

    if status != previous {
        let written = ctx
            .kube
            .patch_node_set_status(
                &namespace,
                &name,
                current.resource_version(),
                &previous,
                &status,
            )
            .await;
        match written {
            Ok(()) => debug!("NodeSet status updated"),
            Err(e) if e.is_conflict() => {
                info!("NodeSet changed during reconcile, retrying");
                return Ok(Action::requeue(CONFLICT_REQUEUE));
            }
            Err(e) if e.is_not_found() => {
                debug!("NodeSet deleted during reconcile");
                return Ok(Action::await_change());
            }
            Err(e) => {
                error!(error = %e, "Error updating instance status conditions");
                return Err(e);
            }
        }
    }

    match outcome {
        ControlFlow::Continue(()) | ControlFlow::Break(Halt::AlreadyDeployed) => {
            Ok(Action::await_change())
        }
        ControlFlow::Break(Halt::Wait(delay)) => Ok(Action::requeue(delay)),
        ControlFlow::Break(Halt::Fail(e)) => Err(e),
    }
}

async fn run_pass(
    node_set: &OpenStackDataPlaneNodeSet,
    previous: &OpenStackDataPlaneNodeSetStatus,
    status: &mut OpenStackDataPlaneNodeSetStatus,
    ctx: &Context,
) -> ControlFlow<Halt> {
    Orchestrator::new(&ctx.collaborators, &ctx.images, &ctx.timings)
        .run(node_set, previous, status)
        .await?;
    record_deployments(node_set, status, ctx).await
}

/// Fold sibling deployments into the status and set `DeploymentReady`
async fn record_deployments(
    node_set: &OpenStackDataPlaneNodeSet,
    status: &mut OpenStackDataPlaneNodeSetStatus,
    ctx: &Context,
) -> ControlFlow<Halt> {
    let name = node_set.name_any();
    let namespace = node_set.namespace().unwrap_or_default();

    let deployments = match ctx.kube.list_deployments(&namespace).await {
        Ok(d) => d,
        Err(e) => {
            error!(error = %e, "Unable to get deployed OpenStackDataPlaneDeployments.");
            status.conditions.mark_false(
                DEPLOYMENT_READY,
                ERROR_REASON,
                ConditionSeverity::Error,
                format!("Deployment error occurred {e}"),
            );
            return ControlFlow::Break(Halt::Fail(e));
        }
    };

    let summary = fold_deployments(&name, deployments, status);
    status.deployed = summary.ready && status.deployed_config_hash == status.config_hash;

    if summary.failed {
        status.conditions.mark_false(
            DEPLOYMENT_READY,
            ERROR_REASON,
            ConditionSeverity::Error,
            format!("Deployment error occurred {DEPLOYMENT_FAILED_MESSAGE}"),
        );
        return ControlFlow::Break(Halt::Fail(Error::deployment_failed(
            DEPLOYMENT_FAILED_MESSAGE,
        )));
    }

    if summary.ready {
        debug!("Set NodeSet DeploymentReadyCondition true");
        status
            .conditions
            .mark_true(DEPLOYMENT_READY, "Deployment completed");
    } else if summary.exists {
        status.conditions.mark_false(
            DEPLOYMENT_READY,
            REQUESTED_REASON,
            ConditionSeverity::Info,
            "Deployment in progress",
        );
    } else {
        status.conditions.mark_false(
            DEPLOYMENT_READY,
            NOT_REQUESTED_REASON,
            ConditionSeverity::Info,
            "Deployment not started",
        );
    }
    ControlFlow::Continue(())
}

/// Error policy for the node set controller
///
/// Logs the error and requeues for retry after 30 seconds.
pub fn error_policy(
    node_set: Arc<OpenStackDataPlaneNodeSet>,
    error: &Error,
    _ctx: Arc<Context>,
) -> Action {
    if error.is_retryable() {
        warn!(node_set = %node_set.name_any(), error = %error, "NodeSet reconcile error, will retry");
    } else {
        error!(node_set = %node_set.name_any(), error = %error, "NodeSet reconcile error needs a spec change");
    }
    Action::requeue(ERROR_REQUEUE)
}
