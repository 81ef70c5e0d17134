//! Controller runner - wires the node set controller to its watches
//!
//! Owned kinds come back through owner references. ConfigMaps, Secrets,
//! DNSMasqs and deployments reference node sets by name and go through the
//! watch correlator. ConfigMap and Secret lookups use a reverse index kept
//! current by its own node set watch.

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::api::DynamicObject;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::{watcher, Controller, WatchStreamExt};
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;

use dataplane_common::config::ImageDefaults;
use dataplane_common::crd::{OpenStackDataPlaneDeployment, OpenStackDataPlaneNodeSet};
use dataplane_common::kube_utils::{
    ansible_ee_resource, baremetal_set_resource, dns_data_resource, dns_masq_resource,
    ip_set_resource,
};
use dataplane_nodeset::{
    error_policy, reconcile, requests_for, spawn_failed_pod_diagnostics, Context,
    SharedReverseIndex, WatchedObject,
};

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Operator settings handed to the controller
#[derive(Clone, Debug)]
pub struct RunnerConfig {
    /// Field manager for server-side apply and status writes
    pub field_manager: String,
    /// Bound on the SSH key secret lookup and its wait window
    pub credential_timeout: std::time::Duration,
    /// Restrict every watch to one namespace
    pub watch_namespace: Option<String>,
}

fn watcher_config() -> WatcherConfig {
    WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS)
}

fn scoped<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>
        + Clone
        + DeserializeOwned
        + std::fmt::Debug,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

fn scoped_dynamic(
    client: &Client,
    namespace: Option<&str>,
    resource: &kube::discovery::ApiResource,
) -> Api<DynamicObject> {
    match namespace {
        Some(ns) => Api::namespaced_with(client.clone(), ns, resource),
        None => Api::all_with(client.clone(), resource),
    }
}

/// Keep `index` in step with node set events until the process exits
fn spawn_index_watch(api: Api<OpenStackDataPlaneNodeSet>, index: SharedReverseIndex) {
    tokio::spawn(async move {
        let events = watcher(api, watcher_config()).default_backoff();
        tokio::pin!(events);
        while let Some(event) = events.next().await {
            match event {
                Ok(event) => index.observe(&event),
                Err(e) => tracing::warn!(error = %e, "node set index watch error"),
            }
        }
    });
}

/// Run the node set controller until shutdown is signalled
pub async fn run_node_set_controller(client: Client, config: RunnerConfig) {
    let ctx = Arc::new(
        Context::builder(client.clone())
            .field_manager(config.field_manager.clone())
            .credential_timeout(config.credential_timeout)
            .images(ImageDefaults::from_env())
            .build(),
    );
    let namespace = config.watch_namespace.as_deref();
    let index = SharedReverseIndex::default();
    spawn_index_watch(
        scoped::<OpenStackDataPlaneNodeSet>(&client, namespace),
        index.clone(),
    );

    let controller = Controller::new(
        scoped::<OpenStackDataPlaneNodeSet>(&client, namespace),
        watcher_config(),
    );
    let masq_store = controller.store();

    let (ip_set, dns_data, baremetal_set, ansible_ee, dns_masq) = (
        ip_set_resource(),
        dns_data_resource(),
        baremetal_set_resource(),
        ansible_ee_resource(),
        dns_masq_resource(),
    );

    let cm_index = index.clone();
    let secret_index = index.clone();
    let masq_index = index.clone();
    let deployment_index = index;
    let diagnostics_kube = ctx.kube.clone();

    tracing::info!(namespace = ?namespace, "- OpenStackDataPlaneNodeSet controller");

    controller
        .owns_with(
            scoped_dynamic(&client, namespace, &ip_set),
            ip_set.clone(),
            watcher_config(),
        )
        .owns_with(
            scoped_dynamic(&client, namespace, &dns_data),
            dns_data.clone(),
            watcher_config(),
        )
        .owns_with(
            scoped_dynamic(&client, namespace, &baremetal_set),
            baremetal_set.clone(),
            watcher_config(),
        )
        .owns_with(
            scoped_dynamic(&client, namespace, &ansible_ee),
            ansible_ee.clone(),
            watcher_config(),
        )
        .owns(scoped::<Secret>(&client, namespace), watcher_config())
        .watches(
            scoped::<ConfigMap>(&client, namespace),
            watcher_config(),
            move |cm: ConfigMap| {
                let namespace = cm.namespace().unwrap_or_default();
                let name = cm.name_any();
                requests_for(
                    WatchedObject::ConfigMap {
                        namespace: &namespace,
                        name: &name,
                    },
                    &cm_index,
                    &[],
                )
            },
        )
        .watches(
            scoped::<Secret>(&client, namespace),
            watcher_config(),
            move |secret: Secret| {
                let namespace = secret.namespace().unwrap_or_default();
                let name = secret.name_any();
                requests_for(
                    WatchedObject::Secret {
                        namespace: &namespace,
                        name: &name,
                    },
                    &secret_index,
                    &[],
                )
            },
        )
        .watches_with(
            scoped_dynamic(&client, namespace, &dns_masq),
            dns_masq.clone(),
            watcher_config(),
            move |masq: DynamicObject| {
                let namespace = masq.namespace().unwrap_or_default();
                requests_for(
                    WatchedObject::DnsMasq {
                        namespace: &namespace,
                    },
                    &masq_index,
                    &masq_store.state(),
                )
            },
        )
        .watches(
            scoped::<OpenStackDataPlaneDeployment>(&client, namespace),
            watcher_config(),
            move |deployment: OpenStackDataPlaneDeployment| {
                spawn_failed_pod_diagnostics(diagnostics_kube.clone(), &deployment);
                requests_for(
                    WatchedObject::Deployment(&deployment),
                    &deployment_index,
                    &[],
                )
            },
        )
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(log_reconcile_result("NodeSet"))
        .await;
}

fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
