//! Maps changes on related objects back to the node sets that depend on them
//!
//! Node sets reference ConfigMaps and Secrets by name only, so there is no
//! owner reference to follow. A reverse index fed by node set watch events
//! answers which node sets reference a given object; it changes only when a
//! node set does, not on every ConfigMap or Secret event.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};

use k8s_openapi::api::core::v1::Pod;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Event;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use dataplane_common::crd::{
    AnsibleOpts, OpenStackDataPlaneDeployment, OpenStackDataPlaneNodeSet,
};
use dataplane_common::Error;

use crate::controller::KubeClient;

/// An object whose change may affect node sets
#[derive(Clone, Copy, Debug)]
pub enum WatchedObject<'a> {
    /// ConfigMap referenced through `ansibleVarsFrom`
    ConfigMap {
        /// Namespace of the ConfigMap
        namespace: &'a str,
        /// Name of the ConfigMap
        name: &'a str,
    },
    /// Secret referenced through `ansibleVarsFrom` or as an SSH key
    Secret {
        /// Namespace of the Secret
        namespace: &'a str,
        /// Name of the Secret
        name: &'a str,
    },
    /// DNS server instance; affects every node set in its namespace
    DnsMasq {
        /// Namespace of the DNSMasq
        namespace: &'a str,
    },
    /// Deployment listing node sets by name
    Deployment(&'a OpenStackDataPlaneDeployment),
}

type Key = (String, String);

/// Objects a single node set references
#[derive(Debug, Default)]
struct References {
    config_maps: BTreeSet<String>,
    secrets: BTreeSet<String>,
}

impl References {
    fn of(node_set: &OpenStackDataPlaneNodeSet) -> Self {
        let mut refs = Self::default();
        let ansible = std::iter::once(&node_set.spec.node_template.ansible)
            .chain(node_set.spec.nodes.values().map(|n| &n.ansible));
        for opts in ansible {
            refs.add_vars_from(opts);
        }
        refs.secrets
            .extend(node_set.ssh_key_secret_names().into_iter().map(String::from));
        refs
    }

    fn add_vars_from(&mut self, opts: &AnsibleOpts) {
        for source in &opts.ansible_vars_from {
            if let Some(cm) = &source.config_map_ref {
                self.config_maps.insert(cm.name.clone());
            }
            if let Some(secret) = &source.secret_ref {
                self.secrets.insert(secret.name.clone());
            }
        }
    }
}

/// `(namespace, object name)` → names of the node sets referencing it
#[derive(Debug, Default)]
pub struct ReverseIndex {
    by_node_set: BTreeMap<Key, References>,
    config_maps: BTreeMap<Key, BTreeSet<String>>,
    secrets: BTreeMap<Key, BTreeSet<String>>,
}

impl ReverseIndex {
    /// Index the ConfigMaps and Secrets referenced by `node_sets`
    pub fn build<'a>(node_sets: impl IntoIterator<Item = &'a OpenStackDataPlaneNodeSet>) -> Self {
        let mut index = Self::default();
        for node_set in node_sets {
            index.apply(node_set);
        }
        index
    }

    /// Replace the references recorded for `node_set` with its current ones
    pub fn apply(&mut self, node_set: &OpenStackDataPlaneNodeSet) {
        let Some(namespace) = node_set.namespace() else {
            return;
        };
        let name = node_set.name_any();
        self.forget(&namespace, &name);

        let refs = References::of(node_set);
        for cm in &refs.config_maps {
            add(&mut self.config_maps, &namespace, cm, &name);
        }
        for secret in &refs.secrets {
            add(&mut self.secrets, &namespace, secret, &name);
        }
        self.by_node_set.insert((namespace, name), refs);
    }

    /// Drop every reference held by `node_set`
    pub fn remove(&mut self, node_set: &OpenStackDataPlaneNodeSet) {
        if let Some(namespace) = node_set.namespace() {
            self.forget(&namespace, &node_set.name_any());
        }
    }

    fn forget(&mut self, namespace: &str, name: &str) {
        let Some(old) = self
            .by_node_set
            .remove(&(namespace.to_string(), name.to_string()))
        else {
            return;
        };
        for cm in &old.config_maps {
            drop_ref(&mut self.config_maps, namespace, cm, name);
        }
        for secret in &old.secrets {
            drop_ref(&mut self.secrets, namespace, secret, name);
        }
    }

    /// Node sets referencing the ConfigMap
    pub fn config_map(&self, namespace: &str, name: &str) -> impl Iterator<Item = &str> {
        lookup(&self.config_maps, namespace, name)
    }

    /// Node sets referencing the Secret
    pub fn secret(&self, namespace: &str, name: &str) -> impl Iterator<Item = &str> {
        lookup(&self.secrets, namespace, name)
    }
}

fn add(map: &mut BTreeMap<Key, BTreeSet<String>>, namespace: &str, object: &str, node_set: &str) {
    map.entry((namespace.to_string(), object.to_string()))
        .or_default()
        .insert(node_set.to_string());
}

fn drop_ref(map: &mut BTreeMap<Key, BTreeSet<String>>, namespace: &str, object: &str, node_set: &str) {
    let key = (namespace.to_string(), object.to_string());
    if let Some(node_sets) = map.get_mut(&key) {
        node_sets.remove(node_set);
        if node_sets.is_empty() {
            map.remove(&key);
        }
    }
}

fn lookup<'a>(
    map: &'a BTreeMap<Key, BTreeSet<String>>,
    namespace: &str,
    name: &str,
) -> impl Iterator<Item = &'a str> {
    map.get(&(namespace.to_string(), name.to_string()))
        .into_iter()
        .flatten()
        .map(String::as_str)
}

#[derive(Debug, Default)]
struct IndexState {
    live: ReverseIndex,
    relisting: Option<ReverseIndex>,
}

/// Reverse index shared between the node set watch and the event mappers
///
/// A relist builds a separate index that replaces the live one once the
/// listing is complete, so lookups never see a partly listed cache.
#[derive(Clone, Debug, Default)]
pub struct SharedReverseIndex(Arc<RwLock<IndexState>>);

impl SharedReverseIndex {
    /// Fold one node set watch event into the index
    pub fn observe(&self, event: &Event<OpenStackDataPlaneNodeSet>) {
        let Ok(mut state) = self.0.write() else {
            warn!("reverse index lock poisoned, dropping node set event");
            return;
        };
        match event {
            Event::Apply(node_set) => state.live.apply(node_set),
            Event::Delete(node_set) => state.live.remove(node_set),
            Event::Init => state.relisting = Some(ReverseIndex::default()),
            Event::InitApply(node_set) => {
                if let Some(index) = state.relisting.as_mut() {
                    index.apply(node_set);
                }
            }
            Event::InitDone => {
                if let Some(index) = state.relisting.take() {
                    debug!(node_sets = index.by_node_set.len(), "reverse index relisted");
                    state.live = index;
                }
            }
        }
    }

    fn with<T>(&self, read: impl FnOnce(&ReverseIndex) -> T) -> Option<T> {
        self.0.read().ok().map(|state| read(&state.live))
    }

    /// Names of node sets referencing the ConfigMap
    pub fn config_map(&self, namespace: &str, name: &str) -> Vec<String> {
        self.with(|i| i.config_map(namespace, name).map(String::from).collect())
            .unwrap_or_default()
    }

    /// Names of node sets referencing the Secret
    pub fn secret(&self, namespace: &str, name: &str) -> Vec<String> {
        self.with(|i| i.secret(namespace, name).map(String::from).collect())
            .unwrap_or_default()
    }
}

/// Node sets to reconcile after `object` changed
///
/// `node_sets` is the current content of the controller's cache.
pub fn requests_for(
    object: WatchedObject<'_>,
    index: &SharedReverseIndex,
    node_sets: &[Arc<OpenStackDataPlaneNodeSet>],
) -> Vec<ObjectRef<OpenStackDataPlaneNodeSet>> {
    let request = |namespace: &str, name: &str| {
        ObjectRef::<OpenStackDataPlaneNodeSet>::new(name).within(namespace)
    };

    let requests: Vec<_> = match object {
        WatchedObject::ConfigMap { namespace, name } => index
            .config_map(namespace, name)
            .iter()
            .map(|n| request(namespace, n))
            .collect(),
        WatchedObject::Secret { namespace, name } => index
            .secret(namespace, name)
            .iter()
            .map(|n| request(namespace, n))
            .collect(),
        WatchedObject::DnsMasq { namespace } => node_sets
            .iter()
            .filter(|ns| ns.namespace().as_deref() == Some(namespace))
            .map(|ns| request(namespace, &ns.name_any()))
            .collect(),
        WatchedObject::Deployment(deployment) => {
            let Some(namespace) = deployment.namespace() else {
                return Vec::new();
            };
            deployment
                .spec
                .node_sets
                .iter()
                .map(|n| request(&namespace, n))
                .collect()
        }
    };

    if !requests.is_empty() {
        debug!(?object, count = requests.len(), "mapped watch event to node sets");
    }
    requests
}

/// Log why a deployment's failed execution pods failed, off the watch path
///
/// Runs on every deployment event, whatever the deployment's own Ready state.
pub fn spawn_failed_pod_diagnostics(
    kube: Arc<dyn KubeClient>,
    deployment: &OpenStackDataPlaneDeployment,
) {
    let Some(namespace) = deployment.namespace() else {
        return;
    };
    let name = deployment.name_any();
    tokio::spawn(async move {
        if let Err(e) = log_failed_pods(kube.as_ref(), &namespace, &name).await {
            warn!(deployment = %name, error = %e, "Unable to list failed execution pods");
        }
    });
}

/// Log one line per failed execution pod of `deployment`; returns how many
pub async fn log_failed_pods(
    kube: &dyn KubeClient,
    namespace: &str,
    deployment: &str,
) -> Result<usize, Error> {
    let pods = kube.list_failed_pods(namespace, deployment).await?;
    for pod in &pods {
        let (reason, message) = failure_of(pod);
        info!(
            deployment = %deployment,
            "openstackansibleee job {} failed due to {} with message: {}",
            pod.name_any(),
            reason,
            message
        );
    }
    Ok(pods.len())
}

/// Pod-level failure, falling back to the first terminated container
fn failure_of(pod: &Pod) -> (String, String) {
    let Some(status) = pod.status.as_ref() else {
        return (String::new(), String::new());
    };
    if status.reason.is_some() || status.message.is_some() {
        return (
            status.reason.clone().unwrap_or_default(),
            status.message.clone().unwrap_or_default(),
        );
    }
    status
        .container_statuses
        .iter()
        .flatten()
        .find_map(|c| c.state.as_ref()?.terminated.as_ref())
        .map(|t| {
            (
                t.reason.clone().unwrap_or_default(),
                t.message.clone().unwrap_or_default(),
            )
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::MockKubeClient;
    use crate::orchestrator::fixtures::node_set;
    use dataplane_common::crd::{
        AnsibleVarsFromSource, LocalObjectRef, OpenStackDataPlaneDeploymentSpec,
    };
    use k8s_openapi::api::core::v1::PodStatus;
    use std::time::Duration;

    fn vars_from_config_map(name: &str) -> AnsibleVarsFromSource {
        AnsibleVarsFromSource {
            config_map_ref: Some(LocalObjectRef {
                name: name.into(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn relisted(cache: &[Arc<OpenStackDataPlaneNodeSet>]) -> SharedReverseIndex {
        let index = SharedReverseIndex::default();
        index.observe(&Event::Init);
        for node_set in cache {
            index.observe(&Event::InitApply(node_set.as_ref().clone()));
        }
        index.observe(&Event::InitDone);
        index
    }

    fn names(refs: &[ObjectRef<OpenStackDataPlaneNodeSet>]) -> Vec<String> {
        let mut names: Vec<_> = refs.iter().map(|r| r.name.clone()).collect();
        names.sort();
        names
    }

    fn deployment(targets: &[&str]) -> OpenStackDataPlaneDeployment {
        let mut d = OpenStackDataPlaneDeployment::new(
            "deploy-1",
            OpenStackDataPlaneDeploymentSpec {
                node_sets: targets.iter().map(|s| s.to_string()).collect(),
                ..Default::default()
            },
        );
        d.metadata.namespace = Some("openstack".into());
        d
    }

    /// Story: a ConfigMap referenced by the template of one node set and by a
    /// single node of another wakes both, and nothing else.
    #[test]
    fn story_config_map_change_reaches_every_referencing_node_set() {
        let mut edge_a = node_set("edge-a");
        edge_a
            .spec
            .node_template
            .ansible
            .ansible_vars_from
            .push(vars_from_config_map("net-config"));

        let mut edge_b = node_set("edge-b");
        edge_b
            .spec
            .nodes
            .get_mut("compute-0")
            .unwrap()
            .ansible
            .ansible_vars_from
            .push(vars_from_config_map("net-config"));

        let edge_c = node_set("edge-c");
        let cache: Vec<_> = [edge_a, edge_b, edge_c].into_iter().map(Arc::new).collect();

        let refs = requests_for(
            WatchedObject::ConfigMap {
                namespace: "openstack",
                name: "net-config",
            },
            &relisted(&cache),
            &cache,
        );
        assert_eq!(names(&refs), ["edge-a", "edge-b"]);
        assert!(refs.iter().all(|r| r.namespace.as_deref() == Some("openstack")));

        let other_namespace = requests_for(
            WatchedObject::ConfigMap {
                namespace: "other",
                name: "net-config",
            },
            &relisted(&cache),
            &cache,
        );
        assert!(other_namespace.is_empty());
    }

    #[test]
    fn ssh_key_secret_maps_to_its_node_sets() {
        let mut edge_b = node_set("edge-b");
        edge_b
            .spec
            .nodes
            .get_mut("compute-0")
            .unwrap()
            .ansible_ssh_private_key_secret = Some("node-key".into());
        let cache = vec![Arc::new(node_set("edge-a")), Arc::new(edge_b)];

        let shared = requests_for(
            WatchedObject::Secret {
                namespace: "openstack",
                name: "dataplane-ansible-ssh",
            },
            &relisted(&cache),
            &cache,
        );
        assert_eq!(names(&shared), ["edge-a", "edge-b"]);

        let node_key = requests_for(
            WatchedObject::Secret {
                namespace: "openstack",
                name: "node-key",
            },
            &relisted(&cache),
            &cache,
        );
        assert_eq!(names(&node_key), ["edge-b"]);
    }

    #[test]
    fn vars_from_secret_is_indexed() {
        let mut edge_a = node_set("edge-a");
        edge_a
            .spec
            .node_template
            .ansible
            .ansible_vars_from
            .push(AnsibleVarsFromSource {
                secret_ref: Some(LocalObjectRef {
                    name: "nova-cell".into(),
                    ..Default::default()
                }),
                ..Default::default()
            });

        let index = ReverseIndex::build([&edge_a]);
        assert_eq!(index.secret("openstack", "nova-cell").collect::<Vec<_>>(), ["edge-a"]);
        assert_eq!(index.config_map("openstack", "nova-cell").count(), 0);
    }

    #[test]
    fn dns_masq_wakes_every_node_set_in_namespace() {
        let mut elsewhere = node_set("edge-c");
        elsewhere.metadata.namespace = Some("other".into());
        let cache = vec![
            Arc::new(node_set("edge-a")),
            Arc::new(node_set("edge-b")),
            Arc::new(elsewhere),
        ];

        let refs = requests_for(
            WatchedObject::DnsMasq { namespace: "openstack" },
            &SharedReverseIndex::default(),
            &cache,
        );

        assert_eq!(names(&refs), ["edge-a", "edge-b"]);
    }

    #[test]
    fn deployment_wakes_its_targets_even_when_uncached() {
        let d = deployment(&["edge-a", "edge-z"]);

        let refs = requests_for(
            WatchedObject::Deployment(&d),
            &SharedReverseIndex::default(),
            &[],
        );

        assert_eq!(names(&refs), ["edge-a", "edge-z"]);
        assert!(refs.iter().all(|r| r.namespace.as_deref() == Some("openstack")));
    }

    #[tokio::test]
    async fn failed_pods_are_logged_and_counted() {
        let mut kube = MockKubeClient::new();
        kube.expect_list_failed_pods()
            .withf(|ns, d| ns == "openstack" && d == "deploy-1")
            .returning(|_, _| {
                let mut pod = Pod::default();
                pod.metadata.name = Some("nova-edge-a-xyz".into());
                pod.status = Some(PodStatus {
                    reason: Some("BackoffLimitExceeded".into()),
                    message: Some("Job has reached the specified backoff limit".into()),
                    ..Default::default()
                });
                Ok(vec![pod, Pod::default()])
            });

        let count = log_failed_pods(&kube, "openstack", "deploy-1").await.unwrap();

        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn diagnostics_scan_deployments_that_have_not_failed() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut kube = MockKubeClient::new();
        kube.expect_list_failed_pods()
            .withf(|ns, d| ns == "openstack" && d == "deploy-1")
            .returning(move |_, _| {
                let _ = tx.send(());
                Ok(vec![])
            });
        let d = deployment(&["edge-a"]);
        assert!(!d.is_failed());

        spawn_failed_pod_diagnostics(Arc::new(kube), &d);

        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
    }

    fn with_config_map(name: &str, config_map: &str) -> OpenStackDataPlaneNodeSet {
        let mut ns = node_set(name);
        ns.spec
            .node_template
            .ansible
            .ansible_vars_from
            .push(vars_from_config_map(config_map));
        ns
    }

    /// Story: the index follows node set edits and deletions as they are
    /// watched, without rescanning the cache on each ConfigMap event.
    #[test]
    fn story_index_follows_node_set_events() {
        let index = SharedReverseIndex::default();

        index.observe(&Event::Apply(with_config_map("edge-a", "net-config")));
        assert_eq!(index.config_map("openstack", "net-config"), ["edge-a"]);

        // Reference moved to another ConfigMap
        index.observe(&Event::Apply(with_config_map("edge-a", "net-config-v2")));
        assert!(index.config_map("openstack", "net-config").is_empty());
        assert_eq!(index.config_map("openstack", "net-config-v2"), ["edge-a"]);

        index.observe(&Event::Apply(with_config_map("edge-b", "net-config-v2")));
        index.observe(&Event::Delete(with_config_map("edge-a", "net-config-v2")));
        assert_eq!(index.config_map("openstack", "net-config-v2"), ["edge-b"]);
        assert_eq!(index.secret("openstack", "dataplane-ansible-ssh"), ["edge-b"]);
    }

    #[test]
    fn relist_replaces_index_once_complete() {
        let index = SharedReverseIndex::default();
        index.observe(&Event::Apply(with_config_map("gone", "net-config")));

        index.observe(&Event::Init);
        index.observe(&Event::InitApply(with_config_map("edge-a", "net-config")));
        // Lookups keep answering from the previous listing until it is done
        assert_eq!(index.config_map("openstack", "net-config"), ["gone"]);

        index.observe(&Event::InitDone);
        assert_eq!(index.config_map("openstack", "net-config"), ["edge-a"]);
    }
}
