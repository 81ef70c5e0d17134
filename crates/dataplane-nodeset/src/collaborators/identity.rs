//! ServiceAccount and registry-viewer RoleBinding for execution jobs
//!
//! Both objects are named after the node set. A RoleBinding's `roleRef` is
//! immutable, so a binding pointing elsewhere is deleted and recreated.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::api::rbac::v1::{RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, Patch, PatchParams};
use kube::{Client, ResourceExt};
use tracing::{debug, info};

use dataplane_common::crd::OpenStackDataPlaneNodeSet;
use dataplane_common::kube_utils::owner_reference;
use dataplane_common::Error;

use super::node_set_labels;
use crate::orchestrator::{IdentityProvisioner, Provisioned};

const REGISTRY_VIEWER_ROLE: &str = "registry-viewer";
const RBAC_GROUP: &str = "rbac.authorization.k8s.io";

fn metadata(node_set: &OpenStackDataPlaneNodeSet) -> Result<ObjectMeta, Error> {
    Ok(ObjectMeta {
        name: Some(node_set.name_any()),
        namespace: node_set.namespace(),
        labels: Some(node_set_labels(node_set)),
        owner_references: Some(vec![owner_reference(node_set)?]),
        ..Default::default()
    })
}

/// ServiceAccount the execution jobs of `node_set` run as
pub fn desired_service_account(node_set: &OpenStackDataPlaneNodeSet) -> Result<ServiceAccount, Error> {
    Ok(ServiceAccount {
        metadata: metadata(node_set)?,
        ..Default::default()
    })
}

/// Binding of the ServiceAccount to the registry-viewer ClusterRole
pub fn desired_role_binding(node_set: &OpenStackDataPlaneNodeSet) -> Result<RoleBinding, Error> {
    Ok(RoleBinding {
        metadata: metadata(node_set)?,
        role_ref: RoleRef {
            api_group: RBAC_GROUP.to_string(),
            kind: "ClusterRole".to_string(),
            name: REGISTRY_VIEWER_ROLE.to_string(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: node_set.name_any(),
            namespace: node_set.namespace(),
            ..Default::default()
        }]),
    })
}

/// True when `live` already carries the labels and owner of `desired`
fn metadata_matches(live: &ObjectMeta, desired: &ObjectMeta) -> bool {
    let labels_ok = desired.labels.iter().flatten().all(|(k, v)| {
        live.labels
            .as_ref()
            .and_then(|l| l.get(k))
            .is_some_and(|lv| lv == v)
    });
    let owners_ok = desired.owner_references.iter().flatten().all(|want| {
        live.owner_references
            .iter()
            .flatten()
            .any(|have| have.uid == want.uid && have.controller == want.controller)
    });
    labels_ok && owners_ok
}

fn subjects_match(live: &RoleBinding, desired: &RoleBinding) -> bool {
    live.subjects.as_deref().unwrap_or_default() == desired.subjects.as_deref().unwrap_or_default()
}

/// Creates or patches the identity objects with server-side apply
pub struct KubeIdentityProvisioner {
    client: Client,
    field_manager: String,
}

impl KubeIdentityProvisioner {
    /// Create a new identity provisioner
    pub fn new(client: Client, field_manager: &str) -> Self {
        Self {
            client,
            field_manager: field_manager.to_string(),
        }
    }

    fn apply_params(&self) -> PatchParams {
        PatchParams::apply(&self.field_manager).force()
    }

    async fn ensure_service_account(
        &self,
        namespace: &str,
        desired: &ServiceAccount,
    ) -> Result<bool, Error> {
        let api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), namespace);
        let name = desired.name_any();
        if let Some(live) = api.get_opt(&name).await? {
            if metadata_matches(&live.metadata, &desired.metadata) {
                return Ok(false);
            }
        }
        api.patch(&name, &self.apply_params(), &Patch::Apply(desired))
            .await?;
        Ok(true)
    }

    async fn ensure_role_binding(
        &self,
        namespace: &str,
        desired: &RoleBinding,
    ) -> Result<bool, Error> {
        let api: Api<RoleBinding> = Api::namespaced(self.client.clone(), namespace);
        let name = desired.name_any();
        if let Some(live) = api.get_opt(&name).await? {
            if live.role_ref != desired.role_ref {
                info!(role_binding = %name, "RoleBinding points at another role, recreating");
                api.delete(&name, &DeleteParams::default()).await?;
            } else if metadata_matches(&live.metadata, &desired.metadata)
                && subjects_match(&live, desired)
            {
                return Ok(false);
            }
        }
        api.patch(&name, &self.apply_params(), &Patch::Apply(desired))
            .await?;
        Ok(true)
    }
}

#[async_trait]
impl IdentityProvisioner for KubeIdentityProvisioner {
    async fn create_or_patch(
        &self,
        node_set: &OpenStackDataPlaneNodeSet,
    ) -> Result<Provisioned, Error> {
        let namespace = node_set.namespace().ok_or(Error::MissingNamespace)?;

        let sa_changed = self
            .ensure_service_account(&namespace, &desired_service_account(node_set)?)
            .await?;
        let rb_changed = self
            .ensure_role_binding(&namespace, &desired_role_binding(node_set)?)
            .await?;

        if sa_changed || rb_changed {
            debug!(node_set = %node_set.name_any(), sa_changed, rb_changed, "identity objects written");
            Ok(Provisioned::Changed)
        } else {
            Ok(Provisioned::Unchanged)
        }
    }
}
