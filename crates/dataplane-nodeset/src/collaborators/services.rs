//! Validation of the services listed on a node set

use std::collections::BTreeSet;

use async_trait::async_trait;
use kube::api::{Api, DynamicObject};
use kube::{Client, ResourceExt};
use serde_json::Value;
use tracing::debug;

use dataplane_common::crd::OpenStackDataPlaneNodeSet;
use dataplane_common::kube_utils::dataplane_service_resource;
use dataplane_common::Error;

use crate::orchestrator::ServiceEnsurer;

const STAGE: &str = "services";

/// Reads each listed OpenStackDataPlaneService
pub struct KubeServiceEnsurer {
    client: Client,
}

impl KubeServiceEnsurer {
    /// Create a new service ensurer
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ServiceEnsurer for KubeServiceEnsurer {
    async fn ensure(&self, node_set: &OpenStackDataPlaneNodeSet) -> Result<(), Error> {
        let name = node_set.name_any();
        let namespace = node_set.namespace().ok_or(Error::MissingNamespace)?;
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), &namespace, &dataplane_service_resource());

        let mut seen = BTreeSet::new();
        for service in &node_set.spec.services {
            if !seen.insert(service.as_str()) {
                return Err(Error::validation_for(
                    &name,
                    format!("service {service} is listed more than once"),
                ));
            }
            let found = api.get_opt(service).await?.ok_or_else(|| {
                Error::dependency(&name, STAGE, format!("service {service} not found"))
            })?;
            validate_service(&name, service, &found.data)?;
            debug!(node_set = %name, service = %service, "service validated");
        }
        Ok(())
    }
}

/// A service must name something to run: a playbook, inline playbook contents or a role
pub fn validate_service(node_set: &str, service: &str, data: &Value) -> Result<(), Error> {
    let runnable = ["playbook", "playbookContents", "role"].iter().any(|field| {
        data.pointer(&format!("/spec/{field}"))
            .and_then(Value::as_str)
            .is_some_and(|v| !v.is_empty())
    });
    if runnable {
        Ok(())
    } else {
        Err(Error::validation_for(
            node_set,
            format!("service {service} defines neither playbook, playbookContents nor role"),
        ))
    }
}
