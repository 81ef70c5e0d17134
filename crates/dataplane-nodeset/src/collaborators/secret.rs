//! Bounded lookup of credential secrets

use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::api::Api;
use kube::Client;
use tracing::debug;

use dataplane_common::Error;

use crate::orchestrator::{SecretCheck, SecretVerifier};

/// Reads Secrets with a deadline
pub struct KubeSecretVerifier {
    client: Client,
}

impl KubeSecretVerifier {
    /// Create a new secret verifier
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SecretVerifier for KubeSecretVerifier {
    async fn verify(
        &self,
        namespace: &str,
        name: &str,
        required_keys: &[String],
        timeout: Duration,
    ) -> Result<SecretCheck, Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = match tokio::time::timeout(timeout, api.get_opt(name)).await {
            Ok(found) => found?,
            Err(_) => {
                debug!(secret = %name, ?timeout, "secret lookup timed out");
                return Ok(SecretCheck::Missing("lookup timed out".to_string()));
            }
        };
        let Some(secret) = secret else {
            return Ok(SecretCheck::Missing("not found".to_string()));
        };

        let missing = missing_keys(&secret, required_keys);
        if missing.is_empty() {
            Ok(SecretCheck::Present)
        } else {
            Ok(SecretCheck::Missing(format!(
                "missing keys: {}",
                missing.join(", ")
            )))
        }
    }
}

/// Required keys absent from both `data` and `stringData`
pub fn missing_keys<'a>(secret: &Secret, required: &'a [String]) -> Vec<&'a str> {
    required
        .iter()
        .filter(|key| {
            let in_data = secret.data.as_ref().is_some_and(|d| d.contains_key(*key));
            let in_string_data = secret
                .string_data
                .as_ref()
                .is_some_and(|d| d.contains_key(*key));
            !in_data && !in_string_data
        })
        .map(String::as_str)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::ByteString;
    use std::collections::BTreeMap;

    #[test]
    fn keys_may_come_from_either_map() {
        let secret = Secret {
            data: Some(BTreeMap::from([(
                "ssh-privatekey".to_string(),
                ByteString(b"key".to_vec()),
            )])),
            string_data: Some(BTreeMap::from([(
                "authorized_keys".to_string(),
                "ssh-ed25519 AAAA".to_string(),
            )])),
            ..Default::default()
        };
        let required = ["ssh-privatekey".to_string(), "authorized_keys".to_string()];
        assert!(missing_keys(&secret, &required).is_empty());
    }

    #[test]
    fn absent_keys_are_reported() {
        let secret = Secret::default();
        let required = ["ssh-privatekey".to_string()];
        assert_eq!(missing_keys(&secret, &required), ["ssh-privatekey"]);
    }
}
