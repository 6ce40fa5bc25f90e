// Copyright (c) Microsoft. All rights reserved.

//! Access to the ValidatingWebhookConfiguration. The manager reads the
//! configuration directly (never through a cache) and patches only the
//! webhooks whose `caBundle` drifted.

use k8s_openapi::api::admissionregistration::v1::ValidatingWebhookConfiguration;
use kube::{
    api::{Patch, PatchParams},
    Api, Client,
};

type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync + 'static>>;

/// One strategic-merge patch: the named webhooks get the given caBundle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CaBundlePatch {
    pub webhook_names: Vec<String>,
    pub ca_bundle: Vec<u8>,
}

impl CaBundlePatch {
    #[must_use]
    pub fn to_strategic_merge(&self) -> serde_json::Value {
        let encoded = base64::encode(&self.ca_bundle);
        let webhooks: Vec<serde_json::Value> = self
            .webhook_names
            .iter()
            .map(|name| {
                serde_json::json!({
                    "name": name,
                    "clientConfig": { "caBundle": encoded },
                })
            })
            .collect();

        serde_json::json!({ "webhooks": webhooks })
    }
}

#[async_trait::async_trait]
pub trait WebhookConfigApi: Sync + Send {
    async fn get(&self) -> Result<ValidatingWebhookConfiguration>;

    async fn patch_ca_bundle(&self, patch: &CaBundlePatch) -> Result<()>;
}

pub struct KubeWebhookConfigApi {
    client: Client,
    name: String,
}

impl KubeWebhookConfigApi {
    #[must_use]
    pub fn new(client: Client, name: &str) -> Self {
        KubeWebhookConfigApi {
            client,
            name: name.to_string(),
        }
    }
}

#[async_trait::async_trait]
impl WebhookConfigApi for KubeWebhookConfigApi {
    async fn get(&self) -> Result<ValidatingWebhookConfiguration> {
        let api: Api<ValidatingWebhookConfiguration> = Api::all(self.client.clone());
        Ok(api.get(&self.name).await?)
    }

    async fn patch_ca_bundle(&self, patch: &CaBundlePatch) -> Result<()> {
        let api: Api<ValidatingWebhookConfiguration> = Api::all(self.client.clone());
        api.patch(
            &self.name,
            &PatchParams::default(),
            &Patch::Strategic(patch.to_strategic_merge()),
        )
        .await?;
        Ok(())
    }
}

/// In-memory stand-in used by the manager tests: holds one configuration
/// and applies patches to it.
#[cfg(any(test, feature = "tests"))]
pub mod fake {
    use std::sync::Mutex;

    use k8s_openapi::ByteString;

    use super::{CaBundlePatch, Result, ValidatingWebhookConfiguration, WebhookConfigApi};

    #[derive(Default)]
    pub struct FakeWebhookConfigApi {
        configuration: Mutex<ValidatingWebhookConfiguration>,
        patches: Mutex<Vec<CaBundlePatch>>,
        fail_reads: Mutex<bool>,
    }

    impl FakeWebhookConfigApi {
        #[must_use]
        pub fn new(configuration: ValidatingWebhookConfiguration) -> Self {
            FakeWebhookConfigApi {
                configuration: Mutex::new(configuration),
                patches: Mutex::new(Vec::new()),
                fail_reads: Mutex::new(false),
            }
        }

        pub fn replace_configuration(&self, configuration: ValidatingWebhookConfiguration) {
            *self.configuration.lock().unwrap() = configuration;
        }

        pub fn fail_reads(&self, fail: bool) {
            *self.fail_reads.lock().unwrap() = fail;
        }

        #[must_use]
        pub fn patches(&self) -> Vec<CaBundlePatch> {
            self.patches.lock().unwrap().clone()
        }

        #[must_use]
        pub fn configuration(&self) -> ValidatingWebhookConfiguration {
            self.configuration.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl WebhookConfigApi for FakeWebhookConfigApi {
        async fn get(&self) -> Result<ValidatingWebhookConfiguration> {
            if *self.fail_reads.lock().unwrap() {
                return Err("injected webhook read failure".into());
            }
            Ok(self.configuration.lock().unwrap().clone())
        }

        async fn patch_ca_bundle(&self, patch: &CaBundlePatch) -> Result<()> {
            let mut configuration = self.configuration.lock().unwrap();
            if let Some(webhooks) = configuration.webhooks.as_mut() {
                for webhook in webhooks {
                    if patch.webhook_names.contains(&webhook.name) {
                        webhook.client_config.ca_bundle =
                            Some(ByteString(patch.ca_bundle.clone()));
                    }
                }
            }
            self.patches.lock().unwrap().push(patch.clone());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategic_merge_patch_shape() {
        let patch = CaBundlePatch {
            webhook_names: vec!["a.example".to_string(), "b.example".to_string()],
            ca_bundle: b"pem bytes".to_vec(),
        };

        let value = patch.to_strategic_merge();
        let webhooks = value["webhooks"].as_array().unwrap();
        assert_eq!(webhooks.len(), 2);
        assert_eq!(webhooks[0]["name"], "a.example");
        assert_eq!(
            webhooks[0]["clientConfig"]["caBundle"],
            base64::encode(b"pem bytes")
        );
    }
}
