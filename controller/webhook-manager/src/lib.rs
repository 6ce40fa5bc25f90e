// Copyright (c) Microsoft. All rights reserved.

//! Lifecycle of the admission webhook's TLS credentials.
//!
//! The manager mints an X.509-SVID whose DNS SANs cover every service the
//! ValidatingWebhookConfiguration points at, writes the keypair file the
//! webhook server reads, and keeps the configuration's `caBundle` equal to
//! the trust bundle of the SPIRE server. Three timers drive it: a one
//! second SVID check, a five second bundle refresh and a five second
//! webhook drift check, each with its own exponential backoff capped at one
//! minute. Webhook change events trigger an immediate drift check.

#![deny(rust_2018_idioms)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::default_trait_access,
    clippy::let_unit_value,
    clippy::missing_errors_doc,
    clippy::similar_names,
    clippy::too_many_lines,
    clippy::missing_panics_doc
)]

pub mod api;
pub mod error;
pub mod keys;

use std::{
    cmp::min,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use k8s_openapi::api::admissionregistration::v1::ValidatingWebhookConfiguration;
use k8s_openapi::ByteString;
use log::{debug, info, warn};
use tokio::sync::{mpsc, watch, RwLock};
use tokio::time::{sleep_until, Instant};

use core_objects::{get_epoch_time, SPIFFEID};
use spire_client::SpireClient;

use api::{CaBundlePatch, WebhookConfigApi};
use error::Error;

/// Minted webhook SVIDs live for one day.
pub const SVID_TTL_SECONDS: u64 = 24 * 60 * 60;

const SVID_INTERVAL: Duration = Duration::from_secs(1);
const BUNDLE_INTERVAL: Duration = Duration::from_secs(5);
const WEBHOOK_INTERVAL: Duration = Duration::from_secs(5);
const BACKOFF_MAX: Duration = Duration::from_secs(60);

pub struct WebhookManager {
    spire: Arc<SpireClient>,
    webhook_api: Arc<dyn WebhookConfigApi>,
    controller_spiffe_id: SPIFFEID,
    keypair_path: PathBuf,
    state: RwLock<CredentialState>,
}

#[derive(Default)]
struct CredentialState {
    minted_at: Option<u64>,
    expires_at: u64,
    dns_names: Vec<String>,
    ca_bundle: Vec<u8>,
}

impl WebhookManager {
    #[must_use]
    pub fn new(
        spire: Arc<SpireClient>,
        webhook_api: Arc<dyn WebhookConfigApi>,
        controller_spiffe_id: SPIFFEID,
        keypair_path: PathBuf,
    ) -> Self {
        WebhookManager {
            spire,
            webhook_api,
            controller_spiffe_id,
            keypair_path,
            state: RwLock::new(CredentialState::default()),
        }
    }

    /// First credential: fetch the trust bundle, discover the webhook DNS
    /// names, mint, write the keypair file and patch every webhook.
    pub async fn initialize(&self) -> Result<(), Error> {
        let bundle = self.spire.get_bundle().await.map_err(Error::Bundle)?;
        let ca_bundle = keys::authorities_to_pem(&bundle.x509_authorities)?;
        self.state.write().await.ca_bundle = ca_bundle;

        let configuration = self.webhook_api.get().await.map_err(Error::ReadWebhook)?;
        let dns_names = webhook_dns_names(&configuration);
        self.mint(dns_names).await?;

        self.patch_if_drifted(&configuration).await?;

        Ok(())
    }

    /// SVID timer: re-read the webhook configuration and re-mint if the
    /// credential is missing, expired, expiring soon, or the DNS name set
    /// moved.
    pub async fn check_svid(&self) -> Result<(), Error> {
        self.check_svid_at(get_epoch_time()).await
    }

    async fn check_svid_at(&self, now: u64) -> Result<(), Error> {
        let configuration = self.webhook_api.get().await.map_err(Error::ReadWebhook)?;
        let dns_names = webhook_dns_names(&configuration);

        let remint = {
            let state = self.state.read().await;
            needs_remint(&state, now, &dns_names)
        };

        if remint {
            self.mint(dns_names).await?;
        }

        Ok(())
    }

    /// Bundle timer: refresh the trust bundle; when it changed, push it to
    /// the webhook configuration.
    pub async fn check_bundle(&self) -> Result<(), Error> {
        let bundle = self.spire.get_bundle().await.map_err(Error::Bundle)?;
        let ca_bundle = keys::authorities_to_pem(&bundle.x509_authorities)?;

        let changed = {
            let mut state = self.state.write().await;
            if state.ca_bundle == ca_bundle {
                false
            } else {
                info!("Trust bundle changed, updating webhook");
                state.ca_bundle = ca_bundle;
                true
            }
        };

        if changed {
            let configuration = self.webhook_api.get().await.map_err(Error::ReadWebhook)?;
            self.patch_if_drifted(&configuration).await?;
        }

        Ok(())
    }

    /// Webhook timer and change events: re-patch when someone reset the
    /// configured `caBundle`.
    pub async fn check_webhook(&self) -> Result<(), Error> {
        let configuration = self.webhook_api.get().await.map_err(Error::ReadWebhook)?;
        self.patch_if_drifted(&configuration).await
    }

    async fn mint(&self, dns_names: Vec<String>) -> Result<(), Error> {
        let material = keys::generate_key_and_csr(&self.controller_spiffe_id, &dns_names)?;

        let svid = self
            .spire
            .mint_x509_svid(material.csr_pem, SVID_TTL_SECONDS)
            .await
            .map_err(Error::Mint)?;

        keys::write_keypair_file(&self.keypair_path, &svid.cert_chain_pem, &material.private_key)?;

        info!(
            "Minted webhook SVID {} (expires at {}, {} DNS names)",
            svid.id,
            svid.expires_at,
            dns_names.len()
        );

        let mut state = self.state.write().await;
        state.minted_at = Some(get_epoch_time());
        state.expires_at = svid.expires_at;
        state.dns_names = dns_names;

        Ok(())
    }

    /// Build a patch covering exactly the webhooks whose `caBundle`
    /// differs from ours. No drift, no RPC.
    async fn patch_if_drifted(
        &self,
        configuration: &ValidatingWebhookConfiguration,
    ) -> Result<(), Error> {
        let ca_bundle = self.state.read().await.ca_bundle.clone();
        if ca_bundle.is_empty() {
            return Ok(());
        }

        let expected = ByteString(ca_bundle.clone());
        let drifted: Vec<String> = configuration
            .webhooks
            .iter()
            .flatten()
            .filter(|webhook| webhook.client_config.ca_bundle.as_ref() != Some(&expected))
            .map(|webhook| webhook.name.clone())
            .collect();

        if drifted.is_empty() {
            return Ok(());
        }

        debug!("Patching caBundle on {} webhooks", drifted.len());
        self.webhook_api
            .patch_ca_bundle(&CaBundlePatch {
                webhook_names: drifted,
                ca_bundle,
            })
            .await
            .map_err(Error::PatchWebhook)
    }

    /// Run until shutdown. `events` carries webhook add/update/delete
    /// notifications from the watch.
    pub async fn run(
        &self,
        mut events: mpsc::Receiver<()>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut svid_backoff = Backoff::new(SVID_INTERVAL);
        let mut bundle_backoff = Backoff::new(BUNDLE_INTERVAL);
        let mut webhook_backoff = Backoff::new(WEBHOOK_INTERVAL);

        let mut svid_deadline = Instant::now() + SVID_INTERVAL;
        let mut bundle_deadline = Instant::now() + BUNDLE_INTERVAL;
        let mut webhook_deadline = Instant::now() + WEBHOOK_INTERVAL;
        let mut events_open = true;

        loop {
            tokio::select! {
                () = wait_shutdown(&mut shutdown) => break,

                () = sleep_until(svid_deadline) => {
                    match self.check_svid().await {
                        Ok(()) => svid_backoff.success(),
                        Err(err) => {
                            warn!("Webhook SVID check failed: {}", err);
                            svid_backoff.failure();
                        }
                    }
                    svid_deadline = Instant::now() + svid_backoff.interval();
                }

                () = sleep_until(bundle_deadline) => {
                    match self.check_bundle().await {
                        Ok(()) => bundle_backoff.success(),
                        Err(err) => {
                            warn!("Trust bundle refresh failed: {}", err);
                            bundle_backoff.failure();
                        }
                    }
                    bundle_deadline = Instant::now() + bundle_backoff.interval();
                }

                () = sleep_until(webhook_deadline) => {
                    match self.check_webhook().await {
                        Ok(()) => webhook_backoff.success(),
                        Err(err) => {
                            warn!("Webhook drift check failed: {}", err);
                            webhook_backoff.failure();
                        }
                    }
                    webhook_deadline = Instant::now() + webhook_backoff.interval();
                }

                event = events.recv(), if events_open => {
                    if event.is_none() {
                        // Watch closed; the timers still cover drift.
                        events_open = false;
                        continue;
                    }
                    if let Err(err) = self.check_webhook().await {
                        warn!("Webhook event handling failed: {}", err);
                    }
                }
            }
        }

        info!("Stopped webhook manager");
    }
}

fn needs_remint(state: &CredentialState, now: u64, current_dns_names: &[String]) -> bool {
    let Some(minted_at) = state.minted_at else {
        return true;
    };

    if state.expires_at <= now {
        return true;
    }

    if state.dns_names != current_dns_names {
        return true;
    }

    let lifetime = state.expires_at.saturating_sub(minted_at);
    let expires_in = state.expires_at - now;
    expiring_soon(lifetime, expires_in)
}

const MINUTE: u64 = 60;
const HOUR: u64 = 60 * MINUTE;
const DAY: u64 = 24 * HOUR;

/// The rotation thresholds, scaled to the credential lifetime.
fn expiring_soon(lifetime: u64, expires_in: u64) -> bool {
    if lifetime > 30 * DAY {
        expires_in < 7 * DAY
    } else if lifetime > 7 * DAY {
        expires_in < 3 * DAY + DAY / 2
    } else if lifetime > DAY {
        expires_in < 12 * HOUR
    } else if lifetime > HOUR {
        expires_in < 30 * MINUTE
    } else {
        expires_in < lifetime / 2
    }
}

/// The DNS name set of the webhook configuration: one
/// `{service}.{namespace}.svc` per webhook service reference, sorted and
/// deduplicated.
#[must_use]
pub fn webhook_dns_names(configuration: &ValidatingWebhookConfiguration) -> Vec<String> {
    let mut names: Vec<String> = configuration
        .webhooks
        .iter()
        .flatten()
        .filter_map(|webhook| webhook.client_config.service.as_ref())
        .map(|service| format!("{}.{}.svc", service.name, service.namespace))
        .collect();

    names.sort();
    names.dedup();
    names
}

struct Backoff {
    base: Duration,
    current: Option<Duration>,
}

impl Backoff {
    fn new(base: Duration) -> Self {
        Backoff {
            base,
            current: None,
        }
    }

    fn interval(&self) -> Duration {
        self.current.unwrap_or(self.base)
    }

    fn success(&mut self) {
        self.current = None;
    }

    fn failure(&mut self) {
        let next = self.current.unwrap_or(self.base) * 2;
        self.current = Some(min(next, BACKOFF_MAX));
    }
}

async fn wait_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
