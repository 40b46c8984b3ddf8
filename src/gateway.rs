//! The gateway service: one instance per process, shared by every caller
use crate::cache::{StatusCache, StatusCacheConfig};
use crate::client::{ApiClient, RetryPolicy, SubscriptionOutcome};
use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use crate::oauth::{OAuthSettings, TokenManager};
use crate::storage::{Credential, CredentialStore, FileStore, InstallationIdentity};
use crate::types::{Device, DeviceCommand, DeviceStatus};
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

/// Entry point for hosts: device listing, status, commands, subscriptions
///
/// Cloning is cheap and every clone shares the credential, HTTP client and
/// status cache.
#[derive(Clone)]
pub struct Gateway {
    config: Arc<GatewayConfig>,
    tokens: TokenManager,
    api: ApiClient,
    cache: StatusCache,
}

impl Gateway {
    /// Build a gateway persisting credentials under the configured directory
    pub fn new(config: GatewayConfig) -> Result<Self> {
        config.validate()?;
        let store = FileStore::with_path(config.resolve_persist_dir()?)?;
        Self::with_store(config, Arc::new(store))
    }

    /// Build a gateway over any credential store
    pub fn with_store(config: GatewayConfig, store: Arc<dyn CredentialStore>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| GatewayError::Config(format!("Failed to build HTTP client: {}", e)))?;

        let tokens = TokenManager::new(OAuthSettings::from(&config), store, http.clone());
        let retry = RetryPolicy {
            max_retries: config.max_retries,
            base_delay: config.retry_base_delay(),
            jitter: true,
        };
        let api = ApiClient::new(http, config.api_base.clone(), tokens.clone(), retry);
        let cache = StatusCache::new(
            StatusCacheConfig {
                ttl: config.status_cache_ttl(),
                max_capacity: config.status_cache_capacity,
            },
            Arc::new(api.clone()),
        );

        Ok(Self {
            config: Arc::new(config),
            tokens,
            api,
            cache,
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn tokens(&self) -> &TokenManager {
        &self.tokens
    }

    pub fn cache(&self) -> &StatusCache {
        &self.cache
    }

    /// Load persisted state; true when a credential is available
    pub async fn init(&self) -> bool {
        self.tokens.initialize().await
    }

    /// Complete the OAuth flow with the code from the redirect
    pub async fn get_initial_tokens(&self, code: &str) -> Result<Credential> {
        self.tokens.exchange_authorization_code(code).await
    }

    pub fn authorization_url(&self) -> String {
        self.tokens.authorization_url()
    }

    pub async fn get_devices(&self) -> Result<Vec<Device>> {
        let devices = self.api.get_devices().await?;
        info!(count = devices.len(), "Discovered SmartThings devices");
        Ok(devices)
    }

    /// Status of the device's `main` component, served from the cache when fresh
    pub async fn get_status(&self, device_id: &str) -> Result<DeviceStatus> {
        self.cache.get_status(device_id).await
    }

    pub async fn send_command(&self, device_id: &str, command: DeviceCommand) -> Result<()> {
        self.send_commands(device_id, vec![command]).await
    }

    /// Send commands; the device's cached status is dropped whatever the outcome
    ///
    /// The snapshot is dropped again once the call returns, since a read made
    /// while the command was in flight may have cached the old state.
    pub async fn send_commands(&self, device_id: &str, commands: Vec<DeviceCommand>) -> Result<()> {
        self.cache.invalidate(device_id).await;
        let result = self.api.send_commands(device_id, &commands).await;
        self.cache.invalidate(device_id).await;
        if let Err(e) = &result {
            warn!(device_id, error = %e, "Device command failed");
        }
        result
    }

    pub async fn create_subscription(
        &self,
        device_id: &str,
        capability: &str,
    ) -> Result<SubscriptionOutcome> {
        self.api.create_subscription(device_id, capability).await
    }

    /// Apply a live attribute change to the cached status, if any
    pub async fn update_device_status_cache(
        &self,
        device_id: &str,
        capability: &str,
        attribute: &str,
        value: Value,
    ) -> bool {
        let patched = self
            .cache
            .apply_patch(device_id, capability, attribute, value)
            .await;
        if patched {
            info!(device_id, capability, attribute, "Updated cached device status");
        }
        patched
    }

    /// Remember the app installation from a CONFIRMATION handshake
    pub async fn save_installation(&self, identity: InstallationIdentity) -> Result<()> {
        self.tokens.save_installation(identity).await
    }
}
