//! OAuth 2.0 credential lifecycle
use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use crate::storage::{now_millis, Credential, CredentialStore, InstallationIdentity};
use base64::{engine::general_purpose::STANDARD, Engine};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Subtracted from the provider TTL so refreshes happen before hard expiry
pub const EXPIRY_SAFETY_MARGIN_MS: u64 = 60_000;

/// TTL assumed when the token response omits `expires_in`
pub const DEFAULT_EXPIRES_IN_SECS: u64 = 3600;

/// OAuth 2.0 client settings
#[derive(Debug, Clone)]
pub struct OAuthSettings {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    pub token_endpoint: String,
    pub authorization_endpoint: String,
    pub scope: String,
}

impl From<&GatewayConfig> for OAuthSettings {
    fn from(config: &GatewayConfig) -> Self {
        Self {
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            redirect_uri: config.redirect_uri.clone(),
            token_endpoint: config.token_endpoint.clone(),
            authorization_endpoint: config.authorization_endpoint.clone(),
            scope: config.scope.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    scope: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

impl TokenResponse {
    fn into_credential(self, issued_at_ms: u64, previous_refresh: Option<String>) -> Credential {
        let ttl_ms = self.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS) * 1000;
        Credential {
            access_token: self.access_token,
            refresh_token: self.refresh_token.or(previous_refresh),
            token_type: self.token_type,
            scope: self.scope,
            expires_in: self.expires_in,
            expires_at: Some((issued_at_ms + ttl_ms).saturating_sub(EXPIRY_SAFETY_MARGIN_MS)),
        }
    }
}

/// Failure handed to every caller waiting on the same refresh
#[derive(Debug, Clone)]
struct RefreshFailure {
    status: Option<u16>,
    message: String,
}

impl From<RefreshFailure> for GatewayError {
    fn from(failure: RefreshFailure) -> Self {
        GatewayError::Refresh {
            status: failure.status,
            message: failure.message,
        }
    }
}

type PendingRefresh = Shared<BoxFuture<'static, std::result::Result<Credential, RefreshFailure>>>;

#[derive(Default)]
struct RefreshSlot {
    generation: u64,
    pending: Option<PendingRefresh>,
}

struct Inner {
    settings: OAuthSettings,
    http: reqwest::Client,
    store: Arc<dyn CredentialStore>,
    credential: RwLock<Option<Credential>>,
    installation: RwLock<Option<InstallationIdentity>>,
    refresh: Mutex<RefreshSlot>,
}

/// Owner of the single upstream credential
///
/// Cloning is cheap; all clones share the same credential and refresh state.
/// At most one refresh exchange runs at a time: concurrent callers attach to
/// the outstanding one and observe its outcome.
#[derive(Clone)]
pub struct TokenManager {
    inner: Arc<Inner>,
}

impl TokenManager {
    pub fn new(
        settings: OAuthSettings,
        store: Arc<dyn CredentialStore>,
        http: reqwest::Client,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                settings,
                http,
                store,
                credential: RwLock::new(None),
                installation: RwLock::new(None),
                refresh: Mutex::new(RefreshSlot::default()),
            }),
        }
    }

    /// Load the persisted credential and installation identity
    ///
    /// Returns whether a credential is now held. Missing or unreadable state is
    /// the expected first-run condition and only logged.
    pub async fn initialize(&self) -> bool {
        match self.inner.store.load_credential().await {
            Ok(Some(credential)) => {
                *self.inner.credential.write() = Some(credential);
                info!("Loaded stored OAuth credential");
            }
            Ok(None) => warn!("No stored OAuth credential; user authorization is required"),
            Err(e) => warn!(error = %e, "Stored OAuth credential is unusable; user authorization is required"),
        }

        match self.inner.store.load_installation().await {
            Ok(Some(identity)) => {
                info!(installed_app_id = %identity.installed_app_id, "Loaded app installation identity");
                *self.inner.installation.write() = Some(identity);
            }
            Ok(None) => debug!("No app installation identity stored yet"),
            Err(e) => warn!(error = %e, "Stored app installation identity is unusable"),
        }

        self.has_credential()
    }

    pub fn has_credential(&self) -> bool {
        self.inner.credential.read().is_some()
    }

    /// Current credential, without any refresh
    pub fn credential(&self) -> Option<Credential> {
        self.inner.credential.read().clone()
    }

    pub fn installation(&self) -> Option<InstallationIdentity> {
        self.inner.installation.read().clone()
    }

    /// Record the installation identity from a CONFIRMATION handshake and persist it
    pub async fn save_installation(&self, identity: InstallationIdentity) -> Result<()> {
        *self.inner.installation.write() = Some(identity.clone());
        self.inner.store.save_installation(&identity).await?;
        info!(installed_app_id = %identity.installed_app_id, "Saved app installation identity");
        Ok(())
    }

    /// URL the user opens to grant access
    pub fn authorization_url(&self) -> String {
        let settings = &self.inner.settings;
        format!(
            "{}?client_id={}&scope={}&response_type=code&redirect_uri={}",
            settings.authorization_endpoint,
            urlencoding::encode(&settings.client_id),
            urlencoding::encode(&settings.scope),
            urlencoding::encode(&settings.redirect_uri)
        )
    }

    /// Exchange an authorization code for a credential and persist it
    pub async fn exchange_authorization_code(&self, code: &str) -> Result<Credential> {
        info!("Exchanging authorization code for tokens");
        let settings = &self.inner.settings;
        let params = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", settings.redirect_uri.as_str()),
            ("client_id", settings.client_id.as_str()),
        ];

        let response = self
            .inner
            .request_token(&params)
            .await
            .map_err(|e| GatewayError::AuthExchange {
                status: None,
                body: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(status = status.as_u16(), body = %body, "Authorization code exchange rejected");
            return Err(GatewayError::AuthExchange {
                status: Some(status.as_u16()),
                body,
            });
        }

        let token: TokenResponse =
            response
                .json()
                .await
                .map_err(|e| GatewayError::AuthExchange {
                    status: Some(status.as_u16()),
                    body: format!("Invalid token response: {}", e),
                })?;

        let credential = token.into_credential(now_millis(), None);
        self.inner.store_credential(credential.clone()).await;
        Ok(credential)
    }

    /// Access token that is valid right now
    ///
    /// Loads persisted state when nothing is held yet and refreshes an expired
    /// credential first.
    pub async fn ensure_valid(&self) -> Result<String> {
        let missing = !self.has_credential();
        if missing {
            self.initialize().await;
        }

        let expired = match self.inner.credential.read().as_ref() {
            Some(credential) => credential.is_expired(),
            None => return Err(GatewayError::NotAuthorized),
        };

        if expired {
            debug!("Access token expired, refreshing before request");
            return Ok(self.refresh_with(false).await?.access_token);
        }

        self.inner
            .credential
            .read()
            .as_ref()
            .map(|c| c.access_token.clone())
            .ok_or(GatewayError::NotAuthorized)
    }

    /// Perform the refresh-token grant, or join the one already in flight
    pub async fn refresh(&self) -> Result<Credential> {
        self.refresh_with(true).await
    }

    /// Single-flight refresh
    ///
    /// Unless `force` is set, a credential that is no longer expired when the
    /// slot is taken is returned as-is: another caller's exchange finished
    /// between the expiry check and here.
    async fn refresh_with(&self, force: bool) -> Result<Credential> {
        let (generation, pending) = {
            let mut slot = self.inner.refresh.lock();
            let in_flight = slot
                .pending
                .as_ref()
                .filter(|pending| pending.peek().is_none())
                .cloned();

            match in_flight {
                Some(pending) => {
                    debug!("Joining in-flight token refresh");
                    (slot.generation, pending)
                }
                None => {
                    if !force {
                        let current = self
                            .inner
                            .credential
                            .read()
                            .as_ref()
                            .filter(|credential| !credential.is_expired())
                            .cloned();
                        if let Some(credential) = current {
                            debug!("Credential already refreshed by a concurrent caller");
                            return Ok(credential);
                        }
                    }

                    slot.generation += 1;
                    let inner = Arc::clone(&self.inner);
                    let pending = async move { inner.refresh_exchange().await }
                        .boxed()
                        .shared();
                    slot.pending = Some(pending.clone());
                    (slot.generation, pending)
                }
            }
        };

        let outcome = pending.await;

        {
            let mut slot = self.inner.refresh.lock();
            if slot.generation == generation {
                slot.pending = None;
            }
        }

        outcome.map_err(GatewayError::from)
    }
}

impl Inner {
    async fn request_token(&self, params: &[(&str, &str)]) -> reqwest::Result<reqwest::Response> {
        let basic = STANDARD.encode(format!(
            "{}:{}",
            self.settings.client_id, self.settings.client_secret
        ));
        self.http
            .post(&self.settings.token_endpoint)
            .header(reqwest::header::AUTHORIZATION, format!("Basic {}", basic))
            .form(params)
            .send()
            .await
    }

    async fn refresh_exchange(&self) -> std::result::Result<Credential, RefreshFailure> {
        let refresh_token = self
            .credential
            .read()
            .as_ref()
            .and_then(|c| c.refresh_token.clone());
        let Some(refresh_token) = refresh_token else {
            error!("Cannot refresh access token: no refresh token held");
            return Err(RefreshFailure {
                status: None,
                message: "No refresh token available".to_string(),
            });
        };

        info!("Refreshing access token");
        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token.as_str()),
            ("client_id", self.settings.client_id.as_str()),
        ];

        let response = self.request_token(&params).await.map_err(|e| {
            error!(error = %e, "Token refresh request failed");
            RefreshFailure {
                status: None,
                message: e.to_string(),
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(status = status.as_u16(), body = %body, "Token refresh rejected");
            return Err(RefreshFailure {
                status: Some(status.as_u16()),
                message: body,
            });
        }

        let token: TokenResponse = response.json().await.map_err(|e| RefreshFailure {
            status: Some(status.as_u16()),
            message: format!("Invalid token response: {}", e),
        })?;

        let credential = token.into_credential(now_millis(), Some(refresh_token));
        self.store_credential(credential.clone()).await;
        Ok(credential)
    }

    /// Replace the held credential and persist it
    ///
    /// A failed write is logged; the new credential stays usable in memory.
    async fn store_credential(&self, credential: Credential) {
        *self.credential.write() = Some(credential.clone());
        match self.store.save_credential(&credential).await {
            Ok(()) => info!(expires_at = ?credential.expires_at, "Stored OAuth credential"),
            Err(e) => error!(error = %e, "Failed to persist OAuth credential"),
        }
    }
}
