//! Authenticated SmartThings API client with retry and backoff
use crate::cache::StatusSource;
use crate::error::{GatewayError, Result};
use crate::oauth::TokenManager;
use crate::types::{Device, DeviceCommand, DevicePage, DeviceStatus, StatusResponse, MAIN_COMPONENT};
use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Retry policy for upstream calls
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry; doubles for every further retry
    pub base_delay: Duration,
    /// Add up to 20% random jitter on top of each delay
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based), without jitter
    pub fn backoff_delay(&self, retry: u32) -> Duration {
        let shift = retry.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1u32 << shift)
    }

    fn delay_with_jitter(&self, retry: u32) -> Duration {
        let delay = self.backoff_delay(retry);
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let factor = rand::thread_rng().gen_range(0.0..0.2);
        delay + delay.mul_f64(factor)
    }
}

/// Result of a subscription request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionOutcome {
    Created,
    /// The platform answered 409: the subscription already exists
    AlreadySubscribed,
}

/// HTTP client for the SmartThings API base
///
/// Every request gets a valid bearer token from the [`TokenManager`]. Network
/// failures, timeouts, 429 and 5xx responses are retried with exponential
/// backoff; any other 4xx is returned immediately.
#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    tokens: TokenManager,
    retry: RetryPolicy,
}

impl ApiClient {
    /// `http` carries the per-request timeout
    pub fn new(
        http: reqwest::Client,
        base_url: impl Into<String>,
        tokens: TokenManager,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            tokens,
            retry,
        }
    }

    pub fn tokens(&self) -> &TokenManager {
        &self.tokens
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Execute a request with authentication and retry semantics
    ///
    /// Returns the body of the successful response, or the final failure once
    /// retries are exhausted. The body is read inside the retry loop so a
    /// timeout while receiving it is retried like any other network failure.
    pub async fn execute(&self, method: Method, url: &str, body: Option<&Value>) -> Result<Bytes> {
        let mut retry = 0;

        loop {
            let token = self.tokens.ensure_valid().await?;

            let mut request = self.http.request(method.clone(), url).bearer_auth(token);
            if let Some(body) = body {
                request = request.json(body);
            }

            debug!(attempt = retry + 1, %method, %url, "Sending API request");
            let failure = match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        match response.bytes().await {
                            Ok(bytes) => return Ok(bytes),
                            Err(e) => classify_transport_error(e)?,
                        }
                    } else {
                        let body = response.text().await.unwrap_or_default();
                        let error = GatewayError::Api {
                            status: status.as_u16(),
                            body,
                        };
                        if !is_retryable_status(status) {
                            debug!(%method, %url, status = status.as_u16(), "API request failed, not retrying");
                            return Err(error);
                        }
                        error
                    }
                }
                Err(e) => classify_transport_error(e)?,
            };

            if retry >= self.retry.max_retries {
                warn!(%method, %url, attempts = retry + 1, error = %failure, "API request failed, retries exhausted");
                return Err(failure);
            }

            retry += 1;
            let delay = self.retry.delay_with_jitter(retry);
            info!(%method, %url, retry, delay_ms = delay.as_millis() as u64, error = %failure, "Retrying API request");
            tokio::time::sleep(delay).await;
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        let bytes = self.execute(Method::GET, url, None).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// All devices visible to the credential, following pagination
    pub async fn get_devices(&self) -> Result<Vec<Device>> {
        let mut devices = Vec::new();
        let mut visited = HashSet::new();
        let mut next = Some(self.url("/devices"));

        while let Some(url) = next.take() {
            let page: DevicePage = self.get_json(&url).await?;
            devices.extend(page.items);
            visited.insert(url);
            next = page
                .links
                .and_then(|links| links.next)
                .map(|link| link.href)
                .filter(|href| {
                    let repeated = visited.contains(href);
                    if repeated {
                        warn!(href = %href, "Device pagination points back to a visited page, stopping");
                    }
                    !repeated
                });
        }

        debug!(count = devices.len(), "Listed devices");
        Ok(devices)
    }

    /// Status of the device's `main` component, straight from the API
    pub async fn get_device_status(&self, device_id: &str) -> Result<DeviceStatus> {
        let url = self.url(&format!("/devices/{}/status", urlencoding::encode(device_id)));
        let mut response: StatusResponse = self.get_json(&url).await?;
        response.components.remove(MAIN_COMPONENT).ok_or_else(|| {
            GatewayError::UnexpectedResponse(format!(
                "status of device {} has no main component",
                device_id
            ))
        })
    }

    pub async fn send_commands(&self, device_id: &str, commands: &[DeviceCommand]) -> Result<()> {
        let url = self.url(&format!("/devices/{}/commands", urlencoding::encode(device_id)));
        let body = json!({ "commands": commands });
        self.execute(Method::POST, &url, Some(&body)).await?;
        info!(device_id, commands = %body["commands"], "Sent device commands");
        Ok(())
    }

    /// Subscribe the installed app to a device capability
    ///
    /// A 409 means the subscription exists already and counts as success.
    pub async fn create_subscription(
        &self,
        device_id: &str,
        capability: &str,
    ) -> Result<SubscriptionOutcome> {
        let installed_app_id = self
            .tokens
            .installation()
            .map(|identity| identity.installed_app_id)
            .ok_or(GatewayError::MissingInstallation)?;

        let url = self.url(&format!(
            "/installedapps/{}/subscriptions",
            urlencoding::encode(&installed_app_id)
        ));
        let body = json!({
            "sourceType": "CAPABILITY",
            "capability": {
                "deviceId": device_id,
                "capability": capability,
                "stateChangeOnly": true
            }
        });

        match self.execute(Method::POST, &url, Some(&body)).await {
            Ok(_) => {
                info!(device_id, capability, "Subscribed to capability events");
                Ok(SubscriptionOutcome::Created)
            }
            Err(GatewayError::Api { status: 409, .. }) => {
                debug!(device_id, capability, "Capability subscription already exists");
                Ok(SubscriptionOutcome::AlreadySubscribed)
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl StatusSource for ApiClient {
    async fn fetch_status(&self, device_id: &str) -> Result<DeviceStatus> {
        self.get_device_status(device_id).await
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request() || err.is_body()
}

/// Network failures become a retryable `Transient`; anything else (builder,
/// redirect, decode) is returned at once as `Request`
fn classify_transport_error(err: reqwest::Error) -> Result<GatewayError> {
    if is_retryable_error(&err) {
        Ok(GatewayError::Transient(err))
    } else {
        Err(GatewayError::Request(err))
    }
}
