//! Gateway configuration
use crate::error::{GatewayError, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

pub const DEFAULT_API_BASE: &str = "https://api.smartthings.com/v1";
pub const DEFAULT_TOKEN_ENDPOINT: &str = "https://api.smartthings.com/oauth/token";
pub const DEFAULT_AUTHORIZATION_ENDPOINT: &str = "https://api.smartthings.com/oauth/authorize";
pub const DEFAULT_SCOPE: &str = "r:devices:* w:devices:* x:devices:*";
pub const DEFAULT_PORT: u16 = 8999;

const APP_DIR_NAME: &str = "smartthings-gateway";

/// Gateway configuration, as found in the host's JSON config document
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_token_endpoint")]
    pub token_endpoint: String,
    #[serde(default = "default_authorization_endpoint")]
    pub authorization_endpoint: String,
    #[serde(default = "default_scope")]
    pub scope: String,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_status_cache_ttl_secs")]
    pub status_cache_ttl_secs: u64,
    #[serde(default = "default_status_cache_capacity")]
    pub status_cache_capacity: u64,
    /// Directory holding the token and app-info documents
    #[serde(default)]
    pub persist_dir: Option<PathBuf>,
    /// Devices the host wants to expose, matched by label
    #[serde(default)]
    pub devices: Vec<DeviceSelection>,
}

/// A device picked by the host, with the capabilities to subscribe to
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSelection {
    pub device_label: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

fn default_api_base() -> String {
    DEFAULT_API_BASE.to_string()
}

fn default_token_endpoint() -> String {
    DEFAULT_TOKEN_ENDPOINT.to_string()
}

fn default_authorization_endpoint() -> String {
    DEFAULT_AUTHORIZATION_ENDPOINT.to_string()
}

fn default_scope() -> String {
    DEFAULT_SCOPE.to_string()
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    1000
}

fn default_status_cache_ttl_secs() -> u64 {
    10
}

fn default_status_cache_capacity() -> u64 {
    100
}

impl GatewayConfig {
    /// Configuration with every optional setting at its default
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        redirect_uri: impl Into<String>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            redirect_uri: redirect_uri.into(),
            api_base: default_api_base(),
            token_endpoint: default_token_endpoint(),
            authorization_endpoint: default_authorization_endpoint(),
            scope: default_scope(),
            bind_address: default_bind_address(),
            port: default_port(),
            request_timeout_secs: default_request_timeout_secs(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            status_cache_ttl_secs: default_status_cache_ttl_secs(),
            status_cache_capacity: default_status_cache_capacity(),
            persist_dir: None,
            devices: Vec::new(),
        }
    }

    /// Load and validate a JSON config file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            GatewayError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config: Self = serde_json::from_str(&content).map_err(|e| {
            GatewayError::Config(format!("Failed to parse {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("clientId", &self.client_id),
            ("clientSecret", &self.client_secret),
            ("redirectUri", &self.redirect_uri),
        ] {
            if value.trim().is_empty() {
                return Err(GatewayError::Config(format!("{} is required", name)));
            }
        }
        self.redirect_url()?;
        Url::parse(&self.api_base)
            .map_err(|e| GatewayError::Config(format!("apiBase is not a valid URL: {}", e)))?;
        Ok(())
    }

    /// Redirect URI as an http(s) URL whose path can be served by the listener
    pub fn redirect_url(&self) -> Result<Url> {
        let url = Url::parse(&self.redirect_uri)
            .map_err(|e| GatewayError::Config(format!("redirectUri is not a valid URL: {}", e)))?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(GatewayError::Config(format!(
                "redirectUri must use http or https, got {}",
                url.scheme()
            )));
        }
        let path = url.path();
        if !path.starts_with('/')
            || path
                .split('/')
                .any(|segment| segment.starts_with(':') || segment.starts_with('*'))
        {
            return Err(GatewayError::Config(format!(
                "redirectUri path {} cannot be routed",
                path
            )));
        }
        Ok(url)
    }

    /// Path component of the redirect URI, where the OAuth callback is served
    pub fn redirect_path(&self) -> Result<String> {
        Ok(self.redirect_url()?.path().to_string())
    }

    /// Directory for persisted credentials
    ///
    /// Falls back to `<data_dir>/smartthings-gateway`, honouring `XDG_DATA_HOME`.
    pub fn resolve_persist_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.persist_dir {
            return Ok(dir.clone());
        }
        let base_dir = if let Ok(xdg_data) = std::env::var("XDG_DATA_HOME") {
            PathBuf::from(xdg_data)
        } else {
            dirs::data_dir().ok_or_else(|| {
                GatewayError::Config("Could not determine data directory".to_string())
            })?
        };
        Ok(base_dir.join(APP_DIR_NAME))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn status_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.status_cache_ttl_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_applied_when_parsing() {
        let config: GatewayConfig = serde_json::from_str(
            r#"{
                "clientId": "id",
                "clientSecret": "secret",
                "redirectUri": "https://example.com/oauth/callback",
                "devices": [{ "deviceLabel": "Living room AC", "capabilities": ["switch"] }]
            }"#,
        )
        .unwrap();

        assert_eq!(config.api_base, DEFAULT_API_BASE);
        assert_eq!(config.port, 8999);
        assert_eq!(config.request_timeout(), Duration::from_secs(10));
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.retry_base_delay(), Duration::from_secs(1));
        assert_eq!(config.status_cache_ttl(), Duration::from_secs(10));
        assert_eq!(config.status_cache_capacity, 100);
        assert_eq!(config.devices[0].device_label, "Living room AC");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_redirect_path() {
        let config = GatewayConfig::new("id", "secret", "https://example.com/oauth/callback?x=1");
        assert_eq!(config.redirect_path().unwrap(), "/oauth/callback");
    }

    #[test]
    fn test_validation_rejects_missing_credentials() {
        let config = GatewayConfig::new("id", "  ", "https://example.com/callback");
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("clientSecret"));

        let config = GatewayConfig::new("id", "secret", "not a url");
        assert!(matches!(config.validate(), Err(GatewayError::Config(_))));
    }

    #[test]
    fn test_validation_rejects_unroutable_redirect() {
        for redirect in ["urn:callback", "mailto:me@example.com", "ftp://example.com/cb"] {
            let config = GatewayConfig::new("id", "secret", redirect);
            assert!(
                matches!(config.validate(), Err(GatewayError::Config(_))),
                "{} accepted",
                redirect
            );
            assert!(config.redirect_path().is_err());
        }

        let config = GatewayConfig::new("id", "secret", "https://example.com/:id/callback");
        assert!(config.redirect_path().is_err());

        let config = GatewayConfig::new("id", "secret", "http://localhost:8999");
        assert_eq!(config.redirect_path().unwrap(), "/");
    }

    #[test]
    fn test_from_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"clientId":"id","clientSecret":"s","redirectUri":"https://h/cb","port":9100}"#,
        )
        .unwrap();

        let config = GatewayConfig::from_file(&path).unwrap();
        assert_eq!(config.port, 9100);

        let missing = GatewayConfig::from_file(&dir.path().join("missing.json"));
        assert!(matches!(missing, Err(GatewayError::Config(_))));
    }

    #[test]
    fn test_explicit_persist_dir_wins() {
        let mut config = GatewayConfig::new("id", "secret", "https://h/cb");
        config.persist_dir = Some(PathBuf::from("/var/lib/gateway"));
        assert_eq!(
            config.resolve_persist_dir().unwrap(),
            PathBuf::from("/var/lib/gateway")
        );
    }
}
