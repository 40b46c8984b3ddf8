//! Error types for gateway operations
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Authorization code exchange failed (status {status:?}): {body}")]
    AuthExchange { status: Option<u16>, body: String },

    #[error("Token refresh failed (status {status:?}): {message}")]
    Refresh {
        status: Option<u16>,
        message: String,
    },

    #[error("Not authorized: no credential is available, re-authorization required")]
    NotAuthorized,

    #[error("Network failure after retries: {0}")]
    Transient(#[source] reqwest::Error),

    #[error("HTTP request could not be completed: {0}")]
    Request(#[source] reqwest::Error),

    #[error("API request failed with status {status}: {body}")]
    Api { status: u16, body: String },

    #[error("Status fetch for device {device_id} failed")]
    StatusFetch {
        device_id: String,
        #[source]
        source: Arc<GatewayError>,
    },

    #[error("Unexpected response from server: {0}")]
    UnexpectedResponse(String),

    #[error("No installed app id is known; the webhook CONFIRMATION handshake has not happened")]
    MissingInstallation,

    #[error("Malformed webhook payload: {0}")]
    MalformedWebhookPayload(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to bind webhook listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    /// The stored grant is unusable and the user has to authorize again.
    pub fn requires_reauthorization(&self) -> bool {
        match self {
            Self::AuthExchange { .. } | Self::Refresh { .. } | Self::NotAuthorized => true,
            Self::StatusFetch { source, .. } => source.requires_reauthorization(),
            _ => false,
        }
    }

    /// The failure is worth retrying later without user involvement.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transient(_) => true,
            Self::Api { status, .. } => *status == 429 || *status >= 500,
            Self::StatusFetch { source, .. } => source.is_transient(),
            _ => false,
        }
    }

    /// HTTP status reported by the upstream API, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            Self::AuthExchange { status, .. } | Self::Refresh { status, .. } => *status,
            Self::StatusFetch { source, .. } => source.status(),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
