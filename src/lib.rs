//! SmartThings gateway - cloud API access for home automation hosts
//!
//! This library signs in to the SmartThings cloud with the OAuth 2.0
//! authorization code flow, keeps the access token fresh, and exposes the
//! device API to a host process.
//!
//! # Features
//!
//! - Authorization code exchange and single-flight token refresh
//! - File-backed credential and app-installation persistence
//! - Device listing, status reads and command dispatch with retry on
//!   transient failures
//! - Short-lived status cache with per-device request coalescing
//! - Webhook listener for the OAuth redirect, the CONFIRMATION handshake and
//!   live device events that keep the cache current
//!
//! # Example
//!
//! ```no_run
//! use smartthings_gateway::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn run() -> smartthings_gateway::error::Result<()> {
//! let config = GatewayConfig::new(
//!     "your-client-id",
//!     "your-client-secret",
//!     "https://gateway.example.com/oauth/callback",
//! );
//! let gateway = Gateway::new(config)?;
//!
//! let server = WebhookServer::new(
//!     gateway.clone(),
//!     Arc::new(|event: &DeviceEvent| println!("{} -> {}", event.device_id, event.value)),
//! );
//! server.start().await?;
//!
//! if gateway.init().await {
//!     for device in gateway.get_devices().await? {
//!         let status = gateway.get_status(&device.device_id).await?;
//!         println!("{}: {:?}", device.display_name(), status.value("switch", "switch"));
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod gateway;
pub mod oauth;
pub mod storage;
pub mod types;
pub mod webhook;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::client::SubscriptionOutcome;
    pub use crate::config::{DeviceSelection, GatewayConfig};
    pub use crate::error::{GatewayError, Result};
    pub use crate::gateway::Gateway;
    pub use crate::storage::{
        Credential, CredentialStore, FileStore, InstallationIdentity, MemoryStore,
    };
    pub use crate::types::{Device, DeviceCommand, DeviceEvent, DeviceStatus};
    pub use crate::webhook::{DeviceEventObserver, WebhookServer};
}
