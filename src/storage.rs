//! Credential and app-installation persistence with pluggable storage
use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// File name of the persisted credential document
pub const TOKEN_FILE: &str = "smartthings_token.json";
/// File name of the persisted app-installation document
pub const APP_INFO_FILE: &str = "smartthings_acs_app_info.json";

/// Milliseconds since the Unix epoch
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// OAuth credential held for the upstream API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
    /// Absolute expiry in epoch milliseconds, already reduced by the safety margin
    #[serde(default)]
    pub expires_at: Option<u64>,
}

impl Credential {
    /// Check if the credential is expired
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(now_millis())
    }

    pub fn is_expired_at(&self, now_ms: u64) -> bool {
        if let Some(expires_at) = self.expires_at {
            return now_ms >= expires_at;
        }
        false
    }
}

/// Identity of the app installation, learned from the CONFIRMATION handshake
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallationIdentity {
    pub app_id: String,
    pub installed_app_id: String,
}

/// Storage interface for the credential and the installation identity
///
/// Every save replaces the previous document wholesale.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn load_credential(&self) -> Result<Option<Credential>>;

    async fn save_credential(&self, credential: &Credential) -> Result<()>;

    async fn load_installation(&self) -> Result<Option<InstallationIdentity>>;

    async fn save_installation(&self, identity: &InstallationIdentity) -> Result<()>;
}

/// In-memory storage implementation
///
/// Suitable for testing and hosts that do not persist anything.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    credential: Arc<RwLock<Option<Credential>>>,
    installation: Arc<RwLock<Option<InstallationIdentity>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-seeded with a credential
    pub fn with_credential(credential: Credential) -> Self {
        let store = Self::new();
        *store.credential.write() = Some(credential);
        store
    }

    /// Credential as currently stored
    pub fn credential(&self) -> Option<Credential> {
        self.credential.read().clone()
    }

    pub fn installation(&self) -> Option<InstallationIdentity> {
        self.installation.read().clone()
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn load_credential(&self) -> Result<Option<Credential>> {
        Ok(self.credential.read().clone())
    }

    async fn save_credential(&self, credential: &Credential) -> Result<()> {
        *self.credential.write() = Some(credential.clone());
        Ok(())
    }

    async fn load_installation(&self) -> Result<Option<InstallationIdentity>> {
        Ok(self.installation.read().clone())
    }

    async fn save_installation(&self, identity: &InstallationIdentity) -> Result<()> {
        *self.installation.write() = Some(identity.clone());
        Ok(())
    }
}

/// File-based storage implementation
///
/// Keeps two pretty-printed JSON documents in a directory chosen by the host:
/// `smartthings_token.json` and `smartthings_acs_app_info.json`.
#[derive(Debug, Clone)]
pub struct FileStore {
    base_path: PathBuf,
}

impl FileStore {
    /// Create a file store rooted at `path`, creating the directory if needed
    ///
    /// # Example
    ///
    /// ```
    /// use smartthings_gateway::storage::FileStore;
    ///
    /// let dir = std::env::temp_dir().join("smartthings-gateway-doc");
    /// let store = FileStore::with_path(dir).unwrap();
    /// assert!(store.token_path().ends_with("smartthings_token.json"));
    /// ```
    pub fn with_path(path: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&path).map_err(|e| {
            GatewayError::Storage(format!("Failed to create storage directory: {}", e))
        })?;

        Ok(Self { base_path: path })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn token_path(&self) -> PathBuf {
        self.base_path.join(TOKEN_FILE)
    }

    pub fn app_info_path(&self) -> PathBuf {
        self.base_path.join(APP_INFO_FILE)
    }

    async fn read_document<T: serde::de::DeserializeOwned>(&self, path: &Path) -> Result<Option<T>> {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(GatewayError::Storage(format!(
                    "Failed to read {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        serde_json::from_str(&content).map(Some).map_err(|e| {
            GatewayError::Storage(format!("Failed to parse {}: {}", path.display(), e))
        })
    }

    async fn write_document<T: Serialize + Sync>(&self, path: &Path, value: &T) -> Result<()> {
        let content = serde_json::to_string_pretty(value)?;
        tokio::fs::write(path, content).await.map_err(|e| {
            GatewayError::Storage(format!("Failed to write {}: {}", path.display(), e))
        })
    }
}

#[async_trait]
impl CredentialStore for FileStore {
    async fn load_credential(&self) -> Result<Option<Credential>> {
        self.read_document(&self.token_path()).await
    }

    async fn save_credential(&self, credential: &Credential) -> Result<()> {
        self.write_document(&self.token_path(), credential).await
    }

    async fn load_installation(&self) -> Result<Option<InstallationIdentity>> {
        self.read_document(&self.app_info_path()).await
    }

    async fn save_installation(&self, identity: &InstallationIdentity) -> Result<()> {
        self.write_document(&self.app_info_path(), identity).await
    }
}
