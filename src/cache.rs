//! Short-lived device status cache with per-device request coalescing
//!
//! Snapshots live for a fixed TTL and are evicted least-recently-used once the
//! capacity is reached. A miss fills the entry through a [`StatusSource`];
//! concurrent misses for the same device share that single fetch. If the
//! fetching caller goes away, a waiting caller takes the fetch over, so a
//! device can never be left with a stuck in-flight marker.

use crate::error::{GatewayError, Result};
use crate::types::DeviceStatus;
use async_trait::async_trait;
use moka::future::Cache;
use moka::ops::compute::{CompResult, Op};
use moka::policy::EvictionPolicy;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_STATUS_TTL: Duration = Duration::from_secs(10);
pub const DEFAULT_STATUS_CAPACITY: u64 = 100;

/// Where snapshots come from on a cache miss
#[async_trait]
pub trait StatusSource: Send + Sync {
    async fn fetch_status(&self, device_id: &str) -> Result<DeviceStatus>;
}

#[derive(Debug, Clone)]
pub struct StatusCacheConfig {
    pub ttl: Duration,
    pub max_capacity: u64,
}

impl Default for StatusCacheConfig {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_STATUS_TTL,
            max_capacity: DEFAULT_STATUS_CAPACITY,
        }
    }
}

#[derive(Clone)]
pub struct StatusCache {
    entries: Cache<String, DeviceStatus>,
    source: Arc<dyn StatusSource>,
}

impl StatusCache {
    pub fn new(config: StatusCacheConfig, source: Arc<dyn StatusSource>) -> Self {
        debug!(
            ttl_ms = config.ttl.as_millis() as u64,
            max_capacity = config.max_capacity,
            "Status cache configured"
        );
        let entries = Cache::builder()
            .time_to_live(config.ttl)
            .max_capacity(config.max_capacity)
            .eviction_policy(EvictionPolicy::lru())
            .build();

        Self { entries, source }
    }

    /// Cached snapshot, or one fresh fetch shared by every concurrent caller
    pub async fn get_status(&self, device_id: &str) -> Result<DeviceStatus> {
        let source = Arc::clone(&self.source);
        let entry = self
            .entries
            .entry(device_id.to_string())
            .or_try_insert_with(async move { source.fetch_status(device_id).await })
            .await
            .map_err(|source| {
                debug!(device_id, error = %source, "Status fetch failed");
                GatewayError::StatusFetch {
                    device_id: device_id.to_string(),
                    source,
                }
            })?;

        if entry.is_fresh() {
            debug!(device_id, "Status cache filled from upstream");
        } else {
            debug!(device_id, "Status cache hit");
        }
        Ok(entry.into_value())
    }

    /// Patch one attribute of a cached snapshot and restart its TTL
    ///
    /// The read and the write happen under the entry's lock, so a concurrent
    /// `invalidate` is never undone by a patch.
    ///
    /// Returns false, leaving the cache untouched, when the device has no
    /// snapshot; the next read fetches the full status instead.
    pub async fn apply_patch(
        &self,
        device_id: &str,
        capability: &str,
        attribute: &str,
        value: Value,
    ) -> bool {
        let outcome = self
            .entries
            .entry_by_ref(device_id)
            .and_compute_with(|entry| {
                let op = match entry {
                    Some(entry) => {
                        let mut status = entry.into_value();
                        status.set_value(capability, attribute, value);
                        Op::Put(status)
                    }
                    None => Op::Nop,
                };
                std::future::ready(op)
            })
            .await;

        match outcome {
            CompResult::ReplacedWith(_) => {
                debug!(device_id, capability, attribute, "Patched cached status");
                true
            }
            _ => {
                debug!(device_id, capability, attribute, "No cached status to patch");
                false
            }
        }
    }

    /// Drop the device's snapshot so the next read goes upstream
    pub async fn invalidate(&self, device_id: &str) {
        self.entries.invalidate(device_id).await;
        debug!(device_id, "Invalidated cached status");
    }

    /// Snapshot currently cached for the device, without fetching
    pub async fn peek(&self, device_id: &str) -> Option<DeviceStatus> {
        self.entries.get(device_id).await
    }
}
