//! Capability store: what each service actually delivers.
//!
//! Written only by the scan manager, read by the profile compiler. A
//! missing record is legal and means "treat as unknown".

mod memory;
mod sqlite;

pub use memory::MemoryCapabilityStore;
pub use sqlite::SqliteCapabilityStore;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::CapabilityConfig;
use crate::{Error, Result};

/// A probed stream capability record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capability {
    /// Technical service reference this record belongs to.
    pub service_ref: String,
    /// Interlaced material; `None` when the probe could not tell.
    pub interlaced: Option<bool>,
    /// `WxH`, empty for audio-only services.
    pub resolution: String,
    /// Video codec name as reported by the probe (empty for audio-only).
    pub codec: String,
    /// When the record was last refreshed.
    pub last_scan: DateTime<Utc>,
}

impl Capability {
    /// A record that carries no usable probe data.
    pub fn is_empty(&self) -> bool {
        self.resolution.is_empty() && self.codec.is_empty() && self.interlaced.is_none()
    }

    /// Progressive material confirmed by a probe.
    pub fn is_progressive(&self) -> bool {
        self.interlaced == Some(false)
    }
}

/// Persistence interface for capability records.
#[async_trait]
pub trait CapabilityStore: Send + Sync {
    /// Insert or replace the record for its service reference.
    async fn update(&self, cap: Capability) -> Result<()>;

    /// Fetch the record for a service reference, if any.
    async fn get(&self, service_ref: &str) -> Result<Option<Capability>>;

    /// Release backend resources.
    async fn close(&self);
}

/// Build a store from the configured backend name.
///
/// Fails closed: an unknown backend is a configuration error, not a silent
/// in-memory fallback.
pub async fn open_store(config: &CapabilityConfig) -> Result<Arc<dyn CapabilityStore>> {
    match config.backend.as_str() {
        "memory" => Ok(Arc::new(MemoryCapabilityStore::new())),
        "sqlite" => Ok(Arc::new(
            SqliteCapabilityStore::connect(&config.database_url).await?,
        )),
        other => Err(Error::config(format!(
            "unknown capability store backend {other:?}"
        ))),
    }
}
