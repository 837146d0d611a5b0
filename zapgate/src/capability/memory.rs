//! Ephemeral capability store for tests and store-less deployments.

use async_trait::async_trait;
use dashmap::DashMap;

use super::{Capability, CapabilityStore};
use crate::Result;

/// In-memory store; contents vanish on restart.
#[derive(Debug, Default)]
pub struct MemoryCapabilityStore {
    records: DashMap<String, Capability>,
}

impl MemoryCapabilityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl CapabilityStore for MemoryCapabilityStore {
    async fn update(&self, cap: Capability) -> Result<()> {
        self.records.insert(cap.service_ref.clone(), cap);
        Ok(())
    }

    async fn get(&self, service_ref: &str) -> Result<Option<Capability>> {
        Ok(self.records.get(service_ref).map(|r| r.clone()))
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn update_then_get_roundtrip() {
        let store = MemoryCapabilityStore::new();
        let cap = Capability {
            service_ref: "1:0:19:132F".into(),
            interlaced: Some(true),
            resolution: "1920x1080".into(),
            codec: "h264".into(),
            last_scan: Utc::now(),
        };

        store.update(cap.clone()).await.unwrap();
        assert_eq!(store.get("1:0:19:132F").await.unwrap(), Some(cap));
        assert_eq!(store.get("1:0:19:FFFF").await.unwrap(), None);
    }

    #[tokio::test]
    async fn update_replaces_existing_record() {
        let store = MemoryCapabilityStore::new();
        let mut cap = Capability {
            service_ref: "svc".into(),
            interlaced: None,
            resolution: String::new(),
            codec: String::new(),
            last_scan: Utc::now(),
        };
        store.update(cap.clone()).await.unwrap();

        cap.codec = "hevc".into();
        store.update(cap.clone()).await.unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(store.get("svc").await.unwrap().unwrap().codec, "hevc");
    }
}
