//! Durable capability store backed by SQLite.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};

use super::{Capability, CapabilityStore};
use crate::Result;

/// Row model for the `capabilities` table.
#[derive(Debug, sqlx::FromRow)]
struct CapabilityRow {
    service_ref: String,
    interlaced: Option<bool>,
    resolution: String,
    codec: String,
    last_scan: DateTime<Utc>,
}

impl From<CapabilityRow> for Capability {
    fn from(row: CapabilityRow) -> Self {
        Self {
            service_ref: row.service_ref,
            interlaced: row.interlaced,
            resolution: row.resolution,
            codec: row.codec,
            last_scan: row.last_scan,
        }
    }
}

/// SQLite-backed store.
pub struct SqliteCapabilityStore {
    pool: SqlitePool,
}

impl SqliteCapabilityStore {
    /// Connect to `database_url`, creating the file and schema if needed.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await.map_err(|e| {
            crate::Error::Database(sqlx::Error::Migrate(Box::new(e)))
        })?;

        Ok(Self { pool })
    }
}

#[async_trait]
impl CapabilityStore for SqliteCapabilityStore {
    async fn update(&self, cap: Capability) -> Result<()> {
        sqlx::query(
            "INSERT INTO capabilities (service_ref, interlaced, resolution, codec, last_scan)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(service_ref) DO UPDATE SET
               interlaced = excluded.interlaced,
               resolution = excluded.resolution,
               codec = excluded.codec,
               last_scan = excluded.last_scan",
        )
        .bind(&cap.service_ref)
        .bind(cap.interlaced)
        .bind(&cap.resolution)
        .bind(&cap.codec)
        .bind(cap.last_scan)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, service_ref: &str) -> Result<Option<Capability>> {
        let row = sqlx::query_as::<_, CapabilityRow>(
            "SELECT service_ref, interlaced, resolution, codec, last_scan
             FROM capabilities WHERE service_ref = ?",
        )
        .bind(service_ref)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Capability::from))
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn temp_store() -> (SqliteCapabilityStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}?mode=rwc", dir.path().join("caps.db").display());
        (SqliteCapabilityStore::connect(&url).await.unwrap(), dir)
    }

    #[tokio::test]
    async fn roundtrip_and_upsert() {
        let (store, _dir) = temp_store().await;

        let mut cap = Capability {
            service_ref: "1:0:19:132F:3EF:1:C00000:0:0:0:".into(),
            interlaced: Some(true),
            resolution: "1920x1080".into(),
            codec: "h264".into(),
            last_scan: Utc::now(),
        };

        store.update(cap.clone()).await.unwrap();
        let loaded = store.get(&cap.service_ref).await.unwrap().unwrap();
        assert_eq!(loaded.resolution, "1920x1080");
        assert_eq!(loaded.interlaced, Some(true));

        cap.interlaced = Some(false);
        cap.resolution = "1280x720".into();
        store.update(cap.clone()).await.unwrap();
        let loaded = store.get(&cap.service_ref).await.unwrap().unwrap();
        assert_eq!(loaded.resolution, "1280x720");
        assert_eq!(loaded.interlaced, Some(false));
    }

    #[tokio::test]
    async fn missing_record_is_none() {
        let (store, _dir) = temp_store().await;
        assert!(store.get("1:0:0:0").await.unwrap().is_none());
        store.close().await;
    }
}
