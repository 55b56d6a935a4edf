//! SQLite key/value store for runtime settings, with JSON-encoded values.

use rusqlite::OptionalExtension;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::storage::{Database, StorageError};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0}")]
    Storage(#[from] StorageError),

    #[error("stored value for {key} is not valid JSON: {reason}")]
    BadValue { key: String, reason: String },
}

#[derive(Clone)]
pub struct ConfigController {
    db: Database,
}

impl ConfigController {
    pub async fn new(db: Database) -> Result<Self, ConfigError> {
        db.with(|conn| {
            conn.execute_batch("CREATE TABLE IF NOT EXISTS config (key TEXT PRIMARY KEY, value TEXT);")
        })
        .await?;
        Ok(Self { db })
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, ConfigError> {
        let owned_key = key.to_string();
        let stored: Option<String> = self
            .db
            .with(move |conn| {
                conn.query_row(
                    "SELECT value FROM config WHERE key = ?1;",
                    [owned_key.as_str()],
                    |row| row.get(0),
                )
                .optional()
            })
            .await?;

        match stored {
            None => Ok(None),
            Some(raw) => serde_json::from_str(&raw).map(Some).map_err(|e| ConfigError::BadValue {
                key: key.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    pub async fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> Result<T, ConfigError> {
        Ok(self.get(key).await?.unwrap_or(default))
    }

    pub async fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<(), ConfigError> {
        let key = key.to_string();
        let encoded = serde_json::to_string(value).map_err(|e| ConfigError::BadValue {
            key: key.clone(),
            reason: e.to_string(),
        })?;
        self.db
            .with(move |conn| {
                conn.execute(
                    "INSERT INTO config (key, value) VALUES (?1, ?2)
                     ON CONFLICT (key) DO UPDATE SET value = excluded.value;",
                    [key.as_str(), encoded.as_str()],
                )
            })
            .await?;
        Ok(())
    }

    pub async fn remove(&self, key: &str) -> Result<(), ConfigError> {
        let key = key.to_string();
        self.db
            .with(move |conn| conn.execute("DELETE FROM config WHERE key = ?1;", [key.as_str()]))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn controller() -> ConfigController {
        ConfigController::new(Database::open_in_memory().unwrap())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn values_round_trip_as_json() {
        let config = controller().await;

        config.set("cloud_enabled", &true).await.unwrap();
        config.set("check_url", &"https://cloud.example/check").await.unwrap();
        config.set("sleep_time", &30u64).await.unwrap();

        assert_eq!(config.get::<bool>("cloud_enabled").await.unwrap(), Some(true));
        assert_eq!(
            config.get::<String>("check_url").await.unwrap().as_deref(),
            Some("https://cloud.example/check")
        );
        assert_eq!(config.get::<u64>("sleep_time").await.unwrap(), Some(30));
        assert_eq!(config.get::<u64>("missing").await.unwrap(), None);
        assert_eq!(config.get_or("missing", 7u64).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn set_overwrites_and_remove_deletes() {
        let config = controller().await;
        config.set("sleep_time", &30u64).await.unwrap();
        config.set("sleep_time", &60u64).await.unwrap();
        assert_eq!(config.get::<u64>("sleep_time").await.unwrap(), Some(60));

        config.remove("sleep_time").await.unwrap();
        assert_eq!(config.get::<u64>("sleep_time").await.unwrap(), None);
    }

    #[tokio::test]
    async fn type_mismatches_surface_as_bad_values() {
        let config = controller().await;
        config.set("sleep_time", &"soon").await.unwrap();
        assert!(matches!(
            config.get::<u64>("sleep_time").await,
            Err(ConfigError::BadValue { .. })
        ));
    }
}
