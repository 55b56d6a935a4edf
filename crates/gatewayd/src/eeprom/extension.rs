//! Side table for model fields that do not live in device EEPROM.
//!
//! Values are stored per `(model, id, field)`; a missing row decodes to the
//! field type's default (255 for bytes, the empty string for strings).

use rusqlite::OptionalExtension;

use super::EepromError;
use super::types::ModelValue;
use crate::storage::Database;

/// Ext field kind; mirrored by the model descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtKind {
    Byte,
    String,
}

impl ExtKind {
    fn default_value(&self) -> ModelValue {
        match self {
            ExtKind::Byte => ModelValue::Byte(255),
            ExtKind::String => ModelValue::String(String::new()),
        }
    }
}

pub struct EepromExtension {
    db: Database,
}

impl EepromExtension {
    pub async fn new(db: Database) -> Result<Self, EepromError> {
        db.with(|conn| {
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS eeprom_extensions (
                     model TEXT NOT NULL,
                     id INTEGER NOT NULL,
                     field TEXT NOT NULL,
                     value TEXT,
                     PRIMARY KEY (model, id, field)
                 );",
            )
        })
        .await?;
        Ok(Self { db })
    }

    pub async fn read_value(
        &self,
        model: &'static str,
        id: Option<u16>,
        field: &'static str,
        kind: ExtKind,
    ) -> Result<ModelValue, EepromError> {
        let id = i64::from(id.unwrap_or(0));
        let stored: Option<String> = self
            .db
            .with(move |conn| {
                conn.query_row(
                    "SELECT value FROM eeprom_extensions WHERE model = ?1 AND id = ?2 AND field = ?3;",
                    rusqlite::params![model, id, field],
                    |row| row.get(0),
                )
                .optional()
            })
            .await?;

        let Some(stored) = stored else {
            return Ok(kind.default_value());
        };

        match kind {
            ExtKind::Byte => {
                let byte = stored.parse::<u8>().map_err(|_| EepromError::Codec {
                    field: field.to_string(),
                    reason: format!("stored value {stored:?} is not a byte"),
                })?;
                Ok(ModelValue::Byte(byte))
            }
            ExtKind::String => Ok(ModelValue::String(stored)),
        }
    }

    pub async fn write_value(
        &self,
        model: &'static str,
        id: Option<u16>,
        field: &'static str,
        value: &ModelValue,
    ) -> Result<(), EepromError> {
        let stored = match value {
            ModelValue::Byte(v) => v.to_string(),
            ModelValue::String(v) => v.clone(),
            other => {
                return Err(EepromError::Codec {
                    field: field.to_string(),
                    reason: format!("value {other:?} is not storable in the extension table"),
                });
            }
        };

        let id = i64::from(id.unwrap_or(0));
        self.db
            .with(move |conn| {
                conn.execute(
                    "INSERT INTO eeprom_extensions (model, id, field, value) VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT (model, id, field) DO UPDATE SET value = excluded.value;",
                    rusqlite::params![model, id, field, stored],
                )
            })
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn extension() -> EepromExtension {
        EepromExtension::new(Database::open_in_memory().unwrap())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn missing_rows_decode_to_defaults() {
        let ext = extension().await;
        assert_eq!(
            ext.read_value("output", Some(3), "room", ExtKind::Byte).await.unwrap(),
            ModelValue::Byte(255)
        );
        assert_eq!(
            ext.read_value("output", Some(3), "tag", ExtKind::String).await.unwrap(),
            ModelValue::String(String::new())
        );
    }

    #[tokio::test]
    async fn values_round_trip_and_update() {
        let ext = extension().await;
        ext.write_value("output", Some(3), "room", &ModelValue::Byte(7))
            .await
            .unwrap();
        assert_eq!(
            ext.read_value("output", Some(3), "room", ExtKind::Byte).await.unwrap(),
            ModelValue::Byte(7)
        );

        ext.write_value("output", Some(3), "room", &ModelValue::Byte(9))
            .await
            .unwrap();
        assert_eq!(
            ext.read_value("output", Some(3), "room", ExtKind::Byte).await.unwrap(),
            ModelValue::Byte(9)
        );

        // Other ids are untouched.
        assert_eq!(
            ext.read_value("output", Some(4), "room", ExtKind::Byte).await.unwrap(),
            ModelValue::Byte(255)
        );
    }

    #[tokio::test]
    async fn id_less_models_share_the_zero_row() {
        let ext = extension().await;
        ext.write_value("global", None, "label", &ModelValue::String("attic".into()))
            .await
            .unwrap();
        assert_eq!(
            ext.read_value("global", None, "label", ExtKind::String).await.unwrap(),
            ModelValue::String("attic".into())
        );
    }
}
