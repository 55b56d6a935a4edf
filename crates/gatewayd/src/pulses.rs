//! Unified view over the master's physical pulse counters and the virtual
//! ones persisted in SQLite.
//!
//! Ids below [`MASTER_PULSE_COUNTERS`] are physical (configured through the
//! EEPROM model, counted by the master); everything above is virtual, with
//! values pushed in by external callers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::eeprom::controller::EepromController;
use crate::eeprom::models::{self, ModelRecord};
use crate::eeprom::types::ModelValue;
use crate::gateway::GatewayError;
use crate::master::{api, Fields, MasterCommunicator};
use crate::serial::SerialTransport;
use crate::storage::Database;

pub const MASTER_PULSE_COUNTERS: u16 = 24;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(1);

/// Configuration of one counter, physical or virtual.
#[derive(Debug, Clone, PartialEq)]
pub struct PulseCounterConfig {
    pub id: u16,
    pub name: String,
    /// Linked input; -1 for none (always -1 for virtual counters).
    pub input: i16,
    pub room: u8,
    pub persistent: bool,
}

pub struct PulseCounterController<T: SerialTransport> {
    db: Database,
    master: MasterCommunicator<T>,
    eeprom: Arc<EepromController<T>>,
    counts: std::sync::Mutex<HashMap<u16, u32>>,
}

impl<T: SerialTransport> PulseCounterController<T> {
    pub async fn new(
        db: Database,
        master: MasterCommunicator<T>,
        eeprom: Arc<EepromController<T>>,
    ) -> Result<Self, GatewayError> {
        db.with(|conn| {
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS pulse_counters
                 (id INTEGER PRIMARY KEY, name TEXT, room INTEGER, persistent INTEGER);",
            )
        })
        .await
        .map_err(crate::eeprom::EepromError::from)?;

        Ok(Self {
            db,
            master,
            eeprom,
            counts: std::sync::Mutex::new(HashMap::new()),
        })
    }

    /// Grow or shrink the virtual counter range so ids run in `[0, amount)`.
    pub async fn set_amount(&self, amount: u16) -> Result<(), GatewayError> {
        if amount < MASTER_PULSE_COUNTERS {
            return Err(GatewayError::InvalidValue(format!(
                "amount should be {MASTER_PULSE_COUNTERS} or more"
            )));
        }

        self.db
            .with(move |conn| {
                for id in MASTER_PULSE_COUNTERS..amount {
                    conn.execute(
                        "INSERT INTO pulse_counters (id, name, room, persistent)
                         SELECT ?1, '', 255, 0
                         WHERE NOT EXISTS (SELECT 1 FROM pulse_counters WHERE id = ?1);",
                        [i64::from(id)],
                    )?;
                }
                conn.execute(
                    "DELETE FROM pulse_counters WHERE id >= ?1;",
                    [i64::from(amount)],
                )?;
                Ok(())
            })
            .await
            .map_err(crate::eeprom::EepromError::from)?;
        Ok(())
    }

    pub async fn get_amount(&self) -> Result<u16, GatewayError> {
        let max_id: Option<i64> = self
            .db
            .with(|conn| conn.query_row("SELECT max(id) FROM pulse_counters;", [], |row| row.get(0)))
            .await
            .map_err(crate::eeprom::EepromError::from)?;
        Ok(match max_id {
            Some(max_id) => (max_id + 1) as u16,
            None => MASTER_PULSE_COUNTERS,
        })
    }

    async fn check_id(&self, id: u16, must_be_virtual: bool) -> Result<(), GatewayError> {
        if must_be_virtual && id < MASTER_PULSE_COUNTERS {
            return Err(GatewayError::InvalidValue(format!(
                "cannot set pulse counter status for {id} (should be >= {MASTER_PULSE_COUNTERS})"
            )));
        }
        if id >= self.get_amount().await? {
            return Err(GatewayError::InvalidValue(format!("could not find pulse counter {id}")));
        }
        Ok(())
    }

    /// Push the value of a virtual counter.
    pub async fn set_status(&self, id: u16, value: u32) -> Result<(), GatewayError> {
        self.check_id(id, true).await?;
        self.counts.lock().unwrap().insert(id, value);
        Ok(())
    }

    /// Values of all counters, physical first, ordered by id.
    pub async fn get_status(&self) -> Result<Vec<u32>, GatewayError> {
        let fields = self
            .master
            .do_command(&api::pulse_list(), &Fields::new(), COMMAND_TIMEOUT)
            .await?;

        let mut values = Vec::new();
        for name in api::PULSE_VALUE_NAMES {
            values.push(u32::from(fields.word(name)?));
        }

        let virtual_ids: Vec<u16> = self
            .db
            .with(|conn| {
                let mut statement = conn.prepare("SELECT id FROM pulse_counters ORDER BY id ASC;")?;
                let ids = statement
                    .query_map([], |row| row.get::<_, i64>(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(ids)
            })
            .await
            .map_err(crate::eeprom::EepromError::from)?
            .into_iter()
            .map(|id| id as u16)
            .collect();

        let counts = self.counts.lock().unwrap();
        for id in virtual_ids {
            values.push(counts.get(&id).copied().unwrap_or(0));
        }
        Ok(values)
    }

    fn config_from_record(record: &ModelRecord) -> PulseCounterConfig {
        let name = record
            .get("name")
            .and_then(ModelValue::as_str)
            .unwrap_or_default()
            .to_string();
        let input = record
            .get("input")
            .and_then(ModelValue::as_byte)
            .map(|input| if input == 255 { -1 } else { i16::from(input) })
            .unwrap_or(-1);
        let room = record.get("room").and_then(ModelValue::as_byte).unwrap_or(255);
        PulseCounterConfig {
            id: record.id.unwrap_or_default(),
            name,
            input,
            room,
            persistent: false,
        }
    }

    async fn virtual_config(&self, id: u16) -> Result<Option<PulseCounterConfig>, GatewayError> {
        let row: Option<(String, i64, i64)> = self
            .db
            .with(move |conn| {
                use rusqlite::OptionalExtension;
                conn.query_row(
                    "SELECT name, room, persistent FROM pulse_counters WHERE id = ?1;",
                    [i64::from(id)],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()
            })
            .await
            .map_err(crate::eeprom::EepromError::from)?;

        Ok(row.map(|(name, room, persistent)| PulseCounterConfig {
            id,
            name,
            input: -1,
            room: room as u8,
            persistent: persistent >= 1,
        }))
    }

    pub async fn get_configuration(&self, id: u16) -> Result<PulseCounterConfig, GatewayError> {
        self.check_id(id, false).await?;

        if id < MASTER_PULSE_COUNTERS {
            let record = self
                .eeprom
                .read(&models::pulse_counter_configuration(), Some(id), None)
                .await?;
            return Ok(Self::config_from_record(&record));
        }

        self.virtual_config(id)
            .await?
            .ok_or_else(|| GatewayError::InvalidValue(format!("could not find pulse counter {id}")))
    }

    pub async fn get_configurations(&self) -> Result<Vec<PulseCounterConfig>, GatewayError> {
        let records = self
            .eeprom
            .read_all(&models::pulse_counter_configuration(), None)
            .await?;
        let mut configs: Vec<PulseCounterConfig> =
            records.iter().map(Self::config_from_record).collect();

        for id in MASTER_PULSE_COUNTERS..self.get_amount().await? {
            if let Some(config) = self.virtual_config(id).await? {
                configs.push(config);
            }
        }
        Ok(configs)
    }

    pub async fn set_configuration(&self, config: &PulseCounterConfig) -> Result<(), GatewayError> {
        self.check_id(config.id, false).await?;

        if config.id < MASTER_PULSE_COUNTERS {
            let input = if config.input < 0 { 255 } else { config.input as u8 };
            let record = ModelRecord::new("pulse_counter_configuration", Some(config.id))
                .set("name", ModelValue::String(config.name.clone()))
                .set("input", ModelValue::Byte(input))
                .set("room", ModelValue::Byte(config.room));
            self.eeprom
                .write(&models::pulse_counter_configuration(), &record)
                .await?;
            return Ok(());
        }

        if config.input != -1 {
            return Err(GatewayError::InvalidValue(format!(
                "virtual pulse counter {} can only have input -1",
                config.id
            )));
        }
        let config = config.clone();
        self.db
            .with(move |conn| {
                conn.execute(
                    "UPDATE pulse_counters SET name = ?1, room = ?2, persistent = ?3 WHERE id = ?4;",
                    rusqlite::params![
                        config.name,
                        i64::from(config.room),
                        i64::from(config.persistent),
                        i64::from(config.id)
                    ],
                )
            })
            .await
            .map_err(crate::eeprom::EepromError::from)?;
        Ok(())
    }

    /// Persistence flags for all counters; physical counters always persist.
    pub async fn get_persistence(&self) -> Result<Vec<bool>, GatewayError> {
        let mut flags = vec![true; usize::from(MASTER_PULSE_COUNTERS)];
        let stored: Vec<i64> = self
            .db
            .with(|conn| {
                let mut statement =
                    conn.prepare("SELECT persistent FROM pulse_counters ORDER BY id ASC;")?;
                let rows = statement
                    .query_map([], |row| row.get(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
            .map_err(crate::eeprom::EepromError::from)?;
        flags.extend(stored.into_iter().map(|flag| flag >= 1));
        Ok(flags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eeprom::extension::EepromExtension;
    use crate::eeprom::file::EepromFile;
    use crate::eeprom::testutil::{blank_banks, install_eeprom_responder, set_bank_bytes};
    use crate::master::command::MasterCommandSpec;
    use crate::master::communicator::MasterOptions;
    use crate::master::Value;
    use crate::serial::MockSerial;

    async fn controller() -> (Arc<MockSerial>, PulseCounterController<MockSerial>) {
        let serial = Arc::new(MockSerial::new());
        let banks = blank_banks();
        set_bank_bytes(&banks, 195, 0, b"water");
        install_eeprom_responder(&serial, banks);

        let master = MasterCommunicator::new(
            serial.clone(),
            MasterOptions {
                init_master: false,
                ..MasterOptions::default()
            },
        );
        master.start().await.unwrap();

        let extension = EepromExtension::new(Database::open_in_memory().unwrap())
            .await
            .unwrap();
        let eeprom = Arc::new(EepromController::new(EepromFile::new(master.clone()), extension));

        let controller = PulseCounterController::new(
            Database::open_in_memory().unwrap(),
            master,
            eeprom,
        )
        .await
        .unwrap();
        (serial, controller)
    }

    fn pulse_reply(spec: &MasterCommandSpec, cid: u8, values: &[u16]) -> Vec<u8> {
        let mut fields = Fields::new();
        for (name, value) in api::PULSE_VALUE_NAMES.iter().zip(values) {
            fields.insert(name, Value::Word(*value));
        }
        spec.create_output(cid, &fields).unwrap()
    }

    #[tokio::test]
    async fn amount_grows_and_shrinks_the_virtual_range() {
        let (_serial, controller) = controller().await;
        assert_eq!(controller.get_amount().await.unwrap(), 24);

        controller.set_amount(28).await.unwrap();
        assert_eq!(controller.get_amount().await.unwrap(), 28);

        controller.set_amount(25).await.unwrap();
        assert_eq!(controller.get_amount().await.unwrap(), 25);

        assert!(controller.set_amount(10).await.is_err());
    }

    #[tokio::test]
    async fn virtual_status_needs_a_virtual_id() {
        let (_serial, controller) = controller().await;
        controller.set_amount(26).await.unwrap();

        assert!(controller.set_status(3, 10).await.is_err());
        assert!(controller.set_status(30, 10).await.is_err());
        controller.set_status(25, 10).await.unwrap();
    }

    #[tokio::test]
    async fn status_combines_master_and_virtual_counters() {
        let (serial, controller) = controller().await;
        controller.set_amount(26).await.unwrap();
        controller.set_status(24, 7).await.unwrap();

        let spec = api::pulse_list();
        let mut values = [0u16; 24];
        values[0] = 11;
        values[23] = 13;
        // The next master command uses cid 1.
        let request = spec.create_input(1, &Fields::new()).unwrap();
        serial.expect(&request, &pulse_reply(&spec, 1, &values));

        let status = controller.get_status().await.unwrap();
        assert_eq!(status.len(), 26);
        assert_eq!(status[0], 11);
        assert_eq!(status[23], 13);
        assert_eq!(status[24], 7);
        assert_eq!(status[25], 0);
    }

    #[tokio::test]
    async fn physical_configuration_reads_the_eeprom_model() {
        let (_serial, controller) = controller().await;
        let config = controller.get_configuration(0).await.unwrap();
        assert_eq!(config.name, "water");
        assert_eq!(config.input, -1); // 0xff in eeprom means unlinked
        assert!(!config.persistent);
    }

    #[tokio::test]
    async fn virtual_configuration_round_trips() {
        let (_serial, controller) = controller().await;
        controller.set_amount(26).await.unwrap();

        let config = PulseCounterConfig {
            id: 25,
            name: "rainwater".to_string(),
            input: -1,
            room: 3,
            persistent: true,
        };
        controller.set_configuration(&config).await.unwrap();

        let read_back = controller.get_configuration(25).await.unwrap();
        assert_eq!(read_back, config);

        let persistence = controller.get_persistence().await.unwrap();
        assert_eq!(persistence.len(), 26);
        assert!(persistence[0]);
        assert!(!persistence[24]);
        assert!(persistence[25]);
    }

    #[tokio::test]
    async fn virtual_counters_reject_inputs() {
        let (_serial, controller) = controller().await;
        controller.set_amount(25).await.unwrap();

        let config = PulseCounterConfig {
            id: 24,
            name: "x".to_string(),
            input: 3,
            room: 255,
            persistent: false,
        };
        assert!(matches!(
            controller.set_configuration(&config).await,
            Err(GatewayError::InvalidValue(_))
        ));
    }

    #[tokio::test]
    async fn configurations_list_physical_then_virtual() {
        let (_serial, controller) = controller().await;
        controller.set_amount(25).await.unwrap();

        let configs = controller.get_configurations().await.unwrap();
        assert_eq!(configs.len(), 25);
        assert_eq!(configs[0].name, "water");
        assert_eq!(configs[24].input, -1);
    }
}
