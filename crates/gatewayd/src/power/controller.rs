//! Registry of the power modules known on the bus.

use rusqlite::OptionalExtension;

use super::PowerError;
use super::api;
use crate::storage::Database;

/// One registered power module with its per-port configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct PowerModule {
    pub id: i64,
    pub name: String,
    pub address: u8,
    pub version: u8,
    pub inputs: Vec<String>,
    pub sensors: Vec<i64>,
    /// 14 comma separated `HH:MM` boundaries per port (7 days of
    /// start/stop), `None` when never configured.
    pub times: Vec<Option<String>>,
    pub inverted: Vec<bool>,
}

#[derive(Clone)]
pub struct PowerController {
    db: Database,
}

impl PowerController {
    pub async fn new(db: Database) -> Result<Self, PowerError> {
        let mut columns = vec![
            "id INTEGER PRIMARY KEY".to_string(),
            "name TEXT default ''".to_string(),
            "address INTEGER".to_string(),
            "version INTEGER".to_string(),
        ];
        for port in 0..12 {
            columns.push(format!("input{port} TEXT default ''"));
            columns.push(format!("sensor{port} INT default 0"));
            columns.push(format!("times{port} TEXT"));
            columns.push(format!("inverted{port} INT default 0"));
        }
        let schema = format!("CREATE TABLE IF NOT EXISTS power_modules ({});", columns.join(", "));
        db.with(move |conn| conn.execute_batch(&schema)).await?;

        Ok(Self { db })
    }

    pub async fn get_power_modules(&self) -> Result<Vec<PowerModule>, PowerError> {
        let rows = self
            .db
            .with(|conn| {
                let mut fields = vec![
                    "id".to_string(),
                    "name".to_string(),
                    "address".to_string(),
                    "version".to_string(),
                ];
                for port in 0..12 {
                    fields.push(format!("input{port}"));
                    fields.push(format!("sensor{port}"));
                    fields.push(format!("times{port}"));
                    fields.push(format!("inverted{port}"));
                }
                let query = format!("SELECT {} FROM power_modules ORDER BY id;", fields.join(", "));
                let mut statement = conn.prepare(&query)?;
                let rows = statement
                    .query_map([], |row| {
                        let id: i64 = row.get(0)?;
                        let name: String = row.get(1)?;
                        let address: i64 = row.get(2)?;
                        let version: i64 = row.get(3)?;
                        let mut inputs = Vec::new();
                        let mut sensors = Vec::new();
                        let mut times = Vec::new();
                        let mut inverted = Vec::new();
                        for port in 0..12 {
                            inputs.push(row.get::<_, Option<String>>(4 + port * 4)?.unwrap_or_default());
                            sensors.push(row.get::<_, Option<i64>>(5 + port * 4)?.unwrap_or(0));
                            times.push(row.get::<_, Option<String>>(6 + port * 4)?);
                            inverted.push(row.get::<_, Option<i64>>(7 + port * 4)?.unwrap_or(0) != 0);
                        }
                        Ok((id, name, address, version, inputs, sensors, times, inverted))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        let mut modules = Vec::with_capacity(rows.len());
        for (id, name, address, version, mut inputs, mut sensors, mut times, mut inverted) in rows {
            let version = version as u8;
            let ports = api::num_ports(version)?;
            inputs.truncate(ports);
            sensors.truncate(ports);
            times.truncate(ports);
            inverted.truncate(ports);
            modules.push(PowerModule {
                id,
                name,
                address: address as u8,
                version,
                inputs,
                sensors,
                times,
                inverted,
            });
        }
        Ok(modules)
    }

    pub async fn get_address(&self, id: i64) -> Result<Option<u8>, PowerError> {
        let address: Option<i64> = self
            .db
            .with(move |conn| {
                conn.query_row("SELECT address FROM power_modules WHERE id = ?1;", [id], |row| {
                    row.get(0)
                })
                .optional()
            })
            .await?;
        Ok(address.map(|a| a as u8))
    }

    pub async fn get_version(&self, id: i64) -> Result<Option<u8>, PowerError> {
        let version: Option<i64> = self
            .db
            .with(move |conn| {
                conn.query_row("SELECT version FROM power_modules WHERE id = ?1;", [id], |row| {
                    row.get(0)
                })
                .optional()
            })
            .await?;
        Ok(version.map(|v| v as u8))
    }

    pub async fn module_exists(&self, address: u8) -> Result<bool, PowerError> {
        let count: i64 = self
            .db
            .with(move |conn| {
                conn.query_row(
                    "SELECT count(id) FROM power_modules WHERE address = ?1;",
                    [i64::from(address)],
                    |row| row.get(0),
                )
            })
            .await?;
        Ok(count > 0)
    }

    pub async fn register_power_module(&self, address: u8, version: u8) -> Result<(), PowerError> {
        self.db
            .with(move |conn| {
                conn.execute(
                    "INSERT INTO power_modules (address, version) VALUES (?1, ?2);",
                    [i64::from(address), i64::from(version)],
                )
            })
            .await?;
        Ok(())
    }

    pub async fn readdress_power_module(&self, old: u8, new: u8) -> Result<(), PowerError> {
        self.db
            .with(move |conn| {
                conn.execute(
                    "UPDATE power_modules SET address = ?1 WHERE address = ?2;",
                    [i64::from(new), i64::from(old)],
                )
            })
            .await?;
        Ok(())
    }

    /// Update the name and per-port configuration of a module.
    pub async fn update_power_module(&self, module: &PowerModule) -> Result<(), PowerError> {
        let ports = api::num_ports(module.version)?;
        let module = module.clone();
        self.db
            .with(move |conn| {
                let mut assignments = vec!["name = ?".to_string()];
                let mut values: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(module.name.clone())];
                for port in 0..ports {
                    assignments.push(format!("input{port} = ?"));
                    values.push(Box::new(module.inputs.get(port).cloned().unwrap_or_default()));
                    assignments.push(format!("sensor{port} = ?"));
                    values.push(Box::new(module.sensors.get(port).copied().unwrap_or(0)));
                    assignments.push(format!("times{port} = ?"));
                    values.push(Box::new(module.times.get(port).cloned().flatten()));
                    assignments.push(format!("inverted{port} = ?"));
                    values.push(Box::new(i64::from(
                        module.inverted.get(port).copied().unwrap_or(false),
                    )));
                }
                values.push(Box::new(module.id));

                let query = format!(
                    "UPDATE power_modules SET {} WHERE id = ?;",
                    assignments.join(", ")
                );
                conn.execute(&query, rusqlite::params_from_iter(values.iter().map(|v| v.as_ref())))
            })
            .await?;
        Ok(())
    }

    /// The next unused bus address, starting from 1 and wrapping at 255.
    pub async fn get_free_address(&self) -> Result<u8, PowerError> {
        let max: Option<i64> = self
            .db
            .with(|conn| conn.query_row("SELECT max(address) FROM power_modules;", [], |row| row.get(0)))
            .await?;
        let max = max.unwrap_or(0);
        Ok(if max < 255 { (max + 1) as u8 } else { 1 })
    }
}
