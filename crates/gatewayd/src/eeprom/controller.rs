//! Reads and writes model instances through the EEPROM file and the
//! extension store.

use super::EepromError;
use super::extension::EepromExtension;
use super::file::EepromFile;
use super::models::{EepromModelSpec, FieldKind, ModelRecord};
use super::types::{EepromData, ModelValue};
use crate::serial::SerialTransport;

pub struct EepromController<T: SerialTransport> {
    file: EepromFile<T>,
    extension: EepromExtension,
}

impl<T: SerialTransport> EepromController<T> {
    pub fn new(file: EepromFile<T>, extension: EepromExtension) -> Self {
        Self { file, extension }
    }

    pub fn file(&self) -> &EepromFile<T> {
        &self.file
    }

    /// The maximum id of an id-keyed model, resolving a dynamic maximum
    /// through the file.
    pub async fn get_max_id(&self, spec: &EepromModelSpec) -> Result<u16, EepromError> {
        let id_spec = spec.id.as_ref().ok_or(EepromError::MissingId(spec.name))?;
        let Some(address) = id_spec.address else {
            return Ok(id_spec.max_id);
        };
        if address.length != 1 {
            return Err(EepromError::BadMaxIdAddress(spec.name));
        }

        let data = self.file.read(&[address]).await?;
        Ok(u16::from(data[0].bytes[0]) * id_spec.multiplier)
    }

    async fn check_id(&self, spec: &EepromModelSpec, id: Option<u16>) -> Result<(), EepromError> {
        spec.check_id(id)?;
        if let (Some(id_spec), Some(id)) = (&spec.id, id)
            && id_spec.address.is_some()
        {
            let max = self.get_max_id(spec).await?;
            if id >= max {
                return Err(EepromError::IdOutOfRange { model: spec.name, id, max });
            }
        }
        Ok(())
    }

    /// Read one model instance; `fields` restricts the decoded field set.
    pub async fn read(
        &self,
        spec: &EepromModelSpec,
        id: Option<u16>,
        fields: Option<&[&str]>,
    ) -> Result<ModelRecord, EepromError> {
        self.check_id(spec, id).await?;
        self.read_unchecked(spec, id, fields).await
    }

    async fn read_unchecked(
        &self,
        spec: &EepromModelSpec,
        id: Option<u16>,
        fields: Option<&[&str]>,
    ) -> Result<ModelRecord, EepromError> {
        let selected = spec.selected_fields(fields)?;

        let mut addresses = Vec::new();
        for field in &selected {
            addresses.extend(field.addresses(spec.name, id)?);
        }
        let data = self.file.read(&addresses).await?;

        let mut record = ModelRecord::new(spec.name, id);
        let mut cursor = data.into_iter();
        for field in selected {
            let value = match &field.kind {
                FieldKind::Eeprom { ty, .. } => {
                    let piece = cursor.next().expect("address list matches field list");
                    ty.decode(field.name, &piece.bytes)?
                }
                FieldKind::Composite(entries) => {
                    let mut values = Vec::with_capacity(entries.len());
                    for entry in entries {
                        let piece = cursor.next().expect("address list matches field list");
                        values.push(entry.ty.decode(entry.name, &piece.bytes)?);
                    }
                    ModelValue::Composite(values)
                }
                FieldKind::Ext(kind) => {
                    self.extension.read_value(spec.name, id, field.name, *kind).await?
                }
            };
            record.values.insert(field.name, value);
        }

        Ok(record)
    }

    /// Read several instances in one pass over the file.
    pub async fn read_batch(
        &self,
        spec: &EepromModelSpec,
        ids: &[u16],
        fields: Option<&[&str]>,
    ) -> Result<Vec<ModelRecord>, EepromError> {
        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            self.check_id(spec, Some(*id)).await?;
        }
        for id in ids {
            records.push(self.read_unchecked(spec, Some(*id), fields).await?);
        }
        Ok(records)
    }

    /// Read every instance of an id-keyed model.
    pub async fn read_all(
        &self,
        spec: &EepromModelSpec,
        fields: Option<&[&str]>,
    ) -> Result<Vec<ModelRecord>, EepromError> {
        let max_id = self.get_max_id(spec).await?;
        let ids: Vec<u16> = (0..max_id).collect();
        self.read_batch(spec, &ids, fields).await
    }

    /// Write one model instance. Read-only fields are skipped; ext fields go
    /// to the extension store.
    pub async fn write(
        &self,
        spec: &EepromModelSpec,
        record: &ModelRecord,
    ) -> Result<(), EepromError> {
        self.write_batch(spec, std::slice::from_ref(record)).await
    }

    pub async fn write_batch(
        &self,
        spec: &EepromModelSpec,
        records: &[ModelRecord],
    ) -> Result<(), EepromError> {
        let mut data: Vec<EepromData> = Vec::new();
        let mut ext_writes = Vec::new();

        for record in records {
            self.check_id(spec, record.id).await?;

            for field in &spec.fields {
                if field.read_only {
                    continue;
                }
                let Some(value) = record.get(field.name) else {
                    continue;
                };

                match &field.kind {
                    FieldKind::Eeprom { ty, addr } => {
                        let address = addr.resolve(spec.name, record.id, ty.length())?;
                        let bytes = ty.encode(field.name, value)?;
                        data.push(EepromData::new(address, bytes)?);
                    }
                    FieldKind::Composite(entries) => {
                        let ModelValue::Composite(values) = value else {
                            return Err(EepromError::Codec {
                                field: field.name.to_string(),
                                reason: "expected a composite value".to_string(),
                            });
                        };
                        if values.len() != entries.len() {
                            return Err(EepromError::Codec {
                                field: field.name.to_string(),
                                reason: format!(
                                    "expected {} sub-values, got {}",
                                    entries.len(),
                                    values.len()
                                ),
                            });
                        }
                        for (entry, sub_value) in entries.iter().zip(values) {
                            let address = entry.addr.resolve(spec.name, record.id, entry.ty.length())?;
                            let bytes = entry.ty.encode(entry.name, sub_value)?;
                            data.push(EepromData::new(address, bytes)?);
                        }
                    }
                    FieldKind::Ext(_) => {
                        ext_writes.push((record.id, field.name, value.clone()));
                    }
                }
            }
        }

        if !data.is_empty() {
            self.file.write(&data).await?;
        }
        for (id, field, value) in ext_writes {
            self.extension.write_value(spec.name, id, field, &value).await?;
        }
        Ok(())
    }
}
