//! Model descriptors: each model is a value describing its fields, their
//! codecs and where they live in the EEPROM (or in the extension table).

use std::collections::HashMap;

use super::EepromError;
use super::extension::ExtKind;
use super::types::{AddrGen, EepromAddress, EepromDataType, ModelValue};

/// Declares that a model is keyed by an id.
#[derive(Debug, Clone)]
pub struct EepromIdSpec {
    /// Static upper bound for the id.
    pub max_id: u16,
    /// Optional address of the dynamic maximum (length must be 1).
    pub address: Option<EepromAddress>,
    /// Multiplier applied to the dynamic maximum.
    pub multiplier: u16,
}

impl EepromIdSpec {
    pub fn fixed(max_id: u16) -> Self {
        Self { max_id, address: None, multiplier: 1 }
    }

    pub fn dynamic(max_id: u16, address: EepromAddress, multiplier: u16) -> Self {
        Self { max_id, address: Some(address), multiplier }
    }
}

#[derive(Debug, Clone)]
pub struct CompositeEntry {
    pub name: &'static str,
    pub ty: EepromDataType,
    pub addr: AddrGen,
}

impl CompositeEntry {
    pub fn new(name: &'static str, ty: EepromDataType, addr: AddrGen) -> Self {
        Self { name, ty, addr }
    }
}

#[derive(Debug, Clone)]
pub enum FieldKind {
    Eeprom { ty: EepromDataType, addr: AddrGen },
    Composite(Vec<CompositeEntry>),
    Ext(ExtKind),
}

#[derive(Debug, Clone)]
pub struct ModelField {
    pub name: &'static str,
    pub kind: FieldKind,
    /// Read-only fields participate in reads but are skipped on writes.
    pub read_only: bool,
}

impl ModelField {
    pub fn eeprom(name: &'static str, ty: EepromDataType, addr: AddrGen) -> Self {
        Self { name, kind: FieldKind::Eeprom { ty, addr }, read_only: false }
    }

    pub fn eeprom_ro(name: &'static str, ty: EepromDataType, addr: AddrGen) -> Self {
        Self { name, kind: FieldKind::Eeprom { ty, addr }, read_only: true }
    }

    pub fn composite(name: &'static str, entries: Vec<CompositeEntry>) -> Self {
        Self { name, kind: FieldKind::Composite(entries), read_only: false }
    }

    pub fn ext_byte(name: &'static str) -> Self {
        Self { name, kind: FieldKind::Ext(ExtKind::Byte), read_only: false }
    }

    pub fn ext_string(name: &'static str) -> Self {
        Self { name, kind: FieldKind::Ext(ExtKind::String), read_only: false }
    }

    /// EEPROM addresses this field occupies, in declaration order.
    pub fn addresses(
        &self,
        model: &'static str,
        id: Option<u16>,
    ) -> Result<Vec<EepromAddress>, EepromError> {
        match &self.kind {
            FieldKind::Eeprom { ty, addr } => Ok(vec![addr.resolve(model, id, ty.length())?]),
            FieldKind::Composite(entries) => entries
                .iter()
                .map(|entry| entry.addr.resolve(model, id, entry.ty.length()))
                .collect(),
            FieldKind::Ext(_) => Ok(Vec::new()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EepromModelSpec {
    pub name: &'static str,
    pub id: Option<EepromIdSpec>,
    pub fields: Vec<ModelField>,
}

impl EepromModelSpec {
    /// Validate the id against this model's declaration and static maximum.
    pub fn check_id(&self, id: Option<u16>) -> Result<(), EepromError> {
        match (&self.id, id) {
            (None, None) => Ok(()),
            (None, Some(_)) => Err(EepromError::UnexpectedId(self.name)),
            (Some(_), None) => Err(EepromError::MissingId(self.name)),
            (Some(spec), Some(id)) => {
                if id > spec.max_id {
                    Err(EepromError::IdOutOfRange { model: self.name, id, max: spec.max_id })
                } else {
                    Ok(())
                }
            }
        }
    }

    pub fn field(&self, name: &str) -> Result<&ModelField, EepromError> {
        self.fields
            .iter()
            .find(|field| field.name == name)
            .ok_or_else(|| EepromError::UnknownField { model: self.name, field: name.to_string() })
    }

    /// The fields selected by `names`, or all fields.
    pub fn selected_fields(&self, names: Option<&[&str]>) -> Result<Vec<&ModelField>, EepromError> {
        match names {
            None => Ok(self.fields.iter().collect()),
            Some(names) => names.iter().map(|name| self.field(name)).collect(),
        }
    }
}

/// One decoded (or to-be-written) model instance.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelRecord {
    pub model: &'static str,
    pub id: Option<u16>,
    pub values: HashMap<&'static str, ModelValue>,
}

impl ModelRecord {
    pub fn new(model: &'static str, id: Option<u16>) -> Self {
        Self { model, id, values: HashMap::new() }
    }

    pub fn set(mut self, name: &'static str, value: ModelValue) -> Self {
        self.values.insert(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&ModelValue> {
        self.values.get(name)
    }
}

/// Configuration of one output (relay or dimmer channel).
pub fn output_configuration() -> EepromModelSpec {
    EepromModelSpec {
        name: "output_configuration",
        id: Some(EepromIdSpec::dynamic(240, EepromAddress::new(0, 2, 1), 8)),
        fields: vec![
            ModelField::eeprom_ro(
                "module_type",
                EepromDataType::String(1),
                AddrGen::per_id(|id| ((33 + id / 8) as u8, 0)),
            ),
            ModelField::eeprom(
                "name",
                EepromDataType::String(16),
                AddrGen::per_id(|id| ((33 + id / 8) as u8, (20 + 16 * (id % 8)) as u8)),
            ),
            ModelField::eeprom(
                "timer",
                EepromDataType::Word,
                AddrGen::per_id(|id| ((33 + id / 8) as u8, (4 + 2 * (id % 8)) as u8)),
            ),
            ModelField::eeprom(
                "type",
                EepromDataType::Byte,
                AddrGen::per_id(|id| ((33 + id / 8) as u8, (149 + id % 8) as u8)),
            ),
            ModelField::eeprom(
                "floor",
                EepromDataType::Byte,
                AddrGen::per_id(|id| ((33 + id / 8) as u8, (157 + id % 8) as u8)),
            ),
            ModelField::ext_byte("room"),
        ],
    }
}

/// Configuration of one input (switch or push button).
pub fn input_configuration() -> EepromModelSpec {
    EepromModelSpec {
        name: "input_configuration",
        id: Some(EepromIdSpec::dynamic(240, EepromAddress::new(0, 1, 1), 8)),
        fields: vec![
            ModelField::eeprom(
                "name",
                EepromDataType::String(8),
                AddrGen::per_id(|id| ((115 + id / 32) as u8, (8 * (id % 32)) as u8)),
            ),
            ModelField::eeprom(
                "action",
                EepromDataType::Byte,
                AddrGen::per_id(|id| ((123 + id / 32) as u8, (id % 32) as u8)),
            ),
            ModelField::eeprom(
                "basic_actions",
                EepromDataType::Actions(15),
                AddrGen::per_id(|id| ((76 + id / 8) as u8, (30 * (id % 8)) as u8)),
            ),
            ModelField::eeprom(
                "invert",
                EepromDataType::IBool,
                AddrGen::per_id(|id| (131, id as u8)),
            ),
            ModelField::ext_byte("room"),
        ],
    }
}

fn day_schedule(name: &'static str, bank: u8) -> ModelField {
    let entry = |entry_name, ty, slot: u16| {
        CompositeEntry::new(
            entry_name,
            ty,
            AddrGen::per_id(move |id| (bank, (id * 8 + slot) as u8)),
        )
    };
    ModelField::composite(
        name,
        vec![
            entry("temp_n", EepromDataType::Temp, 0),
            entry("start_d1", EepromDataType::Time, 1),
            entry("stop_d1", EepromDataType::Time, 2),
            entry("temp_d1", EepromDataType::Temp, 3),
            entry("start_d2", EepromDataType::Time, 4),
            entry("stop_d2", EepromDataType::Time, 5),
            entry("temp_d2", EepromDataType::Temp, 6),
        ],
    )
}

/// Configuration of one thermostat, including the weekly automatic program.
pub fn thermostat_configuration() -> EepromModelSpec {
    let block = |slot: u16| AddrGen::per_id(move |id| ((142 + id / 8) as u8, (32 * (id % 8) + slot) as u8));

    EepromModelSpec {
        name: "thermostat_configuration",
        id: Some(EepromIdSpec::fixed(24)),
        fields: vec![
            ModelField::eeprom("setp0", EepromDataType::Temp, block(0)),
            ModelField::eeprom("setp1", EepromDataType::Temp, block(1)),
            ModelField::eeprom("setp2", EepromDataType::Temp, block(2)),
            ModelField::eeprom("setp3", EepromDataType::Temp, block(3)),
            ModelField::eeprom("setp4", EepromDataType::Temp, block(4)),
            ModelField::eeprom("setp5", EepromDataType::Temp, block(5)),
            ModelField::eeprom("sensor", EepromDataType::Byte, block(6)),
            ModelField::eeprom("output0", EepromDataType::Byte, block(7)),
            ModelField::eeprom("output1", EepromDataType::Byte, block(8)),
            ModelField::eeprom("pid_p", EepromDataType::Byte, block(9)),
            ModelField::eeprom("pid_i", EepromDataType::Byte, block(10)),
            ModelField::eeprom("pid_d", EepromDataType::Byte, block(11)),
            ModelField::eeprom("pid_int", EepromDataType::Byte, block(12)),
            ModelField::eeprom(
                "name",
                EepromDataType::String(16),
                AddrGen::per_id(|id| ((187 + id / 16) as u8, (16 * (id % 16)) as u8)),
            ),
            day_schedule("auto_mon", 151),
            day_schedule("auto_tue", 152),
            day_schedule("auto_wed", 153),
            day_schedule("auto_thu", 154),
            day_schedule("auto_fri", 155),
            day_schedule("auto_sat", 156),
            day_schedule("auto_sun", 157),
            ModelField::ext_byte("room"),
        ],
    }
}

/// Configuration of one temperature/humidity/brightness sensor.
pub fn sensor_configuration() -> EepromModelSpec {
    EepromModelSpec {
        name: "sensor_configuration",
        id: Some(EepromIdSpec::fixed(32)),
        fields: vec![
            ModelField::eeprom(
                "name",
                EepromDataType::String(16),
                AddrGen::per_id(|id| ((193 + id / 16) as u8, (16 * (id % 16)) as u8)),
            ),
            ModelField::eeprom(
                "offset",
                EepromDataType::SignedTemp,
                AddrGen::per_id(|id| (0, (32 + id) as u8)),
            ),
            ModelField::eeprom(
                "virtual",
                EepromDataType::IBool,
                AddrGen::per_id(|id| (192, id as u8)),
            ),
            ModelField::ext_byte("room"),
        ],
    }
}

/// Configuration of one physical pulse counter.
pub fn pulse_counter_configuration() -> EepromModelSpec {
    EepromModelSpec {
        name: "pulse_counter_configuration",
        id: Some(EepromIdSpec::fixed(24)),
        fields: vec![
            ModelField::eeprom(
                "name",
                EepromDataType::String(16),
                AddrGen::per_id(|id| ((195 + id / 16) as u8, (16 * (id % 16)) as u8)),
            ),
            ModelField::eeprom(
                "input",
                EepromDataType::Byte,
                AddrGen::per_id(|id| (0, (160 + id) as u8)),
            ),
            ModelField::ext_byte("room"),
        ],
    }
}

/// Configuration of one group action.
pub fn group_action_configuration() -> EepromModelSpec {
    EepromModelSpec {
        name: "group_action_configuration",
        id: Some(EepromIdSpec::fixed(160)),
        fields: vec![
            ModelField::eeprom(
                "name",
                EepromDataType::String(16),
                AddrGen::per_id(|id| ((158 + id / 16) as u8, (16 * (id % 16)) as u8)),
            ),
            ModelField::eeprom(
                "actions",
                EepromDataType::Actions(16),
                AddrGen::per_id(|id| ((67 + id / 8) as u8, (32 * (id % 8)) as u8)),
            ),
        ],
    }
}

/// Global settings without an id.
pub fn global_configuration() -> EepromModelSpec {
    EepromModelSpec {
        name: "global_configuration",
        id: None,
        fields: vec![ModelField::eeprom(
            "threshold_temp",
            EepromDataType::Temp,
            AddrGen::Static(0, 17),
        )],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_id_enforces_the_declaration() {
        let outputs = output_configuration();
        assert!(outputs.check_id(Some(0)).is_ok());
        assert!(outputs.check_id(Some(240)).is_ok());
        assert!(matches!(outputs.check_id(Some(241)), Err(EepromError::IdOutOfRange { .. })));
        assert!(matches!(outputs.check_id(None), Err(EepromError::MissingId(_))));

        let global = global_configuration();
        assert!(global.check_id(None).is_ok());
        assert!(matches!(global.check_id(Some(1)), Err(EepromError::UnexpectedId(_))));
    }

    #[test]
    fn output_floor_lives_where_the_master_expects_it() {
        let outputs = output_configuration();
        let floor = outputs.field("floor").unwrap();
        let addresses = floor.addresses("output_configuration", Some(11)).unwrap();
        assert_eq!(addresses, vec![EepromAddress::new(34, 160, 1)]);
    }

    #[test]
    fn group_action_names_fill_banks_158_to_167() {
        let group_actions = group_action_configuration();
        let name = group_actions.field("name").unwrap();

        let first = name.addresses("group_action_configuration", Some(0)).unwrap();
        assert_eq!(first, vec![EepromAddress::new(158, 0, 16)]);

        let last = name.addresses("group_action_configuration", Some(159)).unwrap();
        assert_eq!(last, vec![EepromAddress::new(167, 240, 16)]);
    }

    #[test]
    fn composite_fields_expand_to_their_entry_addresses() {
        let thermostats = thermostat_configuration();
        let monday = thermostats.field("auto_mon").unwrap();
        let addresses = monday.addresses("thermostat_configuration", Some(2)).unwrap();
        assert_eq!(addresses.len(), 7);
        assert_eq!(addresses[0], EepromAddress::new(151, 16, 1));
        assert_eq!(addresses[6], EepromAddress::new(151, 22, 1));
    }

    #[test]
    fn ext_fields_take_no_eeprom_addresses() {
        let outputs = output_configuration();
        let room = outputs.field("room").unwrap();
        assert!(room.addresses("output_configuration", Some(1)).unwrap().is_empty());
    }

    #[test]
    fn selected_fields_rejects_unknown_names() {
        let outputs = output_configuration();
        assert_eq!(outputs.selected_fields(None).unwrap().len(), outputs.fields.len());
        assert_eq!(outputs.selected_fields(Some(&["name", "timer"])).unwrap().len(), 2);
        assert!(matches!(
            outputs.selected_fields(Some(&["bogus"])),
            Err(EepromError::UnknownField { .. })
        ));
    }
}
