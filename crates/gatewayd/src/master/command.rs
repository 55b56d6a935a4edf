//! Declarative master command specifications.
//!
//! A command is a pair of field lists. The input side encodes to the fixed
//! 18-byte request frame `"STR" + action(2) + cid(1) + payload(13) + "\r\n"`;
//! the output side drives an incremental parser that can resume across
//! serial reads.

use std::collections::HashMap;

use super::MasterError;

/// System value byte, interpreted as a time or a temperature depending on
/// the field it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Svt(u8);

impl Svt {
    pub fn from_byte(byte: u8) -> Self {
        Self(byte)
    }

    /// Encode a temperature in degrees Celsius (0.5 degree steps, max 63.5).
    pub fn temperature(degrees: f64) -> Result<Self, MasterError> {
        let raw = (degrees + 32.0) * 2.0;
        if !(0.0..=255.0).contains(&raw) {
            return Err(MasterError::OutOfRange {
                field: "temperature",
                value: degrees as i64,
            });
        }
        Ok(Self(raw as u8))
    }

    /// Encode a wall-clock time. Minutes must be a multiple of 10.
    pub fn time(value: &str) -> Result<Self, MasterError> {
        let invalid = || MasterError::InvalidTime(value.to_string());
        let (hours, minutes) = value.split_once(':').ok_or_else(invalid)?;
        let hours: u8 = hours.parse().map_err(|_| invalid())?;
        let minutes: u8 = minutes.parse().map_err(|_| invalid())?;
        if hours > 23 || minutes > 59 || minutes % 10 != 0 {
            return Err(invalid());
        }
        Ok(Self(hours * 6 + minutes / 10))
    }

    pub fn as_byte(self) -> u8 {
        self.0
    }

    pub fn to_temperature(self) -> f64 {
        f64::from(self.0) / 2.0 - 32.0
    }

    pub fn to_time(self) -> String {
        format!("{:02}:{:02}", self.0 / 6, (self.0 % 6) * 10)
    }
}

/// Decoded or to-be-encoded field value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Byte(u8),
    Word(u16),
    Bytes(Vec<u8>),
    Svt(Svt),
    /// Dimmer percentage in [0, 100].
    Dimmer(u8),
    /// Relative humidity in half percent steps; 255.0 is the sentinel.
    Humidity(f64),
    /// `(output, dimmer percentage)` pairs from an OL frame.
    OutputList(Vec<(u8, u8)>),
    /// `(module id, error count)` pairs from an el frame.
    ErrorList(Vec<(String, u16)>),
}

impl Value {
    pub fn text(value: &str) -> Self {
        Value::Bytes(value.as_bytes().to_vec())
    }
}

/// Named field values of a command input or output.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Fields(HashMap<&'static str, Value>);

impl Fields {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, name: &'static str, value: Value) -> Self {
        self.0.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: &'static str, value: Value) {
        self.0.insert(name, value);
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn byte(&self, name: &str) -> Result<u8, MasterError> {
        match self.0.get(name) {
            Some(Value::Byte(v)) => Ok(*v),
            _ => Err(MasterError::Field(name.to_string())),
        }
    }

    pub fn word(&self, name: &str) -> Result<u16, MasterError> {
        match self.0.get(name) {
            Some(Value::Word(v)) => Ok(*v),
            _ => Err(MasterError::Field(name.to_string())),
        }
    }

    pub fn bytes(&self, name: &str) -> Result<&[u8], MasterError> {
        match self.0.get(name) {
            Some(Value::Bytes(v)) => Ok(v),
            _ => Err(MasterError::Field(name.to_string())),
        }
    }

    /// Byte field interpreted as text, trailing NULs and spaces stripped.
    pub fn text(&self, name: &str) -> Result<String, MasterError> {
        let raw = self.bytes(name)?;
        let text = String::from_utf8_lossy(raw);
        Ok(text.trim_end_matches(['\0', ' ']).to_string())
    }

    pub fn svt(&self, name: &str) -> Result<Svt, MasterError> {
        match self.0.get(name) {
            Some(Value::Svt(v)) => Ok(*v),
            _ => Err(MasterError::Field(name.to_string())),
        }
    }

    pub fn dimmer(&self, name: &str) -> Result<u8, MasterError> {
        match self.0.get(name) {
            Some(Value::Dimmer(v)) => Ok(*v),
            _ => Err(MasterError::Field(name.to_string())),
        }
    }

    pub fn humidity(&self, name: &str) -> Result<f64, MasterError> {
        match self.0.get(name) {
            Some(Value::Humidity(v)) => Ok(*v),
            _ => Err(MasterError::Field(name.to_string())),
        }
    }

    pub fn output_list(&self, name: &str) -> Result<&[(u8, u8)], MasterError> {
        match self.0.get(name) {
            Some(Value::OutputList(v)) => Ok(v),
            _ => Err(MasterError::Field(name.to_string())),
        }
    }

    pub fn error_list(&self, name: &str) -> Result<&[(String, u16)], MasterError> {
        match self.0.get(name) {
            Some(Value::ErrorList(v)) => Ok(v),
            _ => Err(MasterError::Field(name.to_string())),
        }
    }
}

/// Wire representation of one field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Byte,
    /// Big-endian 2-byte integer.
    Word,
    /// Fixed-width byte string.
    Str(usize),
    Bytes(usize),
    /// Zero bytes on encode, skipped on decode.
    Padding(usize),
    Literal(&'static [u8]),
    /// 1 length byte plus a fixed total width, space padded.
    VarStr(usize),
    Svt,
    /// Non-linear byte in [0, 63] mapped to a percentage in [0, 100].
    Dimmer,
    Humidity,
    /// 3-byte checksum `'C' + high + low` over the preceding encoded fields.
    Crc,
    /// 1 count byte followed by `(output, dimmer)` pairs.
    OutputList,
    /// 1 count byte followed by 4-byte module error entries.
    ErrorList,
}

pub(crate) enum DecodeOutcome {
    Value(Option<Value>),
    /// The field needs this many bytes in total before it can decode.
    NeedMore(usize),
}

pub(crate) fn encode_dimmer(percentage: u8) -> u8 {
    if percentage <= 90 {
        (u16::from(percentage) * 6).div_ceil(10) as u8
    } else {
        53 + percentage - 90
    }
}

pub(crate) fn decode_dimmer(byte: u8) -> u8 {
    if byte <= 54 {
        (u16::from(byte) * 10 / 6) as u8
    } else {
        90 + byte - 53
    }
}

impl FieldType {
    /// Minimal number of bytes required to start decoding.
    pub fn min_decode_bytes(&self) -> usize {
        match self {
            FieldType::Byte | FieldType::Svt | FieldType::Dimmer | FieldType::Humidity => 1,
            FieldType::Word => 2,
            FieldType::Str(n) | FieldType::Bytes(n) | FieldType::Padding(n) => *n,
            FieldType::Literal(lit) => lit.len(),
            FieldType::VarStr(n) => n + 1,
            FieldType::Crc => 3,
            FieldType::OutputList | FieldType::ErrorList => 1,
        }
    }

    pub fn encode(&self, name: &'static str, value: Option<&Value>) -> Result<Vec<u8>, MasterError> {
        match self {
            FieldType::Padding(n) => Ok(vec![0u8; *n]),
            FieldType::Literal(lit) => Ok(lit.to_vec()),
            FieldType::Byte => match value {
                Some(Value::Byte(v)) => Ok(vec![*v]),
                _ => Err(MasterError::Field(name.to_string())),
            },
            FieldType::Word => match value {
                Some(Value::Word(v)) => Ok(v.to_be_bytes().to_vec()),
                _ => Err(MasterError::Field(name.to_string())),
            },
            FieldType::Str(n) | FieldType::Bytes(n) => match value {
                Some(Value::Bytes(v)) if v.len() == *n => Ok(v.clone()),
                Some(Value::Bytes(v)) => Err(MasterError::OutOfRange {
                    field: name,
                    value: v.len() as i64,
                }),
                _ => Err(MasterError::Field(name.to_string())),
            },
            FieldType::VarStr(total) => match value {
                Some(Value::Bytes(v)) if v.len() <= *total => {
                    let mut out = Vec::with_capacity(total + 1);
                    out.push(v.len() as u8);
                    out.extend_from_slice(v);
                    out.resize(total + 1, b' ');
                    Ok(out)
                }
                Some(Value::Bytes(v)) => Err(MasterError::OutOfRange {
                    field: name,
                    value: v.len() as i64,
                }),
                _ => Err(MasterError::Field(name.to_string())),
            },
            FieldType::Svt => match value {
                Some(Value::Svt(v)) => Ok(vec![v.as_byte()]),
                _ => Err(MasterError::Field(name.to_string())),
            },
            FieldType::Dimmer => match value {
                Some(Value::Dimmer(v)) if *v <= 100 => Ok(vec![encode_dimmer(*v)]),
                Some(Value::Dimmer(v)) => Err(MasterError::OutOfRange {
                    field: name,
                    value: i64::from(*v),
                }),
                _ => Err(MasterError::Field(name.to_string())),
            },
            FieldType::Humidity => match value {
                Some(Value::Humidity(v)) if *v == 255.0 => Ok(vec![255]),
                Some(Value::Humidity(v)) => Ok(vec![(*v * 2.0) as u8]),
                _ => Err(MasterError::Field(name.to_string())),
            },
            FieldType::Crc => match value {
                Some(Value::Bytes(v)) if v.len() == 3 => Ok(v.clone()),
                _ => Err(MasterError::Field(name.to_string())),
            },
            FieldType::ErrorList => match value {
                Some(Value::ErrorList(entries)) => {
                    let mut out = vec![entries.len() as u8];
                    for (module, count) in entries {
                        let mut chars = module.chars();
                        let kind = chars.next().ok_or(MasterError::Field(name.to_string()))?;
                        let number: u8 = chars
                            .as_str()
                            .parse()
                            .map_err(|_| MasterError::Field(name.to_string()))?;
                        out.push(kind as u8);
                        out.push(number);
                        out.extend_from_slice(&count.to_be_bytes());
                    }
                    Ok(out)
                }
                _ => Err(MasterError::Field(name.to_string())),
            },
            FieldType::OutputList => {
                Err(MasterError::Decode("output list is decode-only".to_string()))
            }
        }
    }

    pub(crate) fn decode(&self, bytes: &[u8]) -> Result<DecodeOutcome, MasterError> {
        let value = match self {
            FieldType::Padding(_) => None,
            FieldType::Literal(lit) => {
                if bytes != *lit {
                    return Err(MasterError::Decode(format!(
                        "expected literal {lit:?}, got {bytes:?}"
                    )));
                }
                None
            }
            FieldType::Byte => Some(Value::Byte(bytes[0])),
            FieldType::Word => Some(Value::Word(u16::from_be_bytes([bytes[0], bytes[1]]))),
            FieldType::Str(_) | FieldType::Bytes(_) | FieldType::Crc => {
                Some(Value::Bytes(bytes.to_vec()))
            }
            FieldType::VarStr(_) => {
                let length = usize::from(bytes[0]);
                if length + 1 > bytes.len() {
                    return Err(MasterError::Decode(format!(
                        "variable string length {length} exceeds field width"
                    )));
                }
                Some(Value::Bytes(bytes[1..1 + length].to_vec()))
            }
            FieldType::Svt => Some(Value::Svt(Svt::from_byte(bytes[0]))),
            FieldType::Dimmer => Some(Value::Dimmer(decode_dimmer(bytes[0]))),
            FieldType::Humidity => {
                let raw = bytes[0];
                let value = if raw == 255 { 255.0 } else { f64::from(raw) / 2.0 };
                Some(Value::Humidity(value))
            }
            FieldType::OutputList => {
                let required = 1 + usize::from(bytes[0]) * 2;
                if bytes.len() < required {
                    return Ok(DecodeOutcome::NeedMore(required));
                }
                let outputs = bytes[1..required]
                    .chunks_exact(2)
                    .map(|pair| (pair[0], decode_dimmer(pair[1])))
                    .collect();
                Some(Value::OutputList(outputs))
            }
            FieldType::ErrorList => {
                let required = 1 + usize::from(bytes[0]) * 4;
                if bytes.len() < required {
                    return Ok(DecodeOutcome::NeedMore(required));
                }
                let errors = bytes[1..required]
                    .chunks_exact(4)
                    .map(|entry| {
                        let module = format!("{}{}", entry[0] as char, entry[1]);
                        (module, u16::from_be_bytes([entry[2], entry[3]]))
                    })
                    .collect();
                Some(Value::ErrorList(errors))
            }
        };

        Ok(DecodeOutcome::Value(value))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field {
    pub name: &'static str,
    pub ty: FieldType,
}

impl Field {
    pub const fn byte(name: &'static str) -> Self {
        Self { name, ty: FieldType::Byte }
    }

    pub const fn word(name: &'static str) -> Self {
        Self { name, ty: FieldType::Word }
    }

    pub const fn str(name: &'static str, length: usize) -> Self {
        Self { name, ty: FieldType::Str(length) }
    }

    pub const fn bytes(name: &'static str, length: usize) -> Self {
        Self { name, ty: FieldType::Bytes(length) }
    }

    pub const fn padding(length: usize) -> Self {
        Self { name: "padding", ty: FieldType::Padding(length) }
    }

    pub const fn lit(literal: &'static [u8]) -> Self {
        Self { name: "literal", ty: FieldType::Literal(literal) }
    }

    pub const fn varstr(name: &'static str, total: usize) -> Self {
        Self { name, ty: FieldType::VarStr(total) }
    }

    pub const fn svt(name: &'static str) -> Self {
        Self { name, ty: FieldType::Svt }
    }

    pub const fn dimmer(name: &'static str) -> Self {
        Self { name, ty: FieldType::Dimmer }
    }

    pub const fn hum(name: &'static str) -> Self {
        Self { name, ty: FieldType::Humidity }
    }

    pub const fn crc() -> Self {
        Self { name: "crc", ty: FieldType::Crc }
    }

    pub const fn output_list(name: &'static str) -> Self {
        Self { name, ty: FieldType::OutputList }
    }

    pub const fn error_list(name: &'static str) -> Self {
        Self { name, ty: FieldType::ErrorList }
    }

    pub fn is_crc(&self) -> bool {
        matches!(self.ty, FieldType::Crc)
    }
}

/// Input and output layout of one master command.
#[derive(Debug, Clone)]
pub struct MasterCommandSpec {
    pub action: [u8; 2],
    pub input_fields: Vec<Field>,
    pub output_fields: Vec<Field>,
}

impl MasterCommandSpec {
    pub fn new(action: [u8; 2], input_fields: Vec<Field>, output_fields: Vec<Field>) -> Self {
        Self { action, input_fields, output_fields }
    }

    /// Build the request frame for this spec.
    pub fn create_input(&self, cid: u8, fields: &Fields) -> Result<Vec<u8>, MasterError> {
        let mut encoded = Vec::new();
        for field in &self.input_fields {
            if field.is_crc() {
                let crc: u32 = encoded.iter().map(|b| u32::from(*b)).sum();
                encoded.push(b'C');
                encoded.push((crc / 256) as u8);
                encoded.push((crc % 256) as u8);
            } else {
                encoded.extend(field.ty.encode(field.name, fields.get(field.name))?);
            }
        }

        let mut frame = Vec::with_capacity(8 + encoded.len());
        frame.extend_from_slice(b"STR");
        frame.extend_from_slice(&self.action);
        frame.push(cid);
        frame.extend(encoded);
        frame.extend_from_slice(b"\r\n");
        Ok(frame)
    }

    /// Build a reply frame from output field values; stands in for the
    /// master in tests.
    pub fn create_output(&self, cid: u8, fields: &Fields) -> Result<Vec<u8>, MasterError> {
        let mut frame = self.action.to_vec();
        frame.push(cid);

        let mut crc: u32 = 0;
        for field in &self.output_fields {
            let encoded = if field.is_crc() {
                vec![b'C', (crc / 256) as u8, (crc % 256) as u8]
            } else {
                field.ty.encode(field.name, fields.get(field.name))?
            };
            if !field.is_crc() {
                crc += encoded.iter().map(|b| u32::from(*b)).sum::<u32>();
            }
            frame.extend(encoded);
        }
        Ok(frame)
    }

    pub fn output_has_crc(&self) -> bool {
        self.output_fields.iter().any(Field::is_crc)
    }

    /// Verify the 3-byte checksum of a decoded output against the fields
    /// preceding it.
    pub fn check_crc(&self, fields: &Fields) -> Result<bool, MasterError> {
        let mut crc: u32 = 0;
        for field in &self.output_fields {
            if field.is_crc() {
                let stored = fields.bytes("crc")?;
                return Ok(stored == [b'C', (crc / 256) as u8, (crc % 256) as u8]);
            }
            let encoded = field.ty.encode(field.name, fields.get(field.name))?;
            crc += encoded.iter().map(|b| u32::from(*b)).sum::<u32>();
        }
        Ok(true)
    }
}

pub(crate) enum FeedResult {
    /// All input was buffered; the response is not complete yet.
    NeedMore,
    Done { fields: Fields, consumed: usize },
}

/// Incremental parser for one command output, fed from the reader task.
pub(crate) struct ResponseParser {
    spec: MasterCommandSpec,
    field_index: usize,
    pending: Vec<u8>,
    fields: Fields,
}

impl ResponseParser {
    pub fn new(spec: MasterCommandSpec) -> Self {
        Self {
            spec,
            field_index: 0,
            pending: Vec::new(),
            fields: Fields::new(),
        }
    }

    pub fn feed(&mut self, data: &[u8]) -> Result<FeedResult, MasterError> {
        let from_pending = self.pending.len();
        let mut bytes = std::mem::take(&mut self.pending);
        bytes.extend_from_slice(data);

        let mut index = 0usize;
        while self.field_index < self.spec.output_fields.len() {
            let field = self.spec.output_fields[self.field_index];
            let mut need = field.ty.min_decode_bytes();
            loop {
                if index + need > bytes.len() {
                    self.pending = bytes.split_off(index);
                    return Ok(FeedResult::NeedMore);
                }
                match field.ty.decode(&bytes[index..index + need])? {
                    DecodeOutcome::NeedMore(n) => need = n,
                    DecodeOutcome::Value(value) => {
                        if let Some(value) = value {
                            self.fields.insert(field.name, value);
                        }
                        index += need;
                        break;
                    }
                }
            }
            self.field_index += 1;
        }

        Ok(FeedResult::Done {
            fields: std::mem::take(&mut self.fields),
            consumed: index - from_pending,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::master::api;

    #[test]
    fn basic_action_input_frame() {
        let spec = api::basic_action();
        let fields = Fields::new()
            .set("action_type", Value::Byte(2))
            .set("action_number", Value::Byte(4));
        let frame = spec.create_input(1, &fields).unwrap();
        let mut expected = b"STRBA\x01\x02\x04".to_vec();
        expected.extend_from_slice(&[0u8; 11]);
        expected.extend_from_slice(b"\r\n");
        assert_eq!(frame, expected);
        assert_eq!(frame.len(), 21);
    }

    #[test]
    fn basic_action_output_parses() {
        let spec = api::basic_action();
        let mut parser = ResponseParser::new(spec);
        let mut reply = b"OK".to_vec();
        reply.extend_from_slice(&[0u8; 11]);
        reply.extend_from_slice(b"\r\n");

        match parser.feed(&reply).unwrap() {
            FeedResult::Done { fields, consumed } => {
                assert_eq!(consumed, reply.len());
                assert_eq!(fields.text("resp").unwrap(), "OK");
            }
            FeedResult::NeedMore => panic!("response should be complete"),
        }
    }

    #[test]
    fn output_parses_across_split_reads() {
        let spec = api::basic_action();
        let mut parser = ResponseParser::new(spec);
        let mut reply = b"OK".to_vec();
        reply.extend_from_slice(&[0u8; 11]);
        reply.extend_from_slice(b"\r\n");

        assert!(matches!(parser.feed(&reply[..5]).unwrap(), FeedResult::NeedMore));
        match parser.feed(&reply[5..]).unwrap() {
            FeedResult::Done { fields, consumed } => {
                assert_eq!(consumed, reply.len() - 5);
                assert_eq!(fields.text("resp").unwrap(), "OK");
            }
            FeedResult::NeedMore => panic!("response should be complete"),
        }
    }

    #[test]
    fn output_list_needs_count_dependent_bytes() {
        let spec = api::output_list();
        let mut parser = ResponseParser::new(spec);

        assert!(matches!(parser.feed(b"\x02\x03\x0c").unwrap(), FeedResult::NeedMore));
        match parser.feed(b"\x05\x06\r\n\r\n").unwrap() {
            FeedResult::Done { fields, .. } => {
                assert_eq!(fields.output_list("outputs").unwrap(), &[(3, 20), (5, 10)]);
            }
            FeedResult::NeedMore => panic!("response should be complete"),
        }
    }

    #[test]
    fn error_list_round_trip() {
        let entries = vec![("I5".to_string(), 3u16), ("O2".to_string(), 260u16)];
        let encoded = FieldType::ErrorList
            .encode("errors", Some(&Value::ErrorList(entries.clone())))
            .unwrap();
        assert_eq!(encoded[0], 2);

        match FieldType::ErrorList.decode(&encoded).unwrap() {
            DecodeOutcome::Value(Some(Value::ErrorList(decoded))) => assert_eq!(decoded, entries),
            _ => panic!("expected a decoded error list"),
        }
    }

    #[test]
    fn literal_mismatch_is_an_error() {
        let err = FieldType::Literal(b"\r\n").decode(b"xx");
        assert!(err.is_err());
    }

    #[test]
    fn dimmer_codec_is_exact_on_decades() {
        for percentage in (0..=100).step_by(10) {
            assert_eq!(decode_dimmer(encode_dimmer(percentage)), percentage);
        }
        assert_eq!(decode_dimmer(0x0c), 20);
    }

    #[test]
    fn svt_time_round_trips_on_ten_minute_marks() {
        for value in ["00:00", "07:30", "13:10", "23:50"] {
            assert_eq!(Svt::time(value).unwrap().to_time(), value);
        }
        assert!(Svt::time("12:34").is_err());
        assert!(Svt::time("24:00").is_err());
        assert!(Svt::time("junk").is_err());
    }

    #[test]
    fn svt_temperature_round_trips_on_half_degrees() {
        for raw in [-32.0, -10.5, 0.0, 21.5, 63.5] {
            assert_eq!(Svt::temperature(raw).unwrap().to_temperature(), raw);
        }
        assert!(Svt::temperature(100.0).is_err());
    }

    #[test]
    fn humidity_sentinel_survives() {
        match FieldType::Humidity.decode(&[255]).unwrap() {
            DecodeOutcome::Value(Some(Value::Humidity(v))) => assert_eq!(v, 255.0),
            _ => panic!("expected humidity"),
        }
        match FieldType::Humidity.decode(&[101]).unwrap() {
            DecodeOutcome::Value(Some(Value::Humidity(v))) => assert_eq!(v, 50.5),
            _ => panic!("expected humidity"),
        }
    }

    #[test]
    fn varstr_pads_and_strips() {
        let encoded = FieldType::VarStr(10)
            .encode("data", Some(&Value::text("abc")))
            .unwrap();
        assert_eq!(encoded, b"\x03abc       ");

        match FieldType::VarStr(10).decode(&encoded).unwrap() {
            DecodeOutcome::Value(Some(Value::Bytes(v))) => assert_eq!(v, b"abc"),
            _ => panic!("expected bytes"),
        }
    }

    #[test]
    fn crc_checks_the_preceding_fields() {
        let spec = api::pulse_list();
        let spec_with_crc = MasterCommandSpec::new(
            spec.action,
            spec.input_fields,
            vec![Field::byte("series"), Field::crc(), Field::lit(b"\r\n")],
        );

        let good = Fields::new()
            .set("series", Value::Byte(7))
            .set("crc", Value::Bytes(vec![b'C', 0, 7]));
        assert!(spec_with_crc.check_crc(&good).unwrap());

        let bad = Fields::new()
            .set("series", Value::Byte(7))
            .set("crc", Value::Bytes(vec![b'C', 0, 8]));
        assert!(!spec_with_crc.check_crc(&bad).unwrap());
    }
}
