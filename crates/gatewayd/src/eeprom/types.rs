//! EEPROM addresses, raw data slices and the field codecs used by the
//! model system.

use std::fmt;
use std::sync::Arc;

use super::EepromError;
use crate::master::command::{decode_dimmer, encode_dimmer};

/// `(bank, offset, length)` triple addressing a slice of one 256-byte bank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EepromAddress {
    pub bank: u8,
    pub offset: u8,
    pub length: u8,
}

impl EepromAddress {
    pub const fn new(bank: u8, offset: u8, length: u8) -> Self {
        Self { bank, offset, length }
    }
}

impl fmt::Display for EepromAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(B{} A{} L{})", self.bank, self.offset, self.length)
    }
}

/// Bytes at a specific address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EepromData {
    pub address: EepromAddress,
    pub bytes: Vec<u8>,
}

impl EepromData {
    pub fn new(address: EepromAddress, bytes: Vec<u8>) -> Result<Self, EepromError> {
        if usize::from(address.length) != bytes.len() {
            return Err(EepromError::LengthMismatch {
                len: bytes.len(),
                expected: usize::from(address.length),
            });
        }
        Ok(Self { address, bytes })
    }
}

/// Decoded model field value.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelValue {
    Byte(u8),
    Word(u16),
    String(String),
    /// Degrees Celsius in half steps.
    Temp(f64),
    /// "HH:MM" with minutes a multiple of 10.
    Time(String),
    /// Signed temperature offset, ±7.5 in half steps.
    SignedTemp(f64),
    /// Percentage in [0, 100].
    Dimmer(u8),
    Humidity(f64),
    Bool(bool),
    /// Comma separated basic action bytes, e.g. `"160,5"`.
    Actions(String),
    Composite(Vec<ModelValue>),
}

impl ModelValue {
    pub fn as_byte(&self) -> Option<u8> {
        match self {
            ModelValue::Byte(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_word(&self) -> Option<u16> {
        match self {
            ModelValue::Word(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ModelValue::String(v) | ModelValue::Time(v) | ModelValue::Actions(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ModelValue::Temp(v) | ModelValue::SignedTemp(v) | ModelValue::Humidity(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ModelValue::Bool(v) => Some(*v),
            _ => None,
        }
    }
}

fn codec_error(field: &str, reason: impl Into<String>) -> EepromError {
    EepromError::Codec {
        field: field.to_string(),
        reason: reason.into(),
    }
}

/// Strip a trailing run of `delimiter` repetitions.
fn strip_tail(bytes: &[u8], delimiter: &[u8]) -> Vec<u8> {
    let mut end = bytes.len();
    while end >= delimiter.len() && &bytes[end - delimiter.len()..end] == delimiter {
        end -= delimiter.len();
    }
    bytes[..end].to_vec()
}

fn pad_tail(mut bytes: Vec<u8>, length: usize) -> Vec<u8> {
    bytes.resize(length, 0xff);
    bytes
}

/// Wire codec of one EEPROM-backed field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EepromDataType {
    Byte,
    /// Big-endian 2-byte integer.
    Word,
    /// 0xFF-padded string of the given width.
    String(usize),
    /// `n` basic action pairs, 0xFFFF padded.
    Actions(usize),
    Temp,
    Time,
    SignedTemp,
    Dimmer,
    Humidity,
    /// Inverted boolean: 0xFF is false, everything else is true.
    IBool,
}

impl EepromDataType {
    pub fn length(&self) -> usize {
        match self {
            EepromDataType::Byte
            | EepromDataType::Temp
            | EepromDataType::Time
            | EepromDataType::SignedTemp
            | EepromDataType::Dimmer
            | EepromDataType::Humidity
            | EepromDataType::IBool => 1,
            EepromDataType::Word => 2,
            EepromDataType::String(n) => *n,
            EepromDataType::Actions(n) => 2 * n,
        }
    }

    pub fn name(&self) -> String {
        match self {
            EepromDataType::Byte => "Byte".to_string(),
            EepromDataType::Word => "Word".to_string(),
            EepromDataType::String(n) => format!("String({n})"),
            EepromDataType::Actions(n) => format!("Actions({n})"),
            EepromDataType::Temp => "Temp".to_string(),
            EepromDataType::Time => "Time".to_string(),
            EepromDataType::SignedTemp => "SignedTemp".to_string(),
            EepromDataType::Dimmer => "Dimmer".to_string(),
            EepromDataType::Humidity => "Humidity".to_string(),
            EepromDataType::IBool => "IBool".to_string(),
        }
    }

    pub fn decode(&self, field: &str, bytes: &[u8]) -> Result<ModelValue, EepromError> {
        if bytes.len() != self.length() {
            return Err(codec_error(
                field,
                format!("expected {} bytes, got {}", self.length(), bytes.len()),
            ));
        }

        Ok(match self {
            EepromDataType::Byte => ModelValue::Byte(bytes[0]),
            EepromDataType::Word => ModelValue::Word(u16::from_be_bytes([bytes[0], bytes[1]])),
            EepromDataType::String(_) => {
                let stripped = strip_tail(bytes, &[0xff]);
                ModelValue::String(String::from_utf8_lossy(&stripped).to_string())
            }
            EepromDataType::Actions(_) => {
                let stripped = strip_tail(bytes, &[0xff, 0xff]);
                let csv = stripped
                    .iter()
                    .map(|b| b.to_string())
                    .collect::<Vec<_>>()
                    .join(",");
                ModelValue::Actions(csv)
            }
            EepromDataType::Temp => ModelValue::Temp(f64::from(bytes[0]) / 2.0 - 32.0),
            EepromDataType::Time => {
                ModelValue::Time(format!("{:02}:{:02}", bytes[0] / 6, (bytes[0] % 6) * 10))
            }
            EepromDataType::SignedTemp => {
                if bytes[0] == 0xff {
                    ModelValue::SignedTemp(0.0)
                } else {
                    let magnitude = f64::from(bytes[0] & 0x7f) / 2.0;
                    let sign = if bytes[0] & 0x80 == 0x80 { -1.0 } else { 1.0 };
                    ModelValue::SignedTemp(sign * magnitude)
                }
            }
            EepromDataType::Dimmer => ModelValue::Dimmer(decode_dimmer(bytes[0])),
            EepromDataType::Humidity => {
                let value = if bytes[0] == 255 { 255.0 } else { f64::from(bytes[0]) / 2.0 };
                ModelValue::Humidity(value)
            }
            EepromDataType::IBool => ModelValue::Bool(bytes[0] != 0xff),
        })
    }

    pub fn encode(&self, field: &str, value: &ModelValue) -> Result<Vec<u8>, EepromError> {
        let mismatch = || codec_error(field, format!("value does not match codec {}", self.name()));

        Ok(match (self, value) {
            (EepromDataType::Byte, ModelValue::Byte(v)) => vec![*v],
            (EepromDataType::Word, ModelValue::Word(v)) => v.to_be_bytes().to_vec(),
            (EepromDataType::String(n), ModelValue::String(v)) => {
                if v.len() > *n {
                    return Err(codec_error(field, format!("string longer than {n} bytes")));
                }
                pad_tail(v.as_bytes().to_vec(), *n)
            }
            (EepromDataType::Actions(n), ModelValue::Actions(csv)) => {
                let mut bytes = Vec::new();
                if !csv.is_empty() {
                    for part in csv.split(',') {
                        let byte: u8 = part
                            .trim()
                            .parse()
                            .map_err(|_| codec_error(field, format!("bad action byte {part:?}")))?;
                        bytes.push(byte);
                    }
                }
                if bytes.len() > 2 * n {
                    return Err(codec_error(field, format!("more than {n} action pairs")));
                }
                pad_tail(bytes, 2 * n)
            }
            (EepromDataType::Temp, ModelValue::Temp(v)) => {
                if !(-32.0..=63.5).contains(v) || (v * 2.0).fract() != 0.0 {
                    return Err(codec_error(field, format!("temperature {v} out of range")));
                }
                vec![((v + 32.0) * 2.0) as u8]
            }
            (EepromDataType::Time, ModelValue::Time(v)) => {
                let invalid = || codec_error(field, format!("invalid time {v:?}"));
                let (hours, minutes) = v.split_once(':').ok_or_else(invalid)?;
                let hours: u8 = hours.parse().map_err(|_| invalid())?;
                let minutes: u8 = minutes.parse().map_err(|_| invalid())?;
                if hours > 23 || minutes > 59 || minutes % 10 != 0 {
                    return Err(invalid());
                }
                vec![hours * 6 + minutes / 10]
            }
            (EepromDataType::SignedTemp, ModelValue::SignedTemp(v)) => {
                if !(-7.5..=7.5).contains(v) || (v * 2.0).fract() != 0.0 {
                    return Err(codec_error(field, format!("temperature offset {v} out of range")));
                }
                if *v == 0.0 {
                    vec![0xff]
                } else {
                    let sign = if *v < 0.0 { 0x80 } else { 0x00 };
                    vec![sign | ((v.abs() * 2.0) as u8)]
                }
            }
            (EepromDataType::Dimmer, ModelValue::Dimmer(v)) => {
                if *v > 100 {
                    return Err(codec_error(field, format!("dimmer {v} out of range")));
                }
                vec![encode_dimmer(*v)]
            }
            (EepromDataType::Humidity, ModelValue::Humidity(v)) => {
                if *v == 255.0 {
                    vec![255]
                } else {
                    vec![(*v * 2.0) as u8]
                }
            }
            (EepromDataType::IBool, ModelValue::Bool(v)) => {
                vec![if *v { 0x00 } else { 0xff }]
            }
            _ => return Err(mismatch()),
        })
    }
}

/// Static address or per-id address generator of a field.
#[derive(Clone)]
pub enum AddrGen {
    Static(u8, u8),
    PerId(Arc<dyn Fn(u16) -> (u8, u8) + Send + Sync>),
}

impl AddrGen {
    pub fn per_id(f: impl Fn(u16) -> (u8, u8) + Send + Sync + 'static) -> Self {
        AddrGen::PerId(Arc::new(f))
    }

    pub fn resolve(
        &self,
        model: &'static str,
        id: Option<u16>,
        length: usize,
    ) -> Result<EepromAddress, EepromError> {
        let (bank, offset) = match (self, id) {
            (AddrGen::Static(bank, offset), None) => (*bank, *offset),
            (AddrGen::PerId(f), Some(id)) => f(id),
            (AddrGen::Static(..), Some(_)) => return Err(EepromError::UnexpectedId(model)),
            (AddrGen::PerId(_), None) => return Err(EepromError::MissingId(model)),
        };
        Ok(EepromAddress::new(bank, offset, length as u8))
    }
}

impl fmt::Debug for AddrGen {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddrGen::Static(bank, offset) => write!(f, "Static({bank}, {offset})"),
            AddrGen::PerId(_) => write!(f, "PerId(..)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signed_temp_decodes_the_documented_bytes() {
        let ty = EepromDataType::SignedTemp;
        assert_eq!(ty.decode("t", &[0xff]).unwrap(), ModelValue::SignedTemp(0.0));
        assert_eq!(ty.decode("t", &[0x02]).unwrap(), ModelValue::SignedTemp(1.0));
        assert_eq!(ty.decode("t", &[0x82]).unwrap(), ModelValue::SignedTemp(-1.0));
        assert_eq!(ty.decode("t", &[0x0f]).unwrap(), ModelValue::SignedTemp(7.5));
        assert_eq!(ty.decode("t", &[0x8f]).unwrap(), ModelValue::SignedTemp(-7.5));
    }

    #[test]
    fn signed_temp_encodes_and_rejects_out_of_range() {
        let ty = EepromDataType::SignedTemp;
        assert_eq!(ty.encode("t", &ModelValue::SignedTemp(0.0)).unwrap(), vec![0xff]);
        assert_eq!(ty.encode("t", &ModelValue::SignedTemp(1.0)).unwrap(), vec![0x02]);
        assert_eq!(ty.encode("t", &ModelValue::SignedTemp(-1.0)).unwrap(), vec![0x82]);

        let mut offset = -7.5;
        while offset <= 7.5 {
            let encoded = ty.encode("t", &ModelValue::SignedTemp(offset)).unwrap();
            assert_eq!(ty.decode("t", &encoded).unwrap(), ModelValue::SignedTemp(offset));
            offset += 0.5;
        }

        for bad in [8.0, 45.0, -8.0, -89.0, 1.25] {
            assert!(ty.encode("t", &ModelValue::SignedTemp(bad)).is_err());
        }
    }

    #[test]
    fn ibool_is_inverted() {
        let ty = EepromDataType::IBool;
        assert_eq!(ty.decode("b", &[0xff]).unwrap(), ModelValue::Bool(false));
        assert_eq!(ty.decode("b", &[0x00]).unwrap(), ModelValue::Bool(true));
        assert_eq!(ty.decode("b", &[0x0f]).unwrap(), ModelValue::Bool(true));
        assert_eq!(ty.encode("b", &ModelValue::Bool(true)).unwrap(), vec![0x00]);
        assert_eq!(ty.encode("b", &ModelValue::Bool(false)).unwrap(), vec![0xff]);
    }

    #[test]
    fn actions_strip_and_pad_ff_pairs() {
        let one = EepromDataType::Actions(1);
        assert_eq!(one.decode("a", b"\x01\x02").unwrap(), ModelValue::Actions("1,2".into()));
        assert_eq!(one.encode("a", &ModelValue::Actions("1,2".into())).unwrap(), b"\x01\x02");

        let two = EepromDataType::Actions(2);
        assert_eq!(
            two.decode("a", b"\x01\x02\xff\xff").unwrap(),
            ModelValue::Actions("1,2".into())
        );
        assert_eq!(
            two.encode("a", &ModelValue::Actions("1,2".into())).unwrap(),
            b"\x01\x02\xff\xff"
        );
        assert_eq!(
            two.encode("a", &ModelValue::Actions(String::new())).unwrap(),
            b"\xff\xff\xff\xff"
        );
    }

    #[test]
    fn strings_strip_and_pad_ff() {
        let ty = EepromDataType::String(10);
        let encoded = ty.encode("name", &ModelValue::String("test".into())).unwrap();
        assert_eq!(encoded, b"test\xff\xff\xff\xff\xff\xff");
        assert_eq!(ty.decode("name", &encoded).unwrap(), ModelValue::String("test".into()));
        assert!(ty.encode("name", &ModelValue::String("far too long a name".into())).is_err());
    }

    #[test]
    fn temp_and_time_round_trip_on_their_grids() {
        let temp = EepromDataType::Temp;
        for value in [-32.0, 0.0, 21.5, 63.5] {
            let encoded = temp.encode("t", &ModelValue::Temp(value)).unwrap();
            assert_eq!(temp.decode("t", &encoded).unwrap(), ModelValue::Temp(value));
        }
        assert!(temp.encode("t", &ModelValue::Temp(80.0)).is_err());

        let time = EepromDataType::Time;
        for value in ["00:00", "06:30", "23:50"] {
            let encoded = time.encode("t", &ModelValue::Time(value.into())).unwrap();
            assert_eq!(time.decode("t", &encoded).unwrap(), ModelValue::Time(value.into()));
        }
        assert!(time.encode("t", &ModelValue::Time("12:34".into())).is_err());
    }

    #[test]
    fn addresses_compare_on_the_full_triple() {
        let a = EepromAddress::new(1, 2, 3);
        assert_eq!(a, EepromAddress::new(1, 2, 3));
        assert_ne!(a, EepromAddress::new(1, 2, 4));
        assert_eq!(a.to_string(), "(B1 A2 L3)");
    }

    #[test]
    fn data_length_must_match_address() {
        let address = EepromAddress::new(1, 2, 3);
        assert!(EepromData::new(address, vec![1, 2, 3]).is_ok());
        assert!(EepromData::new(address, vec![1, 2]).is_err());
    }
}
