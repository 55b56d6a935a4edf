//! Power frame codec.
//!
//! Requests are `"STR" + header(8) + payload + crc7 + "\r\n"`, replies are
//! the same with an `"RTR"` start. The 8-byte header is
//! `addr, cid, mode, command(3), reserved, payload length`; the checksum is
//! the 7-bit sum of header and payload.

use super::PowerError;

pub const BROADCAST_ADDRESS: u8 = 255;

pub const HEADER_LENGTH: usize = 8;

/// Direction byte of a command the gateway issues.
pub const MODE_GET: u8 = b'G';
pub const MODE_SET: u8 = b'S';
/// Direction byte of a NACK reply.
pub const MODE_NACK: u8 = b'N';

/// NACK payload indicating the module did not recognize the command (it is
/// sitting in its bootloader).
pub const NACK_UNKNOWN_COMMAND: u8 = 0x02;

/// 7-bit modular sum checksum.
pub fn crc7(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u32, |acc, b| acc + u32::from(*b)) as u8 % 128
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerValueType {
    F32,
    U8,
    U16,
    U32,
}

impl PowerValueType {
    fn length(&self) -> usize {
        match self {
            PowerValueType::U8 => 1,
            PowerValueType::U16 => 2,
            PowerValueType::F32 | PowerValueType::U32 => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PowerValue {
    F32(f32),
    U8(u8),
    U16(u16),
    U32(u32),
}

impl PowerValue {
    pub fn as_f64(&self) -> f64 {
        match self {
            PowerValue::F32(v) => f64::from(*v),
            PowerValue::U8(v) => f64::from(*v),
            PowerValue::U16(v) => f64::from(*v),
            PowerValue::U32(v) => f64::from(*v),
        }
    }
}

/// Specification of one power-bus command.
#[derive(Debug, Clone)]
pub struct PowerCommand {
    pub mode: u8,
    pub command: [u8; 3],
    pub input_format: Vec<PowerValueType>,
    pub output_format: Vec<PowerValueType>,
}

impl PowerCommand {
    pub fn new(
        mode: u8,
        command: [u8; 3],
        input_format: Vec<PowerValueType>,
        output_format: Vec<PowerValueType>,
    ) -> Self {
        Self { mode, command, input_format, output_format }
    }

    fn header(&self, address: u8, cid: u8, payload_length: u8) -> [u8; HEADER_LENGTH] {
        [
            address,
            cid,
            self.mode,
            self.command[0],
            self.command[1],
            self.command[2],
            0,
            payload_length,
        ]
    }

    fn encode_payload(&self, args: &[PowerValue]) -> Result<Vec<u8>, PowerError> {
        if args.len() != self.input_format.len() {
            return Err(PowerError::BadArgument(args.len()));
        }

        let mut payload = Vec::new();
        for (index, (ty, value)) in self.input_format.iter().zip(args).enumerate() {
            match (ty, value) {
                (PowerValueType::F32, PowerValue::F32(v)) => {
                    payload.extend_from_slice(&v.to_le_bytes());
                }
                (PowerValueType::U8, PowerValue::U8(v)) => payload.push(*v),
                (PowerValueType::U16, PowerValue::U16(v)) => {
                    payload.extend_from_slice(&v.to_le_bytes());
                }
                (PowerValueType::U32, PowerValue::U32(v)) => {
                    payload.extend_from_slice(&v.to_le_bytes());
                }
                _ => return Err(PowerError::BadArgument(index)),
            }
        }
        Ok(payload)
    }

    /// Build the request frame.
    pub fn create_input(
        &self,
        address: u8,
        cid: u8,
        args: &[PowerValue],
    ) -> Result<Vec<u8>, PowerError> {
        let payload = self.encode_payload(args)?;
        let header = self.header(address, cid, payload.len() as u8);

        let mut frame = Vec::with_capacity(3 + HEADER_LENGTH + payload.len() + 3);
        frame.extend_from_slice(b"STR");
        frame.extend_from_slice(&header);
        frame.extend_from_slice(&payload);
        let mut checked = header.to_vec();
        checked.extend_from_slice(&payload);
        frame.push(crc7(&checked));
        frame.extend_from_slice(b"\r\n");
        Ok(frame)
    }

    /// Build a reply frame; used by tests standing in for a module.
    pub fn create_output(
        &self,
        address: u8,
        cid: u8,
        values: &[PowerValue],
    ) -> Result<Vec<u8>, PowerError> {
        let mut payload = Vec::new();
        for value in values {
            match value {
                PowerValue::F32(v) => payload.extend_from_slice(&v.to_le_bytes()),
                PowerValue::U8(v) => payload.push(*v),
                PowerValue::U16(v) => payload.extend_from_slice(&v.to_le_bytes()),
                PowerValue::U32(v) => payload.extend_from_slice(&v.to_le_bytes()),
            }
        }
        let header = self.header(address, cid, payload.len() as u8);

        let mut frame = Vec::with_capacity(3 + HEADER_LENGTH + payload.len() + 3);
        frame.extend_from_slice(b"RTR");
        frame.extend_from_slice(&header);
        frame.extend_from_slice(&payload);
        let mut checked = header.to_vec();
        checked.extend_from_slice(&payload);
        frame.push(crc7(&checked));
        frame.extend_from_slice(b"\r\n");
        Ok(frame)
    }

    /// Does the reply header belong to this command sent to `address` with
    /// `cid`?
    pub fn check_header(&self, header: &[u8; HEADER_LENGTH], address: u8, cid: u8) -> bool {
        header[0] == address
            && header[1] == cid
            && header[2] == self.mode
            && header[3..6] == self.command
    }

    /// Same check ignoring the direction byte; a NACK echoes the command
    /// with [`MODE_NACK`].
    pub fn is_nack(&self, header: &[u8; HEADER_LENGTH], address: u8, cid: u8) -> bool {
        header[0] == address
            && header[1] == cid
            && header[2] == MODE_NACK
            && header[3..6] == self.command
    }

    /// Does the header carry this command, regardless of sender or cid?
    /// Used in address mode where the module picks the cid.
    pub fn check_header_partial(&self, header: &[u8; HEADER_LENGTH]) -> bool {
        header[3..6] == self.command
    }

    /// Decode a reply payload. Float NaNs are clamped to 0.0 here so no
    /// consumer ever sees them.
    pub fn read_output(&self, payload: &[u8]) -> Result<Vec<PowerValue>, PowerError> {
        let expected: usize = self.output_format.iter().map(PowerValueType::length).sum();
        if payload.len() != expected {
            return Err(PowerError::Decode(format!(
                "expected {expected} payload bytes, got {}",
                payload.len()
            )));
        }

        let mut values = Vec::with_capacity(self.output_format.len());
        let mut offset = 0;
        for ty in &self.output_format {
            let bytes = &payload[offset..offset + ty.length()];
            offset += ty.length();
            values.push(match ty {
                PowerValueType::U8 => PowerValue::U8(bytes[0]),
                PowerValueType::U16 => PowerValue::U16(u16::from_le_bytes([bytes[0], bytes[1]])),
                PowerValueType::U32 => PowerValue::U32(u32::from_le_bytes([
                    bytes[0], bytes[1], bytes[2], bytes[3],
                ])),
                PowerValueType::F32 => {
                    let raw = f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
                    PowerValue::F32(if raw.is_nan() { 0.0 } else { raw })
                }
            });
        }
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::power::api;

    #[test]
    fn crc7_is_a_modular_sum() {
        assert_eq!(crc7(&[]), 0);
        assert_eq!(crc7(&[1, 2, 3]), 6);
        assert_eq!(crc7(&[127, 1]), 0);
        assert_eq!(crc7(&[200, 200]), ((400u32 % 256) % 128) as u8);
    }

    #[test]
    fn input_frame_layout() {
        let command = api::get_voltage();
        let frame = command.create_input(1, 5, &[]).unwrap();

        assert_eq!(&frame[..3], b"STR");
        assert_eq!(frame[3], 1); // address
        assert_eq!(frame[4], 5); // cid
        assert_eq!(frame[5], MODE_GET);
        assert_eq!(&frame[6..9], b"VOL");
        assert_eq!(frame[10], 0); // payload length
        assert_eq!(&frame[frame.len() - 2..], b"\r\n");
        assert_eq!(frame[frame.len() - 3], crc7(&frame[3..frame.len() - 3]));
    }

    #[test]
    fn output_round_trips_through_read_output() {
        let command = api::get_voltage();
        let frame = command.create_output(1, 5, &[PowerValue::F32(49.5)]).unwrap();

        assert_eq!(&frame[..3], b"RTR");
        let payload = &frame[3 + HEADER_LENGTH..frame.len() - 3];
        let values = command.read_output(payload).unwrap();
        assert_eq!(values, vec![PowerValue::F32(49.5)]);
    }

    #[test]
    fn nan_floats_decode_to_zero() {
        let command = api::get_voltage();
        let payload = f32::NAN.to_le_bytes();
        let values = command.read_output(&payload).unwrap();
        assert_eq!(values, vec![PowerValue::F32(0.0)]);
    }

    #[test]
    fn header_checks_distinguish_nacks() {
        let command = api::get_voltage();
        let ok: [u8; 8] = [1, 5, MODE_GET, b'V', b'O', b'L', 0, 0];
        let nack: [u8; 8] = [1, 5, MODE_NACK, b'V', b'O', b'L', 0, 1];
        let other: [u8; 8] = [1, 5, MODE_GET, b'F', b'R', b'E', 0, 0];

        assert!(command.check_header(&ok, 1, 5));
        assert!(!command.check_header(&ok, 2, 5));
        assert!(!command.check_header(&nack, 1, 5));
        assert!(command.is_nack(&nack, 1, 5));
        assert!(!command.check_header(&other, 1, 5));
        assert!(command.check_header_partial(&ok));
    }

    #[test]
    fn payload_length_is_validated() {
        let command = api::get_voltage();
        assert!(command.read_output(&[0, 0]).is_err());
    }

    #[test]
    fn wrong_argument_types_are_rejected() {
        let command = api::set_address();
        assert!(command.create_input(0, 1, &[PowerValue::F32(1.0)]).is_err());
        assert!(command.create_input(0, 1, &[]).is_err());
        assert!(command.create_input(0, 1, &[PowerValue::U8(3)]).is_ok());
    }
}
