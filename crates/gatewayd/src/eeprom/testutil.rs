//! Simulated EEPROM device behind a [`MockSerial`], for tests that drive the
//! file/controller stack end to end.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::serial::MockSerial;

pub type Banks = Arc<Mutex<HashMap<u8, Vec<u8>>>>;

pub fn blank_banks() -> Banks {
    Arc::new(Mutex::new(HashMap::new()))
}

pub fn set_bank_bytes(banks: &Banks, bank: u8, offset: usize, bytes: &[u8]) {
    let mut banks = banks.lock().unwrap();
    let image = banks.entry(bank).or_insert_with(|| vec![0xff; 256]);
    image[offset..offset + bytes.len()].copy_from_slice(bytes);
}

pub fn bank_bytes(banks: &Banks, bank: u8, offset: usize, length: usize) -> Vec<u8> {
    let mut banks = banks.lock().unwrap();
    let image = banks.entry(bank).or_insert_with(|| vec![0xff; 256]);
    image[offset..offset + length].to_vec()
}

/// Answer EL/WE/AE request frames against the shared bank map. Other
/// commands stay unanswered.
pub fn install_eeprom_responder(serial: &MockSerial, banks: Banks) {
    serial.set_responder(move |frame| {
        if frame.len() < 8 || &frame[..3] != b"STR" || !frame.ends_with(b"\r\n") {
            return None;
        }
        let action = &frame[3..5];
        let cid = frame[5];
        let payload = &frame[6..frame.len() - 2];

        match action {
            b"EL" => {
                let bank = payload[0];
                let image = {
                    let mut banks = banks.lock().unwrap();
                    banks.entry(bank).or_insert_with(|| vec![0xff; 256]).clone()
                };
                let mut reply = vec![b'E', b'L', cid, bank];
                reply.extend(image);
                Some(reply)
            }
            b"WE" => {
                let bank = payload[0];
                let offset = usize::from(payload[1]);
                let length = usize::from(payload[2]);
                let data = &payload[3..3 + length];
                {
                    let mut banks = banks.lock().unwrap();
                    let image = banks.entry(bank).or_insert_with(|| vec![0xff; 256]);
                    image[offset..offset + length].copy_from_slice(data);
                }
                let mut reply = vec![b'W', b'E', cid];
                reply.extend_from_slice(&payload[..13]);
                reply.extend_from_slice(b"\r\n");
                Some(reply)
            }
            b"AE" => {
                let mut reply = vec![b'A', b'E', cid, payload[0]];
                reply.extend_from_slice(b"OK");
                reply.extend_from_slice(&[0u8; 10]);
                reply.extend_from_slice(b"\r\n");
                Some(reply)
            }
            _ => None,
        }
    });
}
