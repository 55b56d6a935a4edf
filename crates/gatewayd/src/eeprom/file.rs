//! Bank cache and batched diff writer on top of the master protocol.
//!
//! Reads pull whole banks through `EL` and cache them for the process
//! lifetime. Writes patch the cached image, emit one `WE` per run of changed
//! bytes (at most [`BATCH_SIZE`] bytes each, the master's write frame
//! payload) and finish with an `AE` activation. Any write failure drops the
//! whole cache so the next read refetches truth.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use tokio::sync::Mutex;

use super::types::{EepromAddress, EepromData};
use super::EepromError;
use crate::master::{api, Fields, MasterCommunicator, Value};
use crate::serial::SerialTransport;

pub const BATCH_SIZE: usize = 10;
pub const BANK_SIZE: usize = 256;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(2);

pub struct EepromFile<T: SerialTransport> {
    master: MasterCommunicator<T>,
    cache: Mutex<HashMap<u8, Vec<u8>>>,
}

impl<T: SerialTransport> EepromFile<T> {
    pub fn new(master: MasterCommunicator<T>) -> Self {
        Self {
            master,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub async fn invalidate_cache(&self) {
        self.cache.lock().await.clear();
    }

    /// Read the bytes at each address, in the same order.
    pub async fn read(&self, addresses: &[EepromAddress]) -> Result<Vec<EepromData>, EepromError> {
        let banks: BTreeSet<u8> = addresses.iter().map(|a| a.bank).collect();
        let bank_data = self.read_banks(&banks).await?;

        addresses
            .iter()
            .map(|address| {
                let data = &bank_data[&address.bank];
                let start = usize::from(address.offset);
                let end = start + usize::from(address.length);
                EepromData::new(*address, data[start..end].to_vec())
            })
            .collect()
    }

    async fn read_banks(&self, banks: &BTreeSet<u8>) -> Result<HashMap<u8, Vec<u8>>, EepromError> {
        let mut result = HashMap::new();
        for bank in banks {
            result.insert(*bank, self.read_bank(*bank).await?);
        }
        Ok(result)
    }

    async fn read_bank(&self, bank: u8) -> Result<Vec<u8>, EepromError> {
        if let Some(data) = self.cache.lock().await.get(&bank) {
            return Ok(data.clone());
        }

        let output = self
            .master
            .do_command(
                &api::eeprom_list(),
                &Fields::new().set("bank", Value::Byte(bank)),
                COMMAND_TIMEOUT,
            )
            .await?;
        let data = output.bytes("data")?.to_vec();

        self.cache.lock().await.insert(bank, data.clone());
        Ok(data)
    }

    /// Write the given slices, minimizing the number of `WE` commands.
    pub async fn write(&self, data: &[EepromData]) -> Result<(), EepromError> {
        let banks: BTreeSet<u8> = data.iter().map(|d| d.address.bank).collect();
        let bank_data = self.read_banks(&banks).await?;

        let mut new_bank_data = bank_data.clone();
        for d in data {
            let image = new_bank_data
                .get_mut(&d.address.bank)
                .expect("bank was read above");
            let start = usize::from(d.address.offset);
            image[start..start + d.bytes.len()].copy_from_slice(&d.bytes);
        }

        for bank in &banks {
            let old = &bank_data[bank];
            let new = &new_bank_data[bank];

            let mut i = 0;
            while i < old.len() {
                if old[i] == new[i] {
                    i += 1;
                    continue;
                }

                let mut length = 1;
                for j in 1..BATCH_SIZE {
                    if i + j >= old.len() {
                        break;
                    }
                    if old[i + j] != new[i + j] {
                        length = j + 1;
                    }
                }

                if let Err(e) = self.write_chunk(*bank, i as u8, &new[i..i + length]).await {
                    self.invalidate_cache().await;
                    return Err(e);
                }
                i += BATCH_SIZE;
            }
        }

        if let Err(e) = self.activate().await {
            self.invalidate_cache().await;
            return Err(e);
        }

        let mut cache = self.cache.lock().await;
        for (bank, image) in new_bank_data {
            cache.insert(bank, image);
        }
        Ok(())
    }

    async fn write_chunk(&self, bank: u8, offset: u8, bytes: &[u8]) -> Result<(), EepromError> {
        self.master
            .do_command(
                &api::write_eeprom(),
                &Fields::new()
                    .set("bank", Value::Byte(bank))
                    .set("address", Value::Byte(offset))
                    .set("data", Value::Bytes(bytes.to_vec())),
                COMMAND_TIMEOUT,
            )
            .await?;
        Ok(())
    }

    async fn activate(&self) -> Result<(), EepromError> {
        self.master
            .do_command(
                &api::activate_eeprom(),
                &Fields::new().set("eep", Value::Byte(0)),
                COMMAND_TIMEOUT,
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::master::command::MasterCommandSpec;
    use crate::master::communicator::MasterOptions;
    use crate::serial::MockSerial;
    use std::sync::Arc;

    struct Harness {
        serial: Arc<MockSerial>,
        file: EepromFile<MockSerial>,
        cid: std::sync::Mutex<u8>,
    }

    impl Harness {
        async fn new() -> Self {
            let serial = Arc::new(MockSerial::new());
            let master = MasterCommunicator::new(
                serial.clone(),
                MasterOptions {
                    init_master: false,
                    ..MasterOptions::default()
                },
            );
            master.start().await.unwrap();
            Self {
                serial,
                file: EepromFile::new(master),
                cid: std::sync::Mutex::new(0),
            }
        }

        fn next_cid(&self) -> u8 {
            let mut cid = self.cid.lock().unwrap();
            *cid += 1;
            *cid
        }

        fn reply(spec: &MasterCommandSpec, cid: u8, body: &[u8]) -> Vec<u8> {
            let mut frame = spec.action.to_vec();
            frame.push(cid);
            frame.extend_from_slice(body);
            frame
        }

        /// Script one `EL` exchange serving `data` for `bank`.
        fn expect_bank(&self, bank: u8, data: &[u8; BANK_SIZE]) {
            let spec = api::eeprom_list();
            let cid = self.next_cid();
            let request = spec
                .create_input(cid, &Fields::new().set("bank", Value::Byte(bank)))
                .unwrap();
            let mut body = vec![bank];
            body.extend_from_slice(data);
            self.serial.expect(&request, &Self::reply(&spec, cid, &body));
        }

        /// Script one `WE` exchange for the exact chunk.
        fn expect_write(&self, bank: u8, offset: u8, bytes: &[u8]) {
            let spec = api::write_eeprom();
            let cid = self.next_cid();
            let fields = Fields::new()
                .set("bank", Value::Byte(bank))
                .set("address", Value::Byte(offset))
                .set("data", Value::Bytes(bytes.to_vec()));
            let request = spec.create_input(cid, &fields).unwrap();
            let mut body = vec![bank, offset, bytes.len() as u8];
            body.extend_from_slice(bytes);
            body.resize(3 + 10, b' ');
            body.extend_from_slice(b"\r\n");
            self.serial.expect(&request, &Self::reply(&spec, cid, &body));
        }

        fn expect_activate(&self) {
            let spec = api::activate_eeprom();
            let cid = self.next_cid();
            let request = spec
                .create_input(cid, &Fields::new().set("eep", Value::Byte(0)))
                .unwrap();
            let mut body = vec![0u8];
            body.extend_from_slice(b"OK");
            body.extend_from_slice(&[0u8; 10]);
            body.extend_from_slice(b"\r\n");
            self.serial.expect(&request, &Self::reply(&spec, cid, &body));
        }
    }

    fn bank_of(byte: u8) -> [u8; BANK_SIZE] {
        [byte; BANK_SIZE]
    }

    #[tokio::test]
    async fn read_slices_one_bank() {
        let harness = Harness::new().await;
        let mut bank = bank_of(0xff);
        bank[2..5].copy_from_slice(b"abc");
        harness.expect_bank(1, &bank);

        let data = harness
            .file
            .read(&[EepromAddress::new(1, 2, 3)])
            .await
            .unwrap();
        assert_eq!(data[0].bytes, b"abc");
    }

    #[tokio::test]
    async fn read_uses_the_cache_for_repeat_reads() {
        let harness = Harness::new().await;
        harness.expect_bank(1, &bank_of(0x17));

        let address = EepromAddress::new(1, 0, 4);
        let first = harness.file.read(&[address]).await.unwrap();
        assert_eq!(first[0].bytes, vec![0x17; 4]);

        // No second EL expectation: the cache must answer this read.
        let second = harness.file.read(&[address]).await.unwrap();
        assert_eq!(second[0].bytes, vec![0x17; 4]);
        assert_eq!(harness.serial.remaining_expectations(), 0);
    }

    #[tokio::test]
    async fn write_batches_nearby_differences() {
        let harness = Harness::new().await;
        harness.expect_bank(1, &bank_of(0xff));
        harness.expect_write(1, 2, b"abc\xff\xff\xffdefg");
        harness.expect_write(1, 12, b"hijklmn");
        harness.expect_activate();

        let data = vec![
            EepromData::new(EepromAddress::new(1, 2, 3), b"abc".to_vec()).unwrap(),
            EepromData::new(EepromAddress::new(1, 8, 11), b"defghijklmn".to_vec()).unwrap(),
        ];
        harness.file.write(&data).await.unwrap();
        assert_eq!(harness.serial.remaining_expectations(), 0);
    }

    #[tokio::test]
    async fn write_patches_the_cache_in_place() {
        let harness = Harness::new().await;
        harness.expect_bank(1, &bank_of(0xff));
        harness.expect_write(1, 0, b"xy");
        harness.expect_activate();

        harness
            .file
            .write(&[EepromData::new(EepromAddress::new(1, 0, 2), b"xy".to_vec()).unwrap()])
            .await
            .unwrap();

        // The follow-up read must be served from the patched cache.
        let data = harness
            .file
            .read(&[EepromAddress::new(1, 0, 3)])
            .await
            .unwrap();
        assert_eq!(data[0].bytes, b"xy\xff");
        assert_eq!(harness.serial.remaining_expectations(), 0);
    }

    #[tokio::test]
    async fn failed_write_invalidates_the_cache() {
        let harness = Harness::new().await;
        harness.expect_bank(1, &bank_of(0xff));
        // No WE expectation: the write command will time out.

        let result = harness
            .file
            .write(&[EepromData::new(EepromAddress::new(1, 0, 1), vec![0x00]).unwrap()])
            .await;
        assert!(result.is_err());

        // The next read must go back to the device. The timed-out WE consumed
        // a cid on the way.
        harness.next_cid();
        harness.expect_bank(1, &bank_of(0xff));
        harness.file.read(&[EepromAddress::new(1, 0, 1)]).await.unwrap();
        assert_eq!(harness.serial.remaining_expectations(), 0);
    }

    #[tokio::test]
    async fn write_handles_the_end_of_a_bank() {
        let harness = Harness::new().await;
        harness.expect_bank(1, &bank_of(0xff));
        harness.expect_write(1, 254, b"zz");
        harness.expect_activate();

        harness
            .file
            .write(&[EepromData::new(EepromAddress::new(1, 254, 2), b"zz".to_vec()).unwrap()])
            .await
            .unwrap();
        assert_eq!(harness.serial.remaining_expectations(), 0);
    }
}
