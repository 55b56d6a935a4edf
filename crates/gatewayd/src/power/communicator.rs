//! Single owner of the power serial port.
//!
//! Requests serialize behind the bus lock. Failed exchanges are retried once
//! after 50 ms; an unknown-command NACK means the module sits in its
//! bootloader, so the engine jumps it to the application and retries. The
//! address-assignment mode hands the bus to a background task that answers
//! WAA frames until it is stopped or times out.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{info, warn};

use super::api;
use super::command::{
    BROADCAST_ADDRESS, HEADER_LENGTH, NACK_UNKNOWN_COMMAND, PowerCommand, PowerValue, crc7,
};
use super::controller::PowerController;
use super::PowerError;
use crate::serial::SerialTransport;

const READ_TIMEOUT: Duration = Duration::from_secs(1);
const RETRY_DELAY: Duration = Duration::from_millis(50);
const BOOTLOADER_STARTUP: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AddressMode {
    Normal,
    Addressing,
    Stopping,
}

pub struct PowerOptions {
    pub address_mode_timeout: Duration,
}

impl Default for PowerOptions {
    fn default() -> Self {
        Self {
            address_mode_timeout: Duration::from_secs(300),
        }
    }
}

struct Inner<T> {
    transport: Arc<T>,
    controller: PowerController,
    serial_lock: Mutex<()>,
    read_buffer: Mutex<VecDeque<u8>>,
    cid: std::sync::Mutex<u8>,
    address_mode: std::sync::Mutex<AddressMode>,
    address_stop: AtomicBool,
    address_mode_timeout: Duration,
    last_success: std::sync::Mutex<Option<Instant>>,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
}

pub struct PowerCommunicator<T: SerialTransport> {
    inner: Arc<Inner<T>>,
    address_task: Arc<std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>>,
}

impl<T: SerialTransport> Clone for PowerCommunicator<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            address_task: self.address_task.clone(),
        }
    }
}

impl<T: SerialTransport> PowerCommunicator<T> {
    pub fn new(transport: Arc<T>, controller: PowerController, options: PowerOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                controller,
                serial_lock: Mutex::new(()),
                read_buffer: Mutex::new(VecDeque::new()),
                cid: std::sync::Mutex::new(1),
                address_mode: std::sync::Mutex::new(AddressMode::Normal),
                address_stop: AtomicBool::new(false),
                address_mode_timeout: options.address_mode_timeout,
                last_success: std::sync::Mutex::new(None),
                bytes_read: AtomicU64::new(0),
                bytes_written: AtomicU64::new(0),
            }),
            address_task: Arc::new(std::sync::Mutex::new(None)),
        }
    }

    pub fn bytes_read(&self) -> u64 {
        self.inner.bytes_read.load(Ordering::Relaxed)
    }

    pub fn bytes_written(&self) -> u64 {
        self.inner.bytes_written.load(Ordering::Relaxed)
    }

    pub fn seconds_since_last_success(&self) -> u64 {
        match *self.inner.last_success.lock().unwrap() {
            Some(at) => at.elapsed().as_secs(),
            None => 0,
        }
    }

    pub fn in_address_mode(&self) -> bool {
        *self.inner.address_mode.lock().unwrap() != AddressMode::Normal
    }

    /// Send a command to `address` and wait for the reply. Broadcasts return
    /// immediately with no values.
    pub async fn do_command(
        &self,
        address: u8,
        command: &PowerCommand,
        args: &[PowerValue],
    ) -> Result<Vec<PowerValue>, PowerError> {
        if self.in_address_mode() {
            return Err(PowerError::InAddressMode);
        }

        let _guard = self.inner.serial_lock.lock().await;
        match self.inner.do_once(address, command, args).await {
            Ok(values) => Ok(values),
            Err(PowerError::UnknownCommand) => {
                // The module is stuck in its bootloader; start the
                // application and try again.
                info!("power module {address} answered from its bootloader, jumping to application");
                self.inner
                    .do_once(address, &api::bootloader_jump_application(), &[])
                    .await?;
                tokio::time::sleep(BOOTLOADER_STARTUP).await;
                self.inner.do_once(address, command, args).await
            }
            Err(error) => {
                warn!("power command to {address} failed ({error}), retrying once");
                tokio::time::sleep(RETRY_DELAY).await;
                self.inner.do_once(address, command, args).await
            }
        }
    }

    /// Open the address-assignment window: the bus is taken by a background
    /// task that hands out addresses to modules asking for one.
    pub fn start_address_mode(&self) -> Result<(), PowerError> {
        {
            let mut mode = self.inner.address_mode.lock().unwrap();
            if *mode != AddressMode::Normal {
                return Err(PowerError::InAddressMode);
            }
            *mode = AddressMode::Addressing;
        }
        self.inner.address_stop.store(false, Ordering::SeqCst);

        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            let _guard = inner.serial_lock.lock().await;
            if let Err(error) = inner.run_address_mode().await {
                warn!("address mode aborted: {error}");
            }
            *inner.address_mode.lock().unwrap() = AddressMode::Normal;
        });
        *self.address_task.lock().unwrap() = Some(handle);
        Ok(())
    }

    /// Close the window and wait for the bus to return to normal mode.
    pub async fn stop_address_mode(&self) -> Result<(), PowerError> {
        {
            let mut mode = self.inner.address_mode.lock().unwrap();
            if *mode != AddressMode::Addressing {
                return Err(PowerError::NotInAddressMode);
            }
            *mode = AddressMode::Stopping;
        }
        self.inner.address_stop.store(true, Ordering::SeqCst);

        let handle = self.address_task.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        Ok(())
    }
}

impl<T: SerialTransport> Inner<T> {
    fn next_cid(&self) -> u8 {
        let mut cid = self.cid.lock().unwrap();
        let current = *cid;
        *cid = (*cid % 255) + 1;
        current
    }

    async fn write(&self, data: &[u8]) -> Result<(), PowerError> {
        self.transport.write(data).await?;
        self.bytes_written.fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    async fn do_once(
        &self,
        address: u8,
        command: &PowerCommand,
        args: &[PowerValue],
    ) -> Result<Vec<PowerValue>, PowerError> {
        let cid = self.next_cid();
        let frame = command.create_input(address, cid, args)?;
        self.write(&frame).await?;

        if address == BROADCAST_ADDRESS {
            // No reply on broadcast messages.
            return Ok(Vec::new());
        }

        let (header, data) = self.read_frame().await?;
        if !command.check_header(&header, address, cid) {
            if command.is_nack(&header, address, cid) && data == [NACK_UNKNOWN_COMMAND] {
                return Err(PowerError::UnknownCommand);
            }
            return Err(PowerError::HeaderMismatch);
        }

        *self.last_success.lock().unwrap() = Some(Instant::now());
        command.read_output(&data)
    }

    async fn next_byte(&self, buffer: &mut VecDeque<u8>) -> Result<u8, PowerError> {
        if let Some(byte) = buffer.pop_front() {
            return Ok(byte);
        }

        let mut chunk = [0u8; 64];
        let read = timeout(READ_TIMEOUT, self.transport.read(&mut chunk))
            .await
            .map_err(|_| PowerError::CommunicationTimedOut)??;
        if read == 0 {
            return Err(PowerError::CommunicationTimedOut);
        }
        self.bytes_read.fetch_add(read as u64, Ordering::Relaxed);
        buffer.extend(&chunk[..read]);
        Ok(buffer.pop_front().expect("chunk is non-empty"))
    }

    /// Read one `RTR` frame: scan for the start marker, then header,
    /// payload, checksum and the trailing CRLF.
    async fn read_frame(&self) -> Result<([u8; HEADER_LENGTH], Vec<u8>), PowerError> {
        let mut buffer = self.read_buffer.lock().await;

        loop {
            let byte = self.next_byte(&mut buffer).await?;
            if byte != b'R' {
                continue;
            }
            if self.next_byte(&mut buffer).await? != b'T' {
                return Err(PowerError::Decode("expected 'T' after 'R'".to_string()));
            }
            if self.next_byte(&mut buffer).await? != b'R' {
                return Err(PowerError::Decode("expected 'R' after 'RT'".to_string()));
            }
            break;
        }

        let mut header = [0u8; HEADER_LENGTH];
        for slot in header.iter_mut() {
            *slot = self.next_byte(&mut buffer).await?;
        }

        let length = usize::from(header[HEADER_LENGTH - 1]);
        let mut data = Vec::with_capacity(length);
        for _ in 0..length {
            data.push(self.next_byte(&mut buffer).await?);
        }

        let crc = self.next_byte(&mut buffer).await?;
        if self.next_byte(&mut buffer).await? != b'\r' {
            return Err(PowerError::Decode("missing '\\r' frame terminator".to_string()));
        }
        if self.next_byte(&mut buffer).await? != b'\n' {
            return Err(PowerError::Decode("missing '\\n' frame terminator".to_string()));
        }

        let mut checked = header.to_vec();
        checked.extend_from_slice(&data);
        if crc7(&checked) != crc {
            return Err(PowerError::CrcCheckFailed);
        }

        Ok((header, data))
    }

    async fn run_address_mode(&self) -> Result<(), PowerError> {
        let deadline = Instant::now() + self.address_mode_timeout;
        let address_mode = api::set_address_mode();
        let want_an_address = api::want_an_address();
        let set_address = api::set_address();

        let frame = address_mode.create_input(
            BROADCAST_ADDRESS,
            self.next_cid(),
            &[PowerValue::U8(api::ADDRESS_MODE)],
        )?;
        self.write(&frame).await?;

        while !self.address_stop.load(Ordering::SeqCst) && Instant::now() < deadline {
            let (header, data) = match self.read_frame().await {
                Ok(frame) => frame,
                Err(PowerError::CommunicationTimedOut) => continue,
                Err(error) => {
                    warn!("ignoring bad frame in address mode: {error}");
                    continue;
                }
            };

            if !want_an_address.check_header_partial(&header) {
                warn!("received non-WAA message in address mode");
                continue;
            }

            let (old_address, cid) = (header[0], header[1]);
            let new_address = self.controller.get_free_address().await?;

            if self.controller.module_exists(old_address).await? {
                self.controller.readdress_power_module(old_address, new_address).await?;
            } else {
                let version = if data.is_empty() {
                    api::POWER_MODULE_8_PORTS
                } else {
                    api::POWER_MODULE_12_PORTS
                };
                self.controller.register_power_module(new_address, version).await?;
            }

            info!("assigned power address {new_address} to module");
            let reply = set_address.create_input(old_address, cid, &[PowerValue::U8(new_address)])?;
            self.write(&reply).await?;
        }

        let frame = address_mode.create_input(
            BROADCAST_ADDRESS,
            self.next_cid(),
            &[PowerValue::U8(api::NORMAL_MODE)],
        )?;
        self.write(&frame).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::MockSerial;
    use crate::storage::Database;

    async fn harness() -> (Arc<MockSerial>, PowerCommunicator<MockSerial>, PowerController) {
        let serial = Arc::new(MockSerial::new());
        let controller = PowerController::new(Database::open_in_memory().unwrap())
            .await
            .unwrap();
        let communicator = PowerCommunicator::new(
            serial.clone(),
            controller.clone(),
            PowerOptions {
                address_mode_timeout: Duration::from_secs(60),
            },
        );
        (serial, communicator, controller)
    }

    #[tokio::test]
    async fn do_command_round_trip() {
        let (serial, communicator, _) = harness().await;
        let command = api::get_voltage();

        let request = command.create_input(1, 1, &[]).unwrap();
        let reply = command.create_output(1, 1, &[PowerValue::F32(49.5)]).unwrap();
        serial.expect(&request, &reply);

        let output = communicator.do_command(1, &command, &[]).await.unwrap();
        assert_eq!(output, vec![PowerValue::F32(49.5)]);
        assert_eq!(communicator.bytes_written(), request.len() as u64);
        assert_eq!(communicator.bytes_read(), reply.len() as u64);
    }

    #[tokio::test]
    async fn timeout_retries_once_and_succeeds() {
        let (serial, communicator, _) = harness().await;
        let command = api::get_voltage();

        // First attempt (cid 1) gets no reply; the retry (cid 2) succeeds.
        let retry = command.create_input(1, 2, &[]).unwrap();
        serial.expect(&retry, &command.create_output(1, 2, &[PowerValue::F32(49.5)]).unwrap());

        let output = communicator.do_command(1, &command, &[]).await.unwrap();
        assert_eq!(output, vec![PowerValue::F32(49.5)]);
    }

    #[tokio::test]
    async fn timeout_twice_surfaces_the_error() {
        let (_serial, communicator, _) = harness().await;
        let command = api::get_voltage();

        let error = communicator.do_command(1, &command, &[]).await.unwrap_err();
        assert!(matches!(error, PowerError::CommunicationTimedOut));
    }

    #[tokio::test]
    async fn corrupt_crc_is_retried() {
        let (serial, communicator, _) = harness().await;
        let command = api::get_voltage();

        let request = command.create_input(1, 1, &[]).unwrap();
        let mut corrupted = command.create_output(1, 1, &[PowerValue::F32(49.5)]).unwrap();
        let crc_index = corrupted.len() - 3;
        corrupted[crc_index] ^= 0x01;
        serial.expect(&request, &corrupted);

        let retry = command.create_input(1, 2, &[]).unwrap();
        serial.expect(&retry, &command.create_output(1, 2, &[PowerValue::F32(49.5)]).unwrap());

        let output = communicator.do_command(1, &command, &[]).await.unwrap();
        assert_eq!(output, vec![PowerValue::F32(49.5)]);
    }

    #[tokio::test]
    async fn bootloader_nack_jumps_to_application() {
        let (serial, communicator, _) = harness().await;
        let command = api::get_voltage();

        // NACK 0x02 on the first try.
        let request = command.create_input(1, 1, &[]).unwrap();
        let mut nack_command = command.clone();
        nack_command.mode = crate::power::command::MODE_NACK;
        let nack = nack_command.create_output(1, 1, &[PowerValue::U8(NACK_UNKNOWN_COMMAND)]).unwrap();
        serial.expect(&request, &nack);

        // The engine jumps the bootloader (cid 2), waits and retries (cid 3).
        let jump = api::bootloader_jump_application();
        let jump_request = jump.create_input(1, 2, &[]).unwrap();
        serial.expect(&jump_request, &jump.create_output(1, 2, &[]).unwrap());

        let retry = command.create_input(1, 3, &[]).unwrap();
        serial.expect(&retry, &command.create_output(1, 3, &[PowerValue::F32(230.0)]).unwrap());

        let output = communicator.do_command(1, &command, &[]).await.unwrap();
        assert_eq!(output, vec![PowerValue::F32(230.0)]);
        assert_eq!(serial.remaining_expectations(), 0);
    }

    #[tokio::test]
    async fn broadcasts_expect_no_reply() {
        let (serial, communicator, _) = harness().await;
        let command = api::set_address_mode();

        let output = communicator
            .do_command(BROADCAST_ADDRESS, &command, &[PowerValue::U8(api::NORMAL_MODE)])
            .await
            .unwrap();
        assert!(output.is_empty());
        assert!(!serial.written().is_empty());
    }

    #[tokio::test]
    async fn address_mode_assigns_sequential_addresses() {
        let (serial, communicator, controller) = harness().await;
        assert_eq!(controller.get_free_address().await.unwrap(), 1);

        communicator.start_address_mode().unwrap();
        assert!(communicator.in_address_mode());

        // Two modules ask for an address: an 8-port (empty payload) and a
        // 12-port (non-empty payload).
        let waa = api::want_an_address();
        serial.feed(&waa.create_output(0, 0, &[]).unwrap());
        serial.feed(&waa.create_output(0, 0, &[PowerValue::U8(12)]).unwrap());
        tokio::time::sleep(Duration::from_millis(200)).await;

        communicator.stop_address_mode().await.unwrap();
        assert!(!communicator.in_address_mode());

        assert_eq!(controller.get_free_address().await.unwrap(), 3);
        let modules = controller.get_power_modules().await.unwrap();
        assert_eq!(modules.len(), 2);
        assert_eq!((modules[0].address, modules[0].version), (1, 8));
        assert_eq!((modules[1].address, modules[1].version), (2, 12));

        // The bus saw both mode broadcasts and both SAD replies.
        let written = serial.written();
        let sad_count = written.windows(3).filter(|w| w == b"SAD").count();
        assert_eq!(sad_count, 2);
        let agt_count = written.windows(3).filter(|w| w == b"AGT").count();
        assert_eq!(agt_count, 2);
    }

    #[tokio::test]
    async fn do_command_fails_while_in_address_mode() {
        let (_serial, communicator, _) = harness().await;

        communicator.start_address_mode().unwrap();
        let error = communicator
            .do_command(1, &api::get_voltage(), &[])
            .await
            .unwrap_err();
        assert!(matches!(error, PowerError::InAddressMode));

        communicator.stop_address_mode().await.unwrap();
    }

    #[tokio::test]
    async fn address_mode_times_out_on_its_own() {
        let serial = Arc::new(MockSerial::new());
        let controller = PowerController::new(Database::open_in_memory().unwrap())
            .await
            .unwrap();
        let communicator = PowerCommunicator::new(
            serial,
            controller,
            PowerOptions {
                address_mode_timeout: Duration::from_millis(100),
            },
        );

        communicator.start_address_mode().unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!communicator.in_address_mode());

        // The bus is usable again (times out, but not with InAddressMode).
        let error = communicator
            .do_command(1, &api::get_voltage(), &[])
            .await
            .unwrap_err();
        assert!(matches!(error, PowerError::CommunicationTimedOut));
    }
}
