//! Single owner of the master serial port.
//!
//! One background task reads the port, matches incoming bytes against the
//! registered consumers (3-byte `action + cid` prefixes) and routes whatever
//! does not match to the passthrough or maintenance queue. Synchronous
//! commands serialize behind a per-port lock; a watchdog trips when more
//! than one command times out within its check window.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, Notify, mpsc, oneshot};
use tokio::time::timeout;
use tracing::{error, info, warn};

use super::command::{FeedResult, Fields, MasterCommandSpec, ResponseParser};
use super::{MasterError, api};
use crate::serial::SerialTransport;

const READ_CHUNK: usize = 256;
const READ_POLL: Duration = Duration::from_millis(500);
const MAINTENANCE_READ_TIMEOUT: Duration = Duration::from_secs(1);

pub type WatchdogCallback = Arc<dyn Fn() + Send + Sync>;

/// Tunables for the communicator; the defaults match production behavior.
pub struct MasterOptions {
    /// Send the CLI sync sequence on start to force the master out of
    /// maintenance mode.
    pub init_master: bool,
    pub watchdog_period: Duration,
    pub passthrough_timeout: Duration,
    /// Invoked when the watchdog sees more than one timeout per period.
    /// Defaults to exiting the process.
    pub watchdog_callback: Option<WatchdogCallback>,
}

impl Default for MasterOptions {
    fn default() -> Self {
        Self {
            init_master: true,
            watchdog_period: Duration::from_secs(150),
            passthrough_timeout: Duration::from_millis(200),
            watchdog_callback: None,
        }
    }
}

struct Registration {
    prefix: [u8; 3],
    spec: MasterCommandSpec,
    delivery: Delivery,
}

enum Delivery {
    /// Removed from the registry as soon as its prefix matches.
    Once(Option<oneshot::Sender<Fields>>),
    Background(mpsc::UnboundedSender<Fields>),
}

struct ActiveConsumer {
    parser: ResponseParser,
    delivery: ActiveDelivery,
}

enum ActiveDelivery {
    Once(oneshot::Sender<Fields>),
    /// An unsolicited frame goes to every background consumer registered
    /// for its prefix.
    Fanout(Vec<mpsc::UnboundedSender<Fields>>),
}

impl ActiveConsumer {
    fn deliver(self, fields: Fields) {
        match self.delivery {
            ActiveDelivery::Once(tx) => {
                let _ = tx.send(fields);
            }
            ActiveDelivery::Fanout(senders) => {
                for tx in senders {
                    let _ = tx.send(fields.clone());
                }
            }
        }
    }
}

struct Inner<T> {
    transport: Arc<T>,
    command_lock: Arc<Mutex<()>>,
    cid: std::sync::Mutex<u8>,
    consumers: std::sync::Mutex<Vec<Registration>>,
    maintenance_mode: AtomicBool,
    maintenance_tx: mpsc::UnboundedSender<Vec<u8>>,
    maintenance_rx: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    passthrough_mode: AtomicBool,
    passthrough_timeout: Duration,
    passthrough_done: Notify,
    passthrough_tx: mpsc::UnboundedSender<Vec<u8>>,
    passthrough_rx: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    timeouts: AtomicU32,
    last_success: std::sync::Mutex<Option<Instant>>,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    stopped: AtomicBool,
    watchdog_period: Duration,
    watchdog_callback: WatchdogCallback,
}

pub struct MasterCommunicator<T: SerialTransport> {
    inner: Arc<Inner<T>>,
    init_master: bool,
}

impl<T: SerialTransport> Clone for MasterCommunicator<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            init_master: self.init_master,
        }
    }
}

impl<T: SerialTransport> MasterCommunicator<T> {
    pub fn new(transport: Arc<T>, options: MasterOptions) -> Self {
        let (maintenance_tx, maintenance_rx) = mpsc::unbounded_channel();
        let (passthrough_tx, passthrough_rx) = mpsc::unbounded_channel();
        let watchdog_callback = options.watchdog_callback.unwrap_or_else(|| {
            Arc::new(|| {
                std::process::exit(1);
            })
        });

        Self {
            inner: Arc::new(Inner {
                transport,
                command_lock: Arc::new(Mutex::new(())),
                cid: std::sync::Mutex::new(1),
                consumers: std::sync::Mutex::new(Vec::new()),
                maintenance_mode: AtomicBool::new(false),
                maintenance_tx,
                maintenance_rx: Mutex::new(maintenance_rx),
                passthrough_mode: AtomicBool::new(false),
                passthrough_timeout: options.passthrough_timeout,
                passthrough_done: Notify::new(),
                passthrough_tx,
                passthrough_rx: Mutex::new(passthrough_rx),
                timeouts: AtomicU32::new(0),
                last_success: std::sync::Mutex::new(None),
                bytes_read: AtomicU64::new(0),
                bytes_written: AtomicU64::new(0),
                stopped: AtomicBool::new(false),
                watchdog_period: options.watchdog_period,
                watchdog_callback,
            }),
            init_master: options.init_master,
        }
    }

    /// Start the background read and watchdog tasks, optionally forcing the
    /// master out of CLI mode first.
    pub async fn start(&self) -> Result<(), MasterError> {
        if self.init_master {
            self.sync_cli_mode().await?;
        }

        let inner = self.inner.clone();
        tokio::spawn(async move { read_loop(inner).await });

        let inner = self.inner.clone();
        tokio::spawn(async move { watchdog_loop(inner).await });

        Ok(())
    }

    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
    }

    /// The master boots in an unknown state; write a full blank command, an
    /// `exit` and a half command, draining the replies, so it ends up in
    /// command mode with an empty line buffer.
    async fn sync_cli_mode(&self) -> Result<(), MasterError> {
        for chunk in [&b"                  \r\n"[..], &b"exit\r\n"[..], &b"          "[..]] {
            self.write(chunk).await?;
            self.drain_input().await;
        }
        Ok(())
    }

    async fn drain_input(&self) {
        let mut buf = [0u8; READ_CHUNK];
        while let Ok(Ok(n)) =
            timeout(Duration::from_secs(1), self.inner.transport.read(&mut buf)).await
        {
            if n == 0 {
                break;
            }
        }
    }

    async fn write(&self, data: &[u8]) -> Result<(), MasterError> {
        self.inner.transport.write(data).await?;
        self.inner
            .bytes_written
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    pub fn bytes_written(&self) -> u64 {
        self.inner.bytes_written.load(Ordering::Relaxed)
    }

    pub fn bytes_read(&self) -> u64 {
        self.inner.bytes_read.load(Ordering::Relaxed)
    }

    /// Seconds since the last successful command, 0 when none succeeded yet.
    pub fn seconds_since_last_success(&self) -> u64 {
        match *self.inner.last_success.lock().unwrap() {
            Some(at) => at.elapsed().as_secs(),
            None => 0,
        }
    }

    pub fn in_maintenance_mode(&self) -> bool {
        self.inner.maintenance_mode.load(Ordering::SeqCst)
    }

    fn next_cid(&self) -> u8 {
        let mut cid = self.inner.cid.lock().unwrap();
        let current = *cid;
        *cid = (*cid % 255) + 1;
        current
    }

    /// Send a command and wait for its reply.
    ///
    /// Only one synchronous command is outstanding at a time. On timeout the
    /// watchdog counter is incremented; on a CRC mismatch the already
    /// delivered result is discarded and [`MasterError::CrcCheckFailed`]
    /// raised. There is no automatic retry.
    pub async fn do_command(
        &self,
        spec: &MasterCommandSpec,
        fields: &Fields,
        command_timeout: Duration,
    ) -> Result<Fields, MasterError> {
        if self.in_maintenance_mode() {
            return Err(MasterError::InMaintenanceMode);
        }

        let cid = self.next_cid();
        let input = spec.create_input(cid, fields)?;
        let (tx, rx) = oneshot::channel();
        let prefix = [spec.action[0], spec.action[1], cid];

        let _guard = self.inner.command_lock.lock().await;
        self.inner.consumers.lock().unwrap().push(Registration {
            prefix,
            spec: spec.clone(),
            delivery: Delivery::Once(Some(tx)),
        });
        self.write(&input).await?;

        let result = match timeout(command_timeout, rx).await {
            Ok(Ok(fields)) => fields,
            _ => {
                self.inner.timeouts.fetch_add(1, Ordering::Relaxed);
                self.inner
                    .consumers
                    .lock()
                    .unwrap()
                    .retain(|registration| registration.prefix != prefix);
                return Err(MasterError::CommunicationTimedOut);
            }
        };

        if spec.output_has_crc() && !spec.check_crc(&result)? {
            return Err(MasterError::CrcCheckFailed);
        }

        *self.inner.last_success.lock().unwrap() = Some(Instant::now());
        Ok(result)
    }

    /// Install a permanent consumer for unsolicited frames.
    ///
    /// The handler runs on its own task and is invoked once per matching
    /// frame; it must not block the runtime.
    pub fn register_background_consumer<F>(&self, spec: MasterCommandSpec, cid: u8, handler: F)
    where
        F: Fn(Fields) + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.inner.consumers.lock().unwrap().push(Registration {
            prefix: [spec.action[0], spec.action[1], cid],
            spec,
            delivery: Delivery::Background(tx),
        });

        tokio::spawn(async move {
            while let Some(fields) = rx.recv().await {
                handler(fields);
            }
        });
    }

    /// Send raw bytes while holding the command lock; unmatched reply bytes
    /// are readable via [`MasterCommunicator::get_passthrough_data`].
    pub async fn send_passthrough_data(&self, data: &[u8]) -> Result<(), MasterError> {
        if self.in_maintenance_mode() {
            return Err(MasterError::InMaintenanceMode);
        }

        if !self.inner.passthrough_mode.swap(true, Ordering::SeqCst) {
            let guard = self.inner.command_lock.clone().lock_owned().await;
            let inner = self.inner.clone();
            tokio::spawn(async move {
                if timeout(inner.passthrough_timeout, inner.passthrough_done.notified())
                    .await
                    .is_err()
                {
                    info!("timed out on passthrough message");
                }
                inner.passthrough_mode.store(false, Ordering::SeqCst);
                drop(guard);
            });
        }

        self.write(data).await
    }

    /// Bytes that no consumer claimed, in wire order.
    pub async fn get_passthrough_data(&self) -> Option<Vec<u8>> {
        let data = self.inner.passthrough_rx.lock().await.recv().await?;
        if data.ends_with(b"\r\n\r\n") {
            self.inner.passthrough_done.notify_one();
        }
        Some(data)
    }

    /// Enter maintenance mode: the master is switched to CLI and raw bytes
    /// flow through the maintenance queue until
    /// [`MasterCommunicator::stop_maintenance_mode`].
    pub async fn start_maintenance_mode(&self) -> Result<(), MasterError> {
        if self.inner.maintenance_mode.swap(true, Ordering::SeqCst) {
            return Err(MasterError::InMaintenanceMode);
        }

        let frame = api::to_cli_mode().create_input(0, &Fields::new())?;
        self.send_maintenance_data(&frame).await
    }

    pub async fn send_maintenance_data(&self, data: &[u8]) -> Result<(), MasterError> {
        if !self.in_maintenance_mode() {
            return Err(MasterError::NotInMaintenanceMode);
        }
        self.write(data).await
    }

    /// Raw CLI output; `None` when nothing arrived within a second.
    pub async fn get_maintenance_data(&self) -> Result<Option<Vec<u8>>, MasterError> {
        if !self.in_maintenance_mode() {
            return Err(MasterError::NotInMaintenanceMode);
        }

        let mut rx = self.inner.maintenance_rx.lock().await;
        match timeout(MAINTENANCE_READ_TIMEOUT, rx.recv()).await {
            Ok(data) => Ok(data),
            Err(_) => Ok(None),
        }
    }

    pub async fn stop_maintenance_mode(&self) -> Result<(), MasterError> {
        self.send_maintenance_data(b"exit\r\n").await?;
        self.inner.maintenance_mode.store(false, Ordering::SeqCst);
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn next_cid_for_tests(&self) -> u8 {
        self.next_cid()
    }
}

impl<T> Inner<T> {
    fn match_consumer(&self, prefix: &[u8]) -> Option<ActiveConsumer> {
        let mut consumers = self.consumers.lock().unwrap();

        // A one-shot waiter takes precedence and is removed on match.
        if let Some(index) = consumers.iter().position(|registration| {
            registration.prefix == prefix && matches!(registration.delivery, Delivery::Once(_))
        }) {
            let registration = consumers.remove(index);
            let Delivery::Once(Some(sender)) = registration.delivery else {
                return None;
            };
            return Some(ActiveConsumer {
                parser: ResponseParser::new(registration.spec),
                delivery: ActiveDelivery::Once(sender),
            });
        }

        let mut spec = None;
        let senders: Vec<_> = consumers
            .iter()
            .filter(|registration| registration.prefix == prefix)
            .filter_map(|registration| match &registration.delivery {
                Delivery::Background(sender) => {
                    spec.get_or_insert_with(|| registration.spec.clone());
                    Some(sender.clone())
                }
                Delivery::Once(_) => None,
            })
            .collect();

        if senders.is_empty() {
            return None;
        }
        Some(ActiveConsumer {
            parser: ResponseParser::new(spec.expect("at least one background registration")),
            delivery: ActiveDelivery::Fanout(senders),
        })
    }

    fn prefix_start_registered(&self, byte: u8) -> bool {
        self.consumers
            .lock()
            .unwrap()
            .iter()
            .any(|registration| registration.prefix[0] == byte)
    }

    fn flush_leftovers(&self, leftovers: Vec<u8>) {
        if leftovers.is_empty() {
            return;
        }
        if self.maintenance_mode.load(Ordering::SeqCst) {
            let _ = self.maintenance_tx.send(leftovers);
        } else {
            let _ = self.passthrough_tx.send(leftovers);
        }
    }

    /// Run the consumer/prefix-scan state machine over the buffered bytes.
    fn process(&self, active: &mut Option<ActiveConsumer>, data: &mut Vec<u8>) {
        loop {
            if active.is_some() {
                let consumer = active.as_mut().unwrap();
                match consumer.parser.feed(data) {
                    Ok(FeedResult::NeedMore) => {
                        data.clear();
                        return;
                    }
                    Ok(FeedResult::Done { fields, consumed }) => {
                        data.drain(..consumed);
                        active.take().unwrap().deliver(fields);
                        continue;
                    }
                    Err(e) => {
                        // Drop the accumulated bytes and resynchronize on the
                        // next prefix.
                        warn!("master frame decode failed, resynchronizing: {e}");
                        *active = None;
                        data.clear();
                        return;
                    }
                }
            }

            let mut leftovers = Vec::new();
            let mut matched = false;
            while !data.is_empty() {
                if self.prefix_start_registered(data[0]) {
                    if data.len() < 3 {
                        // Commands end with \r\n and no prefix starts with it,
                        // so a command tail never stays stuck here.
                        break;
                    }
                    if let Some(consumer) = self.match_consumer(&data[..3]) {
                        data.drain(..3);
                        *active = Some(consumer);
                        matched = true;
                        break;
                    }
                }
                leftovers.push(data.remove(0));
            }

            self.flush_leftovers(leftovers);
            if !matched {
                return;
            }
        }
    }
}

async fn read_loop<T: SerialTransport>(inner: Arc<Inner<T>>) {
    let mut active: Option<ActiveConsumer> = None;
    let mut data: Vec<u8> = Vec::new();
    let mut buf = [0u8; READ_CHUNK];

    while !inner.stopped.load(Ordering::SeqCst) {
        let read = match timeout(READ_POLL, inner.transport.read(&mut buf)).await {
            Err(_) => continue,
            Ok(Ok(0)) => {
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                warn!("master serial read failed: {e}");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };

        inner.bytes_read.fetch_add(read as u64, Ordering::Relaxed);
        data.extend_from_slice(&buf[..read]);
        inner.process(&mut active, &mut data);
    }
}

async fn watchdog_loop<T>(inner: Arc<Inner<T>>) {
    while !inner.stopped.load(Ordering::SeqCst) {
        tokio::time::sleep(inner.watchdog_period).await;
        if inner.stopped.load(Ordering::SeqCst) {
            break;
        }
        let timeouts = inner.timeouts.swap(0, Ordering::Relaxed);
        if timeouts > 1 {
            error!("watchdog detected {timeouts} master timeouts, triggering callback");
            (inner.watchdog_callback)();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::master::Value;
    use crate::serial::MockSerial;

    fn test_options() -> MasterOptions {
        MasterOptions {
            init_master: false,
            ..MasterOptions::default()
        }
    }

    fn ba_fields() -> Fields {
        Fields::new()
            .set("action_type", Value::Byte(2))
            .set("action_number", Value::Byte(4))
    }

    fn ba_reply(cid: u8) -> Vec<u8> {
        let mut reply = vec![b'B', b'A', cid];
        reply.extend_from_slice(b"OK");
        reply.extend_from_slice(&[0u8; 11]);
        reply.extend_from_slice(b"\r\n");
        reply
    }

    async fn started(serial: &Arc<MockSerial>) -> MasterCommunicator<MockSerial> {
        let communicator = MasterCommunicator::new(serial.clone(), test_options());
        communicator.start().await.unwrap();
        communicator
    }

    #[tokio::test]
    async fn do_command_round_trip() {
        let serial = Arc::new(MockSerial::new());
        let spec = api::basic_action();
        let request = spec.create_input(1, &ba_fields()).unwrap();
        serial.expect(&request, &ba_reply(1));

        let communicator = started(&serial).await;
        let result = communicator
            .do_command(&spec, &ba_fields(), Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(result.text("resp").unwrap(), "OK");
        assert_eq!(communicator.bytes_written(), request.len() as u64);
        assert!(communicator.seconds_since_last_success() < 2);
    }

    #[tokio::test]
    async fn do_command_times_out_without_a_reply() {
        let serial = Arc::new(MockSerial::new());
        let communicator = started(&serial).await;

        let err = communicator
            .do_command(&api::basic_action(), &ba_fields(), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, MasterError::CommunicationTimedOut));
    }

    #[tokio::test]
    async fn passthrough_data_keeps_wire_order() {
        let serial = Arc::new(MockSerial::new());
        let spec = api::basic_action();
        let request = spec.create_input(1, &ba_fields()).unwrap();

        let mut stream = b"hello".to_vec();
        stream.extend(ba_reply(1));
        stream.extend_from_slice(b"world");
        serial.expect(&request, &stream);

        let communicator = started(&serial).await;
        let result = communicator
            .do_command(&spec, &ba_fields(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(result.text("resp").unwrap(), "OK");

        assert_eq!(communicator.get_passthrough_data().await.unwrap(), b"hello");
        assert_eq!(communicator.get_passthrough_data().await.unwrap(), b"world");
    }

    #[tokio::test]
    async fn garbage_does_not_break_resynchronization() {
        let serial = Arc::new(MockSerial::new());
        let spec = api::basic_action();
        let request = spec.create_input(1, &ba_fields()).unwrap();

        serial.feed(b"\x00\xffnoise\r\n");
        serial.expect(&request, &ba_reply(1));

        let communicator = started(&serial).await;
        let result = communicator
            .do_command(&spec, &ba_fields(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(result.text("resp").unwrap(), "OK");
    }

    #[tokio::test]
    async fn background_consumer_sees_every_frame() {
        let serial = Arc::new(MockSerial::new());
        let communicator = started(&serial).await;

        let seen: Arc<std::sync::Mutex<Vec<(u8, u8)>>> = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = seen.clone();
        communicator.register_background_consumer(api::output_list(), 0, move |fields| {
            sink.lock()
                .unwrap()
                .extend(fields.output_list("outputs").unwrap());
        });

        serial.feed(b"OL\x00\x01\x03\x0c\r\n\r\n");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*seen.lock().unwrap(), vec![(3, 20)]);

        serial.feed(b"OL\x00\x02\x03\x0c\x05\x06\r\n\r\n");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*seen.lock().unwrap(), vec![(3, 20), (3, 20), (5, 10)]);
    }

    #[tokio::test]
    async fn maintenance_mode_blocks_commands_and_relays_bytes() {
        let serial = Arc::new(MockSerial::new());
        let communicator = started(&serial).await;

        communicator.start_maintenance_mode().await.unwrap();
        assert!(communicator.in_maintenance_mode());

        let err = communicator
            .do_command(&api::basic_action(), &ba_fields(), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, MasterError::InMaintenanceMode));

        serial.feed(b"eeprom dump follows\r\n");
        tokio::time::sleep(Duration::from_millis(50)).await;
        let data = communicator.get_maintenance_data().await.unwrap().unwrap();
        assert_eq!(data, b"eeprom dump follows\r\n");

        communicator.stop_maintenance_mode().await.unwrap();
        assert!(!communicator.in_maintenance_mode());
        assert!(serial.written().ends_with(b"exit\r\n"));
    }

    #[tokio::test]
    async fn cid_allocator_skips_zero_and_wraps() {
        let serial = Arc::new(MockSerial::new());
        let communicator = MasterCommunicator::new(serial, test_options());

        let mut previous = 0u8;
        for i in 0..300 {
            let cid = communicator.next_cid_for_tests();
            assert_ne!(cid, 0);
            if i > 0 {
                let expected = if previous == 255 { 1 } else { previous + 1 };
                assert_eq!(cid, expected);
            }
            previous = cid;
        }
    }
}
