//! Byte-level access to the RS-485 serial ports.
//!
//! The protocol engines only see the [`SerialTransport`] trait; the real
//! device and the scripted test mock implement the same surface.

use std::collections::VecDeque;
use std::future::Future;
use std::io;

use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{Mutex, mpsc};
use tokio_serial::{SerialPortBuilderExt, SerialStream};

/// Full-duplex byte transport. No framing knowledge lives here.
pub trait SerialTransport: Send + Sync + 'static {
    /// Read into `buf`, resolving once at least one byte is available.
    /// Returns the number of bytes read; 0 means the port was closed.
    fn read(&self, buf: &mut [u8]) -> impl Future<Output = io::Result<usize>> + Send;

    /// Write all of `data` to the port.
    fn write(&self, data: &[u8]) -> impl Future<Output = io::Result<()>> + Send;
}

/// A physical serial port, split so reads and writes proceed concurrently.
pub struct SerialDevice {
    reader: Mutex<ReadHalf<SerialStream>>,
    writer: Mutex<WriteHalf<SerialStream>>,
}

impl SerialDevice {
    /// Open an OS serial device, 8N1 at the given baud rate.
    pub fn open(path: &str, baud_rate: u32) -> Result<Self, tokio_serial::Error> {
        let stream = tokio_serial::new(path, baud_rate).open_native_async()?;
        let (reader, writer) = tokio::io::split(stream);

        Ok(Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
        })
    }
}

impl SerialTransport for SerialDevice {
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.lock().await.read(buf).await
    }

    async fn write(&self, data: &[u8]) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(data).await?;
        writer.flush().await
    }
}

/// Scripted in-memory transport for tests.
///
/// Bytes queued with [`MockSerial::feed`] become readable immediately. A
/// request/reply script set up with [`MockSerial::expect`] answers writes in
/// order: when a written frame equals the next expected request, its reply is
/// queued for reading. All written bytes are recorded.
pub struct MockSerial {
    feed_tx: mpsc::UnboundedSender<Vec<u8>>,
    feed_rx: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    pending: std::sync::Mutex<VecDeque<u8>>,
    written: std::sync::Mutex<Vec<u8>>,
    script: std::sync::Mutex<VecDeque<(Vec<u8>, Vec<u8>)>>,
    responder: std::sync::Mutex<Option<Responder>>,
}

type Responder = Box<dyn Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync>;

impl MockSerial {
    pub fn new() -> Self {
        let (feed_tx, feed_rx) = mpsc::unbounded_channel();
        Self {
            feed_tx,
            feed_rx: Mutex::new(feed_rx),
            pending: std::sync::Mutex::new(VecDeque::new()),
            written: std::sync::Mutex::new(Vec::new()),
            script: std::sync::Mutex::new(VecDeque::new()),
            responder: std::sync::Mutex::new(None),
        }
    }

    /// Install a fallback that answers writes the script did not match.
    pub fn set_responder(&self, responder: impl Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync + 'static) {
        *self.responder.lock().unwrap() = Some(Box::new(responder));
    }

    /// Queue bytes for the next reads.
    pub fn feed(&self, data: &[u8]) {
        let _ = self.feed_tx.send(data.to_vec());
    }

    /// Script one exchange: when `request` is written, `reply` becomes readable.
    pub fn expect(&self, request: &[u8], reply: &[u8]) {
        self.script
            .lock()
            .unwrap()
            .push_back((request.to_vec(), reply.to_vec()));
    }

    /// All bytes written so far.
    pub fn written(&self) -> Vec<u8> {
        self.written.lock().unwrap().clone()
    }

    /// Number of scripted exchanges not yet matched by a write.
    pub fn remaining_expectations(&self) -> usize {
        self.script.lock().unwrap().len()
    }
}

impl Default for MockSerial {
    fn default() -> Self {
        Self::new()
    }
}

impl SerialTransport for MockSerial {
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            {
                let mut pending = self.pending.lock().unwrap();
                if !pending.is_empty() {
                    let n = pending.len().min(buf.len());
                    for slot in buf.iter_mut().take(n) {
                        *slot = pending.pop_front().unwrap();
                    }
                    return Ok(n);
                }
            }

            let chunk = {
                let mut rx = self.feed_rx.lock().await;
                rx.recv().await
            };
            match chunk {
                Some(chunk) => self.pending.lock().unwrap().extend(chunk),
                None => return Ok(0),
            }
        }
    }

    async fn write(&self, data: &[u8]) -> io::Result<()> {
        self.written.lock().unwrap().extend_from_slice(data);

        let mut reply = {
            let mut script = self.script.lock().unwrap();
            match script.front() {
                Some((request, _)) if request == data => script.pop_front().map(|(_, r)| r),
                _ => None,
            }
        };
        if reply.is_none()
            && let Some(responder) = self.responder.lock().unwrap().as_ref()
        {
            reply = responder(data);
        }
        if let Some(reply) = reply
            && !reply.is_empty()
        {
            let _ = self.feed_tx.send(reply);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn mock_reads_fed_bytes() {
        let serial = MockSerial::new();
        serial.feed(b"hello");

        let mut buf = [0u8; 3];
        assert_eq!(serial.read(&mut buf).await.unwrap(), 3);
        assert_eq!(&buf, b"hel");
        assert_eq!(serial.read(&mut buf).await.unwrap(), 2);
        assert_eq!(&buf[..2], b"lo");
    }

    #[tokio::test]
    async fn mock_replies_to_scripted_writes() {
        let serial = Arc::new(MockSerial::new());
        serial.expect(b"ping", b"pong");

        serial.write(b"unrelated").await.unwrap();
        assert_eq!(serial.remaining_expectations(), 1);

        serial.write(b"ping").await.unwrap();
        assert_eq!(serial.remaining_expectations(), 0);

        let mut buf = [0u8; 8];
        let n = serial.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"pong");
        assert_eq!(serial.written(), b"unrelatedping");
    }

    #[tokio::test]
    async fn mock_read_blocks_until_fed() {
        let serial = Arc::new(MockSerial::new());

        let mut buf = [0u8; 4];
        let pending = tokio::time::timeout(Duration::from_millis(20), serial.read(&mut buf));
        assert!(pending.await.is_err());

        serial.feed(b"go");
        let n = serial.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"go");
    }
}
