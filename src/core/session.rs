//! Device session
//!
//! A `DeviceSession` owns one transport for its whole lifetime. A dedicated
//! reader task decodes the incoming byte stream and routes every frame:
//!
//! - Event frames go to the bounded [`EventQueue`]
//! - Replies left over from abandoned or retried requests are discarded
//! - The reply matching the outstanding request is handed to [`DeviceSession::send`]
//!
//! Only one request is in flight at a time; concurrent callers of `send`
//! are serialized.

use super::device_info::DeviceInfo;
use super::error::{HarpError, HarpResult};
use super::event_queue::{EventQueue, OverflowPolicy, PushOutcome};
use super::protocol::codec::{self, DEFAULT_MAX_FRAME_SIZE};
use super::protocol::{DataType, DecodeError, Frame, HarpCodec, HarpTimestamp, MessageType, Payload};
use super::registers::{self, OperationControl, OperationMode, RegisterCatalog};
use super::transport::{SerialConfig, SerialTransport, Transport, TransportError};
use bytes::BytesMut;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::codec::Decoder;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Session configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Per-attempt reply deadline used by the register helpers
    pub response_timeout_ms: u64,
    /// Failures (timeouts or corrupt runs) tolerated before giving up
    pub max_retries: u32,
    /// Upper bound on a single transport read
    pub poll_interval_ms: u64,
    /// Bytes requested per transport read
    pub read_chunk_size: usize,
    /// Maximum queued events
    pub event_queue_capacity: usize,
    /// What to drop when the event queue is full
    pub event_overflow: OverflowPolicy,
    /// How long a late reply to an abandoned request is recognised
    pub stale_reply_window_ms: u64,
    /// How long a partial frame may sit in the buffer without growing
    pub stall_timeout_ms: u64,
    /// Largest accepted frame
    pub max_frame_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            response_timeout_ms: 500,
            max_retries: 3,
            poll_interval_ms: 10,
            read_chunk_size: 256,
            event_queue_capacity: 256,
            event_overflow: OverflowPolicy::DropOldest,
            stale_reply_window_ms: 2000,
            stall_timeout_ms: 100,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl SessionConfig {
    /// Per-attempt reply deadline
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    fn stale_reply_window(&self) -> Duration {
        Duration::from_millis(self.stale_reply_window_ms)
    }

    fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.stall_timeout_ms)
    }
}

/// Session counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    /// Request frames written
    pub frames_sent: u64,
    /// Well-formed frames decoded
    pub frames_received: u64,
    /// Event frames queued
    pub events_received: u64,
    /// Events lost to queue overflow
    pub events_dropped: u64,
    /// Corrupt byte runs seen
    pub corrupt_runs: u64,
    /// Bytes dropped while resynchronizing
    pub bytes_discarded: u64,
    /// Attempts that hit their deadline
    pub timeouts: u64,
    /// Requests resent
    pub retries: u64,
    /// Late replies discarded
    pub stale_discarded: u64,
    /// Non-event frames matching no request
    pub unsolicited: u64,
}

enum Reply {
    Frame(Frame),
    Corrupt(DecodeError),
    Closed(String),
}

struct Pending {
    address: u8,
    request_type: MessageType,
    attempts: u32,
    delivered: u32,
    tx: mpsc::UnboundedSender<Reply>,
}

#[derive(Debug, Clone, Copy)]
struct StaleReply {
    address: u8,
    request_type: MessageType,
    expires: Instant,
}

impl StaleReply {
    fn matches(&self, frame: &Frame) -> bool {
        self.address == frame.address && frame.message_type.answers(self.request_type)
    }
}

/// State shared between the session handle and its reader task
struct Shared {
    pending: Mutex<Option<Pending>>,
    stale: Mutex<Vec<StaleReply>>,
    events: EventQueue,
    stats: Mutex<SessionStats>,
    closed: Mutex<Option<String>>,
}

impl Shared {
    fn route(&self, frame: Frame) {
        self.stats.lock().frames_received += 1;

        if frame.message_type == MessageType::Event {
            debug!("Event {frame}");
            self.stats.lock().events_received += 1;
            match self.events.push(frame) {
                PushOutcome::Evicted => warn!("Event queue full, dropped oldest event"),
                PushOutcome::Rejected => warn!("Event queue full, dropped incoming event"),
                PushOutcome::Queued | PushOutcome::Closed => {}
            }
            return;
        }

        {
            let now = Instant::now();
            let mut stale = self.stale.lock();
            stale.retain(|marker| marker.expires > now);
            if let Some(index) = stale.iter().position(|marker| marker.matches(&frame)) {
                stale.remove(index);
                drop(stale);
                self.stats.lock().stale_discarded += 1;
                warn!("Discarding stale reply {frame}");
                return;
            }
        }

        let duplicate = {
            let mut pending = self.pending.lock();
            match pending.as_mut() {
                Some(p) if p.address == frame.address && frame.message_type.answers(p.request_type) => {
                    p.delivered += 1;
                    if p.delivered == 1 {
                        debug!("Reply {frame}");
                        let _ = p.tx.send(Reply::Frame(frame));
                        return;
                    }
                    true
                }
                _ => false,
            }
        };

        if duplicate {
            self.stats.lock().stale_discarded += 1;
            debug!("Discarding duplicate reply {frame}");
        } else {
            self.stats.lock().unsolicited += 1;
            debug!("Discarding uncorrelated {frame}");
        }
    }

    fn corrupt(&self, err: DecodeError) {
        self.stats.lock().corrupt_runs += 1;
        warn!("Resynchronizing after corrupt data: {err}");
        if let Some(p) = self.pending.lock().as_ref() {
            let _ = p.tx.send(Reply::Corrupt(err));
        }
    }

    /// Mark the session closed. Returns false if it already was.
    fn fail(&self, reason: String) -> bool {
        {
            let mut closed = self.closed.lock();
            if closed.is_some() {
                return false;
            }
            *closed = Some(reason.clone());
        }
        if let Some(p) = self.pending.lock().as_ref() {
            let _ = p.tx.send(Reply::Closed(reason));
        }
        self.events.close();
        true
    }

    fn closed_reason(&self) -> Option<String> {
        self.closed.lock().clone()
    }
}

/// Clears the outstanding request on every exit path of `send`. When some
/// attempt went unanswered it leaves one stale marker for the address and
/// reply kind, or refreshes the one already there.
struct PendingGuard<'a> {
    shared: &'a Shared,
    window: Duration,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let Some(pending) = self.shared.pending.lock().take() else {
            return;
        };
        if pending.attempts <= pending.delivered {
            return;
        }
        debug!("Expecting a late reply for register {}", pending.address);
        let expires = Instant::now() + self.window;
        let mut stale = self.shared.stale.lock();
        match stale
            .iter_mut()
            .find(|marker| marker.address == pending.address && marker.request_type == pending.request_type)
        {
            Some(marker) => marker.expires = expires,
            None => stale.push(StaleReply {
                address: pending.address,
                request_type: pending.request_type,
                expires,
            }),
        }
    }
}

type SharedTransport = Arc<tokio::sync::Mutex<Box<dyn Transport>>>;

/// Active connection to one Harp device
pub struct DeviceSession {
    transport: SharedTransport,
    shared: Arc<Shared>,
    send_lock: tokio::sync::Mutex<()>,
    catalog: RegisterCatalog,
    config: SessionConfig,
    cancel: CancellationToken,
    reader: Mutex<Option<JoinHandle<()>>>,
    info: String,
}

impl DeviceSession {
    /// Start a session over an open transport.
    ///
    /// Must be called from within a tokio runtime; the reader task is
    /// spawned immediately.
    pub fn open<T: Transport + 'static>(transport: T, config: SessionConfig) -> HarpResult<Self> {
        Self::open_boxed(Box::new(transport), config)
    }

    /// Open a serial port and start a session over it
    pub fn open_serial(serial: SerialConfig, config: SessionConfig) -> HarpResult<Self> {
        let transport = SerialTransport::open(serial).map_err(|source| HarpError::Transport {
            operation: "open",
            address: registers::WHO_AM_I,
            source,
        })?;
        Self::open(transport, config)
    }

    /// Start a session over a boxed transport
    pub fn open_boxed(transport: Box<dyn Transport>, config: SessionConfig) -> HarpResult<Self> {
        if !transport.is_open() {
            return Err(HarpError::Transport {
                operation: "open",
                address: registers::WHO_AM_I,
                source: TransportError::NotConnected,
            });
        }
        let info = transport.connection_info();
        info!("Session opened on {info}");

        let shared = Arc::new(Shared {
            pending: Mutex::new(None),
            stale: Mutex::new(Vec::new()),
            events: EventQueue::new(config.event_queue_capacity, config.event_overflow),
            stats: Mutex::new(SessionStats::default()),
            closed: Mutex::new(None),
        });
        let transport: SharedTransport = Arc::new(tokio::sync::Mutex::new(transport));
        let cancel = CancellationToken::new();
        let reader = tokio::spawn(reader_loop(
            transport.clone(),
            shared.clone(),
            config.clone(),
            cancel.clone(),
        ));

        Ok(Self {
            transport,
            shared,
            send_lock: tokio::sync::Mutex::new(()),
            catalog: RegisterCatalog::core(),
            config,
            cancel,
            reader: Mutex::new(Some(reader)),
            info,
        })
    }

    /// Transport description
    pub fn connection_info(&self) -> &str {
        &self.info
    }

    /// Session configuration
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Register catalog used to validate requests
    pub fn catalog(&self) -> &RegisterCatalog {
        &self.catalog
    }

    /// Whether the session still accepts requests
    pub fn is_open(&self) -> bool {
        self.shared.closed_reason().is_none()
    }

    /// Send a request and wait for its reply.
    ///
    /// `timeout` bounds each attempt. A timed-out attempt is resent and a
    /// corrupt byte run is counted, until more than `max_retries` failures
    /// have accumulated. Error replies from the device are returned as
    /// [`HarpError::Device`] without retrying. A transport error closes the
    /// session.
    pub async fn send(&self, request: &Frame, timeout: Duration) -> HarpResult<Frame> {
        let operation = operation_name(request.message_type);
        let address = request.address;

        let _serial = self.send_lock.lock().await;
        self.ensure_open(operation, address)?;
        if !request.message_type.is_request() {
            return Err(HarpError::InvalidRequest {
                operation,
                address,
                reason: format!("{} frames cannot be sent by the host", request.message_type),
            });
        }
        let bytes = codec::encode(request).map_err(|source| HarpError::Encode {
            operation,
            address,
            source,
        })?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        *self.shared.pending.lock() = Some(Pending {
            address,
            request_type: request.message_type,
            attempts: 0,
            delivered: 0,
            tx,
        });
        let _guard = PendingGuard {
            shared: &self.shared,
            window: self.config.stale_reply_window(),
        };

        self.transmit(&bytes, operation, address).await?;
        let mut failures = 0u32;
        let mut deadline = Instant::now() + timeout;

        loop {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(Reply::Frame(reply))) => {
                    if reply.message_type.is_error() {
                        return Err(HarpError::Device {
                            operation,
                            address,
                            reply: Box::new(reply),
                        });
                    }
                    return Ok(reply);
                }
                Ok(Some(Reply::Corrupt(source))) => {
                    failures += 1;
                    if failures > self.config.max_retries {
                        return Err(HarpError::Corrupted {
                            operation,
                            address,
                            source,
                        });
                    }
                }
                Ok(Some(Reply::Closed(reason))) => {
                    return Err(HarpError::SessionClosed {
                        operation,
                        address,
                        reason,
                    });
                }
                Ok(None) => {
                    return Err(HarpError::SessionClosed {
                        operation,
                        address,
                        reason: "reader stopped".into(),
                    });
                }
                Err(_elapsed) => {
                    failures += 1;
                    self.shared.stats.lock().timeouts += 1;
                    if failures > self.config.max_retries {
                        let attempts = self.attempts();
                        warn!("{operation} register {address}: no reply after {attempts} attempt(s)");
                        return Err(HarpError::Timeout {
                            operation,
                            address,
                            attempts,
                        });
                    }
                    debug!("{operation} register {address}: attempt timed out, resending");
                    self.shared.stats.lock().retries += 1;
                    self.transmit(&bytes, operation, address).await?;
                    deadline = Instant::now() + timeout;
                }
            }
        }
    }

    fn attempts(&self) -> u32 {
        self.shared.pending.lock().as_ref().map_or(0, |p| p.attempts)
    }

    async fn transmit(&self, bytes: &[u8], operation: &'static str, address: u8) -> HarpResult<()> {
        if let Some(p) = self.shared.pending.lock().as_mut() {
            p.attempts += 1;
        }
        debug!("TX {}", hex::encode(bytes));
        let result = self.transport.lock().await.write(bytes).await;
        match result {
            Ok(_) => {
                self.shared.stats.lock().frames_sent += 1;
                Ok(())
            }
            Err(source) => {
                warn!("{operation} register {address}: write failed: {source}");
                self.shutdown(format!("write failed: {source}")).await;
                Err(HarpError::Transport {
                    operation,
                    address,
                    source,
                })
            }
        }
    }

    fn ensure_open(&self, operation: &'static str, address: u8) -> HarpResult<()> {
        match self.shared.closed_reason() {
            Some(reason) => Err(HarpError::SessionClosed {
                operation,
                address,
                reason,
            }),
            None => Ok(()),
        }
    }

    /// Wait at most `timeout` for the next queued event
    pub async fn poll_event(&self, timeout: Duration) -> Option<Frame> {
        self.shared.events.pop_timeout(timeout).await
    }

    /// Take every queued event without waiting
    pub fn drain_events(&self) -> Vec<Frame> {
        self.shared.events.drain()
    }

    /// Snapshot of the session counters
    pub fn stats(&self) -> SessionStats {
        let mut stats = self.shared.stats.lock().clone();
        stats.events_dropped = self.shared.events.dropped();
        stats
    }

    /// Read a register, validated against the catalog
    pub async fn read_register(&self, address: u8, data_type: DataType) -> HarpResult<Frame> {
        let request = self
            .catalog
            .read(address, data_type)
            .map_err(|source| HarpError::AccessViolation {
                operation: "read",
                source,
            })?;
        self.send(&request, self.config.response_timeout()).await
    }

    /// Write a register, validated against the catalog
    pub async fn write_register(&self, address: u8, value: &Payload) -> HarpResult<Frame> {
        let request = self
            .catalog
            .write(address, value)
            .map_err(|source| HarpError::AccessViolation {
                operation: "write",
                source,
            })?;
        self.send(&request, self.config.response_timeout()).await
    }

    /// Read a register and decode its payload as `data_type`
    pub async fn read_value(&self, address: u8, data_type: DataType) -> HarpResult<Payload> {
        let reply = self.read_register(address, data_type).await?;
        typed_value(&reply, data_type, "read")
    }

    /// Read a single U8 register
    pub async fn read_u8(&self, address: u8) -> HarpResult<u8> {
        let value = self.read_value(address, DataType::U8).await?;
        first(value.as_u8(), address)
    }

    /// Read a single U16 register
    pub async fn read_u16(&self, address: u8) -> HarpResult<u16> {
        let value = self.read_value(address, DataType::U16).await?;
        first(value.as_u16(), address)
    }

    /// Read a single U32 register
    pub async fn read_u32(&self, address: u8) -> HarpResult<u32> {
        let value = self.read_value(address, DataType::U32).await?;
        first(value.as_u32(), address)
    }

    /// Device clock, whole seconds
    pub async fn harp_seconds(&self) -> HarpResult<u32> {
        self.read_u32(registers::TIMESTAMP_SECOND).await
    }

    /// Device clock at full resolution, taken from the reply timestamp when present
    pub async fn harp_time(&self) -> HarpResult<HarpTimestamp> {
        let reply = self.read_register(registers::TIMESTAMP_SECOND, DataType::U32).await?;
        if let Some(timestamp) = reply.timestamp {
            return Ok(timestamp);
        }
        let value = typed_value(&reply, DataType::U32, "read")?;
        let seconds = first(value.as_u32(), registers::TIMESTAMP_SECOND)?;
        Ok(HarpTimestamp::new(seconds, 0))
    }

    /// Replace the device's whole seconds, keeping its sub-second time
    pub async fn set_harp_seconds(&self, seconds: u32) -> HarpResult<()> {
        self.write_register(registers::TIMESTAMP_SECOND, &Payload::from(seconds))
            .await
            .map(|_| ())
    }

    /// Read the 128-bit device UUID (low half first on the wire)
    pub async fn read_uuid(&self) -> HarpResult<u128> {
        let value = self.read_value(registers::UUID, DataType::U8).await?;
        let bytes = value.as_u8().unwrap_or_default();
        if bytes.len() != 16 {
            return Err(HarpError::UnexpectedPayload {
                operation: "read",
                address: registers::UUID,
                detail: format!("expected 16 bytes, got {}", bytes.len()),
            });
        }
        let mut low = [0u8; 8];
        let mut high = [0u8; 8];
        low.copy_from_slice(&bytes[..8]);
        high.copy_from_slice(&bytes[8..]);
        Ok(u128::from(u64::from_le_bytes(low)) | (u128::from(u64::from_le_bytes(high)) << 64))
    }

    /// Read the build tag bytes
    pub async fn read_tag(&self) -> HarpResult<Vec<u8>> {
        let value = self.read_value(registers::TAG, DataType::U8).await?;
        Ok(value.as_u8().unwrap_or_default().to_vec())
    }

    /// Read the identity registers
    pub async fn device_info(&self) -> HarpResult<DeviceInfo> {
        DeviceInfo::read(self).await
    }

    /// Read OPERATION_CTRL
    pub async fn operation_control(&self) -> HarpResult<OperationControl> {
        self.read_u8(registers::OPERATION_CTRL).await.map(OperationControl)
    }

    /// Write OPERATION_CTRL
    pub async fn set_operation_control(&self, control: OperationControl) -> HarpResult<()> {
        self.write_register(registers::OPERATION_CTRL, &Payload::from(control.0))
            .await
            .map(|_| ())
    }

    /// Change the operation mode, keeping the other control bits
    pub async fn set_operation_mode(&self, mode: OperationMode) -> HarpResult<()> {
        let current = self.operation_control().await?;
        self.set_operation_control(current.with_mode(mode).with_dump(false))
            .await
    }

    /// Turn on periodic heartbeat events.
    ///
    /// Heartbeats are only emitted in Active mode with replies unmuted, so
    /// both are forced along with the heartbeat bit.
    pub async fn enable_heartbeat(&self) -> HarpResult<()> {
        let current = self.operation_control().await?;
        let next = current
            .with_mode(OperationMode::Active)
            .with_mute_replies(false)
            .with_dump(false)
            .with_heartbeat(true);
        info!("Enabling heartbeat");
        self.set_operation_control(next).await
    }

    /// Turn off periodic heartbeat events
    pub async fn disable_heartbeat(&self) -> HarpResult<()> {
        let current = self.operation_control().await?;
        info!("Disabling heartbeat");
        self.set_operation_control(current.with_dump(false).with_heartbeat(false))
            .await
    }

    /// Stop the reader and release the transport.
    ///
    /// Later requests fail with [`HarpError::SessionClosed`].
    pub async fn close(&self) {
        self.shutdown("closed by host".to_string()).await;
        let reader = self.reader.lock().take();
        if let Some(reader) = reader {
            let _ = reader.await;
        }
    }

    async fn shutdown(&self, reason: String) {
        if self.shared.fail(reason.clone()) {
            info!("Session on {} closing: {reason}", self.info);
        }
        self.cancel.cancel();
        let mut transport = self.transport.lock().await;
        if transport.is_open() {
            if let Err(e) = transport.close().await {
                debug!("Transport close failed: {e}");
            }
        }
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.shared.events.close();
    }
}

fn operation_name(message_type: MessageType) -> &'static str {
    match message_type {
        MessageType::Write => "write",
        MessageType::Read => "read",
        _ => "send",
    }
}

fn typed_value(reply: &Frame, data_type: DataType, operation: &'static str) -> HarpResult<Payload> {
    if reply.payload_type != data_type {
        return Err(HarpError::UnexpectedPayload {
            operation,
            address: reply.address,
            detail: format!("expected {data_type}, got {}", reply.payload_type),
        });
    }
    reply.value().ok_or_else(|| HarpError::UnexpectedPayload {
        operation,
        address: reply.address,
        detail: "payload is not a whole number of elements".into(),
    })
}

fn first<T: Copy>(values: Option<&[T]>, address: u8) -> HarpResult<T> {
    values
        .and_then(|v| v.first().copied())
        .ok_or_else(|| HarpError::UnexpectedPayload {
            operation: "read",
            address,
            detail: "empty payload".into(),
        })
}

fn decode_available(codec: &mut HarpCodec, buffer: &mut BytesMut, shared: &Shared) {
    loop {
        match codec.decode(buffer) {
            Ok(Some(frame)) => shared.route(frame),
            Ok(None) => break,
            Err(err) => shared.corrupt(err),
        }
    }
}

async fn reader_loop(
    transport: SharedTransport,
    shared: Arc<Shared>,
    config: SessionConfig,
    cancel: CancellationToken,
) {
    let mut codec = HarpCodec::with_max_frame_size(config.max_frame_size);
    let mut buffer = BytesMut::with_capacity(config.max_frame_size);
    let poll_interval = config.poll_interval();
    let stall_timeout = config.stall_timeout();
    let chunk_size = config.read_chunk_size.max(1);
    let mut last_growth = Instant::now();

    loop {
        let result = tokio::select! {
            () = cancel.cancelled() => break,
            result = async {
                let mut transport = transport.lock().await;
                transport.read(chunk_size, poll_interval).await
            } => result,
        };

        match result {
            Ok(bytes) if bytes.is_empty() => {
                if !buffer.is_empty() && last_growth.elapsed() >= stall_timeout {
                    warn!("Partial frame stalled, skipping byte 0x{:02x}", buffer[0]);
                    codec.skip_stalled(&mut buffer);
                    decode_available(&mut codec, &mut buffer, &shared);
                    last_growth = Instant::now();
                }
                tokio::task::yield_now().await;
            }
            Ok(bytes) => {
                debug!("RX {}", hex::encode(&bytes));
                buffer.extend_from_slice(&bytes);
                last_growth = Instant::now();
                decode_available(&mut codec, &mut buffer, &shared);
            }
            Err(e) => {
                warn!("Transport read failed: {e}");
                shared.fail(format!("read failed: {e}"));
                let mut transport = transport.lock().await;
                let _ = transport.close().await;
                break;
            }
        }
        shared.stats.lock().bytes_discarded = codec.discarded();
    }
    debug!("Reader stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transport::{memory_pair, MockTransport};
    use bytes::Bytes;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    fn test_config() -> SessionConfig {
        SessionConfig {
            response_timeout_ms: 100,
            stale_reply_window_ms: 1000,
            ..SessionConfig::default()
        }
    }

    /// Device end of a memory pair, answering by hand
    struct Peer {
        device: DuplexStream,
        codec: HarpCodec,
        buffer: BytesMut,
    }

    impl Peer {
        fn new(device: DuplexStream) -> Self {
            Self {
                device,
                codec: HarpCodec::new(),
                buffer: BytesMut::new(),
            }
        }

        async fn next_request(&mut self) -> Frame {
            loop {
                if let Some(frame) = self.codec.decode(&mut self.buffer).unwrap() {
                    return frame;
                }
                let mut chunk = [0u8; 64];
                let n = self.device.read(&mut chunk).await.unwrap();
                assert!(n > 0, "host closed the link");
                self.buffer.extend_from_slice(&chunk[..n]);
            }
        }

        async fn reply(&mut self, frame: &Frame) {
            self.device.write_all(&codec::encode(frame).unwrap()).await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_correlated_by_address() {
        let (transport, device) = memory_pair(1024);
        let session = DeviceSession::open(transport, test_config()).unwrap();

        let peer = tokio::spawn(async move {
            let mut peer = Peer::new(device);
            let request = peer.next_request().await;
            assert_eq!(request.address, registers::WHO_AM_I);
            // Reply for another register first, then the real one
            peer.reply(&Frame::with_payload(MessageType::Read, 5, &Payload::from(1u8))).await;
            peer.reply(&Frame::with_payload(MessageType::Read, 0, &Payload::from(1216u16))).await;
            peer
        });

        assert_eq!(session.read_u16(registers::WHO_AM_I).await.unwrap(), 1216);
        let _peer = peer.await.unwrap();
        assert_eq!(session.stats().unsolicited, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_error_not_retried() {
        let (transport, device) = memory_pair(1024);
        let session = DeviceSession::open(transport, test_config()).unwrap();

        let peer = tokio::spawn(async move {
            let mut peer = Peer::new(device);
            let request = peer.next_request().await;
            let error = Frame::with_payload(MessageType::WriteError, request.address, &Payload::from(0u8));
            peer.reply(&error).await;
            peer
        });

        let err = session
            .send(&Frame::write(40, &Payload::from(1u8)), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, HarpError::Device { address: 40, .. }));
        let _peer = peer.await.unwrap();
        let stats = session.stats();
        assert_eq!(stats.frames_sent, 1);
        assert_eq!(stats.retries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_retries_then_fails() {
        let (transport, _device) = memory_pair(1024);
        let session = DeviceSession::open(transport, test_config()).unwrap();

        let err = session.read_register(registers::OPERATION_CTRL, DataType::U8).await.unwrap_err();
        match err {
            HarpError::Timeout { address, attempts, .. } => {
                assert_eq!(address, registers::OPERATION_CTRL);
                assert_eq!(attempts, 4);
            }
            other => panic!("unexpected {other:?}"),
        }
        let stats = session.stats();
        assert_eq!(stats.frames_sent, 4);
        assert_eq!(stats.timeouts, 4);
        assert_eq!(stats.retries, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_reply_not_misattributed() {
        let (transport, device) = memory_pair(1024);
        let config = SessionConfig {
            max_retries: 0,
            ..test_config()
        };
        let session = DeviceSession::open(transport, config).unwrap();

        let first = session.send(&Frame::read(33, DataType::U8), Duration::from_millis(50)).await;
        assert!(matches!(first, Err(HarpError::Timeout { attempts: 1, .. })));

        let peer = tokio::spawn(async move {
            let mut peer = Peer::new(device);
            let abandoned = peer.next_request().await;
            peer.reply(&Frame::with_payload(MessageType::Read, abandoned.address, &Payload::from(1u8)))
                .await;
            let current = peer.next_request().await;
            peer.reply(&Frame::with_payload(MessageType::Read, current.address, &Payload::from(2u8)))
                .await;
            peer
        });

        let second = session
            .send(&Frame::read(33, DataType::U8), Duration::from_millis(500))
            .await
            .unwrap();
        assert_eq!(second.value(), Some(Payload::U8(vec![2])));
        let _peer = peer.await.unwrap();
        assert_eq!(session.stats().stale_discarded, 1);
    }

    #[tokio::test]
    async fn test_register_recovers_after_exhausted_retries() {
        let (transport, device) = memory_pair(1024);
        let session = DeviceSession::open(transport, test_config()).unwrap();

        let peer = tokio::spawn(async move {
            let mut peer = Peer::new(device);
            for _ in 0..4 {
                peer.next_request().await;
            }
            for value in [7u8, 8] {
                let request = peer.next_request().await;
                peer.reply(&Frame::with_payload(MessageType::Read, request.address, &Payload::from(value)))
                    .await;
            }
            peer
        });

        let first = session.send(&Frame::read(40, DataType::U8), Duration::from_millis(50)).await;
        assert!(matches!(first, Err(HarpError::Timeout { attempts: 4, .. })));

        // Only the first reply after the silence is taken for a late one
        let second = session
            .send(&Frame::read(40, DataType::U8), Duration::from_millis(200))
            .await
            .unwrap();
        assert_eq!(second.value(), Some(Payload::U8(vec![8])));
        let _peer = peer.await.unwrap();

        let stats = session.stats();
        assert_eq!(stats.stale_discarded, 1);
        assert_eq!(stats.frames_sent, 6);
    }

    #[tokio::test]
    async fn test_event_frames_never_sent() {
        let (transport, _device) = memory_pair(64);
        let session = DeviceSession::open(transport, test_config()).unwrap();
        let event = Frame::with_payload(MessageType::Event, 8, &Payload::from(1u32));
        let err = session.send(&event, Duration::from_millis(10)).await.unwrap_err();
        assert!(matches!(err, HarpError::InvalidRequest { address: 8, .. }));
        assert_eq!(session.stats().frames_sent, 0);
    }

    #[tokio::test]
    async fn test_write_failure_closes_session() {
        let mut mock = MockTransport::new();
        mock.expect_is_open().return_const(true);
        mock.expect_connection_info().return_const("mock".to_string());
        mock.expect_read().returning(|_, _| Ok(Bytes::new()));
        mock.expect_write()
            .times(1)
            .returning(|_| Err(TransportError::Disconnected));
        mock.expect_close().returning(|| Ok(()));

        let session = DeviceSession::open(mock, test_config()).unwrap();
        let err = session.read_register(registers::WHO_AM_I, DataType::U16).await.unwrap_err();
        assert!(matches!(err, HarpError::Transport { address: 0, .. }));
        assert!(err.is_fatal());
        assert!(!session.is_open());

        let err = session.harp_seconds().await.unwrap_err();
        assert!(matches!(err, HarpError::SessionClosed { address: 8, .. }));
    }

    #[tokio::test]
    async fn test_read_failure_closes_session() {
        let mut mock = MockTransport::new();
        mock.expect_is_open().return_const(true);
        mock.expect_connection_info().return_const("mock".to_string());
        mock.expect_read().returning(|_, _| Err(TransportError::Disconnected));
        mock.expect_close().returning(|| Ok(()));

        let session = DeviceSession::open(mock, test_config()).unwrap();
        assert_eq!(session.poll_event(Duration::from_secs(5)).await, None);
        assert!(!session.is_open());
    }

    #[tokio::test]
    async fn test_access_violation_sends_nothing() {
        let mut mock = MockTransport::new();
        mock.expect_is_open().return_const(true);
        mock.expect_connection_info().return_const("mock".to_string());
        mock.expect_read().returning(|_, _| Ok(Bytes::new()));
        mock.expect_write().never();
        mock.expect_close().returning(|| Ok(()));

        let session = DeviceSession::open(mock, test_config()).unwrap();
        let err = session
            .write_register(registers::WHO_AM_I, &Payload::from(7u16))
            .await
            .unwrap_err();
        assert!(matches!(err, HarpError::AccessViolation { .. }));
        assert_eq!(err.address(), registers::WHO_AM_I);
        session.close().await;
    }
}
