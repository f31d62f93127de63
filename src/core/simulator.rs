//! Virtual Harp device
//!
//! Emulates the core register bank of a device on the far end of an
//! in-memory link, including heartbeat events, timestamped replies and
//! optional fault injection. Used by the test suite and by `--simulate`.

use super::protocol::codec;
use super::protocol::{Frame, HarpCodec, HarpTimestamp, MessageType, Payload, DEVICE_PORT};
use super::registers::{self, OperationControl, OperationMode, Register, RegisterCatalog};
use super::transport::{memory_pair, StreamTransport};
use bytes::{Bytes, BytesMut};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::codec::Decoder;
use tracing::{debug, trace};

/// Fault injection on frames leaving the device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FaultConfig {
    /// Probability of flipping one byte of an outgoing frame (0.0 - 1.0)
    pub corruption_probability: f32,
    /// Probability of not sending an outgoing frame at all (0.0 - 1.0)
    pub drop_probability: f32,
    /// Seed for reproducible runs
    pub seed: Option<u64>,
}

impl Default for FaultConfig {
    fn default() -> Self {
        Self {
            corruption_probability: 0.0,
            drop_probability: 0.0,
            seed: None,
        }
    }
}

/// Identity and behaviour of the virtual device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VirtualDeviceConfig {
    /// WHO_AM_I
    pub who_am_i: u16,
    /// Hardware version (major, minor)
    pub hardware_version: (u8, u8),
    /// Assembly version
    pub assembly_version: u8,
    /// Core version (major, minor)
    pub core_version: (u8, u8),
    /// Firmware version (major, minor)
    pub firmware_version: (u8, u8),
    /// Serial number
    pub serial_number: u16,
    /// Device name (truncated to 25 bytes)
    pub device_name: String,
    /// UUID register contents
    pub uuid: u128,
    /// Build tag (truncated to 8 bytes)
    pub tag: String,
    /// Harp time at start-up, in microseconds
    pub start_micros: u64,
    /// Heartbeat period
    pub heartbeat_interval_ms: u64,
    /// Outgoing fault injection
    pub faults: FaultConfig,
}

impl Default for VirtualDeviceConfig {
    fn default() -> Self {
        Self {
            who_am_i: 1216,
            hardware_version: (1, 0),
            assembly_version: 0,
            core_version: (1, 13),
            firmware_version: (0, 1),
            serial_number: 1,
            device_name: "harpcom-virtual".into(),
            uuid: 0x0123_4567_89ab_cdef_fedc_ba98_7654_3210,
            tag: "v0.1.0".into(),
            start_micros: 0,
            heartbeat_interval_ms: 1000,
            faults: FaultConfig::default(),
        }
    }
}

fn padded(text: &str, len: usize) -> Vec<u8> {
    let mut bytes = text.as_bytes().to_vec();
    bytes.resize(len, 0);
    bytes
}

/// Emulated Harp device
pub struct VirtualDevice {
    catalog: RegisterCatalog,
    values: Vec<Vec<u8>>,
    clock_epoch: Instant,
    clock_base_micros: u64,
    heartbeat_interval: Duration,
    faults: FaultConfig,
    rng: StdRng,
}

impl VirtualDevice {
    /// Build a device with the given identity
    pub fn new(config: VirtualDeviceConfig) -> Self {
        let catalog = RegisterCatalog::core();
        let mut values: Vec<Vec<u8>> = catalog.iter().map(|r| vec![0u8; r.byte_size()]).collect();
        let mut set = |address: u8, bytes: Vec<u8>| values[usize::from(address)] = bytes;

        set(registers::WHO_AM_I, config.who_am_i.to_le_bytes().to_vec());
        set(registers::HW_VERSION_H, vec![config.hardware_version.0]);
        set(registers::HW_VERSION_L, vec![config.hardware_version.1]);
        set(registers::ASSEMBLY_VERSION, vec![config.assembly_version]);
        set(registers::CORE_VERSION_H, vec![config.core_version.0]);
        set(registers::CORE_VERSION_L, vec![config.core_version.1]);
        set(registers::FIRMWARE_VERSION_H, vec![config.firmware_version.0]);
        set(registers::FIRMWARE_VERSION_L, vec![config.firmware_version.1]);
        set(
            registers::OPERATION_CTRL,
            vec![OperationControl::default().with_mode(OperationMode::Active).0],
        );
        set(registers::DEVICE_NAME, padded(&config.device_name, 25));
        set(registers::SERIAL_NUMBER, config.serial_number.to_le_bytes().to_vec());
        let mut uuid = (config.uuid as u64).to_le_bytes().to_vec();
        uuid.extend_from_slice(&((config.uuid >> 64) as u64).to_le_bytes());
        set(registers::UUID, uuid);
        set(registers::TAG, padded(&config.tag, 8));

        let rng = match config.faults.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Self {
            catalog,
            values,
            clock_epoch: Instant::now(),
            clock_base_micros: config.start_micros,
            heartbeat_interval: Duration::from_millis(config.heartbeat_interval_ms.max(1)),
            faults: config.faults,
            rng,
        }
    }

    /// Spawn a device behind an in-memory link and return the host side
    pub fn connect(config: VirtualDeviceConfig) -> (StreamTransport<DuplexStream>, JoinHandle<()>) {
        let (transport, stream) = memory_pair(4096);
        let device = Self::new(config);
        (transport, tokio::spawn(device.run(stream)))
    }

    /// Current Harp time
    pub fn harp_time(&self) -> HarpTimestamp {
        let elapsed = self.clock_epoch.elapsed().as_micros() as u64;
        HarpTimestamp::from_micros(self.clock_base_micros.wrapping_add(elapsed))
    }

    fn set_harp_micros(&mut self, micros: u64) {
        self.clock_epoch = Instant::now();
        self.clock_base_micros = micros;
    }

    fn control(&self) -> OperationControl {
        OperationControl(self.values[usize::from(registers::OPERATION_CTRL)][0])
    }

    /// Serve requests until the host closes the link
    pub async fn run<S>(mut self, mut stream: S)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut codec = HarpCodec::new();
        let mut buffer = BytesMut::with_capacity(256);
        let mut chunk = [0u8; 256];
        let mut heartbeat =
            tokio::time::interval_at(Instant::now() + self.heartbeat_interval, self.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let outgoing = tokio::select! {
                read = stream.read(&mut chunk) => match read {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        buffer.extend_from_slice(&chunk[..n]);
                        let mut replies = Vec::new();
                        loop {
                            match codec.decode(&mut buffer) {
                                Ok(Some(request)) => replies.extend(self.handle(&request)),
                                Ok(None) => break,
                                Err(e) => debug!("Virtual device ignoring corrupt request: {e}"),
                            }
                        }
                        replies
                    }
                },
                _ = heartbeat.tick() => self.heartbeat().into_iter().collect(),
            };

            for frame in outgoing {
                let Some(bytes) = self.emit(&frame) else {
                    continue;
                };
                if stream.write_all(&bytes).await.is_err() {
                    return;
                }
            }
        }
        debug!("Virtual device stopped");
    }

    fn heartbeat(&self) -> Option<Frame> {
        if !self.control().emits_heartbeat() {
            return None;
        }
        let now = self.harp_time();
        let event = Frame::with_payload(
            MessageType::Event,
            registers::TIMESTAMP_SECOND,
            &Payload::from(now.seconds),
        );
        Some(event.timestamped(now))
    }

    fn emit(&mut self, frame: &Frame) -> Option<Vec<u8>> {
        let mut bytes = codec::encode(frame).ok()?;
        if self.faults.drop_probability > 0.0 && self.rng.gen::<f32>() < self.faults.drop_probability {
            trace!("Dropping {frame}");
            return None;
        }
        if self.faults.corruption_probability > 0.0 && self.rng.gen::<f32>() < self.faults.corruption_probability {
            let index = self.rng.gen_range(0..bytes.len());
            bytes[index] ^= self.rng.gen_range(1..=u8::MAX);
            trace!("Corrupted byte {index} of {frame}");
        }
        Some(bytes)
    }

    fn value_of(&self, reg: &Register) -> Bytes {
        match reg.address {
            registers::TIMESTAMP_SECOND => Bytes::copy_from_slice(&self.harp_time().seconds.to_le_bytes()),
            registers::TIMESTAMP_MICRO => Bytes::copy_from_slice(&self.harp_time().ticks.to_le_bytes()),
            address => Bytes::copy_from_slice(&self.values[usize::from(address)]),
        }
    }

    fn reply(&self, message_type: MessageType, reg: &Register) -> Frame {
        Frame::new(message_type, reg.address, DEVICE_PORT, reg.data_type, self.value_of(reg))
            .timestamped(self.harp_time())
    }

    fn error_for(request: &Frame) -> MessageType {
        if request.message_type == MessageType::Write {
            MessageType::WriteError
        } else {
            MessageType::ReadError
        }
    }

    /// Answer one request; muted devices answer nothing
    pub fn handle(&mut self, request: &Frame) -> Vec<Frame> {
        if !request.message_type.is_request() {
            return Vec::new();
        }
        let muted = self.control().mute_replies();
        let Some(reg) = self.catalog.lookup(request.address) else {
            if muted {
                return Vec::new();
            }
            let error = Frame::new(
                Self::error_for(request),
                request.address,
                DEVICE_PORT,
                request.payload_type,
                Bytes::new(),
            );
            return vec![error.timestamped(self.harp_time())];
        };

        if request.payload_type != reg.data_type {
            return if muted {
                Vec::new()
            } else {
                vec![self.reply(Self::error_for(request), reg)]
            };
        }

        match request.message_type {
            MessageType::Read if !muted => vec![self.reply(MessageType::Read, reg)],
            MessageType::Write => self.write(reg, request),
            _ => Vec::new(),
        }
    }

    fn write(&mut self, reg: &Register, request: &Frame) -> Vec<Frame> {
        if !reg.access.writable() || request.payload.len() != reg.byte_size() {
            return if self.control().mute_replies() {
                Vec::new()
            } else {
                vec![self.reply(MessageType::WriteError, reg)]
            };
        }

        let mut dump = false;
        match reg.address {
            registers::TIMESTAMP_SECOND => {
                let mut raw = [0u8; 4];
                raw.copy_from_slice(&request.payload);
                let seconds = u64::from(u32::from_le_bytes(raw));
                let sub_second = self.harp_time().as_micros() % 1_000_000;
                self.set_harp_micros(seconds * 1_000_000 + sub_second);
                debug!("Virtual device clock set to {seconds} s");
            }
            registers::TIMESTAMP_MICRO => {
                let mut raw = [0u8; 2];
                raw.copy_from_slice(&request.payload);
                let ticks = u64::from(u16::from_le_bytes(raw));
                let seconds = u64::from(self.harp_time().seconds);
                self.set_harp_micros(seconds * 1_000_000 + ticks * u64::from(HarpTimestamp::TICK_MICROS));
            }
            registers::OPERATION_CTRL => {
                let requested = OperationControl(request.payload[0]);
                dump = requested.dump();
                self.values[usize::from(reg.address)] = vec![requested.with_dump(false).0];
                debug!("Virtual device control: {}", self.control());
            }
            address => self.values[usize::from(address)] = request.payload.to_vec(),
        }

        if self.control().mute_replies() {
            return Vec::new();
        }
        let mut replies = vec![self.reply(MessageType::Write, reg)];
        if dump {
            replies.extend(self.catalog.iter().map(|r| self.reply(MessageType::Read, r)));
        }
        replies
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::protocol::DataType;

    fn device() -> VirtualDevice {
        VirtualDevice::new(VirtualDeviceConfig::default())
    }

    #[tokio::test]
    async fn test_read_replies_are_timestamped() {
        let mut dev = device();
        let replies = dev.handle(&Frame::read(registers::WHO_AM_I, DataType::U16));
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].message_type, MessageType::Read);
        assert_eq!(replies[0].value(), Some(Payload::U16(vec![1216])));
        assert!(replies[0].timestamp.is_some());
    }

    #[tokio::test]
    async fn test_read_only_write_rejected() {
        let mut dev = device();
        let replies = dev.handle(&Frame::write(registers::UUID, &Payload::U8(vec![0; 16])));
        assert_eq!(replies[0].message_type, MessageType::WriteError);
    }

    #[tokio::test]
    async fn test_unknown_address_rejected() {
        let mut dev = device();
        let replies = dev.handle(&Frame::read(99, DataType::U8));
        assert_eq!(replies[0].message_type, MessageType::ReadError);
        assert_eq!(replies[0].address, 99);
    }

    #[tokio::test(start_paused = true)]
    async fn test_seconds_write_keeps_sub_second() {
        let mut dev = device();
        tokio::time::advance(Duration::from_micros(250_016)).await;
        dev.handle(&Frame::write(registers::TIMESTAMP_SECOND, &Payload::from(3_000_000_000u32)));
        let now = dev.harp_time();
        assert_eq!(now.seconds, 3_000_000_000);
        assert_eq!(now.as_micros() % 1_000_000, 250_016);
    }

    #[tokio::test]
    async fn test_dump_and_mute() {
        let mut dev = device();
        let dump = OperationControl::default().with_mode(OperationMode::Active).with_dump(true);
        let replies = dev.handle(&Frame::write(registers::OPERATION_CTRL, &Payload::from(dump.0)));
        assert_eq!(replies.len(), 1 + registers::CORE_REGISTER_COUNT);
        assert!(!dev.control().dump());

        let mute = OperationControl::default().with_mode(OperationMode::Active).with_mute_replies(true);
        assert!(dev
            .handle(&Frame::write(registers::OPERATION_CTRL, &Payload::from(mute.0)))
            .is_empty());
        assert!(dev.handle(&Frame::read(registers::WHO_AM_I, DataType::U16)).is_empty());
    }

    #[tokio::test]
    async fn test_heartbeat_gated_by_control() {
        let mut dev = device();
        assert!(dev.heartbeat().is_none());
        let on = dev.control().with_heartbeat(true);
        dev.handle(&Frame::write(registers::OPERATION_CTRL, &Payload::from(on.0)));
        let event = dev.heartbeat().unwrap();
        assert_eq!(event.message_type, MessageType::Event);
        assert_eq!(event.address, registers::TIMESTAMP_SECOND);
    }

    #[tokio::test]
    async fn test_corruption_is_reproducible() {
        let faults = FaultConfig {
            corruption_probability: 1.0,
            drop_probability: 0.0,
            seed: Some(7),
        };
        let config = VirtualDeviceConfig {
            faults,
            ..VirtualDeviceConfig::default()
        };
        let frame = Frame::read(registers::WHO_AM_I, DataType::U16);
        let a = VirtualDevice::new(config.clone()).emit(&frame).unwrap();
        let b = VirtualDevice::new(config).emit(&frame).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, codec::encode(&frame).unwrap());
    }
}
