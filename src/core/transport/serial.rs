//! Serial port transport implementation

use super::stream::StreamTransport;
use super::{Transport, TransportError, TransportStats};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_serial::{DataBits, FlowControl, Parity, SerialStream, StopBits};
use tracing::{debug, info};

/// Serial port flow control type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerialFlowControl {
    /// No flow control
    #[default]
    None,
    /// Hardware flow control (RTS/CTS)
    Hardware,
    /// Software flow control (XON/XOFF)
    Software,
}

/// Serial port parity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerialParity {
    /// No parity
    #[default]
    None,
    /// Odd parity
    Odd,
    /// Even parity
    Even,
}

impl std::str::FromStr for SerialParity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" | "n" => Ok(Self::None),
            "odd" | "o" => Ok(Self::Odd),
            "even" | "e" => Ok(Self::Even),
            other => Err(format!("unknown parity '{other}'")),
        }
    }
}

/// Serial port configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Port name (e.g., COM3, /dev/ttyACM0)
    pub port: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Data bits (5, 6, 7, 8)
    pub data_bits: u8,
    /// Stop bits (1, 2)
    pub stop_bits: u8,
    /// Parity
    pub parity: SerialParity,
    /// Flow control
    pub flow_control: SerialFlowControl,
}

impl SerialConfig {
    /// Harp devices run at 1 Mbaud
    pub const DEFAULT_BAUD_RATE: u32 = 1_000_000;

    /// Create a new serial configuration with default framing (8N1)
    pub fn new(port: &str, baud_rate: u32) -> Self {
        Self {
            port: port.to_string(),
            baud_rate,
            data_bits: 8,
            stop_bits: 1,
            parity: SerialParity::None,
            flow_control: SerialFlowControl::None,
        }
    }

    /// Set parity
    #[must_use]
    pub fn parity(mut self, parity: SerialParity) -> Self {
        self.parity = parity;
        self
    }

    /// Set flow control
    #[must_use]
    pub fn flow_control(mut self, flow: SerialFlowControl) -> Self {
        self.flow_control = flow;
        self
    }

    fn builder(&self) -> Result<tokio_serial::SerialPortBuilder, TransportError> {
        if self.port.is_empty() {
            return Err(TransportError::InvalidConfiguration("no serial port given".into()));
        }
        let data_bits = match self.data_bits {
            5 => DataBits::Five,
            6 => DataBits::Six,
            7 => DataBits::Seven,
            8 => DataBits::Eight,
            other => {
                return Err(TransportError::InvalidConfiguration(format!("{other} data bits")));
            }
        };
        let stop_bits = match self.stop_bits {
            1 => StopBits::One,
            2 => StopBits::Two,
            other => {
                return Err(TransportError::InvalidConfiguration(format!("{other} stop bits")));
            }
        };
        let parity = match self.parity {
            SerialParity::Odd => Parity::Odd,
            SerialParity::Even => Parity::Even,
            SerialParity::None => Parity::None,
        };
        let flow_control = match self.flow_control {
            SerialFlowControl::Hardware => FlowControl::Hardware,
            SerialFlowControl::Software => FlowControl::Software,
            SerialFlowControl::None => FlowControl::None,
        };

        Ok(tokio_serial::new(&self.port, self.baud_rate)
            .data_bits(data_bits)
            .stop_bits(stop_bits)
            .parity(parity)
            .flow_control(flow_control))
    }
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self::new("", Self::DEFAULT_BAUD_RATE)
    }
}

fn map_open_error(port: &str, e: tokio_serial::Error) -> TransportError {
    match e.kind() {
        tokio_serial::ErrorKind::NoDevice => TransportError::PortNotFound(port.to_string()),
        tokio_serial::ErrorKind::InvalidInput => TransportError::InvalidConfiguration(e.to_string()),
        tokio_serial::ErrorKind::Io(io_kind) => match io_kind {
            std::io::ErrorKind::NotFound => TransportError::PortNotFound(port.to_string()),
            std::io::ErrorKind::PermissionDenied => TransportError::PermissionDenied(port.to_string()),
            _ => TransportError::ConnectionFailed(e.to_string()),
        },
        _ => TransportError::ConnectionFailed(e.to_string()),
    }
}

/// Serial port transport
///
/// Holds the port exclusively; dropping the transport releases it.
pub struct SerialTransport {
    config: SerialConfig,
    inner: StreamTransport<SerialStream>,
}

impl SerialTransport {
    /// Open the configured port
    pub fn open(config: SerialConfig) -> Result<Self, TransportError> {
        let builder = config.builder()?;
        #[allow(unused_mut)]
        let mut stream = SerialStream::open(&builder).map_err(|e| map_open_error(&config.port, e))?;

        #[cfg(unix)]
        stream
            .set_exclusive(true)
            .map_err(|_| TransportError::PortInUse(config.port.clone()))?;

        info!("Opened {} @ {} baud", config.port, config.baud_rate);
        let info = format!(
            "{} @ {} baud ({}{}{})",
            config.port,
            config.baud_rate,
            config.data_bits,
            match config.parity {
                SerialParity::None => "N",
                SerialParity::Odd => "O",
                SerialParity::Even => "E",
            },
            config.stop_bits,
        );
        Ok(Self {
            config,
            inner: StreamTransport::new(stream, info),
        })
    }

    /// Configuration this port was opened with
    pub fn config(&self) -> &SerialConfig {
        &self.config
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn read(&mut self, max_bytes: usize, timeout: Duration) -> Result<Bytes, TransportError> {
        self.inner.read(max_bytes, timeout).await
    }

    async fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        self.inner.write(data).await
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        debug!("Closing {}", self.config.port);
        self.inner.close().await
    }

    fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    fn connection_info(&self) -> String {
        self.inner.connection_info()
    }

    fn stats(&self) -> TransportStats {
        self.inner.stats()
    }
}

/// Serial endpoint found on this machine
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortInfo {
    /// OS port name
    pub name: String,
    /// Port kind ("usb", "pci", "bluetooth", "unknown")
    pub kind: String,
    /// USB product string, when known
    pub product: Option<String>,
    /// USB serial number, when known
    pub serial_number: Option<String>,
}

/// List serial endpoints
pub fn list_ports() -> Result<Vec<PortInfo>, TransportError> {
    let ports = serialport::available_ports().map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
    Ok(ports
        .into_iter()
        .map(|p| {
            let (kind, product, serial_number) = match p.port_type {
                serialport::SerialPortType::UsbPort(usb) => ("usb", usb.product, usb.serial_number),
                serialport::SerialPortType::PciPort => ("pci", None, None),
                serialport::SerialPortType::BluetoothPort => ("bluetooth", None, None),
                serialport::SerialPortType::Unknown => ("unknown", None, None),
            };
            PortInfo {
                name: p.port_name,
                kind: kind.to_string(),
                product,
                serial_number,
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_harp_baud() {
        let config = SerialConfig::default();
        assert_eq!(config.baud_rate, 1_000_000);
        assert_eq!(config.data_bits, 8);
    }

    #[test]
    fn test_invalid_framing_rejected() {
        let mut config = SerialConfig::new("/dev/ttyACM0", 1_000_000);
        config.data_bits = 9;
        assert!(matches!(config.builder(), Err(TransportError::InvalidConfiguration(_))));
        assert!(matches!(
            SerialConfig::default().builder(),
            Err(TransportError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_missing_port_fails_to_open() {
        let config = SerialConfig::new("/dev/harpcom-does-not-exist", 1_000_000);
        assert!(SerialTransport::open(config).is_err());
    }

    #[test]
    fn test_parity_parse() {
        assert_eq!("E".parse::<SerialParity>(), Ok(SerialParity::Even));
        assert!("mark".parse::<SerialParity>().is_err());
    }
}
