//! Serial port link implementation

use super::{SerialLink, TransportError};
use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};
use std::io::{Read, Write};
use std::time::Duration;
use tracing::{debug, info};

/// Poll interval for non-blocking reads; the engine loops on top of this
const READ_POLL: Duration = Duration::from_millis(10);

/// `serialport`-backed implementation of [`SerialLink`]
///
/// Always 8-N-1, no flow control, as RS-485 Modbus modules expect.
pub struct SerialPortLink {
    path: String,
    baudrate: u32,
    port: Option<Box<dyn SerialPort>>,
}

impl SerialPortLink {
    /// Create a closed link for `path` at `baudrate`; no I/O happens here
    pub fn new(path: &str, baudrate: u32) -> Self {
        Self {
            path: path.to_string(),
            baudrate,
            port: None,
        }
    }

    fn port_mut(&mut self) -> Result<&mut Box<dyn SerialPort>, TransportError> {
        self.port.as_mut().ok_or(TransportError::NotConnected)
    }
}

impl SerialLink for SerialPortLink {
    fn open(&mut self) -> Result<(), TransportError> {
        if self.port.is_some() {
            self.close();
        }

        let port = serialport::new(&self.path, self.baudrate)
            .data_bits(DataBits::Eight)
            .stop_bits(StopBits::One)
            .parity(Parity::None)
            .flow_control(FlowControl::None)
            .timeout(READ_POLL)
            .open()
            .map_err(|e| match e.kind() {
                serialport::ErrorKind::NoDevice => TransportError::PortNotFound(self.path.clone()),
                serialport::ErrorKind::Io(std::io::ErrorKind::PermissionDenied) => {
                    TransportError::PermissionDenied(self.path.clone())
                }
                _ => TransportError::ConnectionFailed(e.to_string()),
            })?;

        info!(port = %self.path, baudrate = self.baudrate, "serial port opened");
        self.port = Some(port);
        Ok(())
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            debug!(port = %self.path, "serial port closed");
        }
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn name(&self) -> &str {
        &self.path
    }

    fn baudrate(&self) -> u32 {
        self.baudrate
    }

    fn set_baudrate(&mut self, baudrate: u32) -> Result<(), TransportError> {
        self.baudrate = baudrate;
        if let Some(port) = self.port.as_mut() {
            port.set_baud_rate(baudrate)
                .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        }
        Ok(())
    }

    fn read_available(&mut self, buf: &mut Vec<u8>) -> Result<usize, TransportError> {
        let port = self.port_mut()?;
        let waiting = port
            .bytes_to_read()
            .map_err(|e| TransportError::Io(std::io::Error::other(e)))? as usize;
        if waiting == 0 {
            return Ok(0);
        }
        let start = buf.len();
        buf.resize(start + waiting, 0);
        match port.read(&mut buf[start..]) {
            Ok(n) => {
                buf.truncate(start + n);
                Ok(n)
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => {
                buf.truncate(start);
                Ok(0)
            }
            Err(e) => {
                buf.truncate(start);
                Err(TransportError::Io(e))
            }
        }
    }

    fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let port = self.port_mut()?;
        port.write_all(data)?;
        port.flush()?;
        Ok(())
    }

    fn flush_input(&mut self) -> Result<(), TransportError> {
        self.port_mut()?
            .clear(ClearBuffer::Input)
            .map_err(|e| TransportError::Io(std::io::Error::other(e)))
    }

    fn flush_output(&mut self) -> Result<(), TransportError> {
        self.port_mut()?
            .clear(ClearBuffer::Output)
            .map_err(|e| TransportError::Io(std::io::Error::other(e)))
    }
}

/// Well-known device paths probed in addition to the system port list
const WELL_KNOWN_PREFIXES: &[&str] = &["/dev/ttyACM", "/dev/ttyUSB", "/dev/ttyS", "/dev/ttyAMA"];

/// Enumerate candidate serial ports
///
/// Merges the system device list with a sweep of well-known paths
/// (`/dev/ttyACM*`, `/dev/ttyUSB*`, `/dev/ttyS*`, `/dev/ttyAMA*`, `COM*`),
/// keeping only paths that exist, de-duplicated in discovery order.
pub fn available_ports() -> Vec<String> {
    let mut ports: Vec<String> = Vec::new();

    if let Ok(listed) = serialport::available_ports() {
        for info in listed {
            if !ports.contains(&info.port_name) {
                ports.push(info.port_name);
            }
        }
    }

    for prefix in WELL_KNOWN_PREFIXES {
        for index in 0..10 {
            let candidate = format!("{prefix}{index}");
            if !ports.contains(&candidate) && std::path::Path::new(&candidate).exists() {
                ports.push(candidate);
            }
        }
    }

    if cfg!(windows) {
        for index in 1..10 {
            let candidate = format!("COM{index}");
            if !ports.contains(&candidate) {
                ports.push(candidate);
            }
        }
    }

    debug!(count = ports.len(), "enumerated serial ports");
    ports
}
