//! Serial transport boundary
//!
//! [`Transport`] is the narrow surface the session needs from a serial port:
//! idempotent open, a writable side, control-line access, and cloneable
//! readers for the monitor loop. [`SerialTransport`] implements it on top of
//! the `serialport` crate; tests substitute scripted doubles.

use std::{io::Read, time::Duration};

use serialport::SerialPort;

/// Read timeout for cloned readers. Bounds how long the monitor loop blocks
/// before it rechecks its cancellation flags.
const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// A serial link to the device.
///
/// The handle is exclusively owned by the connection lifecycle manager; other
/// components reach the port only through it, one operation at a time.
pub trait Transport: Send {
    /// Open the underlying port at the given baud rate.
    ///
    /// Must be idempotent: opening an already-open transport succeeds without
    /// reopening the physical port.
    fn open(&mut self, baud_rate: u32) -> serialport::Result<()>;

    /// Human-readable port identity for diagnostics.
    fn name(&self) -> Option<String> {
        None
    }

    /// Whether the underlying port is currently open.
    fn is_open(&self) -> bool;

    /// Close the underlying port. The handle may be reopened later.
    fn close(&mut self) -> serialport::Result<()>;

    /// Set the DTR and/or RTS control lines. `None` leaves a line untouched.
    fn set_signals(&mut self, dtr: Option<bool>, rts: Option<bool>) -> serialport::Result<()>;

    /// An independently owned handle onto the readable side of the port.
    ///
    /// Reads must return [`std::io::ErrorKind::TimedOut`] after a bounded
    /// wait so a reader can be cancelled cooperatively.
    fn try_clone_reader(&self) -> serialport::Result<Box<dyn Read + Send>>;

    /// Write `data` to the port and flush it out.
    fn write(&mut self, data: &[u8]) -> serialport::Result<()>;
}

/// Injected capability that yields the transport for a session.
///
/// Device discovery (listing ports, prompting the user) belongs to the
/// caller; the session only ever asks the provider for a port.
pub trait PortProvider {
    fn request_port(&mut self) -> serialport::Result<Box<dyn Transport>>;
}

/// [`Transport`] backed by a system serial port.
pub struct SerialTransport {
    port_name: String,
    port: Option<Box<dyn SerialPort>>,
}

impl SerialTransport {
    pub fn new(port_name: impl Into<String>) -> Self {
        SerialTransport {
            port_name: port_name.into(),
            port: None,
        }
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    fn port_mut(&mut self) -> serialport::Result<&mut Box<dyn SerialPort>> {
        self.port.as_mut().ok_or_else(not_open)
    }
}

impl Transport for SerialTransport {
    fn open(&mut self, baud_rate: u32) -> serialport::Result<()> {
        if self.port.is_some() {
            return Ok(());
        }

        let port = serialport::new(&self.port_name, baud_rate)
            .timeout(READ_TIMEOUT)
            .open()?;
        self.port = Some(port);

        Ok(())
    }

    fn name(&self) -> Option<String> {
        Some(self.port_name.clone())
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn close(&mut self) -> serialport::Result<()> {
        // Dropping the handle releases the file descriptor.
        self.port.take().map(drop).ok_or_else(not_open)
    }

    fn set_signals(&mut self, dtr: Option<bool>, rts: Option<bool>) -> serialport::Result<()> {
        let port = self.port_mut()?;

        if let Some(level) = dtr {
            port.write_data_terminal_ready(level)?;
        }
        if let Some(level) = rts {
            port.write_request_to_send(level)?;
        }

        Ok(())
    }

    fn try_clone_reader(&self) -> serialport::Result<Box<dyn Read + Send>> {
        let port = self.port.as_ref().ok_or_else(not_open)?;
        let reader = port.try_clone()?;

        Ok(Box::new(reader))
    }

    fn write(&mut self, data: &[u8]) -> serialport::Result<()> {
        let port = self.port_mut()?;
        port.write_all(data).map_err(into_serial_error)?;
        port.flush().map_err(into_serial_error)?;

        Ok(())
    }
}

/// [`PortProvider`] that hands out a [`SerialTransport`] for a fixed system
/// port name.
pub struct SystemPortProvider {
    port_name: String,
}

impl SystemPortProvider {
    pub fn new(port_name: impl Into<String>) -> Self {
        SystemPortProvider {
            port_name: port_name.into(),
        }
    }
}

impl PortProvider for SystemPortProvider {
    fn request_port(&mut self) -> serialport::Result<Box<dyn Transport>> {
        Ok(Box::new(SerialTransport::new(self.port_name.clone())))
    }
}

fn not_open() -> serialport::Error {
    serialport::Error::new(serialport::ErrorKind::NoDevice, "port is not open")
}

fn into_serial_error(err: std::io::Error) -> serialport::Error {
    serialport::Error::new(serialport::ErrorKind::Io(err.kind()), err.to_string())
}
