//! Connection lifecycle management
//!
//! [`Connection`] exclusively owns the transport handle for the single device
//! session. Every open and close funnels through one state choke point, so
//! the `connected` channel and the derived `Connected`/`Initial` session
//! states can never disagree. Reset sequencing, monitoring, and flashing all
//! reach the port through this type, one operation at a time.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use log::{debug, info, warn};
use serialport::ErrorKind;

use crate::{
    error::Error,
    monitor::{self, MonitorHandle},
    state::{session_channels, EventSink, SessionEvents, SessionState},
    transport::{PortProvider, Transport},
};

pub(crate) mod reset;

/// Baud rate used for console traffic and loader bring-up.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Command understood by the on-device test firmware.
const SELF_TEST_COMMAND: &[u8] = b"SELFTEST\n";

/// The single device session: owns the port handle and publishes every state
/// change through the session channels.
pub struct Connection {
    provider: Box<dyn PortProvider>,
    transport: Option<Box<dyn Transport>>,
    connected: Arc<AtomicBool>,
    monitoring: Arc<AtomicBool>,
    monitor: Option<MonitorHandle>,
    events: EventSink,
    baud_rate: u32,
}

impl Connection {
    /// A disconnected session over the given port provider, plus the
    /// receiving half of its event channels.
    pub fn new(provider: Box<dyn PortProvider>) -> (Self, SessionEvents) {
        let (sink, events) = session_channels();

        let connection = Connection {
            provider,
            transport: None,
            connected: Arc::new(AtomicBool::new(false)),
            monitoring: Arc::new(AtomicBool::new(false)),
            monitor: None,
            events: sink,
            baud_rate: DEFAULT_BAUD_RATE,
        };

        (connection, events)
    }

    /// A clone of the sending half of the session channels, for components
    /// that report through the same streams.
    pub fn event_sink(&self) -> EventSink {
        self.events.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Request a port from the provider and open it.
    ///
    /// An existing connected handle is closed first so the physical port is
    /// never leaked. Emits `Connected` on success; on failure emits `Initial`
    /// and surfaces [`Error::PortUnavailable`] when the port is held
    /// elsewhere.
    pub fn connect(&mut self) -> Result<(), Error> {
        if self.transport.is_some() && self.is_connected() {
            debug!("port still connected, closing before reopen");
            self.close();
        }

        match self.provider.request_port() {
            Ok(transport) => {
                self.transport = Some(transport);
                self.open_transport()
            }
            Err(err) => {
                self.set_state(false);
                Err(self.classify_open_error(err))
            }
        }
    }

    /// Close and reopen the existing handle to re-establish a clean
    /// read/write context, e.g. after a failed write left the transport in an
    /// undefined state. Close errors are logged, never propagated.
    pub fn reconnect(&mut self) -> Result<(), Error> {
        let transport = self.transport.as_mut().ok_or(Error::NotConnected)?;

        if let Err(err) = transport.close() {
            warn!("error closing port before reopen: {err}");
        }
        self.set_state(false);

        self.open_transport()
    }

    /// Close the port. Errors during close are reported on the message
    /// stream but never prevent the state update.
    pub fn close(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            if let Err(err) = transport.close() {
                warn!("error closing port: {err}");
                self.events.message(format!("Error closing port: {err}"));
            } else {
                debug!("port closed");
            }
        }

        self.set_state(false);
    }

    /// Force the device into bootloader mode via the timed DTR/RTS sequence.
    pub fn reset_device(&mut self) -> Result<(), Error> {
        let transport = self.transport.as_deref_mut().ok_or(Error::NotConnected)?;
        reset::reset_device(transport, &self.events)
    }

    /// Reboot the device into run mode without touching the boot strap.
    pub fn restart_into_run_mode(&mut self) -> Result<(), Error> {
        let transport = self.transport.as_deref_mut().ok_or(Error::NotConnected)?;
        reset::restart_into_run_mode(transport, &self.events)
    }

    /// Ask the running firmware to start its self-test.
    pub fn send_self_test_command(&mut self) -> Result<(), Error> {
        let transport = self.transport.as_deref_mut().ok_or(Error::NotConnected)?;

        info!("sending self test command");
        transport.write(SELF_TEST_COMMAND)?;

        Ok(())
    }

    /// Start the console monitor loop on its reader thread.
    ///
    /// A no-op when the loop is already running.
    pub fn start_monitor(&mut self) -> Result<(), Error> {
        if self.monitor.is_some() {
            return Ok(());
        }

        let transport = self.transport.as_ref().ok_or(Error::NotConnected)?;
        let reader = transport.try_clone_reader()?;

        self.monitoring.store(true, Ordering::SeqCst);
        self.events.monitor_state(true);

        let handle = monitor::spawn(
            reader,
            Arc::clone(&self.connected),
            Arc::clone(&self.monitoring),
            self.events.clone(),
        )
        .map_err(Error::Monitor)?;
        self.monitor = Some(handle);

        Ok(())
    }

    /// Disable monitoring and wait for the reader thread to finish.
    ///
    /// Idempotent: safe to call twice in a row and with no loop active.
    /// Teardown errors are discarded.
    pub fn stop_monitor(&mut self) {
        self.monitoring.store(false, Ordering::SeqCst);
        self.events.monitor_state(false);

        if let Some(handle) = self.monitor.take() {
            handle.join();
        }
    }

    /// Record the caller-driven terminal transition once self-test results
    /// have been collected.
    pub fn mark_tested(&self) {
        self.events.state(SessionState::Tested);
    }

    /// Open the current handle and publish the resulting state. Tolerates a
    /// transport that is already open.
    fn open_transport(&mut self) -> Result<(), Error> {
        let baud_rate = self.baud_rate;
        let transport = self.transport.as_mut().ok_or(Error::NotConnected)?;

        match transport.open(baud_rate) {
            Ok(()) => {
                debug!("port open at {baud_rate} baud");
                self.set_state(true);
                Ok(())
            }
            Err(err) => {
                self.set_state(false);
                Err(self.classify_open_error(err))
            }
        }
    }

    /// Update the connectivity flag and both state channels together.
    fn set_state(&mut self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
        self.events.port_state(connected);
        self.events.state(if connected {
            SessionState::Connected
        } else {
            SessionState::Initial
        });
    }

    /// Distinguish a busy/inaccessible port from other open failures so the
    /// caller can show a specific remediation.
    fn classify_open_error(&self, err: serialport::Error) -> Error {
        let busy = matches!(err.kind(), ErrorKind::NoDevice)
            || matches!(err.kind(), ErrorKind::Io(kind) if kind == std::io::ErrorKind::PermissionDenied);

        if busy {
            Error::PortUnavailable {
                port: self.port_label(),
                source: err,
            }
        } else {
            Error::Serial(err)
        }
    }

    fn port_label(&self) -> String {
        self.transport
            .as_ref()
            .and_then(|transport| transport.name())
            .unwrap_or_else(|| "unknown".to_string())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.stop_monitor();
        self.close();
    }
}
