//! Test-session states and the event channels that publish them
//!
//! Every component reports through one [`EventSink`]; the caller consumes the
//! matching [`SessionEvents`] receivers. Each channel has a single consumer
//! and delivers events in the order the underlying operations completed.

use std::sync::mpsc::{channel, Receiver, Sender};

use strum::{Display, EnumIter};

use crate::partition::PartitionProgress;

/// Progress of one test session, from an idle port to a completed self-test.
///
/// There is exactly one active state at a time. A state persists until the
/// next qualifying event; no transition is driven by a timeout. No state is
/// terminal: `connect()` always restarts the cycle from [`Initial`].
///
/// [`Initial`]: SessionState::Initial
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumIter)]
pub enum SessionState {
    /// No device connected.
    Initial,
    /// The serial port is open.
    Connected,
    /// Partition payloads are being fetched and verified.
    #[strum(serialize = "Loading Firmware")]
    LoadingFirmware,
    /// Payloads are being written to the device.
    Flashing,
    /// All partitions written.
    Flashed,
    /// The reset sequence is being issued.
    Restarting,
    /// A boot banner was seen on the console.
    Restarted,
    /// The device reported it is ready for a self-test command.
    Testing,
    /// The caller has collected self-test results.
    Tested,
}

/// Sending half of the session's event channels.
///
/// Cloned into every component that reports state, messages, or progress.
/// Sends are fire-and-forget: a receiver that has gone away never fails an
/// ongoing device operation.
#[derive(Debug, Clone)]
pub struct EventSink {
    state: Sender<SessionState>,
    port_state: Sender<bool>,
    monitor_state: Sender<bool>,
    messages: Sender<String>,
    flash_progress: Sender<PartitionProgress>,
}

impl EventSink {
    pub(crate) fn state(&self, state: SessionState) {
        let _ = self.state.send(state);
    }

    pub(crate) fn port_state(&self, connected: bool) {
        let _ = self.port_state.send(connected);
    }

    pub(crate) fn monitor_state(&self, monitoring: bool) {
        let _ = self.monitor_state.send(monitoring);
    }

    /// Forward a line to the log/message stream.
    pub(crate) fn message(&self, line: impl Into<String>) {
        let _ = self.messages.send(line.into());
    }

    pub(crate) fn progress(&self, progress: PartitionProgress) {
        let _ = self.flash_progress.send(progress);
    }
}

/// Receiving half of the session's event channels.
pub struct SessionEvents {
    /// Test-session state transitions, in completion order.
    pub state: Receiver<SessionState>,
    /// Connectivity of the serial port. Always agrees with the
    /// `Connected`/`Initial` states on the `state` channel.
    pub port_state: Receiver<bool>,
    /// Whether the console monitor loop is enabled.
    pub monitor_state: Receiver<bool>,
    /// Raw console lines and operator-facing diagnostics.
    pub messages: Receiver<String>,
    /// Per-partition flashing progress.
    pub flash_progress: Receiver<PartitionProgress>,
}

/// Create the paired sending and receiving halves of the session channels.
pub(crate) fn session_channels() -> (EventSink, SessionEvents) {
    let (state_tx, state_rx) = channel();
    let (port_tx, port_rx) = channel();
    let (monitor_tx, monitor_rx) = channel();
    let (message_tx, message_rx) = channel();
    let (progress_tx, progress_rx) = channel();

    let sink = EventSink {
        state: state_tx,
        port_state: port_tx,
        monitor_state: monitor_tx,
        messages: message_tx,
        flash_progress: progress_tx,
    };
    let events = SessionEvents {
        state: state_rx,
        port_state: port_rx,
        monitor_state: monitor_rx,
        messages: message_rx,
        flash_progress: progress_rx,
    };

    (sink, events)
}
