//! Console monitor loop
//!
//! A single reader thread consumes the transport's readable side while
//! monitoring is enabled, reassembles the byte stream into lines, scans each
//! line for device-emitted markers, and forwards every line to the message
//! channel. The loop is cooperatively cancellable: reads time out on a short
//! interval and the loop rechecks its flags in between.

use std::{
    io::{ErrorKind, Read},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use log::{debug, error, warn};

use crate::state::{EventSink, SessionState};

mod line_framer;

pub use line_framer::{LineFramer, StreamDecoder};
pub(crate) use line_framer::DEFAULT_LINE_DELIMITER;

/// Substrings an ESP32 prints in its first lines after a reboot.
pub const RESET_MARKERS: &[&str] = &[
    "rst:0x1",
    "configsip",
    "mode:DIO",
    "entry 0x",
    "READY_FOR_SELFTEST",
];

/// Substrings announcing that the device accepts a self-test command.
pub const SELF_TEST_READY_MARKERS: &[&str] = &["READY_FOR_SELFTEST"];

/// Pause between two read pipelines after one tears down, so a persistently
/// failing reader cannot spin.
const PIPELINE_RESTART_DELAY: Duration = Duration::from_millis(10);

/// Handle onto the running reader thread.
pub(crate) struct MonitorHandle {
    thread: JoinHandle<()>,
}

impl MonitorHandle {
    /// Wait for the reader thread to finish, discarding any teardown error.
    pub(crate) fn join(self) {
        if self.thread.join().is_err() {
            warn!("monitor thread panicked during teardown");
        }
    }
}

/// Spawn the reader thread over an independently owned reader handle.
///
/// The loop runs while both flags are set; clearing either ends it after at
/// most one read timeout.
pub(crate) fn spawn(
    reader: Box<dyn Read + Send>,
    connected: Arc<AtomicBool>,
    monitoring: Arc<AtomicBool>,
    events: EventSink,
) -> std::io::Result<MonitorHandle> {
    let thread = thread::Builder::new()
        .name("esprig-monitor".into())
        .spawn(move || read_loop(reader, &connected, &monitoring, &events))?;

    Ok(MonitorHandle { thread })
}

fn read_loop(
    mut reader: Box<dyn Read + Send>,
    connected: &AtomicBool,
    monitoring: &AtomicBool,
    events: &EventSink,
) {
    let mut buffer = [0u8; 1024];

    while connected.load(Ordering::SeqCst) && monitoring.load(Ordering::SeqCst) {
        // Fresh decode+frame pipeline per pass; a transport that re-signals
        // readability after a transient gap gets a clean accumulator.
        let mut decoder = StreamDecoder::new();
        let mut framer = LineFramer::new(DEFAULT_LINE_DELIMITER);
        let mut restart = false;

        loop {
            if !connected.load(Ordering::SeqCst) || !monitoring.load(Ordering::SeqCst) {
                break;
            }

            match reader.read(&mut buffer) {
                Ok(0) => {
                    debug!("monitor reader reached end of stream");
                    restart = true;
                    break;
                }
                Ok(count) => {
                    let text = decoder.decode(&buffer[..count]);
                    for line in framer.feed(&text) {
                        handle_line(&line, events);
                    }
                }
                Err(err) if matches!(err.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
                    continue;
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    // Non-fatal per line: give the transport a chance to
                    // recover with a fresh pipeline.
                    error!("monitor read error: {err}");
                    restart = true;
                    break;
                }
            }
        }

        // The remainder of a torn-down pipeline is still a line for the log.
        let remainder = framer.flush();
        handle_line(&remainder, events);

        if restart {
            thread::sleep(PIPELINE_RESTART_DELAY);
        }
    }

    debug!("leaving monitor read loop");
}

/// Scan one framed line for markers, then forward it to the message stream.
fn handle_line(line: &str, events: &EventSink) {
    if line.is_empty() {
        return;
    }

    check_for_restart(line, events);
    check_for_testing(line, events);
    events.message(line);
}

/// Emit `Restarted` on the first reset marker contained in the line.
fn check_for_restart(line: &str, events: &EventSink) {
    for marker in RESET_MARKERS {
        if line.contains(marker) {
            events.state(SessionState::Restarted);
            break;
        }
    }
}

/// Emit `Testing` when the line announces self-test readiness.
fn check_for_testing(line: &str, events: &EventSink) {
    for marker in SELF_TEST_READY_MARKERS {
        if line.contains(marker) {
            events.state(SessionState::Testing);
            break;
        }
    }
}
