//! End-to-end session scenarios over scripted doubles.

use std::{
    collections::{HashMap, VecDeque},
    io::{self, Read},
    sync::{Arc, Mutex},
    thread,
    time::Duration,
};

use esprig::{
    Connection, Error, FlashLoader, Flasher, LoaderError, Partition, PartitionProgress,
    PartitionSource, PortProvider, SessionEvents, SessionState, Transport,
};

const MD5_OF_EMPTY: &str = "d41d8cd98f00b204e9800998ecf8427e";
const MD5_OF_HELLO: &str = "5d41402abc4b2a76b9719d911017c592";

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signal {
    Dtr(bool),
    Rts(bool),
}

#[derive(Default)]
struct PortState {
    open: bool,
    open_calls: usize,
    close_calls: usize,
    signals: Vec<Signal>,
    written: Vec<u8>,
    rx: VecDeque<Vec<u8>>,
    fail_signals_after: Option<usize>,
}

/// Shared handle onto the scripted port, for assertions and for feeding
/// console output while a monitor loop is running.
#[derive(Clone, Default)]
struct ScriptedPort {
    state: Arc<Mutex<PortState>>,
}

impl ScriptedPort {
    fn new() -> Self {
        ScriptedPort::default()
    }

    fn push_chunk(&self, chunk: &str) {
        self.state.lock().unwrap().rx.push_back(chunk.as_bytes().to_vec());
    }

    fn fail_signals_after(&self, count: usize) {
        self.state.lock().unwrap().fail_signals_after = Some(count);
    }

    fn signals(&self) -> Vec<Signal> {
        self.state.lock().unwrap().signals.clone()
    }

    fn written(&self) -> Vec<u8> {
        self.state.lock().unwrap().written.clone()
    }

    fn open_calls(&self) -> usize {
        self.state.lock().unwrap().open_calls
    }

    fn close_calls(&self) -> usize {
        self.state.lock().unwrap().close_calls
    }
}

struct ScriptedTransport {
    port: ScriptedPort,
    fail_open_as_busy: bool,
}

impl Transport for ScriptedTransport {
    fn open(&mut self, _baud_rate: u32) -> serialport::Result<()> {
        if self.fail_open_as_busy {
            return Err(serialport::Error::new(
                serialport::ErrorKind::NoDevice,
                "device or resource busy",
            ));
        }

        let mut state = self.port.state.lock().unwrap();
        state.open = true;
        state.open_calls += 1;
        Ok(())
    }

    fn name(&self) -> Option<String> {
        Some("scripted".to_string())
    }

    fn is_open(&self) -> bool {
        self.port.state.lock().unwrap().open
    }

    fn close(&mut self) -> serialport::Result<()> {
        let mut state = self.port.state.lock().unwrap();
        state.open = false;
        state.close_calls += 1;
        Ok(())
    }

    fn set_signals(&mut self, dtr: Option<bool>, rts: Option<bool>) -> serialport::Result<()> {
        let mut state = self.port.state.lock().unwrap();

        if let Some(limit) = state.fail_signals_after {
            if state.signals.len() >= limit {
                return Err(serialport::Error::new(
                    serialport::ErrorKind::Unknown,
                    "control line not supported",
                ));
            }
        }

        if let Some(level) = dtr {
            state.signals.push(Signal::Dtr(level));
        }
        if let Some(level) = rts {
            state.signals.push(Signal::Rts(level));
        }
        Ok(())
    }

    fn try_clone_reader(&self) -> serialport::Result<Box<dyn Read + Send>> {
        Ok(Box::new(ScriptedReader {
            state: Arc::clone(&self.port.state),
        }))
    }

    fn write(&mut self, data: &[u8]) -> serialport::Result<()> {
        self.port.state.lock().unwrap().written.extend_from_slice(data);
        Ok(())
    }
}

struct ScriptedReader {
    state: Arc<Mutex<PortState>>,
}

impl Read for ScriptedReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let chunk = self.state.lock().unwrap().rx.pop_front();

        match chunk {
            Some(chunk) => {
                let count = chunk.len().min(buf.len());
                buf[..count].copy_from_slice(&chunk[..count]);
                Ok(count)
            }
            None => {
                thread::sleep(Duration::from_millis(2));
                Err(io::Error::new(io::ErrorKind::TimedOut, "no data"))
            }
        }
    }
}

struct ScriptedProvider {
    port: ScriptedPort,
    fail_open_as_busy: bool,
}

impl PortProvider for ScriptedProvider {
    fn request_port(&mut self) -> serialport::Result<Box<dyn Transport>> {
        Ok(Box::new(ScriptedTransport {
            port: self.port.clone(),
            fail_open_as_busy: self.fail_open_as_busy,
        }))
    }
}

struct MapSource {
    images: HashMap<String, Vec<u8>>,
}

impl MapSource {
    fn new(entries: &[(&str, &[u8])]) -> Self {
        MapSource {
            images: entries
                .iter()
                .map(|(name, bytes)| (name.to_string(), bytes.to_vec()))
                .collect(),
        }
    }
}

impl PartitionSource for MapSource {
    fn fetch(&self, source: &str) -> io::Result<Vec<u8>> {
        self.images
            .get(source)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "unknown image"))
    }
}

#[derive(Default)]
struct LoaderLog {
    flash_calls: Vec<(u32, usize)>,
    finishes: Vec<bool>,
    hard_resets: usize,
    disconnects: usize,
}

struct ScriptedLoader {
    log: Arc<Mutex<LoaderLog>>,
    fail_on_partition: Option<usize>,
    writes: usize,
}

impl ScriptedLoader {
    fn new(log: &Arc<Mutex<LoaderLog>>) -> Self {
        ScriptedLoader {
            log: Arc::clone(log),
            fail_on_partition: None,
            writes: 0,
        }
    }
}

impl FlashLoader for ScriptedLoader {
    fn connect(&mut self) -> Result<(), LoaderError> {
        Ok(())
    }

    fn load_stub(&mut self) -> Result<(), LoaderError> {
        Ok(())
    }

    fn set_baud_rate(&mut self, _from: u32, _to: u32) -> Result<(), LoaderError> {
        Ok(())
    }

    fn chip_name(&mut self) -> Result<String, LoaderError> {
        Ok("ESP32-D0WD-V3".to_string())
    }

    fn mac_address(&mut self) -> Result<String, LoaderError> {
        Ok("24:6f:28:aa:bb:cc".to_string())
    }

    fn flash_data(
        &mut self,
        data: &[u8],
        offset: u32,
        progress: &mut dyn FnMut(usize, usize),
    ) -> Result<(), LoaderError> {
        let index = self.writes;
        self.writes += 1;
        self.log.lock().unwrap().flash_calls.push((offset, data.len()));

        if self.fail_on_partition == Some(index) {
            return Err("flash write timeout".into());
        }

        progress(data.len() / 2, data.len());
        progress(data.len(), data.len());
        Ok(())
    }

    fn flash_finish(&mut self, reboot: bool) -> Result<(), LoaderError> {
        self.log.lock().unwrap().finishes.push(reboot);
        Ok(())
    }

    fn hard_reset(&mut self) -> Result<(), LoaderError> {
        self.log.lock().unwrap().hard_resets += 1;
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), LoaderError> {
        self.log.lock().unwrap().disconnects += 1;
        Ok(())
    }
}

fn session(port: &ScriptedPort) -> (Connection, SessionEvents) {
    Connection::new(Box::new(ScriptedProvider {
        port: port.clone(),
        fail_open_as_busy: false,
    }))
}

fn drain_states(events: &SessionEvents) -> Vec<SessionState> {
    events.state.try_iter().collect()
}

/// Collect states until `last` shows up or the monitor goes quiet.
fn states_until(events: &SessionEvents, last: SessionState) -> Vec<SessionState> {
    let mut states = Vec::new();
    while !states.contains(&last) {
        match events.state.recv_timeout(Duration::from_secs(2)) {
            Ok(state) => states.push(state),
            Err(_) => break,
        }
    }
    states
}

#[test]
fn reset_sequence_sets_signals_in_strict_order() {
    init_logs();
    let port = ScriptedPort::new();
    let (mut connection, events) = session(&port);
    connection.connect().unwrap();

    connection.reset_device().unwrap();
    connection.reset_device().unwrap();

    let expected = [
        Signal::Dtr(false),
        Signal::Rts(true),
        Signal::Dtr(true),
        Signal::Rts(false),
        Signal::Dtr(false),
    ];
    let observed = port.signals();
    assert_eq!(observed[..5], expected);
    assert_eq!(observed[5..], expected);

    assert_eq!(
        drain_states(&events),
        [
            SessionState::Connected,
            SessionState::Restarting,
            SessionState::Restarting
        ]
    );
}

#[test]
fn failed_signal_aborts_the_reset_sequence() {
    init_logs();
    let port = ScriptedPort::new();
    let (mut connection, _events) = session(&port);
    connection.connect().unwrap();

    port.fail_signals_after(2);
    let err = connection.reset_device().unwrap_err();

    assert!(matches!(err, Error::Signal(_)));
    assert_eq!(port.signals(), [Signal::Dtr(false), Signal::Rts(true)]);
}

#[test]
fn run_mode_restart_pulses_only_the_reset_line() {
    init_logs();
    let port = ScriptedPort::new();
    let (mut connection, _events) = session(&port);
    connection.connect().unwrap();

    connection.restart_into_run_mode().unwrap();

    assert_eq!(port.signals(), [Signal::Rts(true), Signal::Rts(false)]);
}

#[test]
fn stop_monitor_is_idempotent() {
    init_logs();
    let port = ScriptedPort::new();
    let (mut connection, events) = session(&port);

    // No loop active: must not panic and must leave monitoring disabled.
    connection.stop_monitor();
    connection.stop_monitor();

    connection.connect().unwrap();
    connection.start_monitor().unwrap();
    connection.stop_monitor();
    connection.stop_monitor();

    let monitor_states: Vec<bool> = events.monitor_state.try_iter().collect();
    assert_eq!(monitor_states, [false, false, true, false, false]);
}

#[test]
fn checksum_mismatch_aborts_before_any_write() {
    init_logs();
    let port = ScriptedPort::new();
    let (mut connection, events) = session(&port);
    connection.connect().unwrap();

    let mut partitions =
        vec![Partition::new("app", "app.bin", 0x10000).with_checksum(MD5_OF_EMPTY)];
    let source = MapSource::new(&[("app.bin", b"hello")]);
    let log = Arc::new(Mutex::new(LoaderLog::default()));
    let mut loader = ScriptedLoader::new(&log);

    let flasher = Flasher::new(connection.event_sink());
    let err = flasher
        .flash(&mut partitions, &source, &mut loader, &mut connection)
        .unwrap_err();

    match err {
        Error::ChecksumMismatch {
            partition,
            calculated,
            expected,
        } => {
            assert_eq!(partition, "app");
            assert_eq!(calculated, MD5_OF_HELLO);
            assert_eq!(expected, MD5_OF_EMPTY);
        }
        other => panic!("unexpected error: {other:?}"),
    }

    assert!(log.lock().unwrap().flash_calls.is_empty());

    let messages: Vec<String> = events.messages.try_iter().collect();
    assert!(messages.iter().any(|m| m.contains(MD5_OF_HELLO)));
    assert!(messages.iter().any(|m| m.contains(MD5_OF_EMPTY)));
}

#[test]
fn full_session_reaches_restarted_after_flash_and_reset() {
    init_logs();
    let port = ScriptedPort::new();
    let (mut connection, events) = session(&port);
    connection.connect().unwrap();

    let mut partitions = vec![
        Partition::new("bootloader", "bootloader.bin", 0x1000),
        Partition::new("app", "app.bin", 0x10000).with_checksum(MD5_OF_HELLO),
    ];
    let source = MapSource::new(&[("bootloader.bin", b"stage2"), ("app.bin", b"hello")]);
    let log = Arc::new(Mutex::new(LoaderLog::default()));
    let mut loader = ScriptedLoader::new(&log);

    let flasher = Flasher::new(connection.event_sink());
    flasher
        .flash(&mut partitions, &source, &mut loader, &mut connection)
        .unwrap();

    connection.reset_device().unwrap();
    connection.start_monitor().unwrap();
    port.push_chunk("rst:0x");
    port.push_chunk("1 (POWERON_RESET)\n");

    let states = states_until(&events, SessionState::Restarted);
    connection.stop_monitor();

    assert_eq!(
        states,
        [
            SessionState::Connected,
            SessionState::LoadingFirmware,
            SessionState::Flashing,
            SessionState::Flashed,
            SessionState::Restarting,
            SessionState::Restarted,
        ]
    );

    let progress: Vec<PartitionProgress> = events.flash_progress.try_iter().collect();
    assert!(progress.contains(&PartitionProgress {
        partition_index: 0,
        percent: 100
    }));
    assert!(progress.contains(&PartitionProgress {
        partition_index: 1,
        percent: 100
    }));

    {
        let log = log.lock().unwrap();
        let offsets: Vec<u32> = log.flash_calls.iter().map(|(offset, _)| *offset).collect();
        assert_eq!(offsets, [0x1000, 0x10000]);
        assert_eq!(log.finishes, [false]);
        assert_eq!(log.hard_resets, 1);
        assert_eq!(log.disconnects, 1);
    }

    // The boot banner line, reassembled across chunks, reached the log.
    let messages: Vec<String> = events.messages.try_iter().collect();
    assert!(messages.iter().any(|m| m.contains("rst:0x1 (POWERON_RESET)")));
}

#[test]
fn write_failure_reconnects_once_and_still_cleans_up() {
    init_logs();
    let port = ScriptedPort::new();
    let (mut connection, _events) = session(&port);
    connection.connect().unwrap();

    let mut partitions = vec![
        Partition::new("bootloader", "bootloader.bin", 0x1000),
        Partition::new("app", "app.bin", 0x10000),
    ];
    let source = MapSource::new(&[("bootloader.bin", b"stage2"), ("app.bin", b"hello")]);
    let log = Arc::new(Mutex::new(LoaderLog::default()));
    let mut loader = ScriptedLoader::new(&log);
    loader.fail_on_partition = Some(0);

    let flasher = Flasher::new(connection.event_sink());
    let err = flasher
        .flash(&mut partitions, &source, &mut loader, &mut connection)
        .unwrap_err();

    match err {
        Error::FlashWrite { partition, .. } => assert_eq!(partition, "bootloader"),
        other => panic!("unexpected error: {other:?}"),
    }

    {
        let log = log.lock().unwrap();
        // The failed write is not retried and the second partition is never
        // attempted, but cleanup still runs exactly once.
        assert_eq!(log.flash_calls.len(), 1);
        assert_eq!(log.finishes, Vec::<bool>::new());
        assert_eq!(log.hard_resets, 1);
        assert_eq!(log.disconnects, 1);
    }

    // Exactly one reconnect: the initial open plus one reopen.
    assert_eq!(port.open_calls(), 2);
    assert_eq!(port.close_calls(), 1);
    assert!(connection.is_connected());
}

#[test]
fn busy_port_is_reported_as_unavailable() {
    init_logs();
    let port = ScriptedPort::new();
    let (mut connection, events) = Connection::new(Box::new(ScriptedProvider {
        port: port.clone(),
        fail_open_as_busy: true,
    }));

    let err = connection.connect().unwrap_err();

    assert!(matches!(err, Error::PortUnavailable { .. }));
    assert!(!connection.is_connected());
    assert_eq!(drain_states(&events), [SessionState::Initial]);

    let port_states: Vec<bool> = events.port_state.try_iter().collect();
    assert_eq!(port_states, [false]);
}

#[test]
fn self_test_ready_marker_enables_the_test_command() {
    init_logs();
    let port = ScriptedPort::new();
    let (mut connection, events) = session(&port);
    connection.connect().unwrap();
    connection.start_monitor().unwrap();

    port.push_chunk("READY_FOR_SELFTEST\n");
    let states = states_until(&events, SessionState::Testing);
    assert!(states.contains(&SessionState::Testing));

    connection.send_self_test_command().unwrap();
    connection.stop_monitor();

    assert_eq!(port.written(), b"SELFTEST\n");

    // Result collection is the caller's job; it drives the final transition.
    connection.mark_tested();
    let states = drain_states(&events);
    assert_eq!(states.last(), Some(&SessionState::Tested));
}
