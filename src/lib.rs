//! Drive a single Espressif test device over a serial link.
//!
//! The crate covers the full test-stand session: force the device into
//! bootloader mode via timed DTR/RTS sequencing, stream a multi-partition
//! firmware image with per-partition MD5 verification and progress reporting,
//! then reconnect, monitor the device console, and recognize the boot and
//! self-test markers that drive the session state machine.
//!
//! [`Connection`] owns the port for the one active session; callers serialize
//! connect → reset/flash → reconnect → monitor as a pipeline. All components
//! report through the [`SessionEvents`] channels.
//!
//! The wire-level bootloader protocol, device discovery, and result
//! presentation are collaborator boundaries: [`FlashLoader`],
//! [`PortProvider`], and the message channel.

pub mod connection;
pub mod error;
pub mod flasher;
pub mod monitor;
pub mod partition;
pub mod state;
pub mod transport;

pub use connection::{Connection, DEFAULT_BAUD_RATE};
pub use error::Error;
pub use flasher::{FlashLoader, Flasher, LoaderError, FLASH_BAUD_RATE};
pub use monitor::{LineFramer, StreamDecoder, RESET_MARKERS, SELF_TEST_READY_MARKERS};
pub use partition::{DirectorySource, Partition, PartitionProgress, PartitionSource};
pub use state::{EventSink, SessionEvents, SessionState};
pub use transport::{PortProvider, SerialTransport, SystemPortProvider, Transport};
