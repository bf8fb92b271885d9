//! Session and flashing errors

use std::io;

use miette::Diagnostic;
use thiserror::Error;

use crate::flasher::LoaderError;

/// All possible errors returned by esprig
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("The serial port '{port}' is unavailable")]
    #[diagnostic(
        code(esprig::port_unavailable),
        help("The port is likely held open by another program. Close other monitor \
              sessions (IDE serial consoles, other flashers) and try again")
    )]
    PortUnavailable {
        port: String,
        #[source]
        source: serialport::Error,
    },

    #[error("Failed to set a control line during the reset sequence")]
    #[diagnostic(
        code(esprig::signal),
        help("Ensure that the serial adapter exposes the DTR and RTS lines")
    )]
    Signal(#[source] serialport::Error),

    #[error("MD5 mismatch for partition '{partition}': calculated {calculated}, expected {expected}")]
    #[diagnostic(
        code(esprig::checksum_mismatch),
        help("The firmware image is corrupt. Fetch the image again and retry")
    )]
    ChecksumMismatch {
        partition: String,
        calculated: String,
        expected: String,
    },

    #[error("Failed to write partition '{partition}' to the device")]
    #[diagnostic(
        code(esprig::flash_write),
        help("The connection has been re-established; retry the flash operation")
    )]
    FlashWrite {
        partition: String,
        #[source]
        source: LoaderError,
    },

    #[error("Partition '{0}' has an empty payload")]
    #[diagnostic(code(esprig::empty_partition))]
    EmptyPartition(String),

    #[error("Failed to fetch partition '{partition}' from '{source_id}'")]
    #[diagnostic(code(esprig::fetch_failed))]
    Fetch {
        partition: String,
        source_id: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to start the console monitor")]
    #[diagnostic(code(esprig::monitor))]
    Monitor(#[source] io::Error),

    #[error("No device connection is open")]
    #[diagnostic(
        code(esprig::not_connected),
        help("Call connect() before performing device operations")
    )]
    NotConnected,

    #[error("The device loader reported an error")]
    #[diagnostic(code(esprig::loader))]
    Loader(#[source] LoaderError),

    #[error("Serial port error")]
    #[diagnostic(code(esprig::serial))]
    Serial(#[from] serialport::Error),
}
