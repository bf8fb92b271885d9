//! Firmware partitions and their byte sources

use std::{fs, io, path::PathBuf};

use md5::{Digest, Md5};

/// A named firmware payload destined for a specific device memory offset.
///
/// Target offsets across a partition set must not overlap given their payload
/// lengths; this is the caller's responsibility and is not validated here.
#[derive(Debug, Clone)]
pub struct Partition {
    /// Identifier used in diagnostics, e.g. `bootloader` or `app`.
    pub name: String,
    /// Raw image bytes. Fetched from `source` by the flashing orchestrator
    /// when empty.
    pub payload: Vec<u8>,
    /// Device memory address the payload is written to.
    pub target_offset: u32,
    /// Lowercase hex MD5 digest the payload must match, if known.
    pub expected_checksum: Option<String>,
    /// Identifier passed to the [`PartitionSource`] to retrieve the payload.
    pub source: String,
}

impl Partition {
    pub fn new(name: impl Into<String>, source: impl Into<String>, target_offset: u32) -> Self {
        Partition {
            name: name.into(),
            payload: Vec::new(),
            target_offset,
            expected_checksum: None,
            source: source.into(),
        }
    }

    pub fn with_checksum(mut self, checksum: impl Into<String>) -> Self {
        self.expected_checksum = Some(checksum.into());
        self
    }
}

/// Flashing progress for one partition.
///
/// Emitted on the session's `flash_progress` channel; every partition reaches
/// 100 percent at least once before the flash operation completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionProgress {
    /// Index of the partition within the set passed to the orchestrator.
    pub partition_index: usize,
    /// Completion in percent, 0 to 100.
    pub percent: u8,
}

/// Byte retrieval for partition payloads, keyed by the partition's source
/// identifier.
///
/// Implementations must be [`Sync`]: the orchestrator fetches all partitions
/// of a set concurrently.
pub trait PartitionSource: Sync {
    /// Retrieve the raw bytes for `source`, or fail with a not-found/IO error.
    fn fetch(&self, source: &str) -> io::Result<Vec<u8>>;
}

/// [`PartitionSource`] that resolves source identifiers relative to a
/// directory of firmware images.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        DirectorySource { root: root.into() }
    }
}

impl PartitionSource for DirectorySource {
    fn fetch(&self, source: &str) -> io::Result<Vec<u8>> {
        fs::read(self.root.join(source))
    }
}

/// Lowercase hex MD5 digest of `data`.
pub(crate) fn md5_hex(data: &[u8]) -> String {
    Md5::digest(data)
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn md5_hex_of_empty_input() {
        assert_eq!(md5_hex(b""), "d41d8cd98f00b204e9800998ecf8427e");
    }

    #[test]
    fn md5_hex_of_known_input() {
        assert_eq!(md5_hex(b"hello"), "5d41402abc4b2a76b9719d911017c592");
    }

    #[test]
    fn directory_source_reports_missing_files() {
        let source = DirectorySource::new(std::env::temp_dir().join("esprig-missing"));
        let err = source.fetch("no-such-image.bin").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
