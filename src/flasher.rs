//! Flashing orchestration
//!
//! [`Flasher`] drives a multi-partition write in two strictly ordered phases:
//! load-and-verify, then write. The wire-level bootloader protocol is not
//! implemented here; the byte-level work is delegated to a [`FlashLoader`].

use std::{panic, thread};

use log::{debug, info, warn};

use crate::{
    connection::{Connection, DEFAULT_BAUD_RATE},
    error::Error,
    partition::{md5_hex, Partition, PartitionProgress, PartitionSource},
    state::{EventSink, SessionState},
};

/// Baud rate negotiated for the write phase.
pub const FLASH_BAUD_RATE: u32 = 460_800;

/// Error currency of the external loader.
pub type LoaderError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The external flasher: speaks the device's bootloader protocol and performs
/// the actual byte-level writes.
pub trait FlashLoader {
    /// Establish the bootloader connection.
    fn connect(&mut self) -> Result<(), LoaderError>;

    /// Upload and start the RAM flasher stub.
    fn load_stub(&mut self) -> Result<(), LoaderError>;

    /// Negotiate a faster transfer rate for the write phase.
    fn set_baud_rate(&mut self, from: u32, to: u32) -> Result<(), LoaderError>;

    /// Name of the detected chip.
    fn chip_name(&mut self) -> Result<String, LoaderError>;

    /// MAC address of the detected chip.
    fn mac_address(&mut self) -> Result<String, LoaderError>;

    /// Write `data` to flash at `offset`, reporting `(written, total)` byte
    /// counts through `progress` as the device acknowledges them.
    fn flash_data(
        &mut self,
        data: &[u8],
        offset: u32,
        progress: &mut dyn FnMut(usize, usize),
    ) -> Result<(), LoaderError>;

    /// Tell the stub the image is complete.
    fn flash_finish(&mut self, reboot: bool) -> Result<(), LoaderError>;

    /// Reset the device hardware.
    fn hard_reset(&mut self) -> Result<(), LoaderError>;

    /// Release the bootloader connection.
    fn disconnect(&mut self) -> Result<(), LoaderError>;
}

/// Orchestrates loading, verifying, and writing a partition set.
pub struct Flasher {
    events: EventSink,
}

impl Flasher {
    pub fn new(events: EventSink) -> Self {
        Flasher { events }
    }

    /// Flash `partitions` onto the device.
    ///
    /// Phase one fetches every payload concurrently and verifies checksums; a
    /// mismatch aborts before any device write. Phase two writes each
    /// partition through `loader`, reporting progress on the session's
    /// progress channel. A failed write triggers exactly one
    /// [`Connection::reconnect`] and surfaces the original error. The
    /// loader's hardware-reset/disconnect cleanup runs on every path out of
    /// the write phase.
    pub fn flash(
        &self,
        partitions: &mut [Partition],
        source: &dyn PartitionSource,
        loader: &mut dyn FlashLoader,
        connection: &mut Connection,
    ) -> Result<(), Error> {
        self.load_partitions(partitions, source)?;

        let result = self.write_partitions(partitions, loader, connection);
        let cleanup = loader.hard_reset().and_then(|()| loader.disconnect());

        match (result, cleanup) {
            (Err(err), cleanup) => {
                if let Err(cleanup_err) = cleanup {
                    warn!("cleanup after failed flash also failed: {cleanup_err}");
                }
                Err(err)
            }
            (Ok(()), Err(cleanup_err)) => Err(Error::Loader(cleanup_err)),
            (Ok(()), Ok(())) => {
                info!("done flashing");
                Ok(())
            }
        }
    }

    /// Phase one: fetch all payloads concurrently, then verify the complete
    /// set. Flashing never starts with an unverified partition.
    fn load_partitions(
        &self,
        partitions: &mut [Partition],
        source: &dyn PartitionSource,
    ) -> Result<(), Error> {
        self.events.state(SessionState::LoadingFirmware);

        // One request per partition that still needs its payload.
        let requests: Vec<Option<(String, String)>> = partitions
            .iter()
            .map(|partition| {
                partition
                    .payload
                    .is_empty()
                    .then(|| (partition.name.clone(), partition.source.clone()))
            })
            .collect();

        let fetched: Vec<Option<Result<Vec<u8>, Error>>> = thread::scope(|scope| {
            let handles: Vec<_> = requests
                .iter()
                .map(|request| {
                    scope.spawn(move || {
                        request.as_ref().map(|(name, source_id)| {
                            debug!("fetching partition '{name}' from '{source_id}'");
                            source.fetch(source_id).map_err(|err| Error::Fetch {
                                partition: name.clone(),
                                source_id: source_id.clone(),
                                source: err,
                            })
                        })
                    })
                })
                .collect();

            handles
                .into_iter()
                .map(|handle| {
                    handle
                        .join()
                        .unwrap_or_else(|payload| panic::resume_unwind(payload))
                })
                .collect()
        });

        for (partition, result) in partitions.iter_mut().zip(fetched) {
            if let Some(result) = result {
                let payload = result?;
                debug!(
                    "loaded {} bytes for partition '{}'",
                    payload.len(),
                    partition.name
                );
                partition.payload = payload;
            }
        }

        for partition in partitions.iter() {
            self.verify_partition(partition)?;
        }

        Ok(())
    }

    fn verify_partition(&self, partition: &Partition) -> Result<(), Error> {
        if partition.payload.is_empty() {
            return Err(Error::EmptyPartition(partition.name.clone()));
        }

        let Some(expected) = partition.expected_checksum.as_deref() else {
            return Ok(());
        };

        let calculated = md5_hex(&partition.payload);
        if calculated.eq_ignore_ascii_case(expected) {
            debug!("partition '{}' passed verification", partition.name);
            return Ok(());
        }

        self.events
            .message(format!("MD5 mismatch for partition: {}", partition.name));
        self.events.message(format!("Calculated: {calculated}"));
        self.events.message(format!("Expected: {expected}"));
        self.events
            .message("Fetch the firmware image again and retry.");

        Err(Error::ChecksumMismatch {
            partition: partition.name.clone(),
            calculated,
            expected: expected.to_string(),
        })
    }

    /// Phase two: bring up the loader and write every partition in order.
    fn write_partitions(
        &self,
        partitions: &[Partition],
        loader: &mut dyn FlashLoader,
        connection: &mut Connection,
    ) -> Result<(), Error> {
        self.events.state(SessionState::Flashing);

        loader.connect().map_err(Error::Loader)?;
        loader.load_stub().map_err(Error::Loader)?;
        loader
            .set_baud_rate(DEFAULT_BAUD_RATE, FLASH_BAUD_RATE)
            .map_err(Error::Loader)?;

        let chip = loader.chip_name().map_err(Error::Loader)?;
        let mac = loader.mac_address().map_err(Error::Loader)?;
        info!("connected to {chip} ({mac})");
        self.events.message(format!("Detected {chip} ({mac})"));

        for (index, partition) in partitions.iter().enumerate() {
            debug!(
                "writing partition '{}' at {:#x}",
                partition.name, partition.target_offset
            );

            let events = &self.events;
            let mut report = |written: usize, total: usize| {
                events.progress(PartitionProgress {
                    partition_index: index,
                    percent: percent(written, total),
                });
            };

            if let Err(err) = loader.flash_data(&partition.payload, partition.target_offset, &mut report)
            {
                warn!("write failed for partition '{}': {err}", partition.name);

                // One reconnect to clear the transport state; the write
                // itself is not retried.
                if let Err(reconnect_err) = connection.reconnect() {
                    warn!("reconnect after failed write also failed: {reconnect_err}");
                }

                return Err(Error::FlashWrite {
                    partition: partition.name.clone(),
                    source: err,
                });
            }
        }

        info!("successfully wrote all device partitions");
        self.events.state(SessionState::Flashed);

        loader.flash_finish(false).map_err(Error::Loader)?;

        Ok(())
    }
}

/// Percent complete from device-reported written/total counts, rounded to the
/// nearest integer.
fn percent(written: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }

    let ratio = written as f64 / total as f64;
    (ratio * 100.0).round().min(100.0) as u8
}
