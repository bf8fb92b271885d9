//! Reassembly of console output into complete lines
//!
//! Serial reads hand back arbitrarily sized chunks that pay no respect to
//! line boundaries. [`StreamDecoder`] turns the byte chunks into text without
//! splitting UTF-8 sequences, and [`LineFramer`] turns the text chunks into
//! complete lines.

/// Delimiter used by the console monitor.
pub(crate) const DEFAULT_LINE_DELIMITER: char = '\n';

/// Splits a stream of text chunks into complete lines.
///
/// Each fed chunk is appended to an internal accumulator; every complete
/// delimiter-terminated segment is emitted and the trailing remainder is kept
/// for the next call. Rejoining the emitted lines with the delimiter and
/// appending the flushed remainder reconstructs the input exactly, no matter
/// where the chunk boundaries fell.
#[derive(Debug)]
pub struct LineFramer {
    delimiter: char,
    accumulator: String,
}

impl LineFramer {
    /// A framer with a fresh, empty accumulator.
    pub fn new(delimiter: char) -> Self {
        LineFramer {
            delimiter,
            accumulator: String::new(),
        }
    }

    /// Append `chunk` and return every line completed by it.
    pub fn feed(&mut self, chunk: &str) -> Vec<String> {
        self.accumulator.push_str(chunk);

        let mut segments: Vec<String> = self
            .accumulator
            .split(self.delimiter)
            .map(str::to_owned)
            .collect();

        // The last segment is not yet delimiter-terminated; it becomes the
        // new accumulator. `split` always yields at least one segment.
        self.accumulator = segments.pop().unwrap_or_default();

        segments
    }

    /// Return whatever is buffered, even if empty, and reset the accumulator.
    pub fn flush(&mut self) -> String {
        std::mem::take(&mut self.accumulator)
    }
}

impl Default for LineFramer {
    fn default() -> Self {
        LineFramer::new(DEFAULT_LINE_DELIMITER)
    }
}

/// Incremental UTF-8 decoder for byte chunks.
///
/// Bytes that end mid-sequence are withheld until the rest of the sequence
/// arrives; invalid bytes are replaced with U+FFFD rather than dropped.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    pending: Vec<u8>,
}

impl StreamDecoder {
    pub fn new() -> Self {
        StreamDecoder::default()
    }

    /// Decode `bytes`, returning all complete text seen so far.
    pub fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);

        let mut decoded = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    decoded.push_str(text);
                    self.pending.clear();
                    break;
                }
                Err(err) => {
                    let valid_up_to = err.valid_up_to();
                    decoded.push_str(&String::from_utf8_lossy(&self.pending[..valid_up_to]));

                    match err.error_len() {
                        // Invalid bytes in the middle of the chunk.
                        Some(invalid) => {
                            decoded.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid_up_to + invalid);
                        }
                        // Incomplete sequence at the end; wait for more bytes.
                        None => {
                            self.pending.drain(..valid_up_to);
                            break;
                        }
                    }
                }
            }
        }

        decoded
    }
}
