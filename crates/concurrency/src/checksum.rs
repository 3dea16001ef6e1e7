//! Checksum accumulator for replay verification
//!
//! A `Checksum` is a running SHA-256 over every value a cursor handed to the
//! caller. The original execution and each replay fold into separate
//! accumulators; a replay is accepted only when both digests are equal.
//!
//! ## Folding rules
//!
//! Every fold writes a one-byte type tag first; all but `Null` follow it with
//! a big-endian `u64` length and the payload, so adjacent values cannot run
//! together.
//!
//! | Value | Payload |
//! |-------|-----------|
//! | `Null` | none (tag only) |
//! | `Bool`, numerics, `Decimal`, `Text` | canonical text, UTF-8 |
//! | `Date`, `Time`, `Timestamp`, `TimestampTz` | ISO-8601 text |
//! | `Uuid` | hyphenated text |
//! | `Bytes` | raw bytes |
//! | `Unsupported` | a fresh random UUID |
//!
//! Streams fold a start tag, then their raw bytes as they are read.
//!
//! Folding a random value for an unsupported type makes any replay that
//! touches it fail the comparison.

use std::fmt;
use std::io::{self, Read};
use std::sync::Arc;

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use sqlreplay_core::Value;
use tracing::warn;
use uuid::Uuid;

const TAG_NULL: u8 = 0x00;
const TAG_BOOL: u8 = 0x01;
const TAG_INT: u8 = 0x02;
const TAG_FLOAT: u8 = 0x03;
const TAG_DECIMAL: u8 = 0x04;
const TAG_TEXT: u8 = 0x05;
const TAG_BYTES: u8 = 0x06;
const TAG_DATE: u8 = 0x07;
const TAG_TIME: u8 = 0x08;
const TAG_TIMESTAMP: u8 = 0x09;
const TAG_TIMESTAMP_TZ: u8 = 0x0a;
const TAG_UUID: u8 = 0x0b;
const TAG_UNSUPPORTED: u8 = 0x0c;
const TAG_FLAG: u8 = 0x10;
const TAG_STREAM: u8 = 0x11;

fn type_tag(value: &Value) -> u8 {
    match value {
        Value::Null => TAG_NULL,
        Value::Bool(_) => TAG_BOOL,
        Value::Int(_) => TAG_INT,
        Value::Float(_) => TAG_FLOAT,
        Value::Decimal(_) => TAG_DECIMAL,
        Value::Text(_) => TAG_TEXT,
        Value::Bytes(_) => TAG_BYTES,
        Value::Date(_) => TAG_DATE,
        Value::Time(_) => TAG_TIME,
        Value::Timestamp(_) => TAG_TIMESTAMP,
        Value::TimestampTz(_) => TAG_TIMESTAMP_TZ,
        Value::Uuid(_) => TAG_UUID,
        Value::Unsupported(_) => TAG_UNSUPPORTED,
    }
}

/// Running SHA-256 digest over folded values
#[derive(Clone, Default)]
pub struct Checksum {
    hasher: Sha256,
}

impl fmt::Debug for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Checksum").finish_non_exhaustive()
    }
}

impl Checksum {
    /// Create an empty accumulator
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes
    pub fn update(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }

    /// Digest of everything folded so far
    ///
    /// Does not reset the accumulator; folding may continue afterwards.
    pub fn digest(&self) -> Vec<u8> {
        self.hasher.clone().finalize().to_vec()
    }

    /// Fold a value per the folding rules
    pub fn fold(&mut self, value: &Value) {
        let tag = type_tag(value);
        match value {
            Value::Null => self.update(&[tag]),
            Value::Bytes(bytes) => self.fold_framed(tag, bytes),
            Value::Unsupported(type_name) => {
                warn!(
                    target: "sqlreplay::checksum",
                    type_name = %type_name,
                    "Unable to compute checksum for type, using a non-deterministic value to force \
                     checksum failure on a potential retry"
                );
                self.fold_framed(tag, Uuid::new_v4().hyphenated().to_string().as_bytes());
            }
            other => {
                let text = other.canonical_text().unwrap_or_default();
                self.fold_framed(tag, text.as_bytes());
            }
        }
    }

    /// Fold a boolean cursor answer such as `next` or `was_null`
    pub fn fold_bool(&mut self, b: bool) {
        self.fold_framed(TAG_FLAG, &[u8::from(b)]);
    }

    /// Mark the start of a stream whose bytes follow unframed
    pub fn begin_stream(&mut self) {
        self.update(&[TAG_STREAM]);
    }

    fn fold_framed(&mut self, tag: u8, payload: &[u8]) {
        self.update(&[tag]);
        self.update(&(payload.len() as u64).to_be_bytes());
        self.update(payload);
    }
}

/// Shared handle to a checksum, so streams can fold after the call returned
pub type SharedChecksum = Arc<Mutex<Checksum>>;

/// Reader that folds every byte it yields into a checksum
pub struct ChecksumReader {
    inner: Box<dyn Read + Send>,
    checksum: SharedChecksum,
}

impl ChecksumReader {
    /// Wrap `inner`, folding into `checksum`
    pub fn new(inner: Box<dyn Read + Send>, checksum: SharedChecksum) -> Self {
        checksum.lock().begin_stream();
        ChecksumReader { inner, checksum }
    }
}

impl Read for ChecksumReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n > 0 {
            self.checksum.lock().update(&buf[..n]);
        }
        Ok(n)
    }
}

/// Read `reader` to the end, discarding the bytes
pub fn drain(reader: &mut dyn Read) -> io::Result<u64> {
    io::copy(reader, &mut io::sink())
}
