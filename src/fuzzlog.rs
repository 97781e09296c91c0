//! Fuzzlog decoding.
//!
//! A fuzzlog is the binary trace of one fuzzed test run. Every generated
//! value is appended as one entry:
//!
//! ```text
//! tag: u8 | value: 8 bytes | location: u64
//! ```
//!
//! All multi-byte fields are little-endian. The tag names the value's type:
//! `1` = i64, `2` = u64, `3` = f64. Entries follow each other without framing;
//! a log ends at the first clean EOF on an entry boundary.

use std::fs;
use std::io::{ErrorKind, Read};
use std::path::Path;

use eyre::{Result, WrapErr};

/// Size in bytes of one encoded entry.
pub const ENTRY_SIZE: usize = 1 + 8 + 8;

/// Value type tags written by the fuzzing runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ValueTag {
    I64 = 1,
    U64 = 2,
    F64 = 3,
}

impl ValueTag {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::I64),
            2 => Some(Self::U64),
            3 => Some(Self::F64),
            _ => None,
        }
    }

    fn decode(self, raw: [u8; 8]) -> f64 {
        match self {
            Self::I64 => i64::from_le_bytes(raw) as f64,
            Self::U64 => u64::from_le_bytes(raw) as f64,
            Self::F64 => f64::from_le_bytes(raw),
        }
    }
}

/// One logged value and the program location that generated it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LogEntry {
    pub value: f64,
    pub location: u64,
}

/// Parse every entry from a reader until EOF.
pub fn parse<R: Read>(mut reader: R) -> Result<Vec<LogEntry>> {
    let mut entries = Vec::new();
    let mut offset = 0usize;
    loop {
        let mut tag = [0u8; 1];
        match reader.read_exact(&mut tag) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e).wrap_err_with(|| format!("read failed at offset {offset}")),
        }
        let tag = ValueTag::from_byte(tag[0])
            .ok_or_else(|| eyre::eyre!("unknown value tag {} at offset {}", tag[0], offset))?;

        let mut value = [0u8; 8];
        let mut location = [0u8; 8];
        reader
            .read_exact(&mut value)
            .and_then(|()| reader.read_exact(&mut location))
            .wrap_err_with(|| format!("truncated entry at offset {offset}"))?;

        entries.push(LogEntry {
            value: tag.decode(value),
            location: u64::from_le_bytes(location),
        });
        offset += ENTRY_SIZE;
    }
    Ok(entries)
}

/// Read and parse a fuzzlog file.
pub fn read_file(path: &Path) -> Result<Vec<LogEntry>> {
    let bytes = fs::read(path).wrap_err_with(|| format!("cannot read {}", path.display()))?;
    parse(bytes.as_slice()).wrap_err_with(|| format!("malformed fuzzlog {}", path.display()))
}

/// Encode entries in the runtime's format. Every value is written as f64.
pub fn encode(entries: &[LogEntry]) -> Vec<u8> {
    let mut out = Vec::with_capacity(entries.len() * ENTRY_SIZE);
    for e in entries {
        out.push(ValueTag::F64 as u8);
        out.extend_from_slice(&e.value.to_le_bytes());
        out.extend_from_slice(&e.location.to_le_bytes());
    }
    out
}
