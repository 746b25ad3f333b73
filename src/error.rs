use std::io;
use std::path::PathBuf;

use crate::packer::CorruptRecord;

/// Errors surfaced to callers of the logging runtime.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The log file header has already been written.
    #[error("output path cannot be changed once the log file has been started")]
    AlreadyStarted,
    #[error("invalid output path {path:?}: {reason}")]
    InvalidPath { path: PathBuf, reason: String },
    /// The background writer hit an I/O error and stopped accepting records.
    #[error("background writer failed: {0}")]
    WriterFailed(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Fatal decompression errors. Output produced before one of these is
/// returned remains valid.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("not a log file: bad magic {0:02x?}")]
    BadMagic([u8; 4]),
    #[error("unsupported log format version {0}")]
    UnsupportedVersion(u16),
    #[error("file is too short to hold a header")]
    TruncatedHeader,
    #[error("truncated block at byte offset {offset}: expected {expected} bytes, found {found}")]
    TruncatedBlock {
        offset: u64,
        expected: usize,
        found: usize,
    },
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// A problem confined to a single record or block. The reader skips it,
/// counts it and keeps going.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RecordError {
    #[error("record references unknown log site {0}")]
    UnknownSite(u32),
    #[error("corrupt record for log site {site_id}: {source}")]
    Corrupt {
        site_id: u32,
        #[source]
        source: CorruptRecord,
    },
    #[error("corrupt block at byte offset {offset}: {reason}")]
    CorruptBlock { offset: u64, reason: String },
}
