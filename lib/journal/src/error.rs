use std::io;
use std::path::PathBuf;

/// Error that occurred while encoding or decoding a single record.
///
/// Mirrors the split the teacher's `disk_v2::record` module draws between a checksum mismatch and
/// an outright deserialization failure, collapsed here into one enum since this crate's framing is
/// hand-rolled rather than archive-based.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// A record's tag byte or length field was structurally impossible.
    #[error("corrupt record at offset {offset}: {reason}")]
    Corrupt { offset: u64, reason: String },

    /// A record decoded structurally but its CRC32 did not match the stored checksum.
    #[error("checksum mismatch at offset {offset}: calculated {calculated:#010x}, stored {stored:#010x}")]
    Checksum {
        offset: u64,
        calculated: u32,
        stored: u32,
    },

    /// Underlying I/O failure while reading or writing a record.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Error that occurred while operating on a single segment file.
#[derive(Debug, thiserror::Error)]
pub enum SegmentError {
    #[error("I/O error on segment {path}: {source}")]
    Io { path: PathBuf, source: io::Error },

    #[error("segment {path} has an invalid header: {reason}")]
    BadHeader { path: PathBuf, reason: String },

    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Error surfaced by [`crate::reader::Reader`] operations.
#[derive(Debug, thiserror::Error)]
pub enum ReaderStateError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Segment(#[from] SegmentError),

    /// `commit`/`start_read_behind` called in violation of the documented preconditions. A
    /// contract violation, not a recoverable condition -- see `§7` of the governing design.
    #[error("protocol misuse: {0}")]
    ProtocolMisuse(String),

    /// The id could not be located by the id index, either because it precedes the earliest live
    /// segment or because the journal is missing a segment the index implied should exist.
    #[error("unknown id: {0}")]
    UnknownId(u64),
}

/// Umbrella error type returned by [`crate::journal::Journal`] operations.
#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Segment(#[from] SegmentError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("unknown id: {0}")]
    UnknownId(u64),

    #[error("protocol misuse: {0}")]
    ProtocolMisuse(String),
}

impl From<ReaderStateError> for JournalError {
    fn from(e: ReaderStateError) -> Self {
        match e {
            ReaderStateError::Io(source) => JournalError::Io(source),
            ReaderStateError::Codec(source) => JournalError::Codec(source),
            ReaderStateError::Segment(source) => JournalError::Segment(source),
            ReaderStateError::ProtocolMisuse(reason) => JournalError::ProtocolMisuse(reason),
            ReaderStateError::UnknownId(id) => JournalError::UnknownId(id),
        }
    }
}
