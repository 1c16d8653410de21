//! Binary framing shared by writer segments and reader state files.
//!
//! Every record on disk is `length: u32 LE ∥ tag: u8 ∥ body ∥ crc32: u32 LE`, where the CRC32
//! (`crc32fast`, same crate the teacher's disk buffer checksums its records with) covers `tag ∥
//! body`. The length prefix is the self-delimiting piece: as long as it was read in full, a reader
//! can always skip to the next record even if this one turns out to be corrupt.

use std::io::{self, Read, Write};

use crc32fast::Hasher;

use crate::error::CodecError;

const TAG_PUT: u8 = 1;
const TAG_READ_HEAD: u8 = 2;
const TAG_READ_DONE: u8 = 3;

/// Trailing bytes reserved for the CRC32 of a record's `tag ∥ body`.
const CRC_LEN: usize = 4;

/// One item enqueued into the journal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    /// Strictly monotonically increasing across the life of the queue.
    pub id: u64,
    /// Milliseconds since the Unix epoch.
    pub add_time: i64,
    /// Milliseconds since the Unix epoch; `None` means the item never expires.
    pub expire_time: Option<i64>,
    /// Opaque payload.
    pub data: Vec<u8>,
}

/// A single persisted record, tagged by which kind of file it belongs in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    /// Appears only in writer segments.
    Put(Item),
    /// Appears only in reader state files.
    ReadHead(u64),
    /// Appears only in reader state files. Ids are sorted ascending with no duplicates.
    ReadDone(Vec<u64>),
}

/// Magic bytes at the start of every segment and reader state file.
const MAGIC: [u8; 4] = *b"JRNL";
/// Current on-disk format version.
const VERSION: u8 = 1;
/// Total length, in bytes, of the file header.
pub(crate) const HEADER_LEN: u64 = MAGIC.len() as u64 + 1;

/// Writes the magic/version header at the current file position.
pub(crate) fn write_header<W: Write>(w: &mut W) -> io::Result<()> {
    w.write_all(&MAGIC)?;
    w.write_all(&[VERSION])
}

/// Reads and validates the magic/version header at the current file position.
pub(crate) fn read_header<R: Read>(r: &mut R) -> Result<(), CodecError> {
    let mut buf = [0u8; HEADER_LEN as usize];
    r.read_exact(&mut buf).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            CodecError::Corrupt {
                offset: 0,
                reason: "file too short to contain a header".to_string(),
            }
        } else {
            CodecError::Io(e)
        }
    })?;
    if buf[0..4] != MAGIC {
        return Err(CodecError::Corrupt {
            offset: 0,
            reason: format!("bad magic {:?}", &buf[0..4]),
        });
    }
    if buf[4] != VERSION {
        return Err(CodecError::Corrupt {
            offset: 0,
            reason: format!("unsupported version {}", buf[4]),
        });
    }
    Ok(())
}

/// Encodes `record` into its on-disk frame, failing if its payload exceeds `max_record_size`.
pub(crate) fn encode_record(record: &Record, max_record_size: usize) -> Result<Vec<u8>, CodecError> {
    let mut body = Vec::new();

    match record {
        Record::Put(item) => {
            if item.data.len() > max_record_size {
                return Err(CodecError::Corrupt {
                    offset: 0,
                    reason: format!(
                        "item data of {} bytes exceeds max_record_size of {}",
                        item.data.len(),
                        max_record_size
                    ),
                });
            }

            let data_len: u32 = item
                .data
                .len()
                .try_into()
                .expect("checked against max_record_size above");

            body.push(TAG_PUT);
            body.extend_from_slice(&item.id.to_le_bytes());
            body.extend_from_slice(&item.add_time.to_le_bytes());
            body.extend_from_slice(&item.expire_time.unwrap_or(0).to_le_bytes());
            body.extend_from_slice(&data_len.to_le_bytes());
            body.extend_from_slice(&item.data);
        }
        Record::ReadHead(id) => {
            body.push(TAG_READ_HEAD);
            body.extend_from_slice(&id.to_le_bytes());
        }
        Record::ReadDone(ids) => {
            debug_assert!(
                ids.windows(2).all(|w| w[0] < w[1]),
                "done-set ids must be sorted and unique"
            );
            body.push(TAG_READ_DONE);
            let count: u32 = ids.len().try_into().expect("done-set too large to encode");
            body.extend_from_slice(&count.to_le_bytes());
            for id in ids {
                body.extend_from_slice(&id.to_le_bytes());
            }
        }
    }

    let mut hasher = Hasher::new();
    hasher.update(&body);
    let crc = hasher.finalize();

    let frame_len: u32 = (body.len() + CRC_LEN)
        .try_into()
        .expect("record length should always fit in a u32");

    let mut frame = Vec::with_capacity(4 + body.len() + CRC_LEN);
    frame.extend_from_slice(&frame_len.to_le_bytes());
    frame.extend_from_slice(&body);
    frame.extend_from_slice(&crc.to_le_bytes());
    Ok(frame)
}

/// Fills `buf` from `r`, returning `Ok(true)` if it was filled completely and `Ok(false)` if the
/// stream ended (cleanly or mid-record) before `buf` could be filled.
fn fill_or_eof<R: Read>(r: &mut R, buf: &mut [u8]) -> io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..])? {
            0 => return Ok(false),
            n => filled += n,
        }
    }
    Ok(true)
}

/// Reads the next record from `r`.
///
/// Returns `Ok(None)` both at a clean end-of-file and when the final record's length prefix was
/// read but its body or checksum trailed off mid-write -- both cases are ordinary tails of an
/// append-only log, not corruption. An `Err` is only returned once a complete, length-delimited
/// frame was read and found to be structurally or cryptographically invalid, in which case
/// `offset` locates the start of that frame for diagnostics.
pub(crate) fn decode_record<R: Read>(
    r: &mut R,
    offset: u64,
) -> Result<Option<(Record, u64)>, CodecError> {
    let mut len_buf = [0u8; 4];
    if !fill_or_eof(r, &mut len_buf)? {
        return Ok(None);
    }
    let len = u32::from_le_bytes(len_buf) as usize;

    if len < 1 + CRC_LEN {
        return Err(CodecError::Corrupt {
            offset,
            reason: format!("record length {len} too small to contain a tag and checksum"),
        });
    }

    let mut frame = vec![0u8; len];
    if !fill_or_eof(r, &mut frame)? {
        return Ok(None);
    }

    let (body, crc_bytes) = frame.split_at(len - CRC_LEN);
    let mut hasher = Hasher::new();
    hasher.update(body);
    let calculated = hasher.finalize();
    let stored = u32::from_le_bytes(crc_bytes.try_into().expect("CRC_LEN is 4"));
    if calculated != stored {
        return Err(CodecError::Checksum {
            offset,
            calculated,
            stored,
        });
    }

    let consumed = 4 + len as u64;
    decode_body(body, offset).map(|record| Some((record, consumed)))
}

fn decode_body(body: &[u8], offset: u64) -> Result<Record, CodecError> {
    let tag = body[0];
    let rest = &body[1..];

    match tag {
        TAG_PUT => {
            if rest.len() < 8 + 8 + 8 + 4 {
                return Err(too_short(offset, "Put"));
            }
            let id = read_u64(rest, 0);
            let add_time = read_u64(rest, 8) as i64;
            let expire_time_raw = read_u64(rest, 16) as i64;
            let data_len = u32::from_le_bytes(rest[24..28].try_into().unwrap()) as usize;
            let data = &rest[28..];
            if data.len() != data_len {
                return Err(CodecError::Corrupt {
                    offset,
                    reason: format!(
                        "Put data_len {data_len} does not match remaining bytes {}",
                        data.len()
                    ),
                });
            }
            Ok(Record::Put(Item {
                id,
                add_time,
                expire_time: if expire_time_raw == 0 {
                    None
                } else {
                    Some(expire_time_raw)
                },
                data: data.to_vec(),
            }))
        }
        TAG_READ_HEAD => {
            if rest.len() != 8 {
                return Err(too_short(offset, "ReadHead"));
            }
            Ok(Record::ReadHead(read_u64(rest, 0)))
        }
        TAG_READ_DONE => {
            if rest.len() < 4 {
                return Err(too_short(offset, "ReadDone"));
            }
            let count = u32::from_le_bytes(rest[0..4].try_into().unwrap()) as usize;
            let ids_bytes = &rest[4..];
            if ids_bytes.len() != count * 8 {
                return Err(CodecError::Corrupt {
                    offset,
                    reason: format!(
                        "ReadDone count {count} does not match remaining bytes {}",
                        ids_bytes.len()
                    ),
                });
            }
            let mut ids = Vec::with_capacity(count);
            for i in 0..count {
                ids.push(read_u64(ids_bytes, i * 8));
            }
            if !ids.windows(2).all(|w| w[0] < w[1]) {
                return Err(CodecError::Corrupt {
                    offset,
                    reason: "ReadDone ids were not strictly ascending".to_string(),
                });
            }
            Ok(Record::ReadDone(ids))
        }
        other => Err(CodecError::Corrupt {
            offset,
            reason: format!("unknown record tag {other}"),
        }),
    }
}

fn too_short(offset: u64, which: &str) -> CodecError {
    CodecError::Corrupt {
        offset,
        reason: format!("{which} body too short"),
    }
}

fn read_u64(buf: &[u8], at: usize) -> u64 {
    u64::from_le_bytes(buf[at..at + 8].try_into().unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(record: Record) {
        let encoded = encode_record(&record, 1024 * 1024).unwrap();
        let mut cursor = &encoded[..];
        let (decoded, consumed) = decode_record(&mut cursor, 0).unwrap().unwrap();
        assert_eq!(decoded, record);
        assert_eq!(consumed, encoded.len() as u64);
        assert!(cursor.is_empty(), "decode_record should consume the whole frame");
    }

    #[test]
    fn roundtrip_put() {
        roundtrip(Record::Put(Item {
            id: 42,
            add_time: 1_700_000_000_000,
            expire_time: Some(1_700_000_060_000),
            data: b"hello world".to_vec(),
        }));
    }

    #[test]
    fn roundtrip_put_no_expiry() {
        roundtrip(Record::Put(Item {
            id: 1,
            add_time: 0,
            expire_time: None,
            data: Vec::new(),
        }));
    }

    #[test]
    fn roundtrip_read_head() {
        roundtrip(Record::ReadHead(7));
    }

    #[test]
    fn roundtrip_read_done() {
        roundtrip(Record::ReadDone(vec![2, 3, 9, 100]));
    }

    #[test]
    fn clean_eof_is_none() {
        let mut cursor: &[u8] = &[];
        assert!(decode_record(&mut cursor, 0).unwrap().is_none());
    }

    #[test]
    fn truncated_tail_is_none_not_error() {
        let encoded = encode_record(&Record::ReadHead(7), 1024).unwrap();
        let truncated = &encoded[..encoded.len() - 1];
        let mut cursor = truncated;
        assert!(decode_record(&mut cursor, 0).unwrap().is_none());
    }

    #[test]
    fn corrupted_checksum_is_error() {
        let mut encoded = encode_record(&Record::ReadHead(7), 1024).unwrap();
        let last = encoded.len() - 1;
        encoded[last] ^= 0xFF;
        let mut cursor = &encoded[..];
        match decode_record(&mut cursor, 0) {
            Err(CodecError::Checksum { .. }) => {}
            other => panic!("expected checksum error, got {other:?}"),
        }
    }

    #[test]
    fn oversized_record_fails_to_encode() {
        let item = Item {
            id: 1,
            add_time: 0,
            expire_time: None,
            data: vec![0u8; 16],
        };
        assert!(encode_record(&Record::Put(item), 8).is_err());
    }
}
