//! The record model shared by the cleaner, the offset index, and the
//! producer accumulator.
//!
//! A [`Record`] is deliberately small and owns its payloads as [`Bytes`] so
//! that cloning a record (e.g. to hand it to a codec during recompaction)
//! never re-copies the underlying key/value bytes.

use std::io::{self, Read, Write};

use bitflags::bitflags;
use bytes::Bytes;
use crc32c::{Crc32cReader, Crc32cWriter};
use thiserror::Error;

bitflags! {
    /// Per-record frame flags, laid out the way `commitlog::payload::txdata::Flags`
    /// packs its header bits.
    #[derive(Clone, Copy)]
    struct RecordFlags: u8 {
        const COMPRESSED = 0b0000_0001;
    }
}

/// The compression codec a record (or a compressed container of records) was
/// written with.
///
/// Only the codecs needed to exercise the cleaner's recompaction path are
/// implemented; see `DESIGN.md` for why this crate does not ship a full
/// codec zoo.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum Compression {
    /// Record bytes are stored as-is.
    None = 0,
    /// Record bytes are deflate-compressed via `flate2`.
    Gzip = 1,
}

impl Compression {
    fn from_flags(flags: RecordFlags) -> Self {
        if flags.contains(RecordFlags::COMPRESSED) {
            Self::Gzip
        } else {
            Self::None
        }
    }
}

/// One record in a segment.
///
/// A record with `value == None` is a **tombstone**: it signals deletion of
/// `key` for compaction purposes, but the record itself is still a concrete,
/// offset-addressable entry in the log.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    pub offset: u64,
    pub timestamp: i64,
    pub key: Option<Bytes>,
    pub value: Option<Bytes>,
    pub compression: Compression,
}

impl Record {
    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }

    /// Size of this record's frame once encoded, without re-encoding it.
    pub fn encoded_len(&self) -> usize {
        frame_len(
            self.key.as_ref().map_or(0, |k| k.len()),
            self.value.as_ref().map_or(0, |v| v.len()),
        )
    }
}

/// Size of a record's encoded frame given only its key/value lengths, for
/// callers (the accumulator) that need to know whether a record will fit
/// before they've built the `Record` itself.
pub fn frame_len(key_len: usize, value_len: usize) -> usize {
    FRAME_LEN_PREFIX + FRAME_CONTENT_HEADER_LEN + key_len + value_len + CRC_LEN
}

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("checksum mismatch decoding record at presumed offset {offset}")]
    Checksum { offset: u64 },
    #[error("single record exceeds the maximum buffer size ({max_io_buffer_size} bytes)")]
    MessageTooLarge { max_io_buffer_size: usize },
}

const TOMBSTONE_VALUE_LEN: u32 = u32::MAX;
/// Bytes of the `u32 frameLen` prefix itself, not counted by `frameLen`.
const FRAME_LEN_PREFIX: usize = 4;
/// flags(1) + timestamp(8) + key_len(4) + value_len(4), counted by `frameLen`.
const FRAME_CONTENT_HEADER_LEN: usize = 1 + 8 + 4 + 4;
const CRC_LEN: usize = 4;

/// Write one record frame:
/// `u32 frameLen || flags || timestamp || key_len || key || value_len ||
/// value || crc32c(flags..=value)`, where `frameLen` counts every byte after
/// itself, crc trailer included. `offset` is not stored in the frame itself
/// -- it is implied by the record's position in the segment and recovered
/// from the segment's [`crate::index::OffsetIndex`] or by counting,
/// mirroring how `commitlog::commit::Commit` stores only a `min_tx_offset`
/// plus a count rather than per-record offsets.
pub fn encode_record<W: Write>(record: &Record, mut out: W) -> io::Result<()> {
    let frame_len = (record.encoded_len() - FRAME_LEN_PREFIX) as u32;
    out.write_all(&frame_len.to_be_bytes())?;

    let mut out = Crc32cWriter::new(out);

    let flags = if record.compression == Compression::None {
        RecordFlags::empty()
    } else {
        RecordFlags::COMPRESSED
    };
    out.write_all(&[flags.bits()])?;
    out.write_all(&record.timestamp.to_be_bytes())?;

    let key_len = record.key.as_ref().map_or(0, |k| k.len()) as u32;
    out.write_all(&key_len.to_be_bytes())?;
    if let Some(key) = &record.key {
        out.write_all(key)?;
    }

    let value_len = record
        .value
        .as_ref()
        .map_or(TOMBSTONE_VALUE_LEN, |v| v.len() as u32);
    out.write_all(&value_len.to_be_bytes())?;
    if let Some(value) = &record.value {
        out.write_all(value)?;
    }

    let crc = out.crc32c();
    let mut out = out.into_inner();
    out.write_all(&crc.to_be_bytes())?;

    Ok(())
}

/// Read one record frame written by [`encode_record`].
///
/// Returns `Ok(None)` if `read` is at EOF before the `frameLen` prefix of a
/// new frame is consumed -- a clean end of segment. `offset` is supplied by
/// the caller (the segment knows which logical offset it is about to hand
/// back) so it can be stamped onto the returned [`Record`] and used in
/// error messages. `max_frame_len` bounds the allocation this function will
/// attempt before reading a single byte of the frame body; the cleaner uses
/// it to turn an oversized record into a reported `MessageTooLarge` instead
/// of an unbounded allocation. Pass `usize::MAX` for unconstrained reads.
pub fn decode_record<R: Read>(
    offset: u64,
    timestamp_is_absolute: bool,
    max_frame_len: usize,
    mut read: R,
) -> io::Result<Option<Record>> {
    let _ = timestamp_is_absolute; // reserved for a future timestamp-type-preserving codec.

    let mut frame_len_buf = [0u8; 4];
    match read.read_exact(&mut frame_len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let frame_len = u32::from_be_bytes(frame_len_buf) as usize;
    if frame_len > max_frame_len {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            RecordError::MessageTooLarge {
                max_io_buffer_size: max_frame_len,
            },
        ));
    }

    let mut body = vec![0u8; frame_len];
    read.read_exact(&mut body)?;
    let (content, stored_crc_buf) = body.split_at(frame_len - CRC_LEN);
    let stored_crc = u32::from_be_bytes(stored_crc_buf.try_into().expect("CRC_LEN bytes"));

    let mut crc_reader = Crc32cReader::new(content);

    let mut flags_buf = [0u8; 1];
    crc_reader.read_exact(&mut flags_buf)?;
    let compression = Compression::from_flags(RecordFlags::from_bits_truncate(flags_buf[0]));

    let mut ts_buf = [0u8; 8];
    crc_reader.read_exact(&mut ts_buf)?;
    let timestamp = i64::from_be_bytes(ts_buf);

    let mut key_len_buf = [0u8; 4];
    crc_reader.read_exact(&mut key_len_buf)?;
    let key_len = u32::from_be_bytes(key_len_buf) as usize;
    let mut key_buf = vec![0u8; key_len];
    crc_reader.read_exact(&mut key_buf)?;

    let mut value_len_buf = [0u8; 4];
    crc_reader.read_exact(&mut value_len_buf)?;
    let value_len = u32::from_be_bytes(value_len_buf);

    let value = if value_len == TOMBSTONE_VALUE_LEN {
        None
    } else {
        let mut value_buf = vec![0u8; value_len as usize];
        crc_reader.read_exact(&mut value_buf)?;
        Some(Bytes::from(value_buf))
    };

    let computed_crc = crc_reader.crc32c();
    if stored_crc != computed_crc {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            RecordError::Checksum { offset },
        ));
    }

    Ok(Some(Record {
        offset,
        timestamp,
        key: if key_len == 0 { None } else { Some(Bytes::from(key_buf)) },
        value,
        compression,
    }))
}
