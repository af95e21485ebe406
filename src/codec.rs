//! Recompaction of compressed record containers.
//!
//! The segment data format (see `DESIGN.md`) lets one on-disk frame's value
//! be a *container*: a compressed blob of several inner records sharing one
//! outer timestamp, each with an offset relative to the container rather
//! than its own absolute one. `FileSegmentLog` only ever writes the shallow,
//! uncompressed path -- wiring real multi-record compressed containers
//! through segment rolling and the offset index is out of scope here (see
//! the spec's compressed-container non-goal) -- but the cleaner's
//! `cleanInto` still has to be able to decide, for a container it reads
//! from *some* producer, whether to keep it byte-exact, drop it entirely,
//! or recompress a retained subset. This module isolates that decision
//! behind a pluggable [`Codec`] so it is expressible and testable without
//! this crate shipping a full codec zoo.

use std::io::{self, Read, Write};

use bytes::Bytes;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression as GzLevel;

use crate::record::Compression;

/// One record inside a compressed container, addressed relative to the
/// container's own offset rather than absolutely.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InnerRecord {
    pub relative_offset: u32,
    pub timestamp: i64,
    pub key: Option<Bytes>,
    pub value: Option<Bytes>,
}

impl InnerRecord {
    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }
}

/// The (de)compression side of a [`Compression`] codec, kept separate from
/// wire framing so a new codec only has to implement two methods.
pub trait Codec: Send + Sync {
    fn compress(&self, data: &[u8]) -> io::Result<Vec<u8>>;
    fn decompress(&self, data: &[u8]) -> io::Result<Vec<u8>>;
}

/// The only concrete codec this crate ships; matches [`Compression::Gzip`].
pub struct GzipCodec;

impl Codec for GzipCodec {
    fn compress(&self, data: &[u8]) -> io::Result<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::new(), GzLevel::default());
        encoder.write_all(data)?;
        encoder.finish()
    }

    fn decompress(&self, data: &[u8]) -> io::Result<Vec<u8>> {
        let mut decoder = GzDecoder::new(data);
        let mut out = Vec::new();
        decoder.read_to_end(&mut out)?;
        Ok(out)
    }
}

/// Look up the concrete codec for a non-`None` [`Compression`].
pub fn codec_for(compression: Compression) -> Option<&'static dyn Codec> {
    match compression {
        Compression::None => None,
        Compression::Gzip => Some(&GzipCodec),
    }
}

const TOMBSTONE_VALUE_LEN: u32 = u32::MAX;

/// Serialize `records` into the uncompressed inner-frame payload, one frame
/// per record: `u32 relativeOffset || i64 timestamp || u32 keyLen || key ||
/// u32 valueLen (0xFFFFFFFF for a tombstone) || value`. No per-frame CRC:
/// the outer record's own checksum already covers the whole compressed
/// blob.
fn encode_inner(records: &[InnerRecord]) -> Vec<u8> {
    let mut buf = Vec::new();
    for record in records {
        buf.extend_from_slice(&record.relative_offset.to_be_bytes());
        buf.extend_from_slice(&record.timestamp.to_be_bytes());
        let key_len = record.key.as_ref().map_or(0, |k| k.len()) as u32;
        buf.extend_from_slice(&key_len.to_be_bytes());
        if let Some(key) = &record.key {
            buf.extend_from_slice(key);
        }
        let value_len = record.value.as_ref().map_or(TOMBSTONE_VALUE_LEN, |v| v.len() as u32);
        buf.extend_from_slice(&value_len.to_be_bytes());
        if let Some(value) = &record.value {
            buf.extend_from_slice(value);
        }
    }
    buf
}

fn decode_inner(mut data: &[u8]) -> io::Result<Vec<InnerRecord>> {
    let mut records = Vec::new();
    while !data.is_empty() {
        let relative_offset = read_u32(&mut data)?;
        let timestamp = read_i64(&mut data)?;
        let key_len = read_u32(&mut data)? as usize;
        let key = read_bytes(&mut data, key_len)?;
        let value_len = read_u32(&mut data)?;
        let value = if value_len == TOMBSTONE_VALUE_LEN {
            None
        } else {
            Some(read_bytes(&mut data, value_len as usize)?)
        };
        records.push(InnerRecord {
            relative_offset,
            timestamp,
            key: if key_len == 0 { None } else { Some(key) },
            value,
        });
    }
    Ok(records)
}

fn read_u32(data: &mut &[u8]) -> io::Result<u32> {
    if data.len() < 4 {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated inner frame"));
    }
    let (head, rest) = data.split_at(4);
    *data = rest;
    Ok(u32::from_be_bytes(head.try_into().expect("4 bytes")))
}

fn read_i64(data: &mut &[u8]) -> io::Result<i64> {
    if data.len() < 8 {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated inner frame"));
    }
    let (head, rest) = data.split_at(8);
    *data = rest;
    Ok(i64::from_be_bytes(head.try_into().expect("8 bytes")))
}

fn read_bytes(data: &mut &[u8], len: usize) -> io::Result<Bytes> {
    if data.len() < len {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated inner frame"));
    }
    let (head, rest) = data.split_at(len);
    *data = rest;
    Ok(Bytes::copy_from_slice(head))
}

/// Compress `records` into a container value under `codec`.
pub fn compress_container(codec: &dyn Codec, records: &[InnerRecord]) -> io::Result<Bytes> {
    codec.compress(&encode_inner(records)).map(Bytes::from)
}

/// Deep-iterate a container's inner records.
pub fn decompress_container(codec: &dyn Codec, value: &[u8]) -> io::Result<Vec<InnerRecord>> {
    decode_inner(&codec.decompress(value)?)
}

/// Result of applying compaction to one compressed container, mirroring
/// the three branches of the spec's `cleanInto`: keep the outer frame
/// byte-exact, recompress a retained subset preserving offsets relative to
/// the first surviving record, or drop the container entirely.
pub enum ContainerOutcome {
    KeepOriginal,
    Recompressed(Vec<InnerRecord>),
    AllDropped,
}

/// Decide how a compressed container should be rewritten during
/// compaction. `should_retain` is evaluated per inner record against
/// whatever the caller considers "this key's last occurrence in the dirty
/// window" (see `cleaner::should_retain`); relative offsets in a
/// recompressed subset are renumbered from the first retained record's
/// original relative offset, per "recompute inner relative offsets
/// relative to the first retained offset" in the design notes.
pub fn recompact_container(
    codec: &dyn Codec,
    value: &[u8],
    should_retain: impl Fn(&InnerRecord) -> bool,
) -> io::Result<ContainerOutcome> {
    let inner = decompress_container(codec, value)?;
    let retained: Vec<InnerRecord> = inner.iter().filter(|r| should_retain(r)).cloned().collect();

    if retained.is_empty() {
        return Ok(ContainerOutcome::AllDropped);
    }
    if retained.len() == inner.len() {
        return Ok(ContainerOutcome::KeepOriginal);
    }

    let base = retained[0].relative_offset;
    let renumbered: Vec<InnerRecord> = retained
        .into_iter()
        .map(|mut r| {
            r.relative_offset -= base;
            r
        })
        .collect();
    Ok(ContainerOutcome::Recompressed(renumbered))
}
