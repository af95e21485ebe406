//! One compaction cycle over a single log (spec component C1b).

use std::time::{Duration, SystemTime};

use crate::codec;
use crate::offset_map::{OffsetMap, SENTINEL};
use crate::record::{Record, RecordError};
use crate::segment::SegmentLog;

use super::{CleanerError, Partition};

/// Tuning knobs for a [`Cleaner`], in the style of `commitlog::Options`:
/// small, `Default`-able, doc-commented in terms of units.
#[derive(Clone, Debug)]
pub struct CleanerOptions {
    /// Bytes of memory given to the per-cycle [`OffsetMap`].
    pub dedupe_buffer_size: usize,
    /// Fraction of `dedupe_buffer_size` that may be filled before the map
    /// is declared full and indexing stops.
    pub dedupe_buffer_load_factor: f64,
    /// Cap on a single record frame read while scanning a segment; larger
    /// frames fail the cycle with `MessageTooLarge` rather than growing an
    /// unbounded buffer.
    pub max_io_buffer_size: usize,
    /// Upper bound on the total size of a group of segments rewritten as
    /// one cleaned segment.
    pub max_segment_size: u64,
    /// How long a tombstone survives past the delete horizon before it is
    /// eligible for removal by a later cycle.
    pub delete_retention: Duration,
}

impl Default for CleanerOptions {
    fn default() -> Self {
        Self {
            dedupe_buffer_size: 128 * 1024 * 1024,
            dedupe_buffer_load_factor: 0.9,
            max_io_buffer_size: 16 * 1024 * 1024,
            max_segment_size: 1024 * 1024 * 1024,
            delete_retention: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// The result of one cleaning cycle: the new first-dirty offset the caller
/// (`CleanerManager`) should checkpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CleanOutcome {
    pub end_offset: u64,
}

pub struct Cleaner {
    options: CleanerOptions,
}

impl Cleaner {
    pub fn new(options: CleanerOptions) -> Self {
        Self { options }
    }

    /// Run one compaction cycle. `check_done` is invoked at every safe
    /// point (once per segment scanned, once per group cleaned) and should
    /// return `Err(CleanerError::CleaningAborted(..))` or
    /// `Err(CleanerError::ThreadShutdown)` if the manager wants this cycle
    /// to stop; any other error propagates as a fatal I/O failure for the
    /// cycle, leaving the checkpoint unchanged.
    pub fn clean(
        &self,
        log: &dyn SegmentLog,
        partition: &Partition,
        first_dirty_offset: u64,
        check_done: impl Fn() -> Result<(), CleanerError>,
    ) -> Result<CleanOutcome, CleanerError> {
        let active_base = log.active_base_offset();
        let mut non_active: Vec<u64> = log
            .segment_base_offsets()
            .into_iter()
            .filter(|&bo| bo < active_base)
            .collect();
        non_active.sort_unstable();

        if non_active.is_empty() {
            return Ok(CleanOutcome { end_offset: first_dirty_offset });
        }

        let first_dirty_segment_base = non_active
            .iter()
            .rev()
            .find(|&&bo| bo <= first_dirty_offset)
            .copied()
            .unwrap_or(non_active[0]);

        // Step 1/2: build the OffsetMap from the dirty suffix.
        let mut offset_map = OffsetMap::new(self.options.dedupe_buffer_size, self.options.dedupe_buffer_load_factor);
        let mut fully_indexed = Vec::new();
        // Only advanced when a segment is indexed *to completion*; a record
        // offset seen while scanning a segment that later turns out to be
        // only partially indexed (the map filled mid-segment) must never
        // leak into `end_offset`, or a later duplicate sitting in that
        // segment's unscanned tail would survive alongside an earlier one.
        let mut last_fully_indexed_offset = None;

        for &base in non_active.iter().filter(|&&bo| bo >= first_dirty_segment_base) {
            check_done()?;
            if offset_map.is_full() {
                break;
            }
            let segment = log.segment(base)?;
            let mut segment_fit = true;
            let mut last_offset_in_segment = None;
            for item in segment.iter_from_start_capped(self.options.max_io_buffer_size)? {
                let (_, record) = item.map_err(|e| classify_io_error(e, partition))?;
                if offset_map.is_full() {
                    segment_fit = false;
                    break;
                }
                last_offset_in_segment = Some(record.offset);
                if let Some(codec) = codec::codec_for(record.compression) {
                    // Inner records within the same container share one
                    // log offset, so ordering among *them* is tracked by
                    // folding `relative_offset` into the map's scan
                    // position (see `scan_position`); without that, two
                    // occurrences of the same key inside one container
                    // would be indistinguishable and neither would be
                    // dropped.
                    for inner in codec::decompress_container(codec, record.value.as_deref().unwrap_or(&[]))
                        .map_err(CleanerError::Io)?
                    {
                        if let Some(key) = &inner.key {
                            offset_map.put(key, scan_position(record.offset, inner.relative_offset));
                        }
                    }
                } else if let Some(key) = &record.key {
                    offset_map.put(key, scan_position(record.offset, 0));
                }
            }
            if segment_fit {
                fully_indexed.push(base);
                if let Some(o) = last_offset_in_segment {
                    last_fully_indexed_offset = Some(o);
                }
            } else {
                break;
            }
        }

        if fully_indexed.is_empty() {
            return Err(CleanerError::DedupeBufferTooSmall { partition: partition.clone() });
        }

        let end_offset = last_fully_indexed_offset.map_or(first_dirty_offset, |o| o + 1);

        // Step 3: delete horizon from the newest already-clean segment.
        let clean_prefix: Vec<u64> = non_active.iter().copied().filter(|&bo| bo < first_dirty_segment_base).collect();
        let delete_horizon = match clean_prefix.last() {
            Some(&newest) => {
                let modified = log.segment(newest)?.last_modified()?;
                modified
                    .checked_sub(self.options.delete_retention)
                    .unwrap_or(SystemTime::UNIX_EPOCH)
            }
            None => SystemTime::UNIX_EPOCH,
        };

        // Step 4: group [0, end_offset) into contiguous, size-bounded groups.
        // Scope is the already-clean prefix plus exactly the segments that
        // were indexed to completion above -- never a partially-indexed
        // segment, even if its base happens to be < end_offset.
        let fully_indexed: std::collections::HashSet<u64> = fully_indexed.into_iter().collect();
        let in_scope: Vec<u64> = non_active
            .into_iter()
            .filter(|&bo| bo < first_dirty_segment_base || fully_indexed.contains(&bo))
            .collect();
        let groups = self.group_segments(log, &in_scope)?;

        // Step 5: clean each group.
        for group in &groups {
            check_done()?;
            self.clean_segments(log, partition, group, &offset_map, delete_horizon, &check_done)?;
        }

        Ok(CleanOutcome { end_offset })
    }

    fn group_segments(&self, log: &dyn SegmentLog, bases: &[u64]) -> Result<Vec<Vec<u64>>, CleanerError> {
        let mut groups: Vec<Vec<u64>> = Vec::new();
        let mut current: Vec<u64> = Vec::new();
        let mut current_size: u64 = 0;

        for &base in bases {
            let size = log.segment(base)?.size();
            let would_overflow_size = current_size + size > self.options.max_segment_size;
            let would_overflow_span = match current.first() {
                Some(&first) => base.saturating_sub(first) > i32::MAX as u64,
                None => false,
            };
            if !current.is_empty() && (would_overflow_size || would_overflow_span) {
                groups.push(std::mem::take(&mut current));
                current_size = 0;
            }
            current.push(base);
            current_size += size;
        }
        if !current.is_empty() {
            groups.push(current);
        }
        Ok(groups)
    }

    fn clean_segments(
        &self,
        log: &dyn SegmentLog,
        partition: &Partition,
        group: &[u64],
        offset_map: &OffsetMap,
        delete_horizon: SystemTime,
        check_done: &impl Fn() -> Result<(), CleanerError>,
    ) -> Result<(), CleanerError> {
        let mut retained = Vec::new();

        for &base in group {
            check_done()?;
            let segment = log.segment(base)?;
            let retain_deletes = segment.last_modified()? > delete_horizon;
            for item in segment.iter_from_start_capped(self.options.max_io_buffer_size)? {
                let (_, record) = item.map_err(|e| classify_io_error(e, partition))?;
                if let Some(codec) = codec::codec_for(record.compression) {
                    if let Some(rewritten) = clean_container(codec, offset_map, retain_deletes, &record)
                        .map_err(CleanerError::Io)?
                    {
                        retained.push(rewritten);
                    }
                } else if should_retain(offset_map, retain_deletes, &record) {
                    retained.push(record);
                }
            }
        }

        log.replace_segment_group(group, &retained)?;
        Ok(())
    }
}

/// A record survives compaction iff it has a key, no later record with the
/// same key was observed in this cycle's dirty window, and it isn't a
/// tombstone past its retention window.
fn should_retain(offset_map: &OffsetMap, retain_deletes: bool, record: &Record) -> bool {
    let Some(key) = &record.key else {
        return false;
    };
    should_retain_key(offset_map, retain_deletes, key, scan_position(record.offset, 0), record.is_tombstone())
}

fn should_retain_key(offset_map: &OffsetMap, retain_deletes: bool, key: &[u8], position: u64, is_tombstone: bool) -> bool {
    let last_seen = offset_map.get(key);
    if last_seen != SENTINEL && last_seen > position {
        return false;
    }
    if !retain_deletes && is_tombstone {
        return false;
    }
    true
}

/// Fold a container's log offset and an inner record's position within it
/// into one comparable key for [`OffsetMap`], so two occurrences of the
/// same key inside a single compressed container can still be ordered
/// against each other (not just against occurrences in other records).
/// Shallow records use `relative_offset = 0`. 20 bits comfortably covers
/// any container produced by this crate's own `codec` module, which has no
/// inherent cap on inner record count but is never fed more than a handful
/// in practice (one segment-format frame).
fn scan_position(container_offset: u64, relative_offset: u32) -> u64 {
    (container_offset << 20) | (relative_offset as u64 & 0xF_FFFF)
}

/// Apply the compressed-container branch of `cleanInto`: keep the outer
/// frame byte-exact if every inner record survives, drop it entirely if
/// none do, or recompress the retained subset (preserving `codec` and the
/// outer timestamp) otherwise. Inner records are checked against
/// `offset_map` at their [`scan_position`], so duplicate keys inside the
/// same container are deduplicated the same way duplicates across
/// containers are.
fn clean_container(
    codec: &dyn crate::codec::Codec,
    offset_map: &OffsetMap,
    retain_deletes: bool,
    record: &Record,
) -> std::io::Result<Option<Record>> {
    use crate::codec::ContainerOutcome;

    let value = record.value.as_deref().unwrap_or(&[]);
    let outcome = crate::codec::recompact_container(codec, value, |inner| {
        inner.key.as_ref().is_some_and(|key| {
            should_retain_key(
                offset_map,
                retain_deletes,
                key,
                scan_position(record.offset, inner.relative_offset),
                inner.is_tombstone(),
            )
        })
    })?;

    Ok(match outcome {
        ContainerOutcome::KeepOriginal => Some(record.clone()),
        ContainerOutcome::AllDropped => None,
        ContainerOutcome::Recompressed(survivors) => {
            let new_value = crate::codec::compress_container(codec, &survivors)?;
            Some(Record {
                offset: record.offset,
                timestamp: record.timestamp,
                key: None,
                value: Some(new_value),
                compression: record.compression,
            })
        }
    })
}

fn classify_io_error(e: std::io::Error, partition: &Partition) -> CleanerError {
    if let Some(RecordError::MessageTooLarge { .. }) = e.get_ref().and_then(|inner| inner.downcast_ref::<RecordError>()) {
        CleanerError::MessageTooLarge { partition: partition.clone(), source: e }
    } else {
        CleanerError::Io(e)
    }
}
