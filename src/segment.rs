//! The concrete, file-backed representation of "the log" that the cleaner
//! reads from and writes back into.
//!
//! The distilled scope explicitly treats segment creation and roll *policy*
//! (when to start a new segment, how big to let one get) as external. But
//! the cleaner (component C1) still has to read real record bytes off disk
//! and write a compacted replacement, so this module supplies the minimum
//! concrete segment mechanics that policy sits on top of: a segment is a
//! single append-only file of [`crate::record`] frames named by its base
//! offset, and a [`SegmentLog`] is an ordered collection of segments plus
//! the one that is still being appended to (the "active" segment, which the
//! cleaner is never allowed to touch).
//!
//! The atomic-install dance for a cleaned replacement segment -- written in
//! full to a temp file, `fsync`ed, persisted as `<base>.log.swap`, `fsync`ed
//! again, then renamed over the live `<base>.log` -- follows the same
//! write-to-temp-then-rename discipline `commitlog::repo::fs` uses when
//! installing a new segment file, so that a crash at any point during a
//! clean leaves either the original segment or the fully-written
//! replacement on disk, never a half-written one. `FileSegmentLog::open`
//! sweeps for orphans of both stages left behind by a crash: a `.swap` file
//! is finalized by renaming it over its target, and a stray `.cleaned` file
//! (the name a not-yet-persisted in-progress write would carry, should a
//! future writer use it) is discarded.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use tempfile::NamedTempFile;
use thiserror::Error;

use crate::record::{decode_record, encode_record, Record};

#[derive(Debug, Error)]
pub enum SegmentError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("segment decode error: {0}")]
    Decode(#[source] io::Error),
    #[error("no segment covers offset {0}")]
    OffsetNotFound(u64),
    #[error("the active segment ({0}) cannot be replaced by the cleaner")]
    ActiveSegment(u64),
    #[error("unknown segment base offset {0}")]
    UnknownSegment(u64),
}

fn segment_file_name(base_offset: u64) -> String {
    format!("{base_offset:020}.log")
}

/// Recover from a crash that landed mid-swap: a `.cleaned` file with no
/// matching `.swap` never got far enough to be trusted and is discarded; a
/// `.swap` file is already fully written and fsynced (the only thing left
/// undone was the final rename) and is installed in place of its original.
fn recover_swap_and_cleaned_orphans(dir: &Path) -> io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(base) = name.strip_suffix(".log.swap") {
            if base.parse::<u64>().is_ok() {
                let final_path = dir.join(format!("{base}.log"));
                std::fs::rename(entry.path(), final_path)?;
            }
        } else if name.ends_with(".log.cleaned") {
            std::fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}

/// One append-only file of record frames, starting at `base_offset`.
///
/// Offsets stored in this segment run from `base_offset` (inclusive) up to
/// but not including whatever the log's next unwritten offset is; a
/// segment does not know its own upper bound, that's determined externally
/// by when the next segment's base offset begins.
pub struct Segment {
    base_offset: u64,
    path: PathBuf,
    file: RwLock<File>,
    size: RwLock<u64>,
}

impl Segment {
    pub fn create(dir: &Path, base_offset: u64) -> io::Result<Self> {
        let path = dir.join(segment_file_name(base_offset));
        let file = File::options()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        Ok(Self {
            base_offset,
            path,
            file: RwLock::new(file),
            size: RwLock::new(0),
        })
    }

    pub fn open(path: &Path, base_offset: u64) -> io::Result<Self> {
        let file = File::options().read(true).write(true).open(path)?;
        let size = file.metadata()?.len();
        Ok(Self {
            base_offset,
            path: path.to_path_buf(),
            file: RwLock::new(file),
            size: RwLock::new(size),
        })
    }

    pub fn base_offset(&self) -> u64 {
        self.base_offset
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        *self.size.read()
    }

    /// Append one record frame at the current end of the segment. Returns
    /// the byte position the frame was written at, for the caller to hand
    /// to the offset index.
    pub fn append(&self, record: &Record) -> io::Result<u32> {
        let mut file = self.file.write();
        let mut size = self.size.write();
        let position = *size;
        file.seek(SeekFrom::Start(position))?;
        let mut writer = BufWriter::new(&mut *file);
        encode_record(record, &mut writer)?;
        writer.flush()?;
        *size = position + record.encoded_len() as u64;
        Ok(position as u32)
    }

    /// Decode the single record starting at `position`, stamping it with
    /// logical `offset` (the segment itself stores no offsets, only bytes).
    pub fn read_at(&self, position: u32, offset: u64) -> io::Result<Option<Record>> {
        let file = self.file.read();
        let mut reader = file.try_clone()?;
        reader.seek(SeekFrom::Start(position as u64))?;
        decode_record(offset, true, usize::MAX, BufReader::new(reader))
    }

    /// Iterate every record in the segment in file order, offsets assigned
    /// sequentially starting at `base_offset`. Used by the cleaner, which
    /// has no separate index for the segment it's currently scanning.
    pub fn iter_from_start(&self) -> io::Result<SegmentIter> {
        self.iter_from_start_capped(usize::MAX)
    }

    /// Like [`Segment::iter_from_start`], but reports [`io::ErrorKind::InvalidData`]
    /// wrapping a [`crate::record::RecordError::MessageTooLarge`] instead of
    /// attempting to allocate a buffer for any single frame larger than
    /// `max_frame_len`.
    pub fn iter_from_start_capped(&self, max_frame_len: usize) -> io::Result<SegmentIter> {
        let file = self.file.read();
        let reader = file.try_clone()?;
        Ok(SegmentIter {
            reader: BufReader::new(reader),
            next_offset: self.base_offset,
            position: 0,
            max_frame_len,
        })
    }

    pub fn sync(&self) -> io::Result<()> {
        self.file.read().sync_data()
    }

    /// Filesystem modification time, used by the cleaner to compute the
    /// tombstone delete horizon.
    pub fn last_modified(&self) -> io::Result<std::time::SystemTime> {
        self.file.read().metadata()?.modified()
    }
}

pub struct SegmentIter {
    reader: BufReader<File>,
    next_offset: u64,
    position: u32,
    max_frame_len: usize,
}

impl Iterator for SegmentIter {
    /// `(file position the record started at, the decoded record)`.
    type Item = io::Result<(u32, Record)>;

    fn next(&mut self) -> Option<Self::Item> {
        let start = self.position;
        match decode_record(self.next_offset, true, self.max_frame_len, &mut self.reader) {
            Ok(Some(record)) => {
                self.position = start + record.encoded_len() as u32;
                self.next_offset += 1;
                Some(Ok((start, record)))
            }
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

/// What the cleaner (and anything else that needs to walk "the log")
/// operates against: an ordered set of segments plus the one currently
/// being appended to.
pub trait SegmentLog: Send + Sync {
    /// Base offsets of every segment, ascending, including the active one.
    fn segment_base_offsets(&self) -> Vec<u64>;

    /// The base offset of the segment new appends land in. The cleaner must
    /// never select this segment for compaction.
    fn active_base_offset(&self) -> u64;

    fn segment(&self, base_offset: u64) -> Result<std::sync::Arc<Segment>, SegmentError>;

    /// Atomically replace a non-active segment with a cleaned rewrite.
    /// `records` is the exact sequence of records to retain, in order.
    /// Returns an error if `base_offset` names the active segment.
    fn replace_segment(&self, base_offset: u64, records: &[Record]) -> Result<(), SegmentError>;

    /// Atomically replace a contiguous group of non-active segments
    /// (`group`, ascending by base offset) with a single cleaned segment
    /// rooted at `group[0]`. The remaining segments in the group are
    /// deleted once the replacement is installed.
    fn replace_segment_group(&self, group: &[u64], records: &[Record]) -> Result<(), SegmentError>;
}

/// A directory of `<base_offset>.log` files, the simplest `SegmentLog` that
/// can back the cleaner, delayed-fetch, and accumulator components against
/// real bytes on disk.
pub struct FileSegmentLog {
    dir: PathBuf,
    segments: RwLock<BTreeMap<u64, std::sync::Arc<Segment>>>,
    active: RwLock<u64>,
}

impl FileSegmentLog {
    /// Open an existing directory of segment files, or create a fresh one
    /// with a single empty active segment based at `initial_base_offset` if
    /// the directory is empty.
    pub fn open(dir: &Path, initial_base_offset: u64) -> io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        recover_swap_and_cleaned_orphans(dir)?;
        let mut segments = BTreeMap::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(base) = name.strip_suffix(".log").and_then(|s| s.parse::<u64>().ok()) {
                let segment = Segment::open(&entry.path(), base)?;
                segments.insert(base, std::sync::Arc::new(segment));
            }
        }
        let active = if let Some((&last, _)) = segments.iter().next_back() {
            last
        } else {
            let segment = Segment::create(dir, initial_base_offset)?;
            segments.insert(initial_base_offset, std::sync::Arc::new(segment));
            initial_base_offset
        };
        Ok(Self {
            dir: dir.to_path_buf(),
            segments: RwLock::new(segments),
            active: RwLock::new(active),
        })
    }

    pub fn active_segment(&self) -> std::sync::Arc<Segment> {
        let active = *self.active.read();
        self.segments.read().get(&active).cloned().expect("active segment always present")
    }

    /// Append a record to the active segment. Returns `(offset, position)`.
    /// Offset assignment and segment rolling are the caller's
    /// responsibility; this only writes bytes.
    pub fn append(&self, offset: u64, mut record: Record) -> io::Result<(u64, u32)> {
        record.offset = offset;
        let position = self.active_segment().append(&record)?;
        Ok((offset, position))
    }

    /// Start a new active segment at `base_offset`. The previous active
    /// segment becomes compactable once this returns.
    pub fn roll(&self, base_offset: u64) -> io::Result<()> {
        let segment = Segment::create(&self.dir, base_offset)?;
        self.segments.write().insert(base_offset, std::sync::Arc::new(segment));
        *self.active.write() = base_offset;
        Ok(())
    }
}

impl SegmentLog for FileSegmentLog {
    fn segment_base_offsets(&self) -> Vec<u64> {
        self.segments.read().keys().copied().collect()
    }

    fn active_base_offset(&self) -> u64 {
        *self.active.read()
    }

    fn segment(&self, base_offset: u64) -> Result<std::sync::Arc<Segment>, SegmentError> {
        self.segments
            .read()
            .get(&base_offset)
            .cloned()
            .ok_or(SegmentError::UnknownSegment(base_offset))
    }

    fn replace_segment(&self, base_offset: u64, records: &[Record]) -> Result<(), SegmentError> {
        if base_offset == self.active_base_offset() {
            return Err(SegmentError::ActiveSegment(base_offset));
        }
        if !self.segments.read().contains_key(&base_offset) {
            return Err(SegmentError::UnknownSegment(base_offset));
        }

        let final_path = self.dir.join(segment_file_name(base_offset));
        let swap_path = self.dir.join(format!("{base_offset:020}.log.swap"));

        let mut cleaned = NamedTempFile::new_in(&self.dir)?;
        {
            let mut writer = BufWriter::new(cleaned.as_file_mut());
            for record in records {
                encode_record(record, &mut writer)?;
            }
            writer.flush()?;
        }
        cleaned.as_file().sync_data()?;
        // Stage under the conventional `.swap` name first so a crash
        // between these two renames still leaves an unambiguous,
        // recognizable artifact behind rather than a stray temp file.
        let cleaned = cleaned.persist(&swap_path).map_err(|e| e.error)?;
        cleaned.sync_all()?;
        std::fs::rename(&swap_path, &final_path)?;

        let segment = Segment::open(&final_path, base_offset)?;
        self.segments
            .write()
            .insert(base_offset, std::sync::Arc::new(segment));
        Ok(())
    }

    fn replace_segment_group(&self, group: &[u64], records: &[Record]) -> Result<(), SegmentError> {
        let &first = group.first().ok_or(SegmentError::UnknownSegment(0))?;
        for &base_offset in group {
            if base_offset == self.active_base_offset() {
                return Err(SegmentError::ActiveSegment(base_offset));
            }
        }
        self.replace_segment(first, records)?;
        for &base_offset in &group[1..] {
            let path = self.dir.join(segment_file_name(base_offset));
            self.segments.write().remove(&base_offset);
            std::fs::remove_file(path)?;
        }
        Ok(())
    }
}
