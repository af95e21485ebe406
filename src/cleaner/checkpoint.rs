//! The per-data-directory cleaner checkpoint file: for each partition, the
//! exclusive upper bound of the prefix that has already been compacted.

use std::collections::HashMap;
use std::fs;
use std::io::{self, BufRead, BufWriter, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use super::Partition;

const CHECKPOINT_VERSION: u32 = 0;

/// Text checkpoint file: `version`, `N`, then `N` lines of
/// `topic partition offset`. Rewrites are atomic (write-temp, fsync,
/// rename), the same discipline `commitlog::repo::fs` uses to install a
/// segment file.
pub struct Checkpoint {
    path: PathBuf,
}

impl Checkpoint {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Load the checkpoint file, or an empty map if it does not exist yet
    /// (a fresh data directory has nothing checkpointed).
    pub fn load(&self) -> io::Result<HashMap<Partition, u64>> {
        let file = match fs::File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(e) => return Err(e),
        };
        let mut lines = io::BufReader::new(file).lines();

        let _version: u32 = lines
            .next()
            .ok_or_else(|| invalid("missing version line"))??
            .trim()
            .parse()
            .map_err(|_| invalid("version line is not a number"))?;
        let count: usize = lines
            .next()
            .ok_or_else(|| invalid("missing entry count line"))??
            .trim()
            .parse()
            .map_err(|_| invalid("entry count line is not a number"))?;

        let mut map = HashMap::with_capacity(count);
        for _ in 0..count {
            let line = lines.next().ok_or_else(|| invalid("truncated checkpoint file"))??;
            let mut parts = line.rsplitn(2, ' ');
            let offset: u64 = parts
                .next()
                .ok_or_else(|| invalid("malformed checkpoint line"))?
                .parse()
                .map_err(|_| invalid("malformed offset in checkpoint line"))?;
            let rest = parts.next().ok_or_else(|| invalid("malformed checkpoint line"))?;
            let mut rest_parts = rest.rsplitn(2, ' ');
            let partition: i32 = rest_parts
                .next()
                .ok_or_else(|| invalid("malformed checkpoint line"))?
                .parse()
                .map_err(|_| invalid("malformed partition in checkpoint line"))?;
            let topic = rest_parts
                .next()
                .ok_or_else(|| invalid("malformed checkpoint line"))?
                .to_string();
            map.insert(Partition::new(topic, partition), offset);
        }
        Ok(map)
    }

    /// Atomically replace the checkpoint file with `entries`.
    pub fn write(&self, entries: &HashMap<Partition, u64>) -> io::Result<()> {
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir)?;
        let mut temp = NamedTempFile::new_in(dir)?;
        {
            let mut writer = BufWriter::new(temp.as_file_mut());
            writeln!(writer, "{CHECKPOINT_VERSION}")?;
            writeln!(writer, "{}", entries.len())?;
            for (partition, offset) in entries {
                writeln!(writer, "{} {} {offset}", partition.topic, partition.partition)?;
            }
            writer.flush()?;
        }
        temp.as_file().sync_all()?;
        temp.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }
}

fn invalid(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}
