//! A resizable memory-mapped file region.
//!
//! On POSIX-like systems a segment's backing file can be truncated while a
//! mapping over it is still live; the kernel simply leaves stale pages
//! dangling past the new end until they're unmapped. Some other platforms
//! (Windows in particular) require every mapping to be torn down before the
//! file can be resized. [`MappedRegion`] hides the difference behind one
//! `resize` method, following the same `cfg(unix)` / fallback split
//! `spacetimedb-commitlog` uses for platform-specific path and size-on-disk
//! logic (see `crates/commitlog/src/repo/fs.rs::SizeOnDisk::add`).

use std::fs::File;
use std::io;
use std::path::Path;

use memmap2::MmapMut;
use parking_lot::RwLock;

/// A memory-mapped file whose length can be changed after creation.
///
/// Reads go through `with_slice`/`with_slice_mut`, which on unix are
/// lock-free (the mapping is simply re-read) but on other platforms take a
/// shared read lock so they never race with an in-progress `resize`.
pub struct MappedRegion {
    file: File,
    #[cfg(unix)]
    mmap: RwLock<MmapMut>,
    #[cfg(not(unix))]
    mmap: RwLock<Option<MmapMut>>,
}

impl MappedRegion {
    pub fn create_new(path: &Path, len: u64) -> io::Result<Self> {
        let file = File::options().read(true).write(true).create_new(true).open(path)?;
        file.set_len(len)?;
        Self::from_file(file)
    }

    pub fn open_existing(path: &Path) -> io::Result<Self> {
        let file = File::options().read(true).write(true).open(path)?;
        Self::from_file(file)
    }

    fn from_file(file: File) -> io::Result<Self> {
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        #[cfg(unix)]
        {
            Ok(Self {
                file,
                mmap: RwLock::new(mmap),
            })
        }
        #[cfg(not(unix))]
        {
            Ok(Self {
                file,
                mmap: RwLock::new(Some(mmap)),
            })
        }
    }

    pub fn len(&self) -> u64 {
        #[cfg(unix)]
        {
            self.mmap.read().len() as u64
        }
        #[cfg(not(unix))]
        {
            self.mmap.read().as_ref().map_or(0, |m| m.len() as u64)
        }
    }

    /// Grow or shrink the backing file and remap.
    ///
    /// On unix this is lock-free from the caller's perspective: readers
    /// racing a `resize` either see the old or the new mapping, never a
    /// torn one, because `MmapMut` itself is replaced under the write lock
    /// only for the duration of the swap. On other platforms every mapping
    /// must be dropped before `set_len`, so readers are serialized against
    /// `resize` via the same lock.
    #[cfg(unix)]
    pub fn resize(&self, new_len: u64) -> io::Result<()> {
        self.file.set_len(new_len)?;
        let new_mmap = unsafe { MmapMut::map_mut(&self.file)? };
        *self.mmap.write() = new_mmap;
        Ok(())
    }

    #[cfg(not(unix))]
    pub fn resize(&self, new_len: u64) -> io::Result<()> {
        let mut guard = self.mmap.write();
        *guard = None; // force-unmap before touching the file length.
        self.file.set_len(new_len)?;
        *guard = Some(unsafe { MmapMut::map_mut(&self.file)? });
        Ok(())
    }

    pub fn with_slice<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        #[cfg(unix)]
        {
            f(&self.mmap.read())
        }
        #[cfg(not(unix))]
        {
            let guard = self.mmap.read();
            f(guard.as_deref().expect("mapping present outside of resize"))
        }
    }

    pub fn with_slice_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        #[cfg(unix)]
        {
            f(&mut self.mmap.write())
        }
        #[cfg(not(unix))]
        {
            let mut guard = self.mmap.write();
            f(guard.as_deref_mut().expect("mapping present outside of resize"))
        }
    }

    pub fn flush(&self) -> io::Result<()> {
        #[cfg(unix)]
        {
            self.mmap.read().flush()
        }
        #[cfg(not(unix))]
        {
            self.mmap.read().as_ref().expect("mapping present").flush()
        }
    }

    pub fn flush_async(&self) -> io::Result<()> {
        #[cfg(unix)]
        {
            self.mmap.read().flush_async()
        }
        #[cfg(not(unix))]
        {
            self.mmap.read().as_ref().expect("mapping present").flush_async()
        }
    }
}
