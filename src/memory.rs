use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, warn};
use memmap2::{MmapMut, MmapOptions};
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock, RwLockReadGuard};

use crate::constants::{MapFlags, EXPANSION_DENOMINATOR, EXPANSION_NUMERATOR};
use crate::error::{Error, Result};

/// Process-wide lock taken around every remap.
///
/// One instance is shared by all files of a database so that no two files
/// are remapped at the same time. Tests may pass a fresh handle per file.
pub type RemapLock = Arc<Mutex<()>>;

/// Create a new remap lock handle
pub fn remap_lock() -> RemapLock {
    Arc::new(Mutex::new(()))
}

/// System page size, used to round geometric growth
static PAGE_SIZE: Lazy<u64> = Lazy::new(|| {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 {
        4096
    } else {
        size as u64
    }
});

/// Mapping state guarded by the file's remap lock
#[derive(Debug)]
struct MapState {
    /// Backing file, open while started
    file: Option<File>,
    /// Current mapping
    map: Option<MmapMut>,
    /// Mapped (physical) size of the file
    file_size: u64,
    /// Highest size requested through resize/reserve
    logical_size: u64,
    /// Lifecycle flags
    flags: MapFlags,
}

/// A growable memory-mapped file.
///
/// Views into the mapping are handed out as [`Accessor`]s. Each accessor
/// holds the shared side of the file's lock, and every remap takes the
/// exclusive side, so a view can never outlive the mapping it points into.
/// Callers must drop accessors before growing the file from the same thread.
#[derive(Debug)]
pub struct MappedFile {
    path: PathBuf,
    state: RwLock<MapState>,
    remap_lock: RemapLock,
}

impl MappedFile {
    pub fn new<P: AsRef<Path>>(path: P, remap_lock: RemapLock) -> Self {
        MappedFile {
            path: path.as_ref().to_path_buf(),
            state: RwLock::new(MapState {
                file: None,
                map: None,
                file_size: 0,
                logical_size: 0,
                flags: MapFlags::STOPPED | MapFlags::CLOSED,
            }),
            remap_lock,
        }
    }

    /// Create (or truncate) a file holding a single byte so it can be mapped.
    pub fn touch<P: AsRef<Path>>(path: P) -> Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.write_all(b"X")?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Map the file and mark it started.
    pub fn start(&self) -> Result<()> {
        let mut state = self.state.write();

        // Start is not idempotent
        if !state.flags.contains(MapFlags::STOPPED) {
            return Err(Error::AlreadyStarted(self.path.clone()));
        }

        if state.map.is_none() {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(&self.path)?;
            let size = file.metadata()?.len();
            if size == 0 {
                return Err(Error::Map {
                    path: self.path.clone(),
                    source: io::Error::new(io::ErrorKind::InvalidData, "file is empty"),
                });
            }

            let map = self.map_file(&file, size)?;
            state.file = Some(file);
            state.map = Some(map);
            state.file_size = size;
            state.logical_size = size;
        }

        state.flags = MapFlags::empty();
        debug!(
            "Mapping: {} [{}] ({})",
            self.path.display(),
            state.file_size,
            *PAGE_SIZE
        );
        Ok(())
    }

    /// Mark the file stopped. Idempotent.
    pub fn stop(&self) -> Result<()> {
        let mut state = self.state.write();
        state.flags.insert(MapFlags::STOPPED);
        Ok(())
    }

    /// Flush, unmap and truncate the file to its logical size. Idempotent.
    pub fn close(&self) -> Result<()> {
        let mut state = self.state.write();
        if state.flags.contains(MapFlags::CLOSED) && state.map.is_none() {
            return Ok(());
        }
        state.flags = MapFlags::STOPPED | MapFlags::CLOSED;

        if let Some(map) = state.map.take() {
            map.flush()?;
        }

        if let Some(file) = state.file.take() {
            file.set_len(state.logical_size)?;
            file.sync_all()?;
        }

        debug!(
            "Unmapped: {} [{}]",
            self.path.display(),
            state.logical_size
        );
        state.file_size = 0;
        Ok(())
    }

    pub fn is_stopped(&self) -> bool {
        self.state.read().flags.contains(MapFlags::STOPPED)
    }

    /// Mapped size of the file in bytes
    pub fn size(&self) -> u64 {
        self.state.read_recursive().file_size
    }

    /// Highest size requested by the allocators
    pub fn logical_size(&self) -> u64 {
        self.state.read_recursive().logical_size
    }

    /// Get a view over the whole mapping, positioned at offset zero.
    pub fn access(&self) -> Result<Accessor<'_>> {
        let guard = self.state.read_recursive();
        let (base, len) = match guard.map.as_ref() {
            Some(map) => (map.as_ptr() as *mut u8, map.len()),
            None => return Err(Error::FileClosed(self.path.clone())),
        };

        Ok(Accessor {
            _guard: guard,
            base,
            len,
            offset: 0,
        })
    }

    /// Grow the file to exactly `size` bytes if it is smaller.
    pub fn resize(&self, size: u64) -> Result<()> {
        self.reserve_with(size, EXPANSION_DENOMINATOR)
    }

    /// Grow the file geometrically if `size` exceeds the mapped size.
    pub fn reserve(&self, size: u64) -> Result<()> {
        self.reserve_with(size, EXPANSION_NUMERATOR)
    }

    // There is no way to recover from a resize failure here: the other files
    // of the store may already hold writes for the same block.
    fn reserve_with(&self, size: u64, expansion: u64) -> Result<()> {
        let mut state = self.state.write();

        if state.flags.contains(MapFlags::CLOSED) || state.map.is_none() {
            return Err(Error::FileClosed(self.path.clone()));
        }
        if state.flags.contains(MapFlags::STOPPED) {
            return Err(Error::FileStopped(self.path.clone()));
        }

        if size > state.file_size {
            let mut target = size.checked_mul(expansion).ok_or(Error::Overflow)?
                / EXPANSION_DENOMINATOR;
            if expansion > EXPANSION_DENOMINATOR {
                target = round_up(target, *PAGE_SIZE).ok_or(Error::Overflow)?;
            }
            self.truncate_mapped(&mut state, target.max(size))?;
        }

        state.logical_size = state.logical_size.max(size);
        Ok(())
    }

    fn truncate_mapped(&self, state: &mut MapState, size: u64) -> Result<()> {
        debug!("Resizing: {} [{}]", self.path.display(), size);
        let _remap = self.remap_lock.lock();

        let file = match state.file.as_ref() {
            Some(file) => file,
            None => return Err(Error::FileClosed(self.path.clone())),
        };

        file.set_len(size).map_err(|source| Error::Resize {
            path: self.path.clone(),
            size,
            source,
        })?;

        let map = self.map_file(file, size)?;

        // All outstanding views were released before the write lock was granted.
        state.map = Some(map);
        state.file_size = size;
        Ok(())
    }

    fn map_file(&self, file: &File, size: u64) -> Result<MmapMut> {
        let len = usize::try_from(size).map_err(|_| Error::Overflow)?;

        // SAFETY: the file is owned by this process for the lifetime of the
        // mapping; the directory lock keeps other processes out.
        unsafe { MmapOptions::new().len(len).map_mut(file) }.map_err(|source| Error::Map {
            path: self.path.clone(),
            source,
        })
    }
}

impl Drop for MappedFile {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("failed to close {}: {}", self.path.display(), e);
        }
    }
}

fn round_up(value: u64, multiple: u64) -> Option<u64> {
    let rem = value % multiple;
    if rem == 0 {
        Some(value)
    } else {
        value.checked_add(multiple - rem)
    }
}

/// A positioned view into a mapped file.
///
/// Holding an accessor blocks remapping of its file. Reads and writes are
/// bounds checked against the mapping captured when the view was taken.
///
/// Views do not exclude each other: the single writer may change bytes that
/// an optimistic reader is looking at. Readers must validate what they read
/// against the database's sequential lock before trusting it, and must copy
/// out anything they keep.
pub struct Accessor<'a> {
    _guard: RwLockReadGuard<'a, MapState>,
    base: *mut u8,
    len: usize,
    offset: usize,
}

impl<'a> Accessor<'a> {
    /// Move the view forward by `bytes`.
    pub fn increment(mut self, bytes: u64) -> Result<Self> {
        let bytes = usize::try_from(bytes).map_err(|_| Error::Overflow)?;
        self.offset = self.offset.checked_add(bytes).ok_or(Error::Overflow)?;
        Ok(self)
    }

    /// Absolute file position of the view
    pub fn position(&self) -> u64 {
        self.offset as u64
    }

    /// Bytes mapped from the view position to the end of the file
    pub fn remaining(&self) -> usize {
        self.len.saturating_sub(self.offset)
    }

    /// Borrow `len` bytes starting `at` bytes past the view position.
    pub fn bytes(&self, at: usize, len: usize) -> Result<&[u8]> {
        let start = self.check(at, len)?;

        // SAFETY: the range was checked against the mapping, which stays
        // mapped while the guard is held. The bytes may be rewritten by the
        // writer while borrowed; callers only decode them into owned values
        // and discard the result unless the sequential lock is unchanged.
        Ok(unsafe { std::slice::from_raw_parts(self.base.add(start), len) })
    }

    /// Copy `data` into the mapping `at` bytes past the view position.
    pub fn write(&self, at: usize, data: &[u8]) -> Result<()> {
        let start = self.check(at, data.len())?;

        // SAFETY: bounds checked above. The mapping is shared and writable.
        // Writers are serialized by the owning database's write mutex, and
        // every write happens inside a sequential lock write section, so
        // concurrent readers of these bytes see an odd or changed counter
        // and retry.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.base.add(start), data.len());
        }
        Ok(())
    }

    pub fn read_u32(&self, at: usize) -> Result<u32> {
        let bytes = self.bytes(at, 4)?;
        let mut buf = [0u8; 4];
        buf.copy_from_slice(bytes);
        Ok(u32::from_le_bytes(buf))
    }

    pub fn read_u64(&self, at: usize) -> Result<u64> {
        let bytes = self.bytes(at, 8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(buf))
    }

    pub fn write_u64(&self, at: usize, value: u64) -> Result<()> {
        self.write(at, &value.to_le_bytes())
    }

    fn check(&self, at: usize, len: usize) -> Result<usize> {
        let start = self.offset.checked_add(at).ok_or(Error::Overflow)?;
        let end = start.checked_add(len).ok_or(Error::Overflow)?;
        if end > self.len {
            return Err(Error::OutOfBounds {
                offset: end as u64,
                size: self.len as u64,
            });
        }
        Ok(start)
    }
}
