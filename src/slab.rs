use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::constants::{COUNT_SIZE, MINIMUM_SLABS_SIZE};
use crate::error::{Error, Result};
use crate::memory::{Accessor, MappedFile};

/// Append-only variable-size allocator.
///
/// File layout: `[header][payload_size: u64][slab bytes..]`. The payload
/// size counts its own eight bytes, so the first slab lives at offset 8.
#[derive(Debug)]
pub struct SlabAllocator {
    file: Arc<MappedFile>,
    header_size: u64,
    /// Allocation frontier, persisted by `sync`
    payload_size: AtomicU64,
    update: Mutex<()>,
}

impl SlabAllocator {
    pub fn new(file: Arc<MappedFile>, header_size: u64) -> Self {
        SlabAllocator {
            file,
            header_size,
            payload_size: AtomicU64::new(MINIMUM_SLABS_SIZE),
            update: Mutex::new(()),
        }
    }

    /// Size the file for an empty payload and persist the frontier.
    pub fn create(&self) -> Result<()> {
        let minimum = self
            .header_size
            .checked_add(MINIMUM_SLABS_SIZE)
            .ok_or(Error::Overflow)?;
        self.file.resize(minimum)?;

        let _update = self.update.lock();
        self.payload_size
            .store(MINIMUM_SLABS_SIZE, Ordering::Release);
        self.write_payload_size(MINIMUM_SLABS_SIZE)
    }

    /// Load the frontier and check it against the file size.
    pub fn start(&self) -> Result<()> {
        let stored = {
            let memory = self.file.access()?;
            memory.read_u64(self.header_size as usize)?
        };

        // Validate frontier
        if stored < MINIMUM_SLABS_SIZE {
            return Err(Error::Corrupted(format!(
                "{}: payload size {} is below {}",
                self.file.path().display(),
                stored,
                MINIMUM_SLABS_SIZE
            )));
        }
        let required = self.header_size.checked_add(stored).ok_or(Error::Overflow)?;
        if required > self.file.size() {
            return Err(Error::Corrupted(format!(
                "{}: payload of {} bytes exceeds file size {}",
                self.file.path().display(),
                stored,
                self.file.size()
            )));
        }

        let _update = self.update.lock();
        self.payload_size.store(stored, Ordering::Release);
        Ok(())
    }

    /// Persist the frontier.
    pub fn sync(&self) -> Result<()> {
        let _update = self.update.lock();
        self.write_payload_size(self.payload_size())
    }

    /// Allocation frontier, including the size field itself
    pub fn payload_size(&self) -> u64 {
        self.payload_size.load(Ordering::Acquire)
    }

    /// Append a slab of `size` bytes and return its offset.
    pub fn new_slab(&self, size: u64) -> Result<u64> {
        let _update = self.update.lock();
        let offset = self.payload_size();
        let next = offset.checked_add(size).ok_or(Error::Overflow)?;

        let required = self.header_size.checked_add(next).ok_or(Error::Overflow)?;
        self.file.reserve(required)?;

        self.payload_size.store(next, Ordering::Release);
        Ok(offset)
    }

    /// View positioned at slab `offset`.
    pub fn get(&self, offset: u64) -> Result<Accessor<'_>> {
        let size = self.payload_size();
        if offset < COUNT_SIZE || offset >= size {
            return Err(Error::OutOfBounds { offset, size });
        }

        let position = self.header_size.checked_add(offset).ok_or(Error::Overflow)?;
        self.file.access()?.increment(position)
    }

    pub fn file(&self) -> &Arc<MappedFile> {
        &self.file
    }

    fn write_payload_size(&self, size: u64) -> Result<()> {
        let memory = self.file.access()?;
        memory.write_u64(self.header_size as usize, size)
    }
}
