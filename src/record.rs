use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::constants::{COUNT_SIZE, MINIMUM_RECORDS_SIZE};
use crate::error::{Error, Result};
use crate::memory::{Accessor, MappedFile};

/// Fixed-size slot allocator.
///
/// File layout: `[header][count: u64][record_0]..[record_{count-1}]`.
/// Slots are never reclaimed individually; `set_count` truncates.
///
/// Updates of the count are serialized by a narrow mutex. Reads of the count
/// never block, so a reader holding an [`Accessor`] can consult it while a
/// writer waits to remap.
#[derive(Debug)]
pub struct RecordAllocator {
    file: Arc<MappedFile>,
    header_size: u64,
    record_size: u64,
    /// Number of allocated records, persisted by `sync`
    count: AtomicU64,
    /// Serializes allocation and truncation
    update: Mutex<()>,
}

impl RecordAllocator {
    pub fn new(file: Arc<MappedFile>, header_size: u64, record_size: u64) -> Self {
        RecordAllocator {
            file,
            header_size,
            record_size,
            count: AtomicU64::new(0),
            update: Mutex::new(()),
        }
    }

    /// Size the file for an empty table and persist a zero count.
    pub fn create(&self) -> Result<()> {
        let minimum = self
            .header_size
            .checked_add(MINIMUM_RECORDS_SIZE)
            .ok_or(Error::Overflow)?;
        self.file.resize(minimum)?;

        let _update = self.update.lock();
        self.count.store(0, Ordering::Release);
        self.write_count(0)
    }

    /// Load the persisted count and check it against the file size.
    pub fn start(&self) -> Result<()> {
        let stored = {
            let memory = self.file.access()?;
            memory.read_u64(self.header_size as usize)?
        };

        let required = self.offset_of(stored)?;
        if required > self.file.size() {
            return Err(Error::Corrupted(format!(
                "{}: {} records of {} bytes need {} bytes, file has {}",
                self.file.path().display(),
                stored,
                self.record_size,
                required,
                self.file.size()
            )));
        }

        let _update = self.update.lock();
        self.count.store(stored, Ordering::Release);
        Ok(())
    }

    /// Persist the count.
    pub fn sync(&self) -> Result<()> {
        let _update = self.update.lock();
        self.write_count(self.count())
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Acquire)
    }

    /// Truncate to `value` records. Growing through this call is refused.
    pub fn set_count(&self, value: u64) -> Result<()> {
        let _update = self.update.lock();
        let count = self.count();
        if value > count {
            return Err(Error::invariant(format!(
                "{}: set_count({}) exceeds count {}",
                self.file.path().display(),
                value,
                count
            )));
        }
        self.count.store(value, Ordering::Release);
        Ok(())
    }

    /// Allocate `n` contiguous records and return the index of the first.
    pub fn new_records(&self, n: u64) -> Result<u64> {
        let _update = self.update.lock();
        let first = self.count();
        let next = first.checked_add(n).ok_or(Error::Overflow)?;

        let required = self.offset_of(next)?;
        self.file.reserve(required)?;

        self.count.store(next, Ordering::Release);
        Ok(first)
    }

    /// View positioned at the start of record `index`.
    ///
    /// Any index covered by the mapping is addressable, including `count`
    /// itself; callers check `index < count` before trusting the contents.
    pub fn get(&self, index: u64) -> Result<Accessor<'_>> {
        let offset = self.offset_of(index)?;
        self.file.access()?.increment(offset)
    }

    pub fn record_size(&self) -> u64 {
        self.record_size
    }

    pub fn file(&self) -> &Arc<MappedFile> {
        &self.file
    }

    fn offset_of(&self, index: u64) -> Result<u64> {
        index
            .checked_mul(self.record_size)
            .and_then(|bytes| bytes.checked_add(self.header_size))
            .and_then(|bytes| bytes.checked_add(COUNT_SIZE))
            .ok_or(Error::Overflow)
    }

    fn write_count(&self, count: u64) -> Result<()> {
        let memory = self.file.access()?;
        memory.write_u64(self.header_size as usize, count)
    }
}
