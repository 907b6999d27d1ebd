use std::sync::Arc;

use crate::constants::{BUCKET_SIZE, COUNT_SIZE, EMPTY_LINK};
use crate::error::{Error, Result};
use crate::memory::MappedFile;

/// Content of one hash bucket, or the link field of a chained entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketSlot {
    Empty,
    Head(u64),
}

impl BucketSlot {
    /// Decode a persisted link; the all-ones value marks an empty slot.
    pub fn from_raw(raw: u64) -> Self {
        if raw == EMPTY_LINK {
            BucketSlot::Empty
        } else {
            BucketSlot::Head(raw)
        }
    }

    pub fn to_raw(self) -> u64 {
        match self {
            BucketSlot::Empty => EMPTY_LINK,
            BucketSlot::Head(link) => link,
        }
    }

    pub fn head(self) -> Option<u64> {
        match self {
            BucketSlot::Empty => None,
            BucketSlot::Head(link) => Some(link),
        }
    }
}

/// Bucket array at the start of a table file.
///
/// Layout: `[bucket_count: u64][bucket_0: u64]..[bucket_{N-1}: u64]`.
#[derive(Debug)]
pub struct HashTableHeader {
    file: Arc<MappedFile>,
    bucket_count: u64,
}

impl HashTableHeader {
    pub fn new(file: Arc<MappedFile>, bucket_count: u64) -> Self {
        HashTableHeader { file, bucket_count }
    }

    /// Bytes occupied by a header of `bucket_count` buckets
    pub fn size_for(bucket_count: u64) -> Result<u64> {
        bucket_count
            .checked_mul(BUCKET_SIZE)
            .and_then(|bytes| bytes.checked_add(COUNT_SIZE))
            .ok_or(Error::Overflow)
    }

    pub fn size(&self) -> Result<u64> {
        Self::size_for(self.bucket_count)
    }

    /// Size the file and mark every bucket empty.
    pub fn create(&self) -> Result<()> {
        if self.bucket_count == 0 {
            return Err(Error::InvalidConfig(format!(
                "{}: bucket count must be positive",
                self.file.path().display()
            )));
        }

        let size = self.size()?;
        self.file.resize(size)?;

        let memory = self.file.access()?;
        memory.write_u64(0, self.bucket_count)?;

        let empty = [0xffu8; 4096];
        let mut position = COUNT_SIZE as usize;
        let end = usize::try_from(size).map_err(|_| Error::Overflow)?;
        while position < end {
            let chunk = (end - position).min(empty.len());
            memory.write(position, &empty[..chunk])?;
            position += chunk;
        }
        Ok(())
    }

    /// Check the persisted bucket count against the configured one.
    pub fn start(&self) -> Result<()> {
        let stored = self.file.access()?.read_u64(0)?;
        if stored != self.bucket_count {
            return Err(Error::Corrupted(format!(
                "{}: header has {} buckets, expected {}",
                self.file.path().display(),
                stored,
                self.bucket_count
            )));
        }

        let size = self.size()?;
        if size > self.file.size() {
            return Err(Error::Corrupted(format!(
                "{}: header needs {} bytes, file has {}",
                self.file.path().display(),
                size,
                self.file.size()
            )));
        }
        Ok(())
    }

    pub fn bucket_count(&self) -> u64 {
        self.bucket_count
    }

    pub fn read(&self, bucket: u64) -> Result<BucketSlot> {
        let position = self.position(bucket)?;
        let raw = self.file.access()?.read_u64(position)?;
        Ok(BucketSlot::from_raw(raw))
    }

    pub fn write(&self, bucket: u64, slot: BucketSlot) -> Result<()> {
        let position = self.position(bucket)?;
        self.file.access()?.write_u64(position, slot.to_raw())
    }

    fn position(&self, bucket: u64) -> Result<usize> {
        if bucket >= self.bucket_count {
            return Err(Error::OutOfBounds {
                offset: bucket,
                size: self.bucket_count,
            });
        }
        let position = COUNT_SIZE + bucket * BUCKET_SIZE;
        usize::try_from(position).map_err(|_| Error::Overflow)
    }
}
