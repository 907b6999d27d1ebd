use std::sync::Arc;

use parking_lot::Mutex;

use crate::constants::COUNT_SIZE;
use crate::error::{Error, Result};
use crate::hash_table::RecordHashIndex;
use crate::header::BucketSlot;
use crate::memory::{Accessor, MappedFile};
use crate::record::RecordAllocator;
use crate::types::StatInfo;

/// Per-key most-recent-first list of fixed-size rows.
///
/// The lookup table maps a key to the index of its newest row; every row is
/// `[next: u64][payload]` where `next` is the row added before it.
/// `delete_last_row` must be issued in the exact reverse order of `add_row`
/// for each key.
#[derive(Debug)]
pub struct RecordMultimap<const K: usize> {
    lookup: RecordHashIndex<K>,
    rows: RecordAllocator,
    payload_size: usize,
    write: Mutex<()>,
}

impl<const K: usize> RecordMultimap<K> {
    pub fn new(
        lookup_file: Arc<MappedFile>,
        rows_file: Arc<MappedFile>,
        bucket_count: u64,
        payload_size: usize,
    ) -> Result<Self> {
        Ok(RecordMultimap {
            lookup: RecordHashIndex::new(lookup_file, bucket_count, COUNT_SIZE)?,
            rows: RecordAllocator::new(rows_file, 0, COUNT_SIZE + payload_size as u64),
            payload_size,
            write: Mutex::new(()),
        })
    }

    pub fn create(&self) -> Result<()> {
        self.lookup.create()?;
        self.rows.create()
    }

    pub fn start(&self) -> Result<()> {
        self.lookup.start()?;
        self.rows.start()
    }

    pub fn sync(&self) -> Result<()> {
        self.lookup.sync()?;
        self.rows.sync()
    }

    pub fn payload_size(&self) -> usize {
        self.payload_size
    }

    /// Head row of `key`'s chain.
    pub fn lookup(&self, key: &[u8; K]) -> Result<BucketSlot> {
        match self.lookup.find(key)? {
            Some(memory) => Ok(BucketSlot::from_raw(memory.read_u64(0)?)),
            None => Ok(BucketSlot::Empty),
        }
    }

    /// Prepend a row to `key`'s chain; `write` fills the zeroed payload.
    pub fn add_row<F>(&self, key: &[u8; K], write: F) -> Result<u64>
    where
        F: FnOnce(&mut [u8]),
    {
        let mut row = vec![0u8; COUNT_SIZE as usize + self.payload_size];
        write(&mut row[COUNT_SIZE as usize..]);

        let _write = self.write.lock();
        let index = self.rows.new_records(1)?;
        let head = self.lookup(key)?;
        row[..COUNT_SIZE as usize].copy_from_slice(&head.to_raw().to_le_bytes());
        self.rows.get(index)?.write(0, &row)?;

        let link = index.to_le_bytes();
        match head {
            BucketSlot::Empty => {
                self.lookup
                    .store(key, |value| value.copy_from_slice(&link))?;
            }
            BucketSlot::Head(_) => {
                self.lookup
                    .restore(key, |value| value.copy_from_slice(&link))?;
            }
        }
        Ok(index)
    }

    /// Remove the newest row of `key` and return its index.
    ///
    /// The row is only unlinked; the rows table keeps its count.
    pub fn delete_last_row(&self, key: &[u8; K]) -> Result<u64> {
        let _write = self.write.lock();
        let head = match self.lookup(key)? {
            BucketSlot::Head(head) => head,
            BucketSlot::Empty => return Err(Error::EmptyChain),
        };

        let next = BucketSlot::from_raw(self.rows.get(head)?.read_u64(0)?);
        match next {
            BucketSlot::Empty => {
                if !self.lookup.unlink(key)? {
                    return Err(Error::invariant("multimap lookup vanished during delete"));
                }
            }
            BucketSlot::Head(link) => {
                let link = link.to_le_bytes();
                self.lookup
                    .restore(key, |value| value.copy_from_slice(&link))?;
            }
        }
        Ok(head)
    }

    /// Lazy iterator over `key`'s rows, newest first.
    pub fn rows(&self, key: &[u8; K]) -> Result<RowIter<'_>> {
        Ok(self.rows_from(self.lookup(key)?))
    }

    /// Lazy iterator starting at an already looked-up head.
    pub fn rows_from(&self, start: BucketSlot) -> RowIter<'_> {
        RowIter {
            rows: &self.rows,
            next: start,
            remaining: self.rows.count(),
        }
    }

    /// View of the payload of `row`.
    pub fn get(&self, row: u64) -> Result<Accessor<'_>> {
        self.rows.get(row)?.increment(COUNT_SIZE)
    }

    pub fn statinfo(&self) -> StatInfo {
        StatInfo {
            bucket_count: self.lookup.bucket_count(),
            lookup_count: self.lookup.entries().count(),
            row_count: self.rows.count(),
        }
    }
}

/// Forward-only walk over a row chain.
///
/// Cloning restarts from the clone point. The walk ends at the end of the
/// chain, at a row index past the table's count, or after as many steps as
/// the table has rows, so a chain damaged by a concurrent truncation cannot
/// loop.
#[derive(Debug, Clone)]
pub struct RowIter<'a> {
    rows: &'a RecordAllocator,
    next: BucketSlot,
    remaining: u64,
}

impl Iterator for RowIter<'_> {
    type Item = Result<u64>;

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.next.head()?;
        if index >= self.rows.count() || self.remaining == 0 {
            self.next = BucketSlot::Empty;
            return None;
        }
        self.remaining -= 1;

        let link = self
            .rows
            .get(index)
            .and_then(|memory| memory.read_u64(0));
        match link {
            Ok(raw) => {
                self.next = BucketSlot::from_raw(raw);
                Some(Ok(index))
            }
            Err(e) => {
                self.next = BucketSlot::Empty;
                Some(Err(e))
            }
        }
    }
}
