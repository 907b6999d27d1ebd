use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::chain::{Block, HashDigest, Header, HEADER_SIZE};
use crate::constants::{COUNT_SIZE, HASH_SIZE};
use crate::databases::{open, start_files, Component};
use crate::error::{Error, Result};
use crate::hash_table::SlabHashIndex;
use crate::memory::{Accessor, MappedFile, RemapLock};
use crate::record::RecordAllocator;
use crate::serial::{Reader, Writer};

/// Height index value of a missing block; slab offsets start at 8.
const EMPTY_POSITION: u64 = 0;

/// Block header, height and transaction hashes read back from the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockResult {
    pub header: Header,
    pub height: u32,
    pub transaction_hashes: Vec<HashDigest>,
}

impl BlockResult {
    fn read(memory: &Accessor<'_>) -> Result<Self> {
        let fixed = memory.bytes(0, HEADER_SIZE + 8)?;
        let mut reader = Reader::new(fixed);
        let header = Header::from_reader(&mut reader)?;
        let height = reader.read_u32()?;
        let count = reader.read_u32()? as usize;

        let hashes = memory.bytes(HEADER_SIZE + 8, count * HASH_SIZE)?;
        let mut reader = Reader::new(hashes);
        let mut transaction_hashes = Vec::with_capacity(count);
        for _ in 0..count {
            transaction_hashes.push(reader.read_array()?);
        }

        Ok(BlockResult {
            header,
            height,
            transaction_hashes,
        })
    }
}

/// Blocks by hash (slab table) and by height (record index of slab offsets).
///
/// Value layout: `[header][height: u32][tx_count: u32][tx_hash: 32]*`.
#[derive(Debug)]
pub struct BlockDatabase {
    lookup_file: Arc<MappedFile>,
    index_file: Arc<MappedFile>,
    lookup: SlabHashIndex<HASH_SIZE>,
    index: RecordAllocator,
    write: Mutex<()>,
}

impl BlockDatabase {
    pub fn new(
        lookup_path: &Path,
        index_path: &Path,
        bucket_count: u64,
        remap_lock: &RemapLock,
    ) -> Result<Self> {
        let lookup_file = open(lookup_path, remap_lock);
        let index_file = open(index_path, remap_lock);
        Ok(BlockDatabase {
            lookup: SlabHashIndex::new(lookup_file.clone(), bucket_count)?,
            index: RecordAllocator::new(index_file.clone(), 0, COUNT_SIZE),
            lookup_file,
            index_file,
            write: Mutex::new(()),
        })
    }

    /// Serialized value size, checked against the row field widths.
    pub fn value_size(block: &Block) -> Result<usize> {
        let count = block.transactions.len();
        if u32::try_from(count).is_err() {
            return Err(Error::BadValueSize {
                what: "block transaction count",
                size: count,
                max: u32::MAX as usize,
            });
        }
        count
            .checked_mul(HASH_SIZE)
            .and_then(|hashes| hashes.checked_add(HEADER_SIZE + 8))
            .ok_or(Error::Overflow)
    }

    /// Store `block` at `height`, filling any skipped heights with gaps.
    pub fn store(&self, block: &Block, height: u32) -> Result<()> {
        let size = Self::value_size(block)?;
        let mut writer = Writer::with_capacity(size);
        writer.write_bytes(&block.header.to_bytes());
        writer.write_u32(height);
        writer.write_u32(block.transactions.len() as u32);
        for tx in &block.transactions {
            writer.write_bytes(&tx.hash());
        }
        let value = writer.into_inner();

        let position = self
            .lookup
            .store(&block.hash(), value.len(), |data| data.copy_from_slice(&value))?;
        self.write_position(position, u64::from(height))
    }

    pub fn get_by_height(&self, height: u64) -> Result<Option<BlockResult>> {
        if height >= self.index.count() {
            return Ok(None);
        }

        let position = self.read_position(height)?;
        if position == EMPTY_POSITION {
            return Ok(None);
        }
        let value = self.lookup.value(position)?;
        BlockResult::read(&value).map(Some)
    }

    pub fn get_by_hash(&self, hash: &HashDigest) -> Result<Option<BlockResult>> {
        match self.lookup.find(hash)? {
            Some(memory) => BlockResult::read(&memory).map(Some),
            None => Ok(None),
        }
    }

    /// Drop the hash entry of a popped block.
    pub fn remove(&self, hash: &HashDigest) -> Result<()> {
        if !self.lookup.unlink(hash)? {
            return Err(Error::invariant("block hash missing from block table"));
        }
        Ok(())
    }

    /// Forget every height at or above `from_height`.
    pub fn unlink(&self, from_height: u64) -> Result<()> {
        let _write = self.write.lock();
        if self.index.count() > from_height {
            self.index.set_count(from_height)?;
        }
        Ok(())
    }

    /// Highest stored height, ignoring gaps.
    pub fn top(&self) -> Option<u64> {
        self.index.count().checked_sub(1)
    }

    /// First and last missing heights below the top.
    pub fn gap_range(&self) -> Result<Option<(u64, u64)>> {
        let count = self.index.count();
        let mut first = None;
        for height in 0..count {
            if self.read_position(height)? == EMPTY_POSITION {
                first = Some(height);
                break;
            }
        }

        let first = match first {
            Some(first) => first,
            None => return Ok(None),
        };
        for last in (first + 1..count).rev() {
            if self.read_position(last)? == EMPTY_POSITION {
                return Ok(Some((first, last)));
            }
        }
        Ok(Some((first, first)))
    }

    /// First missing height at or after `start`; the count when there is
    /// no gap. `None` on an empty index or a start past the end.
    pub fn next_gap(&self, start: u64) -> Result<Option<u64>> {
        let count = self.index.count();
        if count == 0 || start > count {
            return Ok(None);
        }

        for height in start..count {
            if self.read_position(height)? == EMPTY_POSITION {
                return Ok(Some(height));
            }
        }
        Ok(Some(count))
    }

    fn write_position(&self, position: u64, height: u64) -> Result<()> {
        let _write = self.write.lock();
        let initial = self.index.count();
        let required = height.checked_add(1).ok_or(Error::Overflow)?;

        if required > initial {
            self.index.new_records(required - initial)?;
            for gap in initial..height {
                self.index.get(gap)?.write_u64(0, EMPTY_POSITION)?;
            }
        }
        self.index.get(height)?.write_u64(0, position)
    }

    fn read_position(&self, height: u64) -> Result<u64> {
        self.index.get(height)?.read_u64(0)
    }
}

impl Component for BlockDatabase {
    fn files(&self) -> Vec<&Arc<MappedFile>> {
        vec![&self.lookup_file, &self.index_file]
    }

    fn create(&self) -> Result<()> {
        start_files(self)?;
        self.lookup.create()?;
        self.index.create()
    }

    fn start(&self) -> Result<()> {
        start_files(self)?;
        self.lookup.start()?;
        self.index.start()
    }

    fn sync(&self) -> Result<()> {
        self.lookup.sync()?;
        self.index.sync()
    }
}
