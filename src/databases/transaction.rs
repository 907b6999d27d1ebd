use std::path::Path;
use std::sync::Arc;

use crate::chain::{HashDigest, Transaction};
use crate::constants::HASH_SIZE;
use crate::databases::{open, start_files, Component};
use crate::error::{Error, Result};
use crate::hash_table::SlabHashIndex;
use crate::memory::{MappedFile, RemapLock};
use crate::serial::{Reader, Writer};

/// Stored transaction with its confirmation position
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionResult {
    pub height: u32,
    /// Position inside its block
    pub index: u32,
    pub transaction: Transaction,
}

/// Transactions by hash.
///
/// Value layout: `[height: u32][index: u32][transaction bytes]`.
#[derive(Debug)]
pub struct TransactionDatabase {
    file: Arc<MappedFile>,
    lookup: SlabHashIndex<HASH_SIZE>,
}

impl TransactionDatabase {
    pub fn new(path: &Path, bucket_count: u64, remap_lock: &RemapLock) -> Result<Self> {
        let file = open(path, remap_lock);
        Ok(TransactionDatabase {
            lookup: SlabHashIndex::new(file.clone(), bucket_count)?,
            file,
        })
    }

    pub fn store(&self, transaction: &Transaction, height: u32, index: u32) -> Result<()> {
        let mut writer = Writer::new();
        writer.write_u32(height);
        writer.write_u32(index);
        writer.write_bytes(&transaction.to_bytes());
        let value = writer.into_inner();

        self.lookup
            .store(&transaction.hash(), value.len(), |data| {
                data.copy_from_slice(&value)
            })?;
        Ok(())
    }

    pub fn get(&self, hash: &HashDigest) -> Result<Option<TransactionResult>> {
        let memory = match self.lookup.find(hash)? {
            Some(memory) => memory,
            None => return Ok(None),
        };

        // The decoder stops at the end of the transaction
        let mut reader = Reader::new(memory.bytes(0, memory.remaining())?);
        Ok(Some(TransactionResult {
            height: reader.read_u32()?,
            index: reader.read_u32()?,
            transaction: Transaction::from_reader(&mut reader)?,
        }))
    }

    pub fn remove(&self, hash: &HashDigest) -> Result<()> {
        if !self.lookup.unlink(hash)? {
            return Err(Error::invariant("transaction missing from transaction table"));
        }
        Ok(())
    }

    /// Bytes allocated to transaction entries
    pub fn payload_size(&self) -> u64 {
        self.lookup.entries().payload_size()
    }
}

impl Component for TransactionDatabase {
    fn files(&self) -> Vec<&Arc<MappedFile>> {
        vec![&self.file]
    }

    fn create(&self) -> Result<()> {
        start_files(self)?;
        self.lookup.create()
    }

    fn start(&self) -> Result<()> {
        start_files(self)?;
        self.lookup.start()
    }

    fn sync(&self) -> Result<()> {
        self.lookup.sync()
    }
}
