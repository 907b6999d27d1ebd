use std::path::Path;
use std::sync::Arc;

use crate::chain::{digest, DidDetail, HashDigest};
use crate::constants::HASH_SIZE;
use crate::databases::{open, start_files, Component};
use crate::error::{Error, Result};
use crate::hash_table::SlabHashIndex;
use crate::memory::{Accessor, MappedFile, RemapLock};
use crate::serial::{Reader, Writer};

/// Identity binding with the transaction that registered or moved it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DidRecord {
    pub detail: DidDetail,
    pub height: u32,
    pub transaction_hash: HashDigest,
}

impl DidRecord {
    fn read(memory: &Accessor<'_>) -> Result<Self> {
        let mut reader = Reader::new(memory.bytes(0, memory.remaining())?);
        Ok(DidRecord {
            height: reader.read_u32()?,
            transaction_hash: reader.read_array()?,
            detail: DidDetail::from_reader(&mut reader)?,
        })
    }
}

/// Identities keyed by the hash of their symbol.
///
/// Registrations and transfers both prepend an entry, so the newest entry
/// holds the current address and older ones the address history.
#[derive(Debug)]
pub struct DidDatabase {
    file: Arc<MappedFile>,
    lookup: SlabHashIndex<HASH_SIZE>,
}

impl DidDatabase {
    pub fn new(path: &Path, bucket_count: u64, remap_lock: &RemapLock) -> Result<Self> {
        let file = open(path, remap_lock);
        Ok(DidDatabase {
            lookup: SlabHashIndex::new(file.clone(), bucket_count)?,
            file,
        })
    }

    pub fn key(symbol: &str) -> HashDigest {
        digest(symbol.as_bytes())
    }

    pub fn store(&self, detail: &DidDetail, transaction_hash: &HashDigest, height: u32) -> Result<()> {
        let mut writer = Writer::new();
        writer.write_u32(height);
        writer.write_bytes(transaction_hash);
        writer.write_bytes(&detail.to_bytes());
        let value = writer.into_inner();

        self.lookup
            .store(&Self::key(&detail.symbol), value.len(), |data| {
                data.copy_from_slice(&value)
            })?;
        Ok(())
    }

    /// Current binding of `symbol`.
    pub fn get(&self, symbol: &str) -> Result<Option<DidRecord>> {
        match self.lookup.find(&Self::key(symbol))? {
            Some(memory) => DidRecord::read(&memory).map(Some),
            None => Ok(None),
        }
    }

    /// Every binding of `symbol`, newest first.
    pub fn history(&self, symbol: &str) -> Result<Vec<DidRecord>> {
        self.lookup
            .finds(&Self::key(symbol))?
            .iter()
            .map(DidRecord::read)
            .collect()
    }

    /// Drop the newest binding of `symbol`.
    pub fn remove(&self, symbol: &str) -> Result<()> {
        if !self.lookup.unlink(&Self::key(symbol))? {
            return Err(Error::invariant(format!(
                "did {} missing from did table",
                symbol
            )));
        }
        Ok(())
    }
}

impl Component for DidDatabase {
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
