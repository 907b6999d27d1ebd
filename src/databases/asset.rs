use std::path::Path;
use std::sync::Arc;

use crate::chain::{digest, AssetDetail, HashDigest};
use crate::constants::HASH_SIZE;
use crate::databases::{open, start_files, Component};
use crate::error::{Error, Result};
use crate::hash_table::SlabHashIndex;
use crate::memory::{MappedFile, RemapLock};
use crate::serial::{Reader, Writer};

/// Issued asset with the transaction that created it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetRecord {
    pub detail: AssetDetail,
    pub height: u32,
    pub transaction_hash: HashDigest,
}

/// Asset details keyed by the hash of the symbol.
///
/// Value layout: `[height: u32][tx_hash: 32][detail bytes]`.
#[derive(Debug)]
pub struct AssetDatabase {
    file: Arc<MappedFile>,
    lookup: SlabHashIndex<HASH_SIZE>,
}

impl AssetDatabase {
    pub fn new(path: &Path, bucket_count: u64, remap_lock: &RemapLock) -> Result<Self> {
        let file = open(path, remap_lock);
        Ok(AssetDatabase {
            lookup: SlabHashIndex::new(file.clone(), bucket_count)?,
            file,
        })
    }

    pub fn key(symbol: &str) -> HashDigest {
        digest(symbol.as_bytes())
    }

    /// Store an issue. Every call adds an entry, so each issuing output is
    /// undone by exactly one `remove`.
    pub fn store(&self, detail: &AssetDetail, transaction_hash: &HashDigest, height: u32) -> Result<()> {
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

    /// Most recent issue of `symbol`.
    pub fn get(&self, symbol: &str) -> Result<Option<AssetRecord>> {
        let memory = match self.lookup.find(&Self::key(symbol))? {
            Some(memory) => memory,
            None => return Ok(None),
        };

        let mut reader = Reader::new(memory.bytes(0, memory.remaining())?);
        Ok(Some(AssetRecord {
            height: reader.read_u32()?,
            transaction_hash: reader.read_array()?,
            detail: AssetDetail::from_reader(&mut reader)?,
        }))
    }

    pub fn remove(&self, symbol: &str) -> Result<()> {
        if !self.lookup.unlink(&Self::key(symbol))? {
            return Err(Error::invariant(format!(
                "asset {} missing from asset table",
                symbol
            )));
        }
        Ok(())
    }
}

impl Component for AssetDatabase {
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
