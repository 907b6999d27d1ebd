use std::path::Path;
use std::sync::Arc;

use crate::chain::{HashDigest, ShortHash};
use crate::constants::STEALTH_ROW_SIZE;
use crate::databases::{open, start_files, Component};
use crate::error::{Error, Result};
use crate::memory::{MappedFile, RemapLock};
use crate::record::RecordAllocator;
use crate::serial::{Reader, Writer};

/// Leading-bits match against a stealth prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrefixFilter {
    pub value: u32,
    /// Number of leading bits compared, at most 32
    pub bits: u8,
}

impl PrefixFilter {
    pub fn new(value: u32, bits: u8) -> Result<Self> {
        if bits > 32 {
            return Err(Error::InvalidConfig(format!(
                "stealth filter of {} bits exceeds 32",
                bits
            )));
        }
        Ok(PrefixFilter { value, bits })
    }

    /// Filter matching every prefix
    pub fn any() -> Self {
        PrefixFilter { value: 0, bits: 0 }
    }

    pub fn matches(&self, prefix: u32) -> bool {
        if self.bits == 0 {
            return true;
        }
        let mask = u32::MAX << (32 - u32::from(self.bits.min(32)));
        (prefix ^ self.value) & mask == 0
    }
}

/// One stealth payment.
///
/// Layout: `[prefix: u32][height: u32][ephemeral_key_hash: 32]
/// [address_hash: 20][transaction_hash: 32]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StealthRow {
    pub prefix: u32,
    pub height: u32,
    pub ephemeral_key_hash: HashDigest,
    pub address: ShortHash,
    pub transaction_hash: HashDigest,
}

impl StealthRow {
    fn to_bytes(&self) -> Vec<u8> {
        let mut writer = Writer::with_capacity(STEALTH_ROW_SIZE);
        writer.write_u32(self.prefix);
        writer.write_u32(self.height);
        writer.write_bytes(&self.ephemeral_key_hash);
        writer.write_bytes(&self.address);
        writer.write_bytes(&self.transaction_hash);
        writer.into_inner()
    }

    fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(data);
        Ok(StealthRow {
            prefix: reader.read_u32()?,
            height: reader.read_u32()?,
            ephemeral_key_hash: reader.read_array()?,
            address: reader.read_array()?,
            transaction_hash: reader.read_array()?,
        })
    }
}

/// Append-only, height-ordered stealth rows scanned linearly.
#[derive(Debug)]
pub struct StealthDatabase {
    file: Arc<MappedFile>,
    rows: RecordAllocator,
}

impl StealthDatabase {
    pub fn new(path: &Path, remap_lock: &RemapLock) -> Self {
        let file = open(path, remap_lock);
        StealthDatabase {
            rows: RecordAllocator::new(file.clone(), 0, STEALTH_ROW_SIZE as u64),
            file,
        }
    }

    pub fn store(&self, row: &StealthRow) -> Result<()> {
        let index = self.rows.new_records(1)?;
        self.rows.get(index)?.write(0, &row.to_bytes())
    }

    /// Rows matching `filter` at or above `from_height`, oldest first.
    pub fn scan(&self, filter: &PrefixFilter, from_height: u32) -> Result<Vec<StealthRow>> {
        let mut result = Vec::new();
        for index in 0..self.rows.count() {
            let memory = self.rows.get(index)?;
            let prefix = memory.read_u32(0)?;
            let height = memory.read_u32(4)?;
            if height < from_height || !filter.matches(prefix) {
                continue;
            }
            result.push(StealthRow::from_bytes(memory.bytes(0, STEALTH_ROW_SIZE)?)?);
        }
        Ok(result)
    }

    /// Drop every trailing row at or above `from_height`.
    pub fn unlink(&self, from_height: u32) -> Result<()> {
        let mut count = self.rows.count();
        while count > 0 {
            let height = self.rows.get(count - 1)?.read_u32(4)?;
            if height < from_height {
                break;
            }
            count -= 1;
        }
        self.rows.set_count(count)
    }

    pub fn count(&self) -> u64 {
        self.rows.count()
    }
}

impl Component for StealthDatabase {
    fn files(&self) -> Vec<&Arc<MappedFile>> {
        vec![&self.file]
    }

    fn create(&self) -> Result<()> {
        start_files(self)?;
        self.rows.create()
    }

    fn start(&self) -> Result<()> {
        start_files(self)?;
        self.rows.start()
    }

    fn sync(&self) -> Result<()> {
        self.rows.sync()
    }
}
