use std::path::Path;
use std::sync::Arc;

use crate::chain::{digest, AssetCert, HashDigest};
use crate::constants::HASH_SIZE;
use crate::databases::{open, start_files, Component};
use crate::error::{Error, Result};
use crate::hash_table::SlabHashIndex;
use crate::memory::{MappedFile, RemapLock};
use crate::serial::{Reader, Writer};

/// Certificate with the transaction that granted it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertRecord {
    pub cert: AssetCert,
    pub height: u32,
    pub transaction_hash: HashDigest,
}

/// Asset certificates keyed by the hash of symbol and certificate type.
#[derive(Debug)]
pub struct CertDatabase {
    file: Arc<MappedFile>,
    lookup: SlabHashIndex<HASH_SIZE>,
}

impl CertDatabase {
    pub fn new(path: &Path, bucket_count: u64, remap_lock: &RemapLock) -> Result<Self> {
        let file = open(path, remap_lock);
        Ok(CertDatabase {
            lookup: SlabHashIndex::new(file.clone(), bucket_count)?,
            file,
        })
    }

    pub fn key(symbol: &str, certs: u64) -> HashDigest {
        let mut writer = Writer::new();
        writer.write_bytes(symbol.as_bytes());
        writer.write_u64(certs);
        digest(&writer.into_inner())
    }

    pub fn store(&self, cert: &AssetCert, transaction_hash: &HashDigest, height: u32) -> Result<()> {
        let mut writer = Writer::new();
        writer.write_u32(height);
        writer.write_bytes(transaction_hash);
        writer.write_bytes(&cert.to_bytes());
        let value = writer.into_inner();

        self.lookup
            .store(&Self::key(&cert.symbol, cert.certs), value.len(), |data| {
                data.copy_from_slice(&value)
            })?;
        Ok(())
    }

    /// Current holder of the `certs` certificate over `symbol`.
    pub fn get(&self, symbol: &str, certs: u64) -> Result<Option<CertRecord>> {
        let memory = match self.lookup.find(&Self::key(symbol, certs))? {
            Some(memory) => memory,
            None => return Ok(None),
        };

        let mut reader = Reader::new(memory.bytes(0, memory.remaining())?);
        Ok(Some(CertRecord {
            height: reader.read_u32()?,
            transaction_hash: reader.read_array()?,
            cert: AssetCert::from_reader(&mut reader)?,
        }))
    }

    pub fn remove(&self, symbol: &str, certs: u64) -> Result<()> {
        if !self.lookup.unlink(&Self::key(symbol, certs))? {
            return Err(Error::invariant(format!(
                "certificate {}/{} missing from cert table",
                symbol, certs
            )));
        }
        Ok(())
    }
}

impl Component for CertDatabase {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::remap_lock;
    use tempfile::TempDir;

    #[test]
    fn test_cert_types_are_separate() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cert_table");
        MappedFile::touch(&path).unwrap();
        let db = CertDatabase::new(&path, 13, &remap_lock()).unwrap();
        db.create().unwrap();

        let issue = AssetCert {
            symbol: "MVS.A".to_string(),
            owner: "alice".to_string(),
            certs: 1,
        };
        let domain = AssetCert {
            certs: 2,
            ..issue.clone()
        };
        db.store(&issue, &[1u8; 32], 3).unwrap();
        db.store(&domain, &[2u8; 32], 4).unwrap();

        assert_eq!(db.get("MVS.A", 1).unwrap().unwrap().cert, issue);
        assert_eq!(db.get("MVS.A", 2).unwrap().unwrap().height, 4);
        assert!(db.get("MVS.A", 4).unwrap().is_none());

        db.remove("MVS.A", 2).unwrap();
        assert!(db.get("MVS.A", 2).unwrap().is_none());
        assert!(db.get("MVS.A", 1).unwrap().is_some());
        assert!(matches!(db.remove("MVS.A", 2), Err(Error::Invariant(_))));
    }
}
