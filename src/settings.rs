use std::path::{Path, PathBuf};

use crate::constants::{
    DEFAULT_ADDRESS_ASSET_BUCKETS, DEFAULT_ASSET_BUCKETS, DEFAULT_BLOCK_BUCKETS,
    DEFAULT_CERT_BUCKETS, DEFAULT_DID_BUCKETS, DEFAULT_HISTORY_BUCKETS, DEFAULT_READ_RETRIES,
    DEFAULT_SPEND_BUCKETS, DEFAULT_TRANSACTION_BUCKETS,
};
use crate::error::{Error, Result};

/// Store configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Directory holding every table file
    pub directory: PathBuf,
    /// Address history is not indexed below this height
    pub history_start_height: u32,
    /// Stealth rows are not indexed below this height
    pub stealth_start_height: u32,
    pub block_buckets: u64,
    pub transaction_buckets: u64,
    pub spend_buckets: u64,
    pub history_buckets: u64,
    pub address_asset_buckets: u64,
    pub asset_buckets: u64,
    pub did_buckets: u64,
    pub cert_buckets: u64,
    /// Attempts made by `DataBase::read` before reporting a conflict
    pub read_retries: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            directory: PathBuf::from("mainnet"),
            history_start_height: 0,
            stealth_start_height: 0,
            block_buckets: DEFAULT_BLOCK_BUCKETS,
            transaction_buckets: DEFAULT_TRANSACTION_BUCKETS,
            spend_buckets: DEFAULT_SPEND_BUCKETS,
            history_buckets: DEFAULT_HISTORY_BUCKETS,
            address_asset_buckets: DEFAULT_ADDRESS_ASSET_BUCKETS,
            asset_buckets: DEFAULT_ASSET_BUCKETS,
            did_buckets: DEFAULT_DID_BUCKETS,
            cert_buckets: DEFAULT_CERT_BUCKETS,
            read_retries: DEFAULT_READ_RETRIES,
        }
    }
}

impl Settings {
    pub fn new<P: AsRef<Path>>(directory: P) -> Self {
        Settings {
            directory: directory.as_ref().to_path_buf(),
            ..Settings::default()
        }
    }

    pub fn with_history_start_height(mut self, height: u32) -> Self {
        self.history_start_height = height;
        self
    }

    pub fn with_stealth_start_height(mut self, height: u32) -> Self {
        self.stealth_start_height = height;
        self
    }

    /// Use `buckets` for every hash table. Small values suit tests.
    pub fn with_buckets(mut self, buckets: u64) -> Self {
        self.block_buckets = buckets;
        self.transaction_buckets = buckets;
        self.spend_buckets = buckets;
        self.history_buckets = buckets;
        self.address_asset_buckets = buckets;
        self.asset_buckets = buckets;
        self.did_buckets = buckets;
        self.cert_buckets = buckets;
        self
    }

    pub fn with_block_buckets(mut self, buckets: u64) -> Self {
        self.block_buckets = buckets;
        self
    }

    pub fn with_history_buckets(mut self, buckets: u64) -> Self {
        self.history_buckets = buckets;
        self
    }

    pub fn with_read_retries(mut self, retries: usize) -> Self {
        self.read_retries = retries;
        self
    }

    pub fn validate(&self) -> Result<()> {
        let buckets = [
            ("block", self.block_buckets),
            ("transaction", self.transaction_buckets),
            ("spend", self.spend_buckets),
            ("history", self.history_buckets),
            ("address asset", self.address_asset_buckets),
            ("asset", self.asset_buckets),
            ("did", self.did_buckets),
            ("cert", self.cert_buckets),
        ];

        // Validate bucket counts
        for (table, count) in buckets {
            if count == 0 {
                return Err(Error::InvalidConfig(format!(
                    "{} table needs at least one bucket",
                    table
                )));
            }
        }

        if self.read_retries == 0 {
            return Err(Error::InvalidConfig(
                "read retries must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
