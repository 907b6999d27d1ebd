/// Size statistics of a multimap table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatInfo {
    /// Buckets in the lookup table
    pub bucket_count: u64,
    /// Entries ever stored in the lookup table (one per key chain created)
    pub lookup_count: u64,
    /// Rows allocated in the rows table
    pub row_count: u64,
}

/// Size statistics of a whole store
#[derive(Debug, Clone, Default)]
pub struct DataBaseStat {
    pub top_height: Option<u64>,
    pub block_buckets: u64,
    pub transaction_payload: u64,
    pub spend_count: u64,
    pub history: Option<StatInfo>,
    pub address_asset: Option<StatInfo>,
    pub stealth_rows: u64,
}
