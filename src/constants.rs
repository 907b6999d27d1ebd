use bitflags::bitflags;

// Mapped file lifecycle flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u32 {
        const STOPPED = 0x01;
        const CLOSED = 0x02;
    }
}

/// Growth applied by `reserve`: requested size * NUMERATOR / DENOMINATOR
pub const EXPANSION_NUMERATOR: u64 = 150;
pub const EXPANSION_DENOMINATOR: u64 = 100;

/// Width of a persisted counter, record index or slab offset
pub const COUNT_SIZE: u64 = 8;
/// Width of one hash table bucket
pub const BUCKET_SIZE: u64 = 8;

/// Serialized empty bucket or end of chain
pub const EMPTY_LINK: u64 = u64::MAX;

/// Smallest file a record allocator can start from (count only)
pub const MINIMUM_RECORDS_SIZE: u64 = COUNT_SIZE;
/// Smallest file a slab allocator can start from (payload size only)
pub const MINIMUM_SLABS_SIZE: u64 = COUNT_SIZE;

/// Length of a transaction or block hash
pub const HASH_SIZE: usize = 32;
/// Length of an address hash
pub const SHORT_HASH_SIZE: usize = 20;
/// Serialized point: hash plus output index
pub const POINT_SIZE: usize = HASH_SIZE + 4;

/// History row: kind, point, height, value or checksum
pub const HISTORY_ROW_SIZE: usize = 1 + POINT_SIZE + 4 + 8;
/// Offset of the height field inside a history row
pub const HISTORY_HEIGHT_OFFSET: usize = 1 + POINT_SIZE;

/// Largest serialized business attachment carried by a business row
pub const MAX_BUSINESS_DATA: usize = 192;
/// Business row: history row, kind, timestamp, data length, data
pub const BUSINESS_ROW_SIZE: usize = HISTORY_ROW_SIZE + 2 + 4 + 2 + MAX_BUSINESS_DATA;

/// Stealth row: prefix, height, ephemeral key hash, address hash, tx hash
pub const STEALTH_ROW_SIZE: usize = 4 + 4 + HASH_SIZE + SHORT_HASH_SIZE + HASH_SIZE;

/// Default bucket counts per table
pub const DEFAULT_BLOCK_BUCKETS: u64 = 600_000;
pub const DEFAULT_TRANSACTION_BUCKETS: u64 = 1_000_000;
pub const DEFAULT_SPEND_BUCKETS: u64 = 1_000_000;
pub const DEFAULT_HISTORY_BUCKETS: u64 = 1_000_000;
pub const DEFAULT_ADDRESS_ASSET_BUCKETS: u64 = 1_000_000;
pub const DEFAULT_ASSET_BUCKETS: u64 = 9_997;
pub const DEFAULT_DID_BUCKETS: u64 = 9_997;
pub const DEFAULT_CERT_BUCKETS: u64 = 9_997;

/// Optimistic read attempts before giving up
pub const DEFAULT_READ_RETRIES: usize = 1_000;
