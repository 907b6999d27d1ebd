// src/lib.rs
pub mod chain;
pub mod constants;
pub mod data_base;
pub mod databases;
pub mod error;
pub mod hash_table;
pub mod header;
pub mod memory;
pub mod multimap;
pub mod record;
pub mod serial;
pub mod settings;
pub mod slab;
pub mod types;

pub use chain::{
    AssetCert, AssetDetail, AssetTransfer, Attachment, Block, DidDetail, DidTransfer, HashDigest,
    Header, Input, Output, Point, ShortHash, StealthMetadata, Transaction,
};
pub use data_base::{DataBase, ReadHandle, Store};
pub use databases::{
    AssetRecord, BlockResult, BusinessRow, CertRecord, DidRecord, HistoryRow, PointKind,
    PrefixFilter, StealthRow, TransactionResult,
};
pub use error::{Error, Result};
pub use settings::Settings;
pub use types::{DataBaseStat, StatInfo};
