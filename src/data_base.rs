use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{fence, AtomicU64, Ordering};

use log::{info, warn};
use parking_lot::{Mutex, MutexGuard};

use crate::chain::{Attachment, Block, DidDetail, HashDigest, Point, ShortHash, Transaction};
use crate::databases::{
    AddressAssetDatabase, AssetDatabase, AssetRecord, BlockDatabase, BlockResult, BusinessRow,
    CertDatabase, CertRecord, Component, DidDatabase, DidRecord, HistoryDatabase, HistoryRow,
    PointKind, PrefixFilter, SpendDatabase, StealthDatabase, StealthRow, TransactionDatabase,
    TransactionResult,
};
use crate::error::{Error, Result};
use crate::memory::{remap_lock, MappedFile};
use crate::settings::Settings;
use crate::types::DataBaseStat;

/// Paths of every file in a store directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Store {
    pub directory: PathBuf,
    pub block_table: PathBuf,
    pub block_index: PathBuf,
    pub transaction_table: PathBuf,
    pub spend_table: PathBuf,
    pub history_table: PathBuf,
    pub history_rows: PathBuf,
    pub stealth_rows: PathBuf,
    pub address_asset_table: PathBuf,
    pub address_asset_rows: PathBuf,
    pub asset_table: PathBuf,
    pub did_table: PathBuf,
    pub cert_table: PathBuf,
    pub process_lock: PathBuf,
}

impl Store {
    pub fn new<P: AsRef<Path>>(directory: P) -> Self {
        let directory = directory.as_ref().to_path_buf();
        Store {
            block_table: directory.join("block_table"),
            block_index: directory.join("block_index"),
            transaction_table: directory.join("transaction_table"),
            spend_table: directory.join("spend_table"),
            history_table: directory.join("history_table"),
            history_rows: directory.join("history_rows"),
            stealth_rows: directory.join("stealth_rows"),
            address_asset_table: directory.join("address_asset_table"),
            address_asset_rows: directory.join("address_asset_rows"),
            asset_table: directory.join("asset_table"),
            did_table: directory.join("did_table"),
            cert_table: directory.join("cert_table"),
            process_lock: directory.join("process_lock"),
            directory,
        }
    }

    /// Table files, excluding the process lock
    pub fn tables(&self) -> [&Path; 12] {
        [
            &self.block_table,
            &self.block_index,
            &self.transaction_table,
            &self.spend_table,
            &self.history_table,
            &self.history_rows,
            &self.stealth_rows,
            &self.address_asset_table,
            &self.address_asset_rows,
            &self.asset_table,
            &self.did_table,
            &self.cert_table,
        ]
    }

    /// Create the directory and a minimal file for every table.
    pub fn touch_all(&self) -> Result<()> {
        fs::create_dir_all(&self.directory)?;
        for table in self.tables() {
            MappedFile::touch(table)?;
        }
        Ok(())
    }
}

/// Sequential lock value sampled before an optimistic read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadHandle(u64);

impl ReadHandle {
    pub fn value(&self) -> u64 {
        self.0
    }
}

/// Exclusive write section; publishes the write when dropped.
struct WriteSection<'a> {
    database: &'a DataBase,
    _guard: MutexGuard<'a, ()>,
}

impl Drop for WriteSection<'_> {
    fn drop(&mut self) {
        self.database.end_write();
    }
}

/// Block storage engine.
///
/// Owns every component database, the process lock on the store directory
/// and the sequential lock that lets readers detect concurrent writes.
/// One writer runs at a time; readers never block writers.
#[derive(Debug)]
pub struct DataBase {
    settings: Settings,
    store: Store,
    blocks: BlockDatabase,
    transactions: TransactionDatabase,
    spends: SpendDatabase,
    history: HistoryDatabase,
    stealth: StealthDatabase,
    address_assets: AddressAssetDatabase,
    assets: AssetDatabase,
    dids: DidDatabase,
    certs: CertDatabase,
    /// Even when stable, odd while a write is in progress
    sequential_lock: AtomicU64,
    write_mutex: Mutex<()>,
    process_lock: Mutex<Option<File>>,
}

impl DataBase {
    /// Build the component databases over `settings.directory` without
    /// touching the files.
    pub fn new(settings: Settings) -> Result<Self> {
        settings.validate()?;
        let store = Store::new(&settings.directory);
        let remap = remap_lock();

        Ok(DataBase {
            blocks: BlockDatabase::new(
                &store.block_table,
                &store.block_index,
                settings.block_buckets,
                &remap,
            )?,
            transactions: TransactionDatabase::new(
                &store.transaction_table,
                settings.transaction_buckets,
                &remap,
            )?,
            spends: SpendDatabase::new(&store.spend_table, settings.spend_buckets, &remap)?,
            history: HistoryDatabase::new(
                &store.history_table,
                &store.history_rows,
                settings.history_buckets,
                &remap,
            )?,
            stealth: StealthDatabase::new(&store.stealth_rows, &remap),
            address_assets: AddressAssetDatabase::new(
                &store.address_asset_table,
                &store.address_asset_rows,
                settings.address_asset_buckets,
                &remap,
            )?,
            assets: AssetDatabase::new(&store.asset_table, settings.asset_buckets, &remap)?,
            dids: DidDatabase::new(&store.did_table, settings.did_buckets, &remap)?,
            certs: CertDatabase::new(&store.cert_table, settings.cert_buckets, &remap)?,
            settings,
            store,
            sequential_lock: AtomicU64::new(0),
            write_mutex: Mutex::new(()),
            process_lock: Mutex::new(None),
        })
    }

    /// Create a new store holding only `genesis`, then stop and close it.
    pub fn initialize(settings: Settings, genesis: &Block) -> Result<()> {
        let store = Store::new(&settings.directory);
        store.touch_all()?;

        let database = DataBase::new(settings)?;
        database.create()?;
        database.push_at(genesis, 0)?;
        database.stop()?;
        database.close()?;

        info!("Initialized store at {}", store.directory.display());
        Ok(())
    }

    /// Open and start an existing store.
    pub fn open(settings: Settings) -> Result<Self> {
        let database = DataBase::new(settings)?;
        database.start()?;
        Ok(database)
    }

    /// Map freshly touched files, write empty tables and take the process
    /// lock. The lock is released again if any table fails.
    pub fn create(&self) -> Result<()> {
        self.lock_process()?;
        let created = self
            .components()
            .iter()
            .try_for_each(|component| component.create());
        self.release_on_error(created)?;
        info!("Created store at {}", self.store.directory.display());
        Ok(())
    }

    /// Take the process lock and start every component. The lock is
    /// released again if any table fails to start.
    pub fn start(&self) -> Result<()> {
        self.lock_process()?;

        let started = {
            let _write = self.begin_write();
            self.components()
                .iter()
                .try_for_each(|component| component.start())
        };
        self.release_on_error(started)?;
        info!(
            "Started store at {} (top {:?})",
            self.store.directory.display(),
            self.blocks.top()
        );
        Ok(())
    }

    /// Stop every component and release the process lock.
    pub fn stop(&self) -> Result<()> {
        {
            let _write = self.begin_write();
            for component in self.components() {
                component.stop()?;
            }
        }
        self.unlock_process()?;
        info!("Stopped store at {}", self.store.directory.display());
        Ok(())
    }

    /// Flush and unmap every file, truncating each to its used size.
    pub fn close(&self) -> Result<()> {
        for component in self.components() {
            component.close()?;
        }
        Ok(())
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn blocks(&self) -> &BlockDatabase {
        &self.blocks
    }

    pub fn transactions(&self) -> &TransactionDatabase {
        &self.transactions
    }

    pub fn spends(&self) -> &SpendDatabase {
        &self.spends
    }

    pub fn history_database(&self) -> &HistoryDatabase {
        &self.history
    }

    pub fn stealth_database(&self) -> &StealthDatabase {
        &self.stealth
    }

    pub fn address_assets(&self) -> &AddressAssetDatabase {
        &self.address_assets
    }

    pub fn assets(&self) -> &AssetDatabase {
        &self.assets
    }

    pub fn dids(&self) -> &DidDatabase {
        &self.dids
    }

    pub fn certs(&self) -> &CertDatabase {
        &self.certs
    }

    // Sequential lock
    // ------------------------------------------------------------------------

    /// Sample the sequential lock before an optimistic read.
    pub fn begin_read(&self) -> ReadHandle {
        ReadHandle(self.sequential_lock.load(Ordering::Acquire))
    }

    /// True if no write started or finished since `handle` was taken.
    pub fn is_read_valid(&self, handle: ReadHandle) -> bool {
        fence(Ordering::Acquire);
        handle.0 % 2 == 0 && self.sequential_lock.load(Ordering::Acquire) == handle.0
    }

    /// True if `handle` was taken while a write was in progress.
    pub fn is_write_locked(&self, handle: ReadHandle) -> bool {
        handle.0 % 2 == 1
    }

    /// Run `query` until it completes without observing a concurrent write.
    pub fn read<T, F>(&self, mut query: F) -> Result<T>
    where
        F: FnMut(&DataBase) -> Result<T>,
    {
        for _ in 0..self.settings.read_retries {
            let handle = self.begin_read();
            if self.is_write_locked(handle) {
                std::thread::yield_now();
                continue;
            }

            let result = query(self);
            if self.is_read_valid(handle) {
                return result;
            }
        }

        warn!(
            "Read gave up after {} attempts against concurrent writes",
            self.settings.read_retries
        );
        Err(Error::ReadConflict(self.settings.read_retries))
    }

    fn begin_write(&self) -> WriteSection<'_> {
        let guard = self.write_mutex.lock();
        self.sequential_lock.fetch_add(1, Ordering::AcqRel);
        fence(Ordering::Release);
        WriteSection {
            database: self,
            _guard: guard,
        }
    }

    fn end_write(&self) {
        self.sequential_lock.fetch_add(1, Ordering::AcqRel);
    }

    // Writers
    // ------------------------------------------------------------------------

    /// Push `block` on top of the chain and return its height.
    pub fn push(&self, block: &Block) -> Result<u64> {
        let height = self.blocks.top().map_or(0, |top| top + 1);
        self.push_at(block, height)?;
        Ok(height)
    }

    /// Store every effect of `block` at `height`.
    pub fn push_at(&self, block: &Block, height: u64) -> Result<()> {
        let height = Self::validate(block, height)?;
        let timestamp = block.header.timestamp;

        let _write = self.begin_write();
        for (index, tx) in block.transactions.iter().enumerate() {
            let hash = tx.hash();
            self.push_inputs(tx, &hash, height, timestamp)?;
            self.push_outputs(tx, &hash, height, timestamp)?;
            self.push_stealth(tx, &hash, height)?;
            self.transactions.store(tx, height, index as u32)?;
        }
        self.blocks.store(block, height)?;
        self.synchronize()?;

        info!(
            "Pushed block #{} ({} transactions)",
            height,
            block.transactions.len()
        );
        Ok(())
    }

    /// Remove the top block and every effect it had, in reverse order.
    pub fn pop(&self) -> Result<Block> {
        let _write = self.begin_write();
        let top = match self.blocks.top() {
            Some(top) if top > 0 => top,
            _ => return Err(Error::ChainEmpty),
        };
        let block = self.read_block(top)?;
        let height = top as u32;

        for tx in block.transactions.iter().rev() {
            let hash = tx.hash();
            self.transactions.remove(&hash)?;
            self.pop_outputs(tx, &hash, height)?;
            self.pop_inputs(tx, &hash, height)?;
        }

        self.stealth.unlink(height)?;
        self.blocks.remove(&block.hash())?;
        self.blocks.unlink(top)?;
        self.synchronize()?;

        info!(
            "Popped block #{} ({} transactions)",
            top,
            block.transactions.len()
        );
        Ok(block)
    }

    /// Persist every allocator count.
    pub fn synchronize(&self) -> Result<()> {
        for component in self.components() {
            component.sync()?;
        }
        Ok(())
    }

    fn validate(block: &Block, height: u64) -> Result<u32> {
        let height = u32::try_from(height).map_err(|_| Error::BadValueSize {
            what: "block height",
            size: height as usize,
            max: u32::MAX as usize,
        })?;
        BlockDatabase::value_size(block)?;

        for tx in &block.transactions {
            if u32::try_from(tx.inputs.len()).is_err() || u32::try_from(tx.outputs.len()).is_err() {
                return Err(Error::BadValueSize {
                    what: "transaction points",
                    size: tx.inputs.len().max(tx.outputs.len()),
                    max: u32::MAX as usize,
                });
            }

            let attachments = tx
                .inputs
                .iter()
                .filter_map(|input| input.attachment.as_ref())
                .chain(tx.outputs.iter().filter_map(|output| output.attachment.as_ref()));
            for attachment in attachments {
                BusinessRow::validate(attachment)?;
            }
        }
        Ok(height)
    }

    fn push_inputs(&self, tx: &Transaction, hash: &HashDigest, height: u32, timestamp: u32) -> Result<()> {
        if tx.is_coinbase() {
            return Ok(());
        }

        for (index, input) in tx.inputs.iter().enumerate() {
            let inpoint = Point::new(*hash, index as u32);
            let previous = &input.previous_output;
            self.spends.store(previous, &inpoint)?;

            if height < self.settings.history_start_height {
                continue;
            }
            if let Some(address) = &input.address {
                self.history.add_input(address, &inpoint, height, previous)?;
                if let Some(attachment) = &input.attachment {
                    self.address_assets
                        .add_input(address, &inpoint, height, previous, attachment, timestamp)?;
                }
            }
        }
        Ok(())
    }

    fn push_outputs(&self, tx: &Transaction, hash: &HashDigest, height: u32, timestamp: u32) -> Result<()> {
        for (index, output) in tx.outputs.iter().enumerate() {
            let outpoint = Point::new(*hash, index as u32);

            if height >= self.settings.history_start_height {
                if let Some(address) = &output.address {
                    self.history
                        .add_output(address, &outpoint, height, output.value)?;
                    if let Some(attachment) = &output.attachment {
                        self.address_assets.add_output(
                            address,
                            &outpoint,
                            height,
                            output.value,
                            attachment,
                            timestamp,
                        )?;
                    }
                }
            }

            match &output.attachment {
                Some(Attachment::AssetIssue(detail)) => self.assets.store(detail, hash, height)?,
                Some(Attachment::DidRegister(detail)) => self.dids.store(detail, hash, height)?,
                Some(Attachment::DidTransfer(transfer)) => {
                    let mut detail = match self.dids.get(&transfer.symbol)? {
                        Some(current) => current.detail,
                        None => {
                            warn!("Transfer of unregistered did {}", transfer.symbol);
                            DidDetail {
                                symbol: transfer.symbol.clone(),
                                issuer: String::new(),
                                address: String::new(),
                                description: String::new(),
                            }
                        }
                    };
                    detail.address = transfer.address.clone();
                    self.dids.store(&detail, hash, height)?;
                }
                Some(Attachment::AssetCert(cert)) => self.certs.store(cert, hash, height)?,
                _ => {}
            }
        }
        Ok(())
    }

    // Output i carries the ephemeral key, output i + 1 the payment address.
    fn push_stealth(&self, tx: &Transaction, hash: &HashDigest, height: u32) -> Result<()> {
        if height < self.settings.stealth_start_height {
            return Ok(());
        }

        for pair in tx.outputs.windows(2) {
            if let (Some(metadata), Some(address)) = (&pair[0].stealth, &pair[1].address) {
                self.stealth.store(&StealthRow {
                    prefix: metadata.prefix,
                    height,
                    ephemeral_key_hash: metadata.ephemeral_key_hash,
                    address: *address,
                    transaction_hash: *hash,
                })?;
            }
        }
        Ok(())
    }

    fn pop_outputs(&self, tx: &Transaction, hash: &HashDigest, height: u32) -> Result<()> {
        for (index, output) in tx.outputs.iter().enumerate().rev() {
            let outpoint = Point::new(*hash, index as u32);

            match &output.attachment {
                Some(Attachment::AssetIssue(detail)) => self.assets.remove(&detail.symbol)?,
                Some(Attachment::DidRegister(detail)) => self.dids.remove(&detail.symbol)?,
                Some(Attachment::DidTransfer(transfer)) => self.dids.remove(&transfer.symbol)?,
                Some(Attachment::AssetCert(cert)) => self.certs.remove(&cert.symbol, cert.certs)?,
                _ => {}
            }

            if height < self.settings.history_start_height {
                continue;
            }
            if let Some(address) = &output.address {
                if output.attachment.is_some() {
                    self.address_assets
                        .delete_last_row(address, PointKind::Output, &outpoint)?;
                }
                self.history
                    .delete_last_row(address, PointKind::Output, &outpoint)?;
            }
        }
        Ok(())
    }

    fn pop_inputs(&self, tx: &Transaction, hash: &HashDigest, height: u32) -> Result<()> {
        if tx.is_coinbase() {
            return Ok(());
        }

        for (index, input) in tx.inputs.iter().enumerate().rev() {
            let inpoint = Point::new(*hash, index as u32);

            if height >= self.settings.history_start_height {
                if let Some(address) = &input.address {
                    if input.attachment.is_some() {
                        self.address_assets
                            .delete_last_row(address, PointKind::Spend, &inpoint)?;
                    }
                    self.history
                        .delete_last_row(address, PointKind::Spend, &inpoint)?;
                }
            }

            self.spends.remove(&input.previous_output)?;
        }
        Ok(())
    }

    fn read_block(&self, height: u64) -> Result<Block> {
        let result = self
            .blocks
            .get_by_height(height)?
            .ok_or_else(|| Error::invariant(format!("block #{} is missing", height)))?;

        let mut transactions = Vec::with_capacity(result.transaction_hashes.len());
        for hash in &result.transaction_hashes {
            let tx = self.transactions.get(hash)?.ok_or_else(|| {
                Error::invariant(format!("transaction of block #{} is missing", height))
            })?;
            transactions.push(tx.transaction);
        }

        Ok(Block {
            header: result.header,
            transactions,
        })
    }

    // Queries
    // ------------------------------------------------------------------------

    /// Height of the top block, `None` on an empty store.
    pub fn last_height(&self) -> Result<Option<u64>> {
        self.read(|db| Ok(db.blocks.top()))
    }

    pub fn block_by_height(&self, height: u64) -> Result<Option<BlockResult>> {
        self.read(|db| db.blocks.get_by_height(height))
    }

    pub fn block_by_hash(&self, hash: &HashDigest) -> Result<Option<BlockResult>> {
        self.read(|db| db.blocks.get_by_hash(hash))
    }

    /// Fully decoded block at `height`.
    pub fn block(&self, height: u64) -> Result<Option<Block>> {
        self.read(|db| match db.blocks.get_by_height(height)? {
            Some(_) => db.read_block(height).map(Some),
            None => Ok(None),
        })
    }

    pub fn transaction(&self, hash: &HashDigest) -> Result<Option<TransactionResult>> {
        self.read(|db| db.transactions.get(hash))
    }

    /// Input point that spent `outpoint`, if any.
    pub fn spend(&self, outpoint: &Point) -> Result<Option<Point>> {
        self.read(|db| db.spends.get(outpoint))
    }

    pub fn history(&self, key: &ShortHash, limit: usize, from_height: u32) -> Result<Vec<HistoryRow>> {
        self.read(|db| db.history.get(key, limit, from_height))
    }

    pub fn stealth(&self, filter: &PrefixFilter, from_height: u32) -> Result<Vec<StealthRow>> {
        self.read(|db| db.stealth.scan(filter, from_height))
    }

    pub fn business_history(
        &self,
        key: &ShortHash,
        limit: usize,
        from_height: u32,
    ) -> Result<Vec<BusinessRow>> {
        self.read(|db| db.address_assets.get(key, limit, from_height))
    }

    pub fn asset(&self, symbol: &str) -> Result<Option<AssetRecord>> {
        self.read(|db| db.assets.get(symbol))
    }

    /// Current binding of the identity `symbol`.
    pub fn did(&self, symbol: &str) -> Result<Option<DidRecord>> {
        self.read(|db| db.dids.get(symbol))
    }

    /// Every binding of `symbol`, newest first.
    pub fn did_history(&self, symbol: &str) -> Result<Vec<DidRecord>> {
        self.read(|db| db.dids.history(symbol))
    }

    pub fn cert(&self, symbol: &str, certs: u64) -> Result<Option<CertRecord>> {
        self.read(|db| db.certs.get(symbol, certs))
    }

    /// First missing height at or after `start`.
    pub fn next_gap(&self, start: u64) -> Result<Option<u64>> {
        self.read(|db| db.blocks.next_gap(start))
    }

    /// First and last missing heights below the top.
    pub fn gap_range(&self) -> Result<Option<(u64, u64)>> {
        self.read(|db| db.blocks.gap_range())
    }

    pub fn statinfo(&self) -> Result<DataBaseStat> {
        self.read(|db| {
            Ok(DataBaseStat {
                top_height: db.blocks.top(),
                block_buckets: db.settings.block_buckets,
                transaction_payload: db.transactions.payload_size(),
                spend_count: db.spends.count(),
                history: Some(db.history.statinfo()),
                address_asset: Some(db.address_assets.statinfo()),
                stealth_rows: db.stealth.count(),
            })
        })
    }

    // Process lock
    // ------------------------------------------------------------------------

    fn lock_process(&self) -> Result<()> {
        let mut held = self.process_lock.lock();
        if held.is_some() {
            return Ok(());
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.store.process_lock)?;

        // SAFETY: the descriptor is owned by `file` and stays open while locked.
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            let error = io::Error::last_os_error();
            if error.kind() == io::ErrorKind::WouldBlock {
                warn!(
                    "Store {} is in use by another process",
                    self.store.directory.display()
                );
                return Err(Error::AlreadyLocked(self.store.process_lock.clone()));
            }
            return Err(Error::Io(error));
        }

        *held = Some(file);
        Ok(())
    }

    fn unlock_process(&self) -> Result<()> {
        let file = match self.process_lock.lock().take() {
            Some(file) => file,
            None => return Ok(()),
        };

        // SAFETY: as in `lock_process`.
        unsafe {
            libc::flock(file.as_raw_fd(), libc::LOCK_UN);
        }
        drop(file);

        match fs::remove_file(&self.store.process_lock) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }

    fn release_on_error(&self, result: Result<()>) -> Result<()> {
        if let Err(e) = result {
            warn!(
                "Releasing lock on {} after failure: {}",
                self.store.directory.display(),
                e
            );
            self.unlock_process()?;
            return Err(e);
        }
        Ok(())
    }

    fn components(&self) -> [&dyn Component; 9] {
        [
            &self.blocks,
            &self.transactions,
            &self.spends,
            &self.history,
            &self.stealth,
            &self.address_assets,
            &self.assets,
            &self.dids,
            &self.certs,
        ]
    }
}

impl Drop for DataBase {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Failed to close store {}: {}", self.store.directory.display(), e);
        }
    }
}
