use std::sync::Arc;

use parking_lot::Mutex;

use crate::constants::COUNT_SIZE;
use crate::error::{Error, Result};
use crate::header::{BucketSlot, HashTableHeader};
use crate::memory::{Accessor, MappedFile};
use crate::record::RecordAllocator;
use crate::slab::SlabAllocator;

/// Width of the link field following the key of every entry
const LINK_SIZE: usize = 8;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Persisted bucket hash: FNV-1a followed by a final avalanche.
///
/// Bucket positions are stored on disk, so this must never change.
pub fn stable_hash(key: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET;
    for byte in key {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }

    hash ^= hash >> 33;
    hash = hash.wrapping_mul(0xff51_afd7_ed55_8ccd);
    hash ^= hash >> 33;
    hash = hash.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    hash ^= hash >> 33;
    hash
}

/// Entry storage addressed by a persisted link (record index or slab offset).
pub trait EntryStore {
    /// Width of the value length kept after the link; zero when every value
    /// has the same size
    const LENGTH_SIZE: usize;

    /// View positioned at the start of the entry at `link`
    fn entry(&self, link: u64) -> Result<Accessor<'_>>;

    /// Upper bound on entries, used to stop walking a corrupted chain
    fn capacity(&self) -> u64;
}

impl EntryStore for RecordAllocator {
    const LENGTH_SIZE: usize = 0;

    fn entry(&self, link: u64) -> Result<Accessor<'_>> {
        self.get(link)
    }

    fn capacity(&self) -> u64 {
        self.count()
    }
}

impl EntryStore for SlabAllocator {
    const LENGTH_SIZE: usize = COUNT_SIZE as usize;

    fn entry(&self, link: u64) -> Result<Accessor<'_>> {
        self.get(link)
    }

    fn capacity(&self) -> u64 {
        self.payload_size()
    }
}

/// Chained hash table over fixed-size keys.
///
/// Record entries are `[key: K][next: u64][value]`, slab entries
/// `[key: K][next: u64][length: u64][value]`. New entries are prepended to
/// their bucket's chain, so lookups see the most recent entry first.
/// Bucket rewrites are serialized by a per-table mutex; lookups take no lock.
#[derive(Debug)]
pub struct HashIndex<const K: usize, S> {
    header: HashTableHeader,
    entries: S,
    write: Mutex<()>,
}

/// Hash index whose entries are fixed-size records
pub type RecordHashIndex<const K: usize> = HashIndex<K, RecordAllocator>;

/// Hash index whose entries are variable-size slabs
pub type SlabHashIndex<const K: usize> = HashIndex<K, SlabAllocator>;

impl<const K: usize, S: EntryStore> HashIndex<K, S> {
    const LENGTH_OFFSET: usize = K + LINK_SIZE;
    const VALUE_OFFSET: usize = K + LINK_SIZE + S::LENGTH_SIZE;

    pub fn bucket_count(&self) -> u64 {
        self.header.bucket_count()
    }

    pub fn entries(&self) -> &S {
        &self.entries
    }

    /// Value of the most recently stored entry for `key`.
    pub fn find(&self, key: &[u8; K]) -> Result<Option<Accessor<'_>>> {
        match self.find_entry(key)? {
            Some(entry) => Ok(Some(entry.increment(Self::VALUE_OFFSET as u64)?)),
            None => Ok(None),
        }
    }

    /// Values of every entry stored for `key`, newest first.
    pub fn finds(&self, key: &[u8; K]) -> Result<Vec<Accessor<'_>>> {
        let bucket = self.bucket_index(key);
        let mut current = self.header.read(bucket)?;
        let mut steps = 0;
        let mut found = Vec::new();

        while let BucketSlot::Head(link) = current {
            self.check_steps(&mut steps)?;
            let memory = self.entries.entry(link)?;
            current = BucketSlot::from_raw(memory.read_u64(K)?);
            if memory.bytes(0, K)? == key.as_slice() {
                found.push(memory.increment(Self::VALUE_OFFSET as u64)?);
            }
        }
        Ok(found)
    }

    /// Remove the most recent entry for `key` from its chain.
    ///
    /// The entry's storage is not reclaimed. Returns `false` if no entry
    /// matched.
    pub fn unlink(&self, key: &[u8; K]) -> Result<bool> {
        let _write = self.write.lock();
        let bucket = self.bucket_index(key);
        let mut previous: Option<u64> = None;
        let mut current = self.header.read(bucket)?;
        let mut steps = 0;

        while let BucketSlot::Head(link) = current {
            self.check_steps(&mut steps)?;
            let (matched, next) = {
                let memory = self.entries.entry(link)?;
                (memory.bytes(0, K)? == key.as_slice(), memory.read_u64(K)?)
            };

            if matched {
                match previous {
                    None => self.header.write(bucket, BucketSlot::from_raw(next))?,
                    Some(before) => self.entries.entry(before)?.write_u64(K, next)?,
                }
                return Ok(true);
            }

            previous = Some(link);
            current = BucketSlot::from_raw(next);
        }
        Ok(false)
    }

    // Start of the most recent entry for `key`.
    fn find_entry(&self, key: &[u8; K]) -> Result<Option<Accessor<'_>>> {
        let bucket = self.bucket_index(key);
        let mut current = self.header.read(bucket)?;
        let mut steps = 0;

        while let BucketSlot::Head(link) = current {
            self.check_steps(&mut steps)?;
            let memory = self.entries.entry(link)?;
            if memory.bytes(0, K)? == key.as_slice() {
                return Ok(Some(memory));
            }
            current = BucketSlot::from_raw(memory.read_u64(K)?);
        }
        Ok(None)
    }

    fn bucket_index(&self, key: &[u8; K]) -> u64 {
        stable_hash(key) % self.header.bucket_count()
    }

    fn check_steps(&self, steps: &mut u64) -> Result<()> {
        *steps += 1;
        if *steps > self.entries.capacity() {
            return Err(Error::Corrupted(format!(
                "hash chain longer than {} entries",
                self.entries.capacity()
            )));
        }
        Ok(())
    }

    // Link the prepared entry at `link` as the new head of its bucket.
    fn link_entry(&self, bucket: u64, link: u64, entry: &mut [u8]) -> Result<()> {
        let head = self.header.read(bucket)?;
        entry[K..Self::LENGTH_OFFSET].copy_from_slice(&head.to_raw().to_le_bytes());
        self.entries.entry(link)?.write(0, entry)?;
        self.header.write(bucket, BucketSlot::Head(link))
    }

    fn prepare(key: &[u8; K], value_size: usize) -> Vec<u8> {
        let mut entry = vec![0u8; Self::VALUE_OFFSET + value_size];
        entry[..K].copy_from_slice(key);
        entry
    }
}

impl<const K: usize> HashIndex<K, RecordAllocator> {
    /// Table over `file` with `bucket_count` buckets and values of
    /// `value_size` bytes.
    pub fn new(file: Arc<MappedFile>, bucket_count: u64, value_size: u64) -> Result<Self> {
        let header = HashTableHeader::new(file.clone(), bucket_count);
        let record_size = (K + LINK_SIZE) as u64 + value_size;
        let entries = RecordAllocator::new(file, header.size()?, record_size);
        Ok(HashIndex {
            header,
            entries,
            write: Mutex::new(()),
        })
    }

    pub fn create(&self) -> Result<()> {
        self.header.create()?;
        self.entries.create()
    }

    pub fn start(&self) -> Result<()> {
        self.header.start()?;
        self.entries.start()
    }

    pub fn sync(&self) -> Result<()> {
        self.entries.sync()
    }

    pub fn value_size(&self) -> usize {
        self.entries.record_size() as usize - Self::VALUE_OFFSET
    }

    /// Store a new entry for `key`; `write` fills the zeroed value.
    /// Returns the record index of the entry.
    pub fn store<F>(&self, key: &[u8; K], write: F) -> Result<u64>
    where
        F: FnOnce(&mut [u8]),
    {
        let mut entry = Self::prepare(key, self.value_size());
        write(&mut entry[Self::VALUE_OFFSET..]);

        let _write = self.write.lock();
        let bucket = self.bucket_index(key);
        let index = self.entries.new_records(1)?;
        self.link_entry(bucket, index, &mut entry)?;
        Ok(index)
    }

    /// Rewrite the value of the most recent entry for `key` in place.
    pub fn restore<F>(&self, key: &[u8; K], write: F) -> Result<()>
    where
        F: FnOnce(&mut [u8]),
    {
        let _write = self.write.lock();
        let memory = self.find(key)?.ok_or(Error::KeyNotFound)?;
        let mut value = memory.bytes(0, self.value_size())?.to_vec();
        write(&mut value);
        memory.write(0, &value)
    }
}

impl<const K: usize> HashIndex<K, SlabAllocator> {
    pub fn new(file: Arc<MappedFile>, bucket_count: u64) -> Result<Self> {
        let header = HashTableHeader::new(file.clone(), bucket_count);
        let entries = SlabAllocator::new(file, header.size()?);
        Ok(HashIndex {
            header,
            entries,
            write: Mutex::new(()),
        })
    }

    pub fn create(&self) -> Result<()> {
        self.header.create()?;
        self.entries.create()
    }

    pub fn start(&self) -> Result<()> {
        self.header.start()?;
        self.entries.start()
    }

    pub fn sync(&self) -> Result<()> {
        self.entries.sync()
    }

    /// Store a new entry with a `size` byte value; `write` fills it.
    /// Returns the slab offset of the entry.
    pub fn store<F>(&self, key: &[u8; K], size: usize, write: F) -> Result<u64>
    where
        F: FnOnce(&mut [u8]),
    {
        let mut entry = Self::prepare(key, size);
        entry[Self::LENGTH_OFFSET..Self::VALUE_OFFSET]
            .copy_from_slice(&(size as u64).to_le_bytes());
        write(&mut entry[Self::VALUE_OFFSET..]);

        let _write = self.write.lock();
        let bucket = self.bucket_index(key);
        let offset = self.entries.new_slab(entry.len() as u64)?;
        self.link_entry(bucket, offset, &mut entry)?;
        Ok(offset)
    }

    /// Value of the entry stored at slab `offset`, as returned by `store`.
    pub fn value(&self, offset: u64) -> Result<Accessor<'_>> {
        self.entries.get(offset)?.increment(Self::VALUE_OFFSET as u64)
    }

    /// Stored value length of the most recent entry for `key`.
    pub fn value_size(&self, key: &[u8; K]) -> Result<Option<u64>> {
        match self.find_entry(key)? {
            Some(entry) => Ok(Some(entry.read_u64(Self::LENGTH_OFFSET)?)),
            None => Ok(None),
        }
    }

    /// Store `payload` unless the most recent entry for `key` holds exactly
    /// the same bytes. Returns whether a new entry was written.
    pub fn store_unique(&self, key: &[u8; K], payload: &[u8]) -> Result<bool> {
        if let Some(entry) = self.find_entry(key)? {
            let stored = entry.read_u64(Self::LENGTH_OFFSET)?;
            if stored == payload.len() as u64
                && entry.bytes(Self::VALUE_OFFSET, payload.len())? == payload
            {
                return Ok(false);
            }
        }

        self.store(key, payload.len(), |value| value.copy_from_slice(payload))?;
        Ok(true)
    }

    /// Rewrite the first `size` value bytes of the most recent entry for
    /// `key` in place. `size` may not exceed the stored value length.
    pub fn restore<F>(&self, key: &[u8; K], size: usize, write: F) -> Result<()>
    where
        F: FnOnce(&mut [u8]),
    {
        let _write = self.write.lock();
        let entry = self.find_entry(key)?.ok_or(Error::KeyNotFound)?;
        let stored = entry.read_u64(Self::LENGTH_OFFSET)?;
        if size as u64 > stored {
            return Err(Error::BadValueSize {
                what: "restored slab value",
                size,
                max: stored as usize,
            });
        }

        let memory = entry.increment(Self::VALUE_OFFSET as u64)?;
        let mut value = memory.bytes(0, size)?.to_vec();
        write(&mut value);
        memory.write(0, &value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::remap_lock;
    use tempfile::TempDir;

    fn table_file(dir: &TempDir, name: &str) -> Arc<MappedFile> {
        let path = dir.path().join(name);
        MappedFile::touch(&path).unwrap();
        let file = Arc::new(MappedFile::new(&path, remap_lock()));
        file.start().unwrap();
        file
    }

    fn record_table(dir: &TempDir, buckets: u64) -> RecordHashIndex<4> {
        let table = RecordHashIndex::<4>::new(table_file(dir, "records"), buckets, 8).unwrap();
        table.create().unwrap();
        table
    }

    fn value_of(memory: &Accessor<'_>) -> u64 {
        memory.read_u64(0).unwrap()
    }

    #[test]
    fn test_stable_hash_is_fixed() {
        // Persisted bucket positions depend on these exact values
        assert_eq!(stable_hash(b"abcd"), stable_hash(b"abcd"));
        assert_ne!(stable_hash(b"abcd"), stable_hash(b"abce"));
        assert_ne!(stable_hash(&[0u8; 32]), stable_hash(&[0u8; 20]));
    }

    #[test]
    fn test_find_on_empty_table() {
        let dir = TempDir::new().unwrap();
        let table = record_table(&dir, 100);

        assert!(table.find(b"none").unwrap().is_none());
        assert!(table.finds(b"none").unwrap().is_empty());
        assert_eq!(table.entries().count(), 0);
    }

    #[test]
    fn test_store_then_find() {
        let dir = TempDir::new().unwrap();
        let table = record_table(&dir, 100);

        table
            .store(b"aaaa", |value| value.copy_from_slice(&11u64.to_le_bytes()))
            .unwrap();
        table
            .store(b"bbbb", |value| value.copy_from_slice(&22u64.to_le_bytes()))
            .unwrap();

        assert_eq!(value_of(&table.find(b"aaaa").unwrap().unwrap()), 11);
        assert_eq!(value_of(&table.find(b"bbbb").unwrap().unwrap()), 22);
    }

    #[test]
    fn test_single_bucket_scenario() {
        let dir = TempDir::new().unwrap();
        let table = record_table(&dir, 1);

        table
            .store(b"AAAA", |value| value.copy_from_slice(&1u64.to_le_bytes()))
            .unwrap();
        table
            .store(b"AAAA", |value| value.copy_from_slice(&2u64.to_le_bytes()))
            .unwrap();
        assert!(table.find(b"BBBB").unwrap().is_none());

        // Newest first
        let values: Vec<u64> = table.finds(b"AAAA").unwrap().iter().map(value_of).collect();
        assert_eq!(values, vec![2, 1]);

        assert!(table.unlink(b"AAAA").unwrap());
        assert_eq!(value_of(&table.find(b"AAAA").unwrap().unwrap()), 1);
        assert!(table.unlink(b"AAAA").unwrap());
        assert!(table.find(b"AAAA").unwrap().is_none());
        assert!(!table.unlink(b"AAAA").unwrap());
    }

    #[test]
    fn test_unlink_middle_of_chain() {
        let dir = TempDir::new().unwrap();
        let table = record_table(&dir, 1);

        for (key, value) in [(b"k001", 1u64), (b"k002", 2), (b"k003", 3)] {
            table
                .store(key, |slot| slot.copy_from_slice(&value.to_le_bytes()))
                .unwrap();
        }

        assert!(table.unlink(b"k002").unwrap());
        assert!(table.find(b"k002").unwrap().is_none());
        assert_eq!(value_of(&table.find(b"k001").unwrap().unwrap()), 1);
        assert_eq!(value_of(&table.find(b"k003").unwrap().unwrap()), 3);
    }

    #[test]
    fn test_restore_in_place() {
        let dir = TempDir::new().unwrap();
        let table = record_table(&dir, 10);

        table
            .store(b"aaaa", |value| value.copy_from_slice(&5u64.to_le_bytes()))
            .unwrap();
        table
            .restore(b"aaaa", |value| value.copy_from_slice(&6u64.to_le_bytes()))
            .unwrap();
        assert_eq!(value_of(&table.find(b"aaaa").unwrap().unwrap()), 6);
        assert_eq!(table.entries().count(), 1);

        assert!(matches!(
            table.restore(b"zzzz", |_| {}),
            Err(Error::KeyNotFound)
        ));
    }

    #[test]
    fn test_records_survive_restart() {
        let dir = TempDir::new().unwrap();
        let file = table_file(&dir, "restart");
        {
            let table = RecordHashIndex::<4>::new(file.clone(), 7, 8).unwrap();
            table.create().unwrap();
            table
                .store(b"keep", |value| value.copy_from_slice(&9u64.to_le_bytes()))
                .unwrap();
            table.sync().unwrap();
        }
        file.close().unwrap();
        file.start().unwrap();

        let table = RecordHashIndex::<4>::new(file, 7, 8).unwrap();
        table.start().unwrap();
        assert_eq!(value_of(&table.find(b"keep").unwrap().unwrap()), 9);
    }

    #[test]
    fn test_slab_store_and_unlink() {
        let dir = TempDir::new().unwrap();
        let table = SlabHashIndex::<4>::new(table_file(&dir, "slabs"), 1).unwrap();
        table.create().unwrap();

        let first = table
            .store(b"long", 100, |value| value.fill(7))
            .unwrap();
        let second = table.store(b"tiny", 1, |value| value[0] = 9).unwrap();
        assert!(second > first);

        assert_eq!(table.find(b"long").unwrap().unwrap().bytes(0, 100).unwrap(), &[7u8; 100][..]);
        assert_eq!(table.find(b"tiny").unwrap().unwrap().bytes(0, 1).unwrap(), &[9u8]);

        assert!(table.unlink(b"long").unwrap());
        assert!(table.find(b"long").unwrap().is_none());
        assert!(table.find(b"tiny").unwrap().is_some());
    }

    #[test]
    fn test_slab_store_unique() {
        let dir = TempDir::new().unwrap();
        let table = SlabHashIndex::<4>::new(table_file(&dir, "unique"), 13).unwrap();
        table.create().unwrap();

        assert!(table.store_unique(b"coin", b"detail-1").unwrap());
        assert!(!table.store_unique(b"coin", b"detail-1").unwrap());
        let frontier = table.entries().payload_size();

        assert!(table.store_unique(b"coin", b"detail-2").unwrap());
        assert!(table.entries().payload_size() > frontier);
        assert_eq!(table.finds(b"coin").unwrap().len(), 2);
    }

    #[test]
    fn test_slab_restore_bounds() {
        let dir = TempDir::new().unwrap();
        let table = SlabHashIndex::<4>::new(table_file(&dir, "restore"), 13).unwrap();
        table.create().unwrap();
        table.store(b"coin", 4, |value| value.fill(1)).unwrap();

        table.restore(b"coin", 4, |value| value.fill(2)).unwrap();
        assert_eq!(table.find(b"coin").unwrap().unwrap().bytes(0, 4).unwrap(), &[2u8; 4]);
        assert!(matches!(
            table.restore(b"coin", 5, |_| {}),
            Err(Error::BadValueSize { .. })
        ));
        assert!(matches!(
            table.restore(b"none", 1, |_| {}),
            Err(Error::KeyNotFound)
        ));
    }

    #[test]
    fn test_slab_restore_keeps_next_entry() {
        let dir = TempDir::new().unwrap();
        let table = SlabHashIndex::<4>::new(table_file(&dir, "neighbours"), 1).unwrap();
        table.create().unwrap();
        table.store(b"aaaa", 4, |value| value.fill(0xaa)).unwrap();
        let second = table.store(b"bbbb", 4, |value| value.fill(0xbb)).unwrap();

        // Longer than the stored value: would run into the following entry
        assert!(matches!(
            table.restore(b"aaaa", 20, |value| value.fill(0xee)),
            Err(Error::BadValueSize { size: 20, max: 4, .. })
        ));
        assert_eq!(table.value_size(b"aaaa").unwrap(), Some(4));
        assert_eq!(table.find(b"aaaa").unwrap().unwrap().bytes(0, 4).unwrap(), &[0xaau8; 4]);
        assert_eq!(table.find(b"bbbb").unwrap().unwrap().bytes(0, 4).unwrap(), &[0xbbu8; 4]);
        assert_eq!(table.value(second).unwrap().bytes(0, 4).unwrap(), &[0xbbu8; 4]);

        table.restore(b"aaaa", 2, |value| value.fill(0xcc)).unwrap();
        assert_eq!(
            table.find(b"aaaa").unwrap().unwrap().bytes(0, 4).unwrap(),
            &[0xcc, 0xcc, 0xaa, 0xaa]
        );
        assert!(table.find(b"bbbb").unwrap().is_some());
    }
}
