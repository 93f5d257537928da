//! The shard (§4.H): a concurrent key→list map plus its key arena, backing
//! store and on-close rewrite of the `.keys` and `.stats` sidecar files.

use std::collections::HashMap;
use std::fs;
use std::hash::BuildHasherDefault;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use xxhash_rust::xxh3::Xxh3;

use crate::arena::{Arena, DEFAULT_CHUNK_SIZE as DEFAULT_KEY_CHUNK_SIZE};
use crate::block::{BlockArena, DEFAULT_CHUNK_SIZE as DEFAULT_BLOCK_CHUNK_SIZE};
use crate::error::{Error, Result};
use crate::list::{List, ListHead, ValueIter, ValueIterMut};
use crate::mutex_pool::{ExclusiveGuard, SharedGuard};
use crate::sort;
use crate::stats::Stats;
use crate::store::{AccessPattern, Store, DEFAULT_BUFFER_SIZE};

/// `max_key_size = 2^30 - 1` (§6 Limits): a key's length must fit the plain
/// (no-flag) varint used for the `.keys` file's length prefix... in
/// practice the length prefix is a plain `u32`, but the cap keeps keys
/// within the store's own addressable-length conventions.
pub const MAX_KEY_SIZE: usize = (1 << 30) - 1;

/// Comparator used by the optional sorted rewrite.
pub type LessThan = Arc<dyn Fn(&[u8], &[u8]) -> bool + Send + Sync>;

/// Per-shard tunables (§6 Options).
#[derive(Clone, Serialize, Deserialize)]
pub struct ShardOptions {
    pub block_size: u32,
    pub buffer_size: u32,
    pub create_if_missing: bool,
    pub error_if_exists: bool,
    pub readonly: bool,
    #[serde(skip)]
    pub less_than: Option<LessThan>,
}

impl std::fmt::Debug for ShardOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardOptions")
            .field("block_size", &self.block_size)
            .field("buffer_size", &self.buffer_size)
            .field("create_if_missing", &self.create_if_missing)
            .field("error_if_exists", &self.error_if_exists)
            .field("readonly", &self.readonly)
            .field("less_than", &self.less_than.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

impl Default for ShardOptions {
    fn default() -> Self {
        Self {
            block_size: 512,
            buffer_size: DEFAULT_BUFFER_SIZE,
            create_if_missing: false,
            error_if_exists: false,
            readonly: false,
            less_than: None,
        }
    }
}

/// Hasher for the key -> list map: the keys are short byte strings looked
/// up on every `put`/`get`, so we hash them with xxh3 rather than std's
/// SipHash.
type KeyHasher = BuildHasherDefault<Xxh3>;

/// A concurrent `key -> list` map plus the store it draws blocks from. See
/// `DESIGN.md` for the `'static` key-bytes justification: the arena that
/// backs them is this struct's last field, so it outlives `map` on drop.
pub struct Shard {
    map: RwLock<HashMap<&'static [u8], Arc<List>, KeyHasher>>,
    store: Arc<Store>,
    block_arena: Arc<BlockArena>,
    prefix: Option<PathBuf>,
    readonly: bool,
    less_than: Option<LessThan>,
    carry_over_num_values_unowned: AtomicU64,
    closed: AtomicBool,
    arena: Arc<Arena>,
}

fn path_with_suffix(prefix: &Path, suffix: &str) -> PathBuf {
    let mut s = prefix.as_os_str().to_owned();
    s.push(suffix);
    PathBuf::from(s)
}

impl Shard {
    /// Opens (or creates) the shard rooted at `prefix` (`{prefix}.stats`,
    /// `{prefix}.keys`, `{prefix}.values`).
    #[instrument(skip(opts), fields(shard = %prefix.as_ref().display(), component = "shard"))]
    pub fn open(prefix: impl AsRef<Path>, opts: ShardOptions) -> Result<Self> {
        let prefix = prefix.as_ref().to_path_buf();
        let stats_path = path_with_suffix(&prefix, ".stats");
        let keys_path = path_with_suffix(&prefix, ".keys");
        let values_path = path_with_suffix(&prefix, ".values");

        let stats_exists = stats_path.exists();
        if stats_exists && opts.error_if_exists {
            return Err(Error::domain(format!(
                "stats file {} already exists and error_if_exists is set",
                stats_path.display()
            )));
        }
        if !stats_exists && !opts.create_if_missing {
            return Err(Error::domain(format!(
                "shard {} does not exist and create_if_missing is false",
                prefix.display()
            )));
        }

        let arena = Arena::new(DEFAULT_KEY_CHUNK_SIZE);
        let mut map: HashMap<&'static [u8], Arc<List>, KeyHasher> = HashMap::default();
        let mut carry_over = 0u64;
        let block_size;

        if stats_exists {
            let raw = fs::read(&stats_path).map_err(|e| Error::io(stats_path.clone(), e))?;
            let stats = Stats::parse_and_verify(&raw, &stats_path)?;
            block_size = stats.block_size;
            carry_over = stats.num_values_unowned;

            if keys_path.exists() {
                let file = fs::File::open(&keys_path).map_err(|e| Error::io(keys_path.clone(), e))?;
                let mut reader = BufReader::new(file);
                for _ in 0..stats.num_keys {
                    let key_len = reader
                        .read_u32::<LittleEndian>()
                        .map_err(|e| Error::io(keys_path.clone(), e))? as usize;
                    let mut key_bytes = vec![0u8; key_len];
                    reader
                        .read_exact(&mut key_bytes)
                        .map_err(|e| Error::io(keys_path.clone(), e))?;
                    let head = ListHead::read_from(&mut reader).map_err(|e| Error::io(keys_path.clone(), e))?;
                    let interned = arena.intern(&key_bytes);
                    map.insert(interned, List::from_head(head));
                }
            }
        } else {
            block_size = opts.block_size;
        }

        let store = Store::open(&values_path, block_size, opts.buffer_size, opts.create_if_missing)?;
        let block_arena = BlockArena::new(block_size, DEFAULT_BLOCK_CHUNK_SIZE);

        info!(keys = map.len(), block_size, "shard opened");

        Ok(Self {
            map: RwLock::new(map),
            store: Arc::new(store),
            block_arena,
            prefix: Some(prefix),
            readonly: opts.readonly,
            less_than: opts.less_than,
            carry_over_num_values_unowned: AtomicU64::new(carry_over),
            closed: AtomicBool::new(false),
            arena,
        })
    }

    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            Err(Error::domain("shard is open in read-only mode"))
        } else {
            Ok(())
        }
    }

    /// Looks up `key`, returning a shared (read) handle, or `None` if the
    /// key has never been written.
    pub fn get_shared(&self, key: &[u8]) -> Option<SharedListHandle<'_>> {
        let list = {
            let map = self.map.read();
            map.get(key).cloned()
        }?;
        let guard = list.mutex().lock_shared();
        Some(SharedListHandle {
            _guard: guard,
            list,
            store: &self.store,
        })
    }

    /// Looks up `key`, returning an exclusive (read/write) handle, or
    /// `None` if absent. Fails in read-only mode.
    pub fn get_unique(&self, key: &[u8]) -> Result<Option<UniqueListHandle<'_>>> {
        self.check_writable()?;
        let Some(list) = ({
            let map = self.map.read();
            map.get(key).cloned()
        }) else {
            return Ok(None);
        };
        let guard = list.mutex().lock_exclusive();
        Ok(Some(UniqueListHandle {
            _guard: guard,
            list,
            store: &self.store,
            block_arena: &self.block_arena,
        }))
    }

    /// Looks up `key`, creating an empty list for it if absent.
    pub fn get_unique_or_create(&self, key: &[u8]) -> Result<UniqueListHandle<'_>> {
        self.check_writable()?;
        if key.is_empty() {
            return Err(Error::domain("keys must be non-empty"));
        }
        if key.len() > MAX_KEY_SIZE {
            return Err(Error::domain(format!(
                "key of {} bytes exceeds max_key_size {}",
                key.len(),
                MAX_KEY_SIZE
            )));
        }
        let list = {
            let mut map = self.map.write();
            if let Some(list) = map.get(key) {
                Arc::clone(list)
            } else {
                let interned = self.arena.intern(key);
                let list = List::new();
                map.insert(interned, Arc::clone(&list));
                list
            }
        };
        let guard = list.mutex().lock_exclusive();
        Ok(UniqueListHandle {
            _guard: guard,
            list,
            store: &self.store,
            block_arena: &self.block_arena,
        })
    }

    /// Appends a value under `key`, creating the list if needed. A thin
    /// convenience over `get_unique_or_create` for simple call sites.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.get_unique_or_create(key)?.append(value)
    }

    /// Collects all live values for `key`, in insertion order, or `None` if
    /// the key is absent.
    pub fn get_all(&self, key: &[u8]) -> Result<Option<Vec<Vec<u8>>>> {
        let Some(handle) = self.get_shared(key) else {
            return Ok(None);
        };
        let mut it = handle.iter();
        let mut out = Vec::new();
        while let Some(v) = it.next()? {
            out.push(v);
        }
        Ok(Some(out))
    }

    /// Number of live values under `key`, or `None` if absent.
    pub fn available(&self, key: &[u8]) -> Option<u64> {
        self.get_shared(key).map(|h| h.len())
    }

    /// Removes the first live value equal to `value`. Returns `false` both
    /// when the key is absent and when no live value matches.
    pub fn remove_first_equal(&self, key: &[u8], value: &[u8]) -> Result<bool> {
        let Some(handle) = self.get_unique(key)? else {
            return Ok(false);
        };
        let mut it = handle.iter_mut();
        while let Some(v) = it.next()? {
            if v == value {
                it.remove_current();
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Removes every live value for which `pred(index, value)` returns
    /// true, `index` counting only live values in insertion order. Returns
    /// the number removed.
    pub fn remove_all(&self, key: &[u8], mut pred: impl FnMut(u64, &[u8]) -> bool) -> Result<u64> {
        let Some(handle) = self.get_unique(key)? else {
            return Ok(0);
        };
        let mut it = handle.iter_mut();
        let mut index = 0u64;
        let mut removed = 0u64;
        while let Some(v) = it.next()? {
            if pred(index, &v) {
                it.remove_current();
                removed += 1;
            }
            index += 1;
        }
        Ok(removed)
    }

    /// Rewrites `key`'s list, keeping only live values, sorted by the
    /// shard's `less_than` comparator if one was configured, else left in
    /// insertion order with deletions compacted away.
    pub fn rewrite(&self, key: &[u8]) -> Result<()> {
        let Some(handle) = self.get_unique(key)? else {
            return Ok(());
        };
        let mut values = Vec::new();
        {
            let mut it = handle.iter();
            while let Some(v) = it.next()? {
                values.push(v);
            }
        }
        if let Some(less) = &self.less_than {
            sort::sort_by(&mut values, |a, b| less(a, b));
        }
        let fresh = List::new();
        for v in &values {
            fresh.append(v, &self.store, &self.block_arena)?;
        }
        fresh.flush(&self.store)?;
        handle.list.adopt(&fresh);
        Ok(())
    }

    /// Best-effort scan: visits every key whose list is not concurrently
    /// held exclusively by another writer. Skipping busy lists is
    /// intentional (§4.H).
    pub fn for_each_key(&self, mut proc: impl FnMut(&[u8])) {
        let map = self.map.read();
        for (key, list) in map.iter() {
            if let Some(guard) = list.mutex().try_lock_shared() {
                proc(key);
                drop(guard);
            }
        }
    }

    /// As `for_each_key`, but hands the callback a shared list handle too.
    /// Advises the store for a sequential scan around the whole walk.
    pub fn for_each_entry(&self, mut proc: impl FnMut(&[u8], &SharedListHandle<'_>)) {
        self.store.advise_access_pattern(AccessPattern::WillNeed);
        {
            let map = self.map.read();
            for (key, list) in map.iter() {
                if let Some(guard) = list.mutex().try_lock_shared() {
                    let handle = SharedListHandle {
                        _guard: guard,
                        list: Arc::clone(list),
                        store: &self.store,
                    };
                    proc(key, &handle);
                }
            }
        }
        self.store.advise_access_pattern(AccessPattern::Normal);
    }

    /// Scans the live map and aggregates per-key statistics.
    pub fn get_stats(&self) -> Stats {
        let mut num_keys = 0u64;
        let mut num_values_added = 0u64;
        let mut num_values_removed = 0u64;
        let mut key_size_min = u32::MAX;
        let mut key_size_max = 0u32;
        let mut key_size_sum = 0u64;
        let mut list_size_min = u64::MAX;
        let mut list_size_max = 0u64;
        let mut list_size_sum = 0u64;

        self.for_each_entry(|key, handle| {
            num_keys += 1;
            num_values_added += handle.list.num_values_added();
            num_values_removed += handle.list.num_values_removed();
            let ksz = key.len() as u32;
            key_size_min = key_size_min.min(ksz);
            key_size_max = key_size_max.max(ksz);
            key_size_sum += ksz as u64;
            let lsz = handle.len();
            list_size_min = list_size_min.min(lsz);
            list_size_max = list_size_max.max(lsz);
            list_size_sum += lsz;
        });

        if num_keys == 0 {
            key_size_min = 0;
            list_size_min = 0;
        }

        Stats {
            block_size: self.store.block_size(),
            num_blocks: self.store.num_committed() as u64,
            num_keys,
            num_values_added,
            num_values_removed,
            num_values_unowned: self.carry_over_num_values_unowned.load(Ordering::Relaxed),
            key_size_min,
            key_size_max,
            key_size_avg: if num_keys == 0 { 0.0 } else { key_size_sum as f64 / num_keys as f64 },
            list_size_min,
            list_size_max,
            list_size_avg: if num_keys == 0 { 0.0 } else { list_size_sum as f64 / num_keys as f64 },
            checksum: 0,
        }
    }

    /// Flushes every list and, unless the shard is read-only, rewrites the
    /// `.keys` and `.stats` sidecar files. Idempotent: a second call is a
    /// no-op.
    #[instrument(skip(self), fields(component = "shard"))]
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.store.flush()?;
        let Some(prefix) = self.prefix.clone() else {
            return Ok(());
        };
        if self.readonly {
            info!("shard is read-only, skipping close-time rewrite");
            return Ok(());
        }

        let keys_path = path_with_suffix(&prefix, ".keys");
        let keys_old_path = path_with_suffix(&prefix, ".keys.old");
        let stats_path = path_with_suffix(&prefix, ".stats");

        if keys_path.exists() {
            fs::rename(&keys_path, &keys_old_path).map_err(|e| Error::io(keys_path.clone(), e))?;
        }

        let mut num_keys = 0u64;
        let mut num_values_added = 0u64;
        let mut num_values_removed = 0u64;
        let mut key_size_min = u32::MAX;
        let mut key_size_max = 0u32;
        let mut key_size_sum = 0u64;
        let mut list_size_min = u64::MAX;
        let mut list_size_max = 0u64;
        let mut list_size_sum = 0u64;
        let mut newly_unowned = 0u64;

        {
            let file = fs::File::create(&keys_path).map_err(|e| Error::io(keys_path.clone(), e))?;
            let mut writer = BufWriter::new(file);
            let map = self.map.read();
            for (key, list) in map.iter() {
                list.flush(&self.store)?;
                let head = list.head();
                if head.is_empty() {
                    newly_unowned += head.num_values_removed;
                    continue;
                }
                num_keys += 1;
                num_values_added += head.num_values_added;
                num_values_removed += head.num_values_removed;
                let ksz = key.len() as u32;
                key_size_min = key_size_min.min(ksz);
                key_size_max = key_size_max.max(ksz);
                key_size_sum += ksz as u64;
                let lsz = head.len();
                list_size_min = list_size_min.min(lsz);
                list_size_max = list_size_max.max(lsz);
                list_size_sum += lsz;

                writer
                    .write_u32::<LittleEndian>(key.len() as u32)
                    .map_err(|e| Error::io(keys_path.clone(), e))?;
                writer.write_all(key).map_err(|e| Error::io(keys_path.clone(), e))?;
                head.write_to(&mut writer).map_err(|e| Error::io(keys_path.clone(), e))?;
            }
            writer.flush().map_err(|e| Error::io(keys_path.clone(), e))?;
        }

        if num_keys == 0 {
            key_size_min = 0;
            list_size_min = 0;
        }

        let num_values_unowned =
            self.carry_over_num_values_unowned.load(Ordering::Relaxed) + newly_unowned;

        let mut stats = Stats {
            block_size: self.store.block_size(),
            num_blocks: self.store.num_committed() as u64,
            num_keys,
            num_values_added,
            num_values_removed,
            num_values_unowned,
            key_size_min,
            key_size_max,
            key_size_avg: if num_keys == 0 { 0.0 } else { key_size_sum as f64 / num_keys as f64 },
            list_size_min,
            list_size_max,
            list_size_avg: if num_keys == 0 { 0.0 } else { list_size_sum as f64 / num_keys as f64 },
            checksum: 0,
        };
        stats.checksum = stats.compute_checksum();

        let stats_bytes_result = (|| -> Result<()> {
            let mut buf = Vec::new();
            stats.write_to(&mut buf).map_err(|e| Error::io(stats_path.clone(), e))?;
            fs::write(&stats_path, &buf).map_err(|e| Error::io(stats_path.clone(), e))?;
            Ok(())
        })();

        if let Err(e) = stats_bytes_result {
            warn!(error = %e, "failed to write stats file; leaving .keys.old anchor for recovery");
            return Err(e);
        }

        if keys_old_path.exists() {
            fs::remove_file(&keys_old_path).map_err(|e| Error::io(keys_old_path.clone(), e))?;
        }

        info!(num_keys, "shard closed");
        Ok(())
    }
}

impl Drop for Shard {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            if let Err(e) = self.close() {
                warn!(error = %e, "error closing shard in destructor");
            }
        }
    }
}

/// A shared (read) hold on one key's list.
pub struct SharedListHandle<'s> {
    _guard: SharedGuard,
    list: Arc<List>,
    store: &'s Store,
}

impl<'s> SharedListHandle<'s> {
    pub fn iter(&self) -> ValueIter<'s> {
        self.list.iter(self.store)
    }

    pub fn len(&self) -> u64 {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }
}

/// An exclusive (read/write) hold on one key's list.
pub struct UniqueListHandle<'s> {
    _guard: ExclusiveGuard,
    list: Arc<List>,
    store: &'s Store,
    block_arena: &'s Arc<BlockArena>,
}

impl<'s> UniqueListHandle<'s> {
    pub fn append(&self, value: &[u8]) -> Result<()> {
        self.list.append(value, self.store, self.block_arena)
    }

    pub fn flush(&self) -> Result<()> {
        self.list.flush(self.store)
    }

    pub fn iter(&self) -> ValueIter<'s> {
        self.list.iter(self.store)
    }

    pub fn iter_mut(&self) -> ValueIterMut<'s> {
        // SAFETY: `self.list` outlives the returned iterator: it is held by
        // an `Arc` inside `self`, and the iterator's lifetime `'s` is tied
        // to the shard's store reference, which cannot outlive the shard
        // that also keeps this handle's `Arc<List>` entry alive in its map.
        let list: &'s List = unsafe { &*(self.list.as_ref() as *const List) };
        list.iter_mut(self.store)
    }

    pub fn len(&self) -> u64 {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }
}
