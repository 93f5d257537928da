//! The block store (§4.D): owns the `.values` file, assigns block ids and
//! buffers appended blocks before they are flushed in one write.
//!
//! Block ids `< num_committed` live on disk and are served from a
//! memory-mapped read-only view; ids in `[num_committed, num_committed +
//! buffer_len)` live in the in-memory staging buffer. A single mutex
//! serializes buffer mutations; committed reads do not take it, relying on
//! `num_committed` being published (via a `Release` store) only after the
//! mmap has been remapped to cover the newly committed bytes.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

use memmap2::Mmap;
use parking_lot::{Mutex, RwLock};

use crate::block::Block;
use crate::error::{Error, Result};

/// Default write-buffer ceiling before an implicit flush (§6 Options).
pub const DEFAULT_BUFFER_SIZE: u32 = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessPattern {
    Normal,
    WillNeed,
    Sequential,
}

struct Inner {
    buffer: Vec<u8>,
}

pub struct Store {
    file: File,
    path: PathBuf,
    block_size: u32,
    buffer_size: u32,
    num_committed: AtomicU32,
    inner: Mutex<Inner>,
    mmap: RwLock<Option<Mmap>>,
}

impl Store {
    /// Opens (or creates) the values file at `path`. `block_size` is
    /// ignored when the file already holds data: the file's own size modulo
    /// a block boundary is authoritative, and a shard-level mismatch check
    /// against the stats record is the caller's job (`IncompatibleError`).
    pub fn open(
        path: impl AsRef<Path>,
        block_size: u32,
        buffer_size: u32,
        create_if_missing: bool,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        assert!(block_size.is_power_of_two(), "block_size must be a power of two");

        let exists = path.exists();
        if !exists && !create_if_missing {
            return Err(Error::domain(format!(
                "values file {} does not exist and create_if_missing is false",
                path.display()
            )));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create_if_missing)
            .open(&path)
            .map_err(|e| Error::io(path.clone(), e))?;

        let len = file.metadata().map_err(|e| Error::io(path.clone(), e))?.len();
        if len % block_size as u64 != 0 {
            return Err(Error::corruption(
                path.clone(),
                format!("values file length {len} is not a multiple of block_size {block_size}"),
            ));
        }
        let num_committed = (len / block_size as u64) as u32;

        let mmap = if num_committed > 0 {
            // SAFETY: the file is only ever mutated through `Store` methods,
            // which serialize writers and never shrink the file while this
            // mapping is alive.
            Some(unsafe { Mmap::map(&file) }.map_err(|e| Error::io(path.clone(), e))?)
        } else {
            None
        };

        Ok(Self {
            file,
            path,
            block_size,
            buffer_size: buffer_size.max(block_size),
            num_committed: AtomicU32::new(num_committed),
            inner: Mutex::new(Inner { buffer: Vec::new() }),
            mmap: RwLock::new(mmap),
        })
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of blocks durably committed to disk (excludes the staging
    /// buffer). This is the value recorded in the stats record as
    /// `num_blocks` on close.
    pub fn num_committed(&self) -> u32 {
        self.num_committed.load(Ordering::Acquire)
    }

    /// Commits a single write block, returning its assigned id. May trigger
    /// an implicit flush if the buffer has reached `buffer_size`.
    pub fn put(&self, block: &Block) -> Result<u32> {
        let mut inner = self.inner.lock();
        inner.buffer.extend_from_slice(block.as_committed_bytes());
        let blocks_buffered = (inner.buffer.len() / self.block_size as usize) as u32;
        let id = self.num_committed.load(Ordering::Relaxed) + blocks_buffered - 1;
        if inner.buffer.len() >= self.buffer_size as usize {
            self.flush_locked(&mut inner)?;
        }
        Ok(id)
    }

    /// Commits a contiguous batch of blocks, returning their (contiguous)
    /// assigned ids. Holds the buffer lock across the whole batch so no
    /// other writer's blocks can interleave.
    pub fn put_batch(&self, blocks: &[Block]) -> Result<Vec<u32>> {
        let mut inner = self.inner.lock();
        let mut ids = Vec::with_capacity(blocks.len());
        for block in blocks {
            inner.buffer.extend_from_slice(block.as_committed_bytes());
            let blocks_buffered = (inner.buffer.len() / self.block_size as usize) as u32;
            ids.push(self.num_committed.load(Ordering::Relaxed) + blocks_buffered - 1);
            if inner.buffer.len() >= self.buffer_size as usize {
                self.flush_locked(&mut inner)?;
            }
        }
        Ok(ids)
    }

    /// Reads `block_size` bytes for `block_id` into `out`.
    pub fn get(&self, block_id: u32, out: &mut [u8]) -> Result<()> {
        assert_eq!(out.len(), self.block_size as usize);
        loop {
            let committed = self.num_committed.load(Ordering::Acquire);
            if block_id < committed {
                let guard = self.mmap.read();
                let mmap = guard
                    .as_ref()
                    .expect("mmap must be present once any block is committed");
                let off = block_id as usize * self.block_size as usize;
                out.copy_from_slice(&mmap[off..off + self.block_size as usize]);
                return Ok(());
            }
            let inner = self.inner.lock();
            let committed2 = self.num_committed.load(Ordering::Relaxed);
            if committed2 != committed {
                // A flush raced us between the two loads; retry from the top.
                continue;
            }
            let idx = (block_id - committed2) as usize;
            let byte_off = idx * self.block_size as usize;
            if byte_off + self.block_size as usize > inner.buffer.len() {
                return Err(Error::OutOfRange {
                    id: block_id,
                    num_blocks: committed2 + (inner.buffer.len() / self.block_size as usize) as u32,
                });
            }
            out.copy_from_slice(&inner.buffer[byte_off..byte_off + self.block_size as usize]);
            return Ok(());
        }
    }

    /// Overwrites an already-committed block's bytes in place. Used when a
    /// list flips a value's deleted flag inside a previously flushed block.
    #[cfg(unix)]
    pub fn replace(&self, block_id: u32, bytes: &[u8]) -> Result<()> {
        use std::os::unix::fs::FileExt;
        assert_eq!(bytes.len(), self.block_size as usize);
        let committed = self.num_committed.load(Ordering::Acquire);
        if block_id >= committed {
            return Err(Error::OutOfRange {
                id: block_id,
                num_blocks: committed,
            });
        }
        let off = block_id as u64 * self.block_size as u64;
        self.file
            .write_at(bytes, off)
            .map_err(|e| Error::io(self.path.clone(), e))?;
        Ok(())
    }

    /// `madvise` hint over the mapped region; used around full scans.
    pub fn advise_access_pattern(&self, pattern: AccessPattern) {
        let guard = self.mmap.read();
        let Some(mmap) = guard.as_ref() else { return };
        if mmap.is_empty() {
            return;
        }
        let advice = match pattern {
            AccessPattern::Normal => libc::MADV_NORMAL,
            AccessPattern::WillNeed => libc::MADV_WILLNEED,
            AccessPattern::Sequential => libc::MADV_SEQUENTIAL,
        };
        // SAFETY: `mmap`'s address range is valid and mapped for as long as
        // `guard` is held; `madvise` is advisory and cannot corrupt memory.
        unsafe {
            libc::madvise(
                mmap.as_ptr() as *mut libc::c_void,
                mmap.len(),
                advice,
            );
        }
    }

    /// Forces the staging buffer to disk.
    pub fn flush(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        self.flush_locked(&mut inner)
    }

    fn flush_locked(&self, inner: &mut Inner) -> Result<()> {
        if inner.buffer.is_empty() {
            return Ok(());
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::FileExt;
            let committed = self.num_committed.load(Ordering::Relaxed);
            let off = committed as u64 * self.block_size as u64;
            self.file
                .write_at(&inner.buffer, off)
                .map_err(|e| Error::io(self.path.clone(), e))?;
        }
        self.file.sync_data().map_err(|e| Error::io(self.path.clone(), e))?;

        let new_committed =
            self.num_committed.load(Ordering::Relaxed) + (inner.buffer.len() / self.block_size as usize) as u32;

        // SAFETY: remapping after every flush keeps the mapping covering
        // exactly `[0, new_committed * block_size)`; no reader can observe
        // `new_committed` (below) before this remap is visible because the
        // counter publish uses `Release` ordering.
        let mmap = unsafe { Mmap::map(&self.file) }.map_err(|e| Error::io(self.path.clone(), e))?;
        *self.mmap.write() = Some(mmap);

        self.num_committed.store(new_committed, Ordering::Release);
        inner.buffer.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockArena;

    #[test]
    fn put_then_get_round_trips_through_buffer_and_disk() {
        let dir = tempfile_dir();
        let store = Store::open(dir.join("v.values"), 64, 256, true).unwrap();
        let arena = BlockArena::new(64, 256 * 64);
        let mut block = arena.allocate();
        block.write_data(b"hello world!!!!");
        block.fill_up_with_zeros();

        let id = store.put(&block).unwrap();
        assert_eq!(id, 0);

        let mut out = [0u8; 64];
        store.get(id, &mut out).unwrap();
        assert_eq!(&out[..15], b"hello world!!!!");

        store.flush().unwrap();
        assert_eq!(store.num_committed(), 1);
        let mut out2 = [0u8; 64];
        store.get(id, &mut out2).unwrap();
        assert_eq!(out, out2);
    }

    #[test]
    fn implicit_flush_on_full_buffer() {
        let dir = tempfile_dir();
        let store = Store::open(dir.join("v.values"), 16, 32, true).unwrap();
        let arena = BlockArena::new(16, 256 * 16);
        for _ in 0..3 {
            let mut block = arena.allocate();
            block.fill_up_with_zeros();
            store.put(&block).unwrap();
        }
        assert!(store.num_committed() >= 2);
    }

    #[test]
    fn replace_overwrites_committed_block() {
        let dir = tempfile_dir();
        let store = Store::open(dir.join("v.values"), 32, 32, true).unwrap();
        let arena = BlockArena::new(32, 256 * 32);
        let mut block = arena.allocate();
        block.write_data(b"original");
        block.fill_up_with_zeros();
        let id = store.put(&block).unwrap();
        store.flush().unwrap();

        let mut replacement = [0u8; 32];
        replacement[..9].copy_from_slice(b"replaced!");
        store.replace(id, &replacement).unwrap();

        let mut out = [0u8; 32];
        store.get(id, &mut out).unwrap();
        assert_eq!(&out[..9], b"replaced!");
    }

    #[test]
    fn reopen_recovers_num_committed_from_file_length() {
        let dir = tempfile_dir();
        let path = dir.join("v.values");
        {
            let store = Store::open(&path, 32, 32, true).unwrap();
            let arena = BlockArena::new(32, 256 * 32);
            for _ in 0..5 {
                let mut block = arena.allocate();
                block.fill_up_with_zeros();
                store.put(&block).unwrap();
            }
            store.flush().unwrap();
        }
        let reopened = Store::open(&path, 32, 32, false).unwrap();
        assert_eq!(reopened.num_committed(), 5);
    }

    fn tempfile_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "shardmap-store-test-{}-{}",
            std::process::id(),
            NEXT.fetch_add(1, Ordering::Relaxed)
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    static NEXT: AtomicU32 = AtomicU32::new(0);
}
