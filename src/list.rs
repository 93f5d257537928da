//! The per-key list (§4.F): a head (persisted counters plus delta-coded
//! committed block ids) plus at most one open, in-memory write block.
//!
//! A `List` owns its `SharedMutex` (§4.E) but never locks it itself —
//! callers acquire shared or exclusive access externally (see
//! `shard::SharedListHandle` / `shard::UniqueListHandle`) and are then
//! entitled to call the corresponding half of this API.

use std::cell::UnsafeCell;
use std::io::{self, Read, Write};
use std::sync::Arc;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::block::{Block, BlockArena};
use crate::error::{Error, Result};
use crate::idvector::IdVector;
use crate::mutex_pool::SharedMutex;
use crate::store::Store;
use crate::varint;

/// Largest value `append` accepts: 2^29 - 1, the with-flag varint payload
/// ceiling (§6 Limits).
pub const MAX_VALUE_SIZE: usize = (1 << 29) - 1;

/// The persisted portion of a list (§3 List head).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListHead {
    pub num_values_added: u64,
    pub num_values_removed: u64,
    pub block_ids: IdVector,
}

impl ListHead {
    /// Effective (live) size: values added minus values removed.
    pub fn len(&self) -> u64 {
        self.num_values_added - self.num_values_removed
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Writes `{num_values_added: u64 LE}{num_values_removed: u64 LE}
    /// {block_ids: delta_vec}` where `delta_vec = {byte_length: u32 LE}
    /// {bytes}` (§6).
    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u64::<LittleEndian>(self.num_values_added)?;
        w.write_u64::<LittleEndian>(self.num_values_removed)?;
        let bytes = self.block_ids.as_bytes();
        w.write_u32::<LittleEndian>(bytes.len() as u32)?;
        w.write_all(bytes)?;
        Ok(())
    }

    pub fn read_from<R: Read>(r: &mut R) -> io::Result<Self> {
        let num_values_added = r.read_u64::<LittleEndian>()?;
        let num_values_removed = r.read_u64::<LittleEndian>()?;
        let len = r.read_u32::<LittleEndian>()? as usize;
        let mut bytes = vec![0u8; len];
        r.read_exact(&mut bytes)?;
        Ok(Self {
            num_values_added,
            num_values_removed,
            block_ids: IdVector::from_bytes(&bytes),
        })
    }
}

struct ListState {
    head: ListHead,
    open_block: Option<Block>,
}

/// All values appended under one key. See the module doc for locking
/// discipline.
pub struct List {
    mutex: SharedMutex,
    state: UnsafeCell<ListState>,
}

// SAFETY: every accessor requires the caller to already hold the
// appropriate half of `mutex` (enforced by `shard`'s handle types), which
// provides the happens-before edges needed for the `UnsafeCell` access to
// be data-race-free.
unsafe impl Sync for List {}
unsafe impl Send for List {}

impl List {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            mutex: SharedMutex::new(),
            state: UnsafeCell::new(ListState {
                head: ListHead::default(),
                open_block: None,
            }),
        })
    }

    pub fn from_head(head: ListHead) -> Arc<Self> {
        Arc::new(Self {
            mutex: SharedMutex::new(),
            state: UnsafeCell::new(ListState {
                head,
                open_block: None,
            }),
        })
    }

    pub fn mutex(&self) -> &SharedMutex {
        &self.mutex
    }

    #[allow(clippy::mut_from_ref)]
    fn state_mut(&self) -> &mut ListState {
        // SAFETY: see the `unsafe impl Sync` comment above.
        unsafe { &mut *self.state.get() }
    }

    fn state(&self) -> &ListState {
        // SAFETY: see the `unsafe impl Sync` comment above.
        unsafe { &*self.state.get() }
    }

    pub fn num_values_added(&self) -> u64 {
        self.state().head.num_values_added
    }

    pub fn num_values_removed(&self) -> u64 {
        self.state().head.num_values_removed
    }

    pub fn len(&self) -> u64 {
        self.state().head.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state().head.is_empty()
    }

    /// A flushed snapshot of the list's head, suitable for serialization.
    /// Callers must `flush` first if the open block may hold data.
    pub fn head(&self) -> ListHead {
        self.state().head.clone()
    }

    /// Appends `value`. Rejects empty values (the only byte sequence that
    /// would be indistinguishable, on disk, from the zero-padding that
    /// follows the last record in a partially filled block — see
    /// `DESIGN.md`) and values over `MAX_VALUE_SIZE`.
    pub fn append(&self, value: &[u8], store: &Store, arena: &Arc<BlockArena>) -> Result<()> {
        if value.is_empty() {
            return Err(Error::domain("cannot append a zero-length value"));
        }
        if value.len() > MAX_VALUE_SIZE {
            return Err(Error::domain(format!(
                "value of {} bytes exceeds max_value_size {}",
                value.len(),
                MAX_VALUE_SIZE
            )));
        }

        let state = self.state_mut();
        if state.open_block.is_none() {
            state.open_block = Some(arena.allocate());
        }

        loop {
            let block = state.open_block.as_mut().unwrap();
            if block.write_size_with_flag(value.len() as u32, false).is_ok() {
                break;
            }
            Self::commit_open_block(state, store)?;
        }

        let mut remaining = value;
        while !remaining.is_empty() {
            let block = state.open_block.as_mut().unwrap();
            let written = block.write_data(remaining);
            remaining = &remaining[written..];
            if !remaining.is_empty() {
                Self::commit_open_block(state, store)?;
            }
        }

        state.head.num_values_added += 1;
        Ok(())
    }

    /// If the open block holds data, zero-pads it, commits it to `store`
    /// and appends its id, then rewinds the (reused) block for further
    /// writes.
    pub fn flush(&self, store: &Store) -> Result<()> {
        Self::commit_open_block(self.state_mut(), store)
    }

    fn commit_open_block(state: &mut ListState, store: &Store) -> Result<()> {
        if let Some(block) = state.open_block.as_mut() {
            if block.position() > 0 {
                block.fill_up_with_zeros();
                let id = store.put(block)?;
                state.head.block_ids.add(id);
                block.rewind();
            }
        }
        Ok(())
    }

    /// A read-only cursor over all live values, committed blocks first in
    /// insertion order, then the open block's written prefix.
    pub fn iter<'a>(&self, store: &'a Store) -> ValueIter<'a> {
        let state = self.state();
        let open_tail = state
            .open_block
            .as_ref()
            .map(|b| b.filled().to_vec())
            .unwrap_or_default();
        ValueIter::new(store, state.head.block_ids.unpack(), open_tail, state.head.len())
    }

    /// A cursor that additionally allows marking the most recently yielded
    /// value deleted.
    pub fn iter_mut<'a>(&'a self, store: &'a Store) -> ValueIterMut<'a> {
        let ids = self.state().head.block_ids.unpack();
        let available = self.state().head.len();
        ValueIterMut::new(self, store, ids, available)
    }

    /// Swaps this list's head and open block with `other`'s. Used by the
    /// shard's rewrite operation to adopt a freshly rebuilt list's contents
    /// in place. Caller must hold this list's exclusive lock; `other` is
    /// expected to be discarded immediately afterwards.
    pub(crate) fn adopt(&self, other: &List) {
        std::mem::swap(self.state_mut(), other.state_mut());
    }
}

/// A read-only cursor over a list's live values (shared access, §4.F).
pub struct ValueIter<'a> {
    store: &'a Store,
    block_size: usize,
    ids: Vec<u32>,
    next_id_idx: usize,
    open_tail: Vec<u8>,
    open_consumed: bool,
    cur: Vec<u8>,
    cur_limit: usize,
    cur_pos: usize,
    have_block: bool,
    available: u64,
}

impl<'a> ValueIter<'a> {
    fn new(store: &'a Store, ids: Vec<u32>, open_tail: Vec<u8>, available: u64) -> Self {
        Self {
            store,
            block_size: store.block_size() as usize,
            ids,
            next_id_idx: 0,
            open_tail,
            open_consumed: false,
            cur: Vec::new(),
            cur_limit: 0,
            cur_pos: 0,
            have_block: false,
            available,
        }
    }

    /// Remaining live values not yet yielded by this cursor.
    pub fn available(&self) -> u64 {
        self.available
    }

    fn advance_block(&mut self) -> Result<bool> {
        if self.next_id_idx < self.ids.len() {
            let id = self.ids[self.next_id_idx];
            self.next_id_idx += 1;
            let mut buf = vec![0u8; self.block_size];
            self.store.get(id, &mut buf)?;
            self.cur = buf;
            self.cur_limit = self.block_size;
            self.cur_pos = 0;
            self.have_block = true;
            return Ok(true);
        }
        if !self.open_consumed {
            self.open_consumed = true;
            self.cur_limit = self.open_tail.len();
            self.cur = std::mem::take(&mut self.open_tail);
            self.cur_pos = 0;
            self.have_block = true;
            return Ok(true);
        }
        self.have_block = false;
        Ok(false)
    }

    /// Returns the next live value, or `None` once the list is exhausted.
    pub fn next(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            if !self.have_block && !self.advance_block()? {
                return Ok(None);
            }
            if self.cur_pos >= self.cur_limit {
                self.have_block = false;
                continue;
            }
            let Some((size, flag, header_len)) =
                varint::read_uint_with_flag(&self.cur[self.cur_pos..self.cur_limit])
            else {
                self.have_block = false;
                continue;
            };
            if size == 0 {
                // Zero decodes only as the end-of-data padding sentinel
                // (`append` never writes a zero-length value); the rest of
                // this block is zero-fill.
                self.have_block = false;
                continue;
            }
            let after_header = self.cur_pos + header_len;
            let size = size as usize;
            let available_here = self.cur_limit - after_header;
            if size <= available_here {
                let bytes = self.cur[after_header..after_header + size].to_vec();
                self.cur_pos = after_header + size;
                if flag {
                    continue;
                }
                self.available = self.available.saturating_sub(1);
                return Ok(Some(bytes));
            }
            let mut collected = self.cur[after_header..self.cur_limit].to_vec();
            let mut remaining = size - collected.len();
            self.have_block = false;
            while remaining > 0 {
                if !self.advance_block()? {
                    break;
                }
                let take = remaining.min(self.cur_limit - self.cur_pos);
                collected.extend_from_slice(&self.cur[self.cur_pos..self.cur_pos + take]);
                self.cur_pos += take;
                remaining -= take;
                if self.cur_pos >= self.cur_limit {
                    self.have_block = false;
                }
            }
            if flag {
                continue;
            }
            self.available = self.available.saturating_sub(1);
            return Ok(Some(collected));
        }
    }
}

enum HeaderLoc {
    Committed(usize),
    Open(usize),
    /// The header lives in `ValueIterMut::split_header`, a block the cursor
    /// has since advanced past (§4.F: a value larger than `block_size` keeps
    /// its header in the first block it occupies).
    Split,
}

/// A committed block holding a split value's header, parked aside once the
/// cursor advances past it so `remove_current` can still flip its flag.
struct SplitHeader {
    id: u32,
    bytes: Vec<u8>,
    offset: usize,
    dirty: bool,
}

/// A cursor that additionally supports in-place deletion of the most
/// recently yielded value (exclusive access, §4.F).
pub struct ValueIterMut<'a> {
    list: &'a List,
    store: &'a Store,
    block_size: usize,
    ids: Vec<u32>,
    next_id_idx: usize,
    committed: Option<(u32, Vec<u8>, bool)>,
    committed_pos: usize,
    in_open: bool,
    open_pos: usize,
    last_header: Option<HeaderLoc>,
    split_header: Option<SplitHeader>,
    removed_current: bool,
    available: u64,
}

impl<'a> ValueIterMut<'a> {
    fn new(list: &'a List, store: &'a Store, ids: Vec<u32>, available: u64) -> Self {
        Self {
            list,
            store,
            block_size: store.block_size() as usize,
            ids,
            next_id_idx: 0,
            committed: None,
            committed_pos: 0,
            in_open: false,
            open_pos: 0,
            last_header: None,
            split_header: None,
            removed_current: false,
            available,
        }
    }

    pub fn available(&self) -> u64 {
        self.available
    }

    fn flush_committed_if_dirty(&mut self) -> Result<()> {
        if let Some((id, bytes, dirty)) = self.committed.take() {
            if dirty {
                self.store.replace(id, &bytes)?;
            }
        }
        Ok(())
    }

    /// Writes back a parked split-value header block if its flag was
    /// flipped since it was parked. Must run before the header it describes
    /// stops being reachable through `last_header` (i.e. whenever a new
    /// header location is about to be recorded, and on `finish`/`Drop`).
    fn flush_split_header_if_dirty(&mut self) -> Result<()> {
        if let Some(sh) = self.split_header.take() {
            if sh.dirty {
                self.store.replace(sh.id, &sh.bytes)?;
            }
        }
        Ok(())
    }

    /// Advances to the next source block (another committed block, or the
    /// open block). Returns `false` once there is nothing left.
    fn advance_block(&mut self) -> Result<bool> {
        self.flush_committed_if_dirty()?;
        if self.next_id_idx < self.ids.len() {
            let id = self.ids[self.next_id_idx];
            self.next_id_idx += 1;
            let mut buf = vec![0u8; self.block_size];
            self.store.get(id, &mut buf)?;
            self.committed = Some((id, buf, false));
            self.committed_pos = 0;
            return Ok(true);
        }
        if !self.in_open {
            self.in_open = true;
            self.open_pos = 0;
            // Only enter the open-block phase if it actually holds data.
            let has_data = self
                .list
                .state()
                .open_block
                .as_ref()
                .map(|b| b.position() > 0)
                .unwrap_or(false);
            return Ok(has_data);
        }
        Ok(false)
    }

    /// Returns the next live value, or `None` once the list is exhausted.
    pub fn next(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            self.removed_current = false;
            if self.committed.is_none() && !self.in_open {
                if !self.advance_block()? {
                    return Ok(None);
                }
                continue;
            }

            if self.committed.is_some() {
                // Scoped so the borrow of `self.committed` ends before any
                // branch below needs to call back into `&mut self`.
                enum Step {
                    EndOfBlock,
                    Whole { value: Vec<u8>, flag: bool, start: usize, header_len: usize },
                    Split { partial: Vec<u8>, remaining: usize, flag: bool, start: usize, block_id: u32, block_bytes: Vec<u8> },
                }
                let step = {
                    let (block_id, bytes, _) = self.committed.as_ref().unwrap();
                    let block_id = *block_id;
                    if self.committed_pos >= bytes.len() {
                        Step::EndOfBlock
                    } else {
                        match varint::read_uint_with_flag(&bytes[self.committed_pos..]) {
                            None => Step::EndOfBlock,
                            Some((0, _, _)) => Step::EndOfBlock,
                            Some((size, flag, header_len)) => {
                                let start = self.committed_pos;
                                let after_header = start + header_len;
                                let size = size as usize;
                                if after_header + size <= bytes.len() {
                                    Step::Whole {
                                        value: bytes[after_header..after_header + size].to_vec(),
                                        flag,
                                        start,
                                        header_len,
                                    }
                                } else {
                                    Step::Split {
                                        partial: bytes[after_header..].to_vec(),
                                        remaining: size - (bytes.len() - after_header),
                                        flag,
                                        start,
                                        block_id,
                                        block_bytes: bytes.clone(),
                                    }
                                }
                            }
                        }
                    }
                };
                match step {
                    Step::EndOfBlock => {
                        if !self.advance_block()? {
                            return Ok(None);
                        }
                        continue;
                    }
                    Step::Whole { value, flag, start, header_len } => {
                        self.committed_pos = start + header_len + value.len();
                        self.flush_split_header_if_dirty()?;
                        self.last_header = Some(HeaderLoc::Committed(start));
                        if flag {
                            continue;
                        }
                        self.available = self.available.saturating_sub(1);
                        return Ok(Some(value));
                    }
                    Step::Split {
                        mut partial,
                        mut remaining,
                        flag,
                        start,
                        block_id,
                        block_bytes,
                    } => {
                        // The header lives in `block_id`, which `advance_block`
                        // below will push `self.committed` past (or leave it
                        // entirely, if the tail lands in the open block).
                        // Park a copy so `remove_current` still finds it.
                        self.flush_split_header_if_dirty()?;
                        self.split_header = Some(SplitHeader {
                            id: block_id,
                            bytes: block_bytes,
                            offset: start,
                            dirty: false,
                        });
                        self.last_header = Some(HeaderLoc::Split);
                        if !self.advance_block()? {
                            return Ok(None);
                        }
                        while remaining > 0 {
                            let avail = self.current_source_len() - self.current_pos();
                            let take = remaining.min(avail);
                            partial.extend_from_slice(self.current_source_slice(take));
                            self.advance_pos(take);
                            remaining -= take;
                            if remaining > 0 && !self.advance_block()? {
                                break;
                            }
                        }
                        if flag {
                            continue;
                        }
                        self.available = self.available.saturating_sub(1);
                        return Ok(Some(partial));
                    }
                }
            }

            // Open-block phase.
            let state = self.list.state();
            let block = state
                .open_block
                .as_ref()
                .expect("open-block phase implies an open block exists");
            let limit = block.position() as usize;
            if self.open_pos >= limit {
                return Ok(None);
            }
            let bytes = block.filled();
            let Some((size, flag, header_len)) = varint::read_uint_with_flag(&bytes[self.open_pos..limit])
            else {
                return Ok(None);
            };
            if size == 0 {
                return Ok(None);
            }
            let start = self.open_pos;
            let after_header = start + header_len;
            let size = size as usize;
            // A value only ever begins in the open block if it also ends
            // there: anything that would overflow it is committed first.
            let value = bytes[after_header..after_header + size].to_vec();
            self.open_pos = after_header + size;
            self.flush_split_header_if_dirty()?;
            self.last_header = Some(HeaderLoc::Open(start));
            if flag {
                continue;
            }
            self.available = self.available.saturating_sub(1);
            return Ok(Some(value));
        }
    }

    fn current_source_len(&self) -> usize {
        if let Some((_, bytes, _)) = self.committed.as_ref() {
            bytes.len()
        } else {
            self.list
                .state()
                .open_block
                .as_ref()
                .map(|b| b.position() as usize)
                .unwrap_or(0)
        }
    }

    fn current_pos(&self) -> usize {
        if self.committed.is_some() {
            self.committed_pos
        } else {
            self.open_pos
        }
    }

    fn current_source_slice(&self, take: usize) -> &[u8] {
        if let Some((_, bytes, _)) = self.committed.as_ref() {
            &bytes[self.committed_pos..self.committed_pos + take]
        } else {
            let block = self.list.state().open_block.as_ref().unwrap();
            let bytes = block.filled();
            &bytes[self.open_pos..self.open_pos + take]
        }
        // SAFETY note: returned slice borrows from data that outlives the
        // call (either our own `committed` buffer, or the list's open
        // block, which is only mutated by this same exclusive iterator).
    }

    fn advance_pos(&mut self, n: usize) {
        if self.committed.is_some() {
            self.committed_pos += n;
        } else {
            self.open_pos += n;
        }
    }

    /// Marks the most recently yielded value deleted. Returns `false` (a
    /// no-op) if nothing has been yielded yet, or if this value was already
    /// removed by an earlier call — deletion is idempotent (testable
    /// property 4).
    pub fn remove_current(&mut self) -> bool {
        if self.removed_current {
            return false;
        }
        let flipped = match self.last_header {
            Some(HeaderLoc::Committed(off)) => {
                if let Some((_, bytes, dirty)) = self.committed.as_mut() {
                    varint::set_flag(&mut bytes[off..], true);
                    *dirty = true;
                    true
                } else {
                    false
                }
            }
            Some(HeaderLoc::Open(off)) => {
                let state = self.list.state_mut();
                if let Some(block) = state.open_block.as_mut() {
                    block.set_flag_at(off, true);
                    true
                } else {
                    false
                }
            }
            Some(HeaderLoc::Split) => {
                if let Some(sh) = self.split_header.as_mut() {
                    varint::set_flag(&mut sh.bytes[sh.offset..], true);
                    sh.dirty = true;
                    true
                } else {
                    false
                }
            }
            None => false,
        };
        if flipped {
            self.removed_current = true;
            self.list.state_mut().head.num_values_removed += 1;
            self.available = self.available.saturating_sub(1);
        }
        flipped
    }

    /// Flushes any buffered, mutated committed block back to the store.
    /// Called automatically on drop (best-effort); call explicitly to
    /// observe I/O errors.
    pub fn finish(mut self) -> Result<()> {
        self.flush_committed_if_dirty()?;
        self.flush_split_header_if_dirty()
    }
}

impl Drop for ValueIterMut<'_> {
    fn drop(&mut self) {
        let _ = self.flush_committed_if_dirty();
        let _ = self.flush_split_header_if_dirty();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn tempdir() -> PathBuf {
        static NEXT: AtomicU32 = AtomicU32::new(0);
        let dir = std::env::temp_dir().join(format!(
            "shardmap-list-test-{}-{}",
            std::process::id(),
            NEXT.fetch_add(1, Ordering::Relaxed)
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn collect_live(list: &Arc<List>, store: &Store) -> Vec<Vec<u8>> {
        let mut it = list.iter(store);
        let mut out = Vec::new();
        while let Some(v) = it.next().unwrap() {
            out.push(v);
        }
        out
    }

    #[test]
    fn insertion_order_is_preserved() {
        let dir = tempdir();
        let store = Store::open(dir.join("v.values"), 64, 256, true).unwrap();
        let arena = BlockArena::new(64, 4096);
        let list = List::new();
        for v in ["0", "1", "2"] {
            list.append(v.as_bytes(), &store, &arena).unwrap();
        }
        assert_eq!(collect_live(&list, &store), vec![b"0".to_vec(), b"1".to_vec(), b"2".to_vec()]);
    }

    #[test]
    fn available_decreases_as_consumed() {
        let dir = tempdir();
        let store = Store::open(dir.join("v.values"), 64, 256, true).unwrap();
        let arena = BlockArena::new(64, 4096);
        let list = List::new();
        for v in ["0", "1", "2"] {
            list.append(v.as_bytes(), &store, &arena).unwrap();
        }
        let mut it = list.iter(&store);
        assert_eq!(it.available(), 3);
        it.next().unwrap();
        assert_eq!(it.available(), 2);
        it.next().unwrap();
        it.next().unwrap();
        assert_eq!(it.available(), 0);
        assert!(it.next().unwrap().is_none());
    }

    #[test]
    fn remove_via_exclusive_iterator_is_idempotent_on_count() {
        let dir = tempdir();
        let store = Store::open(dir.join("v.values"), 64, 256, true).unwrap();
        let arena = BlockArena::new(64, 4096);
        let list = List::new();
        for v in ["0", "1", "2"] {
            list.append(v.as_bytes(), &store, &arena).unwrap();
        }
        {
            let mut it = list.iter_mut(&store);
            while let Some(v) = it.next().unwrap() {
                if v == b"1" {
                    assert!(it.remove_current());
                    assert!(!it.remove_current());
                }
            }
        }
        assert_eq!(list.num_values_removed(), 1);
        assert_eq!(collect_live(&list, &store), vec![b"0".to_vec(), b"2".to_vec()]);
    }

    #[test]
    fn split_value_round_trips_across_blocks() {
        let dir = tempdir();
        let store = Store::open(dir.join("v.values"), 128, 4096, true).unwrap();
        let arena = BlockArena::new(128, 4096);
        let list = List::new();
        let value: Vec<u8> = (0..300u32).map(|i| (i % 256) as u8).collect();
        list.append(&value, &store, &arena).unwrap();
        let got = collect_live(&list, &store);
        assert_eq!(got, vec![value]);
        assert!(list.head().block_ids.unpack().len() >= 3);
    }

    #[test]
    fn deletion_in_committed_block_persists_after_flush() {
        let dir = tempdir();
        let store = Store::open(dir.join("v.values"), 32, 32, true).unwrap();
        let arena = BlockArena::new(32, 4096);
        let list = List::new();
        for v in ["aa", "bb", "cc"] {
            list.append(v.as_bytes(), &store, &arena).unwrap();
        }
        list.flush(&store).unwrap();
        {
            let mut it = list.iter_mut(&store);
            while let Some(v) = it.next().unwrap() {
                if v == b"bb" {
                    it.remove_current();
                }
            }
        }
        assert_eq!(collect_live(&list, &store), vec![b"aa".to_vec(), b"cc".to_vec()]);
    }

    #[test]
    fn rejects_empty_and_oversized_values() {
        let dir = tempdir();
        let store = Store::open(dir.join("v.values"), 64, 256, true).unwrap();
        let arena = BlockArena::new(64, 4096);
        let list = List::new();
        assert!(list.append(b"", &store, &arena).is_err());
        let oversized = vec![0u8; MAX_VALUE_SIZE + 1];
        assert!(list.append(&oversized, &store, &arena).is_err());
    }
}
