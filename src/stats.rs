//! Per-shard statistics record (§4.I, §6): a fixed 104-byte layout written
//! to `{prefix}.stats`, checksummed with CRC-32 over the byte image with
//! the checksum field itself zeroed.

use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};

/// On-disk and in-memory size of a `Stats` record, identical on 32- and
/// 64-bit platforms since every field has an explicit fixed width.
pub const STATS_RECORD_SIZE: usize = 104;

/// Byte offset of the `checksum` field within the fixed-layout record (all
/// fields up to and including `list_size_avg`, in declaration order).
const CHECKSUM_OFFSET: usize = 84;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Stats {
    pub block_size: u32,
    pub num_blocks: u64,
    pub num_keys: u64,
    pub num_values_added: u64,
    pub num_values_removed: u64,
    pub num_values_unowned: u64,
    pub key_size_min: u32,
    pub key_size_max: u32,
    pub key_size_avg: f64,
    pub list_size_min: u64,
    pub list_size_max: u64,
    pub list_size_avg: f64,
    pub checksum: u32,
}

impl Stats {
    /// Serializes the record with `checksum` written verbatim (callers
    /// computing a fresh checksum should zero it first via
    /// `with_checksum(0)`).
    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u32::<LittleEndian>(self.block_size)?;
        w.write_u64::<LittleEndian>(self.num_blocks)?;
        w.write_u64::<LittleEndian>(self.num_keys)?;
        w.write_u64::<LittleEndian>(self.num_values_added)?;
        w.write_u64::<LittleEndian>(self.num_values_removed)?;
        w.write_u64::<LittleEndian>(self.num_values_unowned)?;
        w.write_u32::<LittleEndian>(self.key_size_min)?;
        w.write_u32::<LittleEndian>(self.key_size_max)?;
        w.write_f64::<LittleEndian>(self.key_size_avg)?;
        w.write_u64::<LittleEndian>(self.list_size_min)?;
        w.write_u64::<LittleEndian>(self.list_size_max)?;
        w.write_f64::<LittleEndian>(self.list_size_avg)?;
        w.write_u32::<LittleEndian>(self.checksum)?;
        w.write_all(&[0u8; 16])?; // reserved, pads the record to 104 bytes
        Ok(())
    }

    pub fn read_from<R: Read>(r: &mut R) -> io::Result<Self> {
        let block_size = r.read_u32::<LittleEndian>()?;
        let num_blocks = r.read_u64::<LittleEndian>()?;
        let num_keys = r.read_u64::<LittleEndian>()?;
        let num_values_added = r.read_u64::<LittleEndian>()?;
        let num_values_removed = r.read_u64::<LittleEndian>()?;
        let num_values_unowned = r.read_u64::<LittleEndian>()?;
        let key_size_min = r.read_u32::<LittleEndian>()?;
        let key_size_max = r.read_u32::<LittleEndian>()?;
        let key_size_avg = r.read_f64::<LittleEndian>()?;
        let list_size_min = r.read_u64::<LittleEndian>()?;
        let list_size_max = r.read_u64::<LittleEndian>()?;
        let list_size_avg = r.read_f64::<LittleEndian>()?;
        let checksum = r.read_u32::<LittleEndian>()?;
        let mut reserved = [0u8; 16];
        r.read_exact(&mut reserved)?;
        Ok(Self {
            block_size,
            num_blocks,
            num_keys,
            num_values_added,
            num_values_removed,
            num_values_unowned,
            key_size_min,
            key_size_max,
            key_size_avg,
            list_size_min,
            list_size_max,
            list_size_avg,
            checksum,
        })
    }

    /// Computes the CRC-32 checksum this record would have on disk: its own
    /// 104-byte image with the `checksum` field zeroed. Used when minting a
    /// fresh record; `parse_and_verify` instead hashes the literal bytes
    /// read from disk, so the two must agree on the image they hash.
    pub fn compute_checksum(&self) -> u32 {
        let mut copy = *self;
        copy.checksum = 0;
        let mut buf = Vec::with_capacity(STATS_RECORD_SIZE);
        copy.write_to(&mut buf).expect("writing to a Vec cannot fail");
        Self::checksum_of_record_image(&buf)
    }

    /// CRC-32 of a 104-byte record image with only the 4 checksum bytes
    /// zeroed. Operates on the raw bytes rather than a re-serialized
    /// `Stats`, so corruption anywhere in the record -- including the
    /// reserved padding, which carries no parsed field -- changes the
    /// result.
    fn checksum_of_record_image(bytes: &[u8]) -> u32 {
        debug_assert_eq!(bytes.len(), STATS_RECORD_SIZE);
        let mut zeroed = bytes.to_vec();
        zeroed[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4].copy_from_slice(&[0u8; 4]);
        crc32fast::hash(&zeroed)
    }

    /// Parses a 104-byte record and verifies its checksum, failing with
    /// `CorruptionError` on any mismatch or length discrepancy.
    pub fn parse_and_verify(bytes: &[u8], path: &std::path::Path) -> Result<Self> {
        if bytes.len() != STATS_RECORD_SIZE {
            return Err(Error::corruption(
                path,
                format!(
                    "stats file is {} bytes, expected {}",
                    bytes.len(),
                    STATS_RECORD_SIZE
                ),
            ));
        }
        let mut cursor = bytes;
        let stats = Self::read_from(&mut cursor).map_err(|e| Error::io(path, e))?;
        let expected = Self::checksum_of_record_image(bytes);
        if expected != stats.checksum {
            return Err(Error::corruption(
                path,
                format!("checksum mismatch: stored {}, computed {}", stats.checksum, expected),
            ));
        }
        Ok(stats)
    }

    fn divide(numer: f64, denom: u64) -> f64 {
        if denom == 0 {
            0.0
        } else {
            numer / denom as f64
        }
    }

    /// Aggregates several shards' stats into one: sums for counters,
    /// min/max combined by min/max, averages weighted by `num_keys`.
    /// `block_size` must agree across all inputs.
    pub fn total(all: &[Stats]) -> Result<Stats> {
        if all.is_empty() {
            return Ok(Stats::default());
        }
        let block_size = all[0].block_size;
        if all.iter().any(|s| s.block_size != block_size) {
            return Err(Error::domain("cannot aggregate stats across differing block sizes"));
        }
        let num_keys: u64 = all.iter().map(|s| s.num_keys).sum();
        let key_size_weighted: f64 = all.iter().map(|s| s.key_size_avg * s.num_keys as f64).sum();
        let list_size_weighted: f64 = all.iter().map(|s| s.list_size_avg * s.num_keys as f64).sum();
        Ok(Stats {
            block_size,
            num_blocks: all.iter().map(|s| s.num_blocks).sum(),
            num_keys,
            num_values_added: all.iter().map(|s| s.num_values_added).sum(),
            num_values_removed: all.iter().map(|s| s.num_values_removed).sum(),
            num_values_unowned: all.iter().map(|s| s.num_values_unowned).sum(),
            key_size_min: all.iter().map(|s| s.key_size_min).min().unwrap_or(0),
            key_size_max: all.iter().map(|s| s.key_size_max).max().unwrap_or(0),
            key_size_avg: Self::divide(key_size_weighted, num_keys),
            list_size_min: all.iter().map(|s| s.list_size_min).min().unwrap_or(0),
            list_size_max: all.iter().map(|s| s.list_size_max).max().unwrap_or(0),
            list_size_avg: Self::divide(list_size_weighted, num_keys),
            checksum: 0,
        })
    }

    /// Elementwise maximum across several shards' stats.
    pub fn max(all: &[Stats]) -> Stats {
        let mut out = Stats::default();
        for s in all {
            out.block_size = out.block_size.max(s.block_size);
            out.num_blocks = out.num_blocks.max(s.num_blocks);
            out.num_keys = out.num_keys.max(s.num_keys);
            out.num_values_added = out.num_values_added.max(s.num_values_added);
            out.num_values_removed = out.num_values_removed.max(s.num_values_removed);
            out.num_values_unowned = out.num_values_unowned.max(s.num_values_unowned);
            out.key_size_min = out.key_size_min.max(s.key_size_min);
            out.key_size_max = out.key_size_max.max(s.key_size_max);
            out.key_size_avg = out.key_size_avg.max(s.key_size_avg);
            out.list_size_min = out.list_size_min.max(s.list_size_min);
            out.list_size_max = out.list_size_max.max(s.list_size_max);
            out.list_size_avg = out.list_size_avg.max(s.list_size_avg);
        }
        out
    }
}
