//! FAT12/16/32 filesystem engine.
//!
//! The whole allocation table is buffered in memory and flushed back to every
//! FAT copy (or only the active one when FAT32 mirroring is disabled).
//! Directories are cached per first-cluster and written back after mutation.

use std::collections::{HashMap, HashSet};
use std::io::{Read, Seek, SeekFrom, Write};

use anyhow::Result;
use chrono::{DateTime, Utc};
use log::{debug, warn};

use super::entry::{FileAttributes, FileEntry};
use super::filesystem::{
    DiscFileSystem, FileAccess, FileMode, FileStream, FsError, FsOptions, TimeZoneSpec,
};
use super::path::{self, WildcardPattern};
use super::times;

pub(crate) const DIR_ENTRY_SIZE: usize = 32;
const ATTR_LONG_NAME: u8 = 0x0F;
const DELETED_MARKER: u8 = 0xE5;

/// Longest long file name accepted, in UTF-16 code units.
const MAX_LFN_LEN: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatType {
    Fat12,
    Fat16,
    Fat32,
}

impl FatType {
    pub fn name(&self) -> &'static str {
        match self {
            FatType::Fat12 => "FAT12",
            FatType::Fat16 => "FAT16",
            FatType::Fat32 => "FAT32",
        }
    }

    pub(crate) fn entry_bits(&self) -> u64 {
        match self {
            FatType::Fat12 => 12,
            FatType::Fat16 => 16,
            FatType::Fat32 => 32,
        }
    }

    fn end_of_chain_marker(&self) -> u32 {
        match self {
            FatType::Fat12 => 0x0FFF,
            FatType::Fat16 => 0xFFFF,
            FatType::Fat32 => 0x0FFF_FFFF,
        }
    }

    fn end_of_chain_min(&self) -> u32 {
        match self {
            FatType::Fat12 => 0x0FF8,
            FatType::Fat16 => 0xFFF8,
            FatType::Fat32 => 0x0FFF_FFF8,
        }
    }

    fn bad_cluster_marker(&self) -> u32 {
        match self {
            FatType::Fat12 => 0x0FF7,
            FatType::Fat16 => 0xFFF7,
            FatType::Fat32 => 0x0FFF_FFF7,
        }
    }
}

/// Parsed BIOS Parameter Block.
#[derive(Debug, Clone)]
pub struct FatBpb {
    pub bytes_per_sector: u64,
    pub sectors_per_cluster: u64,
    pub reserved_sectors: u64,
    pub num_fats: u8,
    pub root_entry_count: u16,
    pub total_sectors: u64,
    pub media: u8,
    pub sectors_per_fat: u64,
    /// FAT32 extended flags: bits 0-3 active FAT, bit 7 mirroring disabled.
    pub ext_flags: u16,
    pub root_cluster: u32,
    pub fs_info_sector: u16,
    pub fat_type: FatType,
    pub total_clusters: u64,
    pub label: Option<String>,
}

pub fn parse_bpb(bpb: &[u8; 512]) -> Result<FatBpb, FsError> {
    // Validate jump instruction (EB xx 90 or E9 xx xx)
    if bpb[0] != 0xEB && bpb[0] != 0xE9 {
        return Err(FsError::Corrupt(
            "invalid FAT boot sector: bad jump instruction".into(),
        ));
    }

    let bytes_per_sector = u16::from_le_bytes([bpb[11], bpb[12]]) as u64;
    if !matches!(bytes_per_sector, 512 | 1024 | 2048 | 4096) {
        return Err(FsError::Corrupt(format!(
            "invalid bytes per sector: {bytes_per_sector}"
        )));
    }

    let sectors_per_cluster = bpb[13] as u64;
    if sectors_per_cluster == 0 || !sectors_per_cluster.is_power_of_two() || sectors_per_cluster > 128
    {
        return Err(FsError::Corrupt(format!(
            "invalid sectors per cluster: {sectors_per_cluster}"
        )));
    }

    let reserved_sectors = u16::from_le_bytes([bpb[14], bpb[15]]) as u64;
    let num_fats = bpb[16];
    if num_fats == 0 {
        return Err(FsError::Corrupt("invalid FAT count: 0".into()));
    }
    let root_entry_count = u16::from_le_bytes([bpb[17], bpb[18]]);
    let media = bpb[21];

    let total_sectors_16 = u16::from_le_bytes([bpb[19], bpb[20]]) as u64;
    let total_sectors_32 = u32::from_le_bytes([bpb[32], bpb[33], bpb[34], bpb[35]]) as u64;
    let total_sectors = if total_sectors_16 != 0 {
        total_sectors_16
    } else {
        total_sectors_32
    };

    let sectors_per_fat_16 = u16::from_le_bytes([bpb[22], bpb[23]]) as u64;
    let sectors_per_fat_32 = u32::from_le_bytes([bpb[36], bpb[37], bpb[38], bpb[39]]) as u64;
    let sectors_per_fat = if sectors_per_fat_16 != 0 {
        sectors_per_fat_16
    } else {
        sectors_per_fat_32
    };
    if sectors_per_fat == 0 {
        return Err(FsError::Corrupt("invalid sectors per FAT: 0".into()));
    }

    let root_dir_sectors =
        ((root_entry_count as u64 * 32) + (bytes_per_sector - 1)) / bytes_per_sector;
    let data_start_sector = reserved_sectors + (num_fats as u64 * sectors_per_fat) + root_dir_sectors;
    let data_sectors = total_sectors.saturating_sub(data_start_sector);
    let total_clusters = data_sectors / sectors_per_cluster;

    // The variant follows from the cluster count alone, with one carve-out:
    // a BPB with a zero 16-bit FAT size and a zero root entry count is FAT32
    // format even when a compacted image holds fewer clusters than the FAT32
    // minimum.
    let fat_type = if sectors_per_fat_16 == 0 && root_entry_count == 0 {
        FatType::Fat32
    } else if total_clusters < 4085 {
        FatType::Fat12
    } else if total_clusters < 65525 {
        FatType::Fat16
    } else {
        FatType::Fat32
    };

    let (ext_flags, root_cluster, fs_info_sector) = if fat_type == FatType::Fat32 {
        (
            u16::from_le_bytes([bpb[40], bpb[41]]),
            u32::from_le_bytes([bpb[44], bpb[45], bpb[46], bpb[47]]),
            u16::from_le_bytes([bpb[48], bpb[49]]),
        )
    } else {
        (0, 0, 0)
    };

    if fat_type == FatType::Fat32 && root_cluster < 2 {
        return Err(FsError::Corrupt(format!(
            "invalid FAT32 root cluster: {root_cluster}"
        )));
    }

    let label_offset = if fat_type == FatType::Fat32 { 71 } else { 43 };
    let label_bytes = &bpb[label_offset..label_offset + 11];
    let label_str = std::str::from_utf8(label_bytes)
        .unwrap_or("")
        .trim()
        .to_string();
    let label = if label_str.is_empty() || label_str == "NO NAME" {
        None
    } else {
        Some(label_str)
    };

    Ok(FatBpb {
        bytes_per_sector,
        sectors_per_cluster,
        reserved_sectors,
        num_fats,
        root_entry_count,
        total_sectors,
        media,
        sectors_per_fat,
        ext_flags,
        root_cluster,
        fs_info_sector,
        fat_type,
        total_clusters,
        label,
    })
}

impl FatBpb {
    /// Bytes per cluster.
    pub fn cluster_size(&self) -> u64 {
        self.bytes_per_sector * self.sectors_per_cluster
    }

    fn root_dir_sectors(&self) -> u64 {
        ((self.root_entry_count as u64 * 32) + (self.bytes_per_sector - 1)) / self.bytes_per_sector
    }

    fn data_start_sector(&self) -> u64 {
        self.reserved_sectors + (self.num_fats as u64 * self.sectors_per_fat) + self.root_dir_sectors()
    }

    /// Whether every FAT copy receives writes. FAT12/16 always mirror; FAT32
    /// mirrors unless bit 7 of the extended flags is set.
    fn mirrored(&self) -> bool {
        self.fat_type != FatType::Fat32 || self.ext_flags & 0x0080 == 0
    }

    fn active_fat(&self) -> u8 {
        if self.mirrored() {
            0
        } else {
            (self.ext_flags & 0x000F) as u8
        }
    }
}

/// Interpretation of one FAT cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterValue {
    Free,
    Chain(u32),
    EndOfChain,
    Bad,
    Reserved,
}

/// Buffered image of the on-disk allocation table (one copy).
pub struct FatTable {
    fat_type: FatType,
    data: Vec<u8>,
    /// Cluster cells present: clusters 0..total_entries.
    total_entries: u32,
    next_free_hint: u32,
    dirty: bool,
}

impl FatTable {
    fn new(fat_type: FatType, data: Vec<u8>, total_clusters: u32) -> Self {
        Self {
            fat_type,
            data,
            total_entries: total_clusters + 2,
            next_free_hint: 2,
            dirty: false,
        }
    }

    pub fn raw(&self, cluster: u32) -> u32 {
        match self.fat_type {
            FatType::Fat12 => {
                let byte_off = (cluster as usize * 3) / 2;
                if byte_off + 1 >= self.data.len() {
                    return 0;
                }
                let val = u16::from_le_bytes([self.data[byte_off], self.data[byte_off + 1]]);
                if cluster & 1 == 1 {
                    (val >> 4) as u32
                } else {
                    (val & 0x0FFF) as u32
                }
            }
            FatType::Fat16 => {
                let off = cluster as usize * 2;
                if off + 1 >= self.data.len() {
                    return 0;
                }
                u16::from_le_bytes([self.data[off], self.data[off + 1]]) as u32
            }
            FatType::Fat32 => {
                let off = cluster as usize * 4;
                if off + 3 >= self.data.len() {
                    return 0;
                }
                u32::from_le_bytes([
                    self.data[off],
                    self.data[off + 1],
                    self.data[off + 2],
                    self.data[off + 3],
                ]) & 0x0FFF_FFFF
            }
        }
    }

    pub fn set_raw(&mut self, cluster: u32, value: u32) {
        match self.fat_type {
            FatType::Fat12 => {
                let byte_off = (cluster as usize * 3) / 2;
                if byte_off + 1 >= self.data.len() {
                    return;
                }
                let existing = u16::from_le_bytes([self.data[byte_off], self.data[byte_off + 1]]);
                let new_val = if cluster & 1 == 1 {
                    (existing & 0x000F) | ((value as u16) << 4)
                } else {
                    (existing & 0xF000) | (value as u16 & 0x0FFF)
                };
                self.data[byte_off..byte_off + 2].copy_from_slice(&new_val.to_le_bytes());
            }
            FatType::Fat16 => {
                let off = cluster as usize * 2;
                if off + 1 >= self.data.len() {
                    return;
                }
                self.data[off..off + 2].copy_from_slice(&(value as u16).to_le_bytes());
            }
            FatType::Fat32 => {
                let off = cluster as usize * 4;
                if off + 3 >= self.data.len() {
                    return;
                }
                // Preserve the reserved upper 4 bits
                let existing = u32::from_le_bytes([
                    self.data[off],
                    self.data[off + 1],
                    self.data[off + 2],
                    self.data[off + 3],
                ]);
                let new_val = (existing & 0xF000_0000) | (value & 0x0FFF_FFFF);
                self.data[off..off + 4].copy_from_slice(&new_val.to_le_bytes());
            }
        }
        self.dirty = true;
    }

    /// Interpret the cell for `cluster`.
    pub fn value(&self, cluster: u32) -> ClusterValue {
        let raw = self.raw(cluster);
        if raw == 0 {
            ClusterValue::Free
        } else if raw == self.fat_type.bad_cluster_marker() {
            ClusterValue::Bad
        } else if raw >= self.fat_type.end_of_chain_min() {
            ClusterValue::EndOfChain
        } else if raw >= 2 && raw < self.total_entries {
            ClusterValue::Chain(raw)
        } else {
            ClusterValue::Reserved
        }
    }

    pub fn set_next(&mut self, cluster: u32, next: u32) {
        self.set_raw(cluster, next);
    }

    pub fn mark_end_of_chain(&mut self, cluster: u32) {
        self.set_raw(cluster, self.fat_type.end_of_chain_marker());
    }

    pub fn mark_free(&mut self, cluster: u32) {
        self.set_raw(cluster, 0);
        if cluster < self.next_free_hint {
            self.next_free_hint = cluster;
        }
    }

    /// Claim any free cluster, mark it end-of-chain, and return it.
    ///
    /// Linear scan from the last-allocation hint, wrapping once.
    pub fn allocate(&mut self) -> Result<u32, FsError> {
        let start = self.next_free_hint.max(2);
        let candidates = (start..self.total_entries).chain(2..start);
        for cluster in candidates {
            if self.raw(cluster) == 0 {
                self.mark_end_of_chain(cluster);
                self.next_free_hint = cluster + 1;
                return Ok(cluster);
            }
        }
        Err(FsError::NoSpace("no free clusters".into()))
    }

    /// Allocate a cluster and link it after `tail`.
    pub fn extend_chain(&mut self, tail: u32) -> Result<u32, FsError> {
        let new_tail = self.allocate()?;
        self.set_next(tail, new_tail);
        Ok(new_tail)
    }

    /// Walk a chain from `head` to its end-of-chain marker.
    ///
    /// A cycle, a free cell, or a reserved cell mid-chain is structural
    /// corruption. A bad-cluster marker terminates the walk.
    pub fn chain(&self, head: u32) -> Result<Vec<u32>, FsError> {
        let mut clusters = Vec::new();
        let mut cluster = head;
        loop {
            if cluster < 2 || cluster >= self.total_entries {
                return Err(FsError::Corrupt(format!(
                    "cluster {cluster} out of range in chain starting at {head}"
                )));
            }
            if clusters.len() as u32 >= self.total_entries {
                return Err(FsError::Corrupt(format!(
                    "cyclic cluster chain starting at {head}"
                )));
            }
            clusters.push(cluster);
            match self.value(cluster) {
                ClusterValue::Chain(next) => cluster = next,
                ClusterValue::EndOfChain | ClusterValue::Bad => break,
                ClusterValue::Free | ClusterValue::Reserved => {
                    return Err(FsError::Corrupt(format!(
                        "chain starting at {head} runs into unallocated cluster {cluster}"
                    )));
                }
            }
        }
        Ok(clusters)
    }

    /// Free every cluster of the chain starting at `head`. Encountering a bad
    /// cluster stops the walk (its marker is left in place); a cycle fails
    /// fast — a revisited cluster reads back as already free.
    pub fn free_chain(&mut self, head: u32) -> Result<u32, FsError> {
        let mut cluster = head;
        let mut freed = 0u32;
        loop {
            if cluster < 2 || cluster >= self.total_entries {
                return Err(FsError::Corrupt(format!(
                    "cluster {cluster} out of range while freeing chain at {head}"
                )));
            }
            match self.value(cluster) {
                ClusterValue::Free | ClusterValue::Reserved => {
                    return Err(FsError::Corrupt(format!(
                        "cyclic or broken chain at {head}: cluster {cluster} not allocated"
                    )));
                }
                ClusterValue::Bad => break,
                value => {
                    self.mark_free(cluster);
                    freed += 1;
                    match value {
                        ClusterValue::Chain(next) => cluster = next,
                        _ => break,
                    }
                }
            }
        }
        Ok(freed)
    }

    /// Number of free clusters.
    pub fn free_count(&self) -> u32 {
        (2..self.total_entries)
            .filter(|&c| self.raw(c) == 0)
            .count() as u32
    }

    fn next_free(&self) -> u32 {
        self.next_free_hint
    }
}

// ---------------------------------------------------------------------------
// Directory model
// ---------------------------------------------------------------------------

/// A parsed directory entry together with its slot positions.
#[derive(Debug, Clone)]
pub struct DirSlotEntry {
    /// Slot index of the 8.3 entry.
    pub slot: usize,
    /// Slot index where the entry's LFN group starts (== `slot` without LFN).
    pub lfn_first: usize,
    /// Display name: the long name when present, else the 8.3 name.
    pub name: String,
    pub short_name: String,
    pub short_raw: [u8; 11],
    pub attrs: u8,
    pub first_cluster: u32,
    pub size: u32,
    pub created: Option<DateTime<Utc>>,
    pub modified: Option<DateTime<Utc>>,
    pub accessed: Option<DateTime<Utc>>,
}

impl DirSlotEntry {
    pub fn is_directory(&self) -> bool {
        self.attrs & FileAttributes::DIRECTORY != 0
    }

    fn has_lfn(&self) -> bool {
        self.lfn_first != self.slot
    }
}

/// One directory's slot buffer, cached in memory.
///
/// `key` is the first cluster, with 0 standing for the fixed FAT12/16 root
/// region. For cluster-backed directories the buffer always covers the whole
/// chain.
struct FatDirectory {
    chain: Vec<u32>,
    data: Vec<u8>,
    dirty: bool,
}

impl FatDirectory {
    fn slot(&self, index: usize) -> &[u8] {
        &self.data[index * DIR_ENTRY_SIZE..(index + 1) * DIR_ENTRY_SIZE]
    }

    fn slot_mut(&mut self, index: usize) -> &mut [u8] {
        self.dirty = true;
        &mut self.data[index * DIR_ENTRY_SIZE..(index + 1) * DIR_ENTRY_SIZE]
    }

    fn slot_count(&self) -> usize {
        self.data.len() / DIR_ENTRY_SIZE
    }

    /// Parse the listable entries: dot entries and volume labels are skipped.
    fn parse_entries(&self, tz: TimeZoneSpec) -> Vec<DirSlotEntry> {
        let mut entries = Vec::new();
        // Accumulated LFN slots: (ordinal, chars), plus group bookkeeping
        let mut lfn_parts: Vec<(u8, Vec<u16>)> = Vec::new();
        let mut lfn_start: Option<usize> = None;
        let mut lfn_checksum: Option<u8> = None;

        for i in 0..self.slot_count() {
            let slot = self.slot(i);

            if slot[0] == 0x00 {
                break;
            }
            if slot[0] == DELETED_MARKER {
                lfn_parts.clear();
                lfn_start = None;
                lfn_checksum = None;
                continue;
            }

            let attr = slot[11];

            if attr & 0x3F == ATTR_LONG_NAME {
                let seq = slot[0] & 0x3F;
                if slot[0] & 0x40 != 0 {
                    lfn_parts.clear();
                    lfn_start = Some(i);
                    lfn_checksum = Some(slot[13]);
                    lfn_parts.push((seq, lfn_slot_chars(slot)));
                } else if lfn_start.is_some() && lfn_checksum == Some(slot[13]) {
                    lfn_parts.push((seq, lfn_slot_chars(slot)));
                } else {
                    // Orphaned continuation slot
                    lfn_parts.clear();
                    lfn_start = None;
                    lfn_checksum = None;
                }
                continue;
            }

            if attr & FileAttributes::VOLUME_ID != 0 {
                lfn_parts.clear();
                lfn_start = None;
                continue;
            }

            let mut short_raw = [0u8; 11];
            short_raw.copy_from_slice(&slot[0..11]);
            let short_name = display_short_name(&short_raw);

            if short_name == "." || short_name == ".." {
                lfn_parts.clear();
                lfn_start = None;
                continue;
            }

            // Assemble the long name, dropping it on checksum mismatch
            let long_name = if !lfn_parts.is_empty() && lfn_checksum == Some(lfn_checksum_of(&short_raw))
            {
                lfn_parts.sort_by_key(|&(seq, _)| seq);
                let units: Vec<u16> = lfn_parts
                    .iter()
                    .flat_map(|(_, chars)| chars.iter().copied())
                    .collect();
                String::from_utf16_lossy(&units)
            } else {
                String::new()
            };

            let cluster_hi = u16::from_le_bytes([slot[20], slot[21]]) as u32;
            let cluster_lo = u16::from_le_bytes([slot[26], slot[27]]) as u32;
            let first_cluster = (cluster_hi << 16) | cluster_lo;
            let size = u32::from_le_bytes([slot[28], slot[29], slot[30], slot[31]]);

            let created = times::decode_dos_datetime(
                u16::from_le_bytes([slot[16], slot[17]]),
                u16::from_le_bytes([slot[14], slot[15]]),
                slot[13],
                tz,
            );
            let accessed = times::decode_dos_datetime(
                u16::from_le_bytes([slot[18], slot[19]]),
                0,
                0,
                tz,
            );
            let modified = times::decode_dos_datetime(
                u16::from_le_bytes([slot[24], slot[25]]),
                u16::from_le_bytes([slot[22], slot[23]]),
                0,
                tz,
            );

            let (name, lfn_first) = if long_name.is_empty() {
                (short_name.clone(), i)
            } else {
                (long_name, lfn_start.unwrap_or(i))
            };

            entries.push(DirSlotEntry {
                slot: i,
                lfn_first,
                name,
                short_name,
                short_raw,
                attrs: attr,
                first_cluster,
                size,
                created,
                modified,
                accessed,
            });

            lfn_parts.clear();
            lfn_start = None;
            lfn_checksum = None;
        }

        entries
    }

    fn find(&self, name: &str, tz: TimeZoneSpec) -> Option<DirSlotEntry> {
        self.parse_entries(tz)
            .into_iter()
            .find(|e| names_equal(&e.name, name) || names_equal(&e.short_name, name))
    }

    fn short_names(&self, tz: TimeZoneSpec) -> HashSet<[u8; 11]> {
        self.parse_entries(tz)
            .iter()
            .map(|e| e.short_raw)
            .collect()
    }

    /// First run of `needed` free or deleted slots.
    fn find_free_run(&self, needed: usize) -> Option<usize> {
        let mut run_start = 0usize;
        let mut run_len = 0usize;
        for i in 0..self.slot_count() {
            let b = self.data[i * DIR_ENTRY_SIZE];
            if b == 0x00 || b == DELETED_MARKER {
                if run_len == 0 {
                    run_start = i;
                }
                run_len += 1;
                if run_len == needed {
                    return Some(run_start);
                }
            } else {
                run_len = 0;
            }
        }
        None
    }

    fn write_group(&mut self, at: usize, slots: &[[u8; DIR_ENTRY_SIZE]]) {
        for (i, slot) in slots.iter().enumerate() {
            self.slot_mut(at + i).copy_from_slice(slot);
        }
    }

    /// Mark the entry's 8.3 slot and all its LFN slots deleted.
    fn mark_deleted(&mut self, entry: &DirSlotEntry) {
        for i in entry.lfn_first..=entry.slot {
            self.slot_mut(i)[0] = DELETED_MARKER;
        }
    }
}

fn names_equal(a: &str, b: &str) -> bool {
    a.chars()
        .flat_map(char::to_uppercase)
        .eq(b.chars().flat_map(char::to_uppercase))
}

/// The 13 UTF-16 units of one LFN slot, truncated at the terminator.
fn lfn_slot_chars(slot: &[u8]) -> Vec<u16> {
    // Bytes 1-10: chars 1-5; 14-25: chars 6-11; 28-31: chars 12-13
    let positions = [
        1, 3, 5, 7, 9, 14, 16, 18, 20, 22, 24, 28, 30,
    ];
    positions
        .iter()
        .map(|&p| u16::from_le_bytes([slot[p], slot[p + 1]]))
        .take_while(|&c| c != 0x0000 && c != 0xFFFF)
        .collect()
}

/// 8-bit rotate-right checksum over the 11 short-name bytes.
pub(crate) fn lfn_checksum_of(short: &[u8; 11]) -> u8 {
    short
        .iter()
        .fold(0u8, |sum, &b| (sum >> 1).wrapping_add(sum << 7).wrapping_add(b))
}

/// Render an 8.3 name buffer as "NAME.EXT".
fn display_short_name(raw: &[u8; 11]) -> String {
    // 0x05 in the first byte escapes a real 0xE5
    let mut name_bytes = raw[0..8].to_vec();
    if name_bytes[0] == 0x05 {
        name_bytes[0] = 0xE5;
    }
    let name: String = name_bytes.iter().map(|&b| cp437_to_char(b)).collect();
    let name = name.trim_end().to_string();
    let ext: String = raw[8..11].iter().map(|&b| cp437_to_char(b)).collect();
    let ext = ext.trim_end().to_string();

    if ext.is_empty() {
        name
    } else {
        format!("{name}.{ext}")
    }
}

/// Map a character to its OEM byte for an 8.3 name. Returns `(byte, lossy)`.
fn oem_short_char(c: char) -> (u8, bool) {
    let upper = c.to_ascii_uppercase();
    match upper {
        'A'..='Z' | '0'..='9' => (upper as u8, false),
        '$' | '%' | '\'' | '-' | '_' | '@' | '~' | '`' | '!' | '(' | ')' | '{' | '}' | '^'
        | '#' | '&' => (upper as u8, false),
        _ => (b'_', true),
    }
}

/// Generate an 8.3 name for `name` avoiding collisions with `existing`.
///
/// Returns the raw 11 bytes and whether the conversion was lossy (which
/// forces a `~N` tail).
pub(crate) fn make_short_name(
    name: &str,
    existing: &HashSet<[u8; 11]>,
) -> Result<[u8; 11], FsError> {
    let trimmed = name.trim_end_matches([' ', '.']);
    if trimmed.is_empty() {
        return Err(FsError::InvalidName(name.into()));
    }

    let (base_part, ext_part) = match trimmed.rfind('.') {
        Some(idx) => (&trimmed[..idx], &trimmed[idx + 1..]),
        None => (trimmed, ""),
    };

    let mut lossy = base_part.contains('.') || base_part.contains(' ') || ext_part.contains(' ');

    let mut base: Vec<u8> = Vec::with_capacity(8);
    for c in base_part.chars().filter(|&c| c != '.' && c != ' ') {
        let (b, l) = oem_short_char(c);
        lossy |= l;
        base.push(b);
    }
    let mut ext: Vec<u8> = Vec::with_capacity(3);
    for c in ext_part.chars().filter(|&c| c != ' ') {
        let (b, l) = oem_short_char(c);
        lossy |= l;
        ext.push(b);
    }

    if base.is_empty() {
        return Err(FsError::InvalidName(name.into()));
    }
    if base.len() > 8 {
        base.truncate(8);
        lossy = true;
    }
    if ext.len() > 3 {
        ext.truncate(3);
        lossy = true;
    }

    let pack = |base: &[u8], ext: &[u8]| -> [u8; 11] {
        let mut raw = [b' '; 11];
        raw[..base.len()].copy_from_slice(base);
        raw[8..8 + ext.len()].copy_from_slice(ext);
        raw
    };

    if !lossy {
        let candidate = pack(&base, &ext);
        if !existing.contains(&candidate) {
            return Ok(candidate);
        }
    }

    // Numeric tail: truncate to leave room for "~N"
    for n in 1u32..=999_999 {
        let tail = format!("~{n}");
        let keep = base.len().min(8 - tail.len());
        let mut tailed = base[..keep].to_vec();
        tailed.extend_from_slice(tail.as_bytes());
        let candidate = pack(&tailed, &ext);
        if !existing.contains(&candidate) {
            return Ok(candidate);
        }
    }

    Err(FsError::InvalidName(format!(
        "no available short-name alias for '{name}'"
    )))
}

/// Build the LFN slot group for `name`, last ordinal first.
fn build_lfn_slots(name: &str, checksum: u8) -> Result<Vec<[u8; DIR_ENTRY_SIZE]>, FsError> {
    let units: Vec<u16> = name.encode_utf16().collect();
    if units.is_empty() || units.len() > MAX_LFN_LEN {
        return Err(FsError::InvalidName(name.into()));
    }

    let count = (units.len() + 12) / 13;
    let mut slots = Vec::with_capacity(count);

    for ordinal in (1..=count).rev() {
        let mut slot = [0u8; DIR_ENTRY_SIZE];
        slot[0] = ordinal as u8 | if ordinal == count { 0x40 } else { 0 };
        slot[11] = ATTR_LONG_NAME;
        slot[13] = checksum;

        let start = (ordinal - 1) * 13;
        let positions = [1, 3, 5, 7, 9, 14, 16, 18, 20, 22, 24, 28, 30];
        for (i, &p) in positions.iter().enumerate() {
            let unit = match units.get(start + i) {
                Some(&u) => u,
                None if start + i == units.len() => 0x0000,
                None => 0xFFFF,
            };
            slot[p..p + 2].copy_from_slice(&unit.to_le_bytes());
        }
        slots.push(slot);
    }

    Ok(slots)
}

fn build_short_slot(
    short_raw: &[u8; 11],
    attrs: u8,
    first_cluster: u32,
    size: u32,
    created: (u16, u16, u8),
    accessed_date: u16,
    modified: (u16, u16),
) -> [u8; DIR_ENTRY_SIZE] {
    let mut slot = [0u8; DIR_ENTRY_SIZE];
    slot[0..11].copy_from_slice(short_raw);
    if slot[0] == 0xE5 {
        slot[0] = 0x05;
    }
    slot[11] = attrs;
    slot[13] = created.2;
    slot[14..16].copy_from_slice(&created.1.to_le_bytes());
    slot[16..18].copy_from_slice(&created.0.to_le_bytes());
    slot[18..20].copy_from_slice(&accessed_date.to_le_bytes());
    slot[20..22].copy_from_slice(&((first_cluster >> 16) as u16).to_le_bytes());
    slot[22..24].copy_from_slice(&modified.1.to_le_bytes());
    slot[24..26].copy_from_slice(&modified.0.to_le_bytes());
    slot[26..28].copy_from_slice(&((first_cluster & 0xFFFF) as u16).to_le_bytes());
    slot[28..32].copy_from_slice(&size.to_le_bytes());
    slot
}

// ---------------------------------------------------------------------------
// Filesystem
// ---------------------------------------------------------------------------

/// FAT12/16/32 filesystem over a seekable stream.
pub struct FatFilesystem<R: Read + Write + Seek> {
    reader: R,
    /// Byte offset of the volume within the stream.
    partition_offset: u64,
    bpb: FatBpb,
    table: FatTable,
    /// Directory cache keyed by first cluster (0 = fixed FAT12/16 root).
    dirs: HashMap<u32, FatDirectory>,
    options: FsOptions,
}

impl<R: Read + Write + Seek> FatFilesystem<R> {
    /// Open a FAT volume at `partition_offset` within `reader`.
    pub fn open(reader: R, partition_offset: u64) -> Result<Self, FsError> {
        Self::open_with_options(reader, partition_offset, FsOptions::default())
    }

    pub fn open_with_options(
        mut reader: R,
        partition_offset: u64,
        options: FsOptions,
    ) -> Result<Self, FsError> {
        reader.seek(SeekFrom::Start(partition_offset))?;
        let mut sector = [0u8; 512];
        reader
            .read_exact(&mut sector)
            .map_err(|e| FsError::Corrupt(format!("cannot read boot sector: {e}")))?;
        let bpb = parse_bpb(&sector)?;

        // Buffer the active FAT copy
        let fat_bytes = (bpb.sectors_per_fat * bpb.bytes_per_sector) as usize;
        let fat_start = partition_offset
            + (bpb.reserved_sectors + bpb.active_fat() as u64 * bpb.sectors_per_fat)
                * bpb.bytes_per_sector;
        reader.seek(SeekFrom::Start(fat_start))?;
        let mut fat_data = vec![0u8; fat_bytes];
        reader.read_exact(&mut fat_data)?;

        let table = FatTable::new(bpb.fat_type, fat_data, bpb.total_clusters as u32);

        debug!(
            "opened {} volume: {} clusters of {} bytes",
            bpb.fat_type.name(),
            bpb.total_clusters,
            bpb.cluster_size()
        );

        Ok(Self {
            reader,
            partition_offset,
            bpb,
            table,
            dirs: HashMap::new(),
            options,
        })
    }

    /// The parsed BIOS parameter block.
    pub fn bpb(&self) -> &FatBpb {
        &self.bpb
    }

    pub fn fat_type(&self) -> FatType {
        self.bpb.fat_type
    }

    /// Number of unallocated clusters.
    pub fn free_cluster_count(&self) -> u32 {
        self.table.free_count()
    }

    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sector_offset(&self, sector: u64) -> u64 {
        self.partition_offset + sector * self.bpb.bytes_per_sector
    }

    fn cluster_offset(&self, cluster: u32) -> u64 {
        let first_sector =
            self.bpb.data_start_sector() + (cluster as u64 - 2) * self.bpb.sectors_per_cluster;
        self.sector_offset(first_sector)
    }

    fn cluster_size(&self) -> u64 {
        self.bpb.cluster_size()
    }

    fn root_key(&self) -> u32 {
        if self.bpb.fat_type == FatType::Fat32 {
            self.bpb.root_cluster
        } else {
            0
        }
    }

    fn check_writable(&self) -> Result<(), FsError> {
        if self.options.read_only {
            return Err(FsError::ReadOnly("volume opened read-only".into()));
        }
        Ok(())
    }

    fn read_cluster(&mut self, cluster: u32) -> Result<Vec<u8>, FsError> {
        let offset = self.cluster_offset(cluster);
        self.reader.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; self.cluster_size() as usize];
        self.reader.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn read_cluster_slice(
        &mut self,
        cluster: u32,
        offset_in_cluster: u64,
        buf: &mut [u8],
    ) -> Result<(), FsError> {
        let offset = self.cluster_offset(cluster) + offset_in_cluster;
        self.reader.seek(SeekFrom::Start(offset))?;
        self.reader.read_exact(buf)?;
        Ok(())
    }

    fn write_cluster_slice(
        &mut self,
        cluster: u32,
        offset_in_cluster: u64,
        data: &[u8],
    ) -> Result<(), FsError> {
        let offset = self.cluster_offset(cluster) + offset_in_cluster;
        self.reader.seek(SeekFrom::Start(offset))?;
        self.reader.write_all(data)?;
        Ok(())
    }

    fn zero_cluster(&mut self, cluster: u32) -> Result<(), FsError> {
        let zeros = vec![0u8; self.cluster_size() as usize];
        self.write_cluster_slice(cluster, 0, &zeros)
    }

    /// Read the fixed FAT12/16 root directory region.
    fn read_root_region(&mut self) -> Result<Vec<u8>, FsError> {
        let root_start =
            self.bpb.reserved_sectors + self.bpb.num_fats as u64 * self.bpb.sectors_per_fat;
        let root_size = self.bpb.root_entry_count as u64 * DIR_ENTRY_SIZE as u64;
        let offset = self.sector_offset(root_start);
        self.reader.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; root_size as usize];
        self.reader.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn load_dir(&mut self, key: u32) -> Result<(), FsError> {
        if self.dirs.contains_key(&key) {
            return Ok(());
        }
        let dir = if key == 0 {
            FatDirectory {
                chain: Vec::new(),
                data: self.read_root_region()?,
                dirty: false,
            }
        } else {
            let chain = self.table.chain(key)?;
            let mut data = Vec::with_capacity(chain.len() * self.cluster_size() as usize);
            for &c in &chain {
                data.extend_from_slice(&self.read_cluster(c)?);
            }
            FatDirectory {
                chain,
                data,
                dirty: false,
            }
        };
        self.dirs.insert(key, dir);
        Ok(())
    }

    fn dir_entries(&mut self, key: u32) -> Result<Vec<DirSlotEntry>, FsError> {
        self.load_dir(key)?;
        let tz = self.options.time_zone;
        Ok(self.dirs[&key].parse_entries(tz))
    }

    fn dir_find(&mut self, key: u32, name: &str) -> Result<Option<DirSlotEntry>, FsError> {
        self.load_dir(key)?;
        let tz = self.options.time_zone;
        Ok(self.dirs[&key].find(name, tz))
    }

    /// Resolve a directory path to its cache key.
    fn resolve_dir_key(&mut self, dir_path: &str) -> Result<u32, FsError> {
        let components = path::split_components(dir_path)?;
        let mut key = self.root_key();
        for component in components {
            match self.dir_find(key, component)? {
                None => return Err(FsError::NotFound(dir_path.into())),
                Some(e) if !e.is_directory() => {
                    return Err(FsError::NotADirectory(dir_path.into()))
                }
                Some(e) => {
                    if e.first_cluster < 2 {
                        return Err(FsError::Corrupt(format!(
                            "directory '{}' has invalid first cluster {}",
                            e.name, e.first_cluster
                        )));
                    }
                    key = e.first_cluster;
                }
            }
        }
        Ok(key)
    }

    /// Resolve a non-root path to (parent directory key, entry).
    fn resolve_entry(&mut self, full_path: &str) -> Result<(u32, DirSlotEntry), FsError> {
        let (parent, name) = path::parent_and_name(full_path)?;
        let parent_key = self.resolve_dir_key(&parent)?;
        match self.dir_find(parent_key, &name)? {
            Some(e) => Ok((parent_key, e)),
            None => Err(FsError::NotFound(full_path.into())),
        }
    }

    fn update_slot(
        &mut self,
        dir_key: u32,
        slot: usize,
        update: impl FnOnce(&mut [u8]),
    ) -> Result<(), FsError> {
        self.load_dir(dir_key)?;
        let dir = self.dirs.get_mut(&dir_key).expect("directory just loaded");
        update(dir.slot_mut(slot));
        Ok(())
    }

    /// Register a new entry in a directory, extending the directory if needed.
    /// Returns the slot index of the 8.3 entry.
    fn add_dir_entry(
        &mut self,
        dir_key: u32,
        name: &str,
        attrs: u8,
        first_cluster: u32,
        size: u32,
        created: DateTime<Utc>,
        modified: DateTime<Utc>,
    ) -> Result<usize, FsError> {
        self.load_dir(dir_key)?;
        let tz = self.options.time_zone;

        let existing = self.dirs[&dir_key].short_names(tz);
        let short_raw = make_short_name(name, &existing)?;
        let needs_lfn = display_short_name(&short_raw) != name;

        let mut slots: Vec<[u8; DIR_ENTRY_SIZE]> = Vec::new();
        if needs_lfn {
            slots.extend(build_lfn_slots(name, lfn_checksum_of(&short_raw))?);
        }
        let created_enc = times::encode_dos_datetime(created, tz);
        let modified_enc = times::encode_dos_datetime(modified, tz);
        slots.push(build_short_slot(
            &short_raw,
            attrs,
            first_cluster,
            size,
            created_enc,
            created_enc.0,
            (modified_enc.0, modified_enc.1),
        ));

        let needed = slots.len();
        let at = match self.dirs[&dir_key].find_free_run(needed) {
            Some(at) => at,
            None => {
                if dir_key == 0 {
                    // Fixed root region cannot grow
                    return Err(FsError::NoSpace("root directory is full".into()));
                }
                let at = self.dirs[&dir_key].slot_count();
                let tail = *self.dirs[&dir_key]
                    .chain
                    .last()
                    .expect("cluster directory has a chain");
                let new_cluster = self.table.extend_chain(tail)?;
                self.zero_cluster(new_cluster)?;
                let dir = self.dirs.get_mut(&dir_key).expect("directory loaded");
                dir.chain.push(new_cluster);
                dir.data
                    .extend(std::iter::repeat(0u8).take(self.bpb.cluster_size() as usize));
                dir.dirty = true;
                at
            }
        };

        let dir = self.dirs.get_mut(&dir_key).expect("directory loaded");
        dir.write_group(at, &slots);
        Ok(at + needed - 1)
    }

    /// Create one child directory: allocate its cluster, write the dot
    /// entries, and register it in the parent.
    fn create_child_directory(&mut self, parent_key: u32, name: &str) -> Result<u32, FsError> {
        let cluster = self.table.allocate()?;
        self.zero_cluster(cluster)?;

        let now = self.now();
        let tz = self.options.time_zone;
        let stamp = times::encode_dos_datetime(now, tz);

        let mut dot = [b' '; 11];
        dot[0] = b'.';
        let mut dotdot = [b' '; 11];
        dotdot[0] = b'.';
        dotdot[1] = b'.';

        // ".." stores zero when the parent is the root
        let parent_ref = if parent_key == self.root_key() {
            0
        } else {
            parent_key
        };

        let mut data = vec![0u8; self.cluster_size() as usize];
        data[0..DIR_ENTRY_SIZE].copy_from_slice(&build_short_slot(
            &dot,
            FileAttributes::DIRECTORY,
            cluster,
            0,
            stamp,
            stamp.0,
            (stamp.0, stamp.1),
        ));
        data[DIR_ENTRY_SIZE..2 * DIR_ENTRY_SIZE].copy_from_slice(&build_short_slot(
            &dotdot,
            FileAttributes::DIRECTORY,
            parent_ref,
            0,
            stamp,
            stamp.0,
            (stamp.0, stamp.1),
        ));

        self.add_dir_entry(
            parent_key,
            name,
            FileAttributes::DIRECTORY,
            cluster,
            0,
            now,
            now,
        )?;

        self.dirs.insert(
            cluster,
            FatDirectory {
                chain: vec![cluster],
                data,
                dirty: true,
            },
        );
        Ok(cluster)
    }

    /// Rewrite the ".." entry of a moved directory.
    fn patch_dotdot(&mut self, dir_key: u32, new_parent: u32) -> Result<(), FsError> {
        self.load_dir(dir_key)?;
        let dir = self.dirs.get_mut(&dir_key).expect("directory loaded");
        if dir.slot_count() >= 2 && &dir.slot(1)[0..11] == b"..         " {
            let slot = dir.slot_mut(1);
            slot[20..22].copy_from_slice(&((new_parent >> 16) as u16).to_le_bytes());
            slot[26..28].copy_from_slice(&((new_parent & 0xFFFF) as u16).to_le_bytes());
        }
        Ok(())
    }

    fn read_entry_data(&mut self, entry: &DirSlotEntry) -> Result<Vec<u8>, FsError> {
        if entry.first_cluster < 2 {
            return Ok(Vec::new());
        }
        let chain = self.table.chain(entry.first_cluster)?;
        let mut data = Vec::with_capacity(chain.len() * self.cluster_size() as usize);
        for &c in &chain {
            data.extend_from_slice(&self.read_cluster(c)?);
        }
        data.truncate(entry.size as usize);
        Ok(data)
    }

    /// Allocate a fresh chain holding `data`, returning its head cluster
    /// (0 for empty data).
    fn write_new_chain(&mut self, data: &[u8]) -> Result<u32, FsError> {
        if data.is_empty() {
            return Ok(0);
        }
        let cluster_size = self.cluster_size() as usize;
        let mut head = 0u32;
        let mut tail = 0u32;
        for chunk in data.chunks(cluster_size) {
            let cluster = if head == 0 {
                let c = self.table.allocate()?;
                head = c;
                c
            } else {
                self.table.extend_chain(tail)?
            };
            if chunk.len() < cluster_size {
                self.zero_cluster(cluster)?;
            }
            self.write_cluster_slice(cluster, 0, chunk)?;
            tail = cluster;
        }
        Ok(head)
    }

    /// Write back a dirty directory buffer.
    fn flush_dir(&mut self, key: u32) -> Result<(), FsError> {
        let (chain, data) = {
            let dir = match self.dirs.get_mut(&key) {
                Some(d) if d.dirty => d,
                _ => return Ok(()),
            };
            dir.dirty = false;
            (dir.chain.clone(), dir.data.clone())
        };

        if key == 0 {
            let root_start =
                self.bpb.reserved_sectors + self.bpb.num_fats as u64 * self.bpb.sectors_per_fat;
            let offset = self.sector_offset(root_start);
            self.reader.seek(SeekFrom::Start(offset))?;
            self.reader.write_all(&data)?;
        } else {
            let cluster_size = self.cluster_size() as usize;
            for (i, &cluster) in chain.iter().enumerate() {
                self.write_cluster_slice(cluster, 0, &data[i * cluster_size..(i + 1) * cluster_size])?;
            }
        }
        Ok(())
    }

    /// Flush the allocation table to every FAT copy (or the active copy only
    /// when FAT32 mirroring is disabled), then refresh FSINFO.
    fn flush_table(&mut self) -> Result<(), FsError> {
        if !self.table.dirty {
            return Ok(());
        }
        let copies: Vec<u8> = if self.bpb.mirrored() {
            (0..self.bpb.num_fats).collect()
        } else {
            vec![self.bpb.active_fat()]
        };
        let fat_bytes = self.table.data.clone();
        for copy in copies {
            let offset = self.sector_offset(
                self.bpb.reserved_sectors + copy as u64 * self.bpb.sectors_per_fat,
            );
            self.reader.seek(SeekFrom::Start(offset))?;
            self.reader.write_all(&fat_bytes)?;
        }
        self.table.dirty = false;
        self.update_fsinfo()?;
        Ok(())
    }

    /// Update the FAT32 FSINFO free-count and next-free hints, when present.
    fn update_fsinfo(&mut self) -> Result<(), FsError> {
        if self.bpb.fat_type != FatType::Fat32
            || self.bpb.fs_info_sector == 0
            || self.bpb.fs_info_sector as u64 >= self.bpb.reserved_sectors
        {
            return Ok(());
        }
        let offset = self.sector_offset(self.bpb.fs_info_sector as u64);
        self.reader.seek(SeekFrom::Start(offset))?;
        let mut sector = [0u8; 512];
        self.reader.read_exact(&mut sector)?;

        let sig1 = u32::from_le_bytes([sector[0], sector[1], sector[2], sector[3]]);
        let sig2 = u32::from_le_bytes([sector[484], sector[485], sector[486], sector[487]]);
        if sig1 != 0x4161_5252 || sig2 != 0x6141_7272 {
            return Ok(());
        }

        sector[488..492].copy_from_slice(&self.table.free_count().to_le_bytes());
        sector[492..496].copy_from_slice(&self.table.next_free().to_le_bytes());
        self.reader.seek(SeekFrom::Start(offset))?;
        self.reader.write_all(&sector)?;
        Ok(())
    }

    /// Flush every pending directory and FAT mutation to the backing stream.
    pub fn sync(&mut self) -> Result<(), FsError> {
        let dirty_keys: Vec<u32> = self
            .dirs
            .iter()
            .filter(|(_, d)| d.dirty)
            .map(|(&k, _)| k)
            .collect();
        for key in dirty_keys {
            self.flush_dir(key)?;
        }
        self.flush_table()?;
        self.reader.flush()?;
        Ok(())
    }

    fn to_file_entry(&self, parent_path: &str, e: &DirSlotEntry) -> FileEntry {
        let full = path::join(parent_path, &e.name);
        let mut out = if e.is_directory() {
            FileEntry::new_directory(e.name.clone(), full, e.first_cluster as u64)
        } else {
            FileEntry::new_file(e.name.clone(), full, e.size as u64, e.first_cluster as u64)
        };
        out.attributes = FileAttributes(e.attrs & 0x3F);
        out.created = e.created;
        out.modified = e.modified;
        out.accessed = e.accessed;
        if e.has_lfn() {
            out.short_name = Some(e.short_name.clone());
        }
        out
    }

    fn delete_entry_inner(
        &mut self,
        parent_key: u32,
        entry: &DirSlotEntry,
        wipe_chain: bool,
    ) -> Result<(), FsError> {
        self.load_dir(parent_key)?;
        let dir = self.dirs.get_mut(&parent_key).expect("directory loaded");
        dir.mark_deleted(entry);
        if wipe_chain && entry.first_cluster >= 2 {
            let freed = self.table.free_chain(entry.first_cluster)?;
            debug!("freed {freed} clusters from chain {}", entry.first_cluster);
        }
        Ok(())
    }

    fn do_search(
        &mut self,
        dir_path: &str,
        dir_key: u32,
        pattern: &WildcardPattern,
        recursive: bool,
        want_files: bool,
        want_dirs: bool,
        out: &mut Vec<String>,
    ) -> Result<(), FsError> {
        for e in self.dir_entries(dir_key)? {
            let full = path::join(dir_path, &e.name);
            if e.is_directory() {
                if want_dirs && pattern.matches(&e.name) {
                    out.push(full.clone());
                }
                if recursive && e.first_cluster >= 2 {
                    self.do_search(
                        &full,
                        e.first_cluster,
                        pattern,
                        recursive,
                        want_files,
                        want_dirs,
                        out,
                    )?;
                }
            } else if want_files && pattern.matches(&e.name) {
                out.push(full);
            }
        }
        Ok(())
    }

    fn search(
        &mut self,
        dir_path: &str,
        pattern: &str,
        recursive: bool,
        want_files: bool,
        want_dirs: bool,
    ) -> Result<Vec<String>, FsError> {
        let key = self.resolve_dir_key(dir_path)?;
        let compiled = WildcardPattern::new(pattern)?;
        let root_norm = if path::is_root(dir_path) {
            "\\".to_string()
        } else {
            dir_path.to_string()
        };
        let mut out = Vec::new();
        self.do_search(
            &root_norm,
            key,
            &compiled,
            recursive,
            want_files,
            want_dirs,
            &mut out,
        )?;
        Ok(out)
    }
}

impl<R: Read + Write + Seek> Drop for FatFilesystem<R> {
    fn drop(&mut self) {
        if let Err(e) = self.sync() {
            warn!("failed to flush FAT volume on drop: {e}");
        }
    }
}

impl<R: Read + Write + Seek> DiscFileSystem for FatFilesystem<R> {
    fn friendly_name(&self) -> &str {
        self.bpb.fat_type.name()
    }

    fn can_write(&self) -> bool {
        !self.options.read_only
    }

    fn volume_label(&self) -> Option<&str> {
        self.bpb.label.as_deref()
    }

    fn total_size(&self) -> u64 {
        self.bpb.total_sectors * self.bpb.bytes_per_sector
    }

    fn free_space(&mut self) -> Result<u64, FsError> {
        Ok(self.table.free_count() as u64 * self.cluster_size())
    }

    fn root(&mut self) -> Result<FileEntry, FsError> {
        let mut root = FileEntry::root();
        root.location = self.root_key() as u64;
        Ok(root)
    }

    fn file_info(&mut self, file_path: &str) -> Result<FileEntry, FsError> {
        if path::is_root(file_path) {
            return self.root();
        }
        let (parent, _) = path::parent_and_name(file_path)?;
        let (_, e) = self.resolve_entry(file_path)?;
        Ok(self.to_file_entry(if path::is_root(&parent) { "\\" } else { &parent }, &e))
    }

    fn file_exists(&mut self, file_path: &str) -> Result<bool, FsError> {
        if path::is_root(file_path) {
            return Ok(false);
        }
        match self.resolve_entry(file_path) {
            Ok((_, e)) => Ok(!e.is_directory()),
            Err(FsError::NotFound(_)) | Err(FsError::NotADirectory(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn directory_exists(&mut self, dir_path: &str) -> Result<bool, FsError> {
        if path::is_root(dir_path) {
            return Ok(true);
        }
        match self.resolve_entry(dir_path) {
            Ok((_, e)) => Ok(e.is_directory()),
            Err(FsError::NotFound(_)) | Err(FsError::NotADirectory(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn file_length(&mut self, file_path: &str) -> Result<u64, FsError> {
        let (_, e) = self.resolve_entry(file_path)?;
        if e.is_directory() {
            return Err(FsError::IsADirectory(file_path.into()));
        }
        Ok(e.size as u64)
    }

    fn attributes(&mut self, file_path: &str) -> Result<FileAttributes, FsError> {
        if path::is_root(file_path) {
            return Ok(FileAttributes(FileAttributes::DIRECTORY));
        }
        let (_, e) = self.resolve_entry(file_path)?;
        Ok(FileAttributes(e.attrs & 0x3F))
    }

    fn set_attributes(&mut self, file_path: &str, attrs: FileAttributes) -> Result<(), FsError> {
        self.check_writable()?;
        if path::is_root(file_path) {
            return Err(FsError::Unsupported(
                "cannot set attributes on the root directory".into(),
            ));
        }
        let (parent_key, e) = self.resolve_entry(file_path)?;
        // Directory and volume bits are structural, not caller-settable
        let keep = e.attrs & (FileAttributes::DIRECTORY | FileAttributes::VOLUME_ID);
        let settable = attrs.bits()
            & (FileAttributes::READ_ONLY
                | FileAttributes::HIDDEN
                | FileAttributes::SYSTEM
                | FileAttributes::ARCHIVE);
        self.update_slot(parent_key, e.slot, |slot| slot[11] = keep | settable)?;
        self.sync()
    }

    fn creation_time_utc(&mut self, file_path: &str) -> Result<DateTime<Utc>, FsError> {
        let (_, e) = self.resolve_entry(file_path)?;
        e.created
            .ok_or_else(|| FsError::NotFound(format!("no creation time on '{file_path}'")))
    }

    fn last_access_time_utc(&mut self, file_path: &str) -> Result<DateTime<Utc>, FsError> {
        let (_, e) = self.resolve_entry(file_path)?;
        e.accessed
            .ok_or_else(|| FsError::NotFound(format!("no access time on '{file_path}'")))
    }

    fn last_write_time_utc(&mut self, file_path: &str) -> Result<DateTime<Utc>, FsError> {
        let (_, e) = self.resolve_entry(file_path)?;
        e.modified
            .ok_or_else(|| FsError::NotFound(format!("no write time on '{file_path}'")))
    }

    fn set_creation_time_utc(
        &mut self,
        file_path: &str,
        when: DateTime<Utc>,
    ) -> Result<(), FsError> {
        self.check_writable()?;
        let (parent_key, e) = self.resolve_entry(file_path)?;
        let (date, time, tenths) = times::encode_dos_datetime(when, self.options.time_zone);
        self.update_slot(parent_key, e.slot, |slot| {
            slot[13] = tenths;
            slot[14..16].copy_from_slice(&time.to_le_bytes());
            slot[16..18].copy_from_slice(&date.to_le_bytes());
        })?;
        self.sync()
    }

    fn set_last_access_time_utc(
        &mut self,
        file_path: &str,
        when: DateTime<Utc>,
    ) -> Result<(), FsError> {
        self.check_writable()?;
        let (parent_key, e) = self.resolve_entry(file_path)?;
        let (date, _, _) = times::encode_dos_datetime(when, self.options.time_zone);
        self.update_slot(parent_key, e.slot, |slot| {
            slot[18..20].copy_from_slice(&date.to_le_bytes());
        })?;
        self.sync()
    }

    fn set_last_write_time_utc(
        &mut self,
        file_path: &str,
        when: DateTime<Utc>,
    ) -> Result<(), FsError> {
        self.check_writable()?;
        let (parent_key, e) = self.resolve_entry(file_path)?;
        let (date, time, _) = times::encode_dos_datetime(when, self.options.time_zone);
        self.update_slot(parent_key, e.slot, |slot| {
            slot[22..24].copy_from_slice(&time.to_le_bytes());
            slot[24..26].copy_from_slice(&date.to_le_bytes());
        })?;
        self.sync()
    }

    fn open_file<'a>(
        &'a mut self,
        file_path: &str,
        mode: FileMode,
        access: FileAccess,
    ) -> Result<Box<dyn FileStream + 'a>, FsError> {
        if path::is_root(file_path) {
            return Err(FsError::IsADirectory(file_path.into()));
        }
        let (parent, name) = path::parent_and_name(file_path)?;
        let parent_key = self.resolve_dir_key(&parent)?;
        let existing = self.dir_find(parent_key, &name)?;

        if let Some(e) = &existing {
            if e.is_directory() {
                return Err(FsError::IsADirectory(file_path.into()));
            }
        }

        let creates = existing.is_none()
            && matches!(
                mode,
                FileMode::OpenOrCreate | FileMode::Create | FileMode::CreateNew | FileMode::Append
            );
        let truncates = existing.is_some() && matches!(mode, FileMode::Create | FileMode::Truncate);
        if access.writes() || creates || truncates {
            self.check_writable()?;
        }

        let entry = match (existing, mode) {
            (Some(_), FileMode::CreateNew) => {
                return Err(FsError::AlreadyExists(file_path.into()))
            }
            (Some(e), FileMode::Create) | (Some(e), FileMode::Truncate) => {
                if e.first_cluster >= 2 {
                    self.table.free_chain(e.first_cluster)?;
                }
                self.update_slot(parent_key, e.slot, |slot| {
                    slot[20..22].copy_from_slice(&0u16.to_le_bytes());
                    slot[26..28].copy_from_slice(&0u16.to_le_bytes());
                    slot[28..32].copy_from_slice(&0u32.to_le_bytes());
                })?;
                let mut e = e;
                e.first_cluster = 0;
                e.size = 0;
                e
            }
            (Some(e), _) => e,
            (None, FileMode::Open) | (None, FileMode::Truncate) => {
                return Err(FsError::NotFound(file_path.into()))
            }
            (None, _) => {
                let now = self.now();
                let slot = self.add_dir_entry(
                    parent_key,
                    &name,
                    FileAttributes::ARCHIVE,
                    0,
                    0,
                    now,
                    now,
                )?;
                self.dir_find(parent_key, &name)?
                    .ok_or_else(|| FsError::Corrupt(format!("entry vanished at slot {slot}")))?
            }
        };

        let chain = if entry.first_cluster >= 2 {
            self.table.chain(entry.first_cluster)?
        } else {
            Vec::new()
        };
        let size = entry.size;
        let pos = if mode == FileMode::Append {
            size as u64
        } else {
            0
        };

        Ok(Box::new(FatFile {
            fs: self,
            parent_key,
            slot: entry.slot,
            chain,
            first_cluster: entry.first_cluster,
            size,
            pos,
            readable: !matches!(access, FileAccess::Write),
            writable: access.writes(),
            dirty: false,
        }))
    }

    fn create_directory(&mut self, dir_path: &str) -> Result<(), FsError> {
        self.check_writable()?;
        let components = path::split_components(dir_path)?;
        let mut key = self.root_key();
        for component in &components {
            match self.dir_find(key, component)? {
                Some(e) if e.is_directory() => key = e.first_cluster,
                Some(_) => {
                    return Err(FsError::NotADirectory(dir_path.into()));
                }
                None => {
                    key = self.create_child_directory(key, component)?;
                }
            }
        }
        self.sync()
    }

    fn delete_file(&mut self, file_path: &str) -> Result<(), FsError> {
        self.check_writable()?;
        let (parent_key, e) = self.resolve_entry(file_path)?;
        if e.is_directory() {
            return Err(FsError::IsADirectory(file_path.into()));
        }
        self.delete_entry_inner(parent_key, &e, true)?;
        self.sync()
    }

    fn delete_directory(&mut self, dir_path: &str) -> Result<(), FsError> {
        self.check_writable()?;
        if path::is_root(dir_path) {
            return Err(FsError::Unsupported("cannot delete the root directory".into()));
        }
        let (parent_key, e) = self.resolve_entry(dir_path)?;
        if !e.is_directory() {
            return Err(FsError::NotADirectory(dir_path.into()));
        }
        if !self.dir_entries(e.first_cluster)?.is_empty() {
            return Err(FsError::DirectoryNotEmpty(dir_path.into()));
        }
        self.delete_entry_inner(parent_key, &e, true)?;
        self.dirs.remove(&e.first_cluster);
        self.sync()
    }

    fn copy_file(&mut self, src: &str, dest: &str, overwrite: bool) -> Result<(), FsError> {
        self.check_writable()?;
        let (_, src_entry) = self.resolve_entry(src)?;
        if src_entry.is_directory() {
            return Err(FsError::IsADirectory(src.into()));
        }
        let data = self.read_entry_data(&src_entry)?;

        let (dest_parent, dest_name) = path::parent_and_name(dest)?;
        let dest_parent_key = self.resolve_dir_key(&dest_parent)?;
        if let Some(existing) = self.dir_find(dest_parent_key, &dest_name)? {
            if existing.is_directory() {
                return Err(FsError::IsADirectory(dest.into()));
            }
            if !overwrite {
                return Err(FsError::AlreadyExists(dest.into()));
            }
            self.delete_entry_inner(dest_parent_key, &existing, true)?;
        }

        let head = self.write_new_chain(&data)?;
        let now = self.now();
        self.add_dir_entry(
            dest_parent_key,
            &dest_name,
            src_entry.attrs,
            head,
            data.len() as u32,
            src_entry.created.unwrap_or(now),
            now,
        )?;
        self.sync()
    }

    fn move_file(&mut self, src: &str, dest: &str, overwrite: bool) -> Result<(), FsError> {
        self.check_writable()?;
        if names_equal(src, dest) {
            return Ok(());
        }
        let (src_parent_key, src_entry) = self.resolve_entry(src)?;
        if src_entry.is_directory() {
            return Err(FsError::IsADirectory(src.into()));
        }

        let (dest_parent, dest_name) = path::parent_and_name(dest)?;
        let dest_parent_key = self.resolve_dir_key(&dest_parent)?;
        if let Some(existing) = self.dir_find(dest_parent_key, &dest_name)? {
            if existing.is_directory() {
                return Err(FsError::IsADirectory(dest.into()));
            }
            if !overwrite {
                return Err(FsError::AlreadyExists(dest.into()));
            }
            self.delete_entry_inner(dest_parent_key, &existing, true)?;
        }

        let now = self.now();
        self.add_dir_entry(
            dest_parent_key,
            &dest_name,
            src_entry.attrs,
            src_entry.first_cluster,
            src_entry.size,
            src_entry.created.unwrap_or(now),
            src_entry.modified.unwrap_or(now),
        )?;
        // The chain now belongs to the new entry
        self.delete_entry_inner(src_parent_key, &src_entry, false)?;
        self.sync()
    }

    fn move_directory(&mut self, src: &str, dest: &str) -> Result<(), FsError> {
        self.check_writable()?;
        if names_equal(src, dest) {
            return Ok(());
        }
        // A directory cannot move into its own subtree
        let src_prefix = format!("{}\\", src.trim_end_matches('\\').to_uppercase());
        if dest.to_uppercase().starts_with(&src_prefix) {
            return Err(FsError::InvalidPath(format!(
                "cannot move '{src}' into itself"
            )));
        }

        let (src_parent_key, src_entry) = self.resolve_entry(src)?;
        if !src_entry.is_directory() {
            return Err(FsError::NotADirectory(src.into()));
        }

        let (dest_parent, dest_name) = path::parent_and_name(dest)?;
        let dest_parent_key = self.resolve_dir_key(&dest_parent)?;
        if self.dir_find(dest_parent_key, &dest_name)?.is_some() {
            return Err(FsError::AlreadyExists(dest.into()));
        }

        let now = self.now();
        self.add_dir_entry(
            dest_parent_key,
            &dest_name,
            src_entry.attrs,
            src_entry.first_cluster,
            0,
            src_entry.created.unwrap_or(now),
            src_entry.modified.unwrap_or(now),
        )?;
        self.delete_entry_inner(src_parent_key, &src_entry, false)?;

        let parent_ref = if dest_parent_key == self.root_key() {
            0
        } else {
            dest_parent_key
        };
        self.patch_dotdot(src_entry.first_cluster, parent_ref)?;
        self.sync()
    }

    fn get_files(
        &mut self,
        dir_path: &str,
        pattern: &str,
        recursive: bool,
    ) -> Result<Vec<String>, FsError> {
        self.search(dir_path, pattern, recursive, true, false)
    }

    fn get_directories(
        &mut self,
        dir_path: &str,
        pattern: &str,
        recursive: bool,
    ) -> Result<Vec<String>, FsError> {
        self.search(dir_path, pattern, recursive, false, true)
    }
}

// ---------------------------------------------------------------------------
// File stream
// ---------------------------------------------------------------------------

/// A seekable stream over one file's cluster chain.
///
/// Writes extend the chain on demand. The directory entry is written back on
/// `flush` and, best-effort, on drop.
pub struct FatFile<'a, R: Read + Write + Seek> {
    fs: &'a mut FatFilesystem<R>,
    parent_key: u32,
    slot: usize,
    chain: Vec<u32>,
    first_cluster: u32,
    size: u32,
    pos: u64,
    readable: bool,
    writable: bool,
    dirty: bool,
}

impl<R: Read + Write + Seek> FatFile<'_, R> {
    /// Make sure the chain covers cluster index `idx`, allocating and zeroing
    /// new clusters as needed.
    fn ensure_cluster(&mut self, idx: usize) -> Result<u32, FsError> {
        while self.chain.len() <= idx {
            let cluster = match self.chain.last() {
                Some(&tail) => self.fs.table.extend_chain(tail)?,
                None => {
                    let head = self.fs.table.allocate()?;
                    self.first_cluster = head;
                    self.dirty = true;
                    head
                }
            };
            self.fs.zero_cluster(cluster)?;
            self.chain.push(cluster);
        }
        Ok(self.chain[idx])
    }

    /// Zero the gap between the current size and `until` (seek-past-EOF
    /// writes must not expose stale cluster bytes).
    fn zero_gap(&mut self, until: u64) -> Result<(), FsError> {
        let cluster_size = self.fs.cluster_size();
        let mut at = self.size as u64;
        while at < until {
            let idx = (at / cluster_size) as usize;
            let in_cluster = at % cluster_size;
            let n = (cluster_size - in_cluster).min(until - at);
            // Freshly allocated clusters are already zeroed; only clusters
            // that existed before the gap need explicit clearing.
            if idx < self.chain.len() {
                let cluster = self.chain[idx];
                let zeros = vec![0u8; n as usize];
                self.fs.write_cluster_slice(cluster, in_cluster, &zeros)?;
            } else {
                self.ensure_cluster(idx)?;
            }
            at += n;
        }
        Ok(())
    }

    /// Write the directory entry back (size, head cluster, write time).
    fn flush_entry(&mut self) -> Result<(), FsError> {
        if !self.dirty {
            return Ok(());
        }
        let size = self.size;
        let first_cluster = self.first_cluster;
        let (date, time, _) =
            times::encode_dos_datetime(self.fs.now(), self.fs.options.time_zone);
        self.fs.update_slot(self.parent_key, self.slot, |slot| {
            slot[11] |= FileAttributes::ARCHIVE;
            slot[20..22].copy_from_slice(&((first_cluster >> 16) as u16).to_le_bytes());
            slot[22..24].copy_from_slice(&time.to_le_bytes());
            slot[24..26].copy_from_slice(&date.to_le_bytes());
            slot[26..28].copy_from_slice(&((first_cluster & 0xFFFF) as u16).to_le_bytes());
            slot[28..32].copy_from_slice(&size.to_le_bytes());
        })?;
        self.dirty = false;
        self.fs.sync()
    }
}

impl<R: Read + Write + Seek> Read for FatFile<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if !self.readable {
            return Err(FsError::Unsupported("stream opened write-only".into()).into_io());
        }
        if self.pos >= self.size as u64 || buf.is_empty() {
            return Ok(0);
        }
        let cluster_size = self.fs.cluster_size();
        let remaining_file = self.size as u64 - self.pos;
        let idx = (self.pos / cluster_size) as usize;
        let in_cluster = self.pos % cluster_size;
        let n = (buf.len() as u64)
            .min(remaining_file)
            .min(cluster_size - in_cluster) as usize;

        let cluster = *self.chain.get(idx).ok_or_else(|| {
            FsError::Corrupt("cluster chain shorter than file size".into()).into_io()
        })?;
        self.fs
            .read_cluster_slice(cluster, in_cluster, &mut buf[..n])
            .map_err(FsError::into_io)?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl<R: Read + Write + Seek> Write for FatFile<'_, R> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if !self.writable {
            return Err(FsError::ReadOnly("stream opened read-only".into()).into_io());
        }
        if buf.is_empty() {
            return Ok(0);
        }
        if self.pos > self.size as u64 {
            let pos = self.pos;
            self.zero_gap(pos).map_err(FsError::into_io)?;
        }

        let cluster_size = self.fs.cluster_size();
        let idx = (self.pos / cluster_size) as usize;
        let in_cluster = self.pos % cluster_size;
        let n = (buf.len() as u64).min(cluster_size - in_cluster) as usize;

        let cluster = self.ensure_cluster(idx).map_err(FsError::into_io)?;
        self.fs
            .write_cluster_slice(cluster, in_cluster, &buf[..n])
            .map_err(FsError::into_io)?;

        self.pos += n as u64;
        if self.pos > self.size as u64 {
            self.size = self.pos as u32;
        }
        self.dirty = true;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.flush_entry().map_err(FsError::into_io)
    }
}

impl<R: Read + Write + Seek> Seek for FatFile<'_, R> {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(n) => n as i64,
            SeekFrom::End(n) => self.size as i64 + n,
            SeekFrom::Current(n) => self.pos as i64 + n,
        };
        if target < 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "seek before start of file",
            ));
        }
        self.pos = target as u64;
        Ok(self.pos)
    }
}

impl<R: Read + Write + Seek> FileStream for FatFile<'_, R> {
    fn length(&mut self) -> u64 {
        self.size as u64
    }

    fn set_length(&mut self, new_length: u64) -> std::io::Result<()> {
        if !self.writable {
            return Err(FsError::ReadOnly("stream opened read-only".into()).into_io());
        }
        if new_length > u32::MAX as u64 {
            return Err(FsError::NoSpace("FAT files are limited to 4 GiB".into()).into_io());
        }
        let cluster_size = self.fs.cluster_size();
        let needed = (new_length + cluster_size - 1) / cluster_size;

        if new_length > self.size as u64 {
            let target = new_length;
            self.zero_gap(target).map_err(FsError::into_io)?;
            if needed > 0 {
                self.ensure_cluster(needed as usize - 1)
                    .map_err(FsError::into_io)?;
            }
        } else if (needed as usize) < self.chain.len() {
            if needed == 0 {
                self.fs
                    .table
                    .free_chain(self.first_cluster)
                    .map_err(FsError::into_io)?;
                self.chain.clear();
                self.first_cluster = 0;
            } else {
                let new_tail = self.chain[needed as usize - 1];
                let excess_head = self.chain[needed as usize];
                self.fs.table.mark_end_of_chain(new_tail);
                self.fs
                    .table
                    .free_chain(excess_head)
                    .map_err(FsError::into_io)?;
                self.chain.truncate(needed as usize);
            }
        }

        self.size = new_length as u32;
        self.pos = self.pos.min(new_length);
        self.dirty = true;
        Ok(())
    }
}

impl<R: Read + Write + Seek> Drop for FatFile<'_, R> {
    fn drop(&mut self) {
        if let Err(e) = self.flush_entry() {
            warn!("failed to flush file entry on drop: {e}");
        }
    }
}

// ---------------------------------------------------------------------------
// OEM code page
// ---------------------------------------------------------------------------

/// Map a single CP437 byte to a Unicode character.
fn cp437_to_char(b: u8) -> char {
    if b < 0x80 {
        b as char
    } else {
        CP437_HIGH[b as usize - 0x80]
    }
}

/// CP437 to Unicode mapping for bytes 0x80-0xFF.
#[rustfmt::skip]
const CP437_HIGH: [char; 128] = [
    // 0x80-0x8F
    'Ç','ü','é','â','ä','à','å','ç', 'ê','ë','è','ï','î','ì','Ä','Å',
    // 0x90-0x9F
    'É','æ','Æ','ô','ö','ò','û','ù', 'ÿ','Ö','Ü','¢','£','¥','₧','ƒ',
    // 0xA0-0xAF
    'á','í','ó','ú','ñ','Ñ','ª','º', '¿','⌐','¬','½','¼','¡','«','»',
    // 0xB0-0xBF
    '░','▒','▓','│','┤','╡','╢','╖', '╕','╣','║','╗','╝','╜','╛','┐',
    // 0xC0-0xCF
    '└','┴','┬','├','─','┼','╞','╟', '╚','╔','╩','╦','╠','═','╬','╧',
    // 0xD0-0xDF
    '╨','╤','╥','╙','╘','╒','╓','╫', '╪','┘','┌','█','▄','▌','▐','▀',
    // 0xE0-0xEF
    'α','ß','Γ','π','Σ','σ','µ','τ', 'Φ','Θ','Ω','δ','∞','φ','ε','∩',
    // 0xF0-0xFF
    '≡','±','≥','≤','⌠','⌡','÷','≈', '°','∙','·','√','ⁿ','²','■','\u{00A0}',
];

// ---------------------------------------------------------------------------
// Integrity validation
// ---------------------------------------------------------------------------

/// Walk every directory and chain of a FAT volume, checking chain
/// termination, double allocation, and allocation closure (every non-free
/// cluster reachable from some directory entry).
///
/// Returns a list of warnings; structural failures are reported as warnings
/// too so a scan always completes.
pub fn validate_fat_integrity<R: Read + Seek>(
    reader: &mut R,
    partition_offset: u64,
    log_cb: &mut impl FnMut(&str),
) -> Result<Vec<String>> {
    reader.seek(SeekFrom::Start(partition_offset))?;
    let mut sector = [0u8; 512];
    reader.read_exact(&mut sector)?;
    let bpb = parse_bpb(&sector).map_err(|e| anyhow::anyhow!("{e}"))?;

    let fat_bytes = (bpb.sectors_per_fat * bpb.bytes_per_sector) as usize;
    let fat_start =
        partition_offset + bpb.reserved_sectors * bpb.bytes_per_sector;
    reader.seek(SeekFrom::Start(fat_start))?;
    let mut fat_data = vec![0u8; fat_bytes];
    reader.read_exact(&mut fat_data)?;
    let table = FatTable::new(bpb.fat_type, fat_data, bpb.total_clusters as u32);

    let mut warnings = Vec::new();
    let mut claimed: HashMap<u32, String> = HashMap::new();

    // Seed the walk with the root directory
    let mut pending: Vec<(String, u32)> = Vec::new();
    let root_data = if bpb.fat_type == FatType::Fat32 {
        match claim_chain(&table, bpb.root_cluster, "\\", &mut claimed, &mut warnings) {
            Some(chain) => {
                read_clusters(reader, partition_offset, &bpb, &chain)?
            }
            None => Vec::new(),
        }
    } else {
        let root_start = bpb.reserved_sectors + bpb.num_fats as u64 * bpb.sectors_per_fat;
        let root_size = bpb.root_entry_count as usize * DIR_ENTRY_SIZE;
        reader.seek(SeekFrom::Start(
            partition_offset + root_start * bpb.bytes_per_sector,
        ))?;
        let mut buf = vec![0u8; root_size];
        reader.read_exact(&mut buf)?;
        buf
    };

    scan_directory_slots(&root_data, "\\", &mut pending, &table, &mut claimed, &mut warnings);

    while let Some((dir_path, head)) = pending.pop() {
        let chain = match claim_chain(&table, head, &dir_path, &mut claimed, &mut warnings) {
            Some(chain) => chain,
            None => continue,
        };
        let data = read_clusters(reader, partition_offset, &bpb, &chain)?;
        scan_directory_slots(&data, &dir_path, &mut pending, &table, &mut claimed, &mut warnings);
    }

    // Allocation closure: every non-free, non-bad cluster must be claimed
    let mut leaked = 0u32;
    for cluster in 2..(bpb.total_clusters as u32 + 2) {
        match table.value(cluster) {
            ClusterValue::Free | ClusterValue::Bad => {}
            _ => {
                if !claimed.contains_key(&cluster) {
                    leaked += 1;
                }
            }
        }
    }
    if leaked > 0 {
        warnings.push(format!("{leaked} allocated clusters unreachable from any directory"));
    }

    log_cb(&format!(
        "{}: {} clusters claimed, {} warnings",
        bpb.fat_type.name(),
        claimed.len(),
        warnings.len()
    ));
    Ok(warnings)
}

/// Claim every cluster of a chain, recording double-claims as warnings.
fn claim_chain(
    table: &FatTable,
    head: u32,
    owner: &str,
    claimed: &mut HashMap<u32, String>,
    warnings: &mut Vec<String>,
) -> Option<Vec<u32>> {
    match table.chain(head) {
        Ok(chain) => {
            for &c in &chain {
                if let Some(prev) = claimed.insert(c, owner.to_string()) {
                    warnings.push(format!(
                        "cluster {c} claimed by both '{prev}' and '{owner}'"
                    ));
                }
            }
            Some(chain)
        }
        Err(e) => {
            warnings.push(format!("chain at {head} ('{owner}'): {e}"));
            None
        }
    }
}

fn read_clusters<R: Read + Seek>(
    reader: &mut R,
    partition_offset: u64,
    bpb: &FatBpb,
    chain: &[u32],
) -> Result<Vec<u8>> {
    let cluster_size = bpb.cluster_size() as usize;
    let mut data = Vec::with_capacity(chain.len() * cluster_size);
    for &cluster in chain {
        let first_sector =
            bpb.data_start_sector() + (cluster as u64 - 2) * bpb.sectors_per_cluster;
        reader.seek(SeekFrom::Start(
            partition_offset + first_sector * bpb.bytes_per_sector,
        ))?;
        let mut buf = vec![0u8; cluster_size];
        reader.read_exact(&mut buf)?;
        data.extend_from_slice(&buf);
    }
    Ok(data)
}

/// Queue subdirectories and claim file chains found in raw directory data.
fn scan_directory_slots(
    data: &[u8],
    dir_path: &str,
    pending: &mut Vec<(String, u32)>,
    table: &FatTable,
    claimed: &mut HashMap<u32, String>,
    warnings: &mut Vec<String>,
) {
    for i in 0..data.len() / DIR_ENTRY_SIZE {
        let slot = &data[i * DIR_ENTRY_SIZE..(i + 1) * DIR_ENTRY_SIZE];
        if slot[0] == 0x00 {
            break;
        }
        if slot[0] == DELETED_MARKER || slot[0] == b'.' {
            continue;
        }
        let attr = slot[11];
        if attr & 0x3F == ATTR_LONG_NAME || attr & FileAttributes::VOLUME_ID != 0 {
            continue;
        }

        let cluster_hi = u16::from_le_bytes([slot[20], slot[21]]) as u32;
        let cluster_lo = u16::from_le_bytes([slot[26], slot[27]]) as u32;
        let first_cluster = (cluster_hi << 16) | cluster_lo;
        let mut short_raw = [0u8; 11];
        short_raw.copy_from_slice(&slot[0..11]);
        let full = path::join(dir_path, &display_short_name(&short_raw));

        if attr & FileAttributes::DIRECTORY != 0 {
            if first_cluster >= 2 {
                pending.push((full, first_cluster));
            } else {
                warnings.push(format!("directory '{full}' has no first cluster"));
            }
        } else if first_cluster >= 2 {
            claim_chain(table, first_cluster, &full, claimed, warnings);
        } else {
            let size = u32::from_le_bytes([slot[28], slot[29], slot[30], slot[31]]);
            if size != 0 {
                warnings.push(format!("file '{full}' has size {size} but no chain"));
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
