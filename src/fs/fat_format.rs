//! FAT volume formatter.
//!
//! Writes a fresh, empty FAT12/16/32 volume into a stream: boot sector,
//! FSINFO and backup boot sector for FAT32, initialized FAT copies, empty
//! root directory, and padding out to the requested size.

use std::io::{Read, Seek, SeekFrom, Write};

use chrono::{Datelike, Timelike, Utc};
use log::debug;

use super::fat::FatType;
use super::filesystem::FsError;

const BYTES_PER_SECTOR: u64 = 512;

/// Cylinder/head/sector disk geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskGeometry {
    pub cylinders: u32,
    pub heads_per_cylinder: u32,
    pub sectors_per_track: u32,
}

impl DiskGeometry {
    pub fn new(cylinders: u32, heads_per_cylinder: u32, sectors_per_track: u32) -> Self {
        Self {
            cylinders,
            heads_per_cylinder,
            sectors_per_track,
        }
    }

    /// Conventional large-disk geometry for an LBA-addressed image.
    pub fn lba_assumed(total_sectors: u64) -> Self {
        let cylinders = (total_sectors / (255 * 63)).max(1) as u32;
        Self::new(cylinders, 255, 63)
    }

    pub fn total_sectors(&self) -> u64 {
        self.cylinders as u64 * self.heads_per_cylinder as u64 * self.sectors_per_track as u64
    }

    /// Convert a CHS address to a logical block address.
    ///
    /// CHS sector numbers are 1-based, so the valid range is
    /// `1..=sectors_per_track`.
    pub fn to_logical_block_address(
        &self,
        cylinder: u32,
        head: u32,
        sector: u32,
    ) -> Result<u64, FsError> {
        if cylinder >= self.cylinders {
            return Err(FsError::InvalidPath(format!(
                "cylinder {cylinder} out of range (max {})",
                self.cylinders - 1
            )));
        }
        if head >= self.heads_per_cylinder {
            return Err(FsError::InvalidPath(format!(
                "head {head} out of range (max {})",
                self.heads_per_cylinder - 1
            )));
        }
        if sector < 1 || sector > self.sectors_per_track {
            return Err(FsError::InvalidPath(format!(
                "sector {sector} out of range (1..={})",
                self.sectors_per_track
            )));
        }
        Ok(
            (cylinder as u64 * self.heads_per_cylinder as u64 + head as u64)
                * self.sectors_per_track as u64
                + (sector as u64 - 1),
        )
    }
}

/// Standard FAT12 floppy presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloppyFormat {
    /// 720 KiB, 1440 sectors.
    Floppy720K,
    /// 1.44 MiB, 2880 sectors.
    Floppy144M,
    /// 2.88 MiB, 5760 sectors.
    Floppy288M,
}

impl FloppyFormat {
    fn geometry(&self) -> DiskGeometry {
        match self {
            FloppyFormat::Floppy720K => DiskGeometry::new(80, 2, 9),
            FloppyFormat::Floppy144M => DiskGeometry::new(80, 2, 18),
            FloppyFormat::Floppy288M => DiskGeometry::new(80, 2, 36),
        }
    }

    fn sectors_per_cluster(&self) -> u8 {
        match self {
            FloppyFormat::Floppy720K => 2,
            FloppyFormat::Floppy144M => 1,
            FloppyFormat::Floppy288M => 2,
        }
    }

    fn root_entries(&self) -> u16 {
        match self {
            FloppyFormat::Floppy720K => 112,
            FloppyFormat::Floppy144M => 224,
            FloppyFormat::Floppy288M => 240,
        }
    }

    fn media(&self) -> u8 {
        match self {
            FloppyFormat::Floppy720K => 0xF9,
            FloppyFormat::Floppy144M | FloppyFormat::Floppy288M => 0xF0,
        }
    }
}

/// Parameters for formatting a hard-disk FAT volume.
#[derive(Debug, Clone, Default)]
pub struct FormatOptions {
    pub label: Option<String>,
    /// Volume size in 512-byte sectors.
    pub sector_count: u64,
    /// LBA of the volume within its disk; also the write offset into the
    /// stream and the BPB hidden-sector count.
    pub first_sector: u64,
    pub geometry: Option<DiskGeometry>,
    /// Reserved sector count override (default: 1 for FAT12/16, 32 for FAT32).
    pub reserved_sectors: Option<u16>,
}

/// Full layout of a volume being formatted.
struct FormatLayout {
    fat_type: FatType,
    sectors_per_cluster: u8,
    reserved_sectors: u16,
    root_entries: u16,
    media: u8,
    sectors_per_fat: u64,
    total_sectors: u64,
    geometry: DiskGeometry,
    hidden_sectors: u32,
    label: [u8; 11],
}

const NUM_FATS: u8 = 2;
const FAT32_ROOT_CLUSTER: u32 = 2;
const FAT32_FSINFO_SECTOR: u16 = 1;
const FAT32_BACKUP_BOOT_SECTOR: u16 = 6;

/// Pick the variant and cluster size for a hard-disk volume, per the
/// standard size ladder.
fn select_layout(sector_count: u64) -> Result<(FatType, u8), FsError> {
    if sector_count <= 8400 {
        return Err(FsError::Unsupported(format!(
            "{sector_count} sectors is too small for a hard-disk FAT volume"
        )));
    }
    Ok(if sector_count <= 32_680 {
        (FatType::Fat16, 2)
    } else if sector_count <= 262_144 {
        (FatType::Fat16, 4)
    } else if sector_count <= 524_288 {
        (FatType::Fat16, 8)
    } else if sector_count < 1_048_576 {
        (FatType::Fat16, 16)
    } else if sector_count <= 532_480 {
        (FatType::Fat32, 1)
    } else if sector_count <= 16_777_216 {
        (FatType::Fat32, 8)
    } else if sector_count <= 33_554_432 {
        (FatType::Fat32, 16)
    } else if sector_count <= 67_108_864 {
        (FatType::Fat32, 32)
    } else {
        (FatType::Fat32, 64)
    })
}

/// FAT size in sectors: `ceil(numClusters * entryBits / 8 / bytesPerSector)`,
/// iterated to a fixed point since the FAT size feeds back into the size of
/// the data region.
fn compute_sectors_per_fat(
    total_sectors: u64,
    reserved_sectors: u64,
    root_dir_sectors: u64,
    sectors_per_cluster: u64,
    fat_type: FatType,
) -> u64 {
    let bits = fat_type.entry_bits();
    let mut sectors_per_fat = 1u64;
    loop {
        let data_start = reserved_sectors + NUM_FATS as u64 * sectors_per_fat + root_dir_sectors;
        let clusters = total_sectors.saturating_sub(data_start) / sectors_per_cluster;
        let fat_bytes = ((clusters + 2) * bits + 7) / 8;
        let needed = (fat_bytes + BYTES_PER_SECTOR - 1) / BYTES_PER_SECTOR;
        if needed <= sectors_per_fat {
            return sectors_per_fat;
        }
        sectors_per_fat = needed;
    }
}

fn encode_label(label: Option<&str>) -> Result<[u8; 11], FsError> {
    let mut out = [b' '; 11];
    if let Some(label) = label {
        if label.len() > 11 {
            return Err(FsError::InvalidName(format!(
                "volume label '{label}' exceeds 11 characters"
            )));
        }
        for (i, c) in label.chars().enumerate() {
            if !c.is_ascii() || c.is_ascii_lowercase() || "\"*+,./:;<=>?[\\]|".contains(c) {
                return Err(FsError::InvalidName(format!(
                    "volume label '{label}' contains invalid character {c:?}"
                )));
            }
            out[i] = c as u8;
        }
    }
    Ok(out)
}

/// Volume serial number derived from the clock, the way DOS computes it.
fn volume_serial() -> u32 {
    let now = Utc::now();
    let hi = ((now.month() as u32) << 24 | (now.day() as u32) << 16)
        .wrapping_add((now.hour() as u32) << 8 | now.minute() as u32);
    let lo = (now.year() as u32) << 16 | ((now.second() * 100 + now.nanosecond() / 10_000_000) as u32);
    hi << 16 | (hi >> 16) ^ lo
}

/// Format a hard-disk FAT16/FAT32 volume into `target`.
pub fn format_volume<W: Read + Write + Seek>(
    target: &mut W,
    options: &FormatOptions,
) -> Result<(), FsError> {
    let (fat_type, sectors_per_cluster) = select_layout(options.sector_count)?;
    let reserved_default = if fat_type == FatType::Fat32 { 32 } else { 1 };
    let reserved = options.reserved_sectors.unwrap_or(reserved_default);
    if fat_type == FatType::Fat32 && reserved <= FAT32_BACKUP_BOOT_SECTOR + 1 {
        return Err(FsError::Unsupported(format!(
            "FAT32 needs more than {} reserved sectors",
            FAT32_BACKUP_BOOT_SECTOR + 1
        )));
    }
    let root_entries = if fat_type == FatType::Fat32 { 0 } else { 512 };
    let root_dir_sectors =
        (root_entries as u64 * 32 + BYTES_PER_SECTOR - 1) / BYTES_PER_SECTOR;
    let sectors_per_fat = compute_sectors_per_fat(
        options.sector_count,
        reserved as u64,
        root_dir_sectors,
        sectors_per_cluster as u64,
        fat_type,
    );

    let layout = FormatLayout {
        fat_type,
        sectors_per_cluster,
        reserved_sectors: reserved,
        root_entries,
        media: 0xF8,
        sectors_per_fat,
        total_sectors: options.sector_count,
        geometry: options
            .geometry
            .unwrap_or_else(|| DiskGeometry::lba_assumed(options.sector_count)),
        hidden_sectors: options.first_sector as u32,
        label: encode_label(options.label.as_deref())?,
    };

    write_layout(target, options.first_sector * BYTES_PER_SECTOR, &layout)
}

/// Format a FAT12 floppy image into `target`.
pub fn format_floppy<W: Read + Write + Seek>(
    target: &mut W,
    format: FloppyFormat,
    label: Option<&str>,
) -> Result<(), FsError> {
    let geometry = format.geometry();
    let total_sectors = geometry.total_sectors();
    let root_dir_sectors =
        (format.root_entries() as u64 * 32 + BYTES_PER_SECTOR - 1) / BYTES_PER_SECTOR;
    let sectors_per_fat = compute_sectors_per_fat(
        total_sectors,
        1,
        root_dir_sectors,
        format.sectors_per_cluster() as u64,
        FatType::Fat12,
    );

    let layout = FormatLayout {
        fat_type: FatType::Fat12,
        sectors_per_cluster: format.sectors_per_cluster(),
        reserved_sectors: 1,
        root_entries: format.root_entries(),
        media: format.media(),
        sectors_per_fat,
        total_sectors,
        geometry,
        hidden_sectors: 0,
        label: encode_label(label)?,
    };

    write_layout(target, 0, &layout)
}

fn write_layout<W: Read + Write + Seek>(
    target: &mut W,
    byte_offset: u64,
    layout: &FormatLayout,
) -> Result<(), FsError> {
    let boot = build_boot_sector(layout);

    target.seek(SeekFrom::Start(byte_offset))?;
    target.write_all(&boot)?;

    if layout.fat_type == FatType::Fat32 {
        let fsinfo = build_fsinfo_sector(layout);
        target.seek(SeekFrom::Start(
            byte_offset + FAT32_FSINFO_SECTOR as u64 * BYTES_PER_SECTOR,
        ))?;
        target.write_all(&fsinfo)?;

        // Backup boot sector and backup FSINFO
        target.seek(SeekFrom::Start(
            byte_offset + FAT32_BACKUP_BOOT_SECTOR as u64 * BYTES_PER_SECTOR,
        ))?;
        target.write_all(&boot)?;
        target.write_all(&fsinfo)?;
    }

    // Initialized FAT copies
    let fat = build_fat(layout);
    for copy in 0..NUM_FATS as u64 {
        target.seek(SeekFrom::Start(
            byte_offset
                + (layout.reserved_sectors as u64 + copy * layout.sectors_per_fat)
                    * BYTES_PER_SECTOR,
        ))?;
        target.write_all(&fat)?;
    }

    // Empty root directory: fixed region for FAT12/16, cluster 2 for FAT32
    let root_offset_sectors = layout.reserved_sectors as u64
        + NUM_FATS as u64 * layout.sectors_per_fat;
    let root_bytes = if layout.fat_type == FatType::Fat32 {
        layout.sectors_per_cluster as usize * BYTES_PER_SECTOR as usize
    } else {
        layout.root_entries as usize * 32
    };
    let mut root = vec![0u8; root_bytes];
    if layout.label != [b' '; 11] {
        root[0..11].copy_from_slice(&layout.label);
        root[11] = super::entry::FileAttributes::VOLUME_ID;
    }
    target.seek(SeekFrom::Start(
        byte_offset + root_offset_sectors * BYTES_PER_SECTOR,
    ))?;
    target.write_all(&root)?;

    // Pad the stream to full volume size
    let end = byte_offset + layout.total_sectors * BYTES_PER_SECTOR;
    target.seek(SeekFrom::Start(end - 1))?;
    target.write_all(&[0u8])?;
    target.flush()?;

    debug!(
        "formatted {} volume: {} sectors, {} sectors/cluster, {} sectors/FAT",
        layout.fat_type.name(),
        layout.total_sectors,
        layout.sectors_per_cluster,
        layout.sectors_per_fat
    );
    Ok(())
}

fn build_boot_sector(layout: &FormatLayout) -> [u8; 512] {
    let mut bs = [0u8; 512];

    // Jump instruction and OEM name
    bs[0] = 0xEB;
    bs[1] = if layout.fat_type == FatType::Fat32 { 0x58 } else { 0x3C };
    bs[2] = 0x90;
    bs[3..11].copy_from_slice(b"MSDOS5.0");

    bs[11..13].copy_from_slice(&(BYTES_PER_SECTOR as u16).to_le_bytes());
    bs[13] = layout.sectors_per_cluster;
    bs[14..16].copy_from_slice(&layout.reserved_sectors.to_le_bytes());
    bs[16] = NUM_FATS;
    bs[17..19].copy_from_slice(&layout.root_entries.to_le_bytes());

    if layout.total_sectors < 0x10000 && layout.fat_type != FatType::Fat32 {
        bs[19..21].copy_from_slice(&(layout.total_sectors as u16).to_le_bytes());
    } else {
        bs[32..36].copy_from_slice(&(layout.total_sectors as u32).to_le_bytes());
    }

    bs[21] = layout.media;
    if layout.fat_type != FatType::Fat32 {
        bs[22..24].copy_from_slice(&(layout.sectors_per_fat as u16).to_le_bytes());
    }
    bs[24..26].copy_from_slice(&(layout.geometry.sectors_per_track as u16).to_le_bytes());
    bs[26..28].copy_from_slice(&(layout.geometry.heads_per_cylinder as u16).to_le_bytes());
    bs[28..32].copy_from_slice(&layout.hidden_sectors.to_le_bytes());

    let serial = volume_serial();
    if layout.fat_type == FatType::Fat32 {
        bs[36..40].copy_from_slice(&(layout.sectors_per_fat as u32).to_le_bytes());
        bs[40..42].copy_from_slice(&0u16.to_le_bytes()); // mirroring on, FAT 0 active
        bs[42..44].copy_from_slice(&0u16.to_le_bytes()); // filesystem version 0.0
        bs[44..48].copy_from_slice(&FAT32_ROOT_CLUSTER.to_le_bytes());
        bs[48..50].copy_from_slice(&FAT32_FSINFO_SECTOR.to_le_bytes());
        bs[50..52].copy_from_slice(&FAT32_BACKUP_BOOT_SECTOR.to_le_bytes());
        bs[64] = 0x80; // BIOS drive number
        bs[66] = 0x29; // extended boot signature
        bs[67..71].copy_from_slice(&serial.to_le_bytes());
        bs[71..82].copy_from_slice(&layout.label);
        bs[82..90].copy_from_slice(b"FAT32   ");
    } else {
        bs[36] = if layout.media == 0xF8 { 0x80 } else { 0x00 };
        bs[38] = 0x29;
        bs[39..43].copy_from_slice(&serial.to_le_bytes());
        bs[43..54].copy_from_slice(&layout.label);
        bs[54..62].copy_from_slice(match layout.fat_type {
            FatType::Fat12 => b"FAT12   ",
            _ => b"FAT16   ",
        });
    }

    bs[510] = 0x55;
    bs[511] = 0xAA;
    bs
}

fn build_fsinfo_sector(layout: &FormatLayout) -> [u8; 512] {
    let data_start = layout.reserved_sectors as u64
        + NUM_FATS as u64 * layout.sectors_per_fat;
    let clusters = layout.total_sectors.saturating_sub(data_start)
        / layout.sectors_per_cluster as u64;

    let mut fsinfo = [0u8; 512];
    fsinfo[0..4].copy_from_slice(&0x4161_5252u32.to_le_bytes()); // "RRaA"
    fsinfo[484..488].copy_from_slice(&0x6141_7272u32.to_le_bytes()); // "rrAa"
    // The root directory occupies one cluster already
    fsinfo[488..492].copy_from_slice(&((clusters - 1) as u32).to_le_bytes());
    fsinfo[492..496].copy_from_slice(&(FAT32_ROOT_CLUSTER + 1).to_le_bytes());
    fsinfo[508..512].copy_from_slice(&0xAA55_0000u32.to_le_bytes());
    fsinfo
}

/// One FAT copy: entry 0 carries the media descriptor, entry 1 the
/// end-of-chain marker with the clean-shutdown flag bits, and for FAT32 the
/// root cluster is marked end-of-chain.
fn build_fat(layout: &FormatLayout) -> Vec<u8> {
    let mut fat = vec![0u8; (layout.sectors_per_fat * BYTES_PER_SECTOR) as usize];
    match layout.fat_type {
        FatType::Fat12 => {
            let entry0 = 0x0F00u32 | layout.media as u32;
            let packed = entry0 | (0x0FFFu32 << 12);
            fat[0] = packed as u8;
            fat[1] = (packed >> 8) as u8;
            fat[2] = (packed >> 16) as u8;
        }
        FatType::Fat16 => {
            fat[0..2].copy_from_slice(&(0xFF00u16 | layout.media as u16).to_le_bytes());
            fat[2..4].copy_from_slice(&0xFFFFu16.to_le_bytes());
        }
        FatType::Fat32 => {
            fat[0..4].copy_from_slice(&(0x0FFF_FF00u32 | layout.media as u32).to_le_bytes());
            fat[4..8].copy_from_slice(&0x0FFF_FFFFu32.to_le_bytes());
            // Root directory cluster
            fat[8..12].copy_from_slice(&0x0FFF_FFFFu32.to_le_bytes());
        }
    }
    fat
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::fat::parse_bpb;
    use std::io::Cursor;

    #[test]
    fn test_select_layout_ladder() {
        assert!(select_layout(8400).is_err());
        assert_eq!(select_layout(8401).unwrap(), (FatType::Fat16, 2));
        assert_eq!(select_layout(32_680).unwrap(), (FatType::Fat16, 2));
        assert_eq!(select_layout(32_681).unwrap(), (FatType::Fat16, 4));
        assert_eq!(select_layout(262_145).unwrap(), (FatType::Fat16, 8));
        assert_eq!(select_layout(524_289).unwrap(), (FatType::Fat16, 16));
        assert_eq!(select_layout(1_048_576).unwrap(), (FatType::Fat32, 8));
        assert_eq!(select_layout(16_777_217).unwrap(), (FatType::Fat32, 16));
        assert_eq!(select_layout(33_554_433).unwrap(), (FatType::Fat32, 32));
        assert_eq!(select_layout(67_108_865).unwrap(), (FatType::Fat32, 64));
    }

    #[test]
    fn test_compute_sectors_per_fat_floppy() {
        // 1.44M floppy: 2880 sectors, 1 spc, 9 root sectors -> 9 sectors/FAT
        let spf = compute_sectors_per_fat(2880, 1, 14, 1, FatType::Fat12);
        assert_eq!(spf, 9);
    }

    #[test]
    fn test_chs_to_lba() {
        let g = DiskGeometry::new(80, 2, 18);
        assert_eq!(g.to_logical_block_address(0, 0, 1).unwrap(), 0);
        assert_eq!(g.to_logical_block_address(0, 0, 18).unwrap(), 17);
        assert_eq!(g.to_logical_block_address(0, 1, 1).unwrap(), 18);
        assert_eq!(g.to_logical_block_address(1, 0, 1).unwrap(), 36);
    }

    #[test]
    fn test_chs_rejects_sector_past_track() {
        let g = DiskGeometry::new(80, 2, 18);
        assert!(g.to_logical_block_address(0, 0, 0).is_err());
        // Sector 19 on an 18-sector track is invalid, including the
        // off-by-one value sectors_per_track + 1.
        assert!(g.to_logical_block_address(0, 0, 19).is_err());
        assert!(g.to_logical_block_address(0, 2, 1).is_err());
        assert!(g.to_logical_block_address(80, 0, 1).is_err());
    }

    #[test]
    fn test_encode_label() {
        assert_eq!(&encode_label(Some("TEST")).unwrap(), b"TEST       ");
        assert_eq!(&encode_label(None).unwrap(), b"           ");
        assert!(encode_label(Some("toolonglabel")).is_err());
        assert!(encode_label(Some("lower")).is_err());
    }

    #[test]
    fn test_format_fat16_parses_back() {
        let sectors = 20 * 1024 * 1024 / 512; // 20 MiB
        let mut image = Cursor::new(Vec::new());
        format_volume(
            &mut image,
            &FormatOptions {
                label: Some("TEST".into()),
                sector_count: sectors,
                ..Default::default()
            },
        )
        .unwrap();

        let buf = image.into_inner();
        assert_eq!(buf.len() as u64, sectors * 512);
        assert_eq!(&buf[510..512], &[0x55, 0xAA]);

        let mut sector0 = [0u8; 512];
        sector0.copy_from_slice(&buf[..512]);
        let bpb = parse_bpb(&sector0).unwrap();
        assert_eq!(bpb.fat_type, FatType::Fat16);
        assert_eq!(bpb.sectors_per_cluster, 4);
        assert_eq!(bpb.total_sectors, sectors);
        assert_eq!(bpb.label.as_deref(), Some("TEST"));
        // FAT[1] carries the end-of-chain marker
        let fat_off = bpb.reserved_sectors as usize * 512;
        assert_eq!(&buf[fat_off + 2..fat_off + 4], &[0xFF, 0xFF]);
    }

    #[test]
    fn test_format_fat32_layout() {
        let sectors = 1_100_000u64; // ~537 MiB, past the FAT16 ceiling
        let mut image = Cursor::new(Vec::new());
        format_volume(
            &mut image,
            &FormatOptions {
                sector_count: sectors,
                ..Default::default()
            },
        )
        .unwrap();

        let buf = image.into_inner();
        let mut sector0 = [0u8; 512];
        sector0.copy_from_slice(&buf[..512]);
        let bpb = parse_bpb(&sector0).unwrap();
        assert_eq!(bpb.fat_type, FatType::Fat32);
        assert_eq!(bpb.root_cluster, 2);
        assert_eq!(bpb.fs_info_sector, 1);

        // FSINFO signatures
        assert_eq!(&buf[512..516], &0x4161_5252u32.to_le_bytes());
        assert_eq!(&buf[512 + 484..512 + 488], &0x6141_7272u32.to_le_bytes());

        // Backup boot sector matches the primary
        assert_eq!(&buf[6 * 512..7 * 512], &buf[0..512]);
    }

    #[test]
    fn test_format_floppy_144m() {
        let mut image = Cursor::new(Vec::new());
        format_floppy(&mut image, FloppyFormat::Floppy144M, None).unwrap();
        let buf = image.into_inner();
        assert_eq!(buf.len(), 2880 * 512);

        let mut sector0 = [0u8; 512];
        sector0.copy_from_slice(&buf[..512]);
        let bpb = parse_bpb(&sector0).unwrap();
        assert_eq!(bpb.fat_type, FatType::Fat12);
        assert_eq!(bpb.root_entry_count, 224);
        assert_eq!(bpb.media, 0xF0);
        assert_eq!(bpb.total_sectors, 2880);
    }
}
