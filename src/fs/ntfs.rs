//! NTFS reader.
//!
//! Bootstraps bottom-up: boot sector, then MFT record 0 (which describes the
//! MFT's own data runs), then the MFT as a non-resident stream, then the
//! well-known records needed for enumeration and name comparison. The write
//! path is intentionally absent; every mutator reports `Unsupported`.

use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom, Write};

use anyhow::Result;
use byteorder::{ByteOrder, LittleEndian};
use chrono::{DateTime, Utc};
use log::{debug, warn};

use super::entry::{FileAttributes, FileEntry};
use super::filesystem::{
    DiscFileSystem, FileAccess, FileMode, FileStream, FsError, FsOptions,
};
use super::path::{self, WildcardPattern};
use super::times;

// Well-known MFT record numbers
const MFT_RECORD_MFT: u64 = 0;
const MFT_RECORD_VOLUME: u64 = 3;
const MFT_RECORD_ROOT: u64 = 5;
const MFT_RECORD_BITMAP: u64 = 6;
const MFT_RECORD_SECURE: u64 = 9;
const MFT_RECORD_UPCASE: u64 = 10;

// Attribute type codes
const ATTR_STANDARD_INFORMATION: u32 = 0x10;
const ATTR_FILE_NAME: u32 = 0x30;
const ATTR_VOLUME_NAME: u32 = 0x60;
const ATTR_VOLUME_INFORMATION: u32 = 0x70;
const ATTR_DATA: u32 = 0x80;
const ATTR_INDEX_ROOT: u32 = 0x90;
const ATTR_INDEX_ALLOCATION: u32 = 0xA0;
const ATTR_END: u32 = 0xFFFF_FFFF;

// File record header flags
const RECORD_FLAG_IN_USE: u16 = 0x01;
const RECORD_FLAG_DIRECTORY: u16 = 0x02;

// $FILE_NAME / $STANDARD_INFORMATION attribute flags
const FILE_ATTR_DIRECTORY: u32 = 0x1000_0000;

// Index entry flags
const INDEX_ENTRY_LAST: u16 = 0x02;

const MFT_REFERENCE_MASK: u64 = 0x0000_FFFF_FFFF_FFFF;

/// Largest $UpCase table accepted (65536 UTF-16 units).
const UPCASE_TABLE_BYTES: u64 = 131_072;

/// NTFS Volume Boot Record fields.
pub(crate) struct NtfsVbr {
    pub bytes_per_sector: u64,
    pub sectors_per_cluster: u64,
    pub total_sectors: u64,
    pub mft_cluster: u64,
    pub mft_record_size: u32,
}

pub(crate) fn parse_vbr(vbr: &[u8; 512]) -> Result<NtfsVbr, FsError> {
    // OEM ID "NTFS    " at offset 3
    if &vbr[3..11] != b"NTFS    " {
        return Err(FsError::Corrupt("not an NTFS volume (OEM ID mismatch)".into()));
    }

    let bytes_per_sector = LittleEndian::read_u16(&vbr[0x0B..0x0D]) as u64;
    if bytes_per_sector == 0 || !bytes_per_sector.is_power_of_two() || bytes_per_sector > 4096 {
        return Err(FsError::Corrupt(format!(
            "invalid NTFS bytes per sector: {bytes_per_sector}"
        )));
    }

    let sectors_per_cluster = vbr[0x0D] as u64;
    if sectors_per_cluster == 0 {
        return Err(FsError::Corrupt("invalid NTFS sectors per cluster: 0".into()));
    }

    let total_sectors = LittleEndian::read_u64(&vbr[0x28..0x30]);
    let mft_cluster = LittleEndian::read_u64(&vbr[0x30..0x38]);

    // Clusters per MFT record: negative means record size = 2^|value| bytes
    let clusters_per_mft_raw = vbr[0x40] as i8;
    let mft_record_size = if clusters_per_mft_raw < 0 {
        1u32 << ((-clusters_per_mft_raw) as u32)
    } else {
        clusters_per_mft_raw as u32 * sectors_per_cluster as u32 * bytes_per_sector as u32
    };
    if mft_record_size == 0 || mft_record_size > 0x10000 {
        return Err(FsError::Corrupt(format!(
            "invalid MFT record size: {mft_record_size}"
        )));
    }

    Ok(NtfsVbr {
        bytes_per_sector,
        sectors_per_cluster,
        total_sectors,
        mft_cluster,
        mft_record_size,
    })
}

/// Check if a boot sector carries the NTFS signature.
pub fn is_ntfs(boot_sector: &[u8]) -> bool {
    boot_sector.len() >= 11 && &boot_sector[3..11] == b"NTFS    "
}

/// One extent of a non-resident attribute. `lcn` is `None` for sparse runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataRun {
    pub vcn: u64,
    pub length: u64,
    pub lcn: Option<u64>,
}

/// Decode the compact (length, signed cluster delta) run encoding.
pub(crate) fn decode_data_runs(data: &[u8], starting_vcn: u64) -> Vec<DataRun> {
    let mut runs = Vec::new();
    let mut pos = 0;
    let mut prev_lcn: i64 = 0;
    let mut vcn = starting_vcn;

    while pos < data.len() {
        let header = data[pos];
        if header == 0 {
            break;
        }
        pos += 1;

        let length_size = (header & 0x0F) as usize;
        let offset_size = ((header >> 4) & 0x0F) as usize;
        if length_size == 0 || pos + length_size + offset_size > data.len() {
            break;
        }

        let mut length: u64 = 0;
        for i in 0..length_size {
            length |= (data[pos + i] as u64) << (i * 8);
        }
        pos += length_size;

        if offset_size == 0 {
            // Sparse run
            runs.push(DataRun {
                vcn,
                length,
                lcn: None,
            });
        } else {
            let mut offset: i64 = 0;
            for i in 0..offset_size {
                offset |= (data[pos + i] as i64) << (i * 8);
            }
            // Sign-extend the top byte
            if offset_size < 8 && (data[pos + offset_size - 1] & 0x80) != 0 {
                for i in offset_size..8 {
                    offset |= 0xFF_i64 << (i * 8);
                }
            }
            pos += offset_size;

            let lcn = prev_lcn + offset;
            prev_lcn = lcn;
            runs.push(DataRun {
                vcn,
                length,
                lcn: if lcn >= 0 { Some(lcn as u64) } else { None },
            });
        }
        vcn += length;
    }

    runs
}

/// A parsed attribute keyed by `(type_code, name)`.
#[derive(Debug, Clone)]
pub struct NtfsAttribute {
    pub type_code: u32,
    pub name: String,
    pub resident: bool,
    /// Resident content.
    pub value: Vec<u8>,
    /// Non-resident extents.
    pub runs: Vec<DataRun>,
    pub real_size: u64,
    pub allocated_size: u64,
}

impl NtfsAttribute {
    fn data_size(&self) -> u64 {
        if self.resident {
            self.value.len() as u64
        } else {
            self.real_size
        }
    }
}

/// A parsed MFT file record.
#[derive(Debug, Clone)]
pub struct FileRecord {
    pub index: u64,
    pub sequence: u16,
    pub flags: u16,
    pub hard_link_count: u16,
    pub base_reference: u64,
    pub attributes: Vec<NtfsAttribute>,
}

impl FileRecord {
    pub fn is_directory(&self) -> bool {
        self.flags & RECORD_FLAG_DIRECTORY != 0
    }

    pub fn in_use(&self) -> bool {
        self.flags & RECORD_FLAG_IN_USE != 0
    }

    /// Look up an attribute by its `(type, name)` composite key. The unnamed
    /// default stream uses the empty name.
    pub fn find_attribute(&self, type_code: u32, name: &str) -> Option<&NtfsAttribute> {
        self.attributes
            .iter()
            .find(|a| a.type_code == type_code && a.name.eq_ignore_ascii_case(name))
    }

    fn standard_information(&self) -> Option<StandardInformation> {
        self.find_attribute(ATTR_STANDARD_INFORMATION, "")
            .and_then(|a| StandardInformation::parse(&a.value))
    }
}

/// $STANDARD_INFORMATION content.
#[derive(Debug, Clone)]
pub struct StandardInformation {
    pub created: Option<DateTime<Utc>>,
    pub modified: Option<DateTime<Utc>>,
    pub mft_modified: Option<DateTime<Utc>>,
    pub accessed: Option<DateTime<Utc>>,
    pub dos_attributes: u32,
    pub security_id: Option<u32>,
}

impl StandardInformation {
    fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < 48 {
            return None;
        }
        let security_id = if data.len() >= 56 {
            Some(LittleEndian::read_u32(&data[52..56]))
        } else {
            None
        };
        Some(Self {
            created: times::decode_filetime(LittleEndian::read_u64(&data[0..8])),
            modified: times::decode_filetime(LittleEndian::read_u64(&data[8..16])),
            mft_modified: times::decode_filetime(LittleEndian::read_u64(&data[16..24])),
            accessed: times::decode_filetime(LittleEndian::read_u64(&data[24..32])),
            dos_attributes: LittleEndian::read_u32(&data[32..36]),
            security_id,
        })
    }
}

/// Verify and strip the update sequence array of a multi-sector record.
///
/// Every 512-byte slice must end with the update sequence number; a mismatch
/// means a torn write and the record is rejected.
pub(crate) fn apply_fixup(record: &mut [u8], bytes_per_sector: u64) -> Result<(), FsError> {
    if record.len() < 48 {
        return Err(FsError::Corrupt("record too small for an update sequence array".into()));
    }

    let usa_offset = LittleEndian::read_u16(&record[0x04..0x06]) as usize;
    let usa_count = LittleEndian::read_u16(&record[0x06..0x08]) as usize;

    if usa_count < 2 || usa_offset + usa_count * 2 > record.len() {
        return Err(FsError::Corrupt(format!(
            "invalid update sequence array: offset {usa_offset}, count {usa_count}"
        )));
    }

    let usn = LittleEndian::read_u16(&record[usa_offset..usa_offset + 2]);

    for i in 1..usa_count {
        let sector_end = i * bytes_per_sector as usize;
        if sector_end < 2 || sector_end > record.len() {
            break;
        }
        let pos = sector_end - 2;
        let stored = LittleEndian::read_u16(&record[pos..pos + 2]);
        if stored != usn {
            return Err(FsError::Corrupt(format!(
                "update sequence mismatch in sector {i}: expected {usn:#06x}, got {stored:#06x}"
            )));
        }
        let replacement = usa_offset + i * 2;
        record[pos] = record[replacement];
        record[pos + 1] = record[replacement + 1];
    }

    Ok(())
}

/// Parse a fixup-pending record buffer into a `FileRecord`.
pub(crate) fn parse_file_record(
    index: u64,
    mut buf: Vec<u8>,
    bytes_per_sector: u64,
) -> Result<FileRecord, FsError> {
    if buf.len() < 48 {
        return Err(FsError::Corrupt(format!("MFT record {index} is truncated")));
    }
    if &buf[0..4] != b"FILE" {
        return Err(FsError::Corrupt(format!(
            "MFT record {index} has invalid signature {:?}",
            &buf[0..4]
        )));
    }
    apply_fixup(&mut buf, bytes_per_sector)?;

    let sequence = LittleEndian::read_u16(&buf[16..18]);
    let hard_link_count = LittleEndian::read_u16(&buf[18..20]);
    let first_attr_offset = LittleEndian::read_u16(&buf[20..22]) as usize;
    let flags = LittleEndian::read_u16(&buf[22..24]);
    let used_size = LittleEndian::read_u32(&buf[24..28]) as usize;
    let base_reference = LittleEndian::read_u64(&buf[32..40]);

    let end = used_size.min(buf.len());
    let mut attributes = Vec::new();
    let mut pos = first_attr_offset;

    while pos + 16 <= end {
        let type_code = LittleEndian::read_u32(&buf[pos..pos + 4]);
        if type_code == ATTR_END || type_code == 0 {
            break;
        }
        let attr_len = LittleEndian::read_u32(&buf[pos + 4..pos + 8]) as usize;
        if attr_len < 24 || pos + attr_len > buf.len() {
            return Err(FsError::Corrupt(format!(
                "MFT record {index}: attribute at {pos} has invalid length {attr_len}"
            )));
        }

        let non_resident = buf[pos + 8] != 0;
        let name_length = buf[pos + 9] as usize;
        let name_offset = LittleEndian::read_u16(&buf[pos + 10..pos + 12]) as usize;

        let name = if name_length > 0 && pos + name_offset + name_length * 2 <= buf.len() {
            let units: Vec<u16> = (0..name_length)
                .map(|i| LittleEndian::read_u16(&buf[pos + name_offset + i * 2..]))
                .collect();
            String::from_utf16_lossy(&units)
        } else {
            String::new()
        };

        if non_resident {
            if pos + 0x40 > buf.len() {
                return Err(FsError::Corrupt(format!(
                    "MFT record {index}: non-resident attribute header truncated"
                )));
            }
            let starting_vcn = LittleEndian::read_u64(&buf[pos + 0x10..pos + 0x18]);
            let run_offset = LittleEndian::read_u16(&buf[pos + 0x20..pos + 0x22]) as usize;
            let allocated_size = LittleEndian::read_u64(&buf[pos + 0x28..pos + 0x30]);
            let real_size = LittleEndian::read_u64(&buf[pos + 0x30..pos + 0x38]);

            let runs = if run_offset >= 0x40 && run_offset < attr_len {
                decode_data_runs(&buf[pos + run_offset..pos + attr_len], starting_vcn)
            } else {
                Vec::new()
            };

            attributes.push(NtfsAttribute {
                type_code,
                name,
                resident: false,
                value: Vec::new(),
                runs,
                real_size,
                allocated_size,
            });
        } else {
            let value_length = LittleEndian::read_u32(&buf[pos + 0x10..pos + 0x14]) as usize;
            let value_offset = LittleEndian::read_u16(&buf[pos + 0x14..pos + 0x16]) as usize;

            let value = if value_offset + value_length <= attr_len {
                buf[pos + value_offset..pos + value_offset + value_length].to_vec()
            } else {
                Vec::new()
            };
            let len = value.len() as u64;

            attributes.push(NtfsAttribute {
                type_code,
                name,
                resident: true,
                value,
                runs: Vec::new(),
                real_size: len,
                allocated_size: len,
            });
        }

        pos += attr_len;
    }

    Ok(FileRecord {
        index,
        sequence,
        flags,
        hard_link_count,
        base_reference,
        attributes,
    })
}

/// A directory child parsed from a $FILE_NAME index entry.
#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub file_reference: u64,
    pub name: String,
    pub name_type: u8,
    pub is_directory: bool,
    pub real_size: u64,
    pub dos_attributes: u32,
    pub created: Option<DateTime<Utc>>,
    pub modified: Option<DateTime<Utc>>,
    pub accessed: Option<DateTime<Utc>>,
}

impl IndexEntry {
    pub fn mft_index(&self) -> u64 {
        self.file_reference & MFT_REFERENCE_MASK
    }
}

/// Parse a run of index entries (the tail of an index node).
fn parse_index_entries(data: &[u8], out: &mut Vec<IndexEntry>) {
    let mut pos = 0;

    while pos + 16 <= data.len() {
        let file_reference = LittleEndian::read_u64(&data[pos..pos + 8]);
        let entry_length = LittleEndian::read_u16(&data[pos + 8..pos + 10]) as usize;
        let content_length = LittleEndian::read_u16(&data[pos + 10..pos + 12]) as usize;
        let flags = LittleEndian::read_u16(&data[pos + 12..pos + 14]);

        if entry_length < 16 || pos + entry_length > data.len() {
            break;
        }
        if flags & INDEX_ENTRY_LAST != 0 {
            break;
        }

        // $FILE_NAME needs at least 66 bytes before the name itself
        if content_length >= 66 && pos + 16 + content_length <= data.len() {
            let content = &data[pos + 16..pos + 16 + content_length];
            let real_size = LittleEndian::read_u64(&content[48..56]);
            let file_flags = LittleEndian::read_u32(&content[56..60]);
            let name_length = content[64] as usize;
            let name_type = content[65];

            if 66 + name_length * 2 <= content.len() {
                let units: Vec<u16> = (0..name_length)
                    .map(|i| LittleEndian::read_u16(&content[66 + i * 2..]))
                    .collect();
                let name = String::from_utf16_lossy(&units);

                out.push(IndexEntry {
                    file_reference,
                    name,
                    name_type,
                    is_directory: file_flags & FILE_ATTR_DIRECTORY != 0,
                    real_size,
                    dos_attributes: file_flags,
                    created: times::decode_filetime(LittleEndian::read_u64(&content[8..16])),
                    modified: times::decode_filetime(LittleEndian::read_u64(&content[16..24])),
                    accessed: times::decode_filetime(LittleEndian::read_u64(&content[32..40])),
                });
            }
        }

        pos += entry_length;
    }
}

/// NTFS filesystem reader over a seekable stream.
pub struct NtfsFilesystem<R> {
    reader: R,
    partition_offset: u64,
    bytes_per_sector: u64,
    total_sectors: u64,
    mft_record_size: u32,
    cluster_size: u64,
    /// The MFT's own data runs; every record is read through them.
    mft_runs: Vec<DataRun>,
    /// On-disk $UpCase table; empty means ASCII fallback.
    upcase: Vec<u16>,
    label: Option<String>,
    fs_name: String,
    /// Directory listings keyed by MFT record index.
    dir_cache: HashMap<u64, Vec<IndexEntry>>,
    #[allow(dead_code)]
    options: FsOptions,
}

impl<R: Read + Seek> NtfsFilesystem<R> {
    pub fn open(reader: R, partition_offset: u64) -> Result<Self, FsError> {
        Self::open_with_options(reader, partition_offset, FsOptions::default())
    }

    pub fn open_with_options(
        mut reader: R,
        partition_offset: u64,
        options: FsOptions,
    ) -> Result<Self, FsError> {
        reader.seek(SeekFrom::Start(partition_offset))?;
        let mut vbr_buf = [0u8; 512];
        reader
            .read_exact(&mut vbr_buf)
            .map_err(|e| FsError::Corrupt(format!("cannot read NTFS boot sector: {e}")))?;
        let vbr = parse_vbr(&vbr_buf)?;
        let cluster_size = vbr.bytes_per_sector * vbr.sectors_per_cluster;

        // Record 0 read directly from the boot sector's MFT cluster; it
        // carries the runs every later record is read through.
        let mft_offset = partition_offset + vbr.mft_cluster * cluster_size;
        reader.seek(SeekFrom::Start(mft_offset))?;
        let mut record0 = vec![0u8; vbr.mft_record_size as usize];
        reader.read_exact(&mut record0)?;
        let record0 = parse_file_record(MFT_RECORD_MFT, record0, vbr.bytes_per_sector)?;

        let mft_attr = record0
            .find_attribute(ATTR_DATA, "")
            .ok_or_else(|| FsError::Corrupt("$MFT has no data attribute".into()))?;
        if mft_attr.resident {
            return Err(FsError::Corrupt("$MFT data attribute is resident".into()));
        }
        let mft_runs = mft_attr.runs.clone();

        let mut fs = NtfsFilesystem {
            reader,
            partition_offset,
            bytes_per_sector: vbr.bytes_per_sector,
            total_sectors: vbr.total_sectors,
            mft_record_size: vbr.mft_record_size,
            cluster_size,
            mft_runs,
            upcase: Vec::new(),
            label: None,
            fs_name: "NTFS".to_string(),
            dir_cache: HashMap::new(),
            options,
        };

        // Bring the name-normalization, allocation, and security layers online
        fs.upcase = fs.load_upcase().unwrap_or_default();
        if fs.upcase.is_empty() {
            warn!("$UpCase unavailable, falling back to ASCII case folding");
        }
        let (label, version) = fs.load_volume_info()?;
        fs.label = label;
        if let Some((major, minor)) = version {
            fs.fs_name = format!("NTFS {major}.{minor}");
        }
        fs.read_mft_record(MFT_RECORD_ROOT)?;
        fs.read_mft_record(MFT_RECORD_BITMAP)?;
        if fs.read_mft_record(MFT_RECORD_SECURE).is_err() {
            warn!("$Secure record unreadable; security lookups disabled");
        }

        debug!(
            "opened {} volume: {} sectors, {}-byte clusters",
            fs.fs_name, fs.total_sectors, fs.cluster_size
        );
        Ok(fs)
    }

    /// Read `len` bytes at `offset` within a non-resident stream described
    /// by `runs`. Sparse extents and gaps read as zeros.
    fn read_runs_range(
        &mut self,
        runs: &[DataRun],
        offset: u64,
        len: usize,
    ) -> Result<Vec<u8>, FsError> {
        let mut out = vec![0u8; len];
        let cluster_size = self.cluster_size;
        let mut filled = 0usize;

        while filled < len {
            let pos = offset + filled as u64;
            let vcn = pos / cluster_size;
            let in_cluster = pos % cluster_size;

            let run = runs
                .iter()
                .find(|r| vcn >= r.vcn && vcn < r.vcn + r.length);
            let Some(run) = run else {
                // Past the allocated extents: remainder stays zero
                break;
            };

            let run_remaining = (run.vcn + run.length - vcn) * cluster_size - in_cluster;
            let n = ((len - filled) as u64).min(run_remaining) as usize;

            if let Some(lcn) = run.lcn {
                let byte = self.partition_offset
                    + (lcn + (vcn - run.vcn)) * cluster_size
                    + in_cluster;
                self.reader.seek(SeekFrom::Start(byte))?;
                self.reader.read_exact(&mut out[filled..filled + n])?;
            }
            filled += n;
        }

        Ok(out)
    }

    /// Read an MFT record through the MFT's own run list.
    pub fn read_mft_record(&mut self, index: u64) -> Result<FileRecord, FsError> {
        let record_size = self.mft_record_size as u64;
        let runs = self.mft_runs.clone();
        let buf = self.read_runs_range(&runs, index * record_size, record_size as usize)?;
        parse_file_record(index, buf, self.bytes_per_sector)
    }

    /// Read a record through a (index, sequence) file reference, rejecting
    /// stale references.
    pub fn read_record_by_reference(&mut self, reference: u64) -> Result<FileRecord, FsError> {
        let index = reference & MFT_REFERENCE_MASK;
        let sequence = (reference >> 48) as u16;
        let record = self.read_mft_record(index)?;
        if sequence != 0 && record.sequence != sequence {
            return Err(FsError::Corrupt(format!(
                "stale file reference to record {index}: sequence {sequence} != {}",
                record.sequence
            )));
        }
        Ok(record)
    }

    /// Read attribute content, resident or not, clamped to `max_bytes`.
    fn read_attribute_data(
        &mut self,
        attr: &NtfsAttribute,
        max_bytes: Option<u64>,
    ) -> Result<Vec<u8>, FsError> {
        let limit = max_bytes.unwrap_or(attr.data_size()).min(attr.data_size());
        if attr.resident {
            Ok(attr.value[..limit as usize].to_vec())
        } else {
            let runs = attr.runs.clone();
            self.read_runs_range(&runs, 0, limit as usize)
        }
    }

    fn load_upcase(&mut self) -> Result<Vec<u16>, FsError> {
        let record = self.read_mft_record(MFT_RECORD_UPCASE)?;
        let attr = record
            .find_attribute(ATTR_DATA, "")
            .ok_or_else(|| FsError::Corrupt("$UpCase has no data attribute".into()))?
            .clone();
        let data = self.read_attribute_data(&attr, Some(UPCASE_TABLE_BYTES))?;
        Ok(data
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect())
    }

    fn load_volume_info(
        &mut self,
    ) -> Result<(Option<String>, Option<(u8, u8)>), FsError> {
        let record = self.read_mft_record(MFT_RECORD_VOLUME)?;

        let label = record
            .find_attribute(ATTR_VOLUME_NAME, "")
            .filter(|a| a.resident && !a.value.is_empty())
            .map(|a| {
                let units: Vec<u16> = a
                    .value
                    .chunks_exact(2)
                    .map(|c| u16::from_le_bytes([c[0], c[1]]))
                    .collect();
                String::from_utf16_lossy(&units).trim().to_string()
            })
            .filter(|l| !l.is_empty());

        let version = record
            .find_attribute(ATTR_VOLUME_INFORMATION, "")
            .filter(|a| a.resident && a.value.len() >= 10)
            .map(|a| (a.value[8], a.value[9]));

        Ok((label, version))
    }

    /// Fold a name through the on-disk $UpCase table (ASCII fallback).
    fn upcase_units(&self, name: &str) -> Vec<u16> {
        name.encode_utf16()
            .map(|u| {
                if (u as usize) < self.upcase.len() {
                    self.upcase[u as usize]
                } else if u < 128 {
                    (u as u8 as char).to_ascii_uppercase() as u16
                } else {
                    u
                }
            })
            .collect()
    }

    fn names_equal(&self, a: &str, b: &str) -> bool {
        self.upcase_units(a) == self.upcase_units(b)
    }

    /// Enumerate a directory record's index, in collation order.
    fn list_directory(&mut self, record_index: u64) -> Result<Vec<IndexEntry>, FsError> {
        if let Some(cached) = self.dir_cache.get(&record_index) {
            return Ok(cached.clone());
        }

        let record = self.read_mft_record(record_index)?;
        if !record.is_directory() {
            return Err(FsError::NotADirectory(format!("MFT record {record_index}")));
        }

        let mut entries = Vec::new();

        // $INDEX_ROOT: resident header + first node
        let mut index_block_size = 4096usize;
        if let Some(root) = record.find_attribute(ATTR_INDEX_ROOT, "$I30") {
            let data = &root.value;
            if data.len() >= 32 && LittleEndian::read_u32(&data[0..4]) == ATTR_FILE_NAME {
                let declared = LittleEndian::read_u32(&data[8..12]) as usize;
                if declared >= 512 && declared <= 0x10000 {
                    index_block_size = declared;
                }
                // Node header at 16: entry offset, total size
                let entries_offset = LittleEndian::read_u32(&data[16..20]) as usize;
                let entries_size = LittleEndian::read_u32(&data[20..24]) as usize;
                let start = 16 + entries_offset;
                let end = (16 + entries_size).min(data.len());
                if start < end {
                    parse_index_entries(&data[start..end], &mut entries);
                }
            }
        }

        // $INDEX_ALLOCATION: INDX blocks, each with its own fixup
        if let Some(alloc) = record
            .find_attribute(ATTR_INDEX_ALLOCATION, "$I30")
            .cloned()
        {
            let data = self.read_attribute_data(&alloc, None)?;
            let mut pos = 0;
            while pos + index_block_size <= data.len() {
                let block = &data[pos..pos + index_block_size];
                if &block[0..4] == b"INDX" {
                    let mut block = block.to_vec();
                    apply_fixup(&mut block, self.bytes_per_sector)?;
                    // Node header at 0x18
                    let entries_offset = LittleEndian::read_u32(&block[0x18..0x1C]) as usize;
                    let entries_size = LittleEndian::read_u32(&block[0x1C..0x20]) as usize;
                    let start = 0x18 + entries_offset;
                    let end = (0x18 + entries_size).min(block.len());
                    if start < end {
                        parse_index_entries(&block[start..end], &mut entries);
                    }
                }
                pos += index_block_size;
            }
        }

        // DOS-only aliases duplicate a Win32 entry for the same record
        entries.retain(|e| e.name_type != 2);
        entries.retain(|e| e.name != "." && e.name != "..");
        if record_index == MFT_RECORD_ROOT {
            entries.retain(|e| !e.name.starts_with('$'));
        }

        entries.sort_by(|a, b| self.upcase_units(&a.name).cmp(&self.upcase_units(&b.name)));
        entries.dedup_by_key(|e| e.file_reference);

        self.dir_cache.insert(record_index, entries.clone());
        Ok(entries)
    }

    fn find_child(
        &mut self,
        dir_record: u64,
        name: &str,
    ) -> Result<Option<IndexEntry>, FsError> {
        let entries = self.list_directory(dir_record)?;
        Ok(entries.into_iter().find(|e| self.names_equal(&e.name, name)))
    }

    /// Resolve a path (without any `:stream` suffix) to its index entry.
    /// The root resolves to `None`.
    fn resolve(&mut self, file_path: &str) -> Result<Option<IndexEntry>, FsError> {
        let components = path::split_components(file_path)?;
        let mut current = MFT_RECORD_ROOT;
        let mut found: Option<IndexEntry> = None;

        for (i, component) in components.iter().enumerate() {
            let entry = self
                .find_child(current, component)?
                .ok_or_else(|| FsError::NotFound(file_path.into()))?;
            if i + 1 < components.len() {
                if !entry.is_directory {
                    return Err(FsError::NotADirectory(file_path.into()));
                }
                current = entry.mft_index();
            }
            found = Some(entry);
        }
        Ok(found)
    }

    /// Split a `path:stream` suffix off the final component, before path
    /// validation ever sees the `:`.
    fn split_stream(file_path: &str) -> (String, Option<String>) {
        let (dir, last) = match file_path.rsplit_once('\\') {
            Some((dir, last)) => (Some(dir), last),
            None => (None, file_path),
        };
        let (plain, stream) = path::split_stream_suffix(last);
        let plain_path = match dir {
            Some(dir) => format!("{dir}\\{plain}"),
            None => plain.to_string(),
        };
        (plain_path, stream.map(str::to_string))
    }

    /// The `(logical cluster, length)` extents of a file's data stream,
    /// skipping sparse runs.
    pub fn path_to_clusters(&mut self, file_path: &str) -> Result<Vec<(u64, u64)>, FsError> {
        let (plain, stream) = Self::split_stream(file_path);
        let entry = self
            .resolve(&plain)?
            .ok_or_else(|| FsError::IsADirectory(file_path.into()))?;
        let record = self.read_record_by_reference(entry.file_reference)?;
        let attr = record
            .find_attribute(ATTR_DATA, stream.as_deref().unwrap_or(""))
            .ok_or_else(|| FsError::NotFound(format!("no data stream on '{file_path}'")))?;
        Ok(attr
            .runs
            .iter()
            .filter_map(|r| r.lcn.map(|lcn| (lcn, r.length)))
            .collect())
    }

    /// Security identifier referenced by a file's standard information.
    pub fn security_id(&mut self, file_path: &str) -> Result<Option<u32>, FsError> {
        let record = self.resolve_record(file_path)?;
        Ok(record.standard_information().and_then(|si| si.security_id))
    }

    fn resolve_record(&mut self, file_path: &str) -> Result<FileRecord, FsError> {
        if path::is_root(file_path) {
            return self.read_mft_record(MFT_RECORD_ROOT);
        }
        let (plain, _) = Self::split_stream(file_path);
        let entry = self
            .resolve(&plain)?
            .ok_or_else(|| FsError::NotFound(file_path.into()))?;
        self.read_record_by_reference(entry.file_reference)
    }

    fn bitmap_used_clusters(&mut self) -> Result<u64, FsError> {
        let record = self.read_mft_record(MFT_RECORD_BITMAP)?;
        let attr = record
            .find_attribute(ATTR_DATA, "")
            .ok_or_else(|| FsError::Corrupt("$Bitmap has no data attribute".into()))?
            .clone();
        let bitmap = self.read_attribute_data(&attr, None)?;
        Ok(bitmap.iter().map(|&b| b.count_ones() as u64).sum())
    }

    fn to_file_entry(&self, parent_path: &str, e: &IndexEntry) -> FileEntry {
        let full = path::join(parent_path, &e.name);
        let mut out = if e.is_directory {
            FileEntry::new_directory(e.name.clone(), full, e.mft_index())
        } else {
            FileEntry::new_file(e.name.clone(), full, e.real_size, e.mft_index())
        };
        out.attributes = map_dos_attributes(e.dos_attributes, e.is_directory);
        out.created = e.created;
        out.modified = e.modified;
        out.accessed = e.accessed;
        out
    }

    fn do_search(
        &mut self,
        dir_path: &str,
        dir_record: u64,
        pattern: &WildcardPattern,
        recursive: bool,
        want_files: bool,
        want_dirs: bool,
        out: &mut Vec<String>,
    ) -> Result<(), FsError> {
        for e in self.list_directory(dir_record)? {
            let full = path::join(dir_path, &e.name);
            if e.is_directory {
                if want_dirs && pattern.matches(&e.name) {
                    out.push(full.clone());
                }
                if recursive {
                    self.do_search(
                        &full,
                        e.mft_index(),
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
        let record_index = if path::is_root(dir_path) {
            MFT_RECORD_ROOT
        } else {
            let entry = self
                .resolve(dir_path)?
                .ok_or_else(|| FsError::NotFound(dir_path.into()))?;
            if !entry.is_directory {
                return Err(FsError::NotADirectory(dir_path.into()));
            }
            entry.mft_index()
        };
        let compiled = WildcardPattern::new(pattern)?;
        let root_norm = if path::is_root(dir_path) {
            "\\".to_string()
        } else {
            dir_path.to_string()
        };
        let mut out = Vec::new();
        self.do_search(
            &root_norm,
            record_index,
            &compiled,
            recursive,
            want_files,
            want_dirs,
            &mut out,
        )?;
        Ok(out)
    }

    fn unsupported_write<T>(&self) -> Result<T, FsError> {
        Err(FsError::Unsupported("NTFS volumes are read-only".into()))
    }
}

fn map_dos_attributes(flags: u32, is_directory: bool) -> FileAttributes {
    let mut bits = (flags
        & (FileAttributes::READ_ONLY as u32
            | FileAttributes::HIDDEN as u32
            | FileAttributes::SYSTEM as u32
            | FileAttributes::ARCHIVE as u32)) as u8;
    if is_directory {
        bits |= FileAttributes::DIRECTORY;
    }
    FileAttributes(bits)
}

impl<R: Read + Seek> DiscFileSystem for NtfsFilesystem<R> {
    fn friendly_name(&self) -> &str {
        &self.fs_name
    }

    fn can_write(&self) -> bool {
        false
    }

    fn volume_label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    fn total_size(&self) -> u64 {
        self.total_sectors * self.bytes_per_sector
    }

    fn free_space(&mut self) -> Result<u64, FsError> {
        let used = self.bitmap_used_clusters()? * self.cluster_size;
        Ok(self.total_size().saturating_sub(used))
    }

    fn root(&mut self) -> Result<FileEntry, FsError> {
        let mut root = FileEntry::root();
        root.location = MFT_RECORD_ROOT;
        Ok(root)
    }

    fn file_info(&mut self, file_path: &str) -> Result<FileEntry, FsError> {
        if path::is_root(file_path) {
            return self.root();
        }
        let (plain, _) = Self::split_stream(file_path);
        let (parent, _) = path::parent_and_name(&plain)?;
        let entry = self
            .resolve(&plain)?
            .ok_or_else(|| FsError::NotFound(file_path.into()))?;
        Ok(self.to_file_entry(if path::is_root(&parent) { "\\" } else { &parent }, &entry))
    }

    fn file_exists(&mut self, file_path: &str) -> Result<bool, FsError> {
        if path::is_root(file_path) {
            return Ok(false);
        }
        let (plain, _) = Self::split_stream(file_path);
        match self.resolve(&plain) {
            Ok(Some(e)) => Ok(!e.is_directory),
            Ok(None) => Ok(false),
            Err(FsError::NotFound(_)) | Err(FsError::NotADirectory(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn directory_exists(&mut self, dir_path: &str) -> Result<bool, FsError> {
        if path::is_root(dir_path) {
            return Ok(true);
        }
        match self.resolve(dir_path) {
            Ok(Some(e)) => Ok(e.is_directory),
            Ok(None) => Ok(true),
            Err(FsError::NotFound(_)) | Err(FsError::NotADirectory(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn file_length(&mut self, file_path: &str) -> Result<u64, FsError> {
        let (plain, stream) = Self::split_stream(file_path);
        let entry = self
            .resolve(&plain)?
            .ok_or_else(|| FsError::IsADirectory(file_path.into()))?;
        if entry.is_directory {
            return Err(FsError::IsADirectory(file_path.into()));
        }
        match stream {
            None => Ok(entry.real_size),
            Some(stream) => {
                let record = self.read_record_by_reference(entry.file_reference)?;
                let attr = record
                    .find_attribute(ATTR_DATA, &stream)
                    .ok_or_else(|| FsError::NotFound(file_path.into()))?;
                Ok(attr.data_size())
            }
        }
    }

    fn attributes(&mut self, file_path: &str) -> Result<FileAttributes, FsError> {
        let record = self.resolve_record(file_path)?;
        let flags = record
            .standard_information()
            .map(|si| si.dos_attributes)
            .unwrap_or(0);
        Ok(map_dos_attributes(flags, record.is_directory()))
    }

    fn set_attributes(&mut self, _path: &str, _attrs: FileAttributes) -> Result<(), FsError> {
        self.unsupported_write()
    }

    fn creation_time_utc(&mut self, file_path: &str) -> Result<DateTime<Utc>, FsError> {
        self.resolve_record(file_path)?
            .standard_information()
            .and_then(|si| si.created)
            .ok_or_else(|| FsError::NotFound(format!("no creation time on '{file_path}'")))
    }

    fn last_access_time_utc(&mut self, file_path: &str) -> Result<DateTime<Utc>, FsError> {
        self.resolve_record(file_path)?
            .standard_information()
            .and_then(|si| si.accessed)
            .ok_or_else(|| FsError::NotFound(format!("no access time on '{file_path}'")))
    }

    fn last_write_time_utc(&mut self, file_path: &str) -> Result<DateTime<Utc>, FsError> {
        self.resolve_record(file_path)?
            .standard_information()
            .and_then(|si| si.modified)
            .ok_or_else(|| FsError::NotFound(format!("no write time on '{file_path}'")))
    }

    fn set_creation_time_utc(&mut self, _path: &str, _when: DateTime<Utc>) -> Result<(), FsError> {
        self.unsupported_write()
    }

    fn set_last_access_time_utc(
        &mut self,
        _path: &str,
        _when: DateTime<Utc>,
    ) -> Result<(), FsError> {
        self.unsupported_write()
    }

    fn set_last_write_time_utc(
        &mut self,
        _path: &str,
        _when: DateTime<Utc>,
    ) -> Result<(), FsError> {
        self.unsupported_write()
    }

    fn open_file<'a>(
        &'a mut self,
        file_path: &str,
        mode: FileMode,
        access: FileAccess,
    ) -> Result<Box<dyn FileStream + 'a>, FsError> {
        if mode != FileMode::Open || access != FileAccess::Read {
            return self.unsupported_write();
        }
        let (plain, stream) = Self::split_stream(file_path);
        let entry = self
            .resolve(&plain)?
            .ok_or_else(|| FsError::IsADirectory(file_path.into()))?;
        if entry.is_directory {
            return Err(FsError::IsADirectory(file_path.into()));
        }
        let record = self.read_record_by_reference(entry.file_reference)?;
        let attr = record
            .find_attribute(ATTR_DATA, stream.as_deref().unwrap_or(""))
            .ok_or_else(|| FsError::NotFound(format!("no data stream on '{file_path}'")))?
            .clone();

        let backing = if attr.resident {
            NtfsFileBacking::Resident(attr.value)
        } else {
            NtfsFileBacking::NonResident {
                runs: attr.runs,
                real_size: attr.real_size,
            }
        };
        Ok(Box::new(NtfsFile {
            fs: self,
            backing,
            pos: 0,
        }))
    }

    fn create_directory(&mut self, _path: &str) -> Result<(), FsError> {
        self.unsupported_write()
    }

    fn delete_file(&mut self, _path: &str) -> Result<(), FsError> {
        self.unsupported_write()
    }

    fn delete_directory(&mut self, _path: &str) -> Result<(), FsError> {
        self.unsupported_write()
    }

    fn copy_file(&mut self, _src: &str, _dest: &str, _overwrite: bool) -> Result<(), FsError> {
        self.unsupported_write()
    }

    fn move_file(&mut self, _src: &str, _dest: &str, _overwrite: bool) -> Result<(), FsError> {
        self.unsupported_write()
    }

    fn move_directory(&mut self, _src: &str, _dest: &str) -> Result<(), FsError> {
        self.unsupported_write()
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

enum NtfsFileBacking {
    Resident(Vec<u8>),
    NonResident { runs: Vec<DataRun>, real_size: u64 },
}

/// Read-only stream over one `$DATA` attribute.
pub struct NtfsFile<'a, R: Read + Seek> {
    fs: &'a mut NtfsFilesystem<R>,
    backing: NtfsFileBacking,
    pos: u64,
}

impl<R: Read + Seek> NtfsFile<'_, R> {
    fn size(&self) -> u64 {
        match &self.backing {
            NtfsFileBacking::Resident(data) => data.len() as u64,
            NtfsFileBacking::NonResident { real_size, .. } => *real_size,
        }
    }
}

impl<R: Read + Seek> Read for NtfsFile<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let size = self.size();
        if self.pos >= size || buf.is_empty() {
            return Ok(0);
        }
        let n = (buf.len() as u64).min(size - self.pos) as usize;

        match &self.backing {
            NtfsFileBacking::Resident(data) => {
                let start = self.pos as usize;
                buf[..n].copy_from_slice(&data[start..start + n]);
            }
            NtfsFileBacking::NonResident { runs, .. } => {
                let runs = runs.clone();
                let data = self
                    .fs
                    .read_runs_range(&runs, self.pos, n)
                    .map_err(FsError::into_io)?;
                buf[..n].copy_from_slice(&data);
            }
        }
        self.pos += n as u64;
        Ok(n)
    }
}

impl<R: Read + Seek> Write for NtfsFile<'_, R> {
    fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
        Err(FsError::Unsupported("NTFS volumes are read-only".into()).into_io())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<R: Read + Seek> Seek for NtfsFile<'_, R> {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(n) => n as i64,
            SeekFrom::End(n) => self.size() as i64 + n,
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

impl<R: Read + Seek> FileStream for NtfsFile<'_, R> {
    fn length(&mut self) -> u64 {
        self.size()
    }

    fn set_length(&mut self, _new_length: u64) -> std::io::Result<()> {
        Err(FsError::Unsupported("NTFS volumes are read-only".into()).into_io())
    }
}

// =============================================================================
// Integrity validation
// =============================================================================

/// Validate basic NTFS integrity: boot sector, $MFT record fixup, and that
/// every cluster referenced by the scanned records' non-resident attributes
/// is marked used in $Bitmap.
///
/// Scans at most `max_records` file records. Returns warnings; an unreadable
/// core structure is an error.
pub fn validate_ntfs_integrity<R: Read + Seek>(
    reader: &mut R,
    partition_offset: u64,
    max_records: u64,
    log_cb: &mut impl FnMut(&str),
) -> Result<Vec<String>> {
    let mut fs = NtfsFilesystem::open_wrapped(reader, partition_offset)?;
    let mut warnings = Vec::new();

    let bitmap_record = fs.read_mft_record(MFT_RECORD_BITMAP)?;
    let bitmap_attr = bitmap_record
        .find_attribute(ATTR_DATA, "")
        .ok_or_else(|| anyhow::anyhow!("$Bitmap has no data attribute"))?
        .clone();
    let bitmap = fs.read_attribute_data(&bitmap_attr, None)?;

    let mft_size = fs
        .read_mft_record(MFT_RECORD_MFT)?
        .find_attribute(ATTR_DATA, "")
        .map(|a| a.real_size)
        .unwrap_or(0);
    let record_count = (mft_size / fs.mft_record_size as u64).min(max_records);

    let mut scanned = 0u64;
    for index in 0..record_count {
        let record = match fs.read_mft_record(index) {
            Ok(r) => r,
            Err(e) => {
                warnings.push(format!("record {index}: {e}"));
                continue;
            }
        };
        if !record.in_use() {
            continue;
        }
        scanned += 1;

        for attr in &record.attributes {
            for run in &attr.runs {
                let Some(lcn) = run.lcn else { continue };
                for cluster in lcn..lcn + run.length {
                    let byte = (cluster / 8) as usize;
                    let bit = (cluster % 8) as u8;
                    if byte >= bitmap.len() || bitmap[byte] & (1 << bit) == 0 {
                        warnings.push(format!(
                            "record {index}: cluster {cluster} of attribute {:#x} not marked in $Bitmap",
                            attr.type_code
                        ));
                    }
                }
            }
        }
    }

    log_cb(&format!(
        "NTFS validation: {scanned} in-use records scanned, {} warnings",
        warnings.len()
    ));
    Ok(warnings)
}

impl<'r, R: Read + Seek> NtfsFilesystem<&'r mut R> {
    fn open_wrapped(reader: &'r mut R, partition_offset: u64) -> Result<Self, FsError> {
        NtfsFilesystem::open_with_options(reader, partition_offset, FsOptions::default())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn make_vbr() -> [u8; 512] {
        let mut vbr = [0u8; 512];
        vbr[0] = 0xEB;
        vbr[1] = 0x52;
        vbr[2] = 0x90;
        vbr[3..11].copy_from_slice(b"NTFS    ");
        vbr[0x0B..0x0D].copy_from_slice(&512u16.to_le_bytes());
        vbr[0x0D] = 8;
        vbr[0x28..0x30].copy_from_slice(&102400u64.to_le_bytes());
        vbr[0x30..0x38].copy_from_slice(&100u64.to_le_bytes());
        vbr[0x38..0x40].copy_from_slice(&50u64.to_le_bytes());
        vbr[0x40] = (-10i8) as u8; // 2^10 = 1024-byte records
        vbr[510] = 0x55;
        vbr[511] = 0xAA;
        vbr
    }

    /// Build a minimal fixup-carrying record buffer with one resident
    /// attribute.
    fn make_record(flags: u16, sequence: u16) -> Vec<u8> {
        let mut buf = vec![0u8; 1024];
        buf[0..4].copy_from_slice(b"FILE");
        buf[4..6].copy_from_slice(&48u16.to_le_bytes()); // USA offset
        buf[6..8].copy_from_slice(&3u16.to_le_bytes()); // USA count (1 + 2 sectors)
        buf[16..18].copy_from_slice(&sequence.to_le_bytes());
        buf[18..20].copy_from_slice(&1u16.to_le_bytes());
        buf[20..22].copy_from_slice(&56u16.to_le_bytes()); // first attribute
        buf[22..24].copy_from_slice(&flags.to_le_bytes());
        buf[24..28].copy_from_slice(&(56u32 + 24 + 8).to_le_bytes()); // used size

        // Resident $STANDARD_INFORMATION-shaped attribute stub (empty value)
        let a = 56;
        buf[a..a + 4].copy_from_slice(&ATTR_STANDARD_INFORMATION.to_le_bytes());
        buf[a + 4..a + 8].copy_from_slice(&24u32.to_le_bytes());
        buf[a + 0x14..a + 0x16].copy_from_slice(&24u16.to_le_bytes()); // value offset
        buf[a + 24..a + 28].copy_from_slice(&ATTR_END.to_le_bytes());

        // USA: number + two saved words, then stamp sector tails
        let usn = 0x0101u16;
        buf[48..50].copy_from_slice(&usn.to_le_bytes());
        buf[50..52].copy_from_slice(&0xAAAAu16.to_le_bytes());
        buf[52..54].copy_from_slice(&0xBBBBu16.to_le_bytes());
        buf[510..512].copy_from_slice(&usn.to_le_bytes());
        buf[1022..1024].copy_from_slice(&usn.to_le_bytes());
        buf
    }

    #[test]
    fn test_parse_vbr_valid() {
        let parsed = parse_vbr(&make_vbr()).unwrap();
        assert_eq!(parsed.bytes_per_sector, 512);
        assert_eq!(parsed.sectors_per_cluster, 8);
        assert_eq!(parsed.total_sectors, 102400);
        assert_eq!(parsed.mft_cluster, 100);
        assert_eq!(parsed.mft_record_size, 1024);
    }

    #[test]
    fn test_parse_vbr_invalid_magic() {
        let mut vbr = make_vbr();
        vbr[3..11].copy_from_slice(b"NOTNTFS!");
        assert!(parse_vbr(&vbr).is_err());
    }

    #[test]
    fn test_parse_vbr_zero_sector_size() {
        let mut vbr = make_vbr();
        vbr[0x0B..0x0D].copy_from_slice(&0u16.to_le_bytes());
        assert!(parse_vbr(&vbr).is_err());
    }

    #[test]
    fn test_mft_record_size_positive() {
        // 2 clusters/record * 8 sectors * 512 bytes = 8192
        let mut vbr = make_vbr();
        vbr[0x40] = 2;
        assert_eq!(parse_vbr(&vbr).unwrap().mft_record_size, 8192);
    }

    #[test]
    fn test_decode_data_runs_simple() {
        // 4 clusters starting at LCN 10
        let data = [0x11, 0x04, 0x0A, 0x00];
        let runs = decode_data_runs(&data, 0);
        assert_eq!(
            runs,
            vec![DataRun {
                vcn: 0,
                length: 4,
                lcn: Some(10)
            }]
        );
    }

    #[test]
    fn test_decode_data_runs_multiple() {
        // Run 2's delta is relative to run 1's LCN
        let data = [0x11, 0x04, 0x0A, 0x11, 0x08, 0x14, 0x00];
        let runs = decode_data_runs(&data, 0);
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].lcn, Some(10));
        assert_eq!(runs[1].vcn, 4);
        assert_eq!(runs[1].length, 8);
        assert_eq!(runs[1].lcn, Some(30));
    }

    #[test]
    fn test_decode_data_runs_negative_offset() {
        let data = [
            0x11, 0x04, 0x20, // len=4, LCN 32
            0x11, 0x04, 0xF0, // len=4, delta -16 => LCN 16
            0x00,
        ];
        let runs = decode_data_runs(&data, 0);
        assert_eq!(runs[0].lcn, Some(32));
        assert_eq!(runs[1].lcn, Some(16));
    }

    #[test]
    fn test_decode_data_runs_sparse() {
        // Zero offset size marks a sparse extent
        let data = [0x11, 0x02, 0x05, 0x01, 0x03, 0x11, 0x01, 0x02, 0x00];
        let runs = decode_data_runs(&data, 0);
        assert_eq!(runs.len(), 3);
        assert_eq!(runs[1].lcn, None);
        assert_eq!(runs[1].vcn, 2);
        assert_eq!(runs[1].length, 3);
        // LCN deltas skip the sparse run
        assert_eq!(runs[2].lcn, Some(7));
        assert_eq!(runs[2].vcn, 5);
    }

    #[test]
    fn test_fixup_roundtrip() {
        let buf = make_record(RECORD_FLAG_IN_USE, 1);
        let mut fixed = buf.clone();
        apply_fixup(&mut fixed, 512).unwrap();
        // Sector tails replaced by the saved words
        assert_eq!(&fixed[510..512], &0xAAAAu16.to_le_bytes());
        assert_eq!(&fixed[1022..1024], &0xBBBBu16.to_le_bytes());
    }

    #[test]
    fn test_fixup_mismatch_rejected() {
        let mut buf = make_record(RECORD_FLAG_IN_USE, 1);
        buf[510] ^= 0xFF; // torn sector
        assert!(matches!(
            apply_fixup(&mut buf, 512),
            Err(FsError::Corrupt(_))
        ));
    }

    #[test]
    fn test_parse_record_bad_signature() {
        let mut buf = make_record(RECORD_FLAG_IN_USE, 1);
        buf[0..4].copy_from_slice(b"BAAD");
        assert!(matches!(
            parse_file_record(0, buf, 512),
            Err(FsError::Corrupt(_))
        ));
    }

    #[test]
    fn test_parse_record_header_fields() {
        let record =
            parse_file_record(7, make_record(RECORD_FLAG_IN_USE | RECORD_FLAG_DIRECTORY, 9), 512)
                .unwrap();
        assert_eq!(record.sequence, 9);
        assert!(record.in_use());
        assert!(record.is_directory());
        assert_eq!(record.attributes.len(), 1);
        assert_eq!(record.attributes[0].type_code, ATTR_STANDARD_INFORMATION);
        assert!(record.attributes[0].resident);
    }

    #[test]
    fn test_map_dos_attributes() {
        let attrs = map_dos_attributes(0x07, false);
        assert!(attrs.is_read_only());
        assert!(attrs.is_hidden());
        assert!(attrs.is_system());
        assert!(!attrs.is_directory());
        assert!(map_dos_attributes(0, true).is_directory());
    }
}
