pub mod entry;
pub mod fat;
pub mod fat_format;
pub mod filesystem;
pub mod ntfs;
pub mod path;
pub mod times;

use std::io::{Read, Seek, SeekFrom, Write};

pub use fat::{validate_fat_integrity, FatFilesystem};
pub use fat_format::{format_floppy, format_volume, DiskGeometry, FloppyFormat, FormatOptions};
pub use filesystem::{DiscFileSystem, FsError, FsOptions};
pub use ntfs::{validate_ntfs_integrity, NtfsFilesystem};

/// Open a filesystem for browsing within a partition.
///
/// `reader` must be seekable; `partition_offset` is the byte offset of the
/// volume within it. `partition_type` is the MBR partition type byte; pass
/// 0x00 to probe the boot sector instead.
pub fn open_filesystem<R: Read + Write + Seek + 'static>(
    reader: R,
    partition_offset: u64,
    partition_type: u8,
    options: Option<FsOptions>,
) -> Result<Box<dyn DiscFileSystem>, FsError> {
    let options = options.unwrap_or_default();
    match partition_type {
        // FAT12
        0x01 => Ok(Box::new(FatFilesystem::open_with_options(
            reader,
            partition_offset,
            options,
        )?)),
        // FAT16
        0x04 | 0x06 | 0x0E | 0x14 | 0x16 | 0x1E => Ok(Box::new(
            FatFilesystem::open_with_options(reader, partition_offset, options)?,
        )),
        // FAT32
        0x0B | 0x0C | 0x1B | 0x1C => Ok(Box::new(FatFilesystem::open_with_options(
            reader,
            partition_offset,
            options,
        )?)),
        // NTFS (exFAT shares the type byte but not the signature)
        0x07 => Ok(Box::new(NtfsFilesystem::open_with_options(
            reader,
            partition_offset,
            options,
        )?)),
        // Unknown: probe the boot sector
        0x00 => probe_filesystem(reader, partition_offset, options),
        _ => Err(FsError::Unsupported(format!(
            "filesystem type 0x{partition_type:02X} not supported for browsing"
        ))),
    }
}

fn probe_filesystem<R: Read + Write + Seek + 'static>(
    mut reader: R,
    partition_offset: u64,
    options: FsOptions,
) -> Result<Box<dyn DiscFileSystem>, FsError> {
    reader.seek(SeekFrom::Start(partition_offset))?;
    let mut sector = [0u8; 512];
    reader
        .read_exact(&mut sector)
        .map_err(|e| FsError::Corrupt(format!("cannot read boot sector: {e}")))?;

    if ntfs::is_ntfs(&sector) {
        return Ok(Box::new(NtfsFilesystem::open_with_options(
            reader,
            partition_offset,
            options,
        )?));
    }
    if sector[0] == 0xEB || sector[0] == 0xE9 {
        return Ok(Box::new(FatFilesystem::open_with_options(
            reader,
            partition_offset,
            options,
        )?));
    }
    Err(FsError::Unsupported(
        "boot sector matches no supported filesystem".into(),
    ))
}
