//! End-to-end FAT tests over in-memory images.
//!
//! Every image is produced by this crate's own formatter (or, for the small
//! FAT32 case, built by hand), mutated through the `DiscFileSystem` facade,
//! and re-opened to check what actually landed on disk.

use std::io::{Cursor, Read, Seek, SeekFrom, Write};

use chrono::{TimeZone, Utc};
use discfs::fs::fat::FatFilesystem;
use discfs::fs::fat_format::{format_floppy, format_volume, FloppyFormat, FormatOptions};
use discfs::fs::validate_fat_integrity;
use discfs::{DiscFileSystem, FileAccess, FileAttributes, FileMode, FsError};

fn format_image(mib: u64, label: Option<&str>) -> Cursor<Vec<u8>> {
    let mut image = Cursor::new(Vec::new());
    format_volume(
        &mut image,
        &FormatOptions {
            label: label.map(str::to_string),
            sector_count: mib * 1024 * 1024 / 512,
            ..Default::default()
        },
    )
    .unwrap();
    image
}

fn write_file(fs: &mut FatFilesystem<&mut Cursor<Vec<u8>>>, path: &str, data: &[u8]) {
    let mut f = fs
        .open_file(path, FileMode::Create, FileAccess::ReadWrite)
        .unwrap();
    f.write_all(data).unwrap();
    f.flush().unwrap();
}

fn read_file(fs: &mut FatFilesystem<&mut Cursor<Vec<u8>>>, path: &str) -> Vec<u8> {
    let mut f = fs
        .open_file(path, FileMode::Open, FileAccess::Read)
        .unwrap();
    let mut out = Vec::new();
    f.read_to_end(&mut out).unwrap();
    out
}

// ============================================================================
// Test Group A: format + roundtrip
// ============================================================================

#[test]
fn test_format_and_roundtrip() {
    let mut image = format_image(10, Some("TEST"));

    {
        let mut fs = FatFilesystem::open(&mut image, 0).unwrap();
        assert_eq!(fs.friendly_name(), "FAT16");
        assert_eq!(fs.volume_label(), Some("TEST"));

        fs.create_directory("\\A\\B").unwrap();
        write_file(&mut fs, "\\A\\B\\hello.txt", &[0x48, 0x65, 0x6C, 0x6C, 0x6F]);
    }

    // Reopen from the raw bytes: everything must have been flushed
    let mut fs = FatFilesystem::open(&mut image, 0).unwrap();
    assert_eq!(read_file(&mut fs, "\\A\\B\\hello.txt"), b"Hello");
    assert_eq!(fs.file_length("\\A\\B\\hello.txt").unwrap(), 5);

    let listing = fs.get_files("\\A\\B", "*", false).unwrap();
    assert_eq!(listing, vec!["\\A\\B\\hello.txt".to_string()]);
}

#[test]
fn test_directory_exists_on_root() {
    let mut image = format_image(10, None);
    let mut fs = FatFilesystem::open(&mut image, 0).unwrap();
    assert!(fs.directory_exists("").unwrap());
    assert!(fs.directory_exists("\\").unwrap());
    assert!(!fs.file_exists("\\").unwrap());
}

#[test]
fn test_open_modes() {
    let mut image = format_image(10, None);
    let mut fs = FatFilesystem::open(&mut image, 0).unwrap();

    assert!(matches!(
        fs.open_file("\\missing.txt", FileMode::Open, FileAccess::Read),
        Err(FsError::NotFound(_))
    ));

    write_file(&mut fs, "\\f.txt", b"data");
    assert!(matches!(
        fs.open_file("\\f.txt", FileMode::CreateNew, FileAccess::ReadWrite),
        Err(FsError::AlreadyExists(_))
    ));

    // Create truncates
    write_file(&mut fs, "\\f.txt", b"xy");
    assert_eq!(fs.file_length("\\f.txt").unwrap(), 2);

    // Append positions at the end
    {
        let mut f = fs
            .open_file("\\f.txt", FileMode::Append, FileAccess::ReadWrite)
            .unwrap();
        f.write_all(b"z").unwrap();
    }
    assert_eq!(read_file(&mut fs, "\\f.txt"), b"xyz");

    fs.create_directory("\\d").unwrap();
    assert!(matches!(
        fs.open_file("\\d", FileMode::Open, FileAccess::Read),
        Err(FsError::IsADirectory(_))
    ));
}

#[test]
fn test_path_resolution_through_file_fails() {
    let mut image = format_image(10, None);
    let mut fs = FatFilesystem::open(&mut image, 0).unwrap();
    write_file(&mut fs, "\\notadir", b"x");
    assert!(matches!(
        fs.open_file("\\notadir\\child.txt", FileMode::Open, FileAccess::Read),
        Err(FsError::NotADirectory(_))
    ));
}

// ============================================================================
// Test Group B: long file names
// ============================================================================

#[test]
fn test_long_file_name_alias() {
    let mut image = format_image(10, None);

    {
        let mut fs = FatFilesystem::open(&mut image, 0).unwrap();
        write_file(&mut fs, "\\A really long file name.txt", b"x");
    }

    let mut fs = FatFilesystem::open(&mut image, 0).unwrap();
    let files = fs.get_files("\\", "*", false).unwrap();
    assert_eq!(files, vec!["\\A really long file name.txt".to_string()]);

    let info = fs.file_info("\\A really long file name.txt").unwrap();
    assert_eq!(info.name, "A really long file name.txt");
    assert_eq!(info.short_name.as_deref(), Some("AREALL~1.TXT"));
    assert_eq!(info.size, 1);

    // The 8.3 alias resolves too
    assert_eq!(read_file(&mut fs, "\\AREALL~1.TXT"), b"x");
}

#[test]
fn test_lfn_alias_collision_numbering() {
    let mut image = format_image(10, None);
    let mut fs = FatFilesystem::open(&mut image, 0).unwrap();
    write_file(&mut fs, "\\long name one.txt", b"1");
    write_file(&mut fs, "\\long name two.txt", b"2");

    let one = fs.file_info("\\long name one.txt").unwrap();
    let two = fs.file_info("\\long name two.txt").unwrap();
    assert_eq!(one.short_name.as_deref(), Some("LONGNA~1.TXT"));
    assert_eq!(two.short_name.as_deref(), Some("LONGNA~2.TXT"));
}

// ============================================================================
// Test Group C: allocation accounting
// ============================================================================

#[test]
fn test_delete_reclaims_clusters() {
    // 8 MiB FAT16: two sectors per cluster, 1024-byte clusters
    let mut image = format_image(8, None);
    let mut fs = FatFilesystem::open(&mut image, 0).unwrap();
    assert_eq!(fs.bpb().cluster_size(), 1024);

    let free_before = fs.free_cluster_count();
    write_file(&mut fs, "\\big.bin", &vec![0xA5u8; 100_000]);

    // ceil(100000 / 1024) = 98 clusters
    assert_eq!(fs.free_cluster_count(), free_before - 98);

    fs.delete_file("\\big.bin").unwrap();
    assert_eq!(fs.free_cluster_count(), free_before);
    assert!(!fs.file_exists("\\big.bin").unwrap());
}

#[test]
fn test_truncate_frees_tail_clusters() {
    let mut image = format_image(8, None);
    let mut fs = FatFilesystem::open(&mut image, 0).unwrap();
    let free_before = fs.free_cluster_count();

    write_file(&mut fs, "\\t.bin", &vec![1u8; 10 * 1024]);
    assert_eq!(fs.free_cluster_count(), free_before - 10);

    {
        let mut f = fs
            .open_file("\\t.bin", FileMode::Open, FileAccess::ReadWrite)
            .unwrap();
        f.set_length(1024).unwrap();
    }
    assert_eq!(fs.free_cluster_count(), free_before - 1);
    assert_eq!(fs.file_length("\\t.bin").unwrap(), 1024);
}

// ============================================================================
// Test Group D: move and copy
// ============================================================================

#[test]
fn test_move_preserves_content() {
    let mut image = format_image(10, None);
    let pattern: Vec<u8> = (0u32..4096).map(|i| (i % 251) as u8).collect();

    let mut fs = FatFilesystem::open(&mut image, 0).unwrap();
    fs.create_directory("\\src").unwrap();
    fs.create_directory("\\dst").unwrap();
    write_file(&mut fs, "\\src\\f.bin", &pattern);

    fs.move_file("\\src\\f.bin", "\\dst\\f.bin", false).unwrap();
    assert_eq!(read_file(&mut fs, "\\dst\\f.bin"), pattern);
    assert!(!fs.file_exists("\\src\\f.bin").unwrap());

    // A second source moved onto the occupied destination needs `overwrite`
    write_file(&mut fs, "\\src\\f.bin", b"other");
    assert!(matches!(
        fs.move_file("\\src\\f.bin", "\\dst\\f.bin", false),
        Err(FsError::AlreadyExists(_))
    ));
    fs.move_file("\\src\\f.bin", "\\dst\\f.bin", true).unwrap();
    assert_eq!(read_file(&mut fs, "\\dst\\f.bin"), b"other");
}

#[test]
fn test_copy_file() {
    let mut image = format_image(10, None);
    let mut fs = FatFilesystem::open(&mut image, 0).unwrap();
    write_file(&mut fs, "\\a.bin", &vec![7u8; 3000]);

    fs.copy_file("\\a.bin", "\\b.bin", false).unwrap();
    assert_eq!(read_file(&mut fs, "\\b.bin"), vec![7u8; 3000]);
    assert_eq!(read_file(&mut fs, "\\a.bin"), vec![7u8; 3000]);

    assert!(matches!(
        fs.copy_file("\\a.bin", "\\b.bin", false),
        Err(FsError::AlreadyExists(_))
    ));
    fs.copy_file("\\a.bin", "\\b.bin", true).unwrap();
}

#[test]
fn test_move_directory() {
    let mut image = format_image(10, None);
    let mut fs = FatFilesystem::open(&mut image, 0).unwrap();
    fs.create_directory("\\from\\inner").unwrap();
    write_file(&mut fs, "\\from\\inner\\f.txt", b"kept");
    fs.create_directory("\\to").unwrap();

    fs.move_directory("\\from\\inner", "\\to\\inner").unwrap();
    assert_eq!(read_file(&mut fs, "\\to\\inner\\f.txt"), b"kept");
    assert!(!fs.directory_exists("\\from\\inner").unwrap());

    // No moving a directory into its own subtree
    assert!(matches!(
        fs.move_directory("\\to", "\\to\\inner\\to"),
        Err(FsError::InvalidPath(_))
    ));
}

// ============================================================================
// Test Group E: delete semantics
// ============================================================================

#[test]
fn test_delete_directory_rejects_non_empty() {
    let mut image = format_image(10, None);
    let mut fs = FatFilesystem::open(&mut image, 0).unwrap();
    fs.create_directory("\\d").unwrap();
    write_file(&mut fs, "\\d\\f.txt", b"x");

    assert!(matches!(
        fs.delete_directory("\\d"),
        Err(FsError::DirectoryNotEmpty(_))
    ));
    fs.delete_file("\\d\\f.txt").unwrap();
    fs.delete_directory("\\d").unwrap();
    assert!(!fs.directory_exists("\\d").unwrap());
}

#[test]
fn test_delete_file_on_directory_fails() {
    let mut image = format_image(10, None);
    let mut fs = FatFilesystem::open(&mut image, 0).unwrap();
    fs.create_directory("\\d").unwrap();
    assert!(matches!(
        fs.delete_file("\\d"),
        Err(FsError::IsADirectory(_))
    ));
    assert!(matches!(
        fs.delete_directory("\\missing"),
        Err(FsError::NotFound(_))
    ));
}

// ============================================================================
// Test Group F: case insensitivity
// ============================================================================

#[test]
fn test_case_insensitive_paths() {
    let mut image = format_image(10, None);
    let mut fs = FatFilesystem::open(&mut image, 0).unwrap();
    fs.create_directory("\\Mixed\\Case").unwrap();
    write_file(&mut fs, "\\Mixed\\Case\\File.txt", b"ok");

    for path in [
        "\\MIXED\\CASE\\FILE.TXT",
        "\\mixed\\case\\file.txt",
        "\\MiXeD\\cAsE\\fIlE.tXt",
    ] {
        assert!(fs.file_exists(path).unwrap(), "missing via {path}");
        assert_eq!(read_file(&mut fs, path), b"ok");
        assert_eq!(fs.file_length(path).unwrap(), 2);
    }
}

// ============================================================================
// Test Group G: attributes and timestamps
// ============================================================================

#[test]
fn test_attribute_roundtrip() {
    let mut image = format_image(10, None);
    let mut fs = FatFilesystem::open(&mut image, 0).unwrap();
    write_file(&mut fs, "\\f.txt", b"x");

    fs.set_attributes(
        "\\f.txt",
        FileAttributes::new(FileAttributes::READ_ONLY | FileAttributes::HIDDEN),
    )
    .unwrap();
    let attrs = fs.attributes("\\f.txt").unwrap();
    assert!(attrs.is_read_only());
    assert!(attrs.is_hidden());
    assert!(!attrs.is_directory());

    // The directory bit is structural and survives attribute writes
    fs.create_directory("\\d").unwrap();
    fs.set_attributes("\\d", FileAttributes::new(FileAttributes::SYSTEM))
        .unwrap();
    let attrs = fs.attributes("\\d").unwrap();
    assert!(attrs.is_directory());
    assert!(attrs.is_system());
}

#[test]
fn test_timestamp_roundtrip() {
    let mut image = format_image(10, None);
    let mut fs = FatFilesystem::open(&mut image, 0).unwrap();
    write_file(&mut fs, "\\f.txt", b"x");

    // Even second: DOS write times have 2-second resolution
    let when = Utc.with_ymd_and_hms(2019, 4, 2, 11, 22, 44).unwrap();
    fs.set_last_write_time_utc("\\f.txt", when).unwrap();
    fs.set_creation_time_utc("\\f.txt", when).unwrap();
    assert_eq!(fs.last_write_time_utc("\\f.txt").unwrap(), when);
    assert_eq!(fs.creation_time_utc("\\f.txt").unwrap(), when);

    fs.set_last_access_time_utc("\\f.txt", when).unwrap();
    let accessed = fs.last_access_time_utc("\\f.txt").unwrap();
    // Access stamps are date-only
    assert_eq!(accessed, Utc.with_ymd_and_hms(2019, 4, 2, 0, 0, 0).unwrap());
}

// ============================================================================
// Test Group H: wildcards
// ============================================================================

#[test]
fn test_wildcard_listing() {
    let mut image = format_image(10, None);
    let mut fs = FatFilesystem::open(&mut image, 0).unwrap();
    fs.create_directory("\\sub").unwrap();
    write_file(&mut fs, "\\one.txt", b"1");
    write_file(&mut fs, "\\two.bin", b"2");
    write_file(&mut fs, "\\sub\\three.txt", b"3");

    let mut txt = fs.get_files("\\", "*.txt", false).unwrap();
    txt.sort();
    assert_eq!(txt, vec!["\\one.txt".to_string()]);

    let mut all_txt = fs.get_files("\\", "*.txt", true).unwrap();
    all_txt.sort();
    assert_eq!(
        all_txt,
        vec!["\\one.txt".to_string(), "\\sub\\three.txt".to_string()]
    );

    let dirs = fs.get_directories("\\", "*", false).unwrap();
    assert_eq!(dirs, vec!["\\sub".to_string()]);

    let mut everything = fs.get_file_system_entries("\\", "*", true).unwrap();
    everything.sort();
    assert_eq!(
        everything,
        vec![
            "\\one.txt".to_string(),
            "\\sub".to_string(),
            "\\sub\\three.txt".to_string(),
            "\\two.bin".to_string(),
        ]
    );
}

// ============================================================================
// Test Group I: integrity after a mutation storm
// ============================================================================

#[test]
fn test_integrity_after_mutation_storm() {
    let mut image = format_image(10, None);
    {
        let mut fs = FatFilesystem::open(&mut image, 0).unwrap();
        fs.create_directory("\\work\\deep\\nest").unwrap();

        for i in 0..24 {
            let data: Vec<u8> = (0..(i * 137 + 64)).map(|j| (j % 250) as u8).collect();
            write_file(&mut fs, &format!("\\work\\a long data file {i}.dat"), &data);
        }
        for i in (0..24).step_by(2) {
            fs.delete_file(&format!("\\work\\a long data file {i}.dat"))
                .unwrap();
        }
        for i in (1..24).step_by(4) {
            fs.move_file(
                &format!("\\work\\a long data file {i}.dat"),
                &format!("\\work\\deep\\moved {i}.dat"),
                false,
            )
            .unwrap();
        }
        fs.create_directory("\\work\\again").unwrap();
        write_file(&mut fs, "\\work\\again\\tail.bin", &vec![9u8; 5000]);
    }

    image.seek(SeekFrom::Start(0)).unwrap();
    let warnings = validate_fat_integrity(&mut image, 0, &mut |msg| {
        eprintln!("  validate: {msg}");
    })
    .unwrap();
    assert!(warnings.is_empty(), "warnings: {warnings:?}");
}

// ============================================================================
// Test Group J: floppy formats and the fixed root region
// ============================================================================

#[test]
fn test_floppy_format_and_root_capacity() {
    let mut image = Cursor::new(Vec::new());
    format_floppy(&mut image, FloppyFormat::Floppy720K, None).unwrap();

    let mut fs = FatFilesystem::open(&mut image, 0).unwrap();
    assert_eq!(fs.friendly_name(), "FAT12");

    // 112 root entries on a 720K floppy; all 8.3 names, one slot each
    for i in 0..112 {
        let path = format!("\\F{i}.TXT");
        fs.open_file(&path, FileMode::Create, FileAccess::ReadWrite)
            .unwrap();
    }
    let err = fs
        .open_file("\\OVERFLOW.TXT", FileMode::Create, FileAccess::ReadWrite)
        .err()
        .expect("fixed root must fill up");
    assert!(matches!(err, FsError::NoSpace(_)));
}

#[test]
fn test_floppy_file_roundtrip() {
    let mut image = Cursor::new(Vec::new());
    format_floppy(&mut image, FloppyFormat::Floppy144M, Some("BOOT")).unwrap();

    {
        let mut fs = FatFilesystem::open(&mut image, 0).unwrap();
        assert_eq!(fs.volume_label(), Some("BOOT"));
        fs.create_directory("\\sys").unwrap();
        write_file(&mut fs, "\\sys\\io.bin", &vec![0x42u8; 2000]);
    }
    let mut fs = FatFilesystem::open(&mut image, 0).unwrap();
    assert_eq!(read_file(&mut fs, "\\sys\\io.bin"), vec![0x42u8; 2000]);
}

// ============================================================================
// Test Group K: hand-built small FAT32 volume
// ============================================================================

/// A minimal FAT32 volume: 3 reserved sectors, two 8-sector FATs, 1000 data
/// clusters of one sector each, root chain at cluster 2.
fn build_fat32_mini() -> Cursor<Vec<u8>> {
    let total_sectors = 1019u32;
    let mut buf = vec![0u8; total_sectors as usize * 512];

    buf[0] = 0xEB;
    buf[1] = 0x58;
    buf[2] = 0x90;
    buf[3..11].copy_from_slice(b"MSDOS5.0");
    buf[11..13].copy_from_slice(&512u16.to_le_bytes());
    buf[13] = 1; // sectors per cluster
    buf[14..16].copy_from_slice(&3u16.to_le_bytes()); // reserved
    buf[16] = 2; // FATs
    buf[21] = 0xF8;
    buf[24..26].copy_from_slice(&63u16.to_le_bytes());
    buf[26..28].copy_from_slice(&16u16.to_le_bytes());
    buf[32..36].copy_from_slice(&total_sectors.to_le_bytes());
    buf[36..40].copy_from_slice(&8u32.to_le_bytes()); // sectors per FAT
    buf[44..48].copy_from_slice(&2u32.to_le_bytes()); // root cluster
    buf[510] = 0x55;
    buf[511] = 0xAA;

    for fat_start in [3 * 512usize, 11 * 512] {
        buf[fat_start..fat_start + 4].copy_from_slice(&0x0FFF_FFF8u32.to_le_bytes());
        buf[fat_start + 4..fat_start + 8].copy_from_slice(&0x0FFF_FFFFu32.to_le_bytes());
        buf[fat_start + 8..fat_start + 12].copy_from_slice(&0x0FFF_FFFFu32.to_le_bytes());
    }

    Cursor::new(buf)
}

#[test]
fn test_fat32_root_is_a_cluster_chain() {
    let mut image = build_fat32_mini();

    {
        let mut fs = FatFilesystem::open(&mut image, 0).unwrap();
        assert_eq!(fs.friendly_name(), "FAT32");
        fs.create_directory("\\nested\\deep").unwrap();
        write_file(&mut fs, "\\A really long file name.txt", b"x");
        write_file(&mut fs, "\\nested\\deep\\data.bin", &vec![3u8; 1500]);

        // Enough root entries to spill the root chain past one cluster:
        // each LFN name takes several slots of the 16 in a 512-byte cluster
        for i in 0..12 {
            write_file(&mut fs, &format!("\\spill the root chain {i}.txt"), b"-");
        }
    }

    {
        let mut fs = FatFilesystem::open(&mut image, 0).unwrap();
        let info = fs.file_info("\\A really long file name.txt").unwrap();
        assert_eq!(info.short_name.as_deref(), Some("AREALL~1.TXT"));
        assert_eq!(read_file(&mut fs, "\\nested\\deep\\data.bin"), vec![3u8; 1500]);
        let files = fs.get_files("\\", "spill*.txt", false).unwrap();
        assert_eq!(files.len(), 12);
    }

    image.seek(SeekFrom::Start(0)).unwrap();
    let warnings = validate_fat_integrity(&mut image, 0, &mut |_| {}).unwrap();
    assert!(warnings.is_empty(), "warnings: {warnings:?}");
}

// ============================================================================
// Test Group L: dispatcher routing
// ============================================================================

#[test]
fn test_open_filesystem_by_type_and_probe() {
    let image = format_image(10, Some("ROUTED"));

    let fs = discfs::open_filesystem(image.clone(), 0, 0x06, None).unwrap();
    assert_eq!(fs.friendly_name(), "FAT16");
    assert_eq!(fs.volume_label(), Some("ROUTED"));

    // Probe path (partition type 0x00)
    let fs = discfs::open_filesystem(image, 0, 0x00, None).unwrap();
    assert_eq!(fs.friendly_name(), "FAT16");

    let bogus = Cursor::new(vec![0u8; 4096]);
    assert!(discfs::open_filesystem(bogus, 0, 0x00, None).is_err());
}

#[test]
fn test_read_only_option_blocks_writes() {
    let mut image = format_image(10, None);
    {
        let mut fs = FatFilesystem::open(&mut image, 0).unwrap();
        write_file(&mut fs, "\\f.txt", b"x");
    }

    let mut fs = FatFilesystem::open_with_options(
        &mut image,
        0,
        discfs::FsOptions {
            read_only: true,
            ..Default::default()
        },
    )
    .unwrap();
    assert!(!fs.can_write());
    assert_eq!(read_file(&mut fs, "\\f.txt"), b"x");
    assert!(matches!(
        fs.delete_file("\\f.txt"),
        Err(FsError::ReadOnly(_))
    ));
    assert!(matches!(
        fs.open_file("\\f.txt", FileMode::Open, FileAccess::ReadWrite),
        Err(FsError::ReadOnly(_))
    ));
}
