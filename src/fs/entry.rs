use chrono::{DateTime, Utc};

/// Attribute bits for a file or directory.
///
/// The bit layout is the FAT attribute byte; NTFS standard-information flags
/// are mapped onto the same bits when entries are surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileAttributes(pub u8);

impl FileAttributes {
    pub const READ_ONLY: u8 = 0x01;
    pub const HIDDEN: u8 = 0x02;
    pub const SYSTEM: u8 = 0x04;
    pub const VOLUME_ID: u8 = 0x08;
    pub const DIRECTORY: u8 = 0x10;
    pub const ARCHIVE: u8 = 0x20;

    pub fn new(bits: u8) -> Self {
        Self(bits)
    }

    pub fn bits(&self) -> u8 {
        self.0
    }

    pub fn contains(&self, bit: u8) -> bool {
        self.0 & bit != 0
    }

    pub fn is_read_only(&self) -> bool {
        self.contains(Self::READ_ONLY)
    }

    pub fn is_hidden(&self) -> bool {
        self.contains(Self::HIDDEN)
    }

    pub fn is_system(&self) -> bool {
        self.contains(Self::SYSTEM)
    }

    pub fn is_directory(&self) -> bool {
        self.contains(Self::DIRECTORY)
    }

    pub fn is_archive(&self) -> bool {
        self.contains(Self::ARCHIVE)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryType {
    File,
    Directory,
}

/// A file or directory entry within a filesystem image.
#[derive(Debug, Clone)]
pub struct FileEntry {
    /// Display name (long name where one exists).
    pub name: String,
    /// Full backslash-separated path from the volume root.
    pub path: String,
    pub entry_type: EntryType,
    pub size: u64,
    /// First cluster (FAT) or MFT record index (NTFS).
    pub location: u64,
    pub attributes: FileAttributes,
    pub created: Option<DateTime<Utc>>,
    pub modified: Option<DateTime<Utc>>,
    pub accessed: Option<DateTime<Utc>>,
    /// 8.3 alias for FAT entries carrying a long name.
    pub short_name: Option<String>,
}

impl FileEntry {
    pub fn root() -> Self {
        Self {
            name: "\\".into(),
            path: "\\".into(),
            entry_type: EntryType::Directory,
            size: 0,
            location: 0,
            attributes: FileAttributes(FileAttributes::DIRECTORY),
            created: None,
            modified: None,
            accessed: None,
            short_name: None,
        }
    }

    pub fn new_directory(name: String, path: String, location: u64) -> Self {
        Self {
            name,
            path,
            entry_type: EntryType::Directory,
            size: 0,
            location,
            attributes: FileAttributes(FileAttributes::DIRECTORY),
            created: None,
            modified: None,
            accessed: None,
            short_name: None,
        }
    }

    pub fn new_file(name: String, path: String, size: u64, location: u64) -> Self {
        Self {
            name,
            path,
            entry_type: EntryType::File,
            size,
            location,
            attributes: FileAttributes(0),
            created: None,
            modified: None,
            accessed: None,
            short_name: None,
        }
    }

    pub fn is_directory(&self) -> bool {
        self.entry_type == EntryType::Directory
    }

    pub fn is_file(&self) -> bool {
        self.entry_type == EntryType::File
    }
}
