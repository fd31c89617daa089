use std::io::{self, Read, Seek, Write};

use chrono::{DateTime, Local, Utc};
use thiserror::Error;

use super::entry::FileEntry;
use super::path;

/// Errors from filesystem operations.
#[derive(Error, Debug)]
pub enum FsError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("is a directory: {0}")]
    IsADirectory(String),

    #[error("directory not empty: {0}")]
    DirectoryNotEmpty(String),

    #[error("no space left on volume: {0}")]
    NoSpace(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("invalid name: {0}")]
    InvalidName(String),

    #[error("filesystem is read-only: {0}")]
    ReadOnly(String),

    #[error("corrupt filesystem structure: {0}")]
    Corrupt(String),

    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl FsError {
    /// Wrap this error for surfacing through `std::io` interfaces
    /// (`Read`/`Write` impls on file streams).
    pub fn into_io(self) -> io::Error {
        match self {
            FsError::Io(e) => e,
            other => io::Error::new(io::ErrorKind::Other, other),
        }
    }
}

/// How on-disk local timestamps (FAT) are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeZoneSpec {
    /// Treat on-disk timestamps as UTC.
    #[default]
    Utc,
    /// Treat on-disk timestamps as host local time.
    Local,
}

/// OEM code page used for FAT short names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OemEncoding {
    /// IBM PC code page 437 (the DOS default).
    #[default]
    Cp437,
}

/// Options accepted when opening a filesystem.
#[derive(Debug, Clone, Default)]
pub struct FsOptions {
    pub time_zone: TimeZoneSpec,
    pub oem_encoding: OemEncoding,
    /// Refuse all mutating operations even if the backing stream is writable.
    pub read_only: bool,
}

/// How an existing (or missing) file is treated by `open_file`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode {
    /// Open an existing file; fail with `NotFound` if absent.
    Open,
    /// Open an existing file or create an empty one.
    OpenOrCreate,
    /// Create, truncating any existing file.
    Create,
    /// Create; fail with `AlreadyExists` if present.
    CreateNew,
    /// Open (creating if absent) positioned at end of file.
    Append,
    /// Open an existing file and truncate it to zero length.
    Truncate,
}

/// Requested access on an opened file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileAccess {
    Read,
    ReadWrite,
    Write,
}

impl FileAccess {
    pub fn writes(&self) -> bool {
        !matches!(self, FileAccess::Read)
    }
}

/// A seekable byte stream over a file's data.
///
/// FAT streams support writing and resizing; mutations are written back to
/// the owning directory entry on `flush` (and best-effort on drop). NTFS
/// streams are read-only and fail writes with an `Unsupported`-backed
/// `io::Error`.
pub trait FileStream: Read + Write + Seek {
    /// Current length of the file data in bytes.
    fn length(&mut self) -> u64;

    /// Grow or truncate the file to `new_length` bytes.
    fn set_length(&mut self, new_length: u64) -> io::Result<()>;
}

/// Capability set shared by every filesystem implementation.
///
/// Paths are backslash-separated and case-insensitive; the root directory is
/// `""` or `"\"`. All operations are synchronous and must not be shared
/// across threads without external serialization.
pub trait DiscFileSystem {
    /// Human-readable filesystem name, e.g. "FAT16" or "NTFS 3.1".
    fn friendly_name(&self) -> &str;

    /// Whether this filesystem supports mutation.
    fn can_write(&self) -> bool;

    /// Volume label, if set.
    fn volume_label(&self) -> Option<&str>;

    /// Total volume size in bytes.
    fn total_size(&self) -> u64;

    /// Bytes available for new data.
    fn free_space(&mut self) -> Result<u64, FsError>;

    /// Bytes in use.
    fn used_size(&mut self) -> Result<u64, FsError> {
        let free = self.free_space()?;
        Ok(self.total_size().saturating_sub(free))
    }

    /// The root directory entry.
    fn root(&mut self) -> Result<FileEntry, FsError>;

    /// Entry metadata for a file or directory.
    fn file_info(&mut self, path: &str) -> Result<FileEntry, FsError>;

    fn file_exists(&mut self, path: &str) -> Result<bool, FsError>;

    fn directory_exists(&mut self, path: &str) -> Result<bool, FsError>;

    fn exists(&mut self, path: &str) -> Result<bool, FsError> {
        Ok(self.file_exists(path)? || self.directory_exists(path)?)
    }

    /// Length of an existing file in bytes.
    fn file_length(&mut self, path: &str) -> Result<u64, FsError>;

    fn attributes(&mut self, path: &str) -> Result<super::entry::FileAttributes, FsError>;

    fn set_attributes(
        &mut self,
        path: &str,
        attrs: super::entry::FileAttributes,
    ) -> Result<(), FsError>;

    fn creation_time_utc(&mut self, path: &str) -> Result<DateTime<Utc>, FsError>;
    fn last_access_time_utc(&mut self, path: &str) -> Result<DateTime<Utc>, FsError>;
    fn last_write_time_utc(&mut self, path: &str) -> Result<DateTime<Utc>, FsError>;

    fn set_creation_time_utc(&mut self, path: &str, when: DateTime<Utc>) -> Result<(), FsError>;
    fn set_last_access_time_utc(&mut self, path: &str, when: DateTime<Utc>)
        -> Result<(), FsError>;
    fn set_last_write_time_utc(&mut self, path: &str, when: DateTime<Utc>)
        -> Result<(), FsError>;

    fn creation_time(&mut self, path: &str) -> Result<DateTime<Local>, FsError> {
        Ok(self.creation_time_utc(path)?.with_timezone(&Local))
    }

    fn last_access_time(&mut self, path: &str) -> Result<DateTime<Local>, FsError> {
        Ok(self.last_access_time_utc(path)?.with_timezone(&Local))
    }

    fn last_write_time(&mut self, path: &str) -> Result<DateTime<Local>, FsError> {
        Ok(self.last_write_time_utc(path)?.with_timezone(&Local))
    }

    fn set_creation_time(&mut self, path: &str, when: DateTime<Local>) -> Result<(), FsError> {
        self.set_creation_time_utc(path, when.with_timezone(&Utc))
    }

    fn set_last_access_time(&mut self, path: &str, when: DateTime<Local>) -> Result<(), FsError> {
        self.set_last_access_time_utc(path, when.with_timezone(&Utc))
    }

    fn set_last_write_time(&mut self, path: &str, when: DateTime<Local>) -> Result<(), FsError> {
        self.set_last_write_time_utc(path, when.with_timezone(&Utc))
    }

    /// Open a file as a byte stream. The stream borrows the filesystem; it
    /// must be dropped before the filesystem can be used again.
    fn open_file<'a>(
        &'a mut self,
        path: &str,
        mode: FileMode,
        access: FileAccess,
    ) -> Result<Box<dyn FileStream + 'a>, FsError>;

    /// Create a directory, including any missing parents.
    fn create_directory(&mut self, path: &str) -> Result<(), FsError>;

    fn delete_file(&mut self, path: &str) -> Result<(), FsError>;

    /// Delete an empty directory. A non-empty directory yields
    /// `DirectoryNotEmpty`; recursive deletion is the caller's loop.
    fn delete_directory(&mut self, path: &str) -> Result<(), FsError>;

    fn copy_file(&mut self, src: &str, dest: &str, overwrite: bool) -> Result<(), FsError>;

    fn move_file(&mut self, src: &str, dest: &str, overwrite: bool) -> Result<(), FsError>;

    fn move_directory(&mut self, src: &str, dest: &str) -> Result<(), FsError>;

    /// Full paths of files in `path` matching the DOS wildcard `pattern`.
    fn get_files(
        &mut self,
        path: &str,
        pattern: &str,
        recursive: bool,
    ) -> Result<Vec<String>, FsError>;

    /// Full paths of subdirectories in `path` matching `pattern`.
    fn get_directories(
        &mut self,
        path: &str,
        pattern: &str,
        recursive: bool,
    ) -> Result<Vec<String>, FsError>;

    /// Files and directories together.
    fn get_file_system_entries(
        &mut self,
        path: &str,
        pattern: &str,
        recursive: bool,
    ) -> Result<Vec<String>, FsError> {
        let mut out = self.get_directories(path, pattern, recursive)?;
        out.extend(self.get_files(path, pattern, recursive)?);
        out.sort_by(|a, b| path::compare_ignore_case(a, b));
        Ok(out)
    }
}
