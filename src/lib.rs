//! Browse and edit filesystem images directly from byte streams.
//!
//! `discfs` reads FAT12/16/32 and NTFS volumes out of anything that
//! implements `Read + Seek` — a raw image file, a partition slice inside a
//! larger disk image, or an in-memory buffer. FAT volumes can additionally be
//! created, written to, and reorganized; NTFS support is read-only.
//!
//! Nothing is ever mounted through the kernel: all parsing and block I/O
//! happens in-process against the backing stream.

pub mod fs;

pub use fs::entry::{EntryType, FileAttributes, FileEntry};
pub use fs::filesystem::{
    DiscFileSystem, FileAccess, FileMode, FileStream, FsError, FsOptions, TimeZoneSpec,
};
pub use fs::open_filesystem;
