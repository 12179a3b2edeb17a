//! # indexed_fs
//!
//! A small on-disk filesystem built around an indexed, dynamically
//! growable inode layer. The crate is the lowest level of a file stack:
//! it manages the on-disk layout directly and exposes path-level
//! operations plus byte-granular file handles on top of it.
//!
//! ```text
//! ┌──────────────────────────────────────┐
//! │ FileSys                              │
//! │ - create / open / remove / chdir     │
//! └─────────────┬────────────────────────┘
//!               │
//! ┌─────────────▼────────────────────────┐
//! │ path resolution + directory layer    │
//! │ - (containing dir, leaf) splitting   │
//! │ - fixed-width name → sector entries  │
//! └─────────────┬────────────────────────┘
//!               │
//! ┌─────────────▼────────────────────────┐
//! │ inode layer                          │
//! │ - shared open-inode registry         │
//! │ - byte offset → sector indexing      │
//! │ - growth through 1- and 2-level      │
//! │   indirect blocks                    │
//! └─────────────┬────────────────────────┘
//!               │
//! ┌─────────────▼────────────────────────┐
//! │ free map + Disk                      │
//! │ - sector allocation                  │
//! │ - 512-byte synchronous block I/O     │
//! └──────────────────────────────────────┘
//! ```
//!
//! Files hold up to 8 MiB. The first 128 sectors of a file are reached
//! through a single indirect block; growing past that point promotes the
//! inode to double indirection once, and it stays there. Opening the same
//! inode twice yields one shared in-memory entry, and an inode removed
//! while open keeps its sectors until the last opener closes it.
//!
//! There is no journal: a volume that was not cleanly closed may be
//! inconsistent and is expected to be reformatted.
//!
//! ## Example
//! ```
//! use indexed_fs::{FileSys, MemDisk};
//!
//! let fs = FileSys::format(MemDisk::new(1024)).unwrap();
//! let root = fs.root().unwrap();
//!
//! fs.create(&root, "/notes", 0, false).unwrap();
//! let mut f = fs.open(&root, "/notes").unwrap().into_regular_file().unwrap();
//! f.write(b"hello").unwrap();
//!
//! let mut buf = [0u8; 5];
//! f.read_at(&mut buf, 0).unwrap();
//! assert_eq!(&buf, b"hello");
//! ```
#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod directory;
pub mod disk;
pub mod file;
pub mod fs;
pub(crate) mod disk_layout;
pub(crate) mod free_map;
pub(crate) mod inode;
pub(crate) mod path;
pub mod types;

pub use directory::Directory;
pub use disk::{Disk, MemDisk, SECTOR_SIZE};
pub use disk_layout::{MAX_FILE_SIZE, NAME_MAX};
pub use file::{File, RegularFile};
pub use fs::{FileSys, FREE_MAP_SECTOR, ROOT_DIR_SECTOR};
pub use types::{FileType, SectorNumber};

/// Errors surfaced by filesystem operations.
#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub enum Error {
    /// No such file or directory.
    NoSuchEntry,
    /// The block device failed a transfer.
    Io,
    /// The object is busy: the root directory, or a directory another
    /// opener still has open.
    Busy,
    /// The name is already taken in the containing directory.
    FileExist,
    /// An interior path component names a regular file.
    NotDirectory,
    /// A file operation was applied to a directory.
    IsDirectory,
    /// A reserved or empty name was used where a real one is required.
    InvalidArgument,
    /// The free map cannot satisfy an allocation.
    NoSpace,
    /// A name exceeds the directory entry width.
    NameTooLong,
    /// A directory still holds entries.
    DirectoryNotEmpty,
    /// On-disk state violated an invariant of the format.
    Corrupted(&'static str),
}
