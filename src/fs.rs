//! Filesystem façade.
//!
//! [`FileSys`] owns the mounted volume: the block device, the free map,
//! and the open-inode registry. The path-level operations (`create`,
//! `open`, `remove`, `chdir`) resolve names relative to a caller-held
//! working-directory handle and run under one coarse lock, which
//! serializes directory mutation and path resolution against each other.
//! Reads and writes through already-open handles bypass that lock.
//!
//! ## Volume layout
//! ```text
//! sector 0   reserved (never allocated; 0 is the "no sector" sentinel)
//! sector 1   free-map file inode
//! sector 2   root directory inode
//! 3..        allocated through the free map
//! ```
use crate::{
    directory::{self, Directory},
    disk::Disk,
    file::{File, RegularFile},
    free_map::FreeMap,
    inode::{self, InodeTable},
    path,
    types::{FileType, SectorNumber},
    Error,
};
use alloc::{sync::Arc, vec};
use spin::Mutex;

/// Sector of the free-map file's inode.
pub const FREE_MAP_SECTOR: SectorNumber = SectorNumber::new(1).unwrap();

/// Sector of the root directory's inode.
pub const ROOT_DIR_SECTOR: SectorNumber = SectorNumber::new(2).unwrap();

/// Number of entries a fresh root directory is sized for.
const ROOT_DIR_ENTRIES: u32 = 16;

/// Shared state of a mounted volume.
pub(crate) struct FsInner<D: Disk> {
    pub(crate) disk: D,
    pub(crate) free_map: Mutex<FreeMap>,
    pub(crate) inodes: InodeTable,
    /// Coarse lock serializing the path-level operations.
    ops: Mutex<()>,
}

impl<D: Disk> FsInner<D> {
    /// Reserves one sector and zeroes it on disk.
    pub(crate) fn allocate_zeroed(&self) -> Result<SectorNumber, Error> {
        let sector = self.free_map.lock().allocate(1).ok_or(Error::NoSpace)?;
        const ZEROS: [u8; crate::disk::SECTOR_SIZE] = [0; crate::disk::SECTOR_SIZE];
        if let Err(e) = self.disk.write(sector, &ZEROS) {
            self.free_map.lock().release(sector, 1);
            return Err(e);
        }
        Ok(sector)
    }

    /// Opens a handle over the root directory.
    pub(crate) fn root_dir(self: &Arc<Self>) -> Result<Directory<D>, Error> {
        let inode = self.inodes.open(self, ROOT_DIR_SECTOR)?;
        Directory::from_inode(self, inode)
    }
}

/// A mounted volume.
///
/// Cloning yields another reference to the same mount.
pub struct FileSys<D: Disk>(pub(crate) Arc<FsInner<D>>);

impl<D: Disk> Clone for FileSys<D> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<D: Disk> FileSys<D> {
    fn from_parts(disk: D) -> Arc<FsInner<D>> {
        let sector_count = disk.sector_count();
        Arc::new(FsInner {
            disk,
            free_map: Mutex::new(FreeMap::new(sector_count)),
            inodes: InodeTable::new(),
            ops: Mutex::new(()),
        })
    }

    /// Builds a fresh volume on `disk` and mounts it.
    ///
    /// Lays down the free-map file and an empty root directory, then
    /// flushes the free map. Everything previously on the disk is gone.
    pub fn format(disk: D) -> Result<Self, Error> {
        let inner = Self::from_parts(disk);
        {
            let mut free_map = inner.free_map.lock();
            free_map.mark_used(FREE_MAP_SECTOR);
            free_map.mark_used(ROOT_DIR_SECTOR);
        }
        let map_bytes = inner.free_map.lock().byte_len();
        inode::create(&inner, FREE_MAP_SECTOR, map_bytes, FileType::RegularFile)?;
        directory::dir_create(&inner, ROOT_DIR_SECTOR, ROOT_DIR_SECTOR, ROOT_DIR_ENTRIES)?;

        let fs = FileSys(inner);
        fs.flush_free_map()?;
        log::info!(
            "formatted volume: {} sectors, {} free",
            fs.0.disk.sector_count(),
            fs.free_sector_count()
        );
        Ok(fs)
    }

    /// Mounts the volume already present on `disk`.
    ///
    /// Validates the root directory's inode and restores the free map
    /// from its file.
    pub fn load(disk: D) -> Result<Self, Error> {
        let inner = Self::from_parts(disk);

        let root = crate::disk_layout::DiskInode::read_from(&inner.disk, ROOT_DIR_SECTOR)?;
        if !root.is_dir() {
            return Err(Error::Corrupted("root inode is not a directory"));
        }

        let map_inode = inner.inodes.open(&inner, FREE_MAP_SECTOR)?;
        let mut image = vec![0u8; map_inode.len() as usize];
        let read = map_inode.read_at(&inner, &mut image, 0);
        let closed = inner.inodes.close(&inner, &map_inode);
        read?;
        closed?;
        inner.free_map.lock().restore(&image);

        let fs = FileSys(inner);
        log::info!(
            "mounted volume: {} sectors, {} free",
            fs.0.disk.sector_count(),
            fs.free_sector_count()
        );
        Ok(fs)
    }

    /// Unmounts the volume, flushing the free map to its file.
    ///
    /// Handles still open on this mount stop working once the last
    /// [`FileSys`] reference is gone.
    pub fn close(self) -> Result<(), Error> {
        self.flush_free_map()
    }

    fn flush_free_map(&self) -> Result<(), Error> {
        let image = self.0.free_map.lock().to_bytes();
        let map_inode = self.0.inodes.open(&self.0, FREE_MAP_SECTOR)?;
        let wrote = map_inode.write_at(&self.0, &image, 0);
        let closed = self.0.inodes.close(&self.0, &map_inode);
        let n = wrote?;
        closed?;
        debug_assert_eq!(n, image.len());
        Ok(())
    }

    /// Opens a handle over the root directory.
    pub fn root(&self) -> Result<Directory<D>, Error> {
        self.0.root_dir()
    }

    /// Number of sectors currently free on the volume.
    pub fn free_sector_count(&self) -> u32 {
        self.0.free_map.lock().free_count()
    }

    /// Creates a file or directory of `initial_size` bytes at `path`.
    ///
    /// The leaf must be a real name: `.`, `..`, and an empty leaf are
    /// rejected. A new directory's `..` is pointed at its containing
    /// directory. On failure nothing is left allocated.
    pub fn create(
        &self,
        cwd: &Directory<D>,
        path: &str,
        initial_size: u32,
        is_dir: bool,
    ) -> Result<(), Error> {
        let _ops = self.0.ops.lock();
        let (dir, leaf) = path::split(&self.0, cwd, path)?;
        if leaf.is_empty() || leaf == "." || leaf == ".." {
            return Err(Error::InvalidArgument);
        }

        let sector = self.0.free_map.lock().allocate(1).ok_or(Error::NoSpace)?;
        let ftype = if is_dir {
            FileType::Directory
        } else {
            FileType::RegularFile
        };
        if let Err(e) = inode::create(&self.0, sector, initial_size, ftype) {
            self.0.free_map.lock().release(sector, 1);
            return Err(e);
        }

        let linked = if is_dir {
            directory::init_parent_link(&self.0, sector, dir.sector())
                .and_then(|()| dir.add(&leaf, sector))
        } else {
            dir.add(&leaf, sector)
        };
        if let Err(e) = linked {
            let _ = inode::destroy(&self.0, sector);
            return Err(e);
        }
        Ok(())
    }

    /// Opens the object named by `path`.
    ///
    /// A leaf of `..` opens the containing directory's parent; a leaf of
    /// `.` (or an empty leaf at the root, as in `/`) opens the containing
    /// directory itself. A trailing slash on a directory path is accepted.
    pub fn open(&self, cwd: &Directory<D>, path: &str) -> Result<File<D>, Error> {
        let _ops = self.0.ops.lock();
        let (dir, leaf) = path::split(&self.0, cwd, path)?;

        let inode = match leaf.as_str() {
            ".." => {
                let parent = dir.parent()?;
                return Ok(File::Directory(parent));
            }
            "." => return Ok(File::Directory(dir)),
            "" if dir.is_root() => return Ok(File::Directory(dir)),
            "" => return Err(Error::NoSuchEntry),
            name => dir.lookup(name)?,
        };
        if inode.is_dir() {
            Ok(File::Directory(Directory::from_inode(&self.0, inode)?))
        } else {
            Ok(File::RegularFile(RegularFile::from_inode(&self.0, inode)?))
        }
    }

    /// Removes the object named by `path`.
    ///
    /// Directories must be empty and not held open by anyone else; the
    /// root cannot be removed. A file removed while open stays readable
    /// and writable through existing handles, and its sectors are
    /// released at the last close.
    pub fn remove(&self, cwd: &Directory<D>, path: &str) -> Result<(), Error> {
        let _ops = self.0.ops.lock();
        let (dir, leaf) = path::split(&self.0, cwd, path)?;
        if leaf.is_empty() {
            // Only the root resolves to an empty leaf.
            return Err(Error::Busy);
        }
        dir.remove_entry(&leaf)
    }

    /// Re-targets `cwd`, the caller's working-directory handle, at the
    /// directory named by `path`. The previous handle is closed.
    pub fn chdir(&self, cwd: &mut Directory<D>, path: &str) -> Result<(), Error> {
        let _ops = self.0.ops.lock();
        let (dir, leaf) = path::split(&self.0, cwd, path)?;

        let next = match leaf.as_str() {
            ".." => dir.parent()?,
            "." => dir,
            "" if dir.is_root() => dir,
            "" => return Err(Error::NoSuchEntry),
            name => {
                let inode = dir.lookup(name)?;
                Directory::from_inode(&self.0, inode)?
            }
        };
        *cwd = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::MemDisk;

    #[test]
    fn format_then_load() {
        let disk = MemDisk::new(1024);
        let fs = FileSys::format(disk.clone()).expect("format must succeed");
        let free_at_format = fs.free_sector_count();
        fs.close().unwrap();

        let fs = FileSys::load(disk).expect("mounting a formatted volume must succeed");
        assert_eq!(fs.free_sector_count(), free_at_format);
    }

    #[test]
    fn load_rejects_an_unformatted_disk() {
        assert!(FileSys::load(MemDisk::new(1024)).is_err());
    }

    #[test]
    fn create_rejects_reserved_leaves() {
        let fs = FileSys::format(MemDisk::new(1024)).unwrap();
        let root = fs.root().unwrap();
        assert_eq!(
            fs.create(&root, "/.", 0, false),
            Err(Error::InvalidArgument)
        );
        assert_eq!(
            fs.create(&root, "/..", 0, false),
            Err(Error::InvalidArgument)
        );
        assert_eq!(fs.create(&root, "/", 0, false), Err(Error::InvalidArgument));
    }

    #[test]
    fn failed_create_leaves_no_allocation_behind() {
        let fs = FileSys::format(MemDisk::new(64)).unwrap();
        let root = fs.root().unwrap();
        let free_before = fs.free_sector_count();

        // Far larger than the volume.
        assert_eq!(
            fs.create(&root, "/huge", 1 << 20, false),
            Err(Error::NoSpace)
        );
        assert_eq!(fs.free_sector_count(), free_before);

        // The name collision path also rolls back.
        fs.create(&root, "/f", 0, false).unwrap();
        let free_before = fs.free_sector_count();
        assert_eq!(fs.create(&root, "/f", 0, false), Err(Error::FileExist));
        assert_eq!(fs.free_sector_count(), free_before);
    }
}
