//! Directory layer.
//!
//! A directory is an inode whose payload is a dense array of fixed-width
//! [`DirEntry`] records. Entry 0 is reserved for the `..` entry carrying
//! the parent's sector (the root's `..` points at the root itself); every
//! other slot maps a name to an inode sector. Lookups are linear scans,
//! additions reuse the first free slot or append past the end, and the
//! append is what grows the directory's payload.
use crate::{
    disk::Disk,
    disk_layout::{DirEntry, DIR_ENTRY_SIZE},
    fs::{FsInner, ROOT_DIR_SECTOR},
    inode::{self, OpenInode},
    types::{FileType, SectorNumber},
    Error,
};
use alloc::{
    string::String,
    sync::{Arc, Weak},
    vec::Vec,
};

/// Name of the reserved parent entry.
const PARENT_NAME: &str = "..";

/// An open handle over a directory inode.
///
/// Dropping the handle closes its opener on the shared inode.
pub struct Directory<D: Disk> {
    fs: Weak<FsInner<D>>,
    inode: Arc<OpenInode>,
}

impl<D: Disk> Directory<D> {
    /// Wraps an already-opened inode, taking over its open count.
    ///
    /// Fails with [`Error::NotDirectory`] (closing the inode again) when
    /// the inode does not describe a directory.
    pub(crate) fn from_inode(fs: &Arc<FsInner<D>>, inode: Arc<OpenInode>) -> Result<Self, Error> {
        if !inode.is_dir() {
            let _ = fs.inodes.close(fs, &inode);
            return Err(Error::NotDirectory);
        }
        Ok(Self {
            fs: Arc::downgrade(fs),
            inode,
        })
    }

    fn fs(&self) -> Result<Arc<FsInner<D>>, Error> {
        self.fs.upgrade().ok_or(Error::Corrupted("filesystem closed"))
    }

    /// The sector of the directory's inode.
    #[inline]
    pub fn sector(&self) -> SectorNumber {
        self.inode.sector()
    }

    /// Whether this handle refers to the volume's root directory.
    #[inline]
    pub fn is_root(&self) -> bool {
        self.inode.sector() == ROOT_DIR_SECTOR
    }

    /// Opens another handle over the same directory.
    pub fn reopen(&self) -> Result<Self, Error> {
        let fs = self.fs()?;
        let inode = fs.inodes.reopen(&self.inode);
        Ok(Self {
            fs: self.fs.clone(),
            inode,
        })
    }

    /// Opens this directory's parent through the reserved `..` entry.
    ///
    /// The root is its own parent.
    pub fn parent(&self) -> Result<Self, Error> {
        let fs = self.fs()?;
        let inode = self.lookup(PARENT_NAME)?;
        Self::from_inode(&fs, inode)
    }

    /// Reads the entry stored in `slot`, or `None` past the payload.
    fn entry_at(&self, fs: &FsInner<D>, slot: u32) -> Result<Option<DirEntry>, Error> {
        let mut entry = DirEntry::default();
        let n = self
            .inode
            .read_at(fs, entry.as_bytes_mut(), slot * DIR_ENTRY_SIZE as u32)?;
        if n < DIR_ENTRY_SIZE {
            return Ok(None);
        }
        Ok(Some(entry))
    }

    /// Scans for an in-use entry named `name`.
    fn find(&self, fs: &FsInner<D>, name: &str) -> Result<Option<(u32, DirEntry)>, Error> {
        let mut slot = 0u32;
        while let Some(entry) = self.entry_at(fs, slot)? {
            if entry.name() == Some(name) {
                return Ok(Some((slot, entry)));
            }
            slot += 1;
        }
        Ok(None)
    }

    /// Looks a name up and opens the inode it refers to.
    pub(crate) fn lookup(&self, name: &str) -> Result<Arc<OpenInode>, Error> {
        let fs = self.fs()?;
        let (_, entry) = self.find(&fs, name)?.ok_or(Error::NoSuchEntry)?;
        let sector = entry
            .inode
            .ok_or(Error::Corrupted("in-use directory entry without inode"))?;
        fs.inodes.open(&fs, sector)
    }

    /// Adds an entry mapping `name` to `sector`.
    ///
    /// Fails if the name is empty, longer than the entry width, or already
    /// present. Reuses a free slot when one exists; otherwise the entry is
    /// appended, growing the directory's payload.
    pub(crate) fn add(&self, name: &str, sector: SectorNumber) -> Result<(), Error> {
        let fs = self.fs()?;
        if name.is_empty() {
            return Err(Error::InvalidArgument);
        }
        let entry = DirEntry::new(sector, name).ok_or(Error::NameTooLong)?;
        if self.inode.is_removed() {
            // A removed directory would make the new entry unreachable.
            return Err(Error::NoSuchEntry);
        }
        if self.find(&fs, name)?.is_some() {
            return Err(Error::FileExist);
        }

        let mut slot = 0u32;
        let free_slot = loop {
            match self.entry_at(&fs, slot)? {
                Some(e) if e.is_in_use() => slot += 1,
                _ => break slot,
            }
        };
        let written = self
            .inode
            .write_at(&fs, entry.as_bytes(), free_slot * DIR_ENTRY_SIZE as u32)?;
        if written < DIR_ENTRY_SIZE {
            return Err(Error::NoSpace);
        }
        Ok(())
    }

    /// Removes the entry named `name` and marks its inode for deletion.
    ///
    /// Refuses to remove the root, a directory any other opener still has
    /// open, and a directory that is not empty. Files are removed even
    /// while open; their sectors go away at the last close.
    pub(crate) fn remove_entry(&self, name: &str) -> Result<(), Error> {
        let fs = self.fs()?;
        let (slot, entry) = self.find(&fs, name)?.ok_or(Error::NoSuchEntry)?;
        let sector = entry
            .inode
            .ok_or(Error::Corrupted("in-use directory entry without inode"))?;
        let target = fs.inodes.open(&fs, sector)?;

        let unlinked = (|| {
            if target.is_dir() {
                if target.sector() == ROOT_DIR_SECTOR {
                    return Err(Error::Busy);
                }
                if target.open_count() > 1 {
                    return Err(Error::Busy);
                }
                if !is_empty(&fs, &target)? {
                    return Err(Error::DirectoryNotEmpty);
                }
            }
            let blank = DirEntry::default();
            self.inode
                .write_at(&fs, blank.as_bytes(), slot * DIR_ENTRY_SIZE as u32)?;
            target.mark_removed();
            Ok(())
        })();

        let closed = fs.inodes.close(&fs, &target);
        unlinked?;
        closed
    }

    /// Lists the directory's entries, skipping `.` and `..`.
    pub fn read_dir(&self) -> Result<Vec<(SectorNumber, String)>, Error> {
        let fs = self.fs()?;
        let mut out = Vec::new();
        let mut slot = 0u32;
        while let Some(entry) = self.entry_at(&fs, slot)? {
            if let (Some(name), Some(sector)) = (entry.name(), entry.inode) {
                if name != "." && name != PARENT_NAME {
                    out.push((sector, String::from(name)));
                }
            }
            slot += 1;
        }
        Ok(out)
    }
}

impl<D: Disk> Drop for Directory<D> {
    fn drop(&mut self) {
        if let Some(fs) = self.fs.upgrade() {
            let _ = fs.inodes.close(&fs, &self.inode);
        }
    }
}

/// Whether a directory inode holds no in-use entry besides `..`.
fn is_empty<D: Disk>(fs: &FsInner<D>, inode: &Arc<OpenInode>) -> Result<bool, Error> {
    let mut entry = DirEntry::default();
    let mut slot = 0u32;
    loop {
        let n = inode.read_at(fs, entry.as_bytes_mut(), slot * DIR_ENTRY_SIZE as u32)?;
        if n < DIR_ENTRY_SIZE {
            return Ok(true);
        }
        if entry.is_in_use() && entry.name() != Some(PARENT_NAME) {
            return Ok(false);
        }
        slot += 1;
    }
}

/// Creates a directory inode at `sector` with room for `entry_hint`
/// entries, its `..` pointing at `parent`.
pub(crate) fn dir_create<D: Disk>(
    fs: &Arc<FsInner<D>>,
    sector: SectorNumber,
    parent: SectorNumber,
    entry_hint: u32,
) -> Result<(), Error> {
    inode::create(fs, sector, entry_hint * DIR_ENTRY_SIZE as u32, FileType::Directory)?;
    init_parent_link(fs, sector, parent)
}

/// Writes the reserved `..` entry of the directory at `dir_sector`.
///
/// Called right after the directory inode is created; the payload grows to
/// cover slot 0 if the inode was created shorter than one entry.
pub(crate) fn init_parent_link<D: Disk>(
    fs: &Arc<FsInner<D>>,
    dir_sector: SectorNumber,
    parent: SectorNumber,
) -> Result<(), Error> {
    let inode = fs.inodes.open(fs, dir_sector)?;
    let entry = DirEntry::new(parent, PARENT_NAME).unwrap();
    let wrote = inode.write_at(fs, entry.as_bytes(), 0).and_then(|n| {
        if n == DIR_ENTRY_SIZE {
            Ok(())
        } else {
            Err(Error::NoSpace)
        }
    });
    let closed = fs.inodes.close(fs, &inode);
    wrote?;
    closed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{disk::MemDisk, fs::FileSys};

    fn scratch() -> FileSys<MemDisk> {
        FileSys::format(MemDisk::new(2048)).expect("format must succeed")
    }

    fn make_file(fs: &FileSys<MemDisk>) -> SectorNumber {
        let sector = fs.0.free_map.lock().allocate(1).unwrap();
        inode::create(&fs.0, sector, 0, FileType::RegularFile).unwrap();
        sector
    }

    #[test]
    fn add_then_lookup() {
        let fs = scratch();
        let root = fs.root().unwrap();
        let sector = make_file(&fs);

        root.add("alpha", sector).unwrap();
        let found = root.lookup("alpha").unwrap();
        assert_eq!(found.sector(), sector);
        fs.0.inodes.close(&fs.0, &found).unwrap();

        assert_eq!(root.lookup("beta").map(|_| ()), Err(Error::NoSuchEntry));
    }

    #[test]
    fn names_are_exact_and_bounded() {
        let fs = scratch();
        let root = fs.root().unwrap();
        let sector = make_file(&fs);

        assert_eq!(root.add("", sector), Err(Error::InvalidArgument));
        assert_eq!(
            root.add("a-very-long-file-name", sector),
            Err(Error::NameTooLong)
        );
        root.add("Case", sector).unwrap();
        assert_eq!(root.lookup("case").map(|_| ()), Err(Error::NoSuchEntry));
        assert_eq!(root.add("Case", sector), Err(Error::FileExist));
    }

    #[test]
    fn removed_slots_are_reused() {
        let fs = scratch();
        let root = fs.root().unwrap();

        let a = make_file(&fs);
        let b = make_file(&fs);
        root.add("a", a).unwrap();
        let len_after_one = fs.0.inodes.open(&fs.0, root.sector()).unwrap();
        let payload = len_after_one.len();
        fs.0.inodes.close(&fs.0, &len_after_one).unwrap();

        root.remove_entry("a").unwrap();
        root.add("b", b).unwrap();

        let reopened = fs.0.inodes.open(&fs.0, root.sector()).unwrap();
        assert_eq!(reopened.len(), payload, "freed slot was not reused");
        fs.0.inodes.close(&fs.0, &reopened).unwrap();
    }

    #[test]
    fn read_dir_skips_the_parent_entry() {
        let fs = scratch();
        let root = fs.root().unwrap();
        assert!(root.read_dir().unwrap().is_empty());

        let a = make_file(&fs);
        root.add("a", a).unwrap();
        let listing = root.read_dir().unwrap();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].1, "a");
    }

    #[test]
    fn root_parent_is_root() {
        let fs = scratch();
        let root = fs.root().unwrap();
        let parent = root.parent().unwrap();
        assert!(parent.is_root());
    }
}
