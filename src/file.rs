//! Open-file handles.
//!
//! A [`RegularFile`] is a thin cursor over a shared inode: a position that
//! read and write advance, plus this opener's deny-write state. Several
//! handles over the same inode share its contents and length but keep
//! independent cursors. [`File`] is what the façade's `open` hands back,
//! since a path may name either kind of object.
use crate::{
    directory::Directory,
    disk::Disk,
    fs::FsInner,
    inode::OpenInode,
    types::SectorNumber,
    Error,
};
use alloc::sync::{Arc, Weak};

/// A cursor handle over a regular file.
///
/// Dropping the handle closes its opener on the shared inode and releases
/// a deny-write hold taken through it.
pub struct RegularFile<D: Disk> {
    fs: Weak<FsInner<D>>,
    inode: Arc<OpenInode>,
    pos: u32,
    denied_write: bool,
}

impl<D: Disk> RegularFile<D> {
    /// Wraps an already-opened inode, taking over its open count.
    ///
    /// Fails with [`Error::IsDirectory`] (closing the inode again) when
    /// the inode describes a directory.
    pub(crate) fn from_inode(fs: &Arc<FsInner<D>>, inode: Arc<OpenInode>) -> Result<Self, Error> {
        if inode.is_dir() {
            let _ = fs.inodes.close(fs, &inode);
            return Err(Error::IsDirectory);
        }
        Ok(Self {
            fs: Arc::downgrade(fs),
            inode,
            pos: 0,
            denied_write: false,
        })
    }

    fn fs(&self) -> Result<Arc<FsInner<D>>, Error> {
        self.fs.upgrade().ok_or(Error::Corrupted("filesystem closed"))
    }

    /// The sector of the file's inode.
    #[inline]
    pub fn sector(&self) -> SectorNumber {
        self.inode.sector()
    }

    /// Current byte length of the file.
    #[inline]
    pub fn len(&self) -> u32 {
        self.inode.len()
    }

    /// Whether the file currently holds no data.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reads from the cursor, advancing it by the returned count.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        let n = self.read_at(buf, self.pos)?;
        self.pos += n as u32;
        Ok(n)
    }

    /// Reads at an explicit offset without moving the cursor.
    pub fn read_at(&self, buf: &mut [u8], offset: u32) -> Result<usize, Error> {
        let fs = self.fs()?;
        self.inode.read_at(&fs, buf, offset)
    }

    /// Writes at the cursor, advancing it by the returned count.
    ///
    /// The count is short when the file hits its maximum size or the
    /// volume runs out of sectors, and zero while writes are denied.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize, Error> {
        let n = self.write_at(buf, self.pos)?;
        self.pos += n as u32;
        Ok(n)
    }

    /// Writes at an explicit offset without moving the cursor.
    pub fn write_at(&self, buf: &[u8], offset: u32) -> Result<usize, Error> {
        let fs = self.fs()?;
        self.inode.write_at(&fs, buf, offset)
    }

    /// Moves the cursor to an absolute byte position.
    #[inline]
    pub fn seek(&mut self, pos: u32) {
        self.pos = pos;
    }

    /// Returns the cursor's byte position.
    #[inline]
    pub fn tell(&self) -> u32 {
        self.pos
    }

    /// Forbids writes to the underlying inode through any opener.
    ///
    /// Takes at most one hold per handle; the hold is released by
    /// [`allow_write`](Self::allow_write) or when the handle closes.
    pub fn deny_write(&mut self) {
        if !self.denied_write {
            self.denied_write = true;
            self.inode.deny_write();
        }
    }

    /// Releases this handle's deny-write hold, if any.
    pub fn allow_write(&mut self) {
        if self.denied_write {
            self.denied_write = false;
            self.inode.allow_write();
        }
    }

    /// Opens another handle over the same file, with a fresh cursor and no
    /// deny-write hold.
    pub fn reopen(&self) -> Result<Self, Error> {
        let fs = self.fs()?;
        let inode = fs.inodes.reopen(&self.inode);
        Ok(Self {
            fs: self.fs.clone(),
            inode,
            pos: 0,
            denied_write: false,
        })
    }

    /// Closes the handle. Equivalent to dropping it.
    pub fn close(self) {}
}

impl<D: Disk> Drop for RegularFile<D> {
    fn drop(&mut self) {
        if self.denied_write {
            self.inode.allow_write();
        }
        if let Some(fs) = self.fs.upgrade() {
            let _ = fs.inodes.close(&fs, &self.inode);
        }
    }
}

/// A filesystem object returned by `open`: either kind of handle.
pub enum File<D: Disk> {
    /// A regular file.
    RegularFile(RegularFile<D>),
    /// A directory.
    Directory(Directory<D>),
}

impl<D: Disk> File<D> {
    /// Extracts the regular-file handle, if this is one.
    pub fn into_regular_file(self) -> Option<RegularFile<D>> {
        if let File::RegularFile(f) = self {
            Some(f)
        } else {
            None
        }
    }

    /// Extracts the directory handle, if this is one.
    pub fn into_directory(self) -> Option<Directory<D>> {
        if let File::Directory(d) = self {
            Some(d)
        } else {
            None
        }
    }

    /// The inode sector of the object, regardless of its kind.
    pub fn sector(&self) -> SectorNumber {
        match self {
            File::RegularFile(f) => f.sector(),
            File::Directory(d) => d.sector(),
        }
    }

    /// Whether the object is a directory.
    pub fn is_dir(&self) -> bool {
        matches!(self, File::Directory(_))
    }
}
