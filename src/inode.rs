//! Inode layer: the open-inode registry and the indexed, growable byte
//! store behind every file and directory.
//!
//! The kernel-facing rule is that there is exactly one in-memory
//! representation of each inode. [`InodeTable`] enforces it: opening a
//! sector that is already open returns the shared [`OpenInode`] with its
//! open count bumped, and the entry is evicted only when the last opener
//! closes it. An inode marked removed keeps its sectors until that final
//! close, so existing openers continue to read and write it.
//!
//! ## Indexing
//! An inode is an indexing structure: it maps a position within the file
//! to the sector that stores it. The record keeps no direct pointers; the
//! first 128 sectors are reached through the single-indirect root, and a
//! file that outgrows it is promoted once:
//!
//! ```text
//!        ┌──────────────────┐             ┌──────────────────┐
//!        │ DiskInode        │             │ DiskInode        │
//!        ├──────────────────┤   promote   ├──────────────────┤
//!        │ indirect ──┐     │   ──────►   │ indirect = 0     │
//!        │ dbl ind = 0│     │             │ dbl ind ──┐      │
//!        └────────────┼─────┘             └───────────┼──────┘
//!                     │                               │
//!              ┌──────▼──────┐                 ┌──────▼──────┐
//!              │ L1 block    │                 │ L2 block    │
//!              ├─────────────┤                 ├─────────────┤
//!              │ → data 0    │                 │ → L1 (old)  │
//!              │ ...         │                 │ → L1 (new)  │
//!              │ → data 127  │                 │ ...         │
//!              └─────────────┘                 └─────────────┘
//! ```
//!
//! Growth appends zeroed sectors one at a time, installing index blocks as
//! group boundaries are crossed; the new length is published only after
//! every sector of the extension is in place.
use crate::{
    disk::{Disk, SECTOR_SIZE},
    disk_layout::{DiskInode, IndirectBlock, MAX_FILE_SIZE, PTRS_PER_BLOCK},
    fs::FsInner,
    types::{FileType, SectorNumber},
    Error,
};
use alloc::{
    boxed::Box,
    collections::btree_map::{BTreeMap, Entry},
    sync::Arc,
};
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use spin::Mutex;

/// Number of sectors needed to store `bytes` bytes of payload.
#[inline]
fn sectors_for(bytes: u32) -> u32 {
    bytes.div_ceil(SECTOR_SIZE as u32)
}

/// A shared in-memory inode.
///
/// All openers of the same sector share one `OpenInode` through the
/// registry. The cached record is the authority on length and index roots
/// while the inode is open; it is re-persisted whenever growth succeeds.
pub struct OpenInode {
    sector: SectorNumber,
    /// Cached copy of the on-disk record.
    record: Mutex<DiskInode>,
    /// Number of live openers. Adjusted under the registry lock.
    open_count: AtomicU32,
    /// Set once the inode has been unlinked; sectors are released at the
    /// last close.
    removed: AtomicBool,
    /// While nonzero, `write_at` refuses to write.
    deny_write_count: AtomicU32,
    /// Serializes file extension. Reads and in-place writes do not take it.
    grow: Mutex<()>,
}

impl OpenInode {
    /// The sector this inode's record lives in.
    #[inline]
    pub fn sector(&self) -> SectorNumber {
        self.sector
    }

    /// Byte length of the file.
    #[inline]
    pub fn len(&self) -> u32 {
        self.record.lock().len()
    }

    /// Whether the inode describes a directory.
    #[inline]
    pub fn is_dir(&self) -> bool {
        self.record.lock().is_dir()
    }

    /// Number of live openers.
    #[inline]
    pub(crate) fn open_count(&self) -> u32 {
        self.open_count.load(Ordering::Relaxed)
    }

    /// Whether the inode has been unlinked.
    #[inline]
    pub(crate) fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Relaxed)
    }

    /// Marks the inode for deletion at its last close.
    pub(crate) fn mark_removed(&self) {
        self.removed.store(true, Ordering::Relaxed);
    }

    /// Disables writes through any opener.
    ///
    /// May be taken at most once per opener, so the count never exceeds
    /// the open count.
    pub(crate) fn deny_write(&self) {
        let prev = self.deny_write_count.fetch_add(1, Ordering::Relaxed);
        debug_assert!(prev < self.open_count.load(Ordering::Relaxed));
    }

    /// Undoes one [`deny_write`](Self::deny_write).
    pub(crate) fn allow_write(&self) {
        let prev = self.deny_write_count.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(prev > 0);
    }

    /// Maps a byte position to the sector that stores it.
    ///
    /// # Returns
    /// - `Ok(Some(sector))`: `pos` lies within the file.
    /// - `Ok(None)`: `pos` is at or past the end of the file.
    pub(crate) fn byte_to_sector<D: Disk>(
        &self,
        fs: &FsInner<D>,
        pos: u32,
    ) -> Result<Option<SectorNumber>, Error> {
        let record = *self.record.lock();
        locate(fs, &record, pos)
    }

    /// Reads up to `buf.len()` bytes starting at byte `offset`.
    ///
    /// Returns the number of bytes copied, which is the part of `buf`
    /// that overlaps the file.
    pub(crate) fn read_at<D: Disk>(
        &self,
        fs: &FsInner<D>,
        buf: &mut [u8],
        offset: u32,
    ) -> Result<usize, Error> {
        let mut bounce = Box::new([0u8; SECTOR_SIZE]);
        let mut done = 0usize;
        while done < buf.len() {
            let pos = offset + done as u32;
            let length = self.len();
            if pos >= length {
                break;
            }
            let sector = self
                .byte_to_sector(fs, pos)?
                .ok_or(Error::Corrupted("unmapped sector inside file bounds"))?;
            let sector_ofs = (pos as usize) % SECTOR_SIZE;
            let chunk = (buf.len() - done)
                .min((length - pos) as usize)
                .min(SECTOR_SIZE - sector_ofs);
            if sector_ofs == 0 && chunk == SECTOR_SIZE {
                // Full sector straight into the caller's buffer.
                let dst: &mut [u8; SECTOR_SIZE] =
                    (&mut buf[done..done + SECTOR_SIZE]).try_into().unwrap();
                fs.disk.read(sector, dst)?;
            } else {
                fs.disk.read(sector, &mut bounce)?;
                buf[done..done + chunk].copy_from_slice(&bounce[sector_ofs..sector_ofs + chunk]);
            }
            done += chunk;
        }
        Ok(done)
    }

    /// Writes `buf` starting at byte `offset`, extending the file first if
    /// the write ends past the current length.
    ///
    /// Returns the number of bytes written. The count is short when the
    /// write reaches [`MAX_FILE_SIZE`] or when extension fails for lack of
    /// space; it is zero while any opener denies writes.
    pub(crate) fn write_at<D: Disk>(
        &self,
        fs: &FsInner<D>,
        buf: &[u8],
        offset: u32,
    ) -> Result<usize, Error> {
        if self.deny_write_count.load(Ordering::Relaxed) > 0 {
            return Ok(0);
        }
        if offset >= MAX_FILE_SIZE {
            return Ok(0);
        }
        let writable = ((MAX_FILE_SIZE - offset) as usize).min(buf.len());
        let buf = &buf[..writable];
        if buf.is_empty() {
            return Ok(0);
        }

        let end = offset + buf.len() as u32;
        if end > self.len() {
            let _growth = self.grow.lock();
            // Re-check: another writer may have grown past `end` already.
            let mut record = *self.record.lock();
            if end > record.len() {
                match extend_to(fs, &mut record, end) {
                    Ok(()) => *self.record.lock() = record,
                    Err(Error::NoSpace) => {
                        // Keep any index roots the failed extension managed
                        // to install, so the sectors it allocated stay
                        // reachable for the release walk at the last close.
                        // The write below degrades to a short count against
                        // the old length.
                        let _ = record.write_to(&fs.disk);
                        *self.record.lock() = record;
                        log::debug!(
                            "extension of inode {} to {} bytes: out of space",
                            self.sector.into_u32(),
                            end
                        );
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        let mut bounce = Box::new([0u8; SECTOR_SIZE]);
        let mut done = 0usize;
        while done < buf.len() {
            let pos = offset + done as u32;
            let length = self.len();
            if pos >= length {
                break;
            }
            let sector = self
                .byte_to_sector(fs, pos)?
                .ok_or(Error::Corrupted("unmapped sector inside file bounds"))?;
            let sector_ofs = (pos as usize) % SECTOR_SIZE;
            let sector_left = SECTOR_SIZE - sector_ofs;
            let chunk = (buf.len() - done)
                .min((length - pos) as usize)
                .min(sector_left);
            if sector_ofs == 0 && chunk == SECTOR_SIZE {
                let src: &[u8; SECTOR_SIZE] = buf[done..done + SECTOR_SIZE].try_into().unwrap();
                fs.disk.write(sector, src)?;
            } else {
                // Preserve the bytes of the sector we are not writing.
                if sector_ofs > 0 || chunk < sector_left {
                    fs.disk.read(sector, &mut bounce)?;
                } else {
                    bounce.fill(0);
                }
                bounce[sector_ofs..sector_ofs + chunk].copy_from_slice(&buf[done..done + chunk]);
                fs.disk.write(sector, &bounce)?;
            }
            done += chunk;
        }
        Ok(done)
    }
}

/// Resolves `pos` against a record snapshot.
fn locate<D: Disk>(
    fs: &FsInner<D>,
    record: &DiskInode,
    pos: u32,
) -> Result<Option<SectorNumber>, Error> {
    if pos >= record.len() {
        return Ok(None);
    }
    let k = (pos as usize) / SECTOR_SIZE;
    if let Some(root) = record.indirect {
        if k >= PTRS_PER_BLOCK {
            return Err(Error::Corrupted("length exceeds single-indirect reach"));
        }
        let block = IndirectBlock::read_from(&fs.disk, root)?;
        Ok(block[k])
    } else if let Some(root) = record.double_indirect {
        let level1 = IndirectBlock::read_from(&fs.disk, root)?;
        let mid = level1[k / PTRS_PER_BLOCK]
            .ok_or(Error::Corrupted("unmapped double-indirect group"))?;
        let block = IndirectBlock::read_from(&fs.disk, mid)?;
        Ok(block[k % PTRS_PER_BLOCK])
    } else {
        Ok(None)
    }
}

/// Extends `record` so that it covers `new_length` bytes, then persists it.
///
/// Every appended sector is allocated, zeroed, and installed in the index
/// before the new length is published. On failure the record's length is
/// left untouched; index blocks already updated stay installed so a later
/// release walk can find every allocated sector.
pub(crate) fn extend_to<D: Disk>(
    fs: &FsInner<D>,
    record: &mut DiskInode,
    new_length: u32,
) -> Result<(), Error> {
    if new_length <= record.len() {
        return Ok(());
    }
    debug_assert!(new_length <= MAX_FILE_SIZE);

    let first = sectors_for(record.len());
    let last = sectors_for(new_length);

    // Working copies of the index blocks touched by this extension.
    let mut level1: Option<(SectorNumber, IndirectBlock)> = None;
    let mut level2: Option<(SectorNumber, IndirectBlock)> = None;

    let grown = grow_range(fs, record, first, last, &mut level1, &mut level2);

    // Flush the working blocks even when the growth loop failed, so every
    // allocated sector stays reachable from the record.
    let flushed1 = match &level1 {
        Some((sector, block)) => block.write_to(&fs.disk, *sector),
        None => Ok(()),
    };
    let flushed2 = match &level2 {
        Some((sector, block)) => block.write_to(&fs.disk, *sector),
        None => Ok(()),
    };
    grown?;
    flushed1?;
    flushed2?;

    record.length = new_length as i32;
    record.write_to(&fs.disk)
}

fn grow_range<D: Disk>(
    fs: &FsInner<D>,
    record: &mut DiskInode,
    first: u32,
    last: u32,
    level1: &mut Option<(SectorNumber, IndirectBlock)>,
    level2: &mut Option<(SectorNumber, IndirectBlock)>,
) -> Result<(), Error> {
    for k in first..last {
        let k = k as usize;
        if k < PTRS_PER_BLOCK {
            if record.indirect.is_none() {
                let sector = fs.allocate_zeroed()?;
                record.indirect = Some(sector);
                *level1 = Some((sector, IndirectBlock::default()));
            } else if level1.is_none() {
                let sector = record.indirect.unwrap();
                *level1 = Some((sector, IndirectBlock::read_from(&fs.disk, sector)?));
            }
        } else {
            if k == PTRS_PER_BLOCK {
                // The 129th sector: demote the single-indirect root to
                // entry 0 of a fresh double-indirect root.
                if let Some((sector, block)) = level1.take() {
                    block.write_to(&fs.disk, sector)?;
                }
                let root = fs.allocate_zeroed()?;
                let mut block = IndirectBlock::default();
                block[0] = record.indirect.take();
                record.double_indirect = Some(root);
                *level2 = Some((root, block));
            }
            if level2.is_none() {
                let root = record
                    .double_indirect
                    .ok_or(Error::Corrupted("missing double-indirect root"))?;
                *level2 = Some((root, IndirectBlock::read_from(&fs.disk, root)?));
            }
            if k % PTRS_PER_BLOCK == 0 {
                // Entering a new group: install a fresh level-1 block.
                if let Some((sector, block)) = level1.take() {
                    block.write_to(&fs.disk, sector)?;
                }
                let sector = fs.allocate_zeroed()?;
                level2.as_mut().unwrap().1[k / PTRS_PER_BLOCK] = Some(sector);
                *level1 = Some((sector, IndirectBlock::default()));
            } else if level1.is_none() {
                let sector = level2.as_ref().unwrap().1[k / PTRS_PER_BLOCK]
                    .ok_or(Error::Corrupted("unmapped double-indirect group"))?;
                *level1 = Some((sector, IndirectBlock::read_from(&fs.disk, sector)?));
            }
        }

        let data = fs.allocate_zeroed()?;
        level1.as_mut().unwrap().1[k % PTRS_PER_BLOCK] = Some(data);
    }
    Ok(())
}

/// Initializes an inode of `length` bytes at `sector`.
///
/// The sector itself must already be reserved by the caller. Writes a
/// zero-length record first, then grows it to `length`; lengths beyond
/// [`MAX_FILE_SIZE`] are clamped. If growth fails, every sector it
/// allocated is released again before returning.
pub(crate) fn create<D: Disk>(
    fs: &FsInner<D>,
    sector: SectorNumber,
    length: u32,
    ftype: FileType,
) -> Result<(), Error> {
    let length = length.min(MAX_FILE_SIZE);
    let mut record = DiskInode::new(sector, ftype);
    record.write_to(&fs.disk)?;
    if let Err(e) = extend_to(fs, &mut record, length) {
        let _ = release_tree(fs, &record);
        return Err(e);
    }
    Ok(())
}

/// Releases every sector installed in the record's index trees, the index
/// blocks themselves, and finally the record's own sector.
pub(crate) fn destroy<D: Disk>(fs: &FsInner<D>, sector: SectorNumber) -> Result<(), Error> {
    let record = DiskInode::read_from(&fs.disk, sector)?;
    release_tree(fs, &record)?;
    fs.free_map.lock().release(sector, 1);
    Ok(())
}

/// Frees all data and index sectors reachable from `record`, leaving the
/// record's own sector to the caller.
fn release_tree<D: Disk>(fs: &FsInner<D>, record: &DiskInode) -> Result<(), Error> {
    if let Some(root) = record.indirect {
        let block = IndirectBlock::read_from(&fs.disk, root)?;
        let mut free_map = fs.free_map.lock();
        for sector in block.iter().filter_map(|e| *e) {
            free_map.release(sector, 1);
        }
        free_map.release(root, 1);
    }
    if let Some(root) = record.double_indirect {
        let level1 = IndirectBlock::read_from(&fs.disk, root)?;
        for mid in level1.iter().filter_map(|e| *e) {
            let block = IndirectBlock::read_from(&fs.disk, mid)?;
            let mut free_map = fs.free_map.lock();
            for sector in block.iter().filter_map(|e| *e) {
                free_map.release(sector, 1);
            }
            free_map.release(mid, 1);
        }
        fs.free_map.lock().release(root, 1);
    }
    Ok(())
}

/// The open-inode registry.
///
/// Keyed by inode sector; holds one shared [`OpenInode`] per open sector.
pub(crate) struct InodeTable {
    entries: Mutex<BTreeMap<u32, Arc<OpenInode>>>,
}

impl InodeTable {
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    /// Opens the inode stored at `sector`.
    ///
    /// If the sector is already open this returns the shared entry with
    /// its open count bumped; otherwise the record is read from disk and a
    /// fresh entry is inserted.
    pub(crate) fn open<D: Disk>(
        &self,
        fs: &FsInner<D>,
        sector: SectorNumber,
    ) -> Result<Arc<OpenInode>, Error> {
        let mut entries = self.entries.lock();
        match entries.entry(sector.into_u32()) {
            Entry::Occupied(en) => {
                let inode = en.get().clone();
                inode.open_count.fetch_add(1, Ordering::Relaxed);
                Ok(inode)
            }
            Entry::Vacant(en) => {
                let record = DiskInode::read_from(&fs.disk, sector)?;
                let inode = Arc::new(OpenInode {
                    sector,
                    record: Mutex::new(record),
                    open_count: AtomicU32::new(1),
                    removed: AtomicBool::new(false),
                    deny_write_count: AtomicU32::new(0),
                    grow: Mutex::new(()),
                });
                en.insert(inode.clone());
                Ok(inode)
            }
        }
    }

    /// Duplicates an opener of an already-open inode.
    pub(crate) fn reopen(&self, inode: &Arc<OpenInode>) -> Arc<OpenInode> {
        inode.open_count.fetch_add(1, Ordering::Relaxed);
        inode.clone()
    }

    /// Closes one opener.
    ///
    /// When the last opener leaves, the entry is evicted and, if the inode
    /// was removed, every sector reachable from the record plus the record
    /// sector itself is released.
    pub(crate) fn close<D: Disk>(
        &self,
        fs: &FsInner<D>,
        inode: &Arc<OpenInode>,
    ) -> Result<(), Error> {
        let mut entries = self.entries.lock();
        if inode.open_count.fetch_sub(1, Ordering::Relaxed) != 1 {
            return Ok(());
        }
        entries.remove(&inode.sector().into_u32());
        drop(entries);

        if !inode.is_removed() {
            return Ok(());
        }
        let record = *inode.record.lock();
        release_tree(fs, &record)?;
        fs.free_map.lock().release(record.sector(), 1);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{disk::MemDisk, fs::FileSys};
    use alloc::vec;

    fn scratch() -> FileSys<MemDisk> {
        FileSys::format(MemDisk::new(2048)).expect("format must succeed")
    }

    #[test]
    fn zero_length_inode_has_no_index() {
        let fs = scratch();
        let sector = fs.0.free_map.lock().allocate(1).unwrap();
        create(&fs.0, sector, 0, FileType::RegularFile).unwrap();

        let record = DiskInode::read_from(&fs.0.disk, sector).unwrap();
        assert_eq!(record.len(), 0);
        assert_eq!(record.indirect, None);
        assert_eq!(record.double_indirect, None);
    }

    #[test]
    fn growth_promotes_across_the_single_indirect_boundary() {
        let fs = scratch();
        let sector = fs.0.free_map.lock().allocate(1).unwrap();
        // 130 sectors: two past the single-indirect reach.
        create(&fs.0, sector, 130 * SECTOR_SIZE as u32, FileType::RegularFile).unwrap();

        let record = DiskInode::read_from(&fs.0.disk, sector).unwrap();
        assert_eq!(record.indirect, None);
        assert!(record.double_indirect.is_some());

        // Every in-bounds position maps to a distinct, in-use sector.
        let inode = fs.0.inodes.open(&fs.0, sector).unwrap();
        let mut seen = vec![];
        for k in 0..130u32 {
            let mapped = inode
                .byte_to_sector(&fs.0, k * SECTOR_SIZE as u32)
                .unwrap()
                .expect("every sector below the length is mapped");
            assert!(fs.0.free_map.lock().is_used(mapped));
            assert!(!seen.contains(&mapped), "sector mapped twice");
            seen.push(mapped);
        }
        assert_eq!(
            inode.byte_to_sector(&fs.0, 130 * SECTOR_SIZE as u32).unwrap(),
            None
        );
        fs.0.inodes.close(&fs.0, &inode).unwrap();
    }

    #[test]
    fn write_then_read_round_trip() {
        let fs = scratch();
        let sector = fs.0.free_map.lock().allocate(1).unwrap();
        create(&fs.0, sector, 0, FileType::RegularFile).unwrap();
        let inode = fs.0.inodes.open(&fs.0, sector).unwrap();

        let data: vec::Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
        assert_eq!(inode.write_at(&fs.0, &data, 100).unwrap(), data.len());
        assert_eq!(inode.len(), 3100);

        let mut out = vec![0u8; data.len()];
        assert_eq!(inode.read_at(&fs.0, &mut out, 100).unwrap(), data.len());
        assert_eq!(out, data);

        // The gap before the write reads back as zeros.
        let mut head = [0xffu8; 100];
        assert_eq!(inode.read_at(&fs.0, &mut head, 0).unwrap(), 100);
        assert!(head.iter().all(|&b| b == 0));

        fs.0.inodes.close(&fs.0, &inode).unwrap();
    }

    #[test]
    fn registry_shares_one_entry_per_sector() {
        let fs = scratch();
        let sector = fs.0.free_map.lock().allocate(1).unwrap();
        create(&fs.0, sector, 0, FileType::RegularFile).unwrap();

        let a = fs.0.inodes.open(&fs.0, sector).unwrap();
        let b = fs.0.inodes.open(&fs.0, sector).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.open_count(), 2);

        fs.0.inodes.close(&fs.0, &a).unwrap();
        assert_eq!(b.open_count(), 1);
        fs.0.inodes.close(&fs.0, &b).unwrap();
    }

    #[test]
    fn removed_inode_releases_sectors_at_last_close() {
        let fs = scratch();
        let sector = fs.0.free_map.lock().allocate(1).unwrap();
        create(&fs.0, sector, 0, FileType::RegularFile).unwrap();

        let inode = fs.0.inodes.open(&fs.0, sector).unwrap();
        inode.write_at(&fs.0, b"still readable", 0).unwrap();
        let free_before = fs.0.free_map.lock().free_count();

        inode.mark_removed();
        let mut out = [0u8; 14];
        assert_eq!(inode.read_at(&fs.0, &mut out, 0).unwrap(), 14);
        assert_eq!(&out, b"still readable");

        fs.0.inodes.close(&fs.0, &inode).unwrap();
        // Data sector + level-1 block + the record itself.
        assert_eq!(fs.0.free_map.lock().free_count(), free_before + 3);
    }

    #[test]
    fn deny_write_blocks_writers() {
        let fs = scratch();
        let sector = fs.0.free_map.lock().allocate(1).unwrap();
        create(&fs.0, sector, 0, FileType::RegularFile).unwrap();
        let inode = fs.0.inodes.open(&fs.0, sector).unwrap();

        inode.deny_write();
        assert_eq!(inode.write_at(&fs.0, b"nope", 0).unwrap(), 0);
        inode.allow_write();
        assert_eq!(inode.write_at(&fs.0, b"yes", 0).unwrap(), 3);

        fs.0.inodes.close(&fs.0, &inode).unwrap();
    }

    #[test]
    fn create_rolls_back_when_the_disk_fills_up() {
        // A volume too small for a 300-sector file.
        let fs = FileSys::format(MemDisk::new(64)).expect("format must succeed");
        let free_before = fs.0.free_map.lock().free_count();
        let sector = fs.0.free_map.lock().allocate(1).unwrap();

        let r = create(&fs.0, sector, 300 * SECTOR_SIZE as u32, FileType::RegularFile);
        assert_eq!(r, Err(Error::NoSpace));
        fs.0.free_map.lock().release(sector, 1);

        assert_eq!(fs.0.free_map.lock().free_count(), free_before);
    }
}
