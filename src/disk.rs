//! Block device abstraction.
//!
//! The filesystem sees the disk as a flat array of 512-byte sectors with
//! synchronous read and write. Binding the crate to a real device means
//! implementing [`Disk`] for it; [`MemDisk`] is a RAM-backed implementation
//! used by the hosted tests and by callers that want a scratch volume.
use crate::{types::SectorNumber, Error};
use alloc::{sync::Arc, vec, vec::Vec};
use spin::Mutex;

/// Access granularity of the disk, in bytes.
pub const SECTOR_SIZE: usize = 512;

/// A device that stores an array of 512-byte sectors.
///
/// Both operations block until the transfer is complete. Sector 0 is
/// reserved by the on-disk format and is never issued by the filesystem;
/// [`SectorNumber`] makes it unrepresentable.
pub trait Disk: Send + Sync {
    /// Reads 512 bytes from the disk starting at `sector`.
    fn read(&self, sector: SectorNumber, buf: &mut [u8; SECTOR_SIZE]) -> Result<(), Error>;

    /// Writes 512 bytes to the disk starting at `sector`.
    fn write(&self, sector: SectorNumber, buf: &[u8; SECTOR_SIZE]) -> Result<(), Error>;

    /// Returns the number of sectors the device holds.
    fn sector_count(&self) -> u32;
}

/// An in-memory disk.
///
/// Cloning yields another handle over the same sector array, which lets a
/// volume be formatted, dropped, and mounted again in tests.
#[derive(Clone)]
pub struct MemDisk {
    sectors: Arc<Mutex<Vec<[u8; SECTOR_SIZE]>>>,
}

impl MemDisk {
    /// Creates a zero-filled disk holding `sector_count` sectors.
    pub fn new(sector_count: u32) -> Self {
        Self {
            sectors: Arc::new(Mutex::new(vec![[0; SECTOR_SIZE]; sector_count as usize])),
        }
    }
}

impl Disk for MemDisk {
    fn read(&self, sector: SectorNumber, buf: &mut [u8; SECTOR_SIZE]) -> Result<(), Error> {
        let sectors = self.sectors.lock();
        let src = sectors.get(sector.into_u32() as usize).ok_or(Error::Io)?;
        buf.copy_from_slice(src);
        Ok(())
    }

    fn write(&self, sector: SectorNumber, buf: &[u8; SECTOR_SIZE]) -> Result<(), Error> {
        let mut sectors = self.sectors.lock();
        let dst = sectors.get_mut(sector.into_u32() as usize).ok_or(Error::Io)?;
        dst.copy_from_slice(buf);
        Ok(())
    }

    fn sector_count(&self) -> u32 {
        self.sectors.lock().len() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_back_what_was_written() {
        let disk = MemDisk::new(16);
        let sector = SectorNumber::new(3).unwrap();
        let mut buf = [0u8; SECTOR_SIZE];
        buf[0] = 0xaa;
        buf[511] = 0x55;
        disk.write(sector, &buf).unwrap();

        let mut out = [0u8; SECTOR_SIZE];
        disk.read(sector, &mut out).unwrap();
        assert_eq!(buf, out);
    }

    #[test]
    fn out_of_range_sector_is_an_io_error() {
        let disk = MemDisk::new(4);
        let mut buf = [0u8; SECTOR_SIZE];
        assert_eq!(
            disk.read(SectorNumber::new(4).unwrap(), &mut buf),
            Err(Error::Io)
        );
    }
}
