//! Shared-disk handles and deadline-bound read/write primitives.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::time;
use tracing::warn;

use crate::buf::AlignedBuf;
use crate::errors::{Error, Result};

/// BLKSSZGET from <linux/fs.h>: logical sector size of a block device.
const BLKSSZGET: libc::c_ulong = 0x1268;

/// A shared block device (or backing file) plus the byte offset of the
/// lease area this handle addresses.
#[derive(Debug, Clone)]
pub struct SyncDisk {
    path: PathBuf,
    offset: u64,
    sector_size: u32,
    file: Arc<File>,
}

impl SyncDisk {
    /// Open with `O_DIRECT | O_SYNC`. This is the mode used against real
    /// shared block devices: writes are durable when the syscall returns.
    pub fn open_direct(path: impl AsRef<Path>, offset: u64) -> Result<Self> {
        Self::open(path, offset, libc::O_DIRECT | libc::O_SYNC)
    }

    /// Buffered open, for lease areas backed by regular files.
    pub fn open_buffered(path: impl AsRef<Path>, offset: u64) -> Result<Self> {
        Self::open(path, offset, 0)
    }

    fn open(path: impl AsRef<Path>, offset: u64, flags: i32) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(flags)
            .open(&path)
            .map_err(|source| Error::Io {
                path: path.display().to_string(),
                source,
            })?;
        let sector_size = probe_sector_size(&file);
        Ok(SyncDisk {
            path,
            offset,
            sector_size,
            file: Arc::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Byte offset of the lease area on the underlying device.
    pub fn base_offset(&self) -> u64 {
        self.offset
    }

    /// Logical sector size reported by the device; 512 for regular files.
    pub fn sector_size(&self) -> u32 {
        self.sector_size
    }

    pub(crate) fn path_string(&self) -> String {
        self.path.display().to_string()
    }

    fn check_aligned(&self, area_offset: u64, len: usize, sector_size: u32) -> Result<()> {
        if sector_size == 0
            || area_offset % u64::from(sector_size) != 0
            || len == 0
            || len % sector_size as usize != 0
        {
            return Err(Error::Misaligned {
                path: self.path_string(),
                offset: area_offset,
                len,
                sector_size,
            });
        }
        Ok(())
    }
}

/// Ask the device for its logical sector size; regular files (and devices
/// we cannot ioctl) fall back to 512.
fn probe_sector_size(file: &File) -> u32 {
    let mut ssz: libc::c_int = 0;
    // SAFETY: fd is valid for the lifetime of `file`; BLKSSZGET writes one int.
    let rv = unsafe { libc::ioctl(file.as_raw_fd(), BLKSSZGET, &mut ssz) };
    match (rv, ssz) {
        (0, 512) | (0, 4096) => ssz as u32,
        _ => 512,
    }
}

/// Read `len` bytes starting `area_offset` bytes into the lease area.
///
/// A missed deadline abandons the buffer to the blocking task; the caller
/// gets [`Error::Timeout`] and the memory is reclaimed only when the kernel
/// finishes with it.
pub async fn read_iobuf(
    disk: &SyncDisk,
    area_offset: u64,
    len: usize,
    sector_size: u32,
    io_timeout: Duration,
) -> Result<AlignedBuf> {
    disk.check_aligned(area_offset, len, sector_size)?;
    let mut buf = AlignedBuf::zeroed(len);
    let file = Arc::clone(&disk.file);
    let abs = disk.offset + area_offset;
    let path = disk.path_string();

    let task = tokio::task::spawn_blocking(move || {
        file.read_exact_at(buf.as_mut(), abs).map(|()| buf)
    });
    match time::timeout(io_timeout, task).await {
        Err(_) => {
            warn!(%path, offset = abs, len, "read missed deadline, buffer abandoned");
            Err(Error::Timeout {
                path,
                timeout: io_timeout,
            })
        }
        Ok(Err(join)) => Err(Error::TaskFailed(join.to_string())),
        Ok(Ok(Err(source))) => Err(Error::Io { path, source }),
        Ok(Ok(Ok(buf))) => Ok(buf),
    }
}

/// Write `buf` starting `area_offset` bytes into the lease area. The buffer
/// is consumed: on timeout it stays with the blocking task.
pub async fn write_iobuf(
    disk: &SyncDisk,
    area_offset: u64,
    buf: AlignedBuf,
    sector_size: u32,
    io_timeout: Duration,
) -> Result<()> {
    disk.check_aligned(area_offset, buf.len(), sector_size)?;
    let file = Arc::clone(&disk.file);
    let abs = disk.offset + area_offset;
    let path = disk.path_string();

    let task = tokio::task::spawn_blocking(move || {
        let res = file.write_all_at(buf.as_ref(), abs);
        drop(buf);
        res
    });
    match time::timeout(io_timeout, task).await {
        Err(_) => {
            warn!(%path, offset = abs, "write missed deadline, buffer abandoned");
            Err(Error::Timeout {
                path,
                timeout: io_timeout,
            })
        }
        Ok(Err(join)) => Err(Error::TaskFailed(join.to_string())),
        Ok(Ok(Err(source))) => Err(Error::Io { path, source }),
        Ok(Ok(Ok(()))) => Ok(()),
    }
}

/// Read `count` whole sectors starting at sector `sector_nr` of the area.
pub async fn read_sectors(
    disk: &SyncDisk,
    sector_size: u32,
    sector_nr: u64,
    count: u64,
    io_timeout: Duration,
) -> Result<AlignedBuf> {
    let offset = sector_nr * u64::from(sector_size);
    let len = (count as usize) * sector_size as usize;
    read_iobuf(disk, offset, len, sector_size, io_timeout).await
}

/// Write one sector; `data` shorter than the sector is zero-padded.
pub async fn write_sector(
    disk: &SyncDisk,
    sector_size: u32,
    sector_nr: u64,
    data: &[u8],
    io_timeout: Duration,
) -> Result<()> {
    let offset = sector_nr * u64::from(sector_size);
    let buf = AlignedBuf::from_slice(data, sector_size as usize);
    write_iobuf(disk, offset, buf, sector_size, io_timeout).await
}

#[cfg(test)]
mod tests {
    use super::*;

    const IO_TIMEOUT: Duration = Duration::from_secs(10);

    fn scratch_disk(sectors: u64) -> (tempfile::NamedTempFile, SyncDisk) {
        let file = tempfile::NamedTempFile::new().unwrap();
        file.as_file().set_len(sectors * 512).unwrap();
        let disk = SyncDisk::open_buffered(file.path(), 0).unwrap();
        (file, disk)
    }

    #[tokio::test]
    async fn test_sector_round_trip() {
        let (_file, disk) = scratch_disk(8);
        write_sector(&disk, 512, 3, b"lease data", IO_TIMEOUT)
            .await
            .unwrap();

        let buf = read_sectors(&disk, 512, 3, 1, IO_TIMEOUT).await.unwrap();
        assert_eq!(&buf[..10], b"lease data");
        assert!(buf[10..].iter().all(|b| *b == 0));
    }

    #[tokio::test]
    async fn test_misaligned_rejected() {
        let (_file, disk) = scratch_disk(8);
        let err = read_iobuf(&disk, 100, 512, 512, IO_TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Misaligned { .. }));

        let err = read_iobuf(&disk, 0, 100, 512, IO_TIMEOUT).await.unwrap_err();
        assert!(matches!(err, Error::Misaligned { .. }));
    }

    #[tokio::test]
    async fn test_read_past_end_is_io_error() {
        let (_file, disk) = scratch_disk(2);
        let err = read_sectors(&disk, 512, 4, 1, IO_TIMEOUT).await.unwrap_err();
        assert!(matches!(err, Error::Io { .. }));
        assert!(!err.is_timeout());
    }

    #[test]
    fn test_regular_file_sector_size() {
        let (_file, disk) = scratch_disk(1);
        assert_eq!(disk.sector_size(), 512);
    }
}
