//! The block driver contract (§6) and a reference file-backed implementation (C12).
//!
//! The migration core treats the block driver as an external collaborator: it only
//! calls through this trait and never assumes a particular backing store.

use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom};
use std::os::fd::{AsRawFd, BorrowedFd};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use nix::sys::uio::{pread, pwrite};

use crate::bitmap::ChunkBitmap;
use crate::chunk::SECTOR_BYTES;

/// Operations the migration core needs from a writable block device.
///
/// Implementors must be `Send + Sync`: reads are dispatched onto worker threads by
/// the async executor (C13) while the cooperative thread may concurrently call
/// `set_in_use`/`is_allocated`/etc.
pub trait BlockDriver: Send + Sync {
    /// Stable name used on the wire and for device resolution at load time.
    fn name(&self) -> &str;

    /// Device length in sectors.
    fn total_sectors(&self) -> u64;

    /// Synchronous read of `nr_sectors` sectors starting at `sector` into `buf`.
    /// `buf` must be at least `nr_sectors * SECTOR_BYTES` long.
    fn read_sync(&self, sector: u64, nr_sectors: u64, buf: &mut [u8]) -> io::Result<()>;

    /// Synchronous write of `nr_sectors` sectors starting at `sector` from `buf`.
    fn write_sync(&self, sector: u64, nr_sectors: u64, buf: &[u8]) -> io::Result<()>;

    /// Probes whether `sector` is allocated, searching at most `max_search` sectors
    /// forward. Returns `(is_allocated, run_length)` where `run_length` is the number
    /// of consecutive sectors sharing the same allocation state as `sector`.
    fn is_allocated(&self, sector: u64, max_search: u64) -> (bool, u64);

    /// True iff any sector in `[sector, sector + 1)`'s chunk was written since the
    /// last `reset_dirty` covering it.
    fn get_dirty(&self, sector: u64) -> bool;

    /// Count of chunks currently marked dirty.
    fn get_dirty_count(&self) -> u64;

    /// Clears dirty bits for `[sector, sector + nr_sectors)`.
    fn reset_dirty(&self, sector: u64, nr_sectors: u64);

    /// Enables or disables dirty tracking. While disabled, writes are not recorded.
    fn set_dirty_tracking(&self, enabled: bool);

    /// Pins or unpins the device "in use" for the duration of a migration attempt.
    fn set_in_use(&self, in_use: bool);
}

/// A host-file-backed [`BlockDriver`] with real dirty tracking, in the manner of
/// this codebase's disk-properties helper but without the guest-memory-mapping
/// machinery that belongs to the virtio transport layer.
pub struct FileBlockDriver {
    name: String,
    file: Mutex<File>,
    total_sectors: u64,
    dirty_tracking: AtomicBool,
    dirty: Mutex<ChunkBitmap>,
    in_use: AtomicBool,
}

impl FileBlockDriver {
    /// Opens `path` as a writable block device backed by a regular file.
    pub fn open(name: impl Into<String>, path: impl AsRef<Path>) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        if len % SECTOR_BYTES != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("file length {len} is not a multiple of the sector size"),
            ));
        }
        let total_sectors = len / SECTOR_BYTES;
        Ok(Self {
            name: name.into(),
            file: Mutex::new(file),
            total_sectors,
            dirty_tracking: AtomicBool::new(false),
            dirty: Mutex::new(ChunkBitmap::new(total_sectors)),
            in_use: AtomicBool::new(false),
        })
    }

    /// Marks the chunk(s) covering `[sector, sector + nr_sectors)` dirty, if tracking
    /// is currently enabled. Called by the backing store after a guest-visible write;
    /// exposed here so tests can simulate the guest dirtying sectors mid-migration.
    pub fn simulate_guest_write(&self, sector: u64, nr_sectors: u64, buf: &[u8]) -> io::Result<()> {
        self.write_sync(sector, nr_sectors, buf)?;
        if self.dirty_tracking.load(Ordering::Relaxed) {
            self.dirty.lock().unwrap().set_range(sector, nr_sectors, true);
        }
        Ok(())
    }

}

impl BlockDriver for FileBlockDriver {
    fn name(&self) -> &str {
        &self.name
    }

    fn total_sectors(&self) -> u64 {
        self.total_sectors
    }

    fn read_sync(&self, sector: u64, nr_sectors: u64, buf: &mut [u8]) -> io::Result<()> {
        let want = (nr_sectors * SECTOR_BYTES) as usize;
        let offset = (sector * SECTOR_BYTES) as i64;
        let file = self.file.lock().unwrap();
        let fd = unsafe { BorrowedFd::borrow_raw(file.as_raw_fd()) };
        let mut done = 0;
        while done < want {
            let n = pread(fd, &mut buf[done..want], offset + done as i64).map_err(io::Error::from)?;
            if n == 0 {
                buf[done..want].fill(0);
                break;
            }
            done += n;
        }
        Ok(())
    }

    fn write_sync(&self, sector: u64, nr_sectors: u64, buf: &[u8]) -> io::Result<()> {
        let want = (nr_sectors * SECTOR_BYTES) as usize;
        let offset = (sector * SECTOR_BYTES) as i64;
        let file = self.file.lock().unwrap();
        let fd = unsafe { BorrowedFd::borrow_raw(file.as_raw_fd()) };
        let mut done = 0;
        while done < want {
            let n = pwrite(fd, &buf[done..want], offset + done as i64).map_err(io::Error::from)?;
            done += n;
        }
        Ok(())
    }

    fn is_allocated(&self, sector: u64, max_search: u64) -> (bool, u64) {
        let offset = (sector * SECTOR_BYTES) as i64;
        let limit_offset = offset + (max_search.min(self.total_sectors - sector) * SECTOR_BYTES) as i64;

        let mut file = self.file.lock().unwrap();
        // SEEK_DATA finds the next allocated byte at-or-after offset; if it lands
        // exactly on offset, the sector is allocated. Filesystems without sparse-file
        // hole reporting return ENXIO/EINVAL, which we treat as "always allocated".
        match file.seek(SeekFrom::Start(0)) {
            Ok(_) => {}
            Err(_) => return (true, max_search),
        }
        let data_off = unsafe {
            libc::lseek(
                file.as_raw_fd(),
                offset,
                libc::SEEK_DATA,
            )
        };
        if data_off < 0 {
            // no more data ahead, or SEEK_DATA unsupported: treat the whole probed
            // window as unallocated only if the OS told us so explicitly (ENXIO).
            let errno = io::Error::last_os_error();
            return if errno.raw_os_error() == Some(libc::ENXIO) {
                (false, max_search.min(self.total_sectors - sector))
            } else {
                (true, max_search.min(self.total_sectors - sector))
            };
        }
        if data_off == offset {
            let hole_off = unsafe { libc::lseek(file.as_raw_fd(), offset, libc::SEEK_HOLE) };
            let run = if hole_off > offset {
                ((hole_off - offset) as u64 / SECTOR_BYTES).max(1)
            } else {
                1
            };
            (true, run.min(max_search))
        } else {
            let run = ((data_off - offset).min(limit_offset - offset) as u64 / SECTOR_BYTES).max(1);
            (false, run.min(max_search))
        }
    }

    fn get_dirty(&self, sector: u64) -> bool {
        self.dirty.lock().unwrap().probe(sector)
    }

    fn get_dirty_count(&self) -> u64 {
        self.dirty.lock().unwrap().count_set()
    }

    fn reset_dirty(&self, sector: u64, nr_sectors: u64) {
        self.dirty.lock().unwrap().set_range(sector, nr_sectors, false);
    }

    fn set_dirty_tracking(&self, enabled: bool) {
        self.dirty_tracking.store(enabled, Ordering::Relaxed);
        if !enabled {
            *self.dirty.lock().unwrap() = ChunkBitmap::new(self.total_sectors);
        }
    }

    fn set_in_use(&self, in_use: bool) {
        self.in_use.store(in_use, Ordering::Relaxed);
    }
}
