//! Bulk phase driver (C6): first-pass linear scan of one device.

use crate::chunk::CHUNK_SECTORS;
use crate::dms::DeviceMigState;
use crate::executor::ReadExecutor;

/// Outcome of advancing one device by one call.
#[derive(Debug, PartialEq, Eq)]
pub enum Status {
    /// The bulk cursor reached (or passed) the device end this call. No read was
    /// submitted.
    Done,
    /// The bulk cursor reached (or passed) the device end as a result of this
    /// call's read submission.
    DoneSubmitted,
    /// A read was submitted; more work remains.
    More,
}

impl Status {
    pub fn submitted(&self) -> bool {
        matches!(self, Status::More | Status::DoneSubmitted)
    }

    pub fn is_done(&self) -> bool {
        matches!(self, Status::Done | Status::DoneSubmitted)
    }
}

const ALLOCATION_SEARCH_WINDOW: u64 = crate::chunk::MAX_IS_ALLOCATED_SEARCH;

/// Advances `dev`'s bulk cursor by one chunk's worth of work, submitting at most
/// one asynchronous read. Mirrors `mig_save_device_bulk`.
pub fn advance_bulk(dev: &mut DeviceMigState, executor: &ReadExecutor) -> Status {
    if dev.shared_base {
        // Skip contiguous unallocated spans; shared_base means the destination
        // already has the base image, so only allocated deltas need shipping.
        while dev.cur_sector < dev.total_sectors {
            let (allocated, run) = dev
                .device
                .is_allocated(dev.cur_sector, ALLOCATION_SEARCH_WINDOW);
            if allocated {
                break;
            }
            dev.cur_sector += run.max(1);
        }
    }

    if dev.cur_sector >= dev.total_sectors {
        dev.completed_sectors = dev.total_sectors;
        dev.bulk_completed = true;
        return Status::Done;
    }

    dev.completed_sectors = dev.cur_sector;

    let chunk_start = (dev.cur_sector / CHUNK_SECTORS) * CHUNK_SECTORS;
    let nr_sectors = CHUNK_SECTORS.min(dev.total_sectors - chunk_start);

    dev.device.reset_dirty(chunk_start, nr_sectors);
    dev.aio_bitmap.set_range(chunk_start, nr_sectors, true);
    executor.submit_read(
        dev.device.clone(),
        dev.name().to_string(),
        chunk_start,
        nr_sectors,
        true,
        dev.sparse_enable,
    );

    dev.cur_sector = chunk_start + nr_sectors;

    if dev.cur_sector >= dev.total_sectors {
        dev.bulk_completed = true;
        Status::DoneSubmitted
    } else {
        Status::More
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::FileBlockDriver;
    use std::sync::Arc;

    fn scratch_file(len: u64, tag: &str) -> std::path::PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("blkmig-bulk-test-{tag}-{}-{:?}", std::process::id(), std::thread::current().id()));
        let f = std::fs::File::create(&path).unwrap();
        f.set_len(len).unwrap();
        path
    }

    #[test]
    fn bulk_scan_advances_chunk_at_a_time_and_finishes() {
        let path = scratch_file((CHUNK_SECTORS * 512) * 3, "linear");
        let drv = Arc::new(FileBlockDriver::open("vda", &path).unwrap());
        let mut dev = DeviceMigState::new(drv, false, false);
        let exec = ReadExecutor::new(1);

        assert_eq!(advance_bulk(&mut dev, &exec), Status::More);
        assert_eq!(dev.cur_sector, CHUNK_SECTORS);
        assert_eq!(advance_bulk(&mut dev, &exec), Status::More);
        // Third call submits the final chunk's read and crosses the device end.
        assert_eq!(advance_bulk(&mut dev, &exec), Status::DoneSubmitted);
        assert!(dev.bulk_completed);
        assert_eq!(dev.cur_sector, dev.total_sectors);
        // completed_sectors only catches up to total_sectors once a later call
        // observes cur_sector already past the end (§4.3 step 2).
        assert_eq!(advance_bulk(&mut dev, &exec), Status::Done);
        assert_eq!(dev.completed_sectors, dev.total_sectors);

        std::fs::remove_file(path).ok();
    }

    #[test]
    fn calling_done_again_is_idempotent() {
        let path = scratch_file(CHUNK_SECTORS * 512, "tiny");
        let drv = Arc::new(FileBlockDriver::open("vda", &path).unwrap());
        let mut dev = DeviceMigState::new(drv, false, false);
        let exec = ReadExecutor::new(1);

        // A single-chunk device still submits its one read before reporting done.
        assert_eq!(advance_bulk(&mut dev, &exec), Status::DoneSubmitted);
        assert_eq!(advance_bulk(&mut dev, &exec), Status::Done);
    }
}
