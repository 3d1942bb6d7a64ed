//! Device migration state (C3): per-device cursors, totals, flags, and the AIO bitmap.

use std::sync::Arc;

use crate::bitmap::ChunkBitmap;
use crate::driver::BlockDriver;

/// Per-device migration state. Owned by the pipeline's device list; created at
/// setup, destroyed at cleanup.
pub struct DeviceMigState {
    pub device: Arc<dyn BlockDriver>,
    pub total_sectors: u64,
    pub cur_sector: u64,
    pub completed_sectors: u64,
    pub cur_dirty: u64,
    pub bulk_completed: bool,
    pub shared_base: bool,
    pub sparse_enable: bool,
    pub aio_bitmap: ChunkBitmap,
}

impl DeviceMigState {
    pub fn new(device: Arc<dyn BlockDriver>, shared_base: bool, sparse_enable: bool) -> Self {
        let total_sectors = device.total_sectors();
        device.set_in_use(true);
        Self {
            total_sectors,
            cur_sector: 0,
            completed_sectors: 0,
            cur_dirty: 0,
            bulk_completed: false,
            shared_base,
            sparse_enable,
            aio_bitmap: ChunkBitmap::new(total_sectors),
            device,
        }
    }

    pub fn name(&self) -> &str {
        self.device.name()
    }

    pub fn debug_assert_invariants(&self) {
        debug_assert!(self.completed_sectors <= self.cur_sector);
        debug_assert!(self.cur_sector <= self.total_sectors);
    }
}

impl Drop for DeviceMigState {
    fn drop(&mut self) {
        self.device.set_in_use(false);
    }
}
