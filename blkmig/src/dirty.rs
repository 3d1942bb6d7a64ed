//! Dirty phase driver (C7): repeated passes over each device's dirty bitmap.

use crate::chunk::CHUNK_SECTORS;
use crate::dms::DeviceMigState;
use crate::executor::{ReadCompletion, ReadExecutor};
use crate::record::BlockRecord;

/// Outcome of advancing one device's dirty cursor by at most one chunk.
#[derive(Debug, PartialEq, Eq)]
pub enum Status {
    /// The dirty cursor reached the device end this call; no chunk was handled.
    Done,
    /// A dirty chunk was found and submitted (async) or emitted (sync); call
    /// again to continue the pass from the advanced cursor.
    Handled,
}

/// Advances `dev.cur_dirty` to the first dirty chunk at-or-after the cursor,
/// skipping clean chunks. Returns `None` if the cursor reached the device end.
fn find_next_dirty(dev: &mut DeviceMigState) -> Option<u64> {
    while dev.cur_dirty < dev.total_sectors {
        if dev.device.get_dirty(dev.cur_dirty) {
            return Some(dev.cur_dirty);
        }
        dev.cur_dirty += CHUNK_SECTORS;
    }
    None
}

/// Async mode (used during iteration): submit a read for the first dirty chunk
/// found, draining any already-outstanding read for that chunk first.
pub fn advance_dirty_async(dev: &mut DeviceMigState, executor: &ReadExecutor) -> (Status, Vec<ReadCompletion>) {
    let Some(chunk_start) = find_next_dirty(dev) else {
        return (Status::Done, Vec::new());
    };

    let nr_sectors = CHUNK_SECTORS.min(dev.total_sectors - chunk_start);
    let mut drained = Vec::new();

    if dev.aio_bitmap.probe(chunk_start) {
        // A read for this chunk is already in flight, and the pool may have other
        // chunks' reads outstanding too; quiesce all of them before resubmitting so
        // we never carry two outstanding reads against the same chunk (mirrors
        // `bdrv_drain_all`, not a single best-effort drain).
        while executor.in_flight_count() > 0 {
            drained.extend(executor.drain_blocking());
        }
    }

    dev.device.reset_dirty(chunk_start, nr_sectors);
    dev.aio_bitmap.set_range(chunk_start, nr_sectors, true);
    executor.submit_read(
        dev.device.clone(),
        dev.name().to_string(),
        chunk_start,
        nr_sectors,
        false,
        dev.sparse_enable,
    );

    dev.cur_dirty = chunk_start + CHUNK_SECTORS;
    (Status::Handled, drained)
}

/// Sync mode (used during cut-over, guest already paused): read the first dirty
/// chunk synchronously and return it ready to emit; no AIO bit is ever set.
pub fn advance_dirty_sync(dev: &mut DeviceMigState) -> (Status, Option<BlockRecord>) {
    let Some(chunk_start) = find_next_dirty(dev) else {
        return (Status::Done, None);
    };

    let nr_sectors = CHUNK_SECTORS.min(dev.total_sectors - chunk_start);
    let mut record = BlockRecord::new(dev.name().to_string(), chunk_start, nr_sectors, false, dev.sparse_enable);
    let len = record.buf.len().min((nr_sectors * crate::chunk::SECTOR_BYTES) as usize);
    record.result = dev.device.read_sync(chunk_start, nr_sectors, &mut record.buf[..len]);
    dev.device.reset_dirty(chunk_start, nr_sectors);

    dev.cur_dirty = chunk_start + CHUNK_SECTORS;
    (Status::Handled, Some(record))
}
