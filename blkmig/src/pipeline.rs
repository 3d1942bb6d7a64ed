//! Process-wide migration state (C5): the device list, completion FIFO, and the
//! bandwidth estimator shared across the bulk, dirty, send, and convergence stages.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use crate::dms::DeviceMigState;
use crate::driver::BlockDriver;
use crate::record::BlockRecord;

/// Tunable knobs captured at `setup` time (C15 owns the user-facing config struct;
/// this is the subset the pipeline consults on every iteration).
#[derive(Debug, Clone, Copy)]
pub struct PipelineParams {
    pub blk_enable: bool,
    pub shared_base: bool,
    pub sparse_enable: bool,
}

impl Default for PipelineParams {
    fn default() -> Self {
        Self {
            blk_enable: true,
            shared_base: false,
            sparse_enable: false,
        }
    }
}

/// Process-wide state for one migration attempt. Exactly one instance is alive
/// between `setup` and `complete`/`cancel`.
pub struct PipelineState {
    pub devices: Vec<DeviceMigState>,
    /// Records finished by worker threads, waiting to be framed and sent.
    pub completed: VecDeque<BlockRecord>,
    pub params: PipelineParams,
    pub bulk_completed: bool,

    /// Reads submitted to the executor but not yet drained into `completed`.
    pub submitted: u64,
    /// Completed reads sitting in `completed`, awaiting send.
    pub read_done: u64,
    /// Records sent to the transport so far this attempt.
    pub transferred: u64,

    /// Bandwidth estimator: cumulative wall-clock time and completion count, used
    /// to derive a bytes-per-second figure for the convergence oracle (§4.6:
    /// `read_bandwidth = (reads / total_time) * CHUNK_BYTES`). `total_time` is the
    /// sum of measured intervals between consecutive read-completion timestamps,
    /// anchored at submission-from-idle — not the sum of each worker's own service
    /// duration, which would overcount once more than one worker runs concurrently.
    total_time: std::time::Duration,
    reads: u64,
    /// Set when a submission arrives while the executor was otherwise idle; anchors
    /// the first completion's interval. Cleared once the pool drains back to idle.
    busy_since: Option<Instant>,
    /// Timestamp of the last read completion observed, anchoring the next interval.
    last_completion: Option<Instant>,

    /// Progress at the last PROGRESS frame emitted (percent, 0-100), used to collapse
    /// duplicate progress frames onto the same wire slot.
    pub prev_progress: Option<u8>,
}

const MIN_BANDWIDTH: f64 = 1.0;

impl PipelineState {
    pub fn new(devices: Vec<DeviceMigState>, params: PipelineParams) -> Self {
        Self {
            devices,
            completed: VecDeque::new(),
            params,
            bulk_completed: false,
            submitted: 0,
            read_done: 0,
            transferred: 0,
            total_time: std::time::Duration::ZERO,
            reads: 0,
            busy_since: None,
            last_completion: None,
            prev_progress: None,
        }
    }

    pub fn device_by_name(&self, name: &str) -> Option<&DeviceMigState> {
        self.devices.iter().find(|d| d.name() == name)
    }

    pub fn device_by_name_mut(&mut self, name: &str) -> Option<&mut DeviceMigState> {
        self.devices.iter_mut().find(|d| d.name() == name)
    }

    pub fn device_drivers(&self) -> Vec<Arc<dyn BlockDriver>> {
        self.devices.iter().map(|d| d.device.clone()).collect()
    }

    /// Marks a read as submitted to the executor, anchoring the bandwidth
    /// estimator's busy window if the pool was previously idle.
    pub fn note_submitted(&mut self) {
        if self.submitted == 0 {
            self.busy_since = Some(Instant::now());
        }
        self.submitted += 1;
    }

    /// Completion-callback contract (§5): records the wall-clock interval since the
    /// previous completion, or since submission-from-idle for the first completion
    /// of a busy window, then bumps the reads counter and the submitted count.
    pub fn record_read_completion(&mut self, completed_at: Instant) {
        let anchor = self.last_completion.or(self.busy_since).unwrap_or(completed_at);
        self.total_time += completed_at.saturating_duration_since(anchor);
        self.reads += 1;
        self.last_completion = Some(completed_at);

        self.submitted = self.submitted.saturating_sub(1);
        if self.submitted == 0 {
            // Pool drained back to idle; the next submission starts a fresh anchor.
            self.busy_since = None;
            self.last_completion = None;
        }
    }

    /// `read_bandwidth = (reads / total_time) * CHUNK_BYTES`, floored to avoid
    /// division by zero in the convergence oracle. Undefined (returns the floor)
    /// until at least one read has completed.
    pub fn bandwidth_bytes_per_sec(&self) -> f64 {
        let secs = self.total_time.as_secs_f64();
        if secs <= 0.0 || self.reads == 0 {
            return MIN_BANDWIDTH;
        }
        ((self.reads as f64 / secs) * crate::chunk::CHUNK_BYTES as f64).max(MIN_BANDWIDTH)
    }

    /// Total dirty sectors outstanding across all devices, counted in chunks.
    pub fn total_dirty_chunks(&self) -> u64 {
        self.devices.iter().map(|d| d.device.get_dirty_count()).sum()
    }

    pub fn all_bulk_completed(&self) -> bool {
        self.devices.iter().all(|d| d.bulk_completed)
    }

    pub fn total_sectors_all(&self) -> u64 {
        self.devices.iter().map(|d| d.total_sectors).sum()
    }

    pub fn completed_sectors_all(&self) -> u64 {
        self.devices.iter().map(|d| d.completed_sectors).sum()
    }

    /// Whole-attempt progress percent, 0-100, used for the PROGRESS wire frame.
    pub fn progress_percent(&self) -> u8 {
        let total = self.total_sectors_all();
        if total == 0 {
            return 100;
        }
        ((self.completed_sectors_all() * 100) / total) as u8
    }
}
