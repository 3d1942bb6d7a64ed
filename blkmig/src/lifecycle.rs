//! Lifecycle handlers (C11): setup, iterate, complete, cancel — the four entry
//! points consumed by the outer migration engine, registered under the
//! savepoint identifier `"block"`, version 1.

use std::io;
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::bulk;
use crate::chunk::CHUNK_BYTES;
use crate::config::MigrationParams;
use crate::convergence::is_stage2_completed;
use crate::dirty;
use crate::dms::DeviceMigState;
use crate::driver::BlockDriver;
use crate::error::{MigrationError, Result};
use crate::executor::ReadExecutor;
use crate::pipeline::PipelineState;
use crate::send::{absorb_completions, flush_blks};
use crate::transport::Transport;
use crate::wire;

const READ_WORKERS: usize = 4;

/// Turns a sticky transport error into a `MigrationError::Transport`, if one is
/// recorded. `io::Error` isn't `Clone`, so the transport hands back a message.
fn sticky_transport_error(t: &dyn Transport) -> Option<MigrationError> {
    t.sticky_error().map(|msg| MigrationError::Transport(io::Error::other(msg)))
}

/// One migration attempt. Owns the pipeline state and the read executor for its
/// whole lifetime, from `setup` to `complete`/`cancel`.
pub struct Migration {
    pipeline: PipelineState,
    executor: ReadExecutor,
    max_downtime_secs: f64,
}

impl Migration {
    /// `setup(stream)`: resets pipeline counters, allocates a DMS per writable
    /// non-zero-length device, begins dirty tracking, flushes the (empty) queue,
    /// emits `EOS`.
    #[instrument(skip(devices, t), fields(device_count = devices.len()))]
    pub fn setup(
        devices: Vec<Arc<dyn BlockDriver>>,
        params: MigrationParams,
        max_downtime_secs: f64,
        t: &mut dyn Transport,
    ) -> Result<Self> {
        let pipeline_params = params.resolve();
        let mut dms_list = Vec::new();
        let mut total_sector_sum = 0u64;

        for device in devices {
            if device.total_sectors() == 0 {
                debug!(device = device.name(), "skipping zero-length device at setup");
                continue;
            }
            device.set_dirty_tracking(true);
            let dms = DeviceMigState::new(device, pipeline_params.shared_base, pipeline_params.sparse_enable);
            total_sector_sum += dms.total_sectors;
            dms_list.push(dms);
        }

        let pipeline = PipelineState::new(dms_list, pipeline_params);
        info!(total_sector_sum, devices = pipeline.devices.len(), "migration setup complete");

        let mut mig = Self { pipeline, executor: ReadExecutor::new(READ_WORKERS), max_downtime_secs };
        flush_blks(&mut mig.pipeline, t)?;
        wire::put_eos(t)?;
        if let Some(e) = sticky_transport_error(t) {
            mig.cleanup();
            return Err(e);
        }
        Ok(mig)
    }

    pub fn is_active(&self) -> bool {
        self.pipeline.params.blk_enable
    }

    /// `iterate(stream)`: flushes completions, resets per-device dirty cursors,
    /// then alternates bulk/dirty submissions until the transport's rate budget
    /// is saturated or no dirty work remains. Returns the convergence verdict.
    #[instrument(skip(self, t))]
    pub fn iterate(&mut self, t: &mut dyn Transport) -> Result<bool> {
        // The one explicit poll_completions suspension point for this call.
        let completions = self.executor.poll_completions();
        absorb_completions(&mut self.pipeline, completions);

        flush_blks(&mut self.pipeline, t)?;

        for dev in &mut self.pipeline.devices {
            dev.cur_dirty = 0;
        }

        loop {
            let outstanding_bytes = (self.pipeline.submitted + self.pipeline.read_done) * CHUNK_BYTES as u64;
            if outstanding_bytes >= t.rate_limit_bytes() {
                break;
            }

            if !self.pipeline.all_bulk_completed() {
                let Some(dev) = self.pipeline.devices.iter_mut().find(|d| !d.bulk_completed) else {
                    break;
                };
                let status = bulk::advance_bulk(dev, &self.executor);
                if status.submitted() {
                    self.pipeline.note_submitted();
                }
                self.maybe_emit_progress(t)?;
                if status.is_done() && self.pipeline.all_bulk_completed() {
                    self.pipeline.bulk_completed = true;
                }
            } else {
                let Some(dev) = self
                    .pipeline
                    .devices
                    .iter_mut()
                    .find(|d| d.cur_dirty < d.total_sectors)
                else {
                    debug!("no more dirty blocks this iteration");
                    break;
                };
                let (status, drained) = dirty::advance_dirty_async(dev, &self.executor);
                if !drained.is_empty() {
                    absorb_completions(&mut self.pipeline, drained);
                }
                if status == dirty::Status::Handled {
                    self.pipeline.note_submitted();
                }
            }
        }

        flush_blks(&mut self.pipeline, t)?;
        wire::put_eos(t)?;

        if let Some(e) = sticky_transport_error(t) {
            self.cleanup();
            return Err(e);
        }

        let residual_dirty_bytes = self.pipeline.total_dirty_chunks() * CHUNK_BYTES as u64;
        Ok(is_stage2_completed(
            self.pipeline.bulk_completed,
            residual_dirty_bytes,
            self.pipeline.bandwidth_bytes_per_sec(),
            self.max_downtime_secs,
        ))
    }

    fn maybe_emit_progress(&mut self, t: &mut dyn Transport) -> Result<()> {
        let percent = self.pipeline.progress_percent();
        if self.pipeline.prev_progress != Some(percent) {
            wire::put_progress(t, percent)?;
            self.pipeline.prev_progress = Some(percent);
        }
        Ok(())
    }

    /// `complete(stream)`: flushes, resets dirty cursors, asserts the bulk path
    /// is closed, then drives the dirty phase synchronously (cut-over) until
    /// every device is clean. Emits a 100% progress frame, cleans up, emits EOS.
    #[instrument(skip(self, t))]
    pub fn complete(mut self, t: &mut dyn Transport) -> Result<()> {
        // The bulk path only truly closes once every in-flight read from the last
        // iterate() has been observed; quiesce them here rather than assuming the
        // caller already drove one more empty iterate() to do it.
        while self.executor.in_flight_count() > 0 {
            let completions = self.executor.drain_blocking();
            absorb_completions(&mut self.pipeline, completions);
        }
        flush_blks(&mut self.pipeline, t)?;
        for dev in &mut self.pipeline.devices {
            dev.cur_dirty = 0;
        }
        assert_eq!(self.pipeline.submitted, 0, "bulk path must be closed before complete");

        loop {
            let mut any_handled = false;
            for dev in &mut self.pipeline.devices {
                loop {
                    let (status, record) = dirty::advance_dirty_sync(dev);
                    match (status, record) {
                        (dirty::Status::Handled, Some(record)) => {
                            any_handled = true;
                            emit_sync_record(t, &record)?;
                        }
                        _ => break,
                    }
                }
            }
            if !any_handled {
                break;
            }
        }

        info!("cut-over dirty drain complete");
        wire::put_progress(t, 100)?;
        wire::put_eos(t)?;
        if let Some(e) = sticky_transport_error(t) {
            self.cleanup();
            return Err(e);
        }
        self.cleanup();
        Ok(())
    }

    /// `cancel()`: full cleanup, no frames emitted.
    pub fn cancel(mut self) {
        warn!("migration cancelled");
        self.cleanup();
    }

    fn cleanup(&mut self) {
        // Quiesce every outstanding read before tearing down devices.
        while self.executor.in_flight_count() > 0 {
            self.executor.drain_blocking();
        }
        for dev in &self.pipeline.devices {
            dev.device.set_dirty_tracking(false);
        }
        self.pipeline.devices.clear();
        self.pipeline.completed.clear();
    }
}

fn emit_sync_record(t: &mut dyn Transport, record: &crate::record::BlockRecord) -> Result<()> {
    record
        .result
        .as_ref()
        .map_err(|e| crate::error::MigrationError::Read {
            device: record.device_name.clone(),
            sector: record.sector,
            source: std::io::Error::new(e.kind(), e.to_string()),
        })?;
    let is_zero = crate::chunk::is_zero_block(&record.buf[..]);
    wire::put_device_block(t, record.sector, &record.device_name, record.payload(), is_zero)
}
