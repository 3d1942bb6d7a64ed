//! Send/flush stage (C8): drains the completion queue to the byte stream,
//! honoring the rate limit.

use crate::chunk::is_zero_block;
use crate::error::{MigrationError, Result};
use crate::pipeline::PipelineState;
use crate::record::BlockRecord;
use crate::transport::Transport;
use crate::wire;

/// Drains `pipeline.completed` front-to-back onto `t`. Stops (leaving the
/// remainder queued for the next call) as soon as the transport reports its rate
/// budget exhausted; stops and propagates the error on the first negative I/O
/// result. Mirrors `flush_blks`.
pub fn flush_blks(pipeline: &mut PipelineState, t: &mut dyn Transport) -> Result<()> {
    while let Some(record) = pipeline.completed.front() {
        if t.rate_limited() {
            break;
        }
        if let Err(e) = &record.result {
            return Err(MigrationError::Read {
                device: record.device_name.clone(),
                sector: record.sector,
                source: io_error_clone(e),
            });
        }

        let record = pipeline.completed.pop_front().expect("front() just returned Some");
        emit_record(&record, t)?;
        pipeline.read_done -= 1;
        pipeline.transferred += 1;
    }
    Ok(())
}

fn io_error_clone(e: &std::io::Error) -> std::io::Error {
    std::io::Error::new(e.kind(), e.to_string())
}

fn emit_record(record: &BlockRecord, t: &mut dyn Transport) -> Result<()> {
    let payload = record.payload();
    let is_zero = is_zero_block(&record.buf[..]);

    if record.from_bulk && record.sparse_enable && is_zero {
        // Sparse shortcut: bulk-phase all-zero chunk, destination assumed
        // zero-initialized for anything never sent.
        return Ok(());
    }

    wire::put_device_block(t, record.sector, &record.device_name, payload, is_zero)
}

/// Pushes completions drained from the executor onto the pipeline's queue and
/// updates the associated counters. Called once per `iterate`, and also after
/// the forced drain inside the dirty phase's async mode.
pub fn absorb_completions(pipeline: &mut PipelineState, completions: Vec<crate::executor::ReadCompletion>) {
    for c in completions {
        pipeline.record_read_completion(c.completed_at);
        pipeline.read_done += 1;
        if let Some(dev) = pipeline.device_by_name_mut(&c.record.device_name) {
            dev.aio_bitmap.set_range(c.record.sector, c.record.nr_sectors, false);
        }
        pipeline.completed.push_back(c.record);
    }
}
