//! Async read executor (C13): a fixed worker-thread pool that performs the
//! synchronous `BlockDriver::read_sync` calls off the cooperative thread, handing
//! results back only at the two suspension points the core observes them at —
//! the explicit `poll_completions` call inside `iterate`, and the explicit drain
//! before resubmitting a chunk that's already in flight.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use crossbeam_channel::{Receiver, Sender};

use crate::driver::BlockDriver;
use crate::record::BlockRecord;

struct ReadJob {
    device: Arc<dyn BlockDriver>,
    device_name: String,
    sector: u64,
    nr_sectors: u64,
    from_bulk: bool,
    sparse_enable: bool,
}

/// A finished read, with the wall-clock instant it completed. The pipeline's
/// bandwidth estimator measures intervals between these instants rather than
/// each worker's own service duration, so concurrent workers don't inflate the
/// estimate past real wall-clock throughput.
pub struct ReadCompletion {
    pub record: BlockRecord,
    pub completed_at: Instant,
}

/// Fixed-size worker pool dispatching `read_sync` calls off the cooperative thread.
pub struct ReadExecutor {
    job_tx: Sender<ReadJob>,
    completion_rx: Receiver<ReadCompletion>,
    workers: Vec<JoinHandle<()>>,
    in_flight: AtomicU64,
}

impl ReadExecutor {
    pub fn new(num_workers: usize) -> Self {
        let (job_tx, job_rx) = crossbeam_channel::unbounded::<ReadJob>();
        let (completion_tx, completion_rx) = crossbeam_channel::unbounded::<ReadCompletion>();

        let workers = (0..num_workers.max(1))
            .map(|_| {
                let job_rx = job_rx.clone();
                let completion_tx = completion_tx.clone();
                std::thread::spawn(move || {
                    while let Ok(job) = job_rx.recv() {
                        let mut record = BlockRecord::new(
                            job.device_name,
                            job.sector,
                            job.nr_sectors,
                            job.from_bulk,
                            job.sparse_enable,
                        );
                        let len = record.buf.len().min(
                            (job.nr_sectors * crate::chunk::SECTOR_BYTES) as usize,
                        );
                        record.result = job.device.read_sync(job.sector, job.nr_sectors, &mut record.buf[..len]);
                        let completed_at = Instant::now();
                        if completion_tx.send(ReadCompletion { record, completed_at }).is_err() {
                            break;
                        }
                    }
                })
            })
            .collect();

        Self {
            job_tx,
            completion_rx,
            workers,
            in_flight: AtomicU64::new(0),
        }
    }

    /// Submits a read. Non-blocking; the result arrives on a later `poll_completions`.
    #[allow(clippy::too_many_arguments)]
    pub fn submit_read(
        &self,
        device: Arc<dyn BlockDriver>,
        device_name: String,
        sector: u64,
        nr_sectors: u64,
        from_bulk: bool,
        sparse_enable: bool,
    ) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        // channel is unbounded and workers never exit while `self` is alive, so this
        // can only fail during shutdown, which callers don't do mid-attempt.
        let _ = self.job_tx.send(ReadJob {
            device,
            device_name,
            sector,
            nr_sectors,
            from_bulk,
            sparse_enable,
        });
    }

    pub fn in_flight_count(&self) -> u64 {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Drains every completion currently available without blocking. Called once
    /// per `iterate`.
    pub fn poll_completions(&self) -> Vec<ReadCompletion> {
        let mut out = Vec::new();
        while let Ok(c) = self.completion_rx.try_recv() {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            out.push(c);
        }
        out
    }

    /// Blocks until at least one completion is available, then drains the rest
    /// non-blockingly. Used when resubmitting a chunk already in flight forces a
    /// wait for room.
    pub fn drain_blocking(&self) -> Vec<ReadCompletion> {
        let mut out = Vec::new();
        if let Ok(first) = self.completion_rx.recv() {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            out.push(first);
        }
        out.extend(self.poll_completions());
        out
    }
}

impl Drop for ReadExecutor {
    fn drop(&mut self) {
        // Dropping job_tx's last sender closes the channel; workers see recv() fail
        // and exit. We don't join here to avoid blocking on slow in-flight I/O during
        // teardown; threads are daemon-like for the process lifetime of a CLI run.
        for w in self.workers.drain(..) {
            drop(w);
        }
    }
}
