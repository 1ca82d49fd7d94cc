//! Periodic PMU sampling on a dedicated worker thread.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{CounterGroup, PmuError};
use crate::clock;
use crate::event::PmuSample;

/// Callback receiving each completed sample. Runs on the sampler worker
/// thread; implementations must not block.
pub type SampleSink = Box<dyn Fn(PmuSample) + Send + Sync>;

/// Hard floor on the sampling period; shorter intervals are clamped up.
pub const MIN_INTERVAL: Duration = Duration::from_micros(100);

/// Default sampling period.
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(1);

/// Drives a worker thread that snapshots a [`CounterGroup`] at a fixed
/// cadence and delivers timestamped [`PmuSample`]s to a sink.
///
/// The sampler owns its counter group and worker; both are released on drop.
/// Like the group, the sampler is move-only.
pub struct PmuSampler {
    tid: u32,
    interval: Duration,
    group: Arc<CounterGroup>,
    callback: Arc<SampleSink>,
    cancel: CancellationToken,
    worker: Option<JoinHandle<()>>,
    sample_count: Arc<AtomicU64>,
    running: AtomicBool,
}

impl PmuSampler {
    /// Create a sampler for a thread.
    ///
    /// `tid` 0 (or `-1`, remapped for parity with the counter-group
    /// convention) targets the calling thread; in that case the calling
    /// thread's real tid is recorded so samples correlate with migration
    /// records. Intervals below [`MIN_INTERVAL`] are clamped up.
    pub fn new(
        tid: libc::pid_t,
        callback: SampleSink,
        interval: Duration,
    ) -> Result<Self, PmuError> {
        let effective_tid = if tid == -1 { 0 } else { tid };
        let interval = interval.max(MIN_INTERVAL);

        let group = CounterGroup::new(effective_tid, -1)?;

        let recorded_tid = if effective_tid == 0 {
            unsafe { libc::gettid() as u32 }
        } else {
            effective_tid as u32
        };

        Ok(Self {
            tid: recorded_tid,
            interval,
            group: Arc::new(group),
            callback: Arc::new(callback),
            cancel: CancellationToken::new(),
            worker: None,
            sample_count: Arc::new(AtomicU64::new(0)),
            running: AtomicBool::new(false),
        })
    }

    /// Reset and enable the counters, then spawn the sampling worker.
    ///
    /// Fails with [`PmuError::InvalidState`] when already running. Reset and
    /// enable failures are surfaced unchanged and leave the sampler stopped.
    pub fn start(&mut self) -> Result<(), PmuError> {
        if self.running.load(Ordering::Acquire) {
            return Err(PmuError::InvalidState);
        }

        self.group.reset()?;
        self.group.enable()?;

        self.sample_count.store(0, Ordering::Relaxed);
        self.cancel = CancellationToken::new();
        self.running.store(true, Ordering::Release);

        let group = Arc::clone(&self.group);
        let callback = Arc::clone(&self.callback);
        let sample_count = Arc::clone(&self.sample_count);
        let cancel = self.cancel.clone();
        let interval = self.interval;
        let tid = self.tid;

        let spawned = std::thread::Builder::new()
            .name("threveal-sampler".into())
            .spawn(move || {
                sampling_loop(&group, &callback, &sample_count, &cancel, interval, tid);
            });

        match spawned {
            Ok(handle) => {
                self.worker = Some(handle);
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "failed to spawn sampling worker");
                let _ = self.group.disable();
                self.running.store(false, Ordering::Release);
                Err(PmuError::InvalidState)
            }
        }
    }

    /// Cancel the worker, join it, and disable the counters.
    ///
    /// Idempotent; disable errors during shutdown are discarded.
    pub fn stop(&mut self) {
        if !self.running.load(Ordering::Acquire) {
            return;
        }

        self.cancel.cancel();

        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }

        let _ = self.group.disable();
        self.running.store(false, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Samples delivered since the last `start`.
    pub fn sample_count(&self) -> u64 {
        self.sample_count.load(Ordering::Relaxed)
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn target_tid(&self) -> u32 {
        self.tid
    }
}

impl Drop for PmuSampler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn sampling_loop(
    group: &CounterGroup,
    callback: &SampleSink,
    sample_count: &AtomicU64,
    cancel: &CancellationToken,
    interval: Duration,
    tid: u32,
) {
    while !cancel.is_cancelled() {
        // A failed read skips this tick; the worker never aborts on
        // steady-state counter errors.
        match group.read() {
            Ok(reading) => {
                let sample = PmuSample {
                    timestamp_ns: clock::monotonic_ns(),
                    tid,
                    cpu_id: clock::current_cpu(),
                    instructions: reading.instructions,
                    cycles: reading.cycles,
                    llc_misses: reading.llc_load_misses,
                    llc_references: reading.llc_loads,
                    branch_misses: reading.branch_misses,
                };

                callback(sample);
                sample_count.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                debug!(error = %err, "skipping sample tick");
            }
        }

        std::thread::sleep(interval);
    }
}
