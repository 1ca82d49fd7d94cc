//! Capture-session wiring.
//!
//! Three execution contexts touch the event store: the controller (this
//! module, re-entering `poll` on the tracer), the tracer callbacks (which
//! run on the controller thread inside `poll`), and the sampler worker.
//! The store itself carries no synchronization, so both sinks funnel every
//! event through one shared `parking_lot::Mutex`. That mutex is the single
//! concurrency discipline of this crate; the only writers are the two sink
//! closures built here.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::event::{classify_migration, MigrationType};
use crate::pmu::PmuSampler;
use crate::store::EventStore;
use crate::topology::TopologyMap;

#[cfg(feature = "bpf")]
use crate::tracer::MigrationTracer;

/// Outcome of a capture run.
#[derive(Debug)]
pub struct SessionReport {
    /// The correlated event store, ready for queries.
    pub store: EventStore,
    /// Migrations delivered by the tracer.
    pub migrations_captured: u64,
    /// Samples delivered by the sampler.
    pub samples_captured: u64,
}

/// One profiling run: topology + tracer + sampler feeding a shared store.
pub struct Session {
    cfg: Config,
    topology: TopologyMap,
}

impl Session {
    /// Discover the topology and prepare a session.
    pub fn new(cfg: Config) -> Result<Self> {
        let topology = TopologyMap::load().context("discovering CPU topology")?;

        info!(
            p_cores = topology.p_cores().len(),
            e_cores = topology.e_cores().len(),
            hybrid = topology.is_hybrid(),
            "CPU topology discovered",
        );

        if !topology.is_hybrid() {
            warn!("not a hybrid CPU; migrations will classify as Unknown");
        }

        Ok(Self { cfg, topology })
    }

    pub fn topology(&self) -> &TopologyMap {
        &self.topology
    }

    /// Run the capture until the configured duration elapses or the token
    /// cancels, then return the populated store.
    pub fn run(&self, cancel: &CancellationToken) -> Result<SessionReport> {
        let store = Arc::new(Mutex::new(EventStore::new()));

        // Sampler worker -> store, through the shared mutex.
        let sampler_store = Arc::clone(&store);
        let mut sampler = PmuSampler::new(
            self.cfg.target_tid,
            Box::new(move |sample| sampler_store.lock().add_pmu_sample(sample)),
            self.cfg.sample_interval,
        )
        .context("opening PMU counter group")?;

        // Controller thread (inside poll) -> store, same mutex.
        #[cfg(feature = "bpf")]
        let mut tracer = {
            let tracer_store = Arc::clone(&store);
            let mut tracer = MigrationTracer::new(Box::new(move |event| {
                tracer_store.lock().add_migration(event)
            }))
            .context("loading migration tracer")?;

            tracer
                .set_target_pid(self.cfg.target_pid)
                .context("setting tracer PID filter")?;
            tracer.attach().context("attaching migration tracer")?;
            tracer
        };

        #[cfg(not(feature = "bpf"))]
        warn!("built without the bpf feature; capturing PMU samples only");

        sampler.start().context("starting PMU sampler")?;

        info!(
            duration = ?self.cfg.duration,
            interval = ?self.cfg.sample_interval,
            target_pid = ?self.cfg.target_pid,
            "capture started",
        );

        let deadline = Instant::now() + self.cfg.duration;
        while Instant::now() < deadline && !cancel.is_cancelled() {
            #[cfg(feature = "bpf")]
            tracer
                .poll(self.cfg.poll_timeout)
                .context("polling migration ring buffer")?;

            #[cfg(not(feature = "bpf"))]
            std::thread::sleep(self.cfg.poll_timeout);
        }

        sampler.stop();
        let samples_captured = sampler.sample_count();

        #[cfg(feature = "bpf")]
        let migrations_captured = {
            tracer.stop();
            tracer.event_count()
        };
        #[cfg(not(feature = "bpf"))]
        let migrations_captured = 0u64;

        // Both producers are stopped and dropped below; the store Arcs they
        // captured die with them.
        drop(sampler);
        #[cfg(feature = "bpf")]
        drop(tracer);

        let store = Arc::try_unwrap(store)
            .map_err(|_| anyhow::anyhow!("event store still shared after shutdown"))?
            .into_inner();

        self.log_summary(&store);

        Ok(SessionReport {
            store,
            migrations_captured,
            samples_captured,
        })
    }

    fn log_summary(&self, store: &EventStore) {
        let mut by_type = [0u64; 5];
        for event in store.all_migrations() {
            let idx = match classify_migration(event, &self.topology) {
                MigrationType::PToP => 0,
                MigrationType::PToE => 1,
                MigrationType::EToP => 2,
                MigrationType::EToE => 3,
                MigrationType::Unknown => 4,
            };
            by_type[idx] += 1;
        }

        info!(
            migrations = store.migration_count(),
            pmu_samples = store.pmu_sample_count(),
            p_to_p = by_type[0],
            p_to_e = by_type[1],
            e_to_p = by_type[2],
            e_to_e = by_type[3],
            unknown = by_type[4],
            "capture finished",
        );
    }
}
