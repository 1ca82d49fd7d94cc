//! aya-backed implementation of the migration tracer.

use std::io;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use aya::maps::{Array, MapData, RingBuf};
use aya::programs::trace_point::TracePointLinkId;
use aya::programs::TracePoint;
use aya::{Btf, Ebpf, EbpfLoader};
use tracing::{debug, warn};

use super::parse::decode_migration;
use super::{MigrationSink, TracerError};

/// Compiled BPF object, embedded at build time.
///
/// `include_bytes_aligned!` guarantees the alignment aya-obj's ELF parser
/// needs; plain `include_bytes!` only provides 1-byte alignment.
const BPF_OBJ: &[u8] = aya::include_bytes_aligned!(concat!(env!("OUT_DIR"), "/threveal.bpf.o"));

const PROG_NAME: &str = "handle_sched_migrate_task";
const EVENTS_MAP: &str = "events";
const CONFIG_MAP: &str = "migration_config";

/// Index of the target-PID entry in the configuration map.
const CONFIG_TARGET_PID: u32 = 0;

/// Owns the loaded BPF object, the ring-buffer consumer, and the tracepoint
/// link.
///
/// Lifecycle: `new` opens and loads the object (program loaded but not
/// attached), `attach`/`detach` manage the tracepoint probe, `poll` drains
/// the ring buffer on the calling thread. Dropping the tracer detaches the
/// probe, then releases the ring buffer and the BPF object, in that order.
///
/// One thread owns the tracer; `poll` takes `&mut self` so it cannot race
/// `attach`/`detach` on the same instance.
pub struct MigrationTracer {
    callback: MigrationSink,
    event_count: AtomicU64,
    link: Option<TracePointLinkId>,
    // Declaration order is drop order: ring buffer before the BPF object.
    ring: RingBuf<MapData>,
    ebpf: Ebpf,
}

impl MigrationTracer {
    /// Open the embedded BPF object against the kernel's BTF, load the
    /// tracepoint program, and take the ring-buffer consumer.
    pub fn new(callback: MigrationSink) -> Result<Self, TracerError> {
        // Passing the BTF explicitly keeps CO-RE relocations working on
        // kernels where the loader would not find it on its own.
        let btf = Btf::from_sys_fs().map_err(|err| {
            warn!(error = %err, "failed to read kernel BTF from /sys/kernel/btf/vmlinux");
            TracerError::OpenFailed
        })?;

        let mut ebpf = EbpfLoader::new()
            .btf(Some(&btf))
            .load(BPF_OBJ)
            .map_err(|err| {
                warn!(error = %err, "loading BPF object failed");
                if is_permission_error(&err) {
                    TracerError::PermissionDenied
                } else {
                    TracerError::LoadFailed
                }
            })?;

        {
            let prog: &mut TracePoint = ebpf
                .program_mut(PROG_NAME)
                .ok_or(TracerError::InvalidState)?
                .try_into()
                .map_err(|_| TracerError::InvalidState)?;

            prog.load().map_err(|err| {
                warn!(error = %err, "loading migration tracepoint program failed");
                if is_permission_error(&err) {
                    TracerError::PermissionDenied
                } else {
                    TracerError::LoadFailed
                }
            })?;
        }

        let events = ebpf
            .take_map(EVENTS_MAP)
            .ok_or(TracerError::MapAccessFailed)?;
        let ring = RingBuf::try_from(events).map_err(|err| {
            warn!(error = %err, "creating ring buffer consumer failed");
            TracerError::MapAccessFailed
        })?;

        Ok(Self {
            callback,
            event_count: AtomicU64::new(0),
            link: None,
            ring,
            ebpf,
        })
    }

    /// Install the tracepoint probe. Idempotent: attaching while attached
    /// succeeds without a second probe.
    pub fn attach(&mut self) -> Result<(), TracerError> {
        if self.link.is_some() {
            return Ok(());
        }

        let prog: &mut TracePoint = self
            .ebpf
            .program_mut(PROG_NAME)
            .ok_or(TracerError::InvalidState)?
            .try_into()
            .map_err(|_| TracerError::InvalidState)?;

        let link = prog.attach("sched", "sched_migrate_task").map_err(|err| {
            warn!(error = %err, "attaching migration tracepoint failed");
            if is_permission_error(&err) {
                TracerError::PermissionDenied
            } else {
                TracerError::AttachFailed
            }
        })?;

        self.link = Some(link);
        debug!("migration tracepoint attached");
        Ok(())
    }

    /// Remove the tracepoint probe. No-op when not attached.
    pub fn detach(&mut self) {
        let Some(link) = self.link.take() else {
            return;
        };
        let Some(prog) = self.ebpf.program_mut(PROG_NAME) else {
            return;
        };

        let prog: &mut TracePoint = match prog.try_into() {
            Ok(prog) => prog,
            Err(_) => return,
        };

        if let Err(err) = prog.detach(link) {
            debug!(error = %err, "detaching migration tracepoint failed");
        }
    }

    /// Alias for [`MigrationTracer::detach`]; idempotent.
    pub fn stop(&mut self) {
        self.detach();
    }

    pub fn is_attached(&self) -> bool {
        self.link.is_some()
    }

    /// Wait up to `timeout` for ring-buffer readiness, then drain every
    /// available record to the sink. Returns the number of events delivered.
    ///
    /// Records shorter than the wire format are dropped silently. A signal
    /// interrupting the wait is not an error.
    pub fn poll(&mut self, timeout: Duration) -> Result<usize, TracerError> {
        let mut pollfd = libc::pollfd {
            fd: self.ring.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };

        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as i32;
        let rc = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };

        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            warn!(error = %err, "ring buffer poll failed");
            return Err(TracerError::MapAccessFailed);
        }

        // Drain unconditionally; records may already be pending even when
        // the wait timed out.
        let mut delivered = 0;
        while let Some(item) = self.ring.next() {
            match decode_migration(&item) {
                Ok(event) => {
                    (self.callback)(event);
                    self.event_count.fetch_add(1, Ordering::Relaxed);
                    delivered += 1;
                }
                Err(err) => {
                    debug!(error = %err, "dropping malformed migration record");
                }
            }
        }

        Ok(delivered)
    }

    /// Set or clear the kernel-side PID filter. `None` (stored as 0) traces
    /// every process.
    pub fn set_target_pid(&mut self, pid: Option<u32>) -> Result<(), TracerError> {
        let map = self
            .ebpf
            .map_mut(CONFIG_MAP)
            .ok_or(TracerError::MapAccessFailed)?;

        let mut config: Array<_, u32> =
            Array::try_from(map).map_err(|_| TracerError::MapAccessFailed)?;

        config
            .set(CONFIG_TARGET_PID, pid.unwrap_or(0), 0)
            .map_err(|err| {
                warn!(error = %err, "updating PID filter failed");
                TracerError::MapAccessFailed
            })
    }

    /// Total events delivered to the sink since creation. Useful for
    /// spotting ring-buffer drops: the kernel discards records when the
    /// buffer is full, and a stalling counter under load is the symptom.
    pub fn event_count(&self) -> u64 {
        self.event_count.load(Ordering::Relaxed)
    }
}

impl Drop for MigrationTracer {
    fn drop(&mut self) {
        self.detach();
    }
}

/// True when an EPERM/EACCES lurks anywhere in the error chain.
fn is_permission_error(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(io_err) = e.downcast_ref::<io::Error>() {
            if io_err.kind() == io::ErrorKind::PermissionDenied {
                return true;
            }
        }
        current = e.source();
    }
    false
}
