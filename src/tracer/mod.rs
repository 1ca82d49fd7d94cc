//! Kernel-resident migration tracer.
//!
//! A BPF program attached to the `sched/sched_migrate_task` tracepoint
//! streams fixed-width records through a 256 KiB ring buffer. The userspace
//! side owns the BPF object, the ring-buffer consumer, and a one-entry
//! configuration map carrying an optional target-PID filter.
//!
//! The aya-backed tracer lives behind the `bpf` cargo feature; record
//! decoding ([`parse`]) compiles everywhere so the wire format stays
//! testable without kernel privileges.

pub mod parse;

#[cfg(feature = "bpf")]
mod bpf;

use thiserror::Error;

use crate::event::MigrationEvent;

#[cfg(feature = "bpf")]
pub use bpf::MigrationTracer;

/// Callback receiving each decoded migration. Runs on the polling thread;
/// implementations must not block.
pub type MigrationSink = Box<dyn Fn(MigrationEvent) + Send>;

/// Errors from tracer lifecycle operations.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TracerError {
    #[error("failed to open BPF object")]
    OpenFailed,

    #[error("failed to load BPF program into the kernel")]
    LoadFailed,

    #[error("failed to attach the migration tracepoint")]
    AttachFailed,

    #[error("tracer in invalid state")]
    InvalidState,

    #[error("failed to access a BPF map")]
    MapAccessFailed,

    #[error("permission denied for BPF (CAP_BPF or root required)")]
    PermissionDenied,
}
