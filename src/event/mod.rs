//! Event data model: scheduler migrations and PMU samples.

use crate::topology::{CoreType, CpuId, TopologyMap};

/// Kernel bound on a task command name, including the NUL terminator.
pub const MAX_COMM_LEN: usize = 16;

/// A scheduler migration captured from the `sched_migrate_task` tracepoint.
///
/// Mirrors the record written by the kernel-side tracer (see
/// `bpf/include/threveal.h`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationEvent {
    /// Nanoseconds since boot (`CLOCK_MONOTONIC`).
    pub timestamp_ns: u64,
    /// Thread-group ID of the migrated task.
    pub pid: u32,
    /// Thread ID of the migrated task.
    pub tid: u32,
    /// CPU the task ran on before the migration.
    pub src_cpu: CpuId,
    /// CPU the task was moved to.
    pub dst_cpu: CpuId,
    /// Command name, NUL-terminated or truncated at 16 bytes.
    pub comm: [u8; MAX_COMM_LEN],
}

impl MigrationEvent {
    /// Command name up to the first NUL; empty if not valid UTF-8.
    pub fn comm_str(&self) -> &str {
        let end = self
            .comm
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(MAX_COMM_LEN);
        std::str::from_utf8(&self.comm[..end]).unwrap_or("")
    }
}

/// An atomic snapshot of the five-counter hardware group.
///
/// All counts are deltas since the group was last reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PmuSample {
    /// Nanoseconds since boot (`CLOCK_MONOTONIC`).
    pub timestamp_ns: u64,
    /// Thread the counters are bound to.
    pub tid: u32,
    /// CPU observed at sample time.
    pub cpu_id: CpuId,
    /// Retired instructions.
    pub instructions: u64,
    /// CPU cycles.
    pub cycles: u64,
    /// Last-level cache load misses.
    pub llc_misses: u64,
    /// Last-level cache load references.
    pub llc_references: u64,
    /// Branch mispredictions.
    pub branch_misses: u64,
}

impl PmuSample {
    /// Instructions per cycle; 0.0 when no cycles elapsed.
    pub fn ipc(&self) -> f64 {
        if self.cycles == 0 {
            return 0.0;
        }
        self.instructions as f64 / self.cycles as f64
    }

    /// LLC miss rate in [0.0, 1.0]; 0.0 when there were no references.
    pub fn llc_miss_rate(&self) -> f64 {
        if self.llc_references == 0 {
            return 0.0;
        }
        self.llc_misses as f64 / self.llc_references as f64
    }
}

/// Migration classified by source and destination core types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MigrationType {
    /// One or both CPUs could not be classified.
    Unknown,
    /// P-core to P-core.
    PToP,
    /// P-core to E-core; the usual suspect for a throughput drop.
    PToE,
    /// E-core to P-core.
    EToP,
    /// E-core to E-core.
    EToE,
}

impl MigrationType {
    /// Canonical label for logs and reports.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PToP => "P→P",
            Self::PToE => "P→E",
            Self::EToP => "E→P",
            Self::EToE => "E→E",
            Self::Unknown => "Unknown",
        }
    }
}

impl std::fmt::Display for MigrationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify a migration by looking up both CPUs in the topology.
///
/// Returns [`MigrationType::Unknown`] when either lookup fails.
pub fn classify_migration(event: &MigrationEvent, topology: &TopologyMap) -> MigrationType {
    let Ok(src) = topology.core_type(event.src_cpu) else {
        return MigrationType::Unknown;
    };
    let Ok(dst) = topology.core_type(event.dst_cpu) else {
        return MigrationType::Unknown;
    };

    match (src, dst) {
        (CoreType::PCore, CoreType::PCore) => MigrationType::PToP,
        (CoreType::PCore, CoreType::ECore) => MigrationType::PToE,
        (CoreType::ECore, CoreType::PCore) => MigrationType::EToP,
        (CoreType::ECore, CoreType::ECore) => MigrationType::EToE,
        _ => MigrationType::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(instructions: u64, cycles: u64, llc_misses: u64, llc_references: u64) -> PmuSample {
        PmuSample {
            timestamp_ns: 0,
            tid: 1,
            cpu_id: 0,
            instructions,
            cycles,
            llc_misses,
            llc_references,
            branch_misses: 0,
        }
    }

    #[test]
    fn test_ipc() {
        let s = sample(2_000_000, 1_000_000, 0, 0);
        assert!((s.ipc() - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_ipc_zero_cycles() {
        let s = sample(1000, 0, 0, 0);
        assert_eq!(s.ipc(), 0.0);
    }

    #[test]
    fn test_llc_miss_rate() {
        let s = sample(0, 0, 100, 1000);
        assert!((s.llc_miss_rate() - 0.1).abs() < f64::EPSILON);
    }

    #[test]
    fn test_llc_miss_rate_zero_references() {
        let s = sample(0, 0, 5, 0);
        assert_eq!(s.llc_miss_rate(), 0.0);
    }

    #[test]
    fn test_comm_str_nul_terminated() {
        let mut comm = [0u8; MAX_COMM_LEN];
        comm[..4].copy_from_slice(b"geth");

        let event = MigrationEvent {
            timestamp_ns: 0,
            pid: 1,
            tid: 1,
            src_cpu: 0,
            dst_cpu: 1,
            comm,
        };

        assert_eq!(event.comm_str(), "geth");
    }

    #[test]
    fn test_comm_str_full_width() {
        let comm = *b"sixteen_bytes_xx";
        let event = MigrationEvent {
            timestamp_ns: 0,
            pid: 1,
            tid: 1,
            src_cpu: 0,
            dst_cpu: 1,
            comm,
        };

        assert_eq!(event.comm_str(), "sixteen_bytes_xx");
    }

    fn migration(src_cpu: CpuId, dst_cpu: CpuId) -> MigrationEvent {
        MigrationEvent {
            timestamp_ns: 0,
            pid: 42,
            tid: 42,
            src_cpu,
            dst_cpu,
            comm: [0; MAX_COMM_LEN],
        }
    }

    #[test]
    fn test_classify_migration() {
        let topology = TopologyMap::new(vec![0, 1, 2, 3], vec![4, 5, 6, 7]);

        assert_eq!(
            classify_migration(&migration(0, 2), &topology),
            MigrationType::PToP
        );
        assert_eq!(
            classify_migration(&migration(1, 5), &topology),
            MigrationType::PToE
        );
        assert_eq!(
            classify_migration(&migration(6, 3), &topology),
            MigrationType::EToP
        );
        assert_eq!(
            classify_migration(&migration(4, 7), &topology),
            MigrationType::EToE
        );
    }

    #[test]
    fn test_classify_migration_unknown_cpu() {
        let topology = TopologyMap::new(vec![0, 1, 2, 3], vec![4, 5, 6, 7]);

        assert_eq!(
            classify_migration(&migration(0, 99), &topology),
            MigrationType::Unknown
        );
        assert_eq!(
            classify_migration(&migration(99, 0), &topology),
            MigrationType::Unknown
        );
    }
}
