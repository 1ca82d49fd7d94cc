//! Correlated event storage and queries.
//!
//! Migrations and PMU samples arrive from two independent sources whose
//! timestamps share a clock but not an ordering. The store re-imposes a
//! sorted-by-timestamp view at insert time so range and nearest-neighbor
//! queries can binary-search.
//!
//! The store is single-writer / many-reader and carries no internal
//! synchronization; concurrent producers must funnel through an external
//! lock (see [`crate::session`]).

use crate::event::{MigrationEvent, PmuSample};

/// Insertion-sorted sequences of migrations and PMU samples.
///
/// Inserts cost O(log n) search + O(n) shift, which favors the read-heavy
/// query phase after a capture run.
#[derive(Debug, Default)]
pub struct EventStore {
    migrations: Vec<MigrationEvent>,
    pmu_samples: Vec<PmuSample>,
}

impl EventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a migration, keeping the sequence sorted by timestamp.
    ///
    /// Equal timestamps preserve insertion order.
    pub fn add_migration(&mut self, event: MigrationEvent) {
        let idx = self
            .migrations
            .partition_point(|m| m.timestamp_ns <= event.timestamp_ns);
        self.migrations.insert(idx, event);
    }

    /// Insert a PMU sample, keeping the sequence sorted by timestamp.
    ///
    /// Equal timestamps preserve insertion order.
    pub fn add_pmu_sample(&mut self, sample: PmuSample) {
        let idx = self
            .pmu_samples
            .partition_point(|s| s.timestamp_ns <= sample.timestamp_ns);
        self.pmu_samples.insert(idx, sample);
    }

    /// All migrations, ascending by timestamp. Borrowed view; must not be
    /// held across mutations.
    pub fn all_migrations(&self) -> &[MigrationEvent] {
        &self.migrations
    }

    /// All PMU samples, ascending by timestamp. Borrowed view; must not be
    /// held across mutations.
    pub fn all_pmu_samples(&self) -> &[PmuSample] {
        &self.pmu_samples
    }

    /// Migrations belonging to one thread, in timestamp order.
    pub fn migrations_for_thread(&self, tid: u32) -> Vec<MigrationEvent> {
        self.migrations
            .iter()
            .filter(|m| m.tid == tid)
            .copied()
            .collect()
    }

    /// PMU samples belonging to one thread, in timestamp order.
    pub fn pmu_samples_for_thread(&self, tid: u32) -> Vec<PmuSample> {
        self.pmu_samples
            .iter()
            .filter(|s| s.tid == tid)
            .copied()
            .collect()
    }

    /// Migrations with `start_ns <= timestamp_ns <= end_ns`, both ends
    /// inclusive.
    pub fn migrations_in_range(&self, start_ns: u64, end_ns: u64) -> Vec<MigrationEvent> {
        let from = self
            .migrations
            .partition_point(|m| m.timestamp_ns < start_ns);

        self.migrations[from..]
            .iter()
            .take_while(|m| m.timestamp_ns <= end_ns)
            .copied()
            .collect()
    }

    /// Latest sample at or before the migration, restricted to the
    /// migration's thread.
    ///
    /// Positions at the upper bound of the migration timestamp and walks
    /// backward until the tid matches; worst case O(n) when the nearest
    /// samples all belong to other threads.
    pub fn pmu_before_migration(&self, migration: &MigrationEvent) -> Option<PmuSample> {
        let upper = self
            .pmu_samples
            .partition_point(|s| s.timestamp_ns <= migration.timestamp_ns);

        self.pmu_samples[..upper]
            .iter()
            .rev()
            .find(|s| s.tid == migration.tid)
            .copied()
    }

    /// Earliest sample at or after the migration, restricted to the
    /// migration's thread.
    pub fn pmu_after_migration(&self, migration: &MigrationEvent) -> Option<PmuSample> {
        let lower = self
            .pmu_samples
            .partition_point(|s| s.timestamp_ns < migration.timestamp_ns);

        self.pmu_samples[lower..]
            .iter()
            .find(|s| s.tid == migration.tid)
            .copied()
    }

    pub fn migration_count(&self) -> usize {
        self.migrations.len()
    }

    pub fn pmu_sample_count(&self) -> usize {
        self.pmu_samples.len()
    }

    /// Drop all stored events.
    pub fn clear(&mut self) {
        self.migrations.clear();
        self.pmu_samples.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::MAX_COMM_LEN;

    fn migration(timestamp_ns: u64, tid: u32) -> MigrationEvent {
        MigrationEvent {
            timestamp_ns,
            pid: tid,
            tid,
            src_cpu: 0,
            dst_cpu: 1,
            comm: [0; MAX_COMM_LEN],
        }
    }

    fn pmu_sample(timestamp_ns: u64, tid: u32) -> PmuSample {
        PmuSample {
            timestamp_ns,
            tid,
            cpu_id: 0,
            instructions: 1_000_000,
            cycles: 500_000,
            llc_misses: 100,
            llc_references: 1000,
            branch_misses: 50,
        }
    }

    #[test]
    fn test_starts_empty() {
        let store = EventStore::new();
        assert_eq!(store.migration_count(), 0);
        assert_eq!(store.pmu_sample_count(), 0);
        assert!(store.all_migrations().is_empty());
        assert!(store.all_pmu_samples().is_empty());
    }

    #[test]
    fn test_migrations_sorted_on_insert() {
        let mut store = EventStore::new();

        for ts in [3000, 1000, 4000, 2000] {
            store.add_migration(migration(ts, 42));
        }

        let timestamps: Vec<u64> = store
            .all_migrations()
            .iter()
            .map(|m| m.timestamp_ns)
            .collect();
        assert_eq!(timestamps, vec![1000, 2000, 3000, 4000]);
    }

    #[test]
    fn test_pmu_samples_sorted_on_insert() {
        let mut store = EventStore::new();

        for ts in [3000, 1000, 4000, 2000] {
            store.add_pmu_sample(pmu_sample(ts, 42));
        }

        let timestamps: Vec<u64> = store
            .all_pmu_samples()
            .iter()
            .map(|s| s.timestamp_ns)
            .collect();
        assert_eq!(timestamps, vec![1000, 2000, 3000, 4000]);
    }

    #[test]
    fn test_equal_timestamps_keep_insertion_order() {
        let mut store = EventStore::new();

        store.add_migration(migration(1000, 1));
        store.add_migration(migration(1000, 2));
        store.add_migration(migration(1000, 3));

        let tids: Vec<u32> = store.all_migrations().iter().map(|m| m.tid).collect();
        assert_eq!(tids, vec![1, 2, 3]);
    }

    #[test]
    fn test_range_query_is_inclusive() {
        let mut store = EventStore::new();
        for ts in [1000, 2000, 3000, 4000] {
            store.add_migration(migration(ts, 42));
        }

        let hits = store.migrations_in_range(2000, 3000);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].timestamp_ns, 2000);
        assert_eq!(hits[1].timestamp_ns, 3000);
    }

    #[test]
    fn test_range_query_empty_window() {
        let mut store = EventStore::new();
        store.add_migration(migration(1000, 42));

        assert!(store.migrations_in_range(2000, 3000).is_empty());
    }

    #[test]
    fn test_for_thread_filters() {
        let mut store = EventStore::new();
        store.add_migration(migration(1000, 1));
        store.add_migration(migration(2000, 2));
        store.add_migration(migration(3000, 1));

        let mine = store.migrations_for_thread(1);
        assert_eq!(mine.len(), 2);
        assert!(mine.iter().all(|m| m.tid == 1));
    }

    #[test]
    fn test_nearest_sample_respects_thread() {
        let mut store = EventStore::new();
        store.add_pmu_sample(pmu_sample(1000, 42));
        store.add_pmu_sample(pmu_sample(1500, 43));
        store.add_pmu_sample(pmu_sample(2000, 42));
        store.add_pmu_sample(pmu_sample(2500, 43));
        store.add_pmu_sample(pmu_sample(3000, 42));

        let m = migration(2800, 42);

        let before = store.pmu_before_migration(&m).unwrap();
        assert_eq!(before.timestamp_ns, 2000);
        assert_eq!(before.tid, 42);

        let after = store.pmu_after_migration(&m).unwrap();
        assert_eq!(after.timestamp_ns, 3000);
        assert_eq!(after.tid, 42);
    }

    #[test]
    fn test_nearest_sample_exact_timestamp_counts_both_ways() {
        let mut store = EventStore::new();
        store.add_pmu_sample(pmu_sample(2000, 7));

        let m = migration(2000, 7);
        assert_eq!(store.pmu_before_migration(&m).unwrap().timestamp_ns, 2000);
        assert_eq!(store.pmu_after_migration(&m).unwrap().timestamp_ns, 2000);
    }

    #[test]
    fn test_nearest_sample_missing_thread() {
        let mut store = EventStore::new();
        store.add_pmu_sample(pmu_sample(1000, 1));

        let m = migration(2000, 99);
        assert!(store.pmu_before_migration(&m).is_none());
        assert!(store.pmu_after_migration(&m).is_none());
    }

    #[test]
    fn test_clear_then_reinsert_is_identical() {
        let mut store = EventStore::new();
        let inserts = [3000u64, 1000, 4000, 2000];

        for ts in inserts {
            store.add_migration(migration(ts, 42));
            store.add_pmu_sample(pmu_sample(ts, 42));
        }
        let migrations_before = store.all_migrations().to_vec();
        let samples_before = store.all_pmu_samples().to_vec();

        store.clear();
        assert_eq!(store.migration_count(), 0);
        assert_eq!(store.pmu_sample_count(), 0);

        for ts in inserts {
            store.add_migration(migration(ts, 42));
            store.add_pmu_sample(pmu_sample(ts, 42));
        }

        assert_eq!(store.all_migrations(), migrations_before.as_slice());
        assert_eq!(store.all_pmu_samples(), samples_before.as_slice());
    }
}
