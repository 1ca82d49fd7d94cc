//! Event-store ordering and nearest-sample properties checked against a
//! brute-force reference over generated insertion sequences.

use threveal::event::{MigrationEvent, PmuSample, MAX_COMM_LEN};
use threveal::store::EventStore;

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
        instructions: 1000,
        cycles: 500,
        llc_misses: 10,
        llc_references: 100,
        branch_misses: 5,
    }
}

/// Deterministic xorshift so failures reproduce.
struct Rng(u64);

impl Rng {
    fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }
}

#[test]
fn test_sequences_stay_sorted_under_arbitrary_insertion() {
    let mut rng = Rng(0x5eed);
    let mut store = EventStore::new();

    for _ in 0..500 {
        let ts = rng.next() % 10_000;
        let tid = (rng.next() % 4) as u32;
        store.add_migration(migration(ts, tid));
        store.add_pmu_sample(pmu_sample(rng.next() % 10_000, tid));
    }

    let migrations = store.all_migrations();
    assert!(migrations
        .windows(2)
        .all(|w| w[0].timestamp_ns <= w[1].timestamp_ns));

    let samples = store.all_pmu_samples();
    assert!(samples
        .windows(2)
        .all(|w| w[0].timestamp_ns <= w[1].timestamp_ns));
}

#[test]
fn test_nearest_sample_matches_brute_force() {
    let mut rng = Rng(0xfeed_beef);
    let mut store = EventStore::new();
    let mut reference: Vec<PmuSample> = Vec::new();

    for _ in 0..300 {
        let sample = pmu_sample(rng.next() % 5_000, (rng.next() % 3) as u32);
        store.add_pmu_sample(sample);
        reference.push(sample);
    }

    for _ in 0..100 {
        let m = migration(rng.next() % 5_000, (rng.next() % 3) as u32);

        let expected_before = reference
            .iter()
            .filter(|s| s.tid == m.tid && s.timestamp_ns <= m.timestamp_ns)
            .max_by_key(|s| s.timestamp_ns)
            .map(|s| s.timestamp_ns);
        let expected_after = reference
            .iter()
            .filter(|s| s.tid == m.tid && s.timestamp_ns >= m.timestamp_ns)
            .min_by_key(|s| s.timestamp_ns)
            .map(|s| s.timestamp_ns);

        assert_eq!(
            store.pmu_before_migration(&m).map(|s| s.timestamp_ns),
            expected_before
        );
        assert_eq!(
            store.pmu_after_migration(&m).map(|s| s.timestamp_ns),
            expected_after
        );
    }
}

#[test]
fn test_range_query_matches_brute_force() {
    let mut rng = Rng(0xabcd);
    let mut store = EventStore::new();
    let mut reference = Vec::new();

    for _ in 0..300 {
        let m = migration(rng.next() % 2_000, 1);
        store.add_migration(m);
        reference.push(m.timestamp_ns);
    }
    reference.sort_unstable();

    for _ in 0..50 {
        let a = rng.next() % 2_000;
        let b = rng.next() % 2_000;
        let (start, end) = if a <= b { (a, b) } else { (b, a) };

        let got: Vec<u64> = store
            .migrations_in_range(start, end)
            .iter()
            .map(|m| m.timestamp_ns)
            .collect();
        let expected: Vec<u64> = reference
            .iter()
            .copied()
            .filter(|&ts| ts >= start && ts <= end)
            .collect();

        assert_eq!(got, expected);
    }
}
