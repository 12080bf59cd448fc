//! Concurrent/Multi-threaded Tests for mvstm-concurrency
//!
//! These tests verify correct behavior under actual concurrent execution:
//!
//! 1. **Lost Updates** - Read-modify-write counters never lose increments
//! 2. **Disjoint Writers** - Non-overlapping footprints never conflict
//! 3. **Sequence Monotonicity** - Published sequences are unique and increasing
//! 4. **Snapshot Consistency** - Readers never see half of a commit
//! 5. **Speculation** - Acknowledgement keeps up with concurrent committers,
//!    and resets racing commits leave nothing speculative
//! 6. **Trimming** - Folding under load keeps every value
//!
//! ## Running These Tests
//!
//! ```bash
//! cargo test --test concurrent_tests
//! cargo test --test concurrent_tests -- --nocapture --test-threads=1  # sequential for debugging
//! ```

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use mvstm_concurrency::{
    CommitStatus, Interceptor, TObject, ThresholdAcknowledger, Transaction, Trunk, TrunkConfig,
    TrunkObserver, VersionMap,
};
use mvstm_core::{ObjectKind, StmError, Value};

// ============================================================================
// Test Helpers
// ============================================================================

fn create_trunk() -> Arc<Trunk> {
    Trunk::new(TrunkConfig::default())
}

/// Run `body` in a fresh transaction until it commits.
///
/// Returns the number of attempts it took.
fn run_to_success<F>(trunk: &Arc<Trunk>, mut body: F) -> usize
where
    F: FnMut(&mut Transaction),
{
    let mut attempts = 0;
    loop {
        attempts += 1;
        let mut txn = Transaction::start(trunk);
        body(&mut txn);
        match txn.commit() {
            Ok(CommitStatus::Success) => return attempts,
            Ok(CommitStatus::Conflict) | Err(StmError::PublishContention { .. }) => continue,
            Err(e) => panic!("unexpected commit error: {e}"),
        }
    }
}

fn increment(txn: &mut Transaction, obj: &TObject, field: u32) {
    let current = txn.get(obj, field).unwrap().int_or_zero();
    txn.set(obj, field, current + 1).unwrap();
}

fn read_committed(trunk: &Arc<Trunk>, obj: &TObject, field: u32) -> Value {
    let mut txn = Transaction::start(trunk);
    txn.get(obj, field).unwrap()
}

// ============================================================================
// SECTION 1: Lost Update Prevention
// ============================================================================

mod lost_updates {
    use super::*;

    /// Every thread increments the same field. A lost update would leave the
    /// counter below the number of successful commits.
    #[test]
    fn test_concurrent_counter_no_lost_updates() {
        const THREADS: usize = 8;
        const INCREMENTS: usize = 50;

        let trunk = create_trunk();
        let obj = trunk.create_object(ObjectKind::Fields { count: 1 });
        let barrier = Arc::new(Barrier::new(THREADS));
        let retries = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let trunk = trunk.clone();
                let barrier = barrier.clone();
                let retries = retries.clone();
                thread::spawn(move || {
                    barrier.wait();
                    for _ in 0..INCREMENTS {
                        let attempts = run_to_success(&trunk, |txn| increment(txn, &obj, 0));
                        retries.fetch_add(attempts - 1, Ordering::Relaxed);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(
            read_committed(&trunk, &obj, 0),
            Value::Int((THREADS * INCREMENTS) as i64)
        );
        let stats = trunk.stats().snapshot();
        assert_eq!(stats.committed as usize, THREADS * INCREMENTS);
        assert!(stats.conflicted as usize <= retries.load(Ordering::Relaxed));
    }

    /// Keyed counters under contention, several keys per object.
    #[test]
    fn test_concurrent_keyed_counters() {
        const THREADS: usize = 6;
        const ROUNDS: usize = 30;

        let trunk = create_trunk();
        let obj = trunk.create_object(ObjectKind::Keyed);
        let barrier = Arc::new(Barrier::new(THREADS));

        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let trunk = trunk.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    for round in 0..ROUNDS {
                        let key = format!("k{}", (t + round) % 3);
                        run_to_success(&trunk, |txn| {
                            let current = txn
                                .get_key(&obj, &key)
                                .unwrap()
                                .map(|v| v.int_or_zero())
                                .unwrap_or(0);
                            txn.put(&obj, key.clone(), current + 1).unwrap();
                        });
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let mut txn = Transaction::start(&trunk);
        let total: i64 = txn
            .entries(&obj)
            .unwrap()
            .values()
            .map(Value::int_or_zero)
            .sum();
        assert_eq!(total, (THREADS * ROUNDS) as i64);
    }

    /// Concurrent pushes to one list all land exactly once.
    #[test]
    fn test_concurrent_list_push() {
        const THREADS: usize = 4;
        const PUSHES: usize = 25;

        let trunk = create_trunk();
        let list = trunk.create_object(ObjectKind::Indexed);
        let barrier = Arc::new(Barrier::new(THREADS));

        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let trunk = trunk.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    for i in 0..PUSHES {
                        let value = (t * 1000 + i) as i64;
                        run_to_success(&trunk, |txn| txn.list_push(&list, value).unwrap());
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let mut txn = Transaction::start(&trunk);
        let items = txn.list_items(&list).unwrap();
        assert_eq!(items.len(), THREADS * PUSHES);
        let distinct: HashSet<i64> = items.iter().map(Value::int_or_zero).collect();
        assert_eq!(distinct.len(), THREADS * PUSHES);
    }
}

// ============================================================================
// SECTION 2: Disjoint Writers
// ============================================================================

mod disjoint_writers {
    use super::*;

    /// Threads writing disjoint fields of one object never conflict.
    #[test]
    fn test_disjoint_fields_never_conflict() {
        const THREADS: usize = 8;
        const COMMITS: usize = 40;

        let trunk = create_trunk();
        let obj = trunk.create_object(ObjectKind::Fields {
            count: THREADS as u32,
        });
        let barrier = Arc::new(Barrier::new(THREADS));

        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let trunk = trunk.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    for _ in 0..COMMITS {
                        let attempts = run_to_success(&trunk, |txn| increment(txn, &obj, t as u32));
                        assert_eq!(attempts, 1, "disjoint field {t} conflicted");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        for field in 0..THREADS as u32 {
            assert_eq!(read_committed(&trunk, &obj, field), Value::Int(COMMITS as i64));
        }
        assert_eq!(trunk.stats().snapshot().conflicted, 0);
    }
}

// ============================================================================
// SECTION 3: Sequence Monotonicity
// ============================================================================

mod monotonicity {
    use super::*;

    #[test]
    fn test_committed_sequences_unique() {
        const THREADS: usize = 6;
        const COMMITS: usize = 50;

        let trunk = create_trunk();
        let obj = trunk.create_object(ObjectKind::Fields {
            count: THREADS as u32,
        });
        let sequences = Arc::new(Mutex::new(Vec::new()));
        let barrier = Arc::new(Barrier::new(THREADS));

        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let trunk = trunk.clone();
                let sequences = sequences.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    let mut last = 0;
                    for i in 0..COMMITS {
                        let mut txn = Transaction::start(&trunk);
                        txn.set(&obj, t as u32, i as i64).unwrap();
                        txn.commit().unwrap();
                        let sequence = txn.committed_sequence().unwrap();
                        assert!(sequence > last, "sequence went backwards");
                        last = sequence;
                        sequences.lock().push(sequence);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let sequences = sequences.lock();
        let distinct: HashSet<u64> = sequences.iter().copied().collect();
        assert_eq!(distinct.len(), THREADS * COMMITS);
        assert_eq!(
            trunk.snapshot().acknowledged_count(),
            (THREADS * COMMITS) as u64
        );
    }
}

// ============================================================================
// SECTION 4: Snapshot Consistency
// ============================================================================

mod snapshot_consistency {
    use super::*;

    /// Writers keep fields 0 and 1 equal; readers must never observe them
    /// apart.
    #[test]
    fn test_readers_see_whole_commits() {
        let trunk = Trunk::new(TrunkConfig {
            trim_threshold: 4,
            ..TrunkConfig::default()
        });
        let obj = trunk.create_object(ObjectKind::Fields { count: 2 });
        let stop = Arc::new(AtomicBool::new(false));

        let writers: Vec<_> = (0..3)
            .map(|_| {
                let trunk = trunk.clone();
                thread::spawn(move || {
                    for _ in 0..100 {
                        run_to_success(&trunk, |txn| {
                            let next = txn.get(&obj, 0).unwrap().int_or_zero() + 1;
                            txn.set(&obj, 0, next).unwrap();
                            txn.set(&obj, 1, next).unwrap();
                        });
                    }
                })
            })
            .collect();
        let readers: Vec<_> = (0..3)
            .map(|_| {
                let trunk = trunk.clone();
                let stop = stop.clone();
                thread::spawn(move || {
                    let mut observed = 0;
                    while !stop.load(Ordering::Relaxed) {
                        let mut txn = Transaction::start(&trunk);
                        let a = txn.get(&obj, 0).unwrap();
                        let b = txn.get(&obj, 1).unwrap();
                        assert_eq!(a, b, "torn read");
                        assert!(matches!(txn.commit(), Ok(CommitStatus::Success)));
                        observed += 1;
                    }
                    observed
                })
            })
            .collect();

        for writer in writers {
            writer.join().unwrap();
        }
        stop.store(true, Ordering::Relaxed);
        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(read_committed(&trunk, &obj, 0), Value::Int(300));
    }
}

// ============================================================================
// SECTION 5: Speculation
// ============================================================================

mod speculation {
    use super::*;

    #[test]
    fn test_threshold_acknowledger_under_load() {
        const THREADS: usize = 4;
        const COMMITS: usize = 40;

        let trunk = create_trunk();
        let obj = trunk.create_object(ObjectKind::Fields {
            count: THREADS as u32,
        });
        let interceptor =
            Interceptor::with_acknowledger(&trunk, Arc::new(ThresholdAcknowledger::new(5)));
        interceptor.intercept();
        let barrier = Arc::new(Barrier::new(THREADS));

        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let trunk = trunk.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    for _ in 0..COMMITS {
                        run_to_success(&trunk, |txn| increment(txn, &obj, t as u32));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(interceptor.pending().depth() < 5);
        interceptor.reset();
        assert!(!interceptor.is_intercepted());
        let snapshot = trunk.snapshot();
        assert!(!snapshot.has_speculative());
        assert_eq!(snapshot.acknowledged_count(), (THREADS * COMMITS) as u64);
    }

    /// Interception is switched on and off while committers keep running. A
    /// commit landing during a reset must not stay speculative.
    #[test]
    fn test_reset_while_committing_leaves_nothing_speculative() {
        const THREADS: usize = 4;
        const ROUNDS: usize = 50;

        let trunk = create_trunk();
        let obj = trunk.create_object(ObjectKind::Fields {
            count: THREADS as u32,
        });
        let interceptor = Interceptor::new(&trunk);
        let stop = Arc::new(AtomicBool::new(false));
        let committed = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(THREADS + 1));

        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let trunk = trunk.clone();
                let stop = stop.clone();
                let committed = committed.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    while !stop.load(Ordering::SeqCst) {
                        run_to_success(&trunk, |txn| increment(txn, &obj, t as u32));
                        committed.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        barrier.wait();
        for _ in 0..ROUNDS {
            interceptor.intercept();
            thread::yield_now();
            interceptor.reset();
        }
        stop.store(true, Ordering::SeqCst);
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(!interceptor.is_intercepted());
        let snapshot = trunk.snapshot();
        assert!(!snapshot.has_speculative());
        let total = committed.load(Ordering::SeqCst);
        assert_eq!(snapshot.acknowledged_count(), total as u64);

        run_to_success(&trunk, |txn| increment(txn, &obj, 0));
        assert_eq!(trunk.snapshot().acknowledged_count(), total as u64 + 1);
    }

    /// Commits once from inside the acknowledgement callback of a reset
    struct CommitOnAcknowledge {
        object: TObject,
        fired: AtomicBool,
    }

    impl TrunkObserver for CommitOnAcknowledge {
        fn on_acknowledged(&self, trunk: &Trunk, _maps: &[Arc<VersionMap>]) {
            if self.fired.swap(true, Ordering::SeqCst) {
                return;
            }
            let trunk = trunk.handle().unwrap();
            run_to_success(&trunk, |txn| txn.set(&self.object, 0, 42).unwrap());
        }
    }

    #[test]
    fn test_commit_from_ack_callback_during_reset_is_acknowledged() {
        let trunk = create_trunk();
        let obj = trunk.create_object(ObjectKind::Fields { count: 1 });
        let interceptor = Interceptor::new(&trunk);
        interceptor.intercept();
        run_to_success(&trunk, |txn| txn.set(&obj, 0, 1).unwrap());
        trunk.add_observer(Arc::new(CommitOnAcknowledge {
            object: obj,
            fired: AtomicBool::new(false),
        }));

        assert_eq!(interceptor.reset(), 1);
        let snapshot = trunk.snapshot();
        assert!(!snapshot.has_speculative());
        assert_eq!(snapshot.acknowledged_count(), 2);
        assert_eq!(read_committed(&trunk, &obj, 0), Value::Int(42));
    }

    /// Rejecting everything speculative discards those writes for new readers.
    #[test]
    fn test_reject_all_pending_restores_acknowledged_state() {
        let trunk = create_trunk();
        let obj = trunk.create_object(ObjectKind::Fields { count: 1 });
        run_to_success(&trunk, |txn| txn.set(&obj, 0, 1).unwrap());

        let interceptor = Interceptor::new(&trunk);
        interceptor.intercept();
        let first = Arc::new(Mutex::new(None));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let trunk = trunk.clone();
                let first = first.clone();
                thread::spawn(move || {
                    let mut txn = Transaction::start(&trunk);
                    txn.set(&obj, 0, 99).unwrap();
                    if let (Ok(CommitStatus::Success), Some(sequence)) =
                        (txn.commit(), txn.committed_sequence())
                    {
                        let mut lowest = first.lock();
                        let current: Option<u64> = *lowest;
                        *lowest = Some(current.map_or(sequence, |f| f.min(sequence)));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let from: Option<u64> = *first.lock();
        let from = from.unwrap();
        assert!(interceptor.reject(from).unwrap() >= 1);
        assert!(!trunk.snapshot().has_speculative());
        assert_eq!(read_committed(&trunk, &obj, 0), Value::Int(1));
    }
}

// ============================================================================
// SECTION 6: Trimming Under Load
// ============================================================================

mod trimming {
    use super::*;

    #[test]
    fn test_trim_keeps_values_and_bounds_chain() {
        const THREADS: usize = 4;
        const COMMITS: usize = 60;

        let trunk = Trunk::new(TrunkConfig {
            trim_threshold: 8,
            ..TrunkConfig::default()
        });
        let obj = trunk.create_object(ObjectKind::Fields {
            count: THREADS as u32,
        });

        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let trunk = trunk.clone();
                thread::spawn(move || {
                    for _ in 0..COMMITS {
                        run_to_success(&trunk, |txn| increment(txn, &obj, t as u32));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        trunk.trim();
        assert!(trunk.snapshot().len() <= 2);
        assert!(trunk.stats().snapshot().trims > 0);
        for field in 0..THREADS as u32 {
            assert_eq!(read_committed(&trunk, &obj, field), Value::Int(COMMITS as i64));
        }
    }
}
