//! Snapshot isolation and conflict detection

use crate::{memory_stm, read_field};
use mvstm::{
    CommitStatus, ObjectKind, StartFlags, StmError, Transaction, TransactionScope, Value,
};
use parking_lot::Mutex;
use std::sync::{Arc, Barrier};
use std::thread;

#[test]
fn test_reads_see_the_start_snapshot() {
    let stm = memory_stm();
    let trunk = stm.create_trunk().unwrap();
    let obj = trunk.create_object(ObjectKind::Fields { count: 1 });
    stm.run(&trunk, |txn| txn.set(&obj, 0, 1i64)).unwrap();

    let mut reader = stm.start(&trunk);
    assert_eq!(reader.get(&obj, 0).unwrap(), Value::Int(1));
    stm.run(&trunk, |txn| txn.set(&obj, 0, 2i64)).unwrap();
    assert_eq!(reader.get(&obj, 0).unwrap(), Value::Int(1));
    // read-only commits always succeed
    assert_eq!(reader.commit().unwrap(), CommitStatus::Success);
    assert_eq!(read_field(&stm, &trunk, &obj, 0), Value::Int(2));
}

#[test]
fn test_stale_read_conflicts_and_publishes_nothing() {
    let stm = memory_stm();
    let trunk = stm.create_trunk().unwrap();
    let obj = trunk.create_object(ObjectKind::Fields { count: 2 });

    let mut stale = stm.start(&trunk);
    let x = stale.get(&obj, 0).unwrap().int_or_zero();
    stm.run(&trunk, |txn| txn.set(&obj, 0, 10i64)).unwrap();
    stale.set(&obj, 1, x + 1).unwrap();

    let before = trunk.snapshot().last_sequence();
    assert_eq!(stale.commit().unwrap(), CommitStatus::Conflict);
    assert!(!stale.conflicts().is_empty());
    assert_eq!(trunk.snapshot().last_sequence(), before);
    assert_eq!(read_field(&stm, &trunk, &obj, 1), Value::Null);
}

#[test]
fn test_first_committer_wins() {
    let stm = memory_stm();
    let trunk = stm.create_trunk().unwrap();
    let obj = trunk.create_object(ObjectKind::Fields { count: 1 });
    stm.run(&trunk, |txn| txn.set(&obj, 0, 0i64)).unwrap();

    let mut a = stm.start(&trunk);
    let mut b = stm.start(&trunk);
    a.set(&obj, 0, 1i64).unwrap();
    assert_eq!(a.commit().unwrap(), CommitStatus::Success);

    assert_eq!(b.get(&obj, 0).unwrap(), Value::Int(0));
    b.set(&obj, 0, 2i64).unwrap();
    assert_eq!(b.commit().unwrap(), CommitStatus::Conflict);

    let mut c = stm.start(&trunk);
    assert_eq!(c.get(&obj, 0).unwrap(), Value::Int(1));
}

#[test]
fn test_disjoint_fields_do_not_conflict() {
    let stm = memory_stm();
    let trunk = stm.create_trunk().unwrap();
    let obj = trunk.create_object(ObjectKind::Fields { count: 2 });

    let mut first = stm.start(&trunk);
    let mut second = stm.start(&trunk);
    first.set(&obj, 0, 1i64).unwrap();
    second.set(&obj, 1, 2i64).unwrap();
    assert_eq!(first.commit().unwrap(), CommitStatus::Success);
    assert_eq!(second.commit().unwrap(), CommitStatus::Success);
    assert_eq!(read_field(&stm, &trunk, &obj, 0), Value::Int(1));
    assert_eq!(read_field(&stm, &trunk, &obj, 1), Value::Int(2));
}

#[test]
fn test_concurrent_increments_are_serializable() {
    let stm = Arc::new(memory_stm());
    let trunk = stm.create_trunk().unwrap();
    let counter = trunk.create_object(ObjectKind::Fields { count: 1 });

    let threads = 4;
    let per_thread = 100;
    let barrier = Arc::new(Barrier::new(threads));
    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let stm = Arc::clone(&stm);
            let trunk = Arc::clone(&trunk);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for _ in 0..per_thread {
                    let options = mvstm::RunOptions {
                        max_attempts: 10_000,
                        ..Default::default()
                    };
                    stm.run_with(&trunk, options, |txn| {
                        let v = txn.get(&counter, 0)?.int_or_zero();
                        txn.set(&counter, 0, v + 1)
                    })
                    .unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(
        read_field(&stm, &trunk, &counter, 0),
        Value::Int((threads * per_thread) as i64)
    );
    let metrics = stm.metrics();
    assert_eq!(metrics.transactions.committed as usize, threads * per_thread);
}

#[test]
fn test_nested_failure_restores_parent_writes() {
    let stm = memory_stm();
    let trunk = stm.create_trunk().unwrap();
    let map = trunk.create_object(ObjectKind::Keyed);

    let mut txn = stm.start(&trunk);
    txn.put(&map, "kept", 1i64).unwrap();
    let result: Result<(), StmError> = txn.nested(|inner| {
        inner.put(&map, "dropped", 2i64)?;
        Err(StmError::invalid_input("undo"))
    });
    assert!(result.is_err());
    txn.nested(|inner| inner.put(&map, "nested", 3i64)).unwrap();
    assert_eq!(txn.commit().unwrap(), CommitStatus::Success);

    let mut read = stm.start(&trunk);
    let keys = read.keys(&map).unwrap();
    assert_eq!(keys, vec!["kept".to_string(), "nested".to_string()]);
}

#[test]
fn test_current_transaction_scope() {
    let stm = memory_stm();
    let trunk = stm.create_trunk().unwrap();
    let obj = trunk.create_object(ObjectKind::Fields { count: 1 });
    assert!(stm.current().is_none());

    let shared = Arc::new(Mutex::new(Transaction::start(&trunk)));
    {
        let _scope = TransactionScope::enter(Arc::clone(&shared));
        assert!(stm.current().is_some());
        TransactionScope::with_current(|txn| txn.set(&obj, 0, 5i64)).unwrap();
        {
            let _hidden = TransactionScope::enter_empty();
            assert!(stm.current().is_none());
        }
        assert!(stm.current().is_some());
    }
    assert!(stm.current().is_none());

    assert_eq!(shared.lock().commit().unwrap(), CommitStatus::Success);
    assert_eq!(read_field(&stm, &trunk, &obj, 0), Value::Int(5));
}

#[test]
fn test_ignore_speculative_data_hides_unacknowledged_maps() {
    let stm = memory_stm();
    let trunk = stm.create_trunk().unwrap();
    let obj = trunk.create_object(ObjectKind::Fields { count: 1 });
    stm.run(&trunk, |txn| txn.set(&obj, 0, 1i64)).unwrap();

    let interceptor = stm.interceptor(&trunk);
    interceptor.intercept();
    stm.run(&trunk, |txn| txn.set(&obj, 0, 2i64)).unwrap();

    let mut sees_all = stm.start(&trunk);
    let mut confirmed = stm.start_with(&trunk, StartFlags::IGNORE_SPECULATIVE_DATA);
    assert_eq!(sees_all.get(&obj, 0).unwrap(), Value::Int(2));
    assert_eq!(confirmed.get(&obj, 0).unwrap(), Value::Int(1));
    drop(sees_all);
    drop(confirmed);

    assert_eq!(interceptor.ack_all(), 1);
    let mut after = stm.start_with(&trunk, StartFlags::IGNORE_SPECULATIVE_DATA);
    assert_eq!(after.get(&obj, 0).unwrap(), Value::Int(2));
}
