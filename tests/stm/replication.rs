//! An authority and three peers in one process

use mvstm::{
    inline_dispatcher, CommitStatus, Completion, LoopbackTransport, ObjectKind, StmError,
    Transaction, Value,
};
use std::sync::Arc;

use crate::{init_tracing, memory_stm};

#[test]
fn test_peers_a_b_c_share_one_order() {
    init_tracing();
    let server = memory_stm();
    let main = server.create_trunk().unwrap();
    let cell = main.create_object(ObjectKind::Fields { count: 1 });
    let authority = server.serve(&main).unwrap();

    let client = memory_stm();
    let peers: Vec<_> = (0..3)
        .map(|_| {
            let (near, far) = LoopbackTransport::pair(inline_dispatcher());
            let trunk = client.create_trunk().unwrap();
            let replicator = client.connect(&trunk, near).unwrap();
            authority.accept(far);
            (trunk, replicator)
        })
        .collect();
    let (a, b, c) = (&peers[0].0, &peers[1].0, &peers[2].0);
    let on = |trunk: &Arc<mvstm::Trunk>| trunk.object(cell.id()).unwrap();

    // C starts from the empty cell, then A and B write it in turn
    let mut late = Transaction::start(c);
    let seen = late.get(&on(c), 0).unwrap();
    assert_eq!(seen, Value::Null);

    client.run(a, |txn| txn.set(&on(a), 0, "a")).unwrap();
    client.run(b, |txn| {
        let prev = txn.get(&on(b), 0)?;
        assert_eq!(prev, Value::String("a".into()));
        txn.set(&on(b), 0, "b")
    })
    .unwrap();

    // C's view is stale: its commit conflicts locally and is never sent
    late.set(&on(c), 0, "c").unwrap();
    assert_eq!(late.commit().unwrap(), CommitStatus::Conflict);
    assert_eq!(peers[2].1.stats().commits_sent, 0);

    for (trunk, replicator) in &peers {
        assert_eq!(
            trunk.snapshot().read_field(cell.id(), 0),
            Some(&Value::String("b".into()))
        );
        assert!(!trunk.snapshot().has_speculative());
        assert!(replicator.is_connected());
    }
    assert_eq!(
        main.snapshot().read_field(cell.id(), 0),
        Some(&Value::String("b".into()))
    );
}

#[test]
fn test_remote_calls_and_shutdown() {
    init_tracing();
    let server = memory_stm();
    let main = server.create_trunk().unwrap();
    let authority = server.serve(&main).unwrap();
    authority.register_method("double", |args| match args.first() {
        Some(Value::Int(v)) => Ok(Value::Int(v * 2)),
        _ => Err("double needs an integer".to_string()),
    });

    let client = memory_stm();
    let trunk = client.create_trunk().unwrap();
    let (near, far) = LoopbackTransport::pair(inline_dispatcher());
    let replicator = client.connect(&trunk, near).unwrap();
    authority.accept(far);

    let (callback, completion) = Completion::pair();
    replicator.call_async("double", vec![Value::Int(21)], callback);
    assert_eq!(completion.wait().unwrap(), Value::Int(42));

    let (callback, completion) = Completion::pair();
    replicator.call_async("double", vec![Value::Null], callback);
    assert!(matches!(completion.wait(), Err(StmError::Remote { .. })));

    server.shutdown().unwrap();
    assert!(!replicator.is_connected());
    let (callback, completion) = Completion::pair();
    replicator.call_async("double", vec![Value::Int(1)], callback);
    assert!(matches!(completion.wait(), Err(StmError::ConnectionClosed)));
}
