//! Replication Tests
//!
//! An authority trunk with several peers over loopback transports:
//! convergence, conflict handling, remote calls and connection loss.

use mvstm_concurrency::{CommitStatus, TObject, Transaction, Trunk, TrunkConfig};
use mvstm_core::{FieldIndex, Granularity, ObjectKind, StmError, Value};
use mvstm_engine::{
    inline_dispatcher, Authority, Completion, Dispatcher, FieldListener, Listener,
    LoopbackTransport, Message, Notifier, PooledDispatcher, Receiver, Replicator, Transport,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn peer(authority: &Arc<Authority>, dispatcher: Arc<dyn Dispatcher>) -> (Arc<Trunk>, Arc<Replicator>) {
    let (client_end, server_end) = LoopbackTransport::pair(dispatcher);
    let trunk = Trunk::new(TrunkConfig::with_granularity(Granularity::All));
    let replicator = Replicator::connect(&trunk, client_end).unwrap();
    authority.accept(server_end);
    (trunk, replicator)
}

fn increment(trunk: &Arc<Trunk>, object: &TObject) -> CommitStatus {
    let mut txn = Transaction::start(trunk);
    let current = txn.get(object, 0).unwrap().int_or_zero();
    txn.set(object, 0, current + 1).unwrap();
    txn.commit().unwrap()
}

fn field(trunk: &Trunk, object: &TObject) -> Value {
    trunk
        .snapshot()
        .read_field(object.id(), 0)
        .cloned()
        .unwrap_or(Value::Null)
}

fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while !done() {
        if start.elapsed() > deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(2));
    }
    true
}

#[derive(Default)]
struct Recorder {
    values: Mutex<Vec<Value>>,
}

impl FieldListener for Recorder {
    fn on_field_changed(&self, _object: &TObject, _field: FieldIndex, value: &Value) {
        self.values.lock().push(value.clone());
    }
}

// ============================================================================
// Convergence
// ============================================================================

#[test]
fn test_three_peers_converge_round_robin() {
    let server = Trunk::new(TrunkConfig::default());
    let authority = Authority::new(&server);
    let counter = server.create_object(ObjectKind::Fields { count: 1 });
    let peers: Vec<_> = (0..3).map(|_| peer(&authority, inline_dispatcher())).collect();

    for round in 0..30 {
        let (trunk, _) = &peers[round % 3];
        let local = trunk.object(counter.id()).unwrap();
        assert_eq!(increment(trunk, &local), CommitStatus::Success);
    }

    assert_eq!(field(&server, &counter), Value::Int(30));
    for (trunk, replicator) in &peers {
        assert_eq!(field(trunk, &counter), Value::Int(30));
        assert!(!trunk.snapshot().has_speculative());
        assert_eq!(replicator.stats().rolled_back, 0);
    }
    assert_eq!(authority.stats().commits_applied, 30);
    assert_eq!(authority.stats().commits_rejected, 0);
}

#[test]
fn test_concurrent_peers_on_disjoint_objects() {
    let pool: Arc<dyn Dispatcher> = Arc::new(PooledDispatcher::new(4, 100_000).unwrap());
    let server = Trunk::new(TrunkConfig::default());
    let authority = Authority::new(&server);
    let objects: Vec<TObject> = (0..3)
        .map(|_| server.create_object(ObjectKind::Fields { count: 1 }))
        .collect();
    let peers: Vec<_> = (0..3).map(|_| peer(&authority, Arc::clone(&pool))).collect();
    assert!(wait_until(Duration::from_secs(10), || peers
        .iter()
        .all(|(_, r)| r.is_welcomed())));

    let per_peer = 20;
    let handles: Vec<_> = peers
        .iter()
        .zip(&objects)
        .map(|((trunk, _), object)| {
            let trunk = Arc::clone(trunk);
            let local = trunk.object(object.id()).unwrap();
            thread::spawn(move || {
                for _ in 0..per_peer {
                    assert_eq!(increment(&trunk, &local), CommitStatus::Success);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let converged = wait_until(Duration::from_secs(10), || {
        objects.iter().all(|o| field(&server, o) == Value::Int(per_peer))
            && peers.iter().all(|(trunk, _)| {
                !trunk.snapshot().has_speculative()
                    && objects.iter().all(|o| field(trunk, o) == Value::Int(per_peer))
            })
    });
    assert!(converged, "peers did not converge");
    pool.drain();
}

#[test]
fn test_authority_commits_reach_peer_listeners() {
    let server = Trunk::new(TrunkConfig::default());
    let authority = Authority::new(&server);
    let obj = server.create_object(ObjectKind::Fields { count: 1 });
    let (trunk, _replicator) = peer(&authority, inline_dispatcher());

    let notifier = Notifier::attach(&trunk, false);
    let recorder = Arc::new(Recorder::default());
    let local = trunk.object(obj.id()).unwrap();
    notifier
        .registry()
        .add_listener(&local, Listener::Fields(recorder.clone()), inline_dispatcher())
        .unwrap();

    for i in 1..=3 {
        let mut txn = Transaction::start(&server);
        txn.set(&obj, 0, i).unwrap();
        txn.commit().unwrap();
    }
    assert_eq!(
        *recorder.values.lock(),
        vec![Value::Int(1), Value::Int(2), Value::Int(3)]
    );
}

#[test]
fn test_objects_created_on_a_peer_reach_the_others() {
    let server = Trunk::new(TrunkConfig::default());
    let authority = Authority::new(&server);
    let (a, _ra) = peer(&authority, inline_dispatcher());
    let (b, _rb) = peer(&authority, inline_dispatcher());

    let created = a.create_object(ObjectKind::Keyed);
    assert!(server.object(created.id()).is_some());
    assert!(b.object(created.id()).is_some());

    let mut txn = Transaction::start(&a);
    txn.put(&created, "k", 1i64).unwrap();
    txn.commit().unwrap();
    let on_b = b.object(created.id()).unwrap();
    let mut read = Transaction::start(&b);
    assert_eq!(read.get_key(&on_b, "k").unwrap(), Some(Value::Int(1)));
}

// ============================================================================
// Remote calls
// ============================================================================

#[test]
fn test_remote_errors_surface_as_remote() {
    let server = Trunk::new(TrunkConfig::default());
    let authority = Authority::new(&server);
    authority.register_method("fail", |_| Err("boom".to_string()));
    authority.register_method("echo", |args| Ok(args.first().cloned().unwrap_or(Value::Null)));
    let (_trunk, replicator) = peer(&authority, inline_dispatcher());

    let (callback, completion) = Completion::pair();
    replicator.call_async("echo", vec![Value::String("hi".into())], callback);
    assert_eq!(completion.wait().unwrap(), Value::String("hi".into()));

    let (callback, completion) = Completion::pair();
    replicator.call_async("fail", vec![], callback);
    match completion.wait() {
        Err(StmError::Remote { message }) => assert_eq!(message, "boom"),
        other => panic!("expected a remote error, got {:?}", other),
    }
    assert_eq!(authority.stats().calls, 2);
}

// ============================================================================
// Connection loss
// ============================================================================

/// Authority stand-in that welcomes and then never answers
#[derive(Default)]
struct SilentAuthority {
    inbox: Mutex<Vec<Message>>,
}

impl Receiver for SilentAuthority {
    fn receive(&self, bytes: &[u8]) {
        self.inbox.lock().push(Message::from_bytes(bytes).unwrap());
    }
    fn on_disconnect(&self) {}
}

#[test]
fn test_close_rolls_back_speculative_state_and_fails_calls() {
    let (client_end, server_end) = LoopbackTransport::pair(inline_dispatcher());
    let silent = Arc::new(SilentAuthority::default());
    let receiver: Arc<dyn Receiver> = silent.clone();
    server_end.bind(Arc::downgrade(&receiver));

    let trunk = Trunk::new(TrunkConfig::with_granularity(Granularity::All));
    let replicator = Replicator::connect(&trunk, client_end).unwrap();
    let welcome = Message::Welcome {
        acknowledged: 0,
        descriptors: Vec::new(),
        maps: Vec::new(),
    };
    server_end.send(welcome.to_bytes().unwrap()).unwrap();
    assert!(replicator.is_welcomed());

    let obj = trunk.create_object(ObjectKind::Fields { count: 1 });
    let notifier = Notifier::attach(&trunk, false);
    let recorder = Arc::new(Recorder::default());
    notifier
        .registry()
        .add_listener(&obj, Listener::Fields(recorder.clone()), inline_dispatcher())
        .unwrap();

    assert_eq!(increment(&trunk, &obj), CommitStatus::Success);
    assert_eq!(field(&trunk, &obj), Value::Int(1));
    assert!(trunk.snapshot().has_speculative());
    assert!(silent
        .inbox
        .lock()
        .iter()
        .any(|m| matches!(m, Message::Commit { .. })));

    let (callback, completion) = Completion::pair();
    replicator.call_async("anything", vec![], callback);
    assert!(!completion.is_done());

    server_end.close();

    assert!(!replicator.is_connected());
    assert!(matches!(completion.wait(), Err(StmError::ConnectionClosed)));
    assert_eq!(field(&trunk, &obj), Value::Null);
    assert_eq!(*recorder.values.lock(), vec![Value::Int(1), Value::Null]);
    assert_eq!(replicator.stats().rolled_back, 1);
    assert!(!trunk.is_intercepted());

    // calls after the close fail at once
    let (callback, completion) = Completion::pair();
    replicator.call_async("anything", vec![], callback);
    assert!(matches!(completion.wait(), Err(StmError::ConnectionClosed)));
}

#[test]
fn test_authority_shutdown_disconnects_peers() {
    let server = Trunk::new(TrunkConfig::default());
    let authority = Authority::new(&server);
    let obj = server.create_object(ObjectKind::Fields { count: 1 });
    let (trunk, replicator) = peer(&authority, inline_dispatcher());

    let local = trunk.object(obj.id()).unwrap();
    assert_eq!(increment(&trunk, &local), CommitStatus::Success);
    authority.shutdown();

    assert!(!replicator.is_connected());
    assert_eq!(authority.peer_count(), 0);
    // acknowledged state survives the disconnect
    assert_eq!(field(&trunk, &obj), Value::Int(1));
}
