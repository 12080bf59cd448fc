//! Listener delivery through the engine handle

use mvstm::{
    FieldIndex, FieldListener, Listener, ObjectKind, Stm, StmConfig, TObject, Value,
};
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Default)]
struct Recorder {
    values: Mutex<Vec<Value>>,
}

impl FieldListener for Recorder {
    fn on_field_changed(&self, _object: &TObject, _field: FieldIndex, value: &Value) {
        self.values.lock().push(value.clone());
    }
}

fn pooled(granularity: &str) -> Stm {
    Stm::new(StmConfig {
        granularity: granularity.to_string(),
        dispatcher: "pooled".to_string(),
        worker_threads: 3,
        durability: "cache".to_string(),
        ..StmConfig::default()
    })
    .unwrap()
}

#[test]
fn test_all_notifies_one_through_n() {
    let stm = pooled("all");
    let trunk = stm.create_trunk().unwrap();
    let obj = trunk.create_object(ObjectKind::Fields { count: 1 });
    let recorder = Arc::new(Recorder::default());
    stm.add_listener(&trunk, &obj, Listener::Fields(recorder.clone()))
        .unwrap();

    let n = 100;
    for i in 1..=n {
        stm.run(&trunk, |txn| txn.set(&obj, 0, i)).unwrap();
    }
    stm.dispatcher().drain();

    let expected: Vec<Value> = (1..=n).map(Value::Int).collect();
    assert_eq!(*recorder.values.lock(), expected);
}

#[test]
fn test_coalesce_never_exceeds_commits() {
    let stm = pooled("coalesce");
    let trunk = stm.create_trunk().unwrap();
    let obj = trunk.create_object(ObjectKind::Fields { count: 1 });
    let recorder = Arc::new(Recorder::default());
    stm.add_listener(&trunk, &obj, Listener::Fields(recorder.clone()))
        .unwrap();

    let n = 300;
    for i in 1..=n {
        stm.run(&trunk, |txn| txn.set(&obj, 0, i)).unwrap();
    }
    stm.dispatcher().drain();

    let values = recorder.values.lock();
    assert!(values.len() <= n as usize);
    assert_eq!(values.last(), Some(&Value::Int(n)));
}

#[test]
fn test_two_listeners_on_one_object_each_see_everything() {
    let stm = pooled("all");
    let trunk = stm.create_trunk().unwrap();
    let obj = trunk.create_object(ObjectKind::Fields { count: 1 });
    let first = Arc::new(Recorder::default());
    let second = Arc::new(Recorder::default());
    stm.add_listener(&trunk, &obj, Listener::Fields(first.clone()))
        .unwrap();
    let id = stm
        .add_listener(&trunk, &obj, Listener::Fields(second.clone()))
        .unwrap();

    stm.run(&trunk, |txn| txn.set(&obj, 0, 1i64)).unwrap();
    stm.dispatcher().drain();
    assert!(stm.remove_listener(&trunk, id));
    stm.run(&trunk, |txn| txn.set(&obj, 0, 2i64)).unwrap();
    stm.dispatcher().drain();

    assert_eq!(*first.values.lock(), vec![Value::Int(1), Value::Int(2)]);
    assert_eq!(*second.values.lock(), vec![Value::Int(1)]);
}
