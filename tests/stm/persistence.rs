//! Durable trunks across engine restarts

use mvstm::{ObjectKind, Stm, StmConfig, Value};
use tempfile::TempDir;

fn durable_config() -> StmConfig {
    StmConfig {
        durability: "always".to_string(),
        ..StmConfig::in_memory()
    }
}

#[test]
fn test_all_object_kinds_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let (fields, map, list) = {
        let stm = Stm::open_with(dir.path(), durable_config()).unwrap();
        let trunk = stm.open_trunk("app").unwrap();
        let fields = trunk.create_object(ObjectKind::Fields { count: 2 });
        let map = trunk.create_object(ObjectKind::Keyed);
        let list = trunk.create_object(ObjectKind::Indexed);
        trunk.set_root(&map).unwrap();
        stm.run(&trunk, |txn| {
            txn.set(&fields, 1, "second")?;
            txn.put(&map, "a", 1i64)?;
            txn.put(&map, "b", 2i64)?;
            txn.list_push(&list, 10i64)?;
            txn.list_push(&list, 20i64)
        })
        .unwrap();
        stm.run(&trunk, |txn| {
            txn.remove_key(&map, "a")?;
            txn.list_remove(&list, 0).map(|_| ())
        })
        .unwrap();
        (fields, map, list)
    };

    let stm = Stm::open_with(dir.path(), durable_config()).unwrap();
    let trunk = stm.open_trunk("app").unwrap();
    assert_eq!(trunk.root().map(|r| r.id()), Some(map.id()));
    let fields = trunk.object(fields.id()).unwrap();
    let map = trunk.object(map.id()).unwrap();
    let list = trunk.object(list.id()).unwrap();

    let mut txn = stm.start(&trunk);
    assert_eq!(txn.get(&fields, 0).unwrap(), Value::Null);
    assert_eq!(txn.get(&fields, 1).unwrap(), Value::String("second".into()));
    assert_eq!(txn.keys(&map).unwrap(), vec!["b".to_string()]);
    assert_eq!(txn.list_items(&list).unwrap(), vec![Value::Int(20)]);
}

#[test]
fn test_rejected_speculative_commits_never_reach_disk() {
    let dir = TempDir::new().unwrap();
    let obj = {
        let stm = Stm::open_with(dir.path(), durable_config()).unwrap();
        let trunk = stm.open_trunk("spec").unwrap();
        let obj = trunk.create_object(ObjectKind::Fields { count: 2 });
        stm.run(&trunk, |txn| txn.set(&obj, 0, 1i64)).unwrap();

        let interceptor = stm.interceptor(&trunk);
        interceptor.intercept();
        stm.run(&trunk, |txn| txn.set(&obj, 0, 2i64)).unwrap();
        stm.run(&trunk, |txn| txn.set(&obj, 1, 3i64)).unwrap();
        let pending = interceptor.pending();
        assert_eq!(pending.depth(), 2);

        // keep the first speculative map, drop the second
        interceptor.ack(pending.interception, pending.sequences[0]).unwrap();
        interceptor.reject(pending.sequences[1]).unwrap();
        obj
    };

    let stm = Stm::open_with(dir.path(), durable_config()).unwrap();
    let trunk = stm.open_trunk("spec").unwrap();
    let obj = trunk.object(obj.id()).unwrap();
    let mut txn = stm.start(&trunk);
    assert_eq!(txn.get(&obj, 0).unwrap(), Value::Int(2));
    assert_eq!(txn.get(&obj, 1).unwrap(), Value::Null);
}

#[test]
fn test_cache_mode_writes_nothing() {
    let dir = TempDir::new().unwrap();
    let config = StmConfig {
        durability: "cache".to_string(),
        ..StmConfig::in_memory()
    };
    let stm = Stm::open_with(dir.path(), config).unwrap();
    let trunk = stm.open_trunk("scratch").unwrap();
    let obj = trunk.create_object(ObjectKind::Fields { count: 1 });
    stm.run(&trunk, |txn| txn.set(&obj, 0, 1i64)).unwrap();
    assert!(!dir.path().join("scratch").exists());
}

#[test]
fn test_config_file_drives_the_engine() {
    let dir = TempDir::new().unwrap();
    let custom = StmConfig {
        granularity: "coalesce".to_string(),
        ..durable_config()
    };
    custom
        .write_to_file(&dir.path().join(mvstm::CONFIG_FILE_NAME))
        .unwrap();

    let stm = Stm::open(dir.path()).unwrap();
    assert_eq!(stm.config(), &custom);
    let trunk = stm.open_trunk("t").unwrap();
    assert_eq!(trunk.granularity(), mvstm::Granularity::Coalesce);
}
