use super::Store;
use crate::format::StoreRecord;
use mvstm_core::StmResult;
use parking_lot::Mutex;

/// Store that keeps records in memory, for tests and ephemeral trunks
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<Vec<StoreRecord>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records appended
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// True if nothing was appended
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl Store for MemoryStore {
    fn append(&self, record: &StoreRecord) -> StmResult<()> {
        self.records.lock().push(record.clone());
        Ok(())
    }

    fn replay(&self) -> StmResult<Vec<StoreRecord>> {
        Ok(self.records.lock().clone())
    }

    fn sync(&self) -> StmResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::RecordKind;
    use mvstm_core::ObjectId;

    #[test]
    fn test_replay_preserves_order() {
        let store = MemoryStore::new();
        store.append_commit(1, vec![1]).unwrap();
        store.append_commit(2, vec![2]).unwrap();
        let records = store.replay().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].sequence, 1);
        assert_eq!(records[1].payload, vec![2]);
    }

    #[test]
    fn test_last_root_wins() {
        let store = MemoryStore::new();
        assert_eq!(store.root().unwrap(), None);
        store.set_root(ObjectId(3)).unwrap();
        store.append_commit(1, vec![]).unwrap();
        store.set_root(ObjectId(9)).unwrap();
        assert_eq!(store.root().unwrap(), Some(ObjectId(9)));
        assert_eq!(
            store
                .replay()
                .unwrap()
                .iter()
                .filter(|r| r.kind == RecordKind::Root)
                .count(),
            2
        );
    }
}
