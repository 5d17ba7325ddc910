use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::{Column, KeyValueStore, ScanResult, StoreError, WriteBatch, WriteOp};

type MemoryStoreMap = BTreeMap<(Column, Vec<u8>), Vec<u8>>;

/// Volatile store used by tests and `--backend memory`.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryStoreMap>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self, column: Column) -> Result<usize, StoreError> {
        let guard = self.read()?;
        Ok(guard.keys().filter(|(entry, _)| *entry == column).count())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, MemoryStoreMap>, StoreError> {
        self.inner
            .read()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, MemoryStoreMap>, StoreError> {
        self.inner
            .write()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".to_string()))
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let guard = self.read()?;
        Ok(guard.get(&(column, key.to_vec())).cloned())
    }

    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError> {
        let guard = self.read()?;
        let start = (column, prefix.to_vec());
        Ok(guard
            .range(start..)
            .take_while(|((entry_column, key), _)| {
                *entry_column == column && key.starts_with(prefix)
            })
            .map(|((_, key), value)| (key.clone(), value.clone()))
            .collect())
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        let mut guard = self.write()?;
        for op in batch.iter() {
            match op {
                WriteOp::Put { column, key, value } => {
                    guard.insert((*column, key.to_vec()), value.clone());
                }
                WriteOp::Delete { column, key } => {
                    guard.remove(&(*column, key.to_vec()));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_scan_stays_within_column() {
        let store = MemoryStore::new();
        let mut batch = WriteBatch::new();
        batch.put(Column::Coins, [1u8, 1], [10u8]);
        batch.put(Column::Coins, [1u8, 2], [11u8]);
        batch.put(Column::Coins, [2u8, 1], [12u8]);
        batch.put(Column::Meta, [1u8, 3], [13u8]);
        store.write_batch(&batch).expect("write");

        let hits = store.scan_prefix(Column::Coins, &[1]).expect("scan");
        assert_eq!(
            hits,
            vec![(vec![1, 1], vec![10]), (vec![1, 2], vec![11])]
        );
        assert_eq!(store.scan_prefix(Column::Coins, &[]).expect("all").len(), 3);
        assert_eq!(store.len(Column::Meta).expect("len"), 1);
    }

    #[test]
    fn batch_delete_after_put_removes_key() {
        let store = MemoryStore::new();
        let mut batch = WriteBatch::new();
        batch.put(Column::Meta, b"best", [1u8; 32]);
        batch.delete(Column::Meta, b"best");
        store.write_batch(&batch).expect("write");
        assert_eq!(store.get(Column::Meta, b"best").expect("get"), None);
    }
}
