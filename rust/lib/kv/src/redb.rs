use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableTable, TableDefinition};

use crate::error::KVError;
use crate::traits::{Check, KVStore, Write};

const TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("kv");

/// RedbStore is a KVStore implementation backed by redb, a pure-Rust embedded
/// key-value database.
///
/// redb admits one write transaction at a time, so `commit_if` is a true
/// read-check-write: no other writer can run between the checks and the writes.
pub struct RedbStore {
    db: Arc<Database>,
}

impl RedbStore {
    /// Open or create a redb database at the given path.
    pub fn open(path: &Path) -> Result<Self, KVError> {
        let db = Database::create(path).map_err(KVError::storage)?;

        // Ensure the table exists so read transactions never see it missing.
        let write_txn = db.begin_write().map_err(KVError::storage)?;
        {
            let _table = write_txn.open_table(TABLE).map_err(KVError::storage)?;
        }
        write_txn.commit().map_err(KVError::storage)?;

        Ok(Self { db: Arc::new(db) })
    }
}

impl KVStore for RedbStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KVError> {
        let read_txn = self.db.begin_read().map_err(KVError::storage)?;
        let table = read_txn.open_table(TABLE).map_err(KVError::storage)?;

        let value = table.get(key).map_err(KVError::storage)?;
        Ok(value.map(|v| v.value().to_vec()))
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), KVError> {
        self.batch_set(&[(key, value)])
    }

    fn delete(&self, key: &str) -> Result<(), KVError> {
        self.batch_delete(&[key])
    }

    fn batch_set(&self, entries: &[(&str, &[u8])]) -> Result<(), KVError> {
        let write_txn = self.db.begin_write().map_err(KVError::storage)?;
        {
            let mut table = write_txn.open_table(TABLE).map_err(KVError::storage)?;
            for (key, value) in entries {
                table.insert(*key, *value).map_err(KVError::storage)?;
            }
        }
        write_txn.commit().map_err(KVError::storage)?;
        Ok(())
    }

    fn batch_delete(&self, keys: &[&str]) -> Result<(), KVError> {
        let write_txn = self.db.begin_write().map_err(KVError::storage)?;
        {
            let mut table = write_txn.open_table(TABLE).map_err(KVError::storage)?;
            for key in keys {
                table.remove(*key).map_err(KVError::storage)?;
            }
        }
        write_txn.commit().map_err(KVError::storage)?;
        Ok(())
    }

    fn scan(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, KVError> {
        let read_txn = self.db.begin_read().map_err(KVError::storage)?;
        let table = read_txn.open_table(TABLE).map_err(KVError::storage)?;

        let mut results = Vec::new();
        let iter = table.range(prefix..).map_err(KVError::storage)?;

        for entry in iter {
            let entry = entry.map_err(KVError::storage)?;
            let key = entry.0.value().to_string();
            if !key.starts_with(prefix) {
                break;
            }
            results.push((key, entry.1.value().to_vec()));
        }

        Ok(results)
    }

    fn commit_if(&self, checks: &[Check<'_>], writes: &[Write<'_>]) -> Result<bool, KVError> {
        let write_txn = self.db.begin_write().map_err(KVError::storage)?;
        let holds = {
            let mut table = write_txn.open_table(TABLE).map_err(KVError::storage)?;

            let mut holds = true;
            for (key, expected) in checks {
                let current = table
                    .get(*key)
                    .map_err(KVError::storage)?
                    .map(|v| v.value().to_vec());
                if current.as_deref() != *expected {
                    tracing::debug!("commit_if: check failed on {}", key);
                    holds = false;
                    break;
                }
            }

            if holds {
                for (key, value) in writes {
                    match value {
                        Some(v) => {
                            table.insert(*key, *v).map_err(KVError::storage)?;
                        }
                        None => {
                            table.remove(*key).map_err(KVError::storage)?;
                        }
                    }
                }
            }
            holds
        };

        if holds {
            write_txn.commit().map_err(KVError::storage)?;
        } else {
            write_txn.abort().map_err(KVError::storage)?;
        }
        Ok(holds)
    }
}
