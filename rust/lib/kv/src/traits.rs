use crate::error::KVError;

/// A precondition on a single key: the current value must equal `expected`.
/// `None` means the key must be absent.
pub type Check<'a> = (&'a str, Option<&'a [u8]>);

/// A write applied by [`KVStore::commit_if`]: `Some` puts, `None` deletes.
pub type Write<'a> = (&'a str, Option<&'a [u8]>);

/// KVStore provides a key-value storage interface.
///
/// Keys follow a namespaced convention: `rollout:channel:{app}:{name}`,
/// `rollout:release:{id}`, etc. Multi-key invariants are maintained with
/// [`KVStore::commit_if`], which checks and writes inside one transaction.
pub trait KVStore: Send + Sync {
    /// Get the value for a key. Returns None if the key does not exist.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KVError>;

    /// Set a key-value pair.
    fn set(&self, key: &str, value: &[u8]) -> Result<(), KVError>;

    /// Delete a key. Deleting a missing key is not an error.
    fn delete(&self, key: &str) -> Result<(), KVError>;

    /// Set many keys in a single transaction.
    fn batch_set(&self, entries: &[(&str, &[u8])]) -> Result<(), KVError>;

    /// Delete many keys in a single transaction.
    fn batch_delete(&self, keys: &[&str]) -> Result<(), KVError>;

    /// Scan all keys matching a prefix. Returns sorted (key, value) pairs.
    fn scan(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, KVError>;

    /// Atomically verify every check and, only if all hold, apply every write.
    ///
    /// Returns `Ok(false)` without writing anything when any check fails.
    fn commit_if(&self, checks: &[Check<'_>], writes: &[Write<'_>]) -> Result<bool, KVError>;

    /// Single-key compare-and-swap built on [`KVStore::commit_if`].
    fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        value: &[u8],
    ) -> Result<bool, KVError> {
        self.commit_if(&[(key, expected)], &[(key, Some(value))])
    }
}
