//! Database abstraction layer.
//!
//! Provides a unified interface over key-value backends so the payment store
//! can run on an embedded database in production and on plain memory in
//! tests. Backends are selected via feature flags; the in-memory backend is
//! always available.

use anyhow::Result;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};

/// Database abstraction trait.
///
/// A database is a set of named trees (tables) of byte key-value pairs.
pub trait Database: Send + Sync {
    /// Open a named tree/table.
    fn open_tree(&self, name: &str) -> Result<Box<dyn Tree>>;

    /// Flush all pending writes.
    fn flush(&self) -> Result<()>;
}

/// Tree/table abstraction trait.
pub trait Tree: Send + Sync {
    /// Insert a key-value pair (overwrites).
    fn insert(&self, key: &[u8], value: &[u8]) -> Result<()>;

    /// Get a value by key.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Remove a key-value pair.
    fn remove(&self, key: &[u8]) -> Result<()>;

    /// Check if a key exists.
    fn contains_key(&self, key: &[u8]) -> Result<bool>;

    /// Number of entries.
    fn len(&self) -> Result<usize>;

    /// Check if the tree is empty.
    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Snapshot of all key-value pairs.
    ///
    /// The payment store filters over full documents, so a materialised
    /// snapshot keeps the trait object-safe without leaking backend iterator
    /// lifetimes.
    fn scan(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;
}

/// Database backend type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseBackend {
    Memory,
    Sled,
}

/// Create a database instance based on backend type.
pub fn create_database<P: AsRef<Path>>(
    data_dir: P,
    backend: DatabaseBackend,
) -> Result<Arc<dyn Database>> {
    match backend {
        DatabaseBackend::Memory => Ok(Arc::new(MemoryDatabase::new())),
        #[cfg(feature = "sled")]
        DatabaseBackend::Sled => Ok(Arc::new(sled_impl::SledDatabase::new(data_dir)?)),
        #[cfg(not(feature = "sled"))]
        DatabaseBackend::Sled => {
            let _ = data_dir;
            Err(anyhow::anyhow!(
                "sled backend not available (feature not enabled)"
            ))
        }
    }
}

/// Preferred backend: sled when compiled in, memory otherwise.
pub fn default_backend() -> DatabaseBackend {
    #[cfg(feature = "sled")]
    {
        DatabaseBackend::Sled
    }
    #[cfg(not(feature = "sled"))]
    {
        DatabaseBackend::Memory
    }
}

/// In-memory database, used by unit tests and as the fallback backend.
pub struct MemoryDatabase {
    trees: Mutex<HashMap<String, Arc<RwLock<BTreeMap<Vec<u8>, Vec<u8>>>>>>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self {
            trees: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl Database for MemoryDatabase {
    fn open_tree(&self, name: &str) -> Result<Box<dyn Tree>> {
        let mut trees = self
            .trees
            .lock()
            .map_err(|_| anyhow::anyhow!("memory database lock poisoned"))?;
        let tree = trees
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(BTreeMap::new())))
            .clone();
        Ok(Box::new(MemoryTree { map: tree }))
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

struct MemoryTree {
    map: Arc<RwLock<BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl MemoryTree {
    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, BTreeMap<Vec<u8>, Vec<u8>>>> {
        self.map
            .read()
            .map_err(|_| anyhow::anyhow!("memory tree lock poisoned"))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, BTreeMap<Vec<u8>, Vec<u8>>>> {
        self.map
            .write()
            .map_err(|_| anyhow::anyhow!("memory tree lock poisoned"))
    }
}

impl Tree for MemoryTree {
    fn insert(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.write()?.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.read()?.get(key).cloned())
    }

    fn remove(&self, key: &[u8]) -> Result<()> {
        self.write()?.remove(key);
        Ok(())
    }

    fn contains_key(&self, key: &[u8]) -> Result<bool> {
        Ok(self.read()?.contains_key(key))
    }

    fn len(&self) -> Result<usize> {
        Ok(self.read()?.len())
    }

    fn scan(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        Ok(self
            .read()?
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

#[cfg(feature = "sled")]
mod sled_impl {
    use super::{Database, Tree};
    use anyhow::Result;
    use std::path::Path;

    /// Sled-backed database.
    pub struct SledDatabase {
        db: sled::Db,
    }

    impl SledDatabase {
        pub fn new<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
            let db = sled::open(data_dir.as_ref())?;
            Ok(Self { db })
        }
    }

    impl Database for SledDatabase {
        fn open_tree(&self, name: &str) -> Result<Box<dyn Tree>> {
            let tree = self.db.open_tree(name)?;
            Ok(Box::new(SledTree { tree }))
        }

        fn flush(&self) -> Result<()> {
            self.db.flush()?;
            Ok(())
        }
    }

    struct SledTree {
        tree: sled::Tree,
    }

    impl Tree for SledTree {
        fn insert(&self, key: &[u8], value: &[u8]) -> Result<()> {
            self.tree.insert(key, value)?;
            Ok(())
        }

        fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
            Ok(self.tree.get(key)?.map(|v| v.to_vec()))
        }

        fn remove(&self, key: &[u8]) -> Result<()> {
            self.tree.remove(key)?;
            Ok(())
        }

        fn contains_key(&self, key: &[u8]) -> Result<bool> {
            Ok(self.tree.contains_key(key)?)
        }

        fn len(&self) -> Result<usize> {
            Ok(self.tree.len())
        }

        fn scan(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
            let mut out = Vec::new();
            for item in self.tree.iter() {
                let (k, v) = item?;
                out.push((k.to_vec(), v.to_vec()));
            }
            Ok(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_tree_round_trip() {
        let db = MemoryDatabase::new();
        let tree = db.open_tree("payments").unwrap();

        tree.insert(b"k1", b"v1").unwrap();
        assert_eq!(tree.get(b"k1").unwrap(), Some(b"v1".to_vec()));
        assert!(tree.contains_key(b"k1").unwrap());
        assert_eq!(tree.len().unwrap(), 1);

        tree.remove(b"k1").unwrap();
        assert!(tree.get(b"k1").unwrap().is_none());
        assert!(tree.is_empty().unwrap());
    }

    #[test]
    fn trees_are_shared_by_name() {
        let db = MemoryDatabase::new();
        let a = db.open_tree("orders").unwrap();
        let b = db.open_tree("orders").unwrap();

        a.insert(b"id", b"doc").unwrap();
        assert_eq!(b.get(b"id").unwrap(), Some(b"doc".to_vec()));
    }

    #[test]
    fn scan_returns_all_pairs() {
        let db = MemoryDatabase::new();
        let tree = db.open_tree("t").unwrap();
        tree.insert(b"a", b"1").unwrap();
        tree.insert(b"b", b"2").unwrap();

        let snapshot = tree.scan().unwrap();
        assert_eq!(snapshot.len(), 2);
    }
}
