//! Storage adapters.
//!
//! `FileStorage` maps keys to files under a root directory and writes through
//! a temp file that is renamed into place, so a crash mid-write never leaves a
//! partially written value under a real key. `MemoryStorage` keeps everything
//! in process.

use std::collections::BTreeMap;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tempfile::NamedTempFile;
use tokio::fs;
use tokio::sync::RwLock;

use super::{validate_key, StorageError, StoragePort};

/// File-backed store rooted at a directory
#[derive(Debug, Clone)]
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    /// Create or open a store rooted at `root`
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        fs::create_dir_all(&root)
            .await
            .map_err(|source| StorageError::Io {
                key: root.display().to_string(),
                source,
            })?;
        Ok(Self { root })
    }

    /// Root directory of the store
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }

    async fn write(&self, key: &str, bytes: Vec<u8>, overwrite: bool) -> Result<bool, StorageError> {
        let path = self.path_for(key)?;
        let io_err = |source| StorageError::Io {
            key: key.to_string(),
            source,
        };

        tokio::task::spawn_blocking(move || write_atomic(&path, &bytes, overwrite))
            .await
            .map_err(|e| io_err(io::Error::new(io::ErrorKind::Other, e)))?
            .map_err(io_err)
    }
}

/// Write via temp file + fsync + rename. Returns false if `overwrite` is
/// false and the target already exists.
fn write_atomic(path: &Path, bytes: &[u8], overwrite: bool) -> io::Result<bool> {
    let parent = path
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "key has no parent"))?;
    std::fs::create_dir_all(parent)?;

    let mut tmp = NamedTempFile::new_in(parent)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;

    if overwrite {
        tmp.persist(path).map_err(|e| e.error)?;
        return Ok(true);
    }

    match tmp.persist_noclobber(path) {
        Ok(_) => Ok(true),
        Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e.error),
    }
}

#[async_trait]
impl StoragePort for FileStorage {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), StorageError> {
        self.write(key, bytes, true).await.map(|_| ())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.path_for(key)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(key.to_string()))
            }
            Err(source) => Err(StorageError::Io {
                key: key.to_string(),
                source,
            }),
        }
    }

    async fn put_if_absent(&self, key: &str, bytes: Vec<u8>) -> Result<bool, StorageError> {
        self.write(key, bytes, false).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        // Walk from the deepest directory the prefix names completely
        let start = match prefix.rfind('/') {
            Some(idx) => self.root.join(&prefix[..idx]),
            None => self.root.clone(),
        };

        let mut keys = Vec::new();
        let mut pending = vec![start];

        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(source) => {
                    return Err(StorageError::Io {
                        key: prefix.to_string(),
                        source,
                    })
                }
            };

            while let Some(entry) = entries.next_entry().await.map_err(|source| StorageError::Io {
                key: prefix.to_string(),
                source,
            })? {
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                if name.starts_with(".tmp") {
                    continue;
                }

                let path = entry.path();
                let file_type = entry.file_type().await.map_err(|source| StorageError::Io {
                    key: prefix.to_string(),
                    source,
                })?;

                if file_type.is_dir() {
                    pending.push(path);
                } else if let Ok(rel) = path.strip_prefix(&self.root) {
                    let key = rel
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy())
                        .collect::<Vec<_>>()
                        .join("/");
                    if key.starts_with(prefix) {
                        keys.push(key);
                    }
                }
            }
        }

        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StorageError::Io {
                key: key.to_string(),
                source,
            }),
        }
    }
}

/// In-process store
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StoragePort for MemoryStorage {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), StorageError> {
        validate_key(key)?;
        self.entries.write().await.insert(key.to_string(), bytes);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        validate_key(key)?;
        self.entries
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn put_if_absent(&self, key: &str, bytes: Vec<u8>) -> Result<bool, StorageError> {
        validate_key(key)?;
        let mut entries = self.entries.write().await;
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(key.to_string(), bytes);
        Ok(true)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        Ok(self
            .entries
            .read()
            .await
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        validate_key(key)?;
        self.entries.write().await.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn exercise(store: &dyn StoragePort) {
        store.put("sessions/a/one", b"1".to_vec()).await.unwrap();
        store.put("sessions/a/two", b"2".to_vec()).await.unwrap();
        store.put("sessions/b/one", b"3".to_vec()).await.unwrap();

        assert_eq!(store.get("sessions/a/one").await.unwrap(), b"1");
        assert!(store.get("sessions/a/missing").await.unwrap_err().is_not_found());

        // put replaces, put_if_absent does not
        store.put("sessions/a/one", b"1b".to_vec()).await.unwrap();
        assert!(!store.put_if_absent("sessions/a/one", b"x".to_vec()).await.unwrap());
        assert_eq!(store.get("sessions/a/one").await.unwrap(), b"1b");
        assert!(store.put_if_absent("sessions/a/three", b"3".to_vec()).await.unwrap());

        let keys = store.list("sessions/a/").await.unwrap();
        assert_eq!(
            keys,
            vec!["sessions/a/one", "sessions/a/three", "sessions/a/two"]
        );
        assert_eq!(store.list("sessions/").await.unwrap().len(), 4);
        assert!(store.list("nothing/").await.unwrap().is_empty());

        store.delete("sessions/a/two").await.unwrap();
        store.delete("sessions/a/two").await.unwrap();
        assert_eq!(store.list("sessions/a/").await.unwrap().len(), 2);

        assert!(matches!(
            store.put("../escape", vec![]).await,
            Err(StorageError::InvalidKey(_))
        ));
    }

    #[tokio::test]
    async fn test_memory_storage() {
        exercise(&MemoryStorage::new()).await;
    }

    #[tokio::test]
    async fn test_file_storage() {
        let temp = TempDir::new().unwrap();
        let store = FileStorage::open(temp.path()).await.unwrap();
        exercise(&store).await;
    }

    #[tokio::test]
    async fn test_file_storage_ignores_temp_files() {
        let temp = TempDir::new().unwrap();
        let store = FileStorage::open(temp.path()).await.unwrap();
        store.put("s/real", b"ok".to_vec()).await.unwrap();

        // Leftover from an interrupted write
        std::fs::write(temp.path().join("s").join(".tmpAbC123"), b"partial").unwrap();

        assert_eq!(store.list("s/").await.unwrap(), vec!["s/real"]);
    }

    #[tokio::test]
    async fn test_concurrent_put_if_absent_single_winner() {
        let temp = TempDir::new().unwrap();
        let store = std::sync::Arc::new(FileStorage::open(temp.path()).await.unwrap());

        let mut set = tokio::task::JoinSet::new();
        for i in 0..8u8 {
            let store = store.clone();
            set.spawn(async move { store.put_if_absent("race/key", vec![i]).await.unwrap() });
        }

        let mut winners = 0;
        while let Some(won) = set.join_next().await {
            if won.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
