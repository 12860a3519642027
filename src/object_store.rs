//! Object storage contract and its in-memory and filesystem bindings.
//!
//! Keys are opaque to callers: `put` returns the final key and everything
//! else takes it back verbatim. The S3 binding lives in an external adapter.

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};
use std::collections::HashMap;
use std::io::Cursor;
use std::path::PathBuf;
use std::sync::Mutex;
use tokio::io::AsyncRead;

/// Error type for object store operations.
#[derive(Debug, thiserror::Error)]
pub enum ObjectStoreError {
    /// No object exists under the given key.
    #[error("object {0} not found")]
    NotFound(String),

    /// The key is not acceptable to this binding.
    #[error("invalid object key {0}")]
    InvalidKey(String),

    /// The underlying storage failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A readable byte stream over a stored object.
pub type ObjectStream = Box<dyn AsyncRead + Send + Unpin>;

/// Contract every object store binding implements.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `bytes` under a key derived from `name` and return that key.
    async fn put(&self, name: &str, bytes: &[u8]) -> Result<String, ObjectStoreError>;

    /// Fetch the full object.
    async fn get(&self, key: &str) -> Result<Vec<u8>, ObjectStoreError>;

    /// Open the object as a stream.
    async fn get_stream(&self, key: &str) -> Result<ObjectStream, ObjectStoreError>;

    /// Remove the object. Removing a missing object is not an error.
    async fn delete(&self, key: &str) -> Result<(), ObjectStoreError>;
}

/// The storage name for one incoming attachment:
/// `csv-files/YYYY/MM/DD/<uuid>_<filename>`.
pub fn attachment_key(received: DateTime<Utc>, filename: &str) -> String {
    format!(
        "csv-files/{:04}/{:02}/{:02}/{}_{}",
        received.year(),
        received.month(),
        received.day(),
        uuid::Uuid::new_v4(),
        sanitize_filename(filename),
    )
}

fn sanitize_filename(filename: &str) -> String {
    filename
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '-'
            }
        })
        .collect()
}

/// In-memory object store for tests and local development.
#[derive(Debug, Default)]
pub struct InMemoryObjectStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    prefix: String,
}

impl InMemoryObjectStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that prefixes every key, e.g. `test-42/`.
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            objects: Mutex::new(HashMap::new()),
            prefix: prefix.into(),
        }
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn put(&self, name: &str, bytes: &[u8]) -> Result<String, ObjectStoreError> {
        let key = format!("{}{name}", self.prefix);
        self.objects
            .lock()
            .unwrap()
            .insert(key.clone(), bytes.to_vec());
        Ok(key)
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, ObjectStoreError> {
        self.objects
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| ObjectStoreError::NotFound(key.to_string()))
    }

    async fn get_stream(&self, key: &str) -> Result<ObjectStream, ObjectStoreError> {
        let bytes = self.get(key).await?;
        Ok(Box::new(Cursor::new(bytes)))
    }

    async fn delete(&self, key: &str) -> Result<(), ObjectStoreError> {
        self.objects.lock().unwrap().remove(key);
        Ok(())
    }
}

/// Filesystem-backed object store rooted at a directory.
#[derive(Debug)]
pub struct FsObjectStore {
    root: PathBuf,
    prefix: String,
}

impl FsObjectStore {
    /// Create a store rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            prefix: String::new(),
        }
    }

    /// Create a store that prefixes every key, e.g. `test-42/`.
    pub fn with_prefix(root: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            prefix: prefix.into(),
        }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, ObjectStoreError> {
        if key.split('/').any(|segment| segment == ".." || segment.is_empty()) {
            return Err(ObjectStoreError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(&self, name: &str, bytes: &[u8]) -> Result<String, ObjectStoreError> {
        let key = format!("{}{name}", self.prefix);
        let path = self.path_for(&key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes).await?;
        Ok(key)
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, ObjectStoreError> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(ObjectStoreError::NotFound(key.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn get_stream(&self, key: &str) -> Result<ObjectStream, ObjectStoreError> {
        let path = self.path_for(key)?;
        match tokio::fs::File::open(&path).await {
            Ok(file) => Ok(Box::new(file)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(ObjectStoreError::NotFound(key.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), ObjectStoreError> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn memory_round_trip_is_bit_exact() {
        let store = InMemoryObjectStore::new();
        let bytes: Vec<u8> = (0..=255).collect();

        let key = store.put("blob.bin", &bytes).await.unwrap();
        assert_eq!(store.get(&key).await.unwrap(), bytes);

        let mut streamed = Vec::new();
        let mut stream = store.get_stream(&key).await.unwrap();
        stream.read_to_end(&mut streamed).await.unwrap();
        assert_eq!(streamed, bytes);
    }

    #[tokio::test]
    async fn fs_round_trip_is_bit_exact() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());
        let bytes = "Prix unitaire: 9,99 €".as_bytes().to_vec();

        let key = store.put("csv-files/2024/01/15/a_b.csv", &bytes).await.unwrap();
        assert_eq!(store.get(&key).await.unwrap(), bytes);

        store.delete(&key).await.unwrap();
        assert!(matches!(
            store.get(&key).await,
            Err(ObjectStoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_prefix_is_part_of_the_returned_key() {
        let store = InMemoryObjectStore::with_prefix("test-7/");
        let key = store.put("a.csv", b"x").await.unwrap();
        assert_eq!(key, "test-7/a.csv");
        assert_eq!(store.get(&key).await.unwrap(), b"x");
    }

    #[tokio::test]
    async fn parent_traversal_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());
        assert!(matches!(
            store.get("../escape").await,
            Err(ObjectStoreError::InvalidKey(_))
        ));
    }

    #[test]
    fn attachment_keys_follow_the_layout() {
        use chrono::TimeZone;
        let received = Utc.with_ymd_and_hms(2024, 1, 5, 12, 0, 0).unwrap();
        let key = attachment_key(received, "weird name?.csv");

        assert!(key.starts_with("csv-files/2024/01/05/"));
        assert!(key.ends_with("_weird-name-.csv"));
    }
}
