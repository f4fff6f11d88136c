//! File-backed storage: one JSON document per key inside a directory.
//!
//! Several processes may open the same directory; writes go through a
//! temp file and a rename so readers never observe a torn document.

use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::capabilities::kv::{validate_key, KvError, StorageBackend, StorageErrorCode};

const MAX_DOCUMENT_BYTES: u64 = 10 * 1024 * 1024;
const FILE_EXTENSION: &str = "json";

#[derive(Debug, Clone)]
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let encoded: String = url::form_urlencoded::byte_serialize(key.as_bytes()).collect();
        self.root.join(format!("{encoded}.{FILE_EXTENSION}"))
    }
}

fn io_error(context: &str, e: &std::io::Error) -> KvError {
    let code = match e.kind() {
        std::io::ErrorKind::PermissionDenied => StorageErrorCode::PermissionDenied,
        _ => StorageErrorCode::IoError,
    };
    KvError::storage(code, format!("{context}: {e}"))
}

fn parse_document(key: Option<&str>, bytes: &[u8]) -> Result<Value, KvError> {
    serde_json::from_slice(bytes).map_err(|e| KvError::Serialization {
        message: e.to_string(),
        key: key.map(str::to_string),
    })
}

#[async_trait]
impl StorageBackend for FileStorage {
    async fn init(&self) -> Result<(), KvError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| io_error("create storage directory", &e))?;
        debug!(root = %self.root.display(), "file storage ready");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Value>, KvError> {
        validate_key(key)?;
        let path = self.path_for(key);
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                if bytes.len() as u64 > MAX_DOCUMENT_BYTES {
                    return Err(KvError::storage(
                        StorageErrorCode::Corrupted,
                        format!("document for {key} exceeds {MAX_DOCUMENT_BYTES} bytes"),
                    ));
                }
                parse_document(Some(key), &bytes).map(Some)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error("read", &e)),
        }
    }

    async fn set(&self, key: &str, value: &Value) -> Result<(), KvError> {
        validate_key(key)?;
        let bytes = serde_json::to_vec(value).map_err(|e| KvError::Serialization {
            message: e.to_string(),
            key: Some(key.to_string()),
        })?;
        if bytes.len() as u64 > MAX_DOCUMENT_BYTES {
            return Err(KvError::QuotaExceeded {
                used: bytes.len() as u64,
                limit: MAX_DOCUMENT_BYTES,
            });
        }

        let path = self.path_for(key);
        // unique temp name so concurrent writers never share a temp file
        let tmp_path = path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4().simple()));

        tokio::fs::write(&tmp_path, &bytes)
            .await
            .map_err(|e| io_error("write temp file", &e))?;
        if let Err(e) = tokio::fs::rename(&tmp_path, &path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(io_error("rename", &e));
        }
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), KvError> {
        validate_key(key)?;
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error("remove", &e)),
        }
    }

    async fn list_all(&self) -> Result<Vec<Value>, KvError> {
        let mut dir = match tokio::fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error("list", &e)),
        };

        let mut values = Vec::new();
        while let Some(item) = dir.next_entry().await.map_err(|e| io_error("list", &e))? {
            let path = item.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(FILE_EXTENSION) {
                continue;
            }
            match tokio::fs::read(&path).await {
                Ok(bytes) => match parse_document(None, &bytes) {
                    Ok(value) => values.push(value),
                    Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable document"),
                },
                // removed between listing and reading
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(io_error("read", &e)),
            }
        }
        Ok(values)
    }
}
