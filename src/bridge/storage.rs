//! Extension-local key/value storage and the persistent browser id.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex as StdMutex;

use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

const BROWSER_ID_KEY: &str = "browserId";
const BROWSER_ID_LEN: usize = 12;
const ID_ALPHABET: &[u8; 62] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage I/O error for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("storage file {path} is not a JSON object: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// JSON object persisted to a single owner-only file, or kept in memory.
#[derive(Debug)]
pub struct LocalStorage {
    path: Option<PathBuf>,
    values: StdMutex<Map<String, Value>>,
}

impl LocalStorage {
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            path: None,
            values: StdMutex::new(Map::new()),
        }
    }

    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        let values = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|source| StorageError::Json {
                path: path.clone(),
                source,
            })?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Map::new(),
            Err(source) => return Err(StorageError::Io { path, source }),
        };
        Ok(Self {
            path: Some(path),
            values: StdMutex::new(values),
        })
    }

    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<Value> {
        self.values
            .lock()
            .expect("local storage mutex poisoned")
            .get(key)
            .cloned()
    }

    pub fn set(&self, key: &str, value: Value) -> Result<(), StorageError> {
        let mut values = self.values.lock().expect("local storage mutex poisoned");
        values.insert(key.to_string(), value);
        self.persist(&values)
    }

    /// Returns the browser-instance id, generating and saving it on first use.
    pub fn browser_id(&self) -> Result<String, StorageError> {
        let mut values = self.values.lock().expect("local storage mutex poisoned");
        if let Some(Value::String(id)) = values.get(BROWSER_ID_KEY) {
            return Ok(id.clone());
        }
        let id = generate_secure_id(BROWSER_ID_LEN);
        values.insert(BROWSER_ID_KEY.to_string(), Value::from(id.as_str()));
        self.persist(&values)?;
        tracing::info!(browser_id = %id, "generated browser id");
        Ok(id)
    }

    fn persist(&self, values: &Map<String, Value>) -> Result<(), StorageError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| StorageError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let bytes = serde_json::to_vec_pretty(values).map_err(|source| StorageError::Json {
            path: path.clone(),
            source,
        })?;
        let staging = path.with_extension("json.tmp");
        fs::write(&staging, bytes).map_err(|source| StorageError::Io {
            path: staging.clone(),
            source,
        })?;
        set_owner_only_permissions(&staging)?;
        fs::rename(&staging, path).map_err(|source| StorageError::Io {
            path: path.clone(),
            source,
        })
    }
}

/// Random identifier over `[A-Za-z0-9]`.
#[must_use]
pub fn generate_secure_id(len: usize) -> String {
    let mut id = String::with_capacity(len);
    while id.len() < len {
        let bytes = *Uuid::new_v4().as_bytes();
        // Bytes 6 and 8 carry the version and variant bits.
        for (index, byte) in bytes.iter().enumerate() {
            if index == 6 || index == 8 || id.len() == len {
                continue;
            }
            id.push(char::from(ID_ALPHABET[usize::from(*byte) % ID_ALPHABET.len()]));
        }
    }
    id
}

#[cfg(unix)]
fn set_owner_only_permissions(path: &Path) -> Result<(), StorageError> {
    use std::os::unix::fs::PermissionsExt;

    let mut perms = fs::metadata(path)
        .map_err(|source| StorageError::Io {
            path: path.to_path_buf(),
            source,
        })?
        .permissions();
    perms.set_mode(0o600);
    fs::set_permissions(path, perms).map_err(|source| StorageError::Io {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(not(unix))]
fn set_owner_only_permissions(_: &Path) -> Result<(), StorageError> {
    Ok(())
}
