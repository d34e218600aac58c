//! Persistent storage for the configuration document.
use std::{
    collections::HashMap,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Mutex,
};

/// Byte-store used to persist configuration between process restarts.
///
/// Failures are never fatal to the caller: a failed read is treated as a cache miss and a failed
/// write is logged and ignored.
pub trait ConfigurationCache: Send + Sync {
    /// Return the stored value, or `None` if nothing is stored under `key`.
    fn get(&self, key: &str) -> std::io::Result<Option<String>>;

    #[allow(missing_docs)]
    fn set(&self, key: &str, value: &str) -> std::io::Result<()>;

    /// Remove every stored value.
    fn clear(&self) -> std::io::Result<()>;
}

/// Process-local cache. Survives client rebuilds that share it, not process restarts.
#[derive(Debug, Default)]
pub struct InMemoryConfigurationCache {
    entries: Mutex<HashMap<String, String>>,
}

impl InMemoryConfigurationCache {
    #[allow(missing_docs)]
    pub fn new() -> InMemoryConfigurationCache {
        InMemoryConfigurationCache::default()
    }

    fn entries(&self) -> std::io::Result<std::sync::MutexGuard<'_, HashMap<String, String>>> {
        self.entries
            .lock()
            .map_err(|_| std::io::Error::new(ErrorKind::Other, "cache lock poisoned"))
    }
}

impl ConfigurationCache for InMemoryConfigurationCache {
    fn get(&self, key: &str) -> std::io::Result<Option<String>> {
        Ok(self.entries()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> std::io::Result<()> {
        self.entries()?.insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn clear(&self) -> std::io::Result<()> {
        self.entries()?.clear();
        Ok(())
    }
}

/// Stores one file per key inside `directory`.
#[derive(Debug, Clone)]
pub struct FileConfigurationCache {
    directory: PathBuf,
}

impl FileConfigurationCache {
    /// The directory is created on first write.
    pub fn new(directory: impl Into<PathBuf>) -> FileConfigurationCache {
        FileConfigurationCache {
            directory: directory.into(),
        }
    }

    #[allow(missing_docs)]
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn path(&self, key: &str) -> PathBuf {
        // Keys are fixed identifiers, but keep them from escaping the directory anyway.
        let file_name: String = key
            .chars()
            .map(|c| match c {
                'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '-' | '_' => c,
                _ => '_',
            })
            .collect();
        self.directory.join(format!("{file_name}.json"))
    }
}

impl ConfigurationCache for FileConfigurationCache {
    fn get(&self, key: &str) -> std::io::Result<Option<String>> {
        match std::fs::read_to_string(self.path(key)) {
            Ok(value) => Ok(Some(value)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn set(&self, key: &str, value: &str) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.directory)?;

        // Write to a temporary file first so readers never observe a half-written document.
        let path = self.path(key);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, value)?;
        std::fs::rename(&tmp, &path)
    }

    fn clear(&self) -> std::io::Result<()> {
        match std::fs::remove_dir_all(&self.directory) {
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            result => result,
        }
    }
}
