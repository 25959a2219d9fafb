use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::{KeyValueStore, StorageError, StorageResult};

/// Directory-backed store. Each key maps to `<dir>/<key>.json`, with `:`
/// written as `%3A`. `%` is never a valid key character, so distinct keys
/// always map to distinct files.
///
/// Writes go to a temporary sibling which is fsynced and then renamed over
/// the target, so an interrupted write leaves the previous value intact.
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn open(dir: impl Into<PathBuf>) -> StorageResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> StorageResult<PathBuf> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | ':'));
        if !valid || key.starts_with('.') {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        // ':' is not portable in file names
        Ok(self.dir.join(format!("{}.json", key.replace(':', "%3A"))))
    }

    /// Persist the rename itself.
    #[cfg(unix)]
    fn sync_dir(&self) -> StorageResult<()> {
        File::open(&self.dir)?.sync_all()?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn sync_dir(&self) -> StorageResult<()> {
        Ok(())
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> StorageResult<Option<String>> {
        let path = self.path_for(key)?;
        match fs::read_to_string(&path) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, key: &str, value: &str) -> StorageResult<()> {
        let path = self.path_for(key)?;
        let tmp_path = path.with_extension("tmp");
        {
            let mut file = File::create(&tmp_path)?;
            file.write_all(value.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &path)?;
        self.sync_dir()?;
        debug!(key, bytes = value.len(), "Stored value");
        Ok(())
    }

    fn remove(&self, key: &str) -> StorageResult<()> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_missing_key_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        assert_eq!(store.get("sync.queue").unwrap(), None);
    }

    #[test]
    fn test_set_replaces_value_and_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();

        store.set("cache:members:c1", "[1]").unwrap();
        store.set("cache:members:c1", "[1,2]").unwrap();

        assert_eq!(store.get("cache:members:c1").unwrap().as_deref(), Some("[1,2]"));
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_values_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        FileStore::open(dir.path()).unwrap().set("sync.last_sync", "\"x\"").unwrap();

        let reopened = FileStore::open(dir.path()).unwrap();
        assert_eq!(reopened.get("sync.last_sync").unwrap().as_deref(), Some("\"x\""));
    }

    #[test]
    fn test_remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        store.set("k", "v").unwrap();
        store.remove("k").unwrap();
        store.remove("k").unwrap();
        assert_eq!(store.get("k").unwrap(), None);
    }

    #[test]
    fn test_rejects_path_like_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        assert!(matches!(store.get("../escape"), Err(StorageError::InvalidKey(_))));
        assert!(matches!(store.set("", "v"), Err(StorageError::InvalidKey(_))));
    }

    #[test]
    fn test_colon_and_underscore_keys_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();

        store.set("a:b", "colon").unwrap();
        store.set("a__b", "underscores").unwrap();
        store.set("a%3Ab", "ignored").unwrap_err();

        assert_eq!(store.get("a:b").unwrap().as_deref(), Some("colon"));
        assert_eq!(store.get("a__b").unwrap().as_deref(), Some("underscores"));
    }
}
