//! Durable snapshots for the in-memory stores.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use serde_json::Value;

use crate::Result;

/// Sink the in-memory stores write their full state to after each change.
pub trait Persistence: Send + Sync {
    fn save(&self, state: &Value) -> Result<()>;

    /// Returns `None` when nothing has been saved yet.
    fn load(&self) -> Result<Option<Value>>;
}

/// Keeps the state in one JSON file, replaced atomically on every save.
#[derive(Clone, Debug)]
pub struct FilePersistence {
    path: PathBuf,
}

impl FilePersistence {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl Persistence for FilePersistence {
    fn save(&self, state: &Value) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }
        let tmp_path = self.tmp_path();
        let json = serde_json::to_vec_pretty(state)?;
        std::fs::write(&tmp_path, &json)?;
        std::fs::rename(&tmp_path, &self.path)?;
        tracing::trace!(target: "docket::persistence", path = %self.path.display(), bytes = json.len(), "saved snapshot");
        Ok(())
    }

    fn load(&self) -> Result<Option<Value>> {
        let bytes = match std::fs::read(&self.path) {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }
}

/// Optional persistence plus the suspension switch the coordinator flips
/// around a commit.
#[derive(Default)]
pub(crate) struct Mirror {
    persistence: Option<Arc<dyn Persistence>>,
    suspended: AtomicBool,
}

impl Mirror {
    pub(crate) fn new(persistence: Option<Arc<dyn Persistence>>) -> Self {
        Self {
            persistence,
            suspended: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_durable(&self) -> bool {
        self.persistence.is_some()
    }

    pub(crate) fn restore(&self) -> Result<Option<Value>> {
        match &self.persistence {
            Some(persistence) => persistence.load(),
            None => Ok(None),
        }
    }

    pub(crate) fn suspend(&self) {
        self.suspended.store(true, Ordering::Release);
    }

    pub(crate) fn resume(&self) {
        self.suspended.store(false, Ordering::Release);
    }

    pub(crate) fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }

    pub(crate) fn flush<S: Serialize>(&self, state: &S) -> Result<()> {
        match &self.persistence {
            Some(persistence) => persistence.save(&serde_json::to_value(state)?),
            None => Ok(()),
        }
    }

    /// Saves unless suspended.
    pub(crate) fn persist<S: Serialize>(&self, state: &S) -> Result<()> {
        if self.is_suspended() {
            return Ok(());
        }
        self.flush(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let persistence = FilePersistence::new(dir.path().join("state/events.json"));
        persistence
            .save(&json!({"streams": {"orders": []}}))
            .expect("save should succeed");
        let loaded = persistence.load().expect("load should succeed");
        assert_eq!(loaded, Some(json!({"streams": {"orders": []}})));
    }

    #[test]
    fn missing_file_loads_nothing() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let persistence = FilePersistence::new(dir.path().join("absent.json"));
        assert!(persistence.load().expect("load should succeed").is_none());
    }

    #[test]
    fn save_leaves_no_temp_file() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let persistence = FilePersistence::new(dir.path().join("docs.json"));
        persistence.save(&json!({})).expect("save should succeed");
        assert!(dir.path().join("docs.json").exists());
        assert!(!dir.path().join("docs.json.tmp").exists());
    }

    #[test]
    fn suspended_mirror_skips_saves_until_flushed() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let path = dir.path().join("m.json");
        let mirror = Mirror::new(Some(Arc::new(FilePersistence::new(&path))));
        mirror.suspend();
        mirror.persist(&json!({"a": 1})).expect("persist");
        assert!(!path.exists());
        mirror.resume();
        mirror.flush(&json!({"a": 2})).expect("flush");
        assert_eq!(mirror.restore().expect("restore"), Some(json!({"a": 2})));
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let path = dir.path().join("bad.json");
        std::fs::write(&path, b"not json").expect("write corrupt file");
        assert!(FilePersistence::new(path).load().is_err());
    }
}
