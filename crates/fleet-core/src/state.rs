use crate::model::RunState;
use anyhow::{Context, anyhow};
use fs2::FileExt;
use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::NamedTempFile;
use tracing::debug;

/// Whole-state persistence for run progress. Every `save` replaces what was stored.
pub trait StateStore: Send + Sync {
    fn save(&self, state: &RunState) -> anyhow::Result<()>;

    /// Returns an empty state when nothing was saved yet.
    fn load(&self) -> anyhow::Result<RunState>;
}

/// JSON file store.
///
/// Writes go to a temp file in the target directory and are renamed into place.
/// An in-process mutex and an advisory lock on `<path>.lock` serialize access.
#[derive(Debug)]
pub struct FileStateStore {
    path: PathBuf,
    guard: Mutex<()>,
}

impl FileStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            guard: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn dir(&self) -> PathBuf {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".lock");
        self.dir().join(name)
    }

    fn locked<T>(&self, op: impl FnOnce() -> anyhow::Result<T>) -> anyhow::Result<T> {
        let _guard = self
            .guard
            .lock()
            .map_err(|_| anyhow!("state store mutex poisoned"))?;
        fs::create_dir_all(self.dir()).context("create state directory")?;
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.lock_path())
            .context("open state lock file")?;
        lock.lock_exclusive().context("lock state file")?;
        let result = op();
        let _ = lock.unlock();
        result
    }
}

impl StateStore for FileStateStore {
    fn save(&self, state: &RunState) -> anyhow::Result<()> {
        self.locked(|| {
            let mut tmp = NamedTempFile::new_in(self.dir()).context("create temp state file")?;
            serde_json::to_writer_pretty(&mut tmp, state).context("serialize run state")?;
            tmp.write_all(b"\n").context("write run state")?;
            tmp.as_file().sync_all().context("sync run state")?;
            tmp.persist(&self.path)
                .map_err(|err| err.error)
                .with_context(|| format!("replace state file {}", self.path.display()))?;
            debug!(path = %self.path.display(), items = state.items.len(), "saved run state");
            Ok(())
        })
    }

    fn load(&self) -> anyhow::Result<RunState> {
        self.locked(|| {
            let data = match fs::read_to_string(&self.path) {
                Ok(data) => data,
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    return Ok(RunState::default());
                }
                Err(err) => return Err(err).context("read state file"),
            };
            serde_json::from_str(&data).context("parse state file")
        })
    }
}

/// Guarded in-memory copy, for tests and runs that need no persistence.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    state: Mutex<RunState>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: RunState) -> Self {
        Self {
            state: Mutex::new(state),
        }
    }
}

impl StateStore for MemoryStateStore {
    fn save(&self, state: &RunState) -> anyhow::Result<()> {
        let mut stored = self
            .state
            .lock()
            .map_err(|_| anyhow!("state store mutex poisoned"))?;
        *stored = state.clone();
        Ok(())
    }

    fn load(&self) -> anyhow::Result<RunState> {
        let stored = self
            .state
            .lock()
            .map_err(|_| anyhow!("state store mutex poisoned"))?;
        Ok(stored.clone())
    }
}

/// Store used while resuming: items from the previous run that were filtered
/// out of this run are carried into every save, so finished repos stay `done`.
pub struct ResumeStateStore {
    inner: Arc<dyn StateStore>,
    previous: RunState,
}

impl ResumeStateStore {
    pub fn new(inner: Arc<dyn StateStore>, previous: RunState) -> Self {
        Self { inner, previous }
    }
}

impl StateStore for ResumeStateStore {
    fn save(&self, state: &RunState) -> anyhow::Result<()> {
        let current: HashSet<&Path> = state.items.iter().map(|item| item.path.as_path()).collect();
        let mut merged = state.clone();
        let carried: Vec<_> = self
            .previous
            .items
            .iter()
            .filter(|item| !current.contains(item.path.as_path()))
            .cloned()
            .collect();
        merged.items.splice(0..0, carried);
        self.inner.save(&merged)
    }

    fn load(&self) -> anyhow::Result<RunState> {
        self.inner.load()
    }
}
