use agentflow_core::persist::{PersistError, Result, StateStore};
use agentflow_core::Execution;
use async_trait::async_trait;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const SNAPSHOT_EXTENSION: &str = "json";

/// One JSON snapshot file per execution.
pub struct FileStateStore {
    dir: PathBuf,
}

impl FileStateStore {
    /// Creates a store rooted at `dir`. The directory is created lazily on
    /// the first write; its absence is not an error.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn snapshot_path(&self, execution_id: &str) -> PathBuf {
        self.dir
            .join(format!("{}.{}", execution_id, SNAPSHOT_EXTENSION))
    }

    /// Temp sibling, fsync, rename.
    fn write_atomic(&self, path: &Path, contents: &[u8]) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let tmp_path = path.with_extension("json.tmp");
        {
            let mut tmp = File::create(&tmp_path)?;
            tmp.write_all(contents)?;
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, path)?;
        Ok(())
    }

    fn read_snapshot(&self, path: &Path) -> Result<Execution> {
        let contents = fs::read_to_string(path)?;
        serde_json::from_str(&contents).map_err(|err| PersistError::InvalidSnapshot {
            path: path.display().to_string(),
            reason: err.to_string(),
        })
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn save(&self, execution: &Execution) -> Result<()> {
        let path = self.snapshot_path(&execution.execution_id);
        let contents = serde_json::to_vec_pretty(execution)?;
        self.write_atomic(&path, &contents)?;
        debug!(
            execution_id = %execution.execution_id,
            path = %path.display(),
            "Saved execution snapshot"
        );
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<Execution>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let mut snapshots = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(SNAPSHOT_EXTENSION) {
                continue;
            }
            match self.read_snapshot(&path) {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "Skipping unreadable snapshot");
                }
            }
        }
        Ok(snapshots)
    }

    async fn remove(&self, execution_id: &str) -> Result<()> {
        let path = self.snapshot_path(execution_id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
