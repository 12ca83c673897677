use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HintError {
    #[error("hint store io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("hint store is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Remembers the last level the learner opened.
pub trait LevelHintStore: Send + Sync {
    fn last_opened(&self) -> Result<Option<String>, HintError>;
    fn remember(&self, map_key: &str) -> Result<(), HintError>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HintFile {
    #[serde(default)]
    last_opened_map_key: Option<String>,
}

/// JSON file under the host's state directory.
pub struct FileLevelHintStore {
    path: PathBuf,
}

impl FileLevelHintStore {
    pub const FILE_NAME: &'static str = "level-hint.json";

    pub fn new(path: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self { path: path.into() })
    }

    pub fn in_dir(dir: impl AsRef<Path>) -> Arc<Self> {
        Self::new(dir.as_ref().join(Self::FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> HintError {
        HintError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl LevelHintStore for FileLevelHintStore {
    fn last_opened(&self) -> Result<Option<String>, HintError> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(self.io_error(err)),
        };
        let file: HintFile = serde_json::from_str(&raw)?;
        Ok(file.last_opened_map_key.filter(|key| !key.is_empty()))
    }

    fn remember(&self, map_key: &str) -> Result<(), HintError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|err| self.io_error(err))?;
        }
        let file = HintFile {
            last_opened_map_key: Some(map_key.to_string()),
        };
        let raw = serde_json::to_vec_pretty(&file)?;
        std::fs::write(&self.path, raw).map_err(|err| self.io_error(err))
    }
}

#[derive(Default)]
pub struct InMemoryLevelHintStore {
    last: RwLock<Option<String>>,
}

impl InMemoryLevelHintStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_hint(map_key: &str) -> Arc<Self> {
        Arc::new(Self {
            last: RwLock::new(Some(map_key.to_string())),
        })
    }
}

impl LevelHintStore for InMemoryLevelHintStore {
    fn last_opened(&self) -> Result<Option<String>, HintError> {
        Ok(self.last.read().clone())
    }

    fn remember(&self, map_key: &str) -> Result<(), HintError> {
        *self.last.write() = Some(map_key.to_string());
        Ok(())
    }
}
