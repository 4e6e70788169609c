//! Hand-off of the last created instance id between invocations.
//!
//! `up` and the follow-up commands (`wait`, `logs`, `down`) run as separate
//! processes, so the id lives in a one-line file per provider.

use std::path::{Path, PathBuf};

use crate::error::PodliftError;
use crate::util::atomic_write;

#[derive(Debug, Clone)]
pub struct Marker {
    path: PathBuf,
}

impl Marker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the recorded id. A missing or blank file means nothing is recorded.
    pub fn read(&self) -> Result<Option<String>, PodliftError> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) => {
                let id = contents.lines().next().unwrap_or("").trim();
                Ok((!id.is_empty()).then(|| id.to_string()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(PodliftError::Io {
                context: format!("reading {}", self.path.display()),
                source: e,
            }),
        }
    }

    /// Overwrite the marker with `id`.
    pub fn write(&self, id: &str) -> Result<(), PodliftError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| PodliftError::Io {
                context: format!("creating {}", parent.display()),
                source: e,
            })?;
        }
        atomic_write(&self.path, format!("{id}\n").as_bytes(), 0o644)?;
        tracing::debug!(id, path = %self.path.display(), "recorded instance id");
        Ok(())
    }

    /// Remove the marker if it still names `id`.
    pub fn clear_if(&self, id: &str) -> Result<(), PodliftError> {
        if self.read()?.as_deref() == Some(id) {
            std::fs::remove_file(&self.path).map_err(|e| PodliftError::Io {
                context: format!("removing {}", self.path.display()),
                source: e,
            })?;
        }
        Ok(())
    }
}
