//! Symlink operations

use std::path::{Path, PathBuf};

use tokio::fs;

use crate::errors::DeploydError;
use crate::filesys::file::temp_sibling;

/// A symlink wrapper with path
#[derive(Debug, Clone)]
pub struct Link {
    path: PathBuf,
}

impl Link {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current target, or `None` when no link exists yet
    pub async fn target(&self) -> Result<Option<PathBuf>, DeploydError> {
        match fs::read_link(&self.path).await {
            Ok(target) => Ok(Some(target)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Point the link at `target` in one step.
    ///
    /// A temporary link is created beside the final path and renamed over
    /// it, so readers always resolve either the old or the new target.
    pub async fn switch_to(&self, target: &Path) -> Result<(), DeploydError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let temp_path = temp_sibling(&self.path);
        fs::symlink(target, &temp_path).await?;

        if let Err(e) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Put the link back the way it was: retarget it, or remove it when
    /// there was no link before.
    pub async fn restore(&self, previous: Option<&Path>) -> Result<(), DeploydError> {
        match previous {
            Some(target) => self.switch_to(target).await,
            None => match fs::remove_file(&self.path).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            },
        }
    }
}
