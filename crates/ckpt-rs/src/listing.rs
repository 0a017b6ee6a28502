//! Finding checkpoint archives on disk.
//!
//! The kubelet writes checkpoints as `checkpoint-<pod>_<namespace>-<container>-<time>.tar`
//! into [`DEFAULT_CHECKPOINT_DIR`]. [`find_checkpoints`] collects such
//! archives from a directory and [`read_listing`] reads the few metadata
//! documents needed to describe one of them.

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::Result;
use crate::metadata::STATUS_FILE;
use crate::snapshot::{ContainerSnapshot, Engine, snapshot_for_task};
use crate::task::{ExtractionTask, RequiredFiles};

/// Where the kubelet stores checkpoint archives.
pub const DEFAULT_CHECKPOINT_DIR: &str = "/var/lib/kubelet/checkpoints";

/// File name prefix of checkpoint archives.
pub const ARCHIVE_PREFIX: &str = "checkpoint-";

/// Summary of one archive found by [`find_checkpoints`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListedCheckpoint {
    pub archive: PathBuf,
    pub namespace: String,
    pub pod: String,
    pub container: String,
    pub engine: Engine,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpointed: Option<String>,
}

impl ListedCheckpoint {
    pub fn new(archive: impl Into<PathBuf>, snapshot: &ContainerSnapshot) -> Self {
        Self {
            archive: archive.into(),
            namespace: snapshot.namespace.clone(),
            pod: snapshot.pod.clone(),
            container: snapshot.name.clone(),
            engine: snapshot.engine,
            checkpointed: snapshot.checkpointed.clone(),
        }
    }

    /// File name of the archive.
    pub fn file_name(&self) -> String {
        self.archive
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Regular files named `checkpoint-*` directly inside `dir`, sorted by name.
///
/// A directory that does not exist holds no checkpoints.
pub fn find_checkpoints(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(dir = %dir.display(), "checkpoint directory does not exist");
            return Ok(Vec::new());
        }
        Err(e) => return Err(e.into()),
    };

    let mut archives = Vec::new();
    for entry in entries {
        let entry = entry?;
        if entry.file_name().to_string_lossy().starts_with(ARCHIVE_PREFIX)
            && entry.file_type()?.is_file()
        {
            archives.push(entry.path());
        }
    }
    archives.sort();
    Ok(archives)
}

/// Describe the archive at `archive` from its metadata documents.
pub fn read_listing(archive: &Path, scratch_parent: Option<&Path>) -> Result<ListedCheckpoint> {
    let mut required = RequiredFiles::metadata();
    required.push(STATUS_FILE);
    let task = ExtractionTask::create(archive, &required, scratch_parent)?;
    let snapshot = snapshot_for_task(&task)?;
    Ok(ListedCheckpoint::new(archive, &snapshot))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_find_checkpoints() {
        let dir = TempDir::new().unwrap();
        for name in [
            "checkpoint-web_default-nginx-2024-03-01T10:00:00Z.tar",
            "checkpoint-db_default-redis-2024-03-01T09:00:00Z.tar",
            "notes.txt",
        ] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        std::fs::create_dir(dir.path().join("checkpoint-dir")).unwrap();

        let found: Vec<String> = find_checkpoints(dir.path())
            .unwrap()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            found,
            [
                "checkpoint-db_default-redis-2024-03-01T09:00:00Z.tar",
                "checkpoint-web_default-nginx-2024-03-01T10:00:00Z.tar",
            ]
        );
    }

    #[test]
    fn test_missing_directory_is_empty() {
        let dir = TempDir::new().unwrap();
        assert!(find_checkpoints(&dir.path().join("nope")).unwrap().is_empty());
    }

    #[test]
    fn test_unreadable_archive_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("checkpoint-broken.tar");
        std::fs::write(&path, b"not a tar archive at all").unwrap();
        assert!(read_listing(&path, Some(dir.path())).is_err());
    }
}
