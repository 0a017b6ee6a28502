//! Per-archive extraction tasks.
//!
//! Inspecting a checkpoint never unpacks the whole archive. Instead an
//! [`ExtractionTask`] validates the archive, creates a private scratch
//! directory, and extracts only the entries named by a [`RequiredFiles`] set.
//! The scratch directory is a [`TempDir`] owned by the task, so it is removed
//! when the task is dropped, whether the caller finished normally, returned
//! an error, or unwound.

use std::path::{Path, PathBuf};

use tempfile::TempDir;

use crate::archive::{ArchiveReader, ArchiveSizes, ExtractionStats};
use crate::error::{CheckpointError, Result};
use crate::metadata::{
    CHECKPOINT_DIRECTORY, CONFIG_DUMP_FILE, SPEC_DUMP_FILE, STATS_DUMP_FILE, STATUS_FILE,
};

/// Prefix of scratch directories created by tasks.
pub const SCRATCH_PREFIX: &str = "ckpt-rs";

/// Which parts of a checkpoint the caller wants to look at.
///
/// This only influences which archive entries are extracted; rendering
/// decisions are left to the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InspectOptions {
    /// CRIU dump statistics.
    pub stats: bool,
    /// Process tree.
    pub ps_tree: bool,
    /// Command lines of processes.
    pub ps_tree_cmd: bool,
    /// Environment variables of processes.
    pub ps_tree_env: bool,
    /// Open files.
    pub files: bool,
    /// Open sockets.
    pub sockets: bool,
    /// Restrict output to one PID.
    pub pid_filter: bool,
}

impl InspectOptions {
    /// Everything the inspector knows how to show.
    pub fn all() -> Self {
        Self {
            stats: true,
            ps_tree: true,
            ps_tree_cmd: true,
            ps_tree_env: true,
            files: true,
            sockets: true,
            pid_filter: false,
        }
    }

    /// Whether the process tree images are needed.
    pub fn needs_ps_tree(&self) -> bool {
        self.ps_tree
            || self.ps_tree_cmd
            || self.ps_tree_env
            || self.files
            || self.sockets
            || self.pid_filter
    }
}

/// The set of archive name fragments to extract.
///
/// Names are matched as substrings by [`ArchiveReader::extract`], so
/// `checkpoint/pages-` selects every memory page image.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequiredFiles {
    names: Vec<String>,
}

impl RequiredFiles {
    /// The metadata documents every task needs.
    pub fn metadata() -> Self {
        let mut files = Self::default();
        files.push(SPEC_DUMP_FILE);
        files.push(CONFIG_DUMP_FILE);
        files
    }

    /// Required files for an inspection with the given options.
    pub fn for_inspect(opts: &InspectOptions) -> Self {
        let mut files = Self::metadata();
        files.push(STATUS_FILE);

        if opts.stats {
            files.push(STATS_DUMP_FILE);
        }
        if opts.needs_ps_tree() {
            files.push_checkpoint("pstree.img");
            files.push_checkpoint("core-");
        }
        if opts.ps_tree_cmd || opts.ps_tree_env {
            files.extend(&Self::memory());
        }
        if opts.files {
            files.push_checkpoint("files.img");
            files.push_checkpoint("fs-");
            files.push_checkpoint("ids-");
            files.push_checkpoint("fdinfo-");
        }
        if opts.sockets {
            files.push_checkpoint("files.img");
            files.push_checkpoint("ids-");
            files.push_checkpoint("fdinfo-");
        }
        files
    }

    /// The memory images needed to read command lines and environments.
    pub fn memory() -> Self {
        let mut files = Self::default();
        files.push_checkpoint("pagemap-");
        files.push_checkpoint("pages-");
        files.push_checkpoint("mm-");
        files
    }

    /// Add every name of `other`.
    pub fn extend(&mut self, other: &RequiredFiles) {
        for name in &other.names {
            self.push(name.clone());
        }
    }

    /// Add a name fragment, ignoring duplicates.
    pub fn push(&mut self, name: impl Into<String>) {
        let name = name.into();
        if !self.names.contains(&name) {
            self.names.push(name);
        }
    }

    fn push_checkpoint(&mut self, name: &str) {
        self.push(format!("{CHECKPOINT_DIRECTORY}/{name}"));
    }

    /// The name fragments in insertion order.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Whether `name` is part of the set.
    pub fn contains(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }
}

/// One archive under inspection together with its scratch directory.
#[derive(Debug)]
pub struct ExtractionTask {
    archive: ArchiveReader,
    scratch: TempDir,
    stats: ExtractionStats,
}

impl ExtractionTask {
    /// Validate `archive_path` and extract `required` into a fresh scratch
    /// directory.
    ///
    /// The scratch directory is created below `scratch_parent`, or the
    /// system temporary directory if `None`. The archive must contain a
    /// top-level `checkpoint/` directory; this is checked before anything is
    /// written.
    pub fn create(
        archive_path: impl AsRef<Path>,
        required: &RequiredFiles,
        scratch_parent: Option<&Path>,
    ) -> Result<Self> {
        let archive = ArchiveReader::open(archive_path)?;

        if !archive.has_entry_matching(CHECKPOINT_DIRECTORY, true)? {
            return Err(CheckpointError::MissingCheckpointMarker(
                archive.path().to_path_buf(),
            ));
        }

        let mut builder = tempfile::Builder::new();
        builder.prefix(SCRATCH_PREFIX);
        let scratch = match scratch_parent {
            Some(parent) => builder.tempdir_in(parent)?,
            None => builder.tempdir()?,
        };
        tracing::debug!(
            archive = %archive.path().display(),
            scratch = %scratch.path().display(),
            "created extraction task"
        );

        let stats = archive.extract(scratch.path(), required.names())?;
        Ok(Self {
            archive,
            scratch,
            stats,
        })
    }

    /// The archive this task was created for.
    pub fn archive(&self) -> &ArchiveReader {
        &self.archive
    }

    /// Path of the archive.
    pub fn archive_path(&self) -> &Path {
        self.archive.path()
    }

    /// Scratch directory holding the extracted entries.
    pub fn scratch_dir(&self) -> &Path {
        self.scratch.path()
    }

    /// Extracted `checkpoint/` directory inside the scratch directory.
    pub fn checkpoint_dir(&self) -> PathBuf {
        self.scratch.path().join(CHECKPOINT_DIRECTORY)
    }

    /// Statistics of the initial extraction.
    pub fn stats(&self) -> &ExtractionStats {
        &self.stats
    }

    /// Size breakdown of the archive.
    pub fn sizes(&self) -> Result<ArchiveSizes> {
        self.archive.size_breakdown()
    }

    /// Extract further entries into the same scratch directory.
    ///
    /// Used to defer unpacking memory pages until a PID filter has been
    /// checked against the process tree.
    pub fn extract_more(&mut self, required: &RequiredFiles) -> Result<ExtractionStats> {
        let stats = self.archive.extract(self.scratch.path(), required.names())?;
        self.stats.files_extracted += stats.files_extracted;
        self.stats.directories_created += stats.directories_created;
        self.stats.entries_skipped += stats.entries_skipped;
        self.stats.bytes_written += stats.bytes_written;
        Ok(stats)
    }
}

/// Create one task per archive, strictly in order.
///
/// On failure, tasks created so far are dropped (and their scratch
/// directories removed) before the error is returned.
pub fn create_tasks<P: AsRef<Path>>(
    archives: &[P],
    required: &RequiredFiles,
    scratch_parent: Option<&Path>,
) -> Result<Vec<ExtractionTask>> {
    let mut tasks = Vec::with_capacity(archives.len());
    for path in archives {
        tasks.push(ExtractionTask::create(path, required, scratch_parent)?);
    }
    Ok(tasks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tar::{EntryType, Header};

    fn build_archive(dir: &Path, name: &str, with_checkpoint: bool) -> PathBuf {
        let mut builder = tar::Builder::new(Vec::new());
        let mut add = |path: &str, data: &[u8], ty: EntryType| {
            let mut header = Header::new_gnu();
            header.set_entry_type(ty);
            header.set_mode(0o644);
            header.set_size(data.len() as u64);
            builder.append_data(&mut header, path, data).unwrap();
        };
        if with_checkpoint {
            add("checkpoint", b"", EntryType::Directory);
            add("checkpoint/pstree.img", b"tree", EntryType::Regular);
            add("checkpoint/pages-1.img", &[0u8; 64], EntryType::Regular);
        }
        add("config.dump", br#"{"id":"c1"}"#, EntryType::Regular);
        add("spec.dump", b"{}", EntryType::Regular);
        add("stats-dump", b"stats", EntryType::Regular);
        drop(add);
        let path = dir.join(name);
        std::fs::write(&path, builder.into_inner().unwrap()).unwrap();
        path
    }

    #[test]
    fn test_required_files_metadata_only() {
        let files = RequiredFiles::for_inspect(&InspectOptions::default());
        assert_eq!(files.names(), ["spec.dump", "config.dump", "status"]);
    }

    #[test]
    fn test_required_files_implications() {
        let opts = InspectOptions {
            files: true,
            sockets: true,
            ..Default::default()
        };
        let files = RequiredFiles::for_inspect(&opts);
        assert!(files.contains("checkpoint/pstree.img"));
        assert!(files.contains("checkpoint/core-"));
        assert!(files.contains("checkpoint/fdinfo-"));
        assert!(!files.contains("checkpoint/pages-"));
        let fdinfo = files
            .names()
            .iter()
            .filter(|n| *n == "checkpoint/fdinfo-")
            .count();
        assert_eq!(fdinfo, 1);

        let env = RequiredFiles::for_inspect(&InspectOptions {
            ps_tree_env: true,
            ..Default::default()
        });
        assert!(env.contains("checkpoint/pages-"));
        assert!(env.contains("checkpoint/mm-"));
        assert!(env.contains("checkpoint/pstree.img"));

        let mut merged = RequiredFiles::metadata();
        merged.extend(&RequiredFiles::memory());
        merged.extend(&RequiredFiles::memory());
        assert_eq!(merged.names().len(), 5);
    }

    #[test]
    fn test_create_extracts_requested() {
        let dir = TempDir::new().unwrap();
        let path = build_archive(dir.path(), "a.tar", true);
        let scratch_parent = TempDir::new().unwrap();

        let task = ExtractionTask::create(
            &path,
            &RequiredFiles::metadata(),
            Some(scratch_parent.path()),
        )
        .unwrap();
        assert!(task.scratch_dir().starts_with(scratch_parent.path()));
        assert!(
            task.scratch_dir()
                .file_name()
                .unwrap()
                .to_string_lossy()
                .starts_with(SCRATCH_PREFIX)
        );
        assert!(task.scratch_dir().join("config.dump").exists());
        assert!(task.scratch_dir().join("spec.dump").exists());
        assert!(!task.scratch_dir().join("stats-dump").exists());
        assert!(!task.checkpoint_dir().join("pages-1.img").exists());
        assert_eq!(task.stats().files_extracted, 2);
        assert_eq!(task.sizes().unwrap().memory_pages_size, 64);
    }

    #[test]
    fn test_extract_more_into_same_scratch() {
        let dir = TempDir::new().unwrap();
        let path = build_archive(dir.path(), "a.tar", true);
        let mut task = ExtractionTask::create(&path, &RequiredFiles::metadata(), None).unwrap();

        let stats = task.extract_more(&RequiredFiles::memory()).unwrap();
        assert_eq!(stats.files_extracted, 1);
        assert_eq!(task.stats().files_extracted, 3);
        assert_eq!(
            std::fs::read(task.checkpoint_dir().join("pages-1.img")).unwrap(),
            vec![0u8; 64]
        );
    }

    #[test]
    fn test_scratch_removed_on_drop() {
        let dir = TempDir::new().unwrap();
        let path = build_archive(dir.path(), "a.tar", true);
        let task = ExtractionTask::create(&path, &RequiredFiles::metadata(), None).unwrap();
        let scratch = task.scratch_dir().to_path_buf();
        assert!(scratch.exists());
        drop(task);
        assert!(!scratch.exists());
    }

    #[test]
    fn test_missing_checkpoint_marker() {
        let dir = TempDir::new().unwrap();
        let path = build_archive(dir.path(), "a.tar", false);
        let scratch_parent = TempDir::new().unwrap();
        let err = ExtractionTask::create(
            &path,
            &RequiredFiles::metadata(),
            Some(scratch_parent.path()),
        )
        .unwrap_err();
        assert!(matches!(err, CheckpointError::MissingCheckpointMarker(_)));
        // Nothing was created before the marker check failed.
        assert_eq!(std::fs::read_dir(scratch_parent.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_create_tasks_cleans_up_on_error() {
        let dir = TempDir::new().unwrap();
        let good = build_archive(dir.path(), "good.tar", true);
        let bad = build_archive(dir.path(), "bad.tar", false);
        let scratch_parent = TempDir::new().unwrap();

        let err = create_tasks(
            &[good.clone(), bad],
            &RequiredFiles::metadata(),
            Some(scratch_parent.path()),
        )
        .unwrap_err();
        assert!(matches!(err, CheckpointError::MissingCheckpointMarker(_)));
        assert_eq!(std::fs::read_dir(scratch_parent.path()).unwrap().count(), 0);

        let tasks = create_tasks(
            &[good.clone(), good],
            &RequiredFiles::metadata(),
            Some(scratch_parent.path()),
        )
        .unwrap();
        assert_eq!(tasks.len(), 2);
        assert_ne!(tasks[0].scratch_dir(), tasks[1].scratch_dir());
    }

    #[test]
    fn test_create_rejects_directory() {
        let dir = TempDir::new().unwrap();
        let err = ExtractionTask::create(dir.path(), &RequiredFiles::metadata(), None).unwrap_err();
        assert!(matches!(err, CheckpointError::NotRegularFile(_)));
    }
}
