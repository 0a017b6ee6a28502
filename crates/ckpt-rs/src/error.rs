//! Error types for the ckpt-rs library.
//!
//! All fallible operations return a [`Result<T>`], an alias for
//! `Result<T, CheckpointError>`.
//!
//! # Error Categories
//!
//! - **Archive errors**: [`NotRegularFile`], [`ArchiveOpen`],
//!   [`MissingCheckpointMarker`], [`UnsupportedCompression`], [`Extraction`]
//! - **Metadata documents**: [`ConfigDump`], [`SpecDump`], [`CriOMetadata`],
//!   [`NetworkStatus`], [`StatusFile`]
//! - **Process tree**: [`PidNotFound`], [`MemoryRead`], [`Explorer`]
//! - **Comparison**: [`IdentityMismatch`]
//! - **Archive rewriting**: [`PortMapping`], [`EntryNotFound`]
//! - **System errors**: [`Io`], [`JsonParse`], [`Config`]
//!
//! None of these are retried; they carry enough context (archive path,
//! document name, PID) for the caller to report them.
//!
//! [`NotRegularFile`]: CheckpointError::NotRegularFile
//! [`ArchiveOpen`]: CheckpointError::ArchiveOpen
//! [`MissingCheckpointMarker`]: CheckpointError::MissingCheckpointMarker
//! [`UnsupportedCompression`]: CheckpointError::UnsupportedCompression
//! [`Extraction`]: CheckpointError::Extraction
//! [`ConfigDump`]: CheckpointError::ConfigDump
//! [`SpecDump`]: CheckpointError::SpecDump
//! [`CriOMetadata`]: CheckpointError::CriOMetadata
//! [`NetworkStatus`]: CheckpointError::NetworkStatus
//! [`StatusFile`]: CheckpointError::StatusFile
//! [`PidNotFound`]: CheckpointError::PidNotFound
//! [`MemoryRead`]: CheckpointError::MemoryRead
//! [`Explorer`]: CheckpointError::Explorer
//! [`IdentityMismatch`]: CheckpointError::IdentityMismatch
//! [`PortMapping`]: CheckpointError::PortMapping
//! [`EntryNotFound`]: CheckpointError::EntryNotFound
//! [`Io`]: CheckpointError::Io
//! [`JsonParse`]: CheckpointError::JsonParse
//! [`Config`]: CheckpointError::Config

use std::path::PathBuf;

/// Result type alias for operations that may return a CheckpointError.
pub type Result<T> = std::result::Result<T, CheckpointError>;

/// Why one of the JSON metadata documents could not be used.
#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    /// The document is not present in the extracted checkpoint.
    #[error("file is missing")]
    Missing,

    /// The document exists but could not be read.
    #[error("read failed: {0}")]
    Unreadable(#[source] std::io::Error),

    /// The document is truncated or is not the expected JSON shape.
    #[error("malformed JSON: {0}")]
    Malformed(#[source] serde_json::Error),
}

impl DocumentError {
    /// Returns true if the document was simply absent.
    pub fn is_missing(&self) -> bool {
        matches!(self, DocumentError::Missing)
    }
}

/// Error types for checkpoint operations.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    /// The input path exists but is not a regular file.
    #[error("input {0} is not a regular file")]
    NotRegularFile(PathBuf),

    /// The archive could not be opened.
    #[error("failed to open {path}: {source}")]
    ArchiveOpen {
        /// Archive path given by the caller.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },

    /// The archive has no top-level `checkpoint/` directory.
    #[error("checkpoint directory is missing in the archive file: {0}")]
    MissingCheckpointMarker(PathBuf),

    /// The archive stream uses a compression format we cannot decode.
    #[error("unsupported compression {format} in {path}")]
    UnsupportedCompression {
        /// Archive being read.
        path: PathBuf,
        /// Detected format name.
        format: &'static str,
    },

    /// Reading the tar stream or writing an extracted entry failed.
    #[error("unpacking of checkpoint archive {path} failed: {source}")]
    Extraction {
        /// Archive being read.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },

    /// The container-config dump (`config.dump`) is unusable.
    #[error("config dump {path}: {source}")]
    ConfigDump {
        /// Location the document was expected at.
        path: PathBuf,
        /// What went wrong.
        #[source]
        source: DocumentError,
    },

    /// The process-spec dump (`spec.dump`) is unusable.
    #[error("spec dump {path}: {source}")]
    SpecDump {
        /// Location the document was expected at.
        path: PathBuf,
        /// What went wrong.
        #[source]
        source: DocumentError,
    },

    /// The CRI-O metadata annotation holds malformed nested JSON.
    #[error("failed to read io.kubernetes.cri-o.Metadata: {0}")]
    CriOMetadata(#[source] serde_json::Error),

    /// The Podman network status document is malformed.
    #[error("failed to parse network status: {0}")]
    NetworkStatus(#[source] serde_json::Error),

    /// The containerd status file is present but malformed.
    #[error("failed to parse status file {path}: {source}")]
    StatusFile {
        /// Location of the status file.
        path: PathBuf,
        /// Parse failure.
        #[source]
        source: serde_json::Error,
    },

    /// The requested PID does not exist in the process tree.
    #[error("no process with PID {0} (use `inspect --ps-tree` to view all PIDs)")]
    PidNotFound(u32),

    /// Reading the command line or environment of a process failed.
    #[error("failed to read {region} of process {pid}: {reason}")]
    MemoryRead {
        /// Process whose memory was read.
        pid: u32,
        /// Which region (`cmdline` or `environment`).
        region: &'static str,
        /// Reason reported by the explorer.
        reason: String,
    },

    /// The checkpoint image explorer failed.
    #[error("checkpoint exploration failed: {0}")]
    Explorer(String),

    /// Two snapshots belong to different containers.
    #[error(
        "checkpoints are from different containers:\n  A: {name_a} ({id_a})\n  B: {name_b} ({id_b})"
    )]
    IdentityMismatch {
        /// Name of the first container.
        name_a: String,
        /// ID of the first container.
        id_a: String,
        /// Name of the second container.
        name_b: String,
        /// ID of the second container.
        id_b: String,
    },

    /// A `old:new` port mapping could not be parsed.
    #[error("invalid port mapping {0:?}: expected old_port:new_port")]
    PortMapping(String),

    /// The archive has no entry of the given name.
    #[error("{path} has no entry {name}")]
    EntryNotFound {
        /// Archive being rewritten.
        path: PathBuf,
        /// Entry that was looked for.
        name: String,
    },

    /// I/O error occurred during file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error occurred.
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    /// Configuration file could not be parsed.
    #[error("invalid configuration {path}: {source}")]
    Config {
        /// Configuration file.
        path: PathBuf,
        /// Parse failure.
        #[source]
        source: toml::de::Error,
    },
}

impl CheckpointError {
    pub(crate) fn extraction(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CheckpointError::Extraction {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn memory_read(pid: u32, region: &'static str, err: impl std::fmt::Display) -> Self {
        CheckpointError::MemoryRead {
            pid,
            region,
            reason: err.to_string(),
        }
    }
}
