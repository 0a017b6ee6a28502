#![forbid(unsafe_code)]
//! Inspection and comparison of container checkpoint archives.
//!
//! Podman, CRI-O and containerd can checkpoint a running container into a
//! tar archive holding CRIU images plus a few JSON documents describing the
//! container. This library reads such archives without unpacking them: only
//! the handful of entries a question needs are extracted into a private
//! scratch directory, and size accounting looks at tar headers alone.
//!
//! # Overview
//!
//! - [`ArchiveReader`] streams a (gzip, zstd or plain) tar archive, checks for
//!   entries, computes [`ArchiveSizes`] and extracts entries selectively
//! - [`ExtractionTask`] ties one archive to a scratch directory that is
//!   removed when the task is dropped
//! - [`load_snapshot`] reconciles the metadata conventions of the three
//!   engines into one [`ContainerSnapshot`]
//! - [`assemble`] builds an enriched [`ProcessNode`] tree from the results of
//!   a [`CheckpointExplorer`]
//! - [`diff`] compares two checkpoints of the same container
//! - [`MemoryReader`] reads process memory back out of the page images
//! - [`find_checkpoints`] lists the archives in a checkpoint directory
//! - [`remap_archive`] rewrites the TCP listen ports stored in an archive
//!
//! # Example
//!
//! ```no_run
//! use ckpt_rs::{ExtractionTask, RequiredFiles, snapshot_for_task};
//!
//! let task = ExtractionTask::create("/tmp/checkpoint.tar.gz", &RequiredFiles::metadata(), None)?;
//! let snapshot = snapshot_for_task(&task)?;
//! println!("{} ({}) checkpointed by {}", snapshot.display_name(), snapshot.container_id, snapshot.engine);
//! # Ok::<(), ckpt_rs::CheckpointError>(())
//! ```
//!
//! # Command-Line Tool
//!
//! The crate includes a `ckpt-rs` binary:
//! ```bash
//! # Summary table of one or more checkpoints
//! ckpt-rs show /tmp/checkpoint.tar.gz
//!
//! # Process tree with command lines, as JSON
//! ckpt-rs inspect --ps-tree-cmd --format json /tmp/checkpoint.tar.gz
//!
//! # What changed between two checkpoints
//! ckpt-rs diff --files before.tar after.tar
//!
//! # Checkpoints in the kubelet checkpoint directory
//! ckpt-rs list
//!
//! # Hexdump of the memory of PID 1
//! ckpt-rs memparse -p 1 /tmp/checkpoint.tar.gz
//!
//! # Restore onto port 80 what listened on 8080
//! ckpt-rs remap --tcp-listen-remap 8080:80 /tmp/checkpoint.tar.gz
//! ```

// Archive access
pub mod archive;
pub mod task;

// Checkpoint metadata
pub mod metadata;
pub mod snapshot;

// Process trees
pub mod crit;
pub mod explorer;
pub mod memory;
pub mod tree;

// Comparison
pub mod diff;

// Archive management
pub mod listing;
pub mod remap;

pub mod config;
pub mod error;

pub use archive::{
    ArchiveEntry, ArchiveReader, ArchiveSizes, Compression, ExtractionStats, format_size,
};
pub use config::{Config, ReportFormat};
pub use crit::{CritExplorer, DumpStatistics};
pub use diff::{
    DiffOptions, DiffReport, FileChanges, FileInfo, MemoryChanges, ProcessChanges, ProcessInfo,
    SocketChanges, SocketInfo, diff,
};
pub use error::{CheckpointError, DocumentError, Result};
pub use explorer::{
    CheckpointExplorer, RawFdList, RawFile, RawPsTree, RawSocket, RawSocketList, TaskState,
};
pub use listing::{ListedCheckpoint, find_checkpoints, read_listing};
pub use memory::{HexDump, MemoryLayout, MemoryReader, Pagemap};
pub use remap::{PortMappings, RemappedPort, parse_port_mappings, remap_archive};
pub use snapshot::{
    ContainerSnapshot, ContainerStatus, Engine, NetworkInfo, load_snapshot, snapshot_for_task,
};
pub use task::{ExtractionTask, InspectOptions, RequiredFiles, create_tasks};
pub use tree::{
    EnvVar, OpenFile, OpenSocket, ProcessNode, SocketKind, TreeOptions, assemble, assemble_tree,
};
