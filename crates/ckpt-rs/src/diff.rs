//! Comparison of two checkpoints of the same container.
//!
//! [`diff`] flattens both process trees into PID keyed maps and classifies
//! every entry as added, removed, modified or unchanged. Open files are keyed
//! by `(pid, descriptor, path)` and sockets by `(pid, protocol, local,
//! remote)`; neither has a modified category. The memory delta is signed.
//!
//! Processes are matched by PID alone. A PID reused by an unrelated process
//! between the two checkpoints shows up as modified (or unchanged), not as a
//! removal plus an addition.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;

use serde::Serialize;

use crate::error::{CheckpointError, Result};
use crate::snapshot::ContainerSnapshot;
use crate::tree::{EnvVar, ProcessNode};

/// Which aspects to compare.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiffOptions {
    /// A changed command line marks a process as modified.
    pub track_cmdline: bool,
    /// Carry environments in the process entries.
    pub track_env: bool,
    /// Compare open files.
    pub track_files: bool,
    /// Compare open sockets.
    pub track_sockets: bool,
}

/// Per-checkpoint facts shown next to the diff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckpointInfo {
    pub created: String,
    pub total_size: u64,
}

impl From<&ContainerSnapshot> for CheckpointInfo {
    fn from(snapshot: &ContainerSnapshot) -> Self {
        Self {
            created: snapshot.created.clone(),
            total_size: snapshot.sizes.checkpoint_size,
        }
    }
}

/// A process as listed in a diff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessInfo {
    pub pid: u32,
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cmdline: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment: Option<Vec<EnvVar>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProcessChanges {
    pub added: Vec<ProcessInfo>,
    pub removed: Vec<ProcessInfo>,
    pub modified: Vec<ProcessInfo>,
    pub unchanged: usize,
}

/// An open file as listed in a diff.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct FileInfo {
    pub pid: u32,
    /// Descriptor label, e.g. `REG 3`.
    pub fd: String,
    pub path: String,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FileChanges {
    pub added: Vec<FileInfo>,
    pub removed: Vec<FileInfo>,
    pub unchanged: usize,
}

/// An open socket as listed in a diff.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct SocketInfo {
    pub pid: u32,
    /// Display protocol, e.g. `TCP (LISTEN)` or `UNIX (STREAM)`.
    pub protocol: String,
    pub local: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub remote: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SocketChanges {
    pub added: Vec<SocketInfo>,
    pub removed: Vec<SocketInfo>,
    pub unchanged: usize,
}

/// Change in memory page size from A to B.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct MemoryChanges {
    /// Positive when B uses more memory.
    pub size_change_bytes: i64,
    pub size_change_mb: f64,
}

impl MemoryChanges {
    fn between(a: u64, b: u64) -> Self {
        // Two's complement difference; exact for any realistic page size.
        let bytes = b.wrapping_sub(a) as i64;
        Self {
            size_change_bytes: bytes,
            size_change_mb: bytes as f64 / 1024.0 / 1024.0,
        }
    }
}

/// Result of comparing two checkpoints.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiffReport {
    pub container_id: String,
    pub container_name: String,
    pub image: String,
    pub checkpoint_a: CheckpointInfo,
    pub checkpoint_b: CheckpointInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process_changes: Option<ProcessChanges>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_changes: Option<FileChanges>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub socket_changes: Option<SocketChanges>,
    pub memory_changes: MemoryChanges,
    pub summary: String,
}

/// Compare checkpoint `a` with checkpoint `b`.
///
/// Fails with [`CheckpointError::IdentityMismatch`] if the snapshots belong
/// to different containers. Process changes are computed when both trees
/// are given; file and socket changes when requested in `opts`.
pub fn diff(
    a: &ContainerSnapshot,
    tree_a: Option<&ProcessNode>,
    b: &ContainerSnapshot,
    tree_b: Option<&ProcessNode>,
    opts: &DiffOptions,
) -> Result<DiffReport> {
    if a.container_id != b.container_id {
        return Err(CheckpointError::IdentityMismatch {
            name_a: a.name.clone(),
            id_a: a.container_id.clone(),
            name_b: b.name.clone(),
            id_b: b.container_id.clone(),
        });
    }

    let process_changes = match (tree_a, tree_b) {
        (Some(ta), Some(tb)) => Some(compare_processes(ta, tb, opts)),
        _ => None,
    };
    let file_changes = opts
        .track_files
        .then(|| compare_files(tree_a, tree_b));
    let socket_changes = opts
        .track_sockets
        .then(|| compare_sockets(tree_a, tree_b));
    let memory_changes =
        MemoryChanges::between(a.sizes.memory_pages_size, b.sizes.memory_pages_size);

    let mut report = DiffReport {
        container_id: a.container_id.clone(),
        container_name: a.name.clone(),
        image: a.image.clone(),
        checkpoint_a: a.into(),
        checkpoint_b: b.into(),
        process_changes,
        file_changes,
        socket_changes,
        memory_changes,
        summary: String::new(),
    };
    report.summary = report.render_summary();
    tracing::debug!(container = %report.container_id, "computed checkpoint diff");
    Ok(report)
}

impl DiffReport {
    /// Short digest derived from the counts of the report.
    pub fn render_summary(&self) -> String {
        let mut summary = format!("Checkpoint comparison for container {}", self.container_name);

        if let Some(p) = &self.process_changes
            && (!p.added.is_empty() || !p.removed.is_empty() || !p.modified.is_empty())
        {
            let _ = write!(
                summary,
                "\nProcesses: +{} -{} ~{}",
                p.added.len(),
                p.removed.len(),
                p.modified.len()
            );
        }
        if let Some(f) = &self.file_changes
            && (!f.added.is_empty() || !f.removed.is_empty())
        {
            let _ = write!(summary, "\nFiles: +{} -{}", f.added.len(), f.removed.len());
        }
        if let Some(s) = &self.socket_changes
            && (!s.added.is_empty() || !s.removed.is_empty())
        {
            let _ = write!(summary, "\nSockets: +{} -{}", s.added.len(), s.removed.len());
        }
        if self.memory_changes.size_change_bytes != 0 {
            let _ = write!(
                summary,
                "\nMemory: {:+.2} MB",
                self.memory_changes.size_change_mb
            );
        }
        summary
    }
}

fn process_info(node: &ProcessNode, opts: &DiffOptions) -> ProcessInfo {
    ProcessInfo {
        pid: node.pid,
        command: node.command.clone(),
        cmdline: if opts.track_cmdline {
            node.command_line.clone()
        } else {
            None
        },
        environment: if opts.track_env {
            node.environment.clone()
        } else {
            None
        },
    }
}

fn compare_processes(a: &ProcessNode, b: &ProcessNode, opts: &DiffOptions) -> ProcessChanges {
    let map_a: BTreeMap<u32, &ProcessNode> = a.iter().map(|n| (n.pid, n)).collect();
    let map_b: BTreeMap<u32, &ProcessNode> = b.iter().map(|n| (n.pid, n)).collect();
    let mut changes = ProcessChanges::default();

    for (pid, node_b) in &map_b {
        match map_a.get(pid) {
            None => changes.added.push(process_info(node_b, opts)),
            Some(node_a) if opts.track_cmdline && node_a.command_line != node_b.command_line => {
                changes.modified.push(process_info(node_b, opts))
            }
            Some(_) => changes.unchanged += 1,
        }
    }
    for (pid, node_a) in &map_a {
        if !map_b.contains_key(pid) {
            changes.removed.push(process_info(node_a, opts));
        }
    }
    changes
}

fn open_files(tree: Option<&ProcessNode>) -> BTreeSet<(u32, String, String, String)> {
    tree.into_iter()
        .flat_map(|root| root.iter())
        .flat_map(|node| {
            node.open_files
                .iter()
                .map(move |f| (node.pid, f.path.clone(), f.fd.clone(), f.kind.clone()))
        })
        .collect()
}

fn compare_files(a: Option<&ProcessNode>, b: Option<&ProcessNode>) -> FileChanges {
    // Ordered by (pid, path, fd), which is also the output order.
    let files_a = open_files(a);
    let files_b = open_files(b);
    let key = |f: &(u32, String, String, String)| (f.0, f.1.clone(), f.2.clone());
    let keys_a: BTreeSet<_> = files_a.iter().map(key).collect();
    let keys_b: BTreeSet<_> = files_b.iter().map(key).collect();

    let info = |(pid, path, fd, kind): &(u32, String, String, String)| FileInfo {
        pid: *pid,
        fd: fd.clone(),
        path: path.clone(),
        kind: kind.clone(),
    };

    let mut changes = FileChanges::default();
    for file in &files_b {
        if keys_a.contains(&key(file)) {
            changes.unchanged += 1;
        } else {
            changes.added.push(info(file));
        }
    }
    for file in &files_a {
        if !keys_b.contains(&key(file)) {
            changes.removed.push(info(file));
        }
    }
    changes
}

fn open_sockets(tree: Option<&ProcessNode>) -> BTreeSet<(u32, String, String, String)> {
    tree.into_iter()
        .flat_map(|root| root.iter())
        .flat_map(|node| {
            node.open_sockets.iter().map(move |s| {
                (
                    node.pid,
                    s.label(),
                    s.local_endpoint(),
                    s.remote_endpoint(),
                )
            })
        })
        .collect()
}

fn compare_sockets(a: Option<&ProcessNode>, b: Option<&ProcessNode>) -> SocketChanges {
    let sockets_a = open_sockets(a);
    let sockets_b = open_sockets(b);
    let info = |(pid, protocol, local, remote): &(u32, String, String, String)| SocketInfo {
        pid: *pid,
        protocol: protocol.clone(),
        local: local.clone(),
        remote: remote.clone(),
    };

    SocketChanges {
        added: sockets_b.difference(&sockets_a).map(info).collect(),
        removed: sockets_a.difference(&sockets_b).map(info).collect(),
        unchanged: sockets_a.intersection(&sockets_b).count(),
    }
}
