//! Enriched process trees.
//!
//! [`assemble`] turns the raw tree of a [`CheckpointExplorer`] into a new
//! [`ProcessNode`] tree; [`assemble_tree`] does the same for a raw tree the
//! caller already holds. Command lines and environments are read from process
//! memory on demand; open files and sockets are attached by PID. The raw tree
//! is never modified.
//!
//! Dead and zombie tasks appear as leaves. Their memory, files and children
//! are not examined.

use std::collections::HashMap;

use serde::Serialize;

use crate::error::{CheckpointError, Result};
use crate::explorer::{CheckpointExplorer, RawFile, RawPsTree, RawSocket, TaskState};

/// What to collect while assembling a tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TreeOptions {
    /// Only assemble the subtree rooted at this PID.
    pub pid: Option<u32>,
    /// Read command lines from process memory.
    pub cmdline: bool,
    /// Read environment variables from process memory.
    pub env: bool,
    /// Attach open files.
    pub files: bool,
    /// Attach open sockets.
    pub sockets: bool,
}

/// One environment variable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct EnvVar {
    pub key: String,
    pub value: String,
}

/// An open file of a process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct OpenFile {
    /// File type as reported by CRIU.
    #[serde(rename = "type")]
    pub kind: String,
    /// Descriptor label, e.g. `REG 3` or `cwd`.
    pub fd: String,
    pub path: String,
}

impl From<&RawFile> for OpenFile {
    fn from(raw: &RawFile) -> Self {
        Self {
            kind: raw.kind.clone(),
            fd: format!("{} {}", raw.kind, raw.fd).trim().to_string(),
            path: raw.path.clone(),
        }
    }
}

/// Socket family as far as display is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SocketKind {
    Unix,
    Inet,
    Packet,
    Netlink,
    /// Any other descriptor type an explorer reports as a socket.
    Other,
}

/// An open socket of a process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct OpenSocket {
    pub kind: SocketKind,
    pub protocol: String,
    #[serde(rename = "type", skip_serializing_if = "String::is_empty")]
    pub socket_type: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub state: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub local_addr: String,
    pub local_port: u32,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub remote_addr: String,
    pub remote_port: u32,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub send_buffer: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub recv_buffer: String,
}

impl OpenSocket {
    /// Project a raw socket.
    ///
    /// Descriptor types other than unix, inet, packet and netlink sockets
    /// become [`SocketKind::Other`] and are shown by protocol (or descriptor
    /// type) and buffer sizes.
    pub fn project(raw: &RawSocket) -> Self {
        let base = OpenSocket {
            kind: SocketKind::Unix,
            protocol: raw.protocol.clone(),
            socket_type: String::new(),
            state: String::new(),
            local_addr: String::new(),
            local_port: 0,
            remote_addr: String::new(),
            remote_port: 0,
            send_buffer: raw.send_buf.clone(),
            recv_buffer: raw.recv_buf.clone(),
        };
        match raw.fd_type.as_str() {
            "UNIXSK" => OpenSocket {
                protocol: "UNIX".to_string(),
                socket_type: raw.socket_type.clone(),
                // Abstract sockets have no path.
                local_addr: if raw.src_addr.is_empty() {
                    "@".to_string()
                } else {
                    raw.src_addr.clone()
                },
                send_buffer: String::new(),
                recv_buffer: String::new(),
                ..base
            },
            "INETSK" => OpenSocket {
                kind: SocketKind::Inet,
                socket_type: raw.socket_type.clone(),
                state: raw.state.clone(),
                local_addr: raw.src_addr.clone(),
                local_port: raw.src_port,
                remote_addr: raw.dest_addr.clone(),
                remote_port: raw.dest_port,
                ..base
            },
            "PACKETSK" => OpenSocket {
                kind: SocketKind::Packet,
                ..base
            },
            "NETLINKSK" => OpenSocket {
                kind: SocketKind::Netlink,
                ..base
            },
            _ => OpenSocket {
                kind: SocketKind::Other,
                protocol: if raw.protocol.is_empty() {
                    raw.fd_type.clone()
                } else {
                    raw.protocol.clone()
                },
                ..base
            },
        }
    }

    /// Short name: `UNIX (STREAM)`, `TCP (ESTABLISHED)`, `UDP`, ...
    pub fn label(&self) -> String {
        match self.kind {
            SocketKind::Unix => format!("UNIX ({})", self.socket_type),
            SocketKind::Inet if self.protocol == "TCP" => format!("TCP ({})", self.state),
            _ => self.protocol.clone(),
        }
    }

    /// Addresses and buffer sizes.
    pub fn detail(&self) -> String {
        match self.kind {
            SocketKind::Unix => self.local_addr.clone(),
            SocketKind::Inet => format!(
                "{} -> {} (↑ {} ↓ {})",
                self.local_endpoint(),
                self.remote_endpoint(),
                self.send_buffer,
                self.recv_buffer
            ),
            SocketKind::Packet | SocketKind::Netlink | SocketKind::Other => {
                format!("↑ {} ↓ {}", self.send_buffer, self.recv_buffer)
            }
        }
    }

    /// `addr:port` of the local end (just the address for unix sockets).
    pub fn local_endpoint(&self) -> String {
        match self.kind {
            SocketKind::Inet => format!("{}:{}", self.local_addr, self.local_port),
            _ => self.local_addr.clone(),
        }
    }

    /// `addr:port` of the remote end, empty if there is none.
    pub fn remote_endpoint(&self) -> String {
        match self.kind {
            SocketKind::Inet => format!("{}:{}", self.remote_addr, self.remote_port),
            _ => self.remote_addr.clone(),
        }
    }
}

/// A process in the enriched tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessNode {
    pub pid: u32,
    /// Short command name.
    pub command: String,
    /// Full command line, when requested and non-empty.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_line: Option<String>,
    /// Environment in memory order, when requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment: Option<Vec<EnvVar>>,
    pub state: TaskState,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub open_files: Vec<OpenFile>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub open_sockets: Vec<OpenSocket>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ProcessNode>,
}

impl ProcessNode {
    /// `pid` for alive tasks, `pid (State)` otherwise.
    pub fn label(&self) -> String {
        if self.state.is_alive() {
            self.pid.to_string()
        } else {
            format!("{} ({})", self.pid, self.state)
        }
    }

    /// The command line if known, the short command otherwise.
    pub fn display_command(&self) -> &str {
        self.command_line.as_deref().unwrap_or(&self.command)
    }

    /// Depth-first, pre-order traversal of this subtree.
    pub fn iter(&self) -> impl Iterator<Item = &ProcessNode> {
        let mut stack = vec![self];
        std::iter::from_fn(move || {
            let node = stack.pop()?;
            stack.extend(node.children.iter().rev());
            Some(node)
        })
    }

    /// Number of processes in this subtree.
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    /// A tree always has at least its root.
    pub fn is_empty(&self) -> bool {
        false
    }
}

/// Find `pid` in a raw tree, or fail with a user-facing error.
pub fn locate_pid(tree: &RawPsTree, pid: u32) -> Result<&RawPsTree> {
    tree.find(pid).ok_or(CheckpointError::PidNotFound(pid))
}

/// Build the enriched process tree for one checkpoint.
pub fn assemble<E>(explorer: &E, opts: &TreeOptions) -> Result<ProcessNode>
where
    E: CheckpointExplorer + ?Sized,
{
    let raw = explorer.explore_ps()?;
    assemble_tree(explorer, &raw, opts)
}

/// Build the enriched tree from a raw tree already obtained from `explorer`.
pub fn assemble_tree<E>(explorer: &E, raw: &RawPsTree, opts: &TreeOptions) -> Result<ProcessNode>
where
    E: CheckpointExplorer + ?Sized,
{
    let root = match opts.pid {
        Some(pid) => locate_pid(raw, pid)?,
        None => raw,
    };

    let mut files: HashMap<u32, Vec<OpenFile>> = HashMap::new();
    if opts.files {
        for list in explorer.explore_fds()? {
            files
                .entry(list.pid)
                .or_default()
                .extend(list.files.iter().map(OpenFile::from));
        }
    }

    let mut sockets: HashMap<u32, Vec<OpenSocket>> = HashMap::new();
    if opts.sockets {
        for list in explorer.explore_sockets()? {
            sockets
                .entry(list.pid)
                .or_default()
                .extend(list.sockets.iter().map(OpenSocket::project));
        }
    }

    let assembler = Assembler {
        explorer,
        opts,
        files,
        sockets,
    };
    let tree = assembler.node(root)?;
    tracing::debug!(root = tree.pid, processes = tree.len(), "assembled process tree");
    Ok(tree)
}

struct Assembler<'a, E: ?Sized> {
    explorer: &'a E,
    opts: &'a TreeOptions,
    files: HashMap<u32, Vec<OpenFile>>,
    sockets: HashMap<u32, Vec<OpenSocket>>,
}

impl<E: CheckpointExplorer + ?Sized> Assembler<'_, E> {
    fn node(&self, raw: &RawPsTree) -> Result<ProcessNode> {
        let mut node = ProcessNode {
            pid: raw.pid,
            command: raw.comm.clone(),
            command_line: None,
            environment: None,
            state: raw.task_state,
            open_files: Vec::new(),
            open_sockets: Vec::new(),
            children: Vec::new(),
        };
        if !raw.task_state.is_alive_or_stopped() {
            return Ok(node);
        }

        if self.opts.cmdline {
            let buf = self
                .explorer
                .ps_args(raw.pid)
                .map_err(|e| as_memory_error(raw.pid, "cmdline", e))?;
            node.command_line = Some(parse_cmdline(&buf)).filter(|c| !c.is_empty());
        }
        if self.opts.env {
            let buf = self
                .explorer
                .ps_env(raw.pid)
                .map_err(|e| as_memory_error(raw.pid, "environment", e))?;
            node.environment = Some(parse_environment(&buf));
        }
        if let Some(files) = self.files.get(&raw.pid) {
            node.open_files = files.clone();
        }
        if let Some(sockets) = self.sockets.get(&raw.pid) {
            node.open_sockets = sockets.clone();
        }

        node.children = raw
            .children
            .iter()
            .map(|child| self.node(child))
            .collect::<Result<_>>()?;
        Ok(node)
    }
}

fn as_memory_error(pid: u32, region: &'static str, err: CheckpointError) -> CheckpointError {
    match err {
        CheckpointError::MemoryRead { .. } => err,
        other => CheckpointError::memory_read(pid, region, other),
    }
}

/// Join a NUL separated argument vector with spaces.
pub fn parse_cmdline(buf: &[u8]) -> String {
    let end = buf.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
    buf[..end]
        .split(|&b| b == 0)
        .map(String::from_utf8_lossy)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Split a NUL separated environment block into `KEY=VALUE` pairs.
///
/// Programs may put anything into their environment block. An entry without
/// `=` is kept whole as a key with an empty value.
pub fn parse_environment(buf: &[u8]) -> Vec<EnvVar> {
    buf.split(|&b| b == 0)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let entry = String::from_utf8_lossy(entry);
            let (key, value) = entry.split_once('=').unwrap_or((&entry, ""));
            EnvVar {
                key: key.to_string(),
                value: value.to_string(),
            }
        })
        .collect()
}
