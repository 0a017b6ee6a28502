//! Raw checkpoint image exploration results.
//!
//! Decoding CRIU's protobuf images is the job of an external tool. This
//! module defines the already-parsed shapes such a tool hands back and the
//! [`CheckpointExplorer`] trait the process tree assembler consumes. The one
//! concrete implementation shipped here is [`crate::crit::CritExplorer`].

use std::fmt;

use serde::Serialize;

use crate::error::Result;

/// CRIU task state, from the `tc.task_state` field of a core image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TaskState {
    Alive,
    Dead,
    Stopped,
    Zombie,
    Unknown(u32),
}

impl TaskState {
    /// Map CRIU's numeric task state.
    pub fn from_criu(value: u32) -> Self {
        match value {
            1 => TaskState::Alive,
            2 => TaskState::Dead,
            3 => TaskState::Stopped,
            6 => TaskState::Zombie,
            other => TaskState::Unknown(other),
        }
    }

    /// Whether the task is alive.
    pub fn is_alive(&self) -> bool {
        matches!(self, TaskState::Alive)
    }

    /// Whether the task has memory, files and children worth looking at.
    pub fn is_alive_or_stopped(&self) -> bool {
        matches!(self, TaskState::Alive | TaskState::Stopped)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskState::Alive => f.write_str("Alive"),
            TaskState::Dead => f.write_str("Dead"),
            TaskState::Stopped => f.write_str("Stopped"),
            TaskState::Zombie => f.write_str("Zombie"),
            TaskState::Unknown(n) => write!(f, "Unknown({n})"),
        }
    }
}

/// One node of the raw process tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPsTree {
    pub pid: u32,
    /// Short command name (`comm`).
    pub comm: String,
    pub task_state: TaskState,
    pub children: Vec<RawPsTree>,
}

impl RawPsTree {
    /// Depth-first search for `pid`.
    pub fn find(&self, pid: u32) -> Option<&RawPsTree> {
        if self.pid == pid {
            return Some(self);
        }
        self.children.iter().find_map(|child| child.find(pid))
    }

    /// Number of nodes in this subtree.
    pub fn len(&self) -> usize {
        1 + self.children.iter().map(RawPsTree::len).sum::<usize>()
    }

    /// A tree always has at least its root.
    pub fn is_empty(&self) -> bool {
        false
    }
}

/// Open files of one process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawFdList {
    pub pid: u32,
    pub files: Vec<RawFile>,
}

/// One open file as reported by the explorer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawFile {
    /// File type (`REG`, `PIPE`, ... or `cwd`/`root` for the fs entries).
    pub kind: String,
    /// Descriptor number; empty for `cwd`/`root`.
    pub fd: String,
    pub path: String,
}

/// Open sockets of one process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawSocketList {
    pub pid: u32,
    pub sockets: Vec<RawSocket>,
}

/// One socket as reported by the explorer.
///
/// Which fields are meaningful depends on `fd_type`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawSocket {
    pub fd: String,
    /// `UNIXSK`, `INETSK`, `PACKETSK`, `NETLINKSK`, ...
    pub fd_type: String,
    pub family: String,
    pub protocol: String,
    pub socket_type: String,
    pub state: String,
    pub src_addr: String,
    pub src_port: u32,
    pub dest_addr: String,
    pub dest_port: u32,
    pub send_buf: String,
    pub recv_buf: String,
}

/// Source of parsed checkpoint images for one extracted checkpoint.
pub trait CheckpointExplorer {
    /// The process tree rooted at the container init process.
    fn explore_ps(&self) -> Result<RawPsTree>;

    /// Open files per process.
    fn explore_fds(&self) -> Result<Vec<RawFdList>>;

    /// Open sockets per process.
    fn explore_sockets(&self) -> Result<Vec<RawSocketList>>;

    /// Raw `/proc/<pid>/cmdline` style buffer (NUL separated).
    fn ps_args(&self, pid: u32) -> Result<Vec<u8>>;

    /// Raw `/proc/<pid>/environ` style buffer (NUL separated).
    fn ps_env(&self, pid: u32) -> Result<Vec<u8>>;
}
