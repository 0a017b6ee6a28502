//! [`CheckpointExplorer`] backed by the `crit` tool shipped with CRIU.
//!
//! `crit decode -i <image>` prints an image as JSON and `crit encode` turns
//! such JSON back into an image. The images used here:
//!
//! - `pstree.img` and `core-<pid>.img` for the process hierarchy, command
//!   names and task states
//! - `ids-<pid>.img` (or the `ids` of the core image), `fdinfo-<id>.img`,
//!   `fs-<pid>.img` and `files.img` for open files and sockets
//! - `pagemap-<pid>.img`, `mm-<pid>.img` and the raw `pages-<id>.img` for
//!   process memory
//!
//! Depending on the CRIU version and flags, `crit` prints enum and flag
//! fields either as numbers or as symbolic names, and addresses either as
//! numbers or as hex strings. Both forms are accepted.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};
use std::process::Command;

use serde::de::{self, DeserializeOwned, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::archive::format_size;
use crate::error::{CheckpointError, Result};
use crate::explorer::{
    CheckpointExplorer, RawFdList, RawFile, RawPsTree, RawSocket, RawSocketList, TaskState,
};
use crate::memory::{DEFAULT_PAGE_SIZE, MemoryLayout, MemoryReader, PageRun, Pagemap, Vma};

/// Default name of the CRIU image tool.
pub const DEFAULT_CRIT_BINARY: &str = "crit";

/// Global file table of a checkpoint.
pub const FILES_IMAGE: &str = "files.img";

pub(crate) const FD_TYPES: &[(u64, &str)] = &[
    (1, "REG"),
    (2, "PIPE"),
    (3, "FIFO"),
    (4, "INETSK"),
    (5, "UNIXSK"),
    (6, "EVENTFD"),
    (7, "EVENTPOLL"),
    (8, "INOTIFY"),
    (9, "SIGNALFD"),
    (10, "PACKETSK"),
    (11, "TTY"),
    (12, "FANOTIFY"),
    (13, "NETLINKSK"),
    (14, "NS"),
    (15, "TUNF"),
    (16, "EXT"),
    (17, "TIMERFD"),
    (18, "MEMFD"),
    (19, "BPFMAP"),
];

const SOCKET_FAMILIES: &[(u64, &str)] = &[
    (1, "UNIX"),
    (2, "INET"),
    (10, "INET6"),
    (16, "NETLINK"),
    (17, "PACKET"),
];

pub(crate) const SOCKET_TYPES: &[(u64, &str)] = &[
    (1, "STREAM"),
    (2, "DGRAM"),
    (3, "RAW"),
    (4, "RDM"),
    (5, "SEQPACKET"),
    (10, "PACKET"),
];

/// TCP states; unix sockets reuse them.
pub(crate) const SOCKET_STATES: &[(u64, &str)] = &[
    (1, "ESTABLISHED"),
    (2, "SYN_SENT"),
    (3, "SYN_RECV"),
    (4, "FIN_WAIT1"),
    (5, "FIN_WAIT2"),
    (6, "TIME_WAIT"),
    (7, "CLOSE"),
    (8, "CLOSE_WAIT"),
    (9, "LAST_ACK"),
    (10, "LISTEN"),
    (11, "CLOSING"),
];

pub(crate) const IP_PROTOCOLS: &[(u64, &str)] = &[
    (0, "IP"),
    (1, "ICMP"),
    (6, "TCP"),
    (17, "UDP"),
    (58, "ICMPV6"),
    (136, "UDPLITE"),
    (255, "RAW"),
];

const MAP_SHARED: u64 = 0x01;
const PE_PRESENT: u64 = 1 << 2;

/// Decoded image: CRIU wraps every image in `{magic, entries}`.
#[derive(Debug, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
struct DecodedImage<T> {
    #[serde(default)]
    entries: Vec<T>,
}

/// A numeric field, printed either as a number or as a name.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub(crate) enum Symbol {
    Number(u64),
    Name(String),
}

impl Default for Symbol {
    fn default() -> Self {
        Symbol::Number(0)
    }
}

impl Symbol {
    /// Symbolic name, looked up in `table` for numbers.
    pub(crate) fn name(&self, table: &[(u64, &str)]) -> String {
        match self {
            Symbol::Name(name) => name.clone(),
            Symbol::Number(value) => table
                .iter()
                .find(|(k, _)| k == value)
                .map_or_else(|| value.to_string(), |(_, name)| name.to_string()),
        }
    }

    /// Whether the flag called `name` with value `bit` is set. Symbolic
    /// flag sets are printed as `A | B`.
    fn has_flag(&self, name: &str, bit: u64) -> bool {
        match self {
            Symbol::Number(value) => value & bit != 0,
            Symbol::Name(text) => match parse_number(text) {
                Some(value) => value & bit != 0,
                None => text.split('|').any(|flag| flag.trim() == name),
            },
        }
    }
}

fn parse_number(text: &str) -> Option<u64> {
    let text = text.trim();
    match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => text.parse().ok(),
    }
}

/// Deserialize a number that may be printed as a (hex) string.
fn image_u64<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<u64, D::Error> {
    match Symbol::deserialize(deserializer)? {
        Symbol::Number(value) => Ok(value),
        Symbol::Name(text) => parse_number(&text)
            .ok_or_else(|| de::Error::custom(format!("invalid number {text:?}"))),
    }
}

/// An IP address: printed as text, or as CRIU's raw `u32` words.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
struct IpWords(Value);

impl IpWords {
    fn render(&self) -> String {
        let items = match &self.0 {
            Value::String(text) => return text.clone(),
            Value::Array(items) => items,
            _ => return String::new(),
        };
        if let Some(Value::String(text)) = items.first() {
            return text.clone();
        }
        let words: Vec<u32> = items
            .iter()
            .filter_map(Value::as_u64)
            .map(|v| v as u32)
            .collect();
        match words.as_slice() {
            [v4] => Ipv4Addr::from(v4.to_le_bytes()).to_string(),
            [a, b, c, d] => {
                let mut octets = [0u8; 16];
                for (chunk, word) in octets.chunks_mut(4).zip([a, b, c, d]) {
                    chunk.copy_from_slice(&word.to_le_bytes());
                }
                Ipv6Addr::from(octets).to_string()
            }
            _ => String::new(),
        }
    }
}

/// One `pstree.img` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct PstreeEntry {
    pub pid: u32,
    #[serde(default)]
    pub ppid: u32,
}

#[derive(Debug, Deserialize)]
struct CoreEntry {
    tc: Option<TaskCore>,
    ids: Option<TaskIds>,
}

/// The `tc` section of a core image.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskCore {
    #[serde(default)]
    pub task_state: u32,
    #[serde(default)]
    pub comm: String,
}

/// Kernel object IDs of a task; only the file table matters here.
#[derive(Debug, Clone, Deserialize)]
struct TaskIds {
    #[serde(deserialize_with = "image_u64")]
    files_id: u64,
}

#[derive(Debug, Deserialize)]
struct FsEntry {
    #[serde(deserialize_with = "image_u64")]
    cwd_id: u64,
    #[serde(deserialize_with = "image_u64")]
    root_id: u64,
}

#[derive(Debug, Deserialize)]
struct FdinfoEntry {
    #[serde(deserialize_with = "image_u64")]
    id: u64,
    #[serde(rename = "type")]
    kind: Symbol,
    fd: u32,
}

/// One `files.img` entry; the sub-message present depends on `type`.
#[derive(Debug, Deserialize)]
struct FileEntry {
    #[serde(deserialize_with = "image_u64")]
    id: u64,
    #[serde(rename = "type")]
    kind: Symbol,
    reg: Option<RegFile>,
    pipe: Option<PipeFile>,
    fifo: Option<PipeFile>,
    usk: Option<UnixSocket>,
    isk: Option<InetSocket>,
    psk: Option<PacketSocket>,
    nlsk: Option<NetlinkSocket>,
}

#[derive(Debug, Deserialize)]
struct RegFile {
    name: String,
}

#[derive(Debug, Deserialize)]
struct PipeFile {
    #[serde(deserialize_with = "image_u64")]
    pipe_id: u64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SocketOpts {
    so_sndbuf: u64,
    so_rcvbuf: u64,
}

#[derive(Debug, Deserialize)]
struct UnixSocket {
    #[serde(default)]
    ino: u64,
    #[serde(rename = "type", default)]
    sk_type: Symbol,
    #[serde(default)]
    state: Symbol,
    #[serde(default)]
    peer: u64,
    #[serde(default)]
    name: String,
    #[serde(default)]
    opts: SocketOpts,
}

#[derive(Debug, Deserialize)]
struct InetSocket {
    #[serde(default)]
    ino: u64,
    #[serde(default)]
    family: Symbol,
    #[serde(rename = "type", default)]
    sk_type: Symbol,
    #[serde(default)]
    proto: Symbol,
    #[serde(default)]
    state: Symbol,
    #[serde(default)]
    src_port: u32,
    #[serde(default)]
    dst_port: u32,
    #[serde(default)]
    src_addr: IpWords,
    #[serde(default)]
    dst_addr: IpWords,
    #[serde(default)]
    opts: SocketOpts,
}

#[derive(Debug, Deserialize)]
struct PacketSocket {
    #[serde(rename = "type", default)]
    sk_type: Symbol,
    #[serde(default)]
    opts: SocketOpts,
}

#[derive(Debug, Deserialize)]
struct NetlinkSocket {
    #[serde(default)]
    protocol: Symbol,
    #[serde(default)]
    opts: SocketOpts,
}

#[derive(Debug, Deserialize)]
struct PagemapHead {
    #[serde(deserialize_with = "image_u64")]
    pages_id: u64,
}

#[derive(Debug, Deserialize)]
struct PagemapEntry {
    #[serde(deserialize_with = "image_u64")]
    vaddr: u64,
    #[serde(deserialize_with = "image_u64")]
    nr_pages: u64,
    flags: Option<Symbol>,
    in_parent: Option<bool>,
}

impl PagemapEntry {
    fn in_image(&self) -> bool {
        match &self.flags {
            Some(flags) => flags.has_flag("PE_PRESENT", PE_PRESENT),
            None => !self.in_parent.unwrap_or(false),
        }
    }
}

#[derive(Debug, Deserialize)]
struct MmEntry {
    #[serde(deserialize_with = "image_u64")]
    mm_arg_start: u64,
    #[serde(deserialize_with = "image_u64")]
    mm_arg_end: u64,
    #[serde(deserialize_with = "image_u64")]
    mm_env_start: u64,
    #[serde(deserialize_with = "image_u64")]
    mm_env_end: u64,
    #[serde(default)]
    vmas: Vec<VmaEntry>,
}

#[derive(Debug, Deserialize)]
struct VmaEntry {
    #[serde(deserialize_with = "image_u64")]
    start: u64,
    #[serde(deserialize_with = "image_u64")]
    end: u64,
    #[serde(default)]
    flags: Symbol,
}

#[derive(Debug, Deserialize)]
struct StatsEntry {
    dump: Option<DumpStatistics>,
}

/// Timings and page counters CRIU records in `stats-dump`.
///
/// Times are in microseconds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct DumpStatistics {
    pub freezing_time: u64,
    pub frozen_time: u64,
    pub memdump_time: u64,
    pub memwrite_time: u64,
    pub pages_scanned: u64,
    pub pages_written: u64,
}

/// Explorer running `crit` against an extracted `checkpoint/` directory.
#[derive(Debug, Clone)]
pub struct CritExplorer {
    binary: PathBuf,
    images_dir: PathBuf,
    page_size: u64,
}

impl CritExplorer {
    /// Explore the images in `images_dir` with the `crit` binary at `binary`.
    pub fn new(binary: impl Into<PathBuf>, images_dir: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            images_dir: images_dir.into(),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Use a page size other than [`DEFAULT_PAGE_SIZE`].
    pub fn with_page_size(mut self, page_size: u64) -> Self {
        self.page_size = page_size;
        self
    }

    /// Directory holding the CRIU images.
    pub fn images_dir(&self) -> &Path {
        &self.images_dir
    }

    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    /// Decode the dump statistics file of a checkpoint.
    pub fn dump_statistics(&self, stats_file: &Path) -> Result<DumpStatistics> {
        let entries: Vec<StatsEntry> = self.decode_path(stats_file)?;
        entries
            .into_iter()
            .next()
            .and_then(|entry| entry.dump)
            .ok_or_else(|| {
                CheckpointError::Explorer(format!(
                    "{} has no dump statistics",
                    stats_file.display()
                ))
            })
    }

    /// The pagemap of `pid`.
    pub fn pagemap(&self, pid: u32) -> Result<Pagemap> {
        let mut entries: Vec<Value> = self.decode(&format!("pagemap-{pid}.img"))?;
        if entries.is_empty() {
            return Err(CheckpointError::Explorer(format!(
                "pagemap-{pid}.img is empty"
            )));
        }
        let head: PagemapHead = serde_json::from_value(entries.remove(0))
            .map_err(|e| parse_error(&format!("pagemap-{pid}.img"), e))?;
        let runs = entries
            .into_iter()
            .map(|entry| {
                let entry: PagemapEntry = serde_json::from_value(entry)?;
                Ok(PageRun {
                    vaddr: entry.vaddr,
                    nr_pages: entry.nr_pages,
                    in_image: entry.in_image(),
                })
            })
            .collect::<std::result::Result<Vec<_>, serde_json::Error>>()
            .map_err(|e| parse_error(&format!("pagemap-{pid}.img"), e))?;
        Ok(Pagemap {
            pages_id: head.pages_id,
            runs,
        })
    }

    /// Argument, environment and VMA layout of `pid`.
    pub fn memory_layout(&self, pid: u32) -> Result<MemoryLayout> {
        let entries: Vec<MmEntry> = self.decode(&format!("mm-{pid}.img"))?;
        let mm = entries
            .into_iter()
            .next()
            .ok_or_else(|| CheckpointError::Explorer(format!("mm-{pid}.img is empty")))?;
        Ok(MemoryLayout {
            arg_start: mm.mm_arg_start,
            arg_end: mm.mm_arg_end,
            env_start: mm.mm_env_start,
            env_end: mm.mm_env_end,
            vmas: mm
                .vmas
                .iter()
                .map(|vma| Vma {
                    start: vma.start,
                    end: vma.end,
                    shared: vma.flags.has_flag("MAP_SHARED", MAP_SHARED),
                })
                .collect(),
        })
    }

    /// Reader over the dumped pages of `pid`.
    pub fn memory_reader(&self, pid: u32) -> Result<MemoryReader> {
        let pagemap = self.pagemap(pid)?;
        Ok(MemoryReader::new(
            self.images_dir.join(pagemap.pages_file()),
            &pagemap,
            self.page_size,
        ))
    }

    /// Decode an image into the full document `crit` prints.
    pub fn decode_document(&self, path: &Path) -> Result<Value> {
        let image = file_name(path);
        let stdout = self.run(&[OsStr::new("decode"), OsStr::new("-i"), path.as_os_str()], &image)?;
        serde_json::from_slice(&stdout).map_err(|e| parse_error(&image, e))
    }

    /// Encode `document` into the binary image `output`.
    ///
    /// The JSON is staged next to `output` and removed afterwards.
    pub fn encode_document(&self, document: &Value, output: &Path) -> Result<()> {
        let image = file_name(output);
        let staged = output.with_file_name(format!("{image}.json"));
        std::fs::write(&staged, serde_json::to_vec(document)?)?;
        let result = self.run(
            &[
                OsStr::new("encode"),
                OsStr::new("-i"),
                staged.as_os_str(),
                OsStr::new("-o"),
                output.as_os_str(),
            ],
            &image,
        );
        if let Err(e) = std::fs::remove_file(&staged) {
            tracing::debug!(path = %staged.display(), "cannot remove staged JSON: {e}");
        }
        result.map(|_| ())
    }

    fn decode<T: DeserializeOwned>(&self, image: &str) -> Result<Vec<T>> {
        self.decode_path(&self.images_dir.join(image))
    }

    fn decode_path<T: DeserializeOwned>(&self, path: &Path) -> Result<Vec<T>> {
        let image = file_name(path);
        let stdout = self.run(&[OsStr::new("decode"), OsStr::new("-i"), path.as_os_str()], &image)?;
        let decoded: DecodedImage<T> =
            serde_json::from_slice(&stdout).map_err(|e| parse_error(&image, e))?;
        Ok(decoded.entries)
    }

    fn run(&self, args: &[&OsStr], image: &str) -> Result<Vec<u8>> {
        tracing::trace!(binary = %self.binary.display(), ?args, "running crit");
        let output = Command::new(&self.binary).args(args).output().map_err(|e| {
            CheckpointError::Explorer(format!("failed to run {}: {e}", self.binary.display()))
        })?;

        if !output.status.success() {
            return Err(CheckpointError::Explorer(format!(
                "{} {} {} failed with status {:?}: {}",
                self.binary.display(),
                args.first().map(|a| a.to_string_lossy()).unwrap_or_default(),
                image,
                output.status.code(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(output.stdout)
    }

    fn core(&self, pid: u32) -> Result<CoreEntry> {
        let entries: Vec<CoreEntry> = self.decode(&format!("core-{pid}.img"))?;
        entries
            .into_iter()
            .next()
            .ok_or_else(|| CheckpointError::Explorer(format!("core-{pid}.img is empty")))
    }

    fn task_core(&self, pid: u32) -> Result<TaskCore> {
        self.core(pid)?
            .tc
            .ok_or_else(|| CheckpointError::Explorer(format!("core-{pid}.img has no task core")))
    }

    /// PIDs and file table IDs of the tasks that have open files.
    ///
    /// Dead and zombie tasks have no file table and are skipped.
    fn file_tables(&self) -> Result<Vec<(u32, u64)>> {
        let pstree: Vec<PstreeEntry> = self.decode("pstree.img")?;
        let mut tables = Vec::with_capacity(pstree.len());
        for entry in pstree {
            let core = self.core(entry.pid)?;
            let state = TaskState::from_criu(core.tc.as_ref().map_or(0, |tc| tc.task_state));
            if !state.is_alive_or_stopped() {
                tracing::debug!(pid = entry.pid, %state, "no file table");
                continue;
            }
            let files_id = match core.ids {
                Some(ids) => ids.files_id,
                None => {
                    let ids: Vec<TaskIds> = self.decode(&format!("ids-{}.img", entry.pid))?;
                    ids.first().map(|ids| ids.files_id).ok_or_else(|| {
                        CheckpointError::Explorer(format!("ids-{}.img is empty", entry.pid))
                    })?
                }
            };
            tables.push((entry.pid, files_id));
        }
        Ok(tables)
    }

    fn files(&self) -> Result<HashMap<u64, FileEntry>> {
        let entries: Vec<FileEntry> = self.decode(FILES_IMAGE)?;
        Ok(entries.into_iter().map(|file| (file.id, file)).collect())
    }

    fn read_region(&self, pid: u32, region: &'static str, range: fn(&MemoryLayout) -> (u64, u64)) -> Result<Vec<u8>> {
        let read = || -> Result<Vec<u8>> {
            let (start, end) = range(&self.memory_layout(pid)?);
            Ok(self.memory_reader(pid)?.read(start, end)?)
        };
        read().map_err(|e| CheckpointError::memory_read(pid, region, e))
    }
}

impl CheckpointExplorer for CritExplorer {
    fn explore_ps(&self) -> Result<RawPsTree> {
        let entries: Vec<PstreeEntry> = self.decode("pstree.img")?;
        build_ps_tree(&entries, |pid| self.task_core(pid))
    }

    fn explore_fds(&self) -> Result<Vec<RawFdList>> {
        let files = self.files()?;
        let mut lists = Vec::new();
        for (pid, files_id) in self.file_tables()? {
            let fdinfo: Vec<FdinfoEntry> = self.decode(&format!("fdinfo-{files_id}.img"))?;
            let mut list = RawFdList {
                pid,
                files: Vec::with_capacity(fdinfo.len() + 2),
            };
            for fd in &fdinfo {
                list.files.push(RawFile {
                    kind: fd.kind.name(FD_TYPES),
                    fd: fd.fd.to_string(),
                    path: file_path(&files, fd.id)?,
                });
            }

            let fs: Vec<FsEntry> = self.decode(&format!("fs-{pid}.img"))?;
            if let Some(fs) = fs.first() {
                for (kind, id) in [("cwd", fs.cwd_id), ("root", fs.root_id)] {
                    list.files.push(RawFile {
                        kind: kind.to_string(),
                        fd: String::new(),
                        path: file_path(&files, id)?,
                    });
                }
            }
            lists.push(list);
        }
        Ok(lists)
    }

    fn explore_sockets(&self) -> Result<Vec<RawSocketList>> {
        let files = self.files()?;
        let mut lists = Vec::new();
        for (pid, files_id) in self.file_tables()? {
            let fdinfo: Vec<FdinfoEntry> = self.decode(&format!("fdinfo-{files_id}.img"))?;
            let sockets: Vec<RawSocket> = fdinfo
                .iter()
                .filter_map(|fd| Some((fd, files.get(&fd.id)?)))
                .filter_map(|(fd, file)| raw_socket(fd.fd, file))
                .collect();
            if !sockets.is_empty() {
                lists.push(RawSocketList { pid, sockets });
            }
        }
        Ok(lists)
    }

    fn ps_args(&self, pid: u32) -> Result<Vec<u8>> {
        self.read_region(pid, "cmdline", |layout| (layout.arg_start, layout.arg_end))
    }

    fn ps_env(&self, pid: u32) -> Result<Vec<u8>> {
        self.read_region(pid, "environment", |layout| (layout.env_start, layout.env_end))
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .unwrap_or_default()
        .to_string_lossy()
        .into_owned()
}

fn parse_error(image: &str, err: serde_json::Error) -> CheckpointError {
    CheckpointError::Explorer(format!("cannot parse decoded {image}: {err}"))
}

/// Path-like description of file `id`: the path of regular files,
/// `pipe[<id>]` for pipes and the like.
fn file_path(files: &HashMap<u64, FileEntry>, id: u64) -> Result<String> {
    let file = files
        .get(&id)
        .ok_or_else(|| CheckpointError::Explorer(format!("{FILES_IMAGE} has no file {id}")))?;
    let kind = file.kind.name(FD_TYPES);
    let described = match kind.as_str() {
        "REG" => file.reg.as_ref().map(|reg| reg.name.clone()),
        "PIPE" => file.pipe.as_ref().map(|p| format!("pipe[{}]", p.pipe_id)),
        "FIFO" => file.fifo.as_ref().map(|p| format!("fifo[{}]", p.pipe_id)),
        "UNIXSK" => file.usk.as_ref().map(|usk| {
            if usk.name.is_empty() {
                format!("unix[{} ({})]", usk.ino, usk.peer)
            } else {
                format!("unix[{} ({}) {}]", usk.ino, usk.peer, usk.name)
            }
        }),
        "INETSK" => file.isk.as_ref().map(|isk| {
            format!(
                "{}[{}:{} -> {}:{}]",
                isk.proto.name(IP_PROTOCOLS).to_lowercase(),
                isk.src_addr.render(),
                isk.src_port,
                isk.dst_addr.render(),
                isk.dst_port
            )
        }),
        _ => None,
    };
    Ok(described.unwrap_or_else(|| format!("{}[{}]", kind.to_lowercase(), file.id)))
}

/// The socket behind descriptor `fd`, if `file` is one.
fn raw_socket(fd: u32, file: &FileEntry) -> Option<RawSocket> {
    let fd_type = file.kind.name(FD_TYPES);
    let base = RawSocket {
        fd: fd.to_string(),
        fd_type: fd_type.clone(),
        ..Default::default()
    };
    let buffers = |opts: &SocketOpts| (format_size(opts.so_sndbuf), format_size(opts.so_rcvbuf));

    match fd_type.as_str() {
        "UNIXSK" => {
            let usk = file.usk.as_ref()?;
            let (send_buf, recv_buf) = buffers(&usk.opts);
            Some(RawSocket {
                family: "UNIX".to_string(),
                protocol: "UNIX".to_string(),
                socket_type: usk.sk_type.name(SOCKET_TYPES),
                state: usk.state.name(SOCKET_STATES),
                src_addr: usk.name.clone(),
                send_buf,
                recv_buf,
                ..base
            })
        }
        "INETSK" => {
            let isk = file.isk.as_ref()?;
            let (send_buf, recv_buf) = buffers(&isk.opts);
            Some(RawSocket {
                family: isk.family.name(SOCKET_FAMILIES),
                protocol: isk.proto.name(IP_PROTOCOLS),
                socket_type: isk.sk_type.name(SOCKET_TYPES),
                state: isk.state.name(SOCKET_STATES),
                src_addr: isk.src_addr.render(),
                src_port: isk.src_port,
                dest_addr: isk.dst_addr.render(),
                dest_port: isk.dst_port,
                send_buf,
                recv_buf,
                ..base
            })
        }
        "PACKETSK" => {
            let psk = file.psk.as_ref()?;
            let (send_buf, recv_buf) = buffers(&psk.opts);
            Some(RawSocket {
                family: "PACKET".to_string(),
                protocol: "PACKET".to_string(),
                socket_type: psk.sk_type.name(SOCKET_TYPES),
                send_buf,
                recv_buf,
                ..base
            })
        }
        "NETLINKSK" => {
            let nlsk = file.nlsk.as_ref()?;
            let (send_buf, recv_buf) = buffers(&nlsk.opts);
            Some(RawSocket {
                family: "NETLINK".to_string(),
                protocol: "NETLINK".to_string(),
                socket_type: nlsk.protocol.name(&[]),
                send_buf,
                recv_buf,
                ..base
            })
        }
        _ => None,
    }
}

/// Assemble a raw tree from flat `pstree.img` entries.
///
/// The root is the entry whose parent is not itself in the image (normally
/// `ppid == 0`). Children keep the order of the image.
pub fn build_ps_tree<F>(entries: &[PstreeEntry], mut core: F) -> Result<RawPsTree>
where
    F: FnMut(u32) -> Result<TaskCore>,
{
    let known: HashMap<u32, &PstreeEntry> = entries.iter().map(|e| (e.pid, e)).collect();
    let root = entries
        .iter()
        .find(|e| e.ppid == 0 || !known.contains_key(&e.ppid))
        .ok_or_else(|| CheckpointError::Explorer("pstree.img has no root process".into()))?;

    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for entry in entries {
        if entry.pid != root.pid && entry.pid != entry.ppid {
            children.entry(entry.ppid).or_default().push(entry.pid);
        }
    }

    fn build<F>(pid: u32, children: &HashMap<u32, Vec<u32>>, core: &mut F) -> Result<RawPsTree>
    where
        F: FnMut(u32) -> Result<TaskCore>,
    {
        let tc = core(pid)?;
        let kids = children
            .get(&pid)
            .map(|pids| {
                pids.iter()
                    .map(|&child| build(child, children, core))
                    .collect::<Result<Vec<_>>>()
            })
            .transpose()?
            .unwrap_or_default();
        Ok(RawPsTree {
            pid,
            comm: tc.comm,
            task_state: TaskState::from_criu(tc.task_state),
            children: kids,
        })
    }

    build(root.pid, &children, &mut core)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pstree(pairs: &[(u32, u32)]) -> Vec<PstreeEntry> {
        pairs
            .iter()
            .map(|&(pid, ppid)| PstreeEntry { pid, ppid })
            .collect()
    }

    fn core_for(pid: u32) -> Result<TaskCore> {
        Ok(TaskCore {
            task_state: if pid == 7 { 6 } else { 1 },
            comm: format!("proc{pid}"),
        })
    }

    #[test]
    fn test_build_ps_tree() {
        let entries = pstree(&[(1, 0), (5, 1), (7, 1), (9, 5)]);
        let tree = build_ps_tree(&entries, core_for).unwrap();
        assert_eq!(tree.pid, 1);
        assert_eq!(tree.comm, "proc1");
        let kids: Vec<u32> = tree.children.iter().map(|c| c.pid).collect();
        assert_eq!(kids, [5, 7]);
        assert_eq!(tree.children[0].children[0].pid, 9);
        assert_eq!(tree.children[1].task_state, TaskState::Zombie);
    }

    #[test]
    fn test_build_ps_tree_propagates_core_errors() {
        let entries = pstree(&[(1, 0), (2, 1)]);
        let err = build_ps_tree(&entries, |pid| {
            if pid == 2 {
                Err(CheckpointError::Explorer("bad core".into()))
            } else {
                core_for(pid)
            }
        })
        .unwrap_err();
        assert!(matches!(err, CheckpointError::Explorer(_)));
    }

    #[test]
    fn test_build_ps_tree_empty() {
        assert!(build_ps_tree(&[], core_for).is_err());
    }

    #[test]
    fn test_decoded_image_shapes() {
        let pstree: DecodedImage<PstreeEntry> = serde_json::from_str(
            r#"{"magic": "PSTREE", "entries": [{"pid": 1, "ppid": 0, "pgid": 1, "sid": 1, "threads": [1]}]}"#,
        )
        .unwrap();
        assert_eq!(pstree.entries[0].pid, 1);

        let core: DecodedImage<CoreEntry> = serde_json::from_str(
            r#"{"magic": "CORE", "entries": [{"mtype": "X86_64", "tc": {"task_state": 3, "exit_code": 0, "comm": "nginx"}}]}"#,
        )
        .unwrap();
        let tc = core.entries[0].tc.as_ref().unwrap();
        assert_eq!(tc.comm, "nginx");
        assert_eq!(TaskState::from_criu(tc.task_state), TaskState::Stopped);

        let stats: DecodedImage<StatsEntry> = serde_json::from_str(
            r#"{"magic": "STATS", "entries": [{"dump": {"freezing_time": 1200, "frozen_time": 56000, "memdump_time": 9000, "memwrite_time": 7000, "pages_scanned": 4096, "pages_skipped_parent": 0, "pages_written": 312}}]}"#,
        )
        .unwrap();
        let dump = stats.entries[0].dump.as_ref().unwrap();
        assert_eq!(dump.frozen_time, 56000);
        assert_eq!(dump.pages_written, 312);
    }

    #[test]
    fn test_decoded_image_without_entries() {
        let empty: DecodedImage<PstreeEntry> =
            serde_json::from_str(r#"{"magic": "PSTREE"}"#).unwrap();
        assert!(empty.entries.is_empty());
    }

    #[test]
    fn test_symbols_numeric_and_named() {
        let number: Symbol = serde_json::from_str("10").unwrap();
        let name: Symbol = serde_json::from_str(r#""LISTEN""#).unwrap();
        assert_eq!(number.name(SOCKET_STATES), "LISTEN");
        assert_eq!(name.name(SOCKET_STATES), "LISTEN");
        assert_eq!(Symbol::Number(42).name(SOCKET_STATES), "42");

        let flags: Symbol = serde_json::from_str(r#""MAP_SHARED | MAP_ANONYMOUS""#).unwrap();
        assert!(flags.has_flag("MAP_SHARED", MAP_SHARED));
        assert!(!Symbol::Name("MAP_PRIVATE".into()).has_flag("MAP_SHARED", MAP_SHARED));
        assert!(Symbol::Number(0x21).has_flag("MAP_SHARED", MAP_SHARED));
        assert!(Symbol::Name("0x4".into()).has_flag("PE_PRESENT", PE_PRESENT));
    }

    #[test]
    fn test_files_image_shapes() {
        let files: DecodedImage<FileEntry> = serde_json::from_str(
            r#"{"magic": "FILES", "entries": [
                {"id": 1, "type": "REG", "reg": {"id": 1, "flags": "O_RDONLY", "pos": 0, "name": "/etc/hosts"}},
                {"id": 2, "type": "PIPE", "pipe": {"id": 2, "pipe_id": 77, "flags": "0x0"}},
                {"id": 3, "type": 4, "isk": {"id": 3, "ino": 9, "family": 2, "type": 1, "proto": 6, "state": 10,
                    "src_port": 8080, "dst_port": 0, "src_addr": [16777343], "dst_addr": [0],
                    "opts": {"so_sndbuf": 16384, "so_rcvbuf": 131072}}},
                {"id": 4, "type": "UNIXSK", "usk": {"id": 4, "ino": 11, "type": "DGRAM", "state": "ESTABLISHED",
                    "peer": 0, "name": "/dev/log", "opts": {"so_sndbuf": 212992, "so_rcvbuf": 212992}}},
                {"id": 5, "type": "EVENTFD", "efd": {"id": 5, "counter": 0}}
            ]}"#,
        )
        .unwrap();
        let files: HashMap<u64, FileEntry> =
            files.entries.into_iter().map(|f| (f.id, f)).collect();

        assert_eq!(file_path(&files, 1).unwrap(), "/etc/hosts");
        assert_eq!(file_path(&files, 2).unwrap(), "pipe[77]");
        assert_eq!(file_path(&files, 3).unwrap(), "tcp[127.0.0.1:8080 -> 0.0.0.0:0]");
        assert_eq!(file_path(&files, 5).unwrap(), "eventfd[5]");
        assert!(matches!(
            file_path(&files, 99).unwrap_err(),
            CheckpointError::Explorer(_)
        ));

        let tcp = raw_socket(4, &files[&3]).unwrap();
        assert_eq!(tcp.fd_type, "INETSK");
        assert_eq!(tcp.family, "INET");
        assert_eq!(tcp.protocol, "TCP");
        assert_eq!(tcp.socket_type, "STREAM");
        assert_eq!(tcp.state, "LISTEN");
        assert_eq!(tcp.src_addr, "127.0.0.1");
        assert_eq!(tcp.src_port, 8080);
        assert_eq!(tcp.send_buf, "16.0 KiB");
        assert_eq!(tcp.recv_buf, "128.0 KiB");

        let unix = raw_socket(5, &files[&4]).unwrap();
        assert_eq!(unix.socket_type, "DGRAM");
        assert_eq!(unix.src_addr, "/dev/log");
        assert!(raw_socket(6, &files[&1]).is_none());
        assert!(raw_socket(7, &files[&5]).is_none());
    }

    #[test]
    fn test_printed_ip_addresses() {
        let v4 = IpWords(serde_json::json!(["10.88.0.5"]));
        assert_eq!(v4.render(), "10.88.0.5");
        let v6 = IpWords(serde_json::json!([0, 0, 0, 16777216]));
        assert_eq!(v6.render(), "::1");
        assert_eq!(IpWords::default().render(), "");
    }

    #[test]
    fn test_pagemap_and_mm_shapes() {
        let present: PagemapEntry =
            serde_json::from_str(r#"{"vaddr": "0x7ffd0000", "nr_pages": 2, "flags": "PE_PRESENT"}"#)
                .unwrap();
        assert_eq!(present.vaddr, 0x7ffd_0000);
        assert!(present.in_image());
        let parent: PagemapEntry =
            serde_json::from_str(r#"{"vaddr": 4096, "nr_pages": 1, "flags": 1}"#).unwrap();
        assert!(!parent.in_image());
        let legacy: PagemapEntry =
            serde_json::from_str(r#"{"vaddr": 4096, "nr_pages": 1, "in_parent": true}"#).unwrap();
        assert!(!legacy.in_image());

        let mm: MmEntry = serde_json::from_str(
            r#"{"mm_start_code": "0x400000", "mm_arg_start": "0x7ffd1000", "mm_arg_end": "0x7ffd1010",
                "mm_env_start": 2147487744, "mm_env_end": 2147487760,
                "vmas": [{"start": "0x1000", "end": "0x3000", "flags": "MAP_SHARED | MAP_ANONYMOUS"}]}"#,
        )
        .unwrap();
        assert_eq!(mm.mm_arg_end - mm.mm_arg_start, 16);
        assert_eq!(mm.mm_env_start, 0x8000_1000);
        assert!(mm.vmas[0].flags.has_flag("MAP_SHARED", MAP_SHARED));
    }

    #[test]
    fn test_missing_binary_is_explorer_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let explorer = CritExplorer::new(dir.path().join("no-such-crit"), dir.path());
        assert!(matches!(
            explorer.explore_ps().unwrap_err(),
            CheckpointError::Explorer(_)
        ));
        assert!(matches!(
            explorer.explore_fds().unwrap_err(),
            CheckpointError::Explorer(_)
        ));
        assert!(matches!(
            explorer.ps_args(1).unwrap_err(),
            CheckpointError::MemoryRead { pid: 1, .. }
        ));
    }
}
