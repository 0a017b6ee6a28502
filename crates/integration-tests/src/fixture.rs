//! Test fixtures: checkpoint archives built on the fly.

use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use serde_json::{Value, json};
use tar::{EntryType, Header};
use tempfile::TempDir;

use ckpt_rs::Compression;

/// The engine whose conventions a fixture archive follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixtureEngine {
    Podman,
    CriO,
    Containerd,
}

/// Size of the single dumped page of each fixture process.
pub const PAGE_SIZE: usize = 4096;

/// Address of the dumped page of each fixture process. The command line
/// starts the page and the environment starts at [`ENV_OFFSET`].
pub const MEMORY_BASE: u64 = 0x7ffd_5000_0000;

pub const ENV_OFFSET: usize = 2048;

/// Pages listed in each pagemap but left out of the pages image.
pub const LAZY_PAGES: u64 = 2;

/// ID of the root directory in `files.img`; the working directory is `/srv`.
const ROOT_FILE_ID: u64 = 1;
const CWD_FILE_ID: u64 = 2;

/// One process recorded in the fixture's `pstree.img`.
#[derive(Debug, Clone)]
pub struct FixtureProcess {
    pub pid: u32,
    pub ppid: u32,
    pub comm: String,
    /// CRIU task state (1 alive, 2 dead, 3 stopped, 6 zombie).
    pub state: u32,
}

impl FixtureProcess {
    /// Whether CRIU dumps memory and files for the process.
    fn has_images(&self) -> bool {
        matches!(self.state, 1 | 3)
    }
}

/// An open descriptor of a fixture process.
#[derive(Debug, Clone)]
enum FixtureFd {
    File { path: String },
    Listen { port: u32 },
}

/// Builder for a checkpoint archive in a temporary directory.
///
/// CRIU images are stored as the JSON `crit decode` would print for them,
/// so a [`FakeCrit`] can serve them back. Every alive or stopped process gets
/// one dumped page holding its command line and environment, a working
/// directory and a root, plus the descriptors added with
/// [`open_file`](Self::open_file) and [`listen`](Self::listen).
#[derive(Debug, Clone)]
pub struct CheckpointBuilder {
    engine: FixtureEngine,
    id: String,
    name: String,
    image: String,
    created: String,
    network: Option<(String, String)>,
    processes: Vec<FixtureProcess>,
    cmdlines: BTreeMap<u32, Vec<String>>,
    envs: BTreeMap<u32, Vec<String>>,
    fds: BTreeMap<u32, Vec<(u32, FixtureFd)>>,
    shared_memory: BTreeMap<u32, u64>,
    memory_pages: usize,
    rootfs_diff: usize,
    compression: Compression,
    marker: bool,
    extra: Vec<(String, Vec<u8>)>,
}

impl CheckpointBuilder {
    /// A single-process checkpoint of container `id` named `name`.
    pub fn new(engine: FixtureEngine, id: &str, name: &str) -> Self {
        Self {
            engine,
            id: id.to_string(),
            name: name.to_string(),
            image: "quay.io/example/app:latest".to_string(),
            created: "2024-05-01T10:00:00Z".to_string(),
            network: None,
            processes: vec![FixtureProcess {
                pid: 1,
                ppid: 0,
                comm: "sh".to_string(),
                state: 1,
            }],
            cmdlines: BTreeMap::new(),
            envs: BTreeMap::new(),
            fds: BTreeMap::new(),
            shared_memory: BTreeMap::new(),
            memory_pages: PAGE_SIZE,
            rootfs_diff: 0,
            compression: Compression::None,
            marker: true,
            extra: Vec::new(),
        }
    }

    pub fn image(mut self, image: &str) -> Self {
        self.image = image.to_string();
        self
    }

    /// Podman network status (IP in CIDR form, MAC); the CRI-O IP annotation.
    pub fn network(mut self, ip: &str, mac: &str) -> Self {
        self.network = Some((ip.to_string(), mac.to_string()));
        self
    }

    /// Add an alive process.
    pub fn process(self, pid: u32, ppid: u32, comm: &str) -> Self {
        self.process_in_state(pid, ppid, comm, 1)
    }

    pub fn process_in_state(mut self, pid: u32, ppid: u32, comm: &str, state: u32) -> Self {
        self.processes.push(FixtureProcess {
            pid,
            ppid,
            comm: comm.to_string(),
            state,
        });
        self
    }

    /// Command line of `pid`; defaults to its command name.
    pub fn cmdline(mut self, pid: u32, args: &[&str]) -> Self {
        self.cmdlines
            .insert(pid, args.iter().map(|a| a.to_string()).collect());
        self
    }

    /// Environment of `pid` as `KEY=value` items; empty by default.
    pub fn env(mut self, pid: u32, vars: &[&str]) -> Self {
        self.envs
            .insert(pid, vars.iter().map(|v| v.to_string()).collect());
        self
    }

    /// Regular file `path` open as `fd` in `pid`.
    pub fn open_file(mut self, pid: u32, fd: u32, path: &str) -> Self {
        let file = FixtureFd::File {
            path: path.to_string(),
        };
        self.fds.entry(pid).or_default().push((fd, file));
        self
    }

    /// TCP socket listening on `0.0.0.0:port` as `fd` in `pid`.
    pub fn listen(mut self, pid: u32, fd: u32, port: u32) -> Self {
        self.fds
            .entry(pid)
            .or_default()
            .push((fd, FixtureFd::Listen { port }));
        self
    }

    /// A `MAP_SHARED` mapping of `bytes` in `pid`.
    pub fn shared_memory(mut self, pid: u32, bytes: u64) -> Self {
        self.shared_memory.insert(pid, bytes);
        self
    }

    /// Total size of the `checkpoint/pages-*.img` images.
    ///
    /// Each process with memory has one page; anything above that goes into
    /// a `pages-0.img` no pagemap refers to.
    pub fn memory_pages(mut self, bytes: usize) -> Self {
        self.memory_pages = bytes;
        self
    }

    /// Size of `rootfs-diff.tar`; zero omits it.
    pub fn rootfs_diff(mut self, bytes: usize) -> Self {
        self.rootfs_diff = bytes;
        self
    }

    pub fn compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    /// Leave out the `checkpoint/` directory entry and its images.
    pub fn without_marker(mut self) -> Self {
        self.marker = false;
        self
    }

    /// Add an entry after the generated ones.
    ///
    /// Extraction writes entries in archive order, so this can override a
    /// generated document such as `config.dump`.
    pub fn file(mut self, name: &str, content: impl Into<Vec<u8>>) -> Self {
        self.extra.retain(|(n, _)| n != name);
        self.extra.push((name.to_string(), content.into()));
        self
    }

    fn annotations(&self) -> Value {
        let pod = format!("{}-pod", self.name);
        match self.engine {
            FixtureEngine::Podman => json!({"io.container.manager": "libpod"}),
            FixtureEngine::CriO => {
                let metadata = json!({"name": self.name, "attempt": 2}).to_string();
                let ip = self.network.as_ref().map(|n| n.0.as_str()).unwrap_or("");
                json!({
                    "io.container.manager": "cri-o",
                    "io.kubernetes.cri-o.Metadata": metadata,
                    "io.kubernetes.cri-o.IP.0": ip,
                    "io.kubernetes.cri-o.Created": "2024-05-01T10:00:00.123456789Z",
                    "io.kubernetes.pod.namespace": "default",
                    "io.kubernetes.pod.name": pod,
                })
            }
            FixtureEngine::Containerd => json!({
                "io.kubernetes.cri.container-name": self.name,
                "io.kubernetes.cri.sandbox-namespace": "default",
                "io.kubernetes.cri.sandbox-name": pod,
            }),
        }
    }

    fn entries(&self) -> Vec<(String, Vec<u8>, EntryType)> {
        let mut entries = Vec::new();
        let mut file = |name: &str, content: Vec<u8>| {
            entries.push((name.to_string(), content, EntryType::Regular));
        };

        // Only Podman takes the name from the configuration.
        let config_name = match self.engine {
            FixtureEngine::Podman => self.name.as_str(),
            _ => "",
        };
        let config = json!({
            "id": self.id,
            "name": config_name,
            "rootfsImageName": self.image,
            "runtime": "crun",
            "createdTime": self.created,
            "checkpointedTime": "2024-05-01T12:00:00Z",
        });
        file("config.dump", config.to_string().into_bytes());

        let spec = json!({
            "annotations": self.annotations(),
            "mounts": [
                {"destination": "/proc", "type": "proc", "source": "proc"},
                {"destination": "/data", "type": "bind", "source": "/srv/data"},
            ],
        });
        file("spec.dump", spec.to_string().into_bytes());

        file(
            "stats-dump",
            json!({"magic": "STATS", "entries": [{"dump": {
                "freezing_time": 1200, "frozen_time": 56000, "memdump_time": 9000,
                "memwrite_time": 7000, "pages_scanned": 4096, "pages_written": 312,
            }}]})
            .to_string()
            .into_bytes(),
        );

        match (self.engine, &self.network) {
            (FixtureEngine::Podman, Some((ip, mac))) => {
                let status = json!({"podman": {"interfaces": {"eth0": {
                    "subnets": [{"ipnet": ip, "gateway": "10.88.0.1"}],
                    "mac_address": mac,
                }}}});
                file("network.status", status.to_string().into_bytes());
            }
            (FixtureEngine::Containerd, _) => {
                let status = json!({
                    "Pid": 4242,
                    "CreatedAt": 1_714_557_600_000_000_000i64,
                    "StartedAt": 1_714_557_601_000_000_000i64,
                    "FinishedAt": 0,
                    "ExitCode": 0,
                });
                file("status", status.to_string().into_bytes());
            }
            _ => {}
        }

        if self.rootfs_diff > 0 {
            file("rootfs-diff.tar", vec![0u8; self.rootfs_diff]);
        }
        for (name, content) in &self.extra {
            file(name, content.clone());
        }

        if self.marker {
            entries.push(("checkpoint".to_string(), Vec::new(), EntryType::Directory));
            let pids: Vec<Value> = self
                .processes
                .iter()
                .map(|p| json!({"pid": p.pid, "ppid": p.ppid}))
                .collect();
            let pstree = json!({"magic": "PSTREE", "entries": pids});
            entries.push((
                "checkpoint/pstree.img".to_string(),
                pstree.to_string().into_bytes(),
                EntryType::Regular,
            ));
            for p in &self.processes {
                let core = json!({
                    "magic": "CORE",
                    "entries": [{"tc": {"task_state": p.state, "comm": p.comm}}],
                });
                entries.push((
                    format!("checkpoint/core-{}.img", p.pid),
                    core.to_string().into_bytes(),
                    EntryType::Regular,
                ));
            }
            entries.extend(self.process_images());
        }
        entries
    }

    fn cmdline_of(&self, process: &FixtureProcess) -> Vec<String> {
        self.cmdlines
            .get(&process.pid)
            .cloned()
            .unwrap_or_else(|| vec![process.comm.clone()])
    }

    /// Memory, descriptor and file table images of the processes.
    fn process_images(&self) -> Vec<(String, Vec<u8>, EntryType)> {
        let mut images = Vec::new();
        let mut image = |name: String, content: Vec<u8>| {
            images.push((format!("checkpoint/{name}"), content, EntryType::Regular));
        };
        let hex = |addr: u64| format!("{addr:#x}");

        let mut files = vec![
            json!({"id": ROOT_FILE_ID, "type": "REG", "reg": {"id": ROOT_FILE_ID, "name": "/"}}),
            json!({"id": CWD_FILE_ID, "type": "REG", "reg": {"id": CWD_FILE_ID, "name": "/srv"}}),
        ];
        let mut next_id = 100u64;
        let mut dumped_pages = 0;

        for p in self.processes.iter().filter(|p| p.has_images()) {
            let pid = p.pid;
            let mut page = vec![0u8; PAGE_SIZE];
            let nul_joined = |items: &[String]| -> Vec<u8> {
                items.iter().flat_map(|i| i.bytes().chain([0])).collect()
            };
            let cmdline = nul_joined(&self.cmdline_of(p));
            let env = nul_joined(self.envs.get(&pid).map(Vec::as_slice).unwrap_or_default());
            page[..cmdline.len()].copy_from_slice(&cmdline);
            page[ENV_OFFSET..ENV_OFFSET + env.len()].copy_from_slice(&env);
            image(format!("pages-{pid}.img"), page);
            dumped_pages += PAGE_SIZE;

            let pagemap = json!({"magic": "PAGEMAP", "entries": [
                {"pages_id": pid},
                {"vaddr": hex(MEMORY_BASE), "nr_pages": 1, "flags": "PE_PRIVATE | PE_PRESENT"},
                {"vaddr": hex(MEMORY_BASE + 0x20000), "nr_pages": LAZY_PAGES, "flags": "PE_LAZY"},
            ]});
            image(format!("pagemap-{pid}.img"), pagemap.to_string().into_bytes());

            let mut vmas = vec![json!({
                "start": hex(MEMORY_BASE),
                "end": hex(MEMORY_BASE + PAGE_SIZE as u64),
                "flags": "MAP_PRIVATE | MAP_ANONYMOUS",
            })];
            if let Some(&shared) = self.shared_memory.get(&pid) {
                vmas.push(json!({
                    "start": hex(MEMORY_BASE + 0x100000),
                    "end": hex(MEMORY_BASE + 0x100000 + shared),
                    "flags": "MAP_SHARED",
                }));
            }
            let env_start = MEMORY_BASE + ENV_OFFSET as u64;
            let mm = json!({"magic": "MM", "entries": [{
                "mm_arg_start": hex(MEMORY_BASE),
                "mm_arg_end": hex(MEMORY_BASE + cmdline.len() as u64),
                "mm_env_start": hex(env_start),
                "mm_env_end": hex(env_start + env.len() as u64),
                "vmas": vmas,
            }]});
            image(format!("mm-{pid}.img"), mm.to_string().into_bytes());

            let ids = json!({"magic": "IDS", "entries": [{"files_id": pid}]});
            image(format!("ids-{pid}.img"), ids.to_string().into_bytes());
            let fs = json!({"magic": "FS", "entries": [{"cwd_id": CWD_FILE_ID, "root_id": ROOT_FILE_ID}]});
            image(format!("fs-{pid}.img"), fs.to_string().into_bytes());

            let mut fdinfo = Vec::new();
            for (fd, open) in self.fds.get(&pid).into_iter().flatten() {
                let id = next_id;
                next_id += 1;
                let (kind, file) = match open {
                    FixtureFd::File { path } => (
                        "REG",
                        json!({"id": id, "type": "REG", "reg": {"id": id, "name": path}}),
                    ),
                    FixtureFd::Listen { port } => (
                        "INETSK",
                        json!({"id": id, "type": "INETSK", "isk": {
                            "id": id, "ino": 50_000 + id, "family": "INET", "type": "STREAM",
                            "proto": "TCP", "state": "LISTEN", "src_port": port, "dst_port": 0,
                            "src_addr": ["0.0.0.0"], "dst_addr": ["0.0.0.0"],
                            "opts": {"so_sndbuf": 16384, "so_rcvbuf": 131072},
                        }}),
                    ),
                };
                files.push(file);
                fdinfo.push(json!({"id": id, "type": kind, "fd": fd, "flags": 2}));
            }
            let fdinfo = json!({"magic": "FDINFO", "entries": fdinfo});
            image(format!("fdinfo-{pid}.img"), fdinfo.to_string().into_bytes());
        }

        let files = json!({"magic": "FILES", "entries": files});
        image("files.img".to_string(), files.to_string().into_bytes());
        if self.memory_pages > dumped_pages {
            image("pages-0.img".to_string(), vec![0u8; self.memory_pages - dumped_pages]);
        }
        images
    }

    /// Write the archive.
    pub fn build(self) -> color_eyre::Result<TestCheckpoint> {
        let temp_dir = TempDir::new()?;
        let mut builder = tar::Builder::new(Vec::new());
        for (name, content, entry_type) in self.entries() {
            let mut header = Header::new_gnu();
            header.set_entry_type(entry_type);
            header.set_mode(if entry_type == EntryType::Directory { 0o755 } else { 0o644 });
            header.set_size(content.len() as u64);
            builder.append_data(&mut header, &name, content.as_slice())?;
        }
        let tar = builder.into_inner()?;

        let (file_name, bytes) = match self.compression {
            Compression::None => ("checkpoint.tar", tar),
            Compression::Gzip => {
                use std::io::Write;
                let mut encoder =
                    flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
                encoder.write_all(&tar)?;
                ("checkpoint.tar.gz", encoder.finish()?)
            }
            Compression::Zstd => ("checkpoint.tar.zst", zstd::encode_all(tar.as_slice(), 3)?),
        };
        let path = temp_dir.path().join(file_name);
        std::fs::write(&path, bytes)?;

        Ok(TestCheckpoint {
            _temp_dir: temp_dir,
            path,
            id: self.id,
        })
    }
}

/// A checkpoint archive that lives as long as the value.
#[derive(Debug)]
pub struct TestCheckpoint {
    _temp_dir: TempDir,
    path: PathBuf,
    id: String,
}

impl TestCheckpoint {
    /// Path of the archive file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Container ID recorded in `config.dump`.
    pub fn id(&self) -> &str {
        &self.id
    }
}

/// A stand-in for `crit` that passes image files through unchanged.
///
/// Fixture images already hold the decoded JSON, so `crit decode -i <img>`
/// reduces to `cat <img>` and `crit encode -i <json> -o <img>` to a copy.
#[derive(Debug)]
pub struct FakeCrit {
    _temp_dir: TempDir,
    path: PathBuf,
}

impl FakeCrit {
    pub fn new() -> color_eyre::Result<Self> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("crit");
        std::fs::write(
            &path,
            "#!/bin/sh\ncase \"$1\" in\n\
             decode) exec cat \"$3\" ;;\n\
             encode) exec cp \"$3\" \"$5\" ;;\n\
             *) exit 2 ;;\n\
             esac\n",
        )?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
        Ok(Self {
            _temp_dir: temp_dir,
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
