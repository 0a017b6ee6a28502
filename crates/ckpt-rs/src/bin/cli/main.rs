//! ckpt-rs: command-line tool for container checkpoint archives
//!
//! Shows a summary of one or more checkpoint archives, inspects their
//! process trees and metadata, and compares two checkpoints of the same
//! container. `list` finds the archives in the checkpoint directories,
//! `memparse` reports and dumps process memory, and `remap` rewrites the
//! TCP listen ports of an archive before it is restored.
//!
//! Process trees are read with CRIU's `crit` tool, which must be installed
//! (see `crit_binary` in the configuration file or `--crit`).
//!
//! Logging goes to stderr and is controlled by `RUST_LOG`; `-v` is a
//! shorthand for `RUST_LOG=debug`.

mod output;

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use ckpt_rs::metadata::STATS_DUMP_FILE;
use ckpt_rs::tree::locate_pid;
use ckpt_rs::*;
use output::{
    OutputFormat, TreeNode, create_styled_table, format_size, print_json, truncate_id,
};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ckpt-rs")]
#[command(about = "Inspect and compare container checkpoint archives", long_about = None)]
struct Cli {
    /// Configuration file (default: search the standard locations)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Parent directory for scratch directories
    #[arg(long, global = true)]
    scratch_dir: Option<PathBuf>,

    /// Path to the CRIU `crit` binary
    #[arg(long, global = true)]
    crit: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Summarize checkpoint archives in a table
    Show {
        /// Checkpoint archives
        #[arg(required = true)]
        archives: Vec<PathBuf>,
        /// Output format (tree or json)
        #[arg(long, value_enum)]
        format: Option<OutputFormat>,
    },

    /// Display detailed information on checkpoint archives
    Inspect {
        /// Checkpoint archives
        #[arg(required = true)]
        archives: Vec<PathBuf>,
        #[command(flatten)]
        sections: InspectArgs,
        /// Output format (tree or json)
        #[arg(long, value_enum)]
        format: Option<OutputFormat>,
    },

    /// Compare two checkpoints of the same container
    Diff {
        /// Older checkpoint
        a: PathBuf,
        /// Newer checkpoint
        b: PathBuf,
        /// Compare command lines
        #[arg(long)]
        ps_tree_cmd: bool,
        /// Include environment variables
        #[arg(long)]
        ps_tree_env: bool,
        /// Compare open files
        #[arg(long)]
        files: bool,
        /// Compare open sockets
        #[arg(long)]
        sockets: bool,
        /// Output format (tree or json)
        #[arg(long, value_enum)]
        format: Option<OutputFormat>,
    },

    /// List checkpoint archives in the checkpoint directories
    List {
        /// Additional directories to search
        #[arg(short = 'p', long = "paths")]
        paths: Vec<PathBuf>,
        /// Output format (tree or json)
        #[arg(long, value_enum)]
        format: Option<OutputFormat>,
    },

    /// Report process memory, or dump the memory of one process
    Memparse {
        /// Checkpoint archives
        #[arg(required = true)]
        archives: Vec<PathBuf>,
        /// Dump the memory pages of this PID
        #[arg(short, long)]
        pid: Option<u32>,
        /// Write the full dump to this file instead of stdout
        #[arg(short, long, requires = "pid")]
        output: Option<PathBuf>,
        /// Output format of the memory report (tree or json)
        #[arg(long, value_enum)]
        format: Option<OutputFormat>,
    },

    /// Change the TCP listen ports recorded in a checkpoint archive
    Remap {
        /// Checkpoint archive, rewritten in place
        archive: PathBuf,
        /// Port mappings as old:new[,old:new...]
        #[arg(long, required = true)]
        tcp_listen_remap: String,
    },
}

#[derive(clap::Args, Debug, Clone, Copy)]
struct InspectArgs {
    /// Show CRIU dump statistics
    #[arg(long)]
    stats: bool,
    /// Show the process tree
    #[arg(long)]
    ps_tree: bool,
    /// Show the process tree with command lines
    #[arg(long)]
    ps_tree_cmd: bool,
    /// Show the process tree with environment variables
    #[arg(long)]
    ps_tree_env: bool,
    /// Show open files
    #[arg(long)]
    files: bool,
    /// Show open sockets
    #[arg(long)]
    sockets: bool,
    /// Show mounts
    #[arg(long)]
    mounts: bool,
    /// Show pod and annotation metadata
    #[arg(long)]
    metadata: bool,
    /// Only show the subtree of this PID
    #[arg(short, long)]
    pid: Option<u32>,
    /// Show everything
    #[arg(long)]
    all: bool,
}

impl InspectArgs {
    fn options(&self) -> InspectOptions {
        if self.all {
            return InspectOptions {
                pid_filter: self.pid.is_some(),
                ..InspectOptions::all()
            };
        }
        InspectOptions {
            stats: self.stats,
            ps_tree: self.ps_tree,
            ps_tree_cmd: self.ps_tree_cmd,
            ps_tree_env: self.ps_tree_env,
            files: self.files,
            sockets: self.sockets,
            pid_filter: self.pid.is_some(),
        }
    }

    fn show_mounts(&self) -> bool {
        self.all || self.mounts
    }

    fn show_metadata(&self) -> bool {
        self.all || self.metadata
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = load_config(&cli)?;
    let scratch = config.scratch_dir.as_deref();

    match cli.command {
        Commands::Show { archives, format } => {
            let format = format.unwrap_or_else(|| config.format.into());
            show(&archives, scratch, format)?
        }
        Commands::Inspect {
            archives,
            sections,
            format,
        } => {
            let format = format.unwrap_or_else(|| config.format.into());
            inspect(&config, &archives, &sections, format)?
        }
        Commands::Diff {
            a,
            b,
            ps_tree_cmd,
            ps_tree_env,
            files,
            sockets,
            format,
        } => {
            let opts = DiffOptions {
                track_cmdline: ps_tree_cmd,
                track_env: ps_tree_env,
                track_files: files,
                track_sockets: sockets,
            };
            let format = format.unwrap_or_else(|| config.format.into());
            compare(&config, &a, &b, &opts, format)?
        }
        Commands::List { paths, format } => {
            let format = format.unwrap_or_else(|| config.format.into());
            list(&config, &paths, format)?
        }
        Commands::Memparse {
            archives,
            pid,
            output,
            format,
        } => match pid {
            Some(pid) => dump_memory(&config, &archives, pid, output.as_deref())?,
            None => {
                let format = format.unwrap_or_else(|| config.format.into());
                memory_report(&config, &archives, format)?
            }
        },
        Commands::Remap {
            archive,
            tcp_listen_remap,
        } => remap(&config, &archive, &tcp_listen_remap)?,
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Configuration file (explicit or discovered) with command line overrides.
fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("Failed to load configuration {}", path.display()))?,
        None => Config::discover().context("Failed to load configuration")?,
    };
    if let Some(dir) = &cli.scratch_dir {
        config.scratch_dir = Some(dir.clone());
    }
    if let Some(crit) = &cli.crit {
        config.crit_binary = crit.clone();
    }
    Ok(config)
}

fn show(archives: &[PathBuf], scratch: Option<&Path>, format: OutputFormat) -> Result<()> {
    let required = RequiredFiles::for_inspect(&InspectOptions::default());
    let tasks = create_tasks(archives, &required, scratch)
        .context("Failed to extract checkpoint metadata")?;
    let snapshots = tasks
        .iter()
        .map(|task| {
            snapshot_for_task(task).with_context(|| {
                format!("Failed to read checkpoint {}", task.archive_path().display())
            })
        })
        .collect::<Result<Vec<_>>>()?;

    match format {
        OutputFormat::Json => print_json(&snapshots)?,
        OutputFormat::Tree => {
            let mut table = create_styled_table();
            table.set_header(vec![
                "CONTAINER",
                "IMAGE",
                "ID",
                "RUNTIME",
                "CREATED",
                "ENGINE",
                "IP",
                "MAC",
                "CHKPT SIZE",
                "ROOT FS DIFF SIZE",
            ]);
            for s in &snapshots {
                table.add_row(vec![
                    s.name.clone(),
                    s.image.clone(),
                    truncate_id(&s.container_id),
                    s.runtime.clone(),
                    s.created.clone(),
                    s.engine.to_string(),
                    s.network.ip.clone(),
                    s.network.mac.clone(),
                    format_size(s.sizes.checkpoint_size),
                    format_size(s.sizes.rootfs_diff_size),
                ]);
            }
            println!("{table}");
        }
    }
    Ok(())
}

/// Everything `inspect` learned about one archive.
#[derive(Debug, Serialize)]
struct InspectReport {
    archive: PathBuf,
    #[serde(flatten)]
    snapshot: ContainerSnapshot,
    #[serde(skip_serializing_if = "Option::is_none")]
    statistics: Option<DumpStatistics>,
    #[serde(skip_serializing_if = "Option::is_none")]
    process_tree: Option<ProcessNode>,
}

fn inspect(
    config: &Config,
    archives: &[PathBuf],
    sections: &InspectArgs,
    format: OutputFormat,
) -> Result<()> {
    let opts = sections.options();
    let reports = archives
        .iter()
        .map(|archive| {
            inspect_archive(config, archive, sections, &opts)
                .with_context(|| format!("Failed to inspect {}", archive.display()))
        })
        .collect::<Result<Vec<_>>>()?;

    match format {
        OutputFormat::Json => print_json(&reports)?,
        OutputFormat::Tree => {
            for report in &reports {
                print!("{}", render_inspect(report, sections).render());
            }
        }
    }
    Ok(())
}

fn inspect_archive(
    config: &Config,
    archive: &Path,
    sections: &InspectArgs,
    opts: &InspectOptions,
) -> Result<InspectReport> {
    // Memory pages are the bulk of an archive; only unpack them once the
    // PID filter is known to match.
    let wants_memory = opts.ps_tree_cmd || opts.ps_tree_env;
    let initial = InspectOptions {
        ps_tree_cmd: false,
        ps_tree_env: false,
        ps_tree: opts.needs_ps_tree(),
        ..*opts
    };
    let mut task = ExtractionTask::create(
        archive,
        &RequiredFiles::for_inspect(&initial),
        config.scratch_dir.as_deref(),
    )?;
    let snapshot = snapshot_for_task(&task)?;
    let explorer = CritExplorer::new(&config.crit_binary, task.checkpoint_dir());

    let statistics = if opts.stats {
        Some(explorer.dump_statistics(&task.scratch_dir().join(STATS_DUMP_FILE))?)
    } else {
        None
    };

    let process_tree = if opts.needs_ps_tree() {
        let raw = explorer.explore_ps()?;
        if let Some(pid) = sections.pid {
            locate_pid(&raw, pid)?;
        }
        if wants_memory {
            task.extract_more(&RequiredFiles::memory())?;
        }
        let tree_opts = TreeOptions {
            pid: sections.pid,
            cmdline: opts.ps_tree_cmd,
            env: opts.ps_tree_env,
            files: opts.files,
            sockets: opts.sockets,
        };
        Some(assemble_tree(&explorer, &raw, &tree_opts)?)
    } else {
        None
    };

    Ok(InspectReport {
        archive: archive.to_path_buf(),
        snapshot,
        statistics,
        process_tree,
    })
}

fn render_inspect(report: &InspectReport, sections: &InspectArgs) -> TreeNode {
    let s = &report.snapshot;
    let mut root = TreeNode::new(s.display_name());
    root.field("Archive", report.archive.display())
        .field("Image", &s.image)
        .field("ID", &s.container_id)
        .field("Runtime", &s.runtime)
        .field("Created", &s.created)
        .field("Engine", &s.engine);
    if let Some(checkpointed) = &s.checkpointed {
        root.field("Checkpointed", checkpointed);
    }
    if !s.network.ip.is_empty() {
        root.field("IP", &s.network.ip);
    }
    if !s.network.mac.is_empty() {
        root.field("MAC", &s.network.mac);
    }
    root.field("Checkpoint size", format_size(s.sizes.checkpoint_size))
        .field("Memory pages size", format_size(s.sizes.memory_pages_size));
    if s.sizes.gpu_memory_pages_size > 0 {
        root.field(
            "AMD GPU memory pages size",
            format_size(s.sizes.gpu_memory_pages_size),
        );
    }
    if s.sizes.rootfs_diff_size > 0 {
        root.field("Root FS diff size", format_size(s.sizes.rootfs_diff_size));
    }
    if let Some(status) = &s.status {
        let node = root.child("Status");
        if let Some(pid) = status.pid {
            node.field("PID", pid);
        }
        if let Some(started) = &status.started_at {
            node.field("Started", started);
        }
        if let Some(finished) = &status.finished_at {
            node.field("Finished", finished);
        }
        node.field("Exit code", status.exit_code);
    }

    if sections.show_metadata() {
        let node = root.child("Metadata");
        if !s.pod.is_empty() {
            node.field("Pod name", &s.pod);
        }
        if !s.namespace.is_empty() {
            node.field("Kubernetes namespace", &s.namespace);
        }
        if let Some(attempt) = s.crio_attempt {
            node.field("Attempt", attempt);
        }
        let annotations = node.child("Annotations");
        for (key, value) in &s.annotations {
            annotations.field(key, value);
        }
    }

    if let Some(stats) = &report.statistics {
        root.child("CRIU dump statistics")
            .field("Freezing time", format!("{} us", stats.freezing_time))
            .field("Frozen time", format!("{} us", stats.frozen_time))
            .field("Memory dump time", format!("{} us", stats.memdump_time))
            .field("Memory write time", format!("{} us", stats.memwrite_time))
            .field("Memory pages scanned", stats.pages_scanned)
            .field("Memory pages written", stats.pages_written);
    }

    if let Some(tree) = &report.process_tree {
        root.child("Process tree").push(process_node(tree));
    }

    if sections.show_mounts() {
        let node = root.child("Overview of mounts");
        for mount in &s.mounts {
            node.child(format!("Destination: {}", mount.destination))
                .field("Type", &mount.mount_type)
                .field("Source", &mount.source);
        }
    }

    root
}

fn process_node(process: &ProcessNode) -> TreeNode {
    let mut node = TreeNode::new(format!(
        "[{}]  {}",
        process.label(),
        process.display_command()
    ));
    if let Some(env) = &process.environment {
        let vars = node.child("Environment variables");
        for var in env {
            vars.field(&var.key, &var.value);
        }
    }
    if !process.open_files.is_empty() {
        let files = node.child("Open files");
        for file in &process.open_files {
            files.child(format!("[{}]  {}", file.fd, file.path));
        }
    }
    if !process.open_sockets.is_empty() {
        let sockets = node.child("Open sockets");
        for socket in &process.open_sockets {
            sockets.child(format!("[{}]  {}", socket.label(), socket.detail()));
        }
    }
    for child in &process.children {
        node.push(process_node(child));
    }
    node
}

fn compare(
    config: &Config,
    a: &Path,
    b: &Path,
    opts: &DiffOptions,
    format: OutputFormat,
) -> Result<()> {
    let inspect = InspectOptions {
        ps_tree: true,
        ps_tree_cmd: opts.track_cmdline,
        ps_tree_env: opts.track_env,
        files: opts.track_files,
        sockets: opts.track_sockets,
        ..Default::default()
    };
    let tree_opts = TreeOptions {
        pid: None,
        cmdline: opts.track_cmdline,
        env: opts.track_env,
        files: opts.track_files,
        sockets: opts.track_sockets,
    };
    let tasks = create_tasks(
        &[a, b],
        &RequiredFiles::for_inspect(&inspect),
        config.scratch_dir.as_deref(),
    )
    .context("Failed to extract checkpoints")?;

    let [task_a, task_b] = &tasks[..] else {
        bail!("expected two checkpoint tasks, got {}", tasks.len());
    };

    let load = |task: &ExtractionTask| -> Result<(ContainerSnapshot, ProcessNode)> {
        let path = task.archive_path().display();
        let snapshot =
            snapshot_for_task(task).with_context(|| format!("Failed to read checkpoint {path}"))?;
        let explorer = CritExplorer::new(&config.crit_binary, task.checkpoint_dir());
        let tree = assemble(&explorer, &tree_opts)
            .with_context(|| format!("Failed to read process tree of {path}"))?;
        Ok((snapshot, tree))
    };
    let (snap_a, tree_a) = load(task_a)?;
    let (snap_b, tree_b) = load(task_b)?;

    let report = diff(&snap_a, Some(&tree_a), &snap_b, Some(&tree_b), opts)?;
    match format {
        OutputFormat::Json => print_json(&report)?,
        OutputFormat::Tree => print!("{}", render_diff(&report).render()),
    }
    Ok(())
}

fn render_diff(report: &DiffReport) -> TreeNode {
    let name = if report.container_name.is_empty() {
        "Container"
    } else {
        report.container_name.as_str()
    };
    let mut root = TreeNode::new(format!("Checkpoint diff: {name}"));
    root.field("ID", &report.container_id)
        .field("Image", &report.image);
    root.child("Checkpoint A")
        .field("Created", &report.checkpoint_a.created)
        .field("Size", format_size(report.checkpoint_a.total_size));
    root.child("Checkpoint B")
        .field("Created", &report.checkpoint_b.created)
        .field("Size", format_size(report.checkpoint_b.total_size));

    if let Some(p) = &report.process_changes {
        let node = root.child("Processes");
        for info in &p.added {
            node.child(format!("+ [{}]  {}", info.pid, process_text(info)));
        }
        for info in &p.removed {
            node.child(format!("- [{}]  {}", info.pid, process_text(info)));
        }
        for info in &p.modified {
            node.child(format!("~ [{}]  {}", info.pid, process_text(info)));
        }
        node.field("Unchanged", p.unchanged);
    }
    if let Some(f) = &report.file_changes {
        let node = root.child("Open files");
        for file in &f.added {
            node.child(format!("+ [{}] {}  {}", file.pid, file.fd, file.path));
        }
        for file in &f.removed {
            node.child(format!("- [{}] {}  {}", file.pid, file.fd, file.path));
        }
        node.field("Unchanged", f.unchanged);
    }
    if let Some(s) = &report.socket_changes {
        let node = root.child("Open sockets");
        for socket in &s.added {
            node.child(format!("+ [{}] {}", socket.pid, socket_text(socket)));
        }
        for socket in &s.removed {
            node.child(format!("- [{}] {}", socket.pid, socket_text(socket)));
        }
        node.field("Unchanged", s.unchanged);
    }
    root.field(
        "Memory",
        format!("{:+.2} MB", report.memory_changes.size_change_mb),
    );
    let summary = root.child("Summary");
    for line in report.summary.lines() {
        summary.child(line);
    }
    root
}

fn process_text(info: &ProcessInfo) -> &str {
    info.cmdline.as_deref().unwrap_or(&info.command)
}

fn socket_text(socket: &SocketInfo) -> String {
    if socket.remote.is_empty() {
        format!("{}  {}", socket.protocol, socket.local)
    } else {
        format!("{}  {} -> {}", socket.protocol, socket.local, socket.remote)
    }
}

fn list(config: &Config, extra: &[PathBuf], format: OutputFormat) -> Result<()> {
    let mut found: Vec<(&Path, Vec<ListedCheckpoint>)> = Vec::new();
    for dir in config.checkpoint_dirs.iter().chain(extra) {
        let archives = find_checkpoints(dir)
            .with_context(|| format!("Failed to read checkpoint directory {}", dir.display()))?;
        let mut listed = Vec::with_capacity(archives.len());
        for archive in archives {
            match read_listing(&archive, config.scratch_dir.as_deref()) {
                Ok(entry) => listed.push(entry),
                Err(e) => tracing::warn!(archive = %archive.display(), "skipping checkpoint: {e}"),
            }
        }
        if !listed.is_empty() {
            found.push((dir.as_path(), listed));
        }
    }

    match format {
        OutputFormat::Json => {
            let all: Vec<&ListedCheckpoint> = found.iter().flat_map(|(_, l)| l).collect();
            print_json(&all)?
        }
        OutputFormat::Tree => {
            if found.is_empty() {
                println!("No checkpoints found");
            }
            for (dir, listed) in &found {
                println!("Listing checkpoints in path: {}", dir.display());
                let mut table = create_styled_table();
                table.set_header(vec![
                    "Namespace",
                    "Pod",
                    "Container",
                    "Engine",
                    "Time Checkpointed",
                    "Checkpoint Name",
                ]);
                for entry in listed {
                    table.add_row(vec![
                        entry.namespace.clone(),
                        entry.pod.clone(),
                        entry.container.clone(),
                        entry.engine.to_string(),
                        entry.checkpointed.clone().unwrap_or_default(),
                        entry.file_name(),
                    ]);
                }
                println!("{table}");
            }
        }
    }
    Ok(())
}

/// Files for reading the process tree and memory of a checkpoint.
fn memory_files() -> RequiredFiles {
    let mut required = RequiredFiles::for_inspect(&InspectOptions {
        ps_tree: true,
        ..Default::default()
    });
    required.extend(&RequiredFiles::memory());
    required
}

#[derive(Debug, Serialize)]
struct ProcessMemory {
    pid: u32,
    name: String,
    memory_size: u64,
    shared_memory_size: u64,
}

#[derive(Debug, Serialize)]
struct MemoryReport {
    archive: PathBuf,
    processes: Vec<ProcessMemory>,
}

fn memory_report(config: &Config, archives: &[PathBuf], format: OutputFormat) -> Result<()> {
    let tasks = create_tasks(archives, &memory_files(), config.scratch_dir.as_deref())
        .context("Failed to extract checkpoint memory")?;

    let mut reports = Vec::with_capacity(tasks.len());
    for task in &tasks {
        let path = task.archive_path();
        let explorer = CritExplorer::new(&config.crit_binary, task.checkpoint_dir());
        let raw = explorer
            .explore_ps()
            .with_context(|| format!("Failed to read process tree of {}", path.display()))?;

        let mut processes = Vec::new();
        let mut pending = vec![&raw];
        while let Some(node) = pending.pop() {
            pending.extend(node.children.iter().rev());
            if !node.task_state.is_alive_or_stopped() {
                continue;
            }
            let pagemap = explorer.pagemap(node.pid)?;
            let layout = explorer.memory_layout(node.pid)?;
            processes.push(ProcessMemory {
                pid: node.pid,
                name: node.comm.clone(),
                memory_size: pagemap.memory_size(explorer.page_size()),
                shared_memory_size: layout.shared_size(),
            });
        }
        reports.push(MemoryReport {
            archive: path.to_path_buf(),
            processes,
        });
    }

    match format {
        OutputFormat::Json => print_json(&reports)?,
        OutputFormat::Tree => {
            for report in &reports {
                println!(
                    "Displaying memory information for {}",
                    report.archive.display()
                );
                let mut table = create_styled_table();
                table.set_header(vec!["PID", "Process name", "Memory size", "Shared memory size"]);
                for p in &report.processes {
                    table.add_row(vec![
                        p.pid.to_string(),
                        p.name.clone(),
                        format_size(p.memory_size),
                        format_size(p.shared_memory_size),
                    ]);
                }
                println!("{table}");
            }
        }
    }
    Ok(())
}

fn dump_memory(config: &Config, archives: &[PathBuf], pid: u32, output: Option<&Path>) -> Result<()> {
    let [archive] = archives else {
        bail!("--pid takes exactly one checkpoint archive");
    };
    let task = ExtractionTask::create(archive, &memory_files(), config.scratch_dir.as_deref())?;
    let explorer = CritExplorer::new(&config.crit_binary, task.checkpoint_dir());
    let raw = explorer.explore_ps()?;
    let node = locate_pid(&raw, pid)?;
    if !node.task_state.is_alive_or_stopped() {
        bail!("process {pid} is {} and has no memory pages", node.task_state);
    }
    let reader = explorer.memory_reader(pid)?;

    let out: Box<dyn Write> = match output {
        Some(path) => {
            println!("Writing memory pages content for process ID {pid} to file: {}", path.display());
            let file = File::create(path)
                .with_context(|| format!("Failed to create {}", path.display()))?;
            Box::new(BufWriter::new(file))
        }
        None => {
            println!(
                "Displaying memory pages content for process ID {pid} from checkpoint: {}\n",
                archive.display()
            );
            Box::new(std::io::stdout().lock())
        }
    };

    let mut dump = HexDump::new(out, output.is_none());
    dump.header()?;
    let chunk = explorer.page_size();
    for (vaddr, len) in reader.regions() {
        let end = vaddr + len;
        let mut addr = vaddr;
        while addr < end {
            let next = end.min(addr + chunk);
            let data = reader
                .read(addr, next)
                .with_context(|| format!("Failed to read {}", reader.pages_path().display()))?;
            dump.dump(addr, &data)?;
            addr = next;
        }
    }
    dump.into_inner().flush()?;
    Ok(())
}

fn remap(config: &Config, archive: &Path, spec: &str) -> Result<()> {
    let mappings = parse_port_mappings(spec)?;
    let remapped = remap_archive(
        archive,
        &config.crit_binary,
        &mappings,
        config.scratch_dir.as_deref(),
    )
    .with_context(|| format!("Failed to remap {}", archive.display()))?;

    if remapped.is_empty() {
        println!("No TCP listen sockets were found matching the specified port mappings");
    } else {
        for port in &remapped {
            tracing::info!(file_id = port.file_id, "{} -> {}", port.old_port, port.new_port);
        }
        println!(
            "Successfully remapped TCP listen ports in {}",
            archive.display()
        );
    }
    Ok(())
}
