//! Process tree assembly through the `crit` explorer.

use ckpt_rs::{
    CheckpointError, CheckpointExplorer, CritExplorer, ExtractionTask, InspectOptions,
    RequiredFiles, TaskState, TreeOptions, assemble,
};

use crate::fixture::{
    CheckpointBuilder, FakeCrit, FixtureEngine, LAZY_PAGES, MEMORY_BASE, PAGE_SIZE,
};
use crate::integration_test;

fn ps_tree_files() -> RequiredFiles {
    RequiredFiles::for_inspect(&InspectOptions {
        ps_tree: true,
        ..Default::default()
    })
}

integration_test!(test_assemble_from_crit_images, || {
    let crit = FakeCrit::new()?;
    let checkpoint = CheckpointBuilder::new(FixtureEngine::Podman, "c1", "web")
        .process(5, 1, "nginx")
        .process(6, 5, "nginx")
        .process_in_state(9, 1, "defunct", 6)
        .process_in_state(10, 1, "paused", 3)
        .compression(ckpt_rs::Compression::Zstd)
        .build()?;
    let task = ExtractionTask::create(checkpoint.path(), &ps_tree_files(), None)?;
    let explorer = CritExplorer::new(crit.path(), task.checkpoint_dir());

    let tree = assemble(&explorer, &TreeOptions::default())?;
    assert_eq!(tree.pid, 1);
    assert_eq!(tree.len(), 5);
    let pids: Vec<u32> = tree.iter().map(|n| n.pid).collect();
    assert_eq!(pids, [1, 5, 6, 9, 10]);
    assert_eq!(tree.children[1].state, TaskState::Zombie);
    assert_eq!(tree.children[1].label(), "9 (Zombie)");
    assert_eq!(tree.children[2].label(), "10 (Stopped)");
    assert_eq!(tree.children[0].label(), "5");

    let subtree = assemble(
        &explorer,
        &TreeOptions {
            pid: Some(5),
            ..Default::default()
        },
    )?;
    assert_eq!(subtree.pid, 5);
    assert_eq!(subtree.len(), 2);

    let err = assemble(
        &explorer,
        &TreeOptions {
            pid: Some(77),
            ..Default::default()
        },
    )
    .unwrap_err();
    assert!(matches!(err, CheckpointError::PidNotFound(77)));

    Ok(())
});

integration_test!(test_crit_files_sockets_and_memory, || {
    let crit = FakeCrit::new()?;
    let checkpoint = CheckpointBuilder::new(FixtureEngine::Podman, "c1", "web")
        .process(5, 1, "nginx")
        .process_in_state(9, 1, "defunct", 6)
        .cmdline(5, &["nginx", "-g", "daemon off;"])
        .env(5, &["PATH=/usr/bin", "MODE=prod", "ODD"])
        .open_file(5, 3, "/var/log/nginx/access.log")
        .listen(5, 6, 8080)
        .build()?;
    let task = ExtractionTask::create(
        checkpoint.path(),
        &RequiredFiles::for_inspect(&InspectOptions::all()),
        None,
    )?;
    let explorer = CritExplorer::new(crit.path(), task.checkpoint_dir());

    let tree = assemble(
        &explorer,
        &TreeOptions {
            cmdline: true,
            env: true,
            files: true,
            sockets: true,
            ..Default::default()
        },
    )?;
    assert_eq!(tree.command_line.as_deref(), Some("sh"));
    let nginx = &tree.children[0];
    assert_eq!(nginx.display_command(), "nginx -g daemon off;");
    let env = nginx.environment.as_ref().ok_or("no environment")?;
    let pairs: Vec<(&str, &str)> = env
        .iter()
        .map(|v| (v.key.as_str(), v.value.as_str()))
        .collect();
    assert_eq!(pairs, [("PATH", "/usr/bin"), ("MODE", "prod"), ("ODD", "")]);

    let files: Vec<(&str, &str)> = nginx
        .open_files
        .iter()
        .map(|f| (f.fd.as_str(), f.path.as_str()))
        .collect();
    assert_eq!(
        files,
        [
            ("REG 3", "/var/log/nginx/access.log"),
            ("INETSK 6", "tcp[0.0.0.0:8080 -> 0.0.0.0:0]"),
            ("cwd", "/srv"),
            ("root", "/"),
        ]
    );

    let [socket] = nginx.open_sockets.as_slice() else {
        return Err(format!("expected one socket, got {:?}", nginx.open_sockets).into());
    };
    assert_eq!(socket.label(), "TCP (LISTEN)");
    assert_eq!(socket.local_endpoint(), "0.0.0.0:8080");
    assert_eq!(socket.detail(), "0.0.0.0:8080 -> 0.0.0.0:0 (↑ 16.0 KiB ↓ 128.0 KiB)");

    // The zombie has no images at all.
    let zombie = &tree.children[1];
    assert_eq!(zombie.state, TaskState::Zombie);
    assert!(zombie.command_line.is_none());
    assert!(zombie.open_files.is_empty());

    Ok(())
});

integration_test!(test_crit_memory_images, || {
    let crit = FakeCrit::new()?;
    let checkpoint = CheckpointBuilder::new(FixtureEngine::Podman, "c1", "web")
        .cmdline(1, &["/bin/sh", "-c", "sleep 1000"])
        .shared_memory(1, 64 * 1024)
        .build()?;
    let task = ExtractionTask::create(
        checkpoint.path(),
        &RequiredFiles::for_inspect(&InspectOptions {
            ps_tree_cmd: true,
            ..Default::default()
        }),
        None,
    )?;
    let explorer = CritExplorer::new(crit.path(), task.checkpoint_dir());

    let pagemap = explorer.pagemap(1)?;
    assert_eq!(pagemap.pages_file(), "pages-1.img");
    assert_eq!(pagemap.runs.len(), 2);
    assert!(pagemap.runs[0].in_image);
    assert!(!pagemap.runs[1].in_image);
    assert_eq!(
        pagemap.memory_size(explorer.page_size()),
        (1 + LAZY_PAGES) * PAGE_SIZE as u64
    );

    let layout = explorer.memory_layout(1)?;
    assert_eq!(layout.arg_start, MEMORY_BASE);
    assert_eq!(layout.shared_size(), 64 * 1024);

    let reader = explorer.memory_reader(1)?;
    let regions: Vec<(u64, u64)> = reader.regions().collect();
    assert_eq!(regions, [(MEMORY_BASE, PAGE_SIZE as u64)]);
    assert_eq!(explorer.ps_args(1)?, b"/bin/sh\0-c\0sleep 1000\0");
    assert!(explorer.ps_env(1)?.is_empty());

    // Lazy pages are listed but not stored.
    let err = reader
        .read(MEMORY_BASE + 0x20000, MEMORY_BASE + 0x20010)
        .unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::NotFound);

    Ok(())
});

integration_test!(test_crit_missing_memory_images, || {
    let crit = FakeCrit::new()?;
    let checkpoint = CheckpointBuilder::new(FixtureEngine::Podman, "c1", "web").build()?;
    let task = ExtractionTask::create(checkpoint.path(), &ps_tree_files(), None)?;
    let explorer = CritExplorer::new(crit.path(), task.checkpoint_dir());

    // Only the process tree images were extracted.
    assert!(matches!(
        explorer.explore_sockets(),
        Err(CheckpointError::Explorer(_))
    ));
    let err = assemble(
        &explorer,
        &TreeOptions {
            cmdline: true,
            ..Default::default()
        },
    )
    .unwrap_err();
    assert!(matches!(err, CheckpointError::MemoryRead { pid: 1, .. }));

    Ok(())
});

integration_test!(test_crit_dump_statistics, || {
    let crit = FakeCrit::new()?;
    let checkpoint = CheckpointBuilder::new(FixtureEngine::Podman, "c1", "web").build()?;
    let task = ExtractionTask::create(
        checkpoint.path(),
        &RequiredFiles::for_inspect(&InspectOptions {
            stats: true,
            ..Default::default()
        }),
        None,
    )?;
    let explorer = CritExplorer::new(crit.path(), task.checkpoint_dir());
    let stats = explorer.dump_statistics(&task.scratch_dir().join("stats-dump"))?;
    assert_eq!(stats.frozen_time, 56000);
    assert_eq!(stats.pages_scanned, 4096);

    Ok(())
});
