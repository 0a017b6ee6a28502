//! Archive reading and extraction against fixture checkpoints.

use ckpt_rs::{ArchiveReader, CheckpointError, Compression, ExtractionTask, RequiredFiles};

use crate::fixture::{CheckpointBuilder, FixtureEngine};
use crate::integration_test;

integration_test!(test_compressed_archives_agree, || {
    let mut sizes = Vec::new();
    for compression in [Compression::None, Compression::Gzip, Compression::Zstd] {
        let checkpoint = CheckpointBuilder::new(FixtureEngine::Podman, "c1", "web")
            .memory_pages(8192)
            .rootfs_diff(1000)
            .compression(compression)
            .build()?;
        let archive = ArchiveReader::open(checkpoint.path())?;
        assert!(archive.has_entry_matching("checkpoint", true)?);
        assert!(archive.has_entry_matching("config.dump", false)?);
        assert!(!archive.has_entry_matching("config.dump", true)?);
        sizes.push(archive.size_breakdown()?);
    }

    assert_eq!(sizes[0], sizes[1]);
    assert_eq!(sizes[0], sizes[2]);
    assert_eq!(sizes[0].memory_pages_size, 8192);
    assert_eq!(sizes[0].rootfs_diff_size, 1000);
    assert_eq!(sizes[0].gpu_memory_pages_size, 0);

    Ok(())
});

integration_test!(test_task_extracts_only_requested, || {
    let checkpoint = CheckpointBuilder::new(FixtureEngine::Podman, "c1", "web")
        .rootfs_diff(1000)
        .compression(Compression::Gzip)
        .build()?;
    let task = ExtractionTask::create(checkpoint.path(), &RequiredFiles::metadata(), None)?;

    let scratch = task.scratch_dir();
    assert!(scratch.join("config.dump").is_file());
    assert!(scratch.join("spec.dump").is_file());
    assert!(!scratch.join("stats-dump").exists());
    assert!(!scratch.join("rootfs-diff.tar").exists());
    assert!(!task.checkpoint_dir().exists());
    assert_eq!(task.stats().files_extracted, 2);

    Ok(())
});

integration_test!(test_extracted_bytes_match, || {
    let content = b"{\"hand\": \"written\"}".to_vec();
    let checkpoint = CheckpointBuilder::new(FixtureEngine::Podman, "c1", "web")
        .file("custom.json", content.clone())
        .compression(Compression::Zstd)
        .build()?;
    let archive = ArchiveReader::open(checkpoint.path())?;
    let dest = tempfile::tempdir()?;
    let stats = archive.extract(dest.path(), &["custom.json"])?;

    assert_eq!(stats.files_extracted, 1);
    assert_eq!(stats.bytes_written, content.len() as u64);
    assert_eq!(std::fs::read(dest.path().join("custom.json"))?, content);

    Ok(())
});

integration_test!(test_scratch_dir_cleanup, || {
    let checkpoint = CheckpointBuilder::new(FixtureEngine::Podman, "c1", "web").build()?;
    let parent = tempfile::tempdir()?;

    let task = ExtractionTask::create(
        checkpoint.path(),
        &RequiredFiles::metadata(),
        Some(parent.path()),
    )?;
    let scratch = task.scratch_dir().to_path_buf();
    assert!(scratch.starts_with(parent.path()));
    drop(task);
    assert!(!scratch.exists());

    // A failing task leaves nothing behind either.
    let broken = CheckpointBuilder::new(FixtureEngine::Podman, "c1", "web")
        .without_marker()
        .build()?;
    let err = ExtractionTask::create(
        broken.path(),
        &RequiredFiles::metadata(),
        Some(parent.path()),
    )
    .unwrap_err();
    assert!(matches!(err, CheckpointError::MissingCheckpointMarker(_)));
    assert_eq!(std::fs::read_dir(parent.path())?.count(), 0);

    Ok(())
});

integration_test!(test_not_a_checkpoint, || {
    let dir = tempfile::tempdir()?;
    let err = ExtractionTask::create(dir.path(), &RequiredFiles::metadata(), None).unwrap_err();
    assert!(matches!(err, CheckpointError::NotRegularFile(_)));

    let text = dir.path().join("notes.txt");
    std::fs::write(&text, "not a tar archive at all")?;
    assert!(ExtractionTask::create(&text, &RequiredFiles::metadata(), None).is_err());

    Ok(())
});
