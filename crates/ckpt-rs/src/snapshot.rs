//! Engine-agnostic view of a checkpoint.
//!
//! Podman, CRI-O and containerd all write `config.dump` and `spec.dump`, but
//! they disagree on where the interesting facts live. Podman keeps the name
//! in the config document, CRI-O hides it in a JSON string inside an
//! annotation, and containerd uses CRI annotations plus an optional `status`
//! file. [`load_snapshot`] reads the documents once, picks an adapter via
//! [`Engine::from_annotation`], and returns a [`ContainerSnapshot`].

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

use crate::archive::{ArchiveReader, ArchiveSizes};
use crate::error::{CheckpointError, Result};
use crate::metadata::{
    self, ANNOTATION_CRI_CONTAINER_NAME, ANNOTATION_CRI_SANDBOX_NAME,
    ANNOTATION_CRI_SANDBOX_NAMESPACE, ANNOTATION_CRIO_CREATED, ANNOTATION_CRIO_IP,
    ANNOTATION_CRIO_METADATA, ANNOTATION_MANAGER, ANNOTATION_POD_NAME, ANNOTATION_POD_NAMESPACE,
    ContainerConfig, ContainerdStatus, CriOContainerMetadata, NETWORK_STATUS_FILE,
    PodmanNetworkStatus, SpecDump, SpecMount,
};
use crate::task::ExtractionTask;

/// The container engine that produced a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Engine {
    /// Podman (`io.container.manager=libpod`).
    Podman,
    /// CRI-O (`io.container.manager=cri-o`).
    #[serde(rename = "CRI-O")]
    CriO,
    /// containerd, and anything else.
    #[serde(rename = "containerd")]
    Containerd,
}

impl Engine {
    /// Map the value of the `io.container.manager` annotation to an engine.
    ///
    /// Every value maps to an engine; unknown or empty values are assumed to
    /// come from containerd, which does not set the annotation.
    pub fn from_annotation(value: &str) -> Self {
        match value {
            "libpod" => Engine::Podman,
            "cri-o" => Engine::CriO,
            _ => Engine::Containerd,
        }
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Engine::Podman => "Podman",
            Engine::CriO => "CRI-O",
            Engine::Containerd => "containerd",
        })
    }
}

/// Network identity of the container at checkpoint time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NetworkInfo {
    /// IP address; Podman reports it in CIDR notation.
    pub ip: String,
    /// MAC address.
    pub mac: String,
}

/// Process status reported by containerd's `status` file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ContainerStatus {
    /// Host PID of the container init process.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// When the container process started.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    /// When the container process exited.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,
    /// Exit code of the container process.
    pub exit_code: i32,
}

impl From<&ContainerdStatus> for ContainerStatus {
    fn from(status: &ContainerdStatus) -> Self {
        Self {
            pid: (status.pid != 0).then_some(status.pid),
            started_at: metadata::unix_nanos(status.started_at).map(rfc3339),
            finished_at: metadata::unix_nanos(status.finished_at).map(rfc3339),
            exit_code: status.exit_code,
        }
    }
}

/// Normalized metadata of one checkpoint archive.
#[derive(Debug, Clone, Serialize)]
pub struct ContainerSnapshot {
    /// Full container ID from the config document.
    pub container_id: String,
    /// Container name. May be empty if the engine did not record one.
    pub name: String,
    /// Root filesystem image.
    pub image: String,
    /// OCI runtime.
    pub runtime: String,
    /// Engine that produced the checkpoint.
    pub engine: Engine,
    /// Creation time, RFC3339 (CRI-O's annotation is passed through as is).
    pub created: String,
    /// Time the checkpoint was taken, if recorded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpointed: Option<String>,
    /// Kubernetes namespace.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    /// Kubernetes pod.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub pod: String,
    pub network: NetworkInfo,
    pub sizes: ArchiveSizes,
    /// All annotations of the process spec, sorted by key.
    pub annotations: BTreeMap<String, String>,
    pub mounts: Vec<SpecMount>,
    /// containerd process status, when a `status` file was present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<ContainerStatus>,
    /// CRI-O restart attempt.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crio_attempt: Option<u32>,
}

impl ContainerSnapshot {
    /// Name for display purposes.
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            "Container"
        } else {
            &self.name
        }
    }
}

/// What an engine adapter contributes to the snapshot.
#[derive(Debug, Default)]
struct EngineInfo {
    name: String,
    created: String,
    namespace: String,
    pod: String,
    network: NetworkInfo,
    status: Option<ContainerStatus>,
    crio_attempt: Option<u32>,
}

/// Build the snapshot for an extraction task.
pub fn snapshot_for_task(task: &ExtractionTask) -> Result<ContainerSnapshot> {
    load_snapshot(task.scratch_dir(), task.archive())
}

/// Build a snapshot from an extracted directory.
///
/// `dir` must contain at least `config.dump` and `spec.dump`. `archive` is
/// the archive the directory was extracted from; it supplies the size
/// breakdown and, for Podman, the network status.
pub fn load_snapshot(dir: &Path, archive: &ArchiveReader) -> Result<ContainerSnapshot> {
    let config = metadata::read_config_dump(dir)?;
    let spec = metadata::read_spec_dump(dir)?;

    let manager = spec.annotation(ANNOTATION_MANAGER);
    let engine = Engine::from_annotation(manager);
    tracing::debug!(dir = %dir.display(), manager, %engine, "selected engine adapter");

    let info = match engine {
        Engine::Podman => podman_info(&config, dir, archive)?,
        Engine::CriO => crio_info(&spec)?,
        Engine::Containerd => {
            let status = metadata::read_status_file(dir)?;
            containerd_info(&config, &spec, status.as_ref())
        }
    };

    let sizes = archive.size_breakdown()?;

    Ok(ContainerSnapshot {
        container_id: config.id,
        name: info.name,
        image: config.rootfs_image_name,
        runtime: config.oci_runtime,
        engine,
        created: info.created,
        checkpointed: config.checkpointed_time.map(rfc3339),
        namespace: info.namespace,
        pod: info.pod,
        network: info.network,
        sizes,
        annotations: spec.annotations.into_iter().collect(),
        mounts: spec.mounts,
        status: info.status,
        crio_attempt: info.crio_attempt,
    })
}

fn podman_info(config: &ContainerConfig, dir: &Path, archive: &ArchiveReader) -> Result<EngineInfo> {
    Ok(EngineInfo {
        name: config.name.clone(),
        created: config.created_time.map(rfc3339).unwrap_or_default(),
        network: podman_network(dir, archive)?,
        ..Default::default()
    })
}

/// Pull `network.status` out of the original archive and read the primary
/// interface from it.
///
/// The file is extracted into a short-lived directory below `dir`, so it
/// lands wherever the caller keeps its scratch data.
fn podman_network(dir: &Path, archive: &ArchiveReader) -> Result<NetworkInfo> {
    let scratch = tempfile::Builder::new()
        .prefix("network-")
        .tempdir_in(dir)?;
    archive.extract(scratch.path(), &[NETWORK_STATUS_FILE])?;

    let content = match std::fs::read(scratch.path().join(NETWORK_STATUS_FILE)) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(archive = %archive.path().display(), "no network status in archive");
            return Ok(NetworkInfo::default());
        }
        Err(e) => return Err(e.into()),
    };

    let status = PodmanNetworkStatus::from_slice(&content)?;
    Ok(status
        .primary_address()
        .map(|(ip, mac)| NetworkInfo { ip, mac })
        .unwrap_or_default())
}

fn crio_info(spec: &SpecDump) -> Result<EngineInfo> {
    let metadata: CriOContainerMetadata =
        serde_json::from_str(spec.annotation(ANNOTATION_CRIO_METADATA))
            .map_err(CheckpointError::CriOMetadata)?;

    Ok(EngineInfo {
        name: metadata.name,
        created: spec.annotation(ANNOTATION_CRIO_CREATED).to_string(),
        namespace: spec.annotation(ANNOTATION_POD_NAMESPACE).to_string(),
        pod: spec.annotation(ANNOTATION_POD_NAME).to_string(),
        network: NetworkInfo {
            ip: spec.annotation(ANNOTATION_CRIO_IP).to_string(),
            mac: String::new(),
        },
        crio_attempt: Some(metadata.attempt),
        ..Default::default()
    })
}

fn containerd_info(
    config: &ContainerConfig,
    spec: &SpecDump,
    status: Option<&ContainerdStatus>,
) -> EngineInfo {
    EngineInfo {
        name: spec.annotation(ANNOTATION_CRI_CONTAINER_NAME).to_string(),
        created: config.created_time.map(rfc3339).unwrap_or_default(),
        namespace: spec.annotation(ANNOTATION_CRI_SANDBOX_NAMESPACE).to_string(),
        pod: spec.annotation(ANNOTATION_CRI_SANDBOX_NAME).to_string(),
        status: status.map(ContainerStatus::from),
        ..Default::default()
    }
}

fn rfc3339(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tar::{EntryType, Header};
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        archive: ArchiveReader,
    }

    /// Write `files` both into an extracted directory and an archive.
    fn fixture(files: &[(&str, String)]) -> Fixture {
        let dir = TempDir::new().unwrap();
        let extracted = dir.path().join("extracted");
        std::fs::create_dir(&extracted).unwrap();

        let mut builder = tar::Builder::new(Vec::new());
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Directory);
        header.set_mode(0o755);
        header.set_size(0);
        builder
            .append_data(&mut header, "checkpoint", std::io::empty())
            .unwrap();
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_mode(0o644);
        header.set_size(100);
        builder
            .append_data(&mut header, "checkpoint/pages-1.img", &[0u8; 100][..])
            .unwrap();

        for (name, content) in files {
            std::fs::write(extracted.join(name), content).unwrap();
            let mut header = Header::new_gnu();
            header.set_entry_type(EntryType::Regular);
            header.set_mode(0o644);
            header.set_size(content.len() as u64);
            builder
                .append_data(&mut header, name, content.as_bytes())
                .unwrap();
        }
        let archive_path = dir.path().join("checkpoint.tar");
        std::fs::write(&archive_path, builder.into_inner().unwrap()).unwrap();
        let archive = ArchiveReader::open(&archive_path).unwrap();
        Fixture { dir, archive }
    }

    impl Fixture {
        fn load(&self) -> Result<ContainerSnapshot> {
            load_snapshot(&self.dir.path().join("extracted"), &self.archive)
        }
    }

    fn config_dump() -> String {
        json!({
            "id": "4f2a1b3c5d6e7f8091a2b3c4d5e6f708",
            "name": "web",
            "rootfsImageName": "docker.io/library/nginx:latest",
            "runtime": "crun",
            "createdTime": "2024-03-01T10:00:00Z",
            "checkpointedTime": "2024-03-01T11:30:00Z"
        })
        .to_string()
    }

    fn spec_dump(annotations: serde_json::Value) -> String {
        json!({
            "annotations": annotations,
            "mounts": [{"destination": "/proc", "type": "proc", "source": "proc"}]
        })
        .to_string()
    }

    #[test]
    fn test_engine_from_annotation_is_total() {
        assert_eq!(Engine::from_annotation("libpod"), Engine::Podman);
        assert_eq!(Engine::from_annotation("cri-o"), Engine::CriO);
        assert_eq!(Engine::from_annotation(""), Engine::Containerd);
        assert_eq!(Engine::from_annotation("something-else"), Engine::Containerd);
        assert_eq!(Engine::CriO.to_string(), "CRI-O");
    }

    #[test]
    fn test_podman_snapshot_with_network() {
        let network = json!({
            "podman": {
                "interfaces": {
                    "eth0": {
                        "subnets": [{"ipnet": "10.88.0.9/16", "gateway": "10.88.0.1"}],
                        "mac_address": "f2:99:8d:fb:5a:57"
                    }
                }
            }
        });
        let fx = fixture(&[
            ("config.dump", config_dump()),
            ("spec.dump", spec_dump(json!({"io.container.manager": "libpod"}))),
            ("network.status", network.to_string()),
        ]);
        let snap = fx.load().unwrap();
        assert_eq!(snap.engine, Engine::Podman);
        assert_eq!(snap.name, "web");
        assert_eq!(snap.image, "docker.io/library/nginx:latest");
        assert_eq!(snap.runtime, "crun");
        assert_eq!(snap.created, "2024-03-01T10:00:00Z");
        assert_eq!(snap.checkpointed.as_deref(), Some("2024-03-01T11:30:00Z"));
        assert_eq!(snap.network.ip, "10.88.0.9/16");
        assert_eq!(snap.network.mac, "f2:99:8d:fb:5a:57");
        assert_eq!(snap.sizes.memory_pages_size, 100);
        assert_eq!(snap.mounts.len(), 1);
        assert!(snap.status.is_none());
    }

    #[test]
    fn test_podman_without_network_status() {
        let fx = fixture(&[
            ("config.dump", config_dump()),
            ("spec.dump", spec_dump(json!({"io.container.manager": "libpod"}))),
        ]);
        let snap = fx.load().unwrap();
        assert_eq!(snap.network, NetworkInfo::default());
    }

    #[test]
    fn test_podman_malformed_network_status() {
        let fx = fixture(&[
            ("config.dump", config_dump()),
            ("spec.dump", spec_dump(json!({"io.container.manager": "libpod"}))),
            ("network.status", "{not json".to_string()),
        ]);
        assert!(matches!(
            fx.load().unwrap_err(),
            CheckpointError::NetworkStatus(_)
        ));
    }

    #[test]
    fn test_crio_snapshot() {
        let fx = fixture(&[
            ("config.dump", config_dump()),
            (
                "spec.dump",
                spec_dump(json!({
                    "io.container.manager": "cri-o",
                    "io.kubernetes.cri-o.Metadata": "{\"name\":\"counter\",\"attempt\":2}",
                    "io.kubernetes.cri-o.IP.0": "10.244.0.7",
                    "io.kubernetes.cri-o.Created": "2024-02-29T08:15:00.123456789Z",
                    "io.kubernetes.pod.namespace": "default",
                    "io.kubernetes.pod.name": "counter-pod"
                })),
            ),
        ]);
        let snap = fx.load().unwrap();
        assert_eq!(snap.engine, Engine::CriO);
        assert_eq!(snap.name, "counter");
        assert_eq!(snap.crio_attempt, Some(2));
        assert_eq!(snap.network.ip, "10.244.0.7");
        assert_eq!(snap.created, "2024-02-29T08:15:00.123456789Z");
        assert_eq!(snap.namespace, "default");
        assert_eq!(snap.pod, "counter-pod");
        assert_eq!(snap.container_id, "4f2a1b3c5d6e7f8091a2b3c4d5e6f708");
    }

    #[test]
    fn test_crio_malformed_metadata() {
        let fx = fixture(&[
            ("config.dump", config_dump()),
            (
                "spec.dump",
                spec_dump(json!({
                    "io.container.manager": "cri-o",
                    "io.kubernetes.cri-o.Metadata": "{\"name\":"
                })),
            ),
        ]);
        assert!(matches!(
            fx.load().unwrap_err(),
            CheckpointError::CriOMetadata(_)
        ));
    }

    #[test]
    fn test_containerd_snapshot_with_status() {
        let status = json!({
            "Pid": 4242,
            "CreatedAt": 1_700_000_000_000_000_000i64,
            "StartedAt": 1_700_000_001_000_000_000i64,
            "FinishedAt": 0,
            "ExitCode": 0
        });
        let fx = fixture(&[
            ("config.dump", config_dump()),
            (
                "spec.dump",
                spec_dump(json!({
                    "io.kubernetes.cri.container-name": "redis",
                    "io.kubernetes.cri.sandbox-namespace": "cache",
                    "io.kubernetes.cri.sandbox-name": "redis-0"
                })),
            ),
            ("status", status.to_string()),
        ]);
        let snap = fx.load().unwrap();
        assert_eq!(snap.engine, Engine::Containerd);
        assert_eq!(snap.name, "redis");
        assert_eq!(snap.namespace, "cache");
        assert_eq!(snap.pod, "redis-0");
        // Creation time comes from the config document, not the status file.
        assert_eq!(snap.created, "2024-03-01T10:00:00Z");
        let status = snap.status.unwrap();
        assert_eq!(status.pid, Some(4242));
        assert_eq!(status.started_at.as_deref(), Some("2023-11-14T22:13:21Z"));
        assert_eq!(status.finished_at, None);
    }

    #[test]
    fn test_containerd_without_status() {
        let fx = fixture(&[
            ("config.dump", config_dump()),
            (
                "spec.dump",
                spec_dump(json!({"io.kubernetes.cri.container-name": "redis"})),
            ),
        ]);
        let snap = fx.load().unwrap();
        assert_eq!(snap.name, "redis");
        assert!(snap.status.is_none());
    }

    #[test]
    fn test_unnamed_containerd_checkpoint_loads() {
        for annotations in [json!({}), json!({"io.container.manager": "lxd"})] {
            let fx = fixture(&[
                ("config.dump", json!({"id": "c0ffee"}).to_string()),
                ("spec.dump", spec_dump(annotations)),
            ]);
            let snap = fx.load().unwrap();
            assert_eq!(snap.engine, Engine::Containerd);
            assert_eq!(snap.container_id, "c0ffee");
            assert_eq!(snap.name, "");
            assert_eq!(snap.display_name(), "Container");
            assert!(snap.status.is_none());
        }
    }

    #[test]
    fn test_network_status_read_from_archive_below_dir() {
        let network = json!({
            "podman": {"interfaces": {"eth0": {"subnets": [{"ipnet": "10.88.0.4/16"}]}}}
        });
        let fx = fixture(&[
            ("config.dump", config_dump()),
            ("spec.dump", spec_dump(json!({"io.container.manager": "libpod"}))),
            ("network.status", network.to_string()),
        ]);
        let extracted = fx.dir.path().join("extracted");
        std::fs::remove_file(extracted.join("network.status")).unwrap();

        let snap = fx.load().unwrap();
        assert_eq!(snap.network.ip, "10.88.0.4/16");
        // The staging directory below `extracted` is gone again.
        let mut left: Vec<String> = std::fs::read_dir(&extracted)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        left.sort();
        assert_eq!(left, ["config.dump", "spec.dump"]);
    }

    #[test]
    fn test_missing_and_malformed_documents() {
        let fx = fixture(&[("spec.dump", spec_dump(json!({})))]);
        match fx.load().unwrap_err() {
            CheckpointError::ConfigDump { source, .. } => assert!(source.is_missing()),
            other => panic!("unexpected error {other}"),
        }

        let fx = fixture(&[
            ("config.dump", config_dump()),
            ("spec.dump", "{\"annotations\": ".to_string()),
        ]);
        match fx.load().unwrap_err() {
            CheckpointError::SpecDump { source, .. } => assert!(!source.is_missing()),
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn test_display_name_fallback() {
        let fx = fixture(&[
            ("config.dump", json!({"id": "x"}).to_string()),
            ("spec.dump", spec_dump(json!({"io.container.manager": "libpod"}))),
        ]);
        let snap = fx.load().unwrap();
        assert_eq!(snap.name, "");
        assert_eq!(snap.display_name(), "Container");
    }

    #[test]
    fn test_snapshot_serializes_engine_names() {
        let fx = fixture(&[
            ("config.dump", config_dump()),
            ("spec.dump", spec_dump(json!({"io.container.manager": "libpod"}))),
        ]);
        let value = serde_json::to_value(fx.load().unwrap()).unwrap();
        assert_eq!(value["engine"], "Podman");
        assert_eq!(value["sizes"]["memory_pages_size"], 100);
        assert!(value.get("status").is_none());
    }
}
