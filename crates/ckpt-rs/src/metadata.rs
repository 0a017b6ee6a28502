//! Checkpoint metadata documents.
//!
//! A container checkpoint archive carries a handful of small JSON documents
//! next to the CRIU images:
//!
//! - `config.dump`: the engine's container configuration (ID, name, image,
//!   OCI runtime, creation and checkpoint times)
//! - `spec.dump`: the OCI runtime spec of the container, whose annotations
//!   identify the managing engine
//! - `status`: containerd's status record (optional)
//! - `network.status`: Podman's network status (optional)
//!
//! This module defines the fixed names of those documents and the serde types
//! they deserialize into. Only the fields the snapshot model needs are
//! declared; everything else in the documents is ignored.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use chrono::{DateTime, Datelike, TimeZone, Utc};
use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::error::{CheckpointError, DocumentError, Result};

/// Directory holding the CRIU images inside the archive.
pub const CHECKPOINT_DIRECTORY: &str = "checkpoint";
/// Container configuration written by the engine.
pub const CONFIG_DUMP_FILE: &str = "config.dump";
/// OCI runtime spec of the checkpointed container.
pub const SPEC_DUMP_FILE: &str = "spec.dump";
/// containerd status record.
pub const STATUS_FILE: &str = "status";
/// Podman network status.
pub const NETWORK_STATUS_FILE: &str = "network.status";
/// Tarball holding the changes to the container root filesystem.
pub const ROOTFS_DIFF_TAR: &str = "rootfs-diff.tar";
/// CRIU dump statistics.
pub const STATS_DUMP_FILE: &str = "stats-dump";
/// Prefix of CRIU memory page images.
pub const PAGES_PREFIX: &str = "pages-";
/// Prefix of AMD GPU memory page images.
pub const AMDGPU_PAGES_PREFIX: &str = "amdgpu-pages-";

/// Annotation naming the engine that manages the container.
pub const ANNOTATION_MANAGER: &str = "io.container.manager";
/// CRI-O: nested JSON with the container name and attempt.
pub const ANNOTATION_CRIO_METADATA: &str = "io.kubernetes.cri-o.Metadata";
/// CRI-O: first container IP.
pub const ANNOTATION_CRIO_IP: &str = "io.kubernetes.cri-o.IP.0";
/// CRI-O: container creation time.
pub const ANNOTATION_CRIO_CREATED: &str = "io.kubernetes.cri-o.Created";
/// Kubernetes pod namespace.
pub const ANNOTATION_POD_NAMESPACE: &str = "io.kubernetes.pod.namespace";
/// Kubernetes pod name.
pub const ANNOTATION_POD_NAME: &str = "io.kubernetes.pod.name";
/// containerd (CRI plugin): container name.
pub const ANNOTATION_CRI_CONTAINER_NAME: &str = "io.kubernetes.cri.container-name";
/// containerd (CRI plugin): sandbox namespace.
pub const ANNOTATION_CRI_SANDBOX_NAMESPACE: &str = "io.kubernetes.cri.sandbox-namespace";
/// containerd (CRI plugin): sandbox name.
pub const ANNOTATION_CRI_SANDBOX_NAME: &str = "io.kubernetes.cri.sandbox-name";

/// Reduced copy of the container configuration engines store at checkpoint time.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerConfig {
    /// Full container ID.
    #[serde(default)]
    pub id: String,

    /// Container name as known to the engine.
    #[serde(default)]
    pub name: String,

    /// Image the container root filesystem was created from.
    #[serde(default)]
    pub rootfs_image_name: String,

    /// OCI runtime (e.g. `runc`, `crun`).
    #[serde(default, rename = "runtime")]
    pub oci_runtime: String,

    /// Container creation time.
    #[serde(default, deserialize_with = "de_optional_time")]
    pub created_time: Option<DateTime<Utc>>,

    /// Time the checkpoint was taken.
    #[serde(default, deserialize_with = "de_optional_time")]
    pub checkpointed_time: Option<DateTime<Utc>>,
}

/// The parts of the OCI runtime spec we look at.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SpecDump {
    /// Free-form annotations set by the engine.
    #[serde(default)]
    pub annotations: HashMap<String, String>,

    /// Mounts configured for the container.
    #[serde(default)]
    pub mounts: Vec<SpecMount>,
}

impl SpecDump {
    /// Look up an annotation, treating a missing key as empty.
    pub fn annotation(&self, key: &str) -> &str {
        self.annotations.get(key).map(String::as_str).unwrap_or("")
    }
}

/// A single OCI mount entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, serde::Serialize)]
pub struct SpecMount {
    /// Mount point inside the container.
    pub destination: String,
    /// Filesystem type.
    #[serde(default, rename = "type")]
    pub mount_type: String,
    /// Source on the host.
    #[serde(default)]
    pub source: String,
}

/// Nested JSON stored in the CRI-O metadata annotation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CriOContainerMetadata {
    /// Container name.
    #[serde(default)]
    pub name: String,
    /// Restart attempt.
    #[serde(default)]
    pub attempt: u32,
}

/// containerd's status record. Times are Unix nanoseconds.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerdStatus {
    #[serde(default)]
    pub pid: u32,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub started_at: i64,
    #[serde(default)]
    pub finished_at: i64,
    #[serde(default)]
    pub exit_code: i32,
}

/// Podman's `network.status` document.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PodmanNetworkStatus {
    #[serde(default)]
    pub podman: PodmanNetwork,
}

/// Interfaces of the default Podman network.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PodmanNetwork {
    /// Interfaces keyed by name; ordered so the selection below is stable.
    #[serde(default)]
    pub interfaces: BTreeMap<String, PodmanInterface>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PodmanInterface {
    #[serde(default)]
    pub subnets: Vec<PodmanSubnet>,
    #[serde(default)]
    pub mac_address: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PodmanSubnet {
    #[serde(default)]
    pub ipnet: String,
    #[serde(default)]
    pub gateway: String,
}

impl PodmanNetworkStatus {
    /// Parse a `network.status` document.
    pub fn from_slice(content: &[u8]) -> Result<Self> {
        serde_json::from_slice(content).map_err(CheckpointError::NetworkStatus)
    }

    /// IP (in CIDR form) and MAC of the first interface that has a subnet.
    ///
    /// Containers almost always have a single interface (`eth0`).
    pub fn primary_address(&self) -> Option<(String, String)> {
        self.podman
            .interfaces
            .values()
            .find_map(|iface| {
                iface
                    .subnets
                    .first()
                    .map(|subnet| (subnet.ipnet.clone(), iface.mac_address.clone()))
            })
    }
}

/// Read `config.dump` from an extracted checkpoint directory.
pub fn read_config_dump(dir: &Path) -> Result<ContainerConfig> {
    let path = dir.join(CONFIG_DUMP_FILE);
    read_document(&path).map_err(|source| CheckpointError::ConfigDump { path, source })
}

/// Read `spec.dump` from an extracted checkpoint directory.
pub fn read_spec_dump(dir: &Path) -> Result<SpecDump> {
    let path = dir.join(SPEC_DUMP_FILE);
    read_document(&path).map_err(|source| CheckpointError::SpecDump { path, source })
}

/// Read containerd's `status` file if it was extracted.
pub fn read_status_file(dir: &Path) -> Result<Option<ContainerdStatus>> {
    let path = dir.join(STATUS_FILE);
    match read_document(&path) {
        Ok(status) => Ok(Some(status)),
        Err(DocumentError::Missing) => Ok(None),
        Err(DocumentError::Unreadable(e)) => Err(CheckpointError::Io(e)),
        Err(DocumentError::Malformed(source)) => Err(CheckpointError::StatusFile { path, source }),
    }
}

fn read_document<T: DeserializeOwned>(path: &Path) -> std::result::Result<T, DocumentError> {
    let content = match std::fs::read(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(DocumentError::Missing),
        Err(e) => return Err(DocumentError::Unreadable(e)),
    };
    serde_json::from_slice(&content).map_err(DocumentError::Malformed)
}

/// Go's zero time (`0001-01-01T00:00:00Z`) means "not set".
fn de_optional_time<'de, D>(deserializer: D) -> std::result::Result<Option<DateTime<Utc>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value: Option<DateTime<Utc>> = Option::deserialize(deserializer)?;
    Ok(value.filter(|t| t.year() > 1))
}

/// Convert Unix nanoseconds into a timestamp; zero means unset.
pub fn unix_nanos(nanos: i64) -> Option<DateTime<Utc>> {
    if nanos == 0 {
        return None;
    }
    Some(Utc.timestamp_nanos(nanos))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_config_dump_parses_podman_document() {
        let json = r#"{
            "id": "2d0f4c0a31e5b9f7a0e4d6c2b8a91e3f7c5d2b0a4e6f8c1d3b5a7e9f0c2d4e6a",
            "name": "web",
            "rootfsImageName": "docker.io/library/nginx:latest",
            "runtime": "crun",
            "createdTime": "2024-03-01T10:00:00.123456789+01:00",
            "checkpointedTime": "0001-01-01T00:00:00Z",
            "unrelated": {"field": true}
        }"#;
        let config: ContainerConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.name, "web");
        assert_eq!(config.oci_runtime, "crun");
        assert_eq!(config.rootfs_image_name, "docker.io/library/nginx:latest");
        let created = config.created_time.unwrap();
        assert_eq!(created.to_rfc3339(), "2024-03-01T09:00:00.123456789+00:00");
        assert!(config.checkpointed_time.is_none());
    }

    #[test]
    fn test_read_config_dump_missing_vs_malformed() {
        let dir = TempDir::new().unwrap();
        let err = read_config_dump(dir.path()).unwrap_err();
        assert!(matches!(
            err,
            CheckpointError::ConfigDump { source: DocumentError::Missing, .. }
        ));

        std::fs::write(dir.path().join(CONFIG_DUMP_FILE), b"{\"id\": \"abc\"").unwrap();
        let err = read_config_dump(dir.path()).unwrap_err();
        assert!(matches!(
            err,
            CheckpointError::ConfigDump { source: DocumentError::Malformed(_), .. }
        ));
    }

    #[test]
    fn test_read_spec_dump_annotations_and_mounts() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(SPEC_DUMP_FILE),
            r#"{"ociVersion": "1.0.2", "annotations": {"io.container.manager": "libpod"},
                "mounts": [{"destination": "/proc", "type": "proc", "source": "proc"}]}"#,
        )
        .unwrap();
        let spec = read_spec_dump(dir.path()).unwrap();
        assert_eq!(spec.annotation(ANNOTATION_MANAGER), "libpod");
        assert_eq!(spec.annotation("missing"), "");
        assert_eq!(spec.mounts.len(), 1);
        assert_eq!(spec.mounts[0].mount_type, "proc");
    }

    #[test]
    fn test_read_spec_dump_missing_is_spec_error() {
        let dir = TempDir::new().unwrap();
        let err = read_spec_dump(dir.path()).unwrap_err();
        assert!(matches!(err, CheckpointError::SpecDump { .. }));
    }

    #[test]
    fn test_status_file_optional() {
        let dir = TempDir::new().unwrap();
        assert!(read_status_file(dir.path()).unwrap().is_none());

        std::fs::write(
            dir.path().join(STATUS_FILE),
            r#"{"Pid": 4242, "CreatedAt": 1700000000000000000, "StartedAt": 1700000001000000000, "ExitCode": 0}"#,
        )
        .unwrap();
        let status = read_status_file(dir.path()).unwrap().unwrap();
        assert_eq!(status.pid, 4242);
        assert_eq!(
            unix_nanos(status.started_at).unwrap().to_rfc3339(),
            "2023-11-14T22:13:21+00:00"
        );
        assert!(unix_nanos(status.finished_at).is_none());
    }

    #[test]
    fn test_podman_network_status() {
        let json = br#"{
            "podman": {
                "interfaces": {
                    "eth0": {
                        "subnets": [{"ipnet": "10.88.0.9/16", "gateway": "10.88.0.1"}],
                        "mac_address": "f2:99:8d:fb:5a:57"
                    }
                }
            }
        }"#;
        let status = PodmanNetworkStatus::from_slice(json).unwrap();
        assert_eq!(
            status.primary_address(),
            Some(("10.88.0.9/16".to_string(), "f2:99:8d:fb:5a:57".to_string()))
        );

        let empty = PodmanNetworkStatus::from_slice(b"{}").unwrap();
        assert_eq!(empty.primary_address(), None);

        let err = PodmanNetworkStatus::from_slice(b"invalid json").unwrap_err();
        assert!(matches!(err, CheckpointError::NetworkStatus(_)));
    }

    #[test]
    fn test_crio_metadata_annotation() {
        let meta: CriOContainerMetadata =
            serde_json::from_str(r#"{"name": "counter", "attempt": 2}"#).unwrap();
        assert_eq!(meta.name, "counter");
        assert_eq!(meta.attempt, 2);
    }
}
