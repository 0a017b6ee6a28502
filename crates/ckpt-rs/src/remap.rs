//! Rewriting the TCP listen ports of a checkpoint.
//!
//! A process restored from a checkpoint binds its listening sockets to the
//! ports recorded in `checkpoint/files.img`. [`remap_archive`] changes those
//! ports in place: the image is decoded with `crit`, matching TCP listen
//! sockets get their new source port, and the re-encoded image replaces the
//! old one in the archive.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Serialize;
use serde_json::Value;

use crate::crit::{CritExplorer, FD_TYPES, FILES_IMAGE, IP_PROTOCOLS, SOCKET_STATES, SOCKET_TYPES, Symbol};
use crate::error::{CheckpointError, Result};
use crate::metadata::CHECKPOINT_DIRECTORY;
use crate::task::{ExtractionTask, RequiredFiles};

/// Old port to new port.
pub type PortMappings = BTreeMap<u32, u32>;

/// One socket whose port was rewritten.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RemappedPort {
    /// `files.img` ID of the socket.
    pub file_id: u64,
    pub old_port: u32,
    pub new_port: u32,
}

/// Parse `old:new[,old:new...]`.
///
/// Empty items are skipped; ports must be in `1..=65535`.
pub fn parse_port_mappings(spec: &str) -> Result<PortMappings> {
    let mut mappings = PortMappings::new();
    for item in spec.split(',').map(str::trim).filter(|item| !item.is_empty()) {
        let invalid = || CheckpointError::PortMapping(item.to_string());
        let (old, new) = item.split_once(':').ok_or_else(invalid)?;
        let port = |text: &str| -> Result<u32> {
            text.trim()
                .parse::<u16>()
                .ok()
                .filter(|&port| port != 0)
                .map(u32::from)
                .ok_or_else(invalid)
        };
        mappings.insert(port(old)?, port(new)?);
    }
    if mappings.is_empty() {
        return Err(CheckpointError::PortMapping(spec.to_string()));
    }
    Ok(mappings)
}

/// Apply `mappings` to the TCP listen sockets of a decoded `files.img`.
///
/// Only `INETSK` entries of protocol TCP, type `STREAM` and state `LISTEN`
/// are touched. Everything else in the document is left as decoded.
pub fn remap_listen_ports(document: &mut Value, mappings: &PortMappings) -> Vec<RemappedPort> {
    let mut remapped = Vec::new();
    let Some(entries) = document.get_mut("entries").and_then(Value::as_array_mut) else {
        return remapped;
    };

    for entry in entries {
        if symbol(entry.get("type"), FD_TYPES).as_deref() != Some("INETSK") {
            continue;
        }
        let file_id = entry.get("id").and_then(Value::as_u64).unwrap_or_default();
        let Some(isk) = entry.get_mut("isk").and_then(Value::as_object_mut) else {
            continue;
        };
        let is_tcp_listener = symbol(isk.get("proto"), IP_PROTOCOLS).as_deref() == Some("TCP")
            && symbol(isk.get("type"), SOCKET_TYPES).as_deref() == Some("STREAM")
            && symbol(isk.get("state"), SOCKET_STATES).as_deref() == Some("LISTEN");
        if !is_tcp_listener {
            continue;
        }

        let old_port = isk.get("src_port").and_then(Value::as_u64).unwrap_or_default() as u32;
        if let Some(&new_port) = mappings.get(&old_port) {
            isk.insert("src_port".to_string(), Value::from(new_port));
            tracing::debug!(file_id, old_port, new_port, "remapped listen socket");
            remapped.push(RemappedPort {
                file_id,
                old_port,
                new_port,
            });
        }
    }
    remapped
}

fn symbol(value: Option<&Value>, table: &[(u64, &str)]) -> Option<String> {
    let symbol: Symbol = serde_json::from_value(value?.clone()).ok()?;
    Some(symbol.name(table))
}

/// Remap the TCP listen ports of the checkpoint archive at `archive_path`.
///
/// `files.img` is extracted below `scratch_parent` (or the system temporary
/// directory). When no socket matches, the archive is left untouched.
/// Otherwise it is rewritten with [`ArchiveReader::replace_entry`].
///
/// [`ArchiveReader::replace_entry`]: crate::archive::ArchiveReader::replace_entry
pub fn remap_archive(
    archive_path: &Path,
    crit_binary: &Path,
    mappings: &PortMappings,
    scratch_parent: Option<&Path>,
) -> Result<Vec<RemappedPort>> {
    let entry = format!("{CHECKPOINT_DIRECTORY}/{FILES_IMAGE}");
    let mut required = RequiredFiles::default();
    required.push(entry.clone());
    let task = ExtractionTask::create(archive_path, &required, scratch_parent)?;

    let image = task.checkpoint_dir().join(FILES_IMAGE);
    if !image.is_file() {
        return Err(CheckpointError::EntryNotFound {
            path: archive_path.to_path_buf(),
            name: entry,
        });
    }

    let crit = CritExplorer::new(crit_binary, task.checkpoint_dir());
    let mut document = crit.decode_document(&image)?;
    let remapped = remap_listen_ports(&mut document, mappings);
    if remapped.is_empty() {
        tracing::info!(archive = %archive_path.display(), "no TCP listen socket matches the port mappings");
        return Ok(remapped);
    }

    let encoded = task.scratch_dir().join("files-remapped.img");
    crit.encode_document(&document, &encoded)?;
    task.archive().replace_entry(&entry, &encoded)?;
    tracing::info!(archive = %archive_path.display(), sockets = remapped.len(), "remapped TCP listen ports");
    Ok(remapped)
}
