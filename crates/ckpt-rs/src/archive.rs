//! Streaming access to checkpoint archives.
//!
//! A checkpoint archive is a tar file, optionally compressed with gzip or
//! zstd, that holds the CRIU images under `checkpoint/` plus a few metadata
//! documents at the top level. Archives can be many gigabytes large because of
//! the memory page images, so nothing here ever materializes the whole archive:
//!
//! - [`ArchiveReader::for_each_entry`] streams entries in archive order
//! - [`ArchiveReader::has_entry_matching`] and [`ArchiveReader::size_breakdown`]
//!   only look at tar headers; entry payloads are skipped, never copied out
//! - [`ArchiveReader::extract`] writes only entries whose name contains one of
//!   the requested names, one read chunk at a time
//! - [`ArchiveReader::replace_entry`] streams the archive into a rewritten
//!   copy with one entry swapped out
//!
//! # Example
//!
//! ```no_run
//! use ckpt_rs::archive::ArchiveReader;
//!
//! let archive = ArchiveReader::open("/tmp/checkpoint.tar.gz")?;
//! let sizes = archive.size_breakdown()?;
//! println!("memory pages: {} bytes", sizes.memory_pages_size);
//!
//! let dest = tempfile::TempDir::new()?;
//! let stats = archive.extract(dest.path(), &["spec.dump", "config.dump"])?;
//! println!("extracted {} files", stats.files_extracted);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::ops::ControlFlow;
use std::path::{Component, Path, PathBuf};

use cap_std::ambient_authority;
use cap_std::fs::Dir;
use flate2::read::MultiGzDecoder;
use serde::Serialize;
use tar::EntryType;

use crate::error::{CheckpointError, Result};
use crate::metadata::{AMDGPU_PAGES_PREFIX, CHECKPOINT_DIRECTORY, PAGES_PREFIX, ROOTFS_DIFF_TAR};

/// gzip magic bytes.
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// zstd frame magic bytes.
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

/// bzip2 magic bytes.
const BZIP2_MAGIC: [u8; 3] = *b"BZh";

/// xz magic bytes.
const XZ_MAGIC: [u8; 6] = [0xfd, b'7', b'z', b'X', b'Z', 0x00];

/// Compression of an archive stream, detected from its first bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    /// Plain tar.
    None,
    /// gzip (possibly multi-member).
    Gzip,
    /// zstd.
    Zstd,
}

impl Compression {
    /// Detect the compression from the leading bytes of a stream.
    ///
    /// Returns the name of the format for compressions that are recognised
    /// but not supported. Anything unrecognised is assumed to be plain tar;
    /// the tar reader reports garbage when it reads the first header.
    pub fn detect(magic: &[u8]) -> std::result::Result<Self, &'static str> {
        if magic.starts_with(&GZIP_MAGIC) {
            Ok(Compression::Gzip)
        } else if magic.starts_with(&ZSTD_MAGIC) {
            Ok(Compression::Zstd)
        } else if magic.starts_with(&BZIP2_MAGIC) {
            Err("bzip2")
        } else if magic.starts_with(&XZ_MAGIC) {
            Err("xz")
        } else {
            Ok(Compression::None)
        }
    }
}

/// Header information of one archive entry.
#[derive(Debug, Clone)]
pub struct ArchiveEntry {
    /// Entry name with any leading `./` removed.
    pub name: String,
    /// Tar entry type.
    pub entry_type: EntryType,
    /// Payload size in bytes as recorded in the header.
    pub size: u64,
}

impl ArchiveEntry {
    /// Whether this is a directory entry.
    pub fn is_dir(&self) -> bool {
        self.entry_type.is_dir()
    }

    /// Whether this is a regular file.
    pub fn is_file(&self) -> bool {
        matches!(self.entry_type, EntryType::Regular | EntryType::Continuous)
    }

    /// Whether the (normalized) name starts with `prefix`.
    pub fn has_prefix(&self, prefix: &str) -> bool {
        self.name.starts_with(prefix)
    }
}

/// Strip a leading `./` from an archive name.
pub fn normalize_name(name: &str) -> &str {
    name.strip_prefix("./").unwrap_or(name)
}

/// Format a byte count with binary units.
///
/// # Examples
///
/// ```
/// use ckpt_rs::archive::format_size;
///
/// assert_eq!(format_size(512), "512 B");
/// assert_eq!(format_size(1536), "1.5 KiB");
/// ```
pub fn format_size(bytes: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = 1024 * KIB;
    const GIB: u64 = 1024 * MIB;

    if bytes >= GIB {
        format!("{:.1} GiB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.1} MiB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.1} KiB", bytes as f64 / KIB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Sizes of the interesting parts of a checkpoint archive, in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ArchiveSizes {
    /// All regular files below `checkpoint/`.
    #[serde(rename = "total_size")]
    pub checkpoint_size: u64,
    /// CRIU memory page images (`checkpoint/pages-*`).
    pub memory_pages_size: u64,
    /// AMD GPU memory page images (`checkpoint/amdgpu-pages-*`).
    #[serde(rename = "amd_gpu_memory_pages_size")]
    pub gpu_memory_pages_size: u64,
    /// Size of the `rootfs-diff.tar` entry itself.
    #[serde(rename = "root_fs_diff_size")]
    pub rootfs_diff_size: u64,
}

impl ArchiveSizes {
    /// Account one archive entry. Non-regular entries are ignored.
    pub fn add(&mut self, entry: &ArchiveEntry) {
        if !entry.is_file() {
            return;
        }
        let checkpoint_prefix = format!("{CHECKPOINT_DIRECTORY}/");
        if entry.has_prefix(&checkpoint_prefix) {
            self.checkpoint_size += entry.size;
            let rest = &entry.name[checkpoint_prefix.len()..];
            if rest.starts_with(PAGES_PREFIX) {
                self.memory_pages_size += entry.size;
            } else if rest.starts_with(AMDGPU_PAGES_PREFIX) {
                self.gpu_memory_pages_size += entry.size;
            }
        } else if entry.has_prefix(ROOTFS_DIFF_TAR) {
            self.rootfs_diff_size = entry.size;
        }
    }
}

/// Statistics from a selective extraction.
#[derive(Debug, Clone, Default)]
pub struct ExtractionStats {
    /// Entries seen in the archive.
    pub entries_scanned: usize,
    /// Regular files written.
    pub files_extracted: usize,
    /// Directories created for matching directory entries.
    pub directories_created: usize,
    /// Matching entries that are neither files nor directories.
    pub entries_skipped: usize,
    /// Payload bytes written.
    pub bytes_written: u64,
}

/// Reader for one checkpoint archive on disk.
///
/// Every operation reopens the file and streams it from the start, so a
/// reader can be shared freely and holds no file descriptor between calls.
#[derive(Debug, Clone)]
pub struct ArchiveReader {
    path: PathBuf,
}

impl ArchiveReader {
    /// Create a reader for the archive at `path`.
    ///
    /// Fails if the path does not exist or is not a regular file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let meta = std::fs::metadata(&path).map_err(|source| CheckpointError::ArchiveOpen {
            path: path.clone(),
            source,
        })?;
        if !meta.is_file() {
            return Err(CheckpointError::NotRegularFile(path));
        }
        Ok(Self { path })
    }

    /// Path of the archive.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open the archive and strip its compression.
    fn decompressed(&self) -> Result<Box<dyn Read>> {
        Ok(self.open_stream()?.1)
    }

    fn open_stream(&self) -> Result<(Compression, Box<dyn Read>)> {
        let file = File::open(&self.path).map_err(|source| CheckpointError::ArchiveOpen {
            path: self.path.clone(),
            source,
        })?;
        let mut reader = BufReader::new(file);
        let magic = reader
            .fill_buf()
            .map_err(|e| CheckpointError::extraction(&self.path, e))?;

        let compression =
            Compression::detect(magic).map_err(|format| CheckpointError::UnsupportedCompression {
                path: self.path.clone(),
                format,
            })?;
        tracing::trace!(path = %self.path.display(), ?compression, "opened archive");

        let stream: Box<dyn Read> = match compression {
            Compression::None => Box::new(reader),
            Compression::Gzip => Box::new(MultiGzDecoder::new(reader)),
            Compression::Zstd => Box::new(
                zstd::stream::read::Decoder::with_buffer(reader)
                    .map_err(|e| CheckpointError::extraction(&self.path, e))?,
            ),
        };
        Ok((compression, stream))
    }

    /// Invoke `f` for every entry in archive order.
    ///
    /// The callback receives the entry header and a reader positioned at the
    /// entry payload. Payload the callback does not read is skipped when the
    /// next header is read. Returning [`ControlFlow::Break`] stops the scan.
    pub fn for_each_entry<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(&ArchiveEntry, &mut dyn Read) -> Result<ControlFlow<()>>,
    {
        let stream = self.decompressed()?;
        let mut archive = tar::Archive::new(stream);
        let entries = archive
            .entries()
            .map_err(|e| CheckpointError::extraction(&self.path, e))?;

        for entry in entries {
            let mut entry = entry.map_err(|e| CheckpointError::extraction(&self.path, e))?;
            let raw_name = entry.path_bytes();
            let name = normalize_name(&String::from_utf8_lossy(&raw_name)).to_string();
            let meta = ArchiveEntry {
                name,
                entry_type: entry.header().entry_type(),
                size: entry.size(),
            };
            if f(&meta, &mut entry)?.is_break() {
                break;
            }
        }
        Ok(())
    }

    /// Whether any entry starts with `pattern` and is of the requested kind.
    ///
    /// Used to check for the `checkpoint/` directory before anything is
    /// extracted. Matching is done on the name with `./` removed, so only
    /// top-level entries qualify.
    pub fn has_entry_matching(&self, pattern: &str, expect_directory: bool) -> Result<bool> {
        let mut found = false;
        self.for_each_entry(|entry, _| {
            if entry.has_prefix(pattern) && entry.is_dir() == expect_directory {
                found = true;
                return Ok(ControlFlow::Break(()));
            }
            Ok(ControlFlow::Continue(()))
        })?;
        Ok(found)
    }

    /// Compute the size breakdown of the archive from its headers alone.
    pub fn size_breakdown(&self) -> Result<ArchiveSizes> {
        let mut sizes = ArchiveSizes::default();
        self.for_each_entry(|entry, _| {
            sizes.add(entry);
            Ok(ControlFlow::Continue(()))
        })?;
        tracing::debug!(path = %self.path.display(), ?sizes, "computed archive sizes");
        Ok(sizes)
    }

    /// Extract entries whose name contains any of `requested` into `dest`.
    ///
    /// Matching is by substring, so a short name like `checkpoint/pages-`
    /// selects the whole family `pages-1.img`, `pages-2.img`, and so on.
    /// Entries are written below `dest` under their archive-relative name.
    /// Names that would escape `dest` are rejected.
    pub fn extract<S: AsRef<str>>(&self, dest: &Path, requested: &[S]) -> Result<ExtractionStats> {
        let dir = Dir::open_ambient_dir(dest, ambient_authority())
            .map_err(|e| CheckpointError::extraction(&self.path, e))?;
        let mut stats = ExtractionStats::default();

        self.for_each_entry(|entry, payload| {
            stats.entries_scanned += 1;
            if !requested.iter().any(|r| entry.name.contains(r.as_ref())) {
                return Ok(ControlFlow::Continue(()));
            }
            self.extract_entry(&dir, entry, payload, &mut stats)
                .map_err(|e| CheckpointError::extraction(&self.path, e))?;
            Ok(ControlFlow::Continue(()))
        })?;

        tracing::debug!(
            path = %self.path.display(),
            dest = %dest.display(),
            files = stats.files_extracted,
            bytes = stats.bytes_written,
            "selective extraction finished"
        );
        Ok(stats)
    }

    fn extract_entry(
        &self,
        dir: &Dir,
        entry: &ArchiveEntry,
        payload: &mut dyn Read,
        stats: &mut ExtractionStats,
    ) -> io::Result<()> {
        let rel = validate_entry_path(&entry.name)?;
        if rel.as_os_str().is_empty() {
            return Ok(());
        }

        if entry.is_dir() {
            dir.create_dir_all(&rel)?;
            stats.directories_created += 1;
            return Ok(());
        }
        if !entry.is_file() {
            tracing::trace!(name = %entry.name, "skipping non-regular entry");
            stats.entries_skipped += 1;
            return Ok(());
        }

        if let Some(parent) = rel.parent()
            && !parent.as_os_str().is_empty()
        {
            dir.create_dir_all(parent)?;
        }
        let mut file = dir.create(&rel)?;
        let copied = io::copy(payload, &mut file)?;
        tracing::trace!(name = %entry.name, bytes = copied, "extracted entry");
        stats.files_extracted += 1;
        stats.bytes_written += copied;
        Ok(())
    }

    /// Rewrite the archive with the payload of entry `name` replaced by the
    /// contents of `replacement`.
    ///
    /// Entry order, headers and compression are kept. The new archive is
    /// written next to the original and renamed over it, so readers never see
    /// a partially written archive.
    pub fn replace_entry(&self, name: &str, replacement: &Path) -> Result<()> {
        let (compression, stream) = self.open_stream()?;
        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let staged = tempfile::Builder::new()
            .prefix(".ckpt-rs-")
            .tempfile_in(parent)
            .map_err(|e| CheckpointError::extraction(&self.path, e))?;

        let found = copy_replacing(stream, compression, staged.as_file(), name, replacement)
            .map_err(|e| CheckpointError::extraction(&self.path, e))?;
        if !found {
            return Err(CheckpointError::EntryNotFound {
                path: self.path.clone(),
                name: name.to_string(),
            });
        }

        let permissions = std::fs::metadata(&self.path)?.permissions();
        std::fs::set_permissions(staged.path(), permissions)?;
        staged
            .persist(&self.path)
            .map_err(|e| CheckpointError::extraction(&self.path, e.error))?;
        tracing::debug!(path = %self.path.display(), entry = name, ?compression, "replaced archive entry");
        Ok(())
    }
}

/// Compressing writer for a [`Compression`].
enum Encoder<W: Write> {
    Plain(W),
    Gzip(flate2::write::GzEncoder<W>),
    Zstd(zstd::stream::write::Encoder<'static, W>),
}

impl<W: Write> Encoder<W> {
    fn new(compression: Compression, inner: W) -> io::Result<Self> {
        Ok(match compression {
            Compression::None => Encoder::Plain(inner),
            Compression::Gzip => Encoder::Gzip(flate2::write::GzEncoder::new(
                inner,
                flate2::Compression::default(),
            )),
            Compression::Zstd => Encoder::Zstd(zstd::stream::write::Encoder::new(inner, 0)?),
        })
    }

    fn finish(self) -> io::Result<W> {
        match self {
            Encoder::Plain(inner) => Ok(inner),
            Encoder::Gzip(encoder) => encoder.finish(),
            Encoder::Zstd(encoder) => encoder.finish(),
        }
    }
}

impl<W: Write> Write for Encoder<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Encoder::Plain(inner) => inner.write(buf),
            Encoder::Gzip(encoder) => encoder.write(buf),
            Encoder::Zstd(encoder) => encoder.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Encoder::Plain(inner) => inner.flush(),
            Encoder::Gzip(encoder) => encoder.flush(),
            Encoder::Zstd(encoder) => encoder.flush(),
        }
    }
}

/// Copy the tar `stream` into `out`, swapping the payload of regular file
/// `name`. Returns whether `name` was found.
fn copy_replacing(
    stream: Box<dyn Read>,
    compression: Compression,
    out: &File,
    name: &str,
    replacement: &Path,
) -> io::Result<bool> {
    let mut builder = tar::Builder::new(Encoder::new(compression, BufWriter::new(out))?);
    let mut archive = tar::Archive::new(stream);
    let mut found = false;

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        let mut header = entry.header().clone();

        if !found
            && header.entry_type().is_file()
            && normalize_name(&path.to_string_lossy()) == name
        {
            let mut file = File::open(replacement)?;
            header.set_size(file.metadata()?.len());
            builder.append_data(&mut header, &path, &mut file)?;
            found = true;
        } else if let Some(target) = entry.link_name()? {
            let target = target.into_owned();
            builder.append_link(&mut header, &path, &target)?;
        } else {
            builder.append_data(&mut header, &path, &mut entry)?;
        }
    }

    builder.into_inner()?.finish()?.flush()?;
    Ok(found)
}

/// Turn an archive name into a relative path that stays below the destination.
fn validate_entry_path(name: &str) -> io::Result<PathBuf> {
    let mut rel = PathBuf::new();
    for component in Path::new(name).components() {
        match component {
            Component::Normal(part) => rel.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("archive entry {name:?} escapes the destination directory"),
                ));
            }
        }
    }
    Ok(rel)
}
