//! Process memory recorded in CRIU page images.
//!
//! CRIU stores the dumped pages of a process in `pages-<id>.img`, a plain
//! concatenation of pages. `pagemap-<pid>.img` names that pages image and
//! lists runs of `nr_pages` pages starting at `vaddr`; the runs present in
//! the pages image are stored in pagemap order. `mm-<pid>.img` carries the
//! address ranges of the argument and environment blocks and the VMAs.
//!
//! [`MemoryReader`] turns a virtual address range into bytes of the pages
//! image without loading the image as a whole.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;

/// Page size assumed for images taken on x86-64 and most arm64 hosts.
pub const DEFAULT_PAGE_SIZE: u64 = 4096;

/// Bytes per hexdump row.
const ROW_BYTES: usize = 16;

/// One run of pages from a pagemap image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PageRun {
    pub vaddr: u64,
    pub nr_pages: u64,
    /// Whether the pages are stored in this checkpoint's pages image.
    /// Pages left in a parent checkpoint or served lazily are not.
    pub in_image: bool,
}

/// A decoded pagemap image.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Pagemap {
    /// `<id>` of the `pages-<id>.img` holding the page contents.
    pub pages_id: u64,
    pub runs: Vec<PageRun>,
}

impl Pagemap {
    /// File name of the pages image.
    pub fn pages_file(&self) -> String {
        format!("pages-{}.img", self.pages_id)
    }

    /// Bytes of memory the pagemap covers, stored or not.
    pub fn memory_size(&self, page_size: u64) -> u64 {
        self.runs.iter().map(|run| run.nr_pages * page_size).sum()
    }
}

/// One virtual memory area.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Vma {
    pub start: u64,
    pub end: u64,
    pub shared: bool,
}

impl Vma {
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Address layout of a process from its mm image.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MemoryLayout {
    pub arg_start: u64,
    pub arg_end: u64,
    pub env_start: u64,
    pub env_end: u64,
    pub vmas: Vec<Vma>,
}

impl MemoryLayout {
    /// Total size of the VMAs mapped `MAP_SHARED`.
    pub fn shared_size(&self) -> u64 {
        self.vmas.iter().filter(|vma| vma.shared).map(Vma::len).sum()
    }
}

/// A stored run: `len` bytes at `vaddr`, found at `offset` in the pages image.
#[derive(Debug, Clone, Copy)]
struct StoredRun {
    vaddr: u64,
    len: u64,
    offset: u64,
}

/// Reads process memory from a pages image.
#[derive(Debug, Clone)]
pub struct MemoryReader {
    pages: PathBuf,
    runs: Vec<StoredRun>,
}

impl MemoryReader {
    /// Reader over `pages`, laid out as described by `pagemap`.
    pub fn new(pages: impl Into<PathBuf>, pagemap: &Pagemap, page_size: u64) -> Self {
        let mut offset = 0;
        let mut runs = Vec::with_capacity(pagemap.runs.len());
        for run in pagemap.runs.iter().filter(|run| run.in_image) {
            let len = run.nr_pages * page_size;
            runs.push(StoredRun {
                vaddr: run.vaddr,
                len,
                offset,
            });
            offset += len;
        }
        Self {
            pages: pages.into(),
            runs,
        }
    }

    /// Path of the pages image.
    pub fn pages_path(&self) -> &Path {
        &self.pages
    }

    /// Address ranges stored in the image, as `(vaddr, len)`.
    pub fn regions(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.runs.iter().map(|run| (run.vaddr, run.len))
    }

    /// Read the bytes of `[start, end)`.
    ///
    /// The range may span several runs but every byte of it must have been
    /// dumped into the pages image.
    pub fn read(&self, start: u64, end: u64) -> io::Result<Vec<u8>> {
        if end < start {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("empty address range {start:#x}..{end:#x}"),
            ));
        }
        let mut file = File::open(&self.pages)?;
        let mut buf = Vec::with_capacity((end - start) as usize);
        let mut addr = start;
        while addr < end {
            let run = self
                .runs
                .iter()
                .find(|run| run.vaddr <= addr && addr < run.vaddr + run.len)
                .ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::NotFound,
                        format!("address {addr:#x} is not in {}", self.pages.display()),
                    )
                })?;
            let chunk_end = end.min(run.vaddr + run.len);
            file.seek(SeekFrom::Start(run.offset + (addr - run.vaddr)))?;
            let mut chunk = (&mut file).take(chunk_end - addr);
            let read = chunk.read_to_end(&mut buf)? as u64;
            if read != chunk_end - addr {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("{} is shorter than its pagemap", self.pages.display()),
                ));
            }
            addr = chunk_end;
        }
        Ok(buf)
    }
}

/// Header printed above hexdump rows.
pub const HEXDUMP_HEADER: &str =
    "Address           Hexadecimal                                       ASCII            ";

/// Writes memory as 16 byte rows of address, hex and printable ASCII.
///
/// In compact mode a row identical to the one before it is replaced by a
/// single `*` line for the whole repeated stretch. The comparison carries
/// over between calls to [`HexDump::dump`], so a large region can be dumped
/// in chunks.
#[derive(Debug)]
pub struct HexDump<W> {
    out: W,
    compact: bool,
    previous: Option<Vec<u8>>,
    collapsed: bool,
}

impl<W: Write> HexDump<W> {
    pub fn new(out: W, compact: bool) -> Self {
        Self {
            out,
            compact,
            previous: None,
            collapsed: false,
        }
    }

    /// Column header and separator line.
    pub fn header(&mut self) -> io::Result<()> {
        writeln!(self.out, "{HEXDUMP_HEADER}")?;
        writeln!(self.out, "{}", "-".repeat(85))
    }

    /// Dump `data`, which starts at address `vaddr`.
    pub fn dump(&mut self, vaddr: u64, data: &[u8]) -> io::Result<()> {
        for (i, row) in data.chunks(ROW_BYTES).enumerate() {
            if self.compact && self.previous.as_deref() == Some(row) {
                if !self.collapsed {
                    writeln!(self.out, "*")?;
                    self.collapsed = true;
                }
                continue;
            }
            self.previous = Some(row.to_vec());
            self.collapsed = false;

            let mut hex = String::with_capacity(ROW_BYTES * 3);
            let mut ascii = String::with_capacity(ROW_BYTES);
            for (j, byte) in row.iter().enumerate() {
                if j > 0 {
                    hex.push(' ');
                }
                hex.push_str(&format!("{byte:02x}"));
                ascii.push(if byte.is_ascii_graphic() || *byte == b' ' {
                    *byte as char
                } else {
                    '.'
                });
            }
            let addr = vaddr + (i * ROW_BYTES) as u64;
            writeln!(self.out, "{addr:016x}  {hex:<47}  |{ascii:<16}|")?;
        }
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}
