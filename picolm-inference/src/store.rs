use anyhow::{Context, Result};
use log::{debug, warn};
use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::PathBuf;

/// Upper bound on journaled page entries.
pub const MAX_PAGES: usize = 1024;

/// Named-object storage a [`PageStore`] can page from. Anything that can open
/// itself, report object sizes, and copy object bytes into a caller buffer is
/// substitutable here.
pub trait PageMedium {
    /// Initializes the medium. Fails when the device is not ready.
    fn open(&mut self) -> Result<()>;

    /// Size in bytes of a named object. Fails when the object is missing.
    fn object_size(&mut self, name: &str) -> Result<usize>;

    /// Copies up to `buf.len()` bytes of the named object into `buf`,
    /// returning the count actually copied. A short count is not an error.
    /// Fails when the object is missing.
    fn read_into(&mut self, name: &str, buf: &mut [u8]) -> Result<usize>;
}

/// Filesystem-backed medium: named objects are files inside a root directory.
#[derive(Debug)]
pub struct DirMedium {
    root: PathBuf,
}

impl DirMedium {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl PageMedium for DirMedium {
    fn open(&mut self) -> Result<()> {
        if !self.root.is_dir() {
            anyhow::bail!("storage root {} is not a directory", self.root.display());
        }
        Ok(())
    }

    fn object_size(&mut self, name: &str) -> Result<usize> {
        let meta = std::fs::metadata(self.root.join(name))
            .with_context(|| format!("no such object: {name}"))?;
        Ok(meta.len() as usize)
    }

    fn read_into(&mut self, name: &str, buf: &mut [u8]) -> Result<usize> {
        let mut file = File::open(self.root.join(name))
            .with_context(|| format!("no such object: {name}"))?;
        let mut filled = 0;
        while filled < buf.len() {
            let n = file.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }
}

/// In-memory medium, mainly for tests and hosts without a filesystem.
#[derive(Debug, Default)]
pub struct MemMedium {
    objects: HashMap<String, Vec<u8>>,
}

impl MemMedium {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, bytes: Vec<u8>) {
        self.objects.insert(name.into(), bytes);
    }
}

impl PageMedium for MemMedium {
    fn open(&mut self) -> Result<()> {
        Ok(())
    }

    fn object_size(&mut self, name: &str) -> Result<usize> {
        self.objects
            .get(name)
            .map(Vec::len)
            .with_context(|| format!("no such object: {name}"))
    }

    fn read_into(&mut self, name: &str, buf: &mut [u8]) -> Result<usize> {
        let bytes = self
            .objects
            .get(name)
            .with_context(|| format!("no such object: {name}"))?;
        let n = bytes.len().min(buf.len());
        buf[..n].copy_from_slice(&bytes[..n]);
        Ok(n)
    }
}

/// Per-page observability record consumed by the diagnostic console.
#[derive(Debug, Clone, Copy)]
pub struct PageMetadata {
    pub write_count: u16,
    pub tag: [u8; 8],
    pub hash: [u8; 20],
}

impl PageMetadata {
    const ZERO: PageMetadata = PageMetadata { write_count: 0, tag: [0; 8], hash: [0; 20] };

    /// The tag as printable text.
    pub fn tag_str(&self) -> &str {
        let end = self.tag.iter().position(|&b| b == 0).unwrap_or(self.tag.len());
        std::str::from_utf8(&self.tag[..end]).unwrap_or("?")
    }
}

/// Optional recorder the page store feeds on every page read. Purely an
/// observability side-channel: the inference path never reads it.
#[derive(Debug)]
pub struct PageJournal {
    entries: Vec<PageMetadata>,
    slots: HashMap<String, usize>,
}

impl Default for PageJournal {
    fn default() -> Self {
        Self::new()
    }
}

impl PageJournal {
    pub fn new() -> Self {
        Self { entries: vec![PageMetadata::ZERO; MAX_PAGES], slots: HashMap::new() }
    }

    pub fn entry(&self, idx: usize) -> Option<&PageMetadata> {
        self.entries.get(idx)
    }

    /// Number of distinct pages seen so far.
    pub fn pages_seen(&self) -> usize {
        self.slots.len()
    }

    fn record(&mut self, name: &str, content: &[u8]) {
        let next = self.slots.len();
        let idx = match self.slots.get(name) {
            Some(&idx) => idx,
            None if next < MAX_PAGES => {
                self.slots.insert(name.to_string(), next);
                next
            }
            None => {
                warn!("page journal full, dropping entry for {name}");
                return;
            }
        };

        let entry = &mut self.entries[idx];
        entry.write_count = entry.write_count.saturating_add(1);
        entry.tag = [0; 8];
        for (t, &b) in entry.tag.iter_mut().zip(name.as_bytes().iter()).take(7) {
            *t = b;
        }
        entry.hash = [0; 20];
        entry.hash[..8].copy_from_slice(&fnv1a64(content).to_le_bytes());
    }

    /// Zeroes every entry and forgets all page-name assignments.
    pub fn reset(&mut self) {
        self.entries.fill(PageMetadata::ZERO);
        self.slots.clear();
    }
}

fn fnv1a64(bytes: &[u8]) -> u64 {
    let mut h = 0xcbf29ce484222325u64;
    for &b in bytes {
        h ^= b as u64;
        h = h.wrapping_mul(0x100000001b3);
    }
    h
}

/// Page-granular reader over a [`PageMedium`], owning the process's one page
/// buffer.
///
/// `read_page` hands out a borrow of that buffer, so holding a page view while
/// issuing another read is a compile error: the buffer-reuse discipline the
/// storage layout demands is enforced by the borrow checker instead of call
/// convention.
#[derive(Debug)]
pub struct PageStore<M> {
    medium: M,
    page: Vec<u8>,
    journal: Option<PageJournal>,
}

impl<M: PageMedium> PageStore<M> {
    /// Opens the medium and sizes the page buffer.
    pub fn open(mut medium: M, page_size: usize) -> Result<Self> {
        medium.open().context("storage device not ready")?;
        debug!("page store open, page size {page_size}");
        Ok(Self { medium, page: vec![0; page_size], journal: None })
    }

    pub fn with_journal(mut self, journal: PageJournal) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn page_size(&self) -> usize {
        self.page.len()
    }

    /// Reads one page of the named object into the shared buffer and returns
    /// a view of it. A short object leaves the tail zero-filled, so the
    /// trailing-scale read stays deterministic. The view dies at the next
    /// read call.
    pub fn read_page(&mut self, name: &str) -> Result<&[u8]> {
        let n = self
            .medium
            .read_into(name, &mut self.page)
            .with_context(|| format!("failed to read page {name}"))?;
        self.page[n..].fill(0);

        if let Some(journal) = &mut self.journal {
            journal.record(name, &self.page);
        }
        Ok(&self.page)
    }

    /// Reads an entire object into a fresh buffer, bypassing the page buffer.
    /// Used for the manifest, which is the one object read whole.
    pub fn read_whole(&mut self, name: &str) -> Result<Vec<u8>> {
        let size = self.medium.object_size(name)?;
        let mut buf = vec![0; size];
        let n = self.medium.read_into(name, &mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }

    pub fn journal(&self) -> Option<&PageJournal> {
        self.journal.as_ref()
    }

    pub fn journal_mut(&mut self) -> Option<&mut PageJournal> {
        self.journal.as_mut()
    }

    /// Placeholder for media that persist page metadata; nothing to flush for
    /// the in-tree media.
    pub fn sync_metadata(&mut self) {}
}
