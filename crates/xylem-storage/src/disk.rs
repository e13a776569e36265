//! Backing file for page-level I/O.

use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use xylem_buffer::PageDevice;
use xylem_common::{PageHeader, PageId, PageStatus, Result, StorageConfig, XylemError};

/// Magic bytes at the start of every store file.
pub const FILE_MAGIC: [u8; 4] = *b"XYLM";

/// Current file format version.
pub const FORMAT_VERSION: u16 = 1;

/// Page holding the file header. Never handed out as a data page.
pub const HEADER_PAGE: PageId = PageId(0);

/// File header stored at the beginning of page 0.
///
/// Layout (26 bytes):
/// - magic: 4 bytes
/// - version: 2 bytes
/// - page_size: 4 bytes
/// - page_count: 4 bytes
/// - free_head: 8 bytes
/// - free_count: 4 bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    pub version: u16,
    pub page_size: u32,
    /// Pages in the file, header page included.
    pub page_count: u32,
    /// First page of the free-page list.
    pub free_head: PageId,
    /// Pages on the free-page list.
    pub free_count: u32,
}

impl FileHeader {
    /// Size of the file header in bytes.
    pub const SIZE: usize = 26;

    fn new(page_size: usize) -> Self {
        Self {
            version: FORMAT_VERSION,
            page_size: page_size as u32,
            page_count: 1,
            free_head: PageId::NONE,
            free_count: 0,
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&FILE_MAGIC);
        buf[4..6].copy_from_slice(&self.version.to_le_bytes());
        buf[6..10].copy_from_slice(&self.page_size.to_le_bytes());
        buf[10..14].copy_from_slice(&self.page_count.to_le_bytes());
        buf[14..22].copy_from_slice(&self.free_head.to_disk().to_le_bytes());
        buf[22..26].copy_from_slice(&self.free_count.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::SIZE || buf[0..4] != FILE_MAGIC {
            return Err(XylemError::corruption(HEADER_PAGE, "bad file magic"));
        }
        let version = u16::from_le_bytes([buf[4], buf[5]]);
        if version != FORMAT_VERSION {
            return Err(XylemError::corruption(
                HEADER_PAGE,
                format!("unsupported format version {version}"),
            ));
        }
        let page_size = u32::from_le_bytes([buf[6], buf[7], buf[8], buf[9]]);
        let page_count = u32::from_le_bytes([buf[10], buf[11], buf[12], buf[13]]);
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&buf[14..22]);
        let free_head = PageId::from_disk(u64::from_le_bytes(raw))
            .ok_or_else(|| XylemError::corruption(HEADER_PAGE, "invalid free-list head"))?;
        let free_count = u32::from_le_bytes([buf[22], buf[23], buf[24], buf[25]]);

        Ok(Self {
            version,
            page_size,
            page_count,
            free_head,
            free_count,
        })
    }
}

/// A store file made of fixed-size pages.
///
/// Page 0 holds the [`FileHeader`]. Freed pages are kept on a list linked
/// through their page headers and reused before the file grows.
pub struct PagedFile {
    path: PathBuf,
    page_size: usize,
    fsync_enabled: bool,
    read_only: bool,
    state: Mutex<FileState>,
}

struct FileState {
    file: File,
    header: FileHeader,
}

impl FileState {
    fn seek_page(&mut self, page_id: PageId, page_size: usize) -> Result<()> {
        let offset = page_id.0 as u64 * page_size as u64;
        self.file.seek(SeekFrom::Start(offset))?;
        Ok(())
    }
}

impl PagedFile {
    /// Opens the file at `path`, creating it unless the store is read-only.
    pub fn open(path: impl AsRef<Path>, config: &StorageConfig) -> Result<Self> {
        config.validate()?;
        let path = path.as_ref().to_path_buf();

        let mut file = OpenOptions::new()
            .read(true)
            .write(!config.read_only)
            .create(!config.read_only)
            .open(&path)?;

        let header = if file.metadata()?.len() == 0 {
            let header = FileHeader::new(config.page_size);
            let mut page = vec![0u8; config.page_size];
            page[..FileHeader::SIZE].copy_from_slice(&header.to_bytes());
            file.write_all(&page)?;
            file.sync_all()?;
            tracing::info!(path = %path.display(), page_size = config.page_size, "created store file");
            header
        } else {
            let mut buf = [0u8; FileHeader::SIZE];
            file.seek(SeekFrom::Start(0))?;
            file.read_exact(&mut buf)?;
            let header = FileHeader::from_bytes(&buf)?;
            if header.page_size as usize != config.page_size {
                return Err(XylemError::SizeMismatch {
                    expected: config.page_size,
                    actual: header.page_size as usize,
                });
            }
            tracing::debug!(
                path = %path.display(),
                pages = header.page_count,
                free = header.free_count,
                "opened store file"
            );
            header
        };

        Ok(Self {
            path,
            page_size: config.page_size,
            fsync_enabled: config.fsync_enabled,
            read_only: config.read_only,
            state: Mutex::new(FileState { file, header }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Returns the number of pages in the file, header page included.
    pub fn page_count(&self) -> u32 {
        self.state.lock().header.page_count
    }

    /// Returns the number of pages on the free-page list.
    pub fn free_page_count(&self) -> u32 {
        self.state.lock().header.free_count
    }

    /// Returns a copy of the file header.
    pub fn header(&self) -> FileHeader {
        self.state.lock().header
    }

    fn check_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(XylemError::ReadOnly);
        }
        Ok(())
    }

    fn check_data_page(&self, state: &FileState, page_id: PageId) -> Result<()> {
        if page_id == HEADER_PAGE || page_id.is_none() || page_id.0 >= state.header.page_count {
            return Err(XylemError::PageNotFound { page: page_id });
        }
        Ok(())
    }

    fn write_header(&self, state: &mut FileState) -> Result<()> {
        let bytes = state.header.to_bytes();
        state.file.seek(SeekFrom::Start(0))?;
        state.file.write_all(&bytes)?;
        if self.fsync_enabled {
            state.file.sync_data()?;
        }
        Ok(())
    }

    /// Hands out a page, reusing the free-page list before growing the file.
    pub fn allocate_page(&self) -> Result<PageId> {
        self.check_writable()?;
        let mut state = self.state.lock();

        let head = state.header.free_head;
        if head.is_some() {
            self.check_data_page(&state, head)?;
            state.seek_page(head, self.page_size)?;
            let mut buf = [0u8; PageHeader::SIZE];
            state.file.read_exact(&mut buf)?;
            let page_header = PageHeader::from_bytes(head, &buf)?;
            if page_header.status != PageStatus::FreeList {
                tracing::warn!(page = %head, status = ?page_header.status, "free list points at a live page");
                return Err(XylemError::corruption(head, "free list entry is not a free page"));
            }
            state.header.free_head = page_header.next_page;
            state.header.free_count = state.header.free_count.saturating_sub(1);
            self.write_header(&mut state)?;
            tracing::debug!(page = %head, "reused free page");
            return Ok(head);
        }

        let page_id = PageId(state.header.page_count);
        state.seek_page(page_id, self.page_size)?;
        state.file.write_all(&vec![0u8; self.page_size])?;
        state.header.page_count += 1;
        self.write_header(&mut state)?;
        tracing::debug!(page = %page_id, "extended store file");
        Ok(page_id)
    }

    /// Returns a page to the free-page list.
    pub fn free_page(&self, page_id: PageId) -> Result<()> {
        self.check_writable()?;
        let mut state = self.state.lock();
        self.check_data_page(&state, page_id)?;

        let mut page_header = PageHeader::new(PageStatus::FreeList);
        page_header.next_page = state.header.free_head;
        let mut buf = vec![0u8; self.page_size];
        buf[..PageHeader::SIZE].copy_from_slice(&page_header.to_bytes());

        state.seek_page(page_id, self.page_size)?;
        state.file.write_all(&buf)?;
        state.header.free_head = page_id;
        state.header.free_count += 1;
        self.write_header(&mut state)?;
        tracing::debug!(page = %page_id, "freed page");
        Ok(())
    }

    /// Flushes all pending writes to disk.
    pub fn sync(&self) -> Result<()> {
        if self.read_only {
            return Ok(());
        }
        self.state.lock().file.sync_all()?;
        Ok(())
    }
}

impl PageDevice for PagedFile {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn read_page(&self, page_id: PageId, buf: &mut [u8]) -> Result<()> {
        let mut state = self.state.lock();
        self.check_data_page(&state, page_id)?;
        state.seek_page(page_id, self.page_size)?;
        state.file.read_exact(buf)?;
        Ok(())
    }

    fn write_page(&self, page_id: PageId, buf: &[u8]) -> Result<()> {
        self.check_writable()?;
        if buf.len() != self.page_size {
            return Err(XylemError::SizeMismatch {
                expected: self.page_size,
                actual: buf.len(),
            });
        }
        let mut state = self.state.lock();
        self.check_data_page(&state, page_id)?;
        state.seek_page(page_id, self.page_size)?;
        state.file.write_all(buf)?;
        if self.fsync_enabled {
            state.file.sync_data()?;
        }
        Ok(())
    }
}
