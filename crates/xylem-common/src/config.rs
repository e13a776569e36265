//! Configuration structures for record stores.

use crate::error::{Result, XylemError};
use crate::page::{DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE, MIN_PAGE_SIZE, PageHeader};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Storage configuration shared by keyed and ordered record stores.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory for store files.
    pub data_dir: PathBuf,
    /// Page size in bytes. Fixed for the lifetime of a file.
    pub page_size: usize,
    /// Page cache size in number of pages.
    pub cache_pages: usize,
    /// Enable fsync for durability.
    pub fsync_enabled: bool,
    /// Open files without write access.
    pub read_only: bool,
    /// Smallest free fragment worth tracking in the free-space registry.
    pub min_free_space: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            page_size: DEFAULT_PAGE_SIZE,
            cache_pages: 256, // 1 MB with 4 KB pages
            fsync_enabled: true,
            read_only: false,
            min_free_space: 64,
        }
    }
}

impl StorageConfig {
    /// Returns the total cache size in bytes.
    pub fn cache_size_bytes(&self) -> usize {
        self.cache_pages * self.page_size
    }

    /// Bytes available for records on one page.
    pub fn working_size(&self) -> usize {
        self.page_size.saturating_sub(PageHeader::SIZE)
    }

    /// Checks the configuration for values no store can run with.
    pub fn validate(&self) -> Result<()> {
        if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&self.page_size) {
            return Err(XylemError::ConfigError(format!(
                "page_size {} outside [{}, {}]",
                self.page_size, MIN_PAGE_SIZE, MAX_PAGE_SIZE
            )));
        }
        if !self.page_size.is_power_of_two() {
            return Err(XylemError::ConfigError(format!(
                "page_size {} is not a power of two",
                self.page_size
            )));
        }
        if self.cache_pages == 0 {
            return Err(XylemError::ConfigError(
                "cache_pages must be at least 1".to_string(),
            ));
        }
        if self.min_free_space >= self.working_size() {
            return Err(XylemError::ConfigError(format!(
                "min_free_space {} must be below the page working size {}",
                self.min_free_space,
                self.working_size()
            )));
        }
        Ok(())
    }
}
