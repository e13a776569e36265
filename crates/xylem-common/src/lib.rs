//! Xylem common types, errors, and utilities.
//!
//! This crate provides the definitions shared by the page cache and the
//! record stores: addressing, the page format, configuration and errors.

pub mod address;
pub mod config;
pub mod error;
pub mod page;

pub use address::{TupleId, VirtualAddress};
pub use config::StorageConfig;
pub use error::{Result, XylemError};
pub use page::{DEFAULT_PAGE_SIZE, Page, PageHeader, PageId, PageStatus};
