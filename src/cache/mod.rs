//! Offline-first paging cache.
//!
//! This module is agnostic of the remote it pages over:
//! - The local store is the single source of truth for consumers
//! - The mediator fills the store from a remote, one page per load signal
//! - Pagers turn stored rows into a stream of growing windows
//! - Detail sync fetches one record, persists it, and emits the stored copy

mod detail;
mod error;
mod layer;
mod mediator;
mod page_source;
mod pager;
mod storage;
#[cfg(test)]
mod testing;
mod traits;

pub use error::{CacheError, Result};
pub use layer::CacheLayer;
pub use pager::{LoadState, PageWindow, PagingConfig};
pub use storage::{CachedEntity, LocalStore, SqliteStorage};
pub use traits::{Cacheable, Joined, LoadDirection, QueryKey, RemotePage, RemoteSource};
