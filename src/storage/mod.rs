//! Named, versioned response stores.
//!
//! A [`CacheStorage`] holds any number of stores, each a map from
//! [`RequestKey`] to [`StoredResponse`]. Every method is a single atomic step;
//! callers never need to hold a lock across calls.

mod disk;
mod memory;

pub use disk::DiskStorage;
pub use memory::MemoryStorage;

use async_trait::async_trait;

use crate::error::Result;
use crate::request::RequestKey;
use crate::response::StoredResponse;

/// Longest store name, in bytes, that every backend accepts.
pub const MAX_STORE_NAME_LEN: usize = 128;

/// Abstraction over the store backend, so the proxy can be tested in memory.
#[async_trait]
pub trait CacheStorage: Send + Sync {
    /// Opens the store `name`, creating it empty if it does not exist.
    async fn open(&self, name: &str) -> Result<()>;

    /// Lists the names of all existing stores.
    async fn names(&self) -> Result<Vec<String>>;

    /// Deletes the store `name` and every entry in it.
    ///
    /// Returns `false` if no such store existed.
    async fn delete(&self, name: &str) -> Result<bool>;

    /// Looks up `key` in store `name`. A missing store is a miss.
    async fn get(&self, name: &str, key: &RequestKey) -> Result<Option<StoredResponse>>;

    /// Writes one entry, creating the store if needed.
    async fn put(&self, name: &str, key: RequestKey, response: StoredResponse) -> Result<()>;

    /// Writes every entry or none of them.
    ///
    /// When `entries` repeats a key, the last occurrence wins.
    async fn put_all(&self, name: &str, entries: Vec<(RequestKey, StoredResponse)>) -> Result<()>;

    /// Returns the number of entries in store `name` (0 if it does not exist).
    async fn len(&self, name: &str) -> Result<usize>;
}
