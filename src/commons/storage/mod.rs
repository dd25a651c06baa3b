//! Access to the key-value store holding queues, counters and cursors.
//!
//! All operations are individually atomic. There are no transactions
//! spanning several operations, callers rely on at-least-once semantics
//! instead.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use url::Url;

pub use self::memory::Memory;
#[cfg(feature = "redis")]
pub use self::redis::Redis;

mod memory;
#[cfg(feature = "redis")]
mod redis;


//------------ StorageResult -------------------------------------------------

pub type StorageResult<T> = Result<T, KeyValueError>;


//------------ KeyValueStore -------------------------------------------------

/// A handle to the key-value store.
///
/// Handles are cheap to clone and all clones share the same underlying
/// store or connection.
#[derive(Clone, Debug)]
pub enum KeyValueStore {
    Memory(Memory),
    #[cfg(feature = "redis")]
    Redis(Redis),
}

/// Dispatches an operation to the backend. Memory operations are
/// synchronous unless marked with `await`.
macro_rules! dispatch {
    ( $self:ident, $op:ident ( $( $arg:expr ),* ) ) => {
        match $self {
            KeyValueStore::Memory(inner) => inner.$op($( $arg ),*),
            #[cfg(feature = "redis")]
            KeyValueStore::Redis(inner) => inner.$op($( $arg ),*).await,
        }
    };
    ( await $self:ident, $op:ident ( $( $arg:expr ),* ) ) => {
        match $self {
            KeyValueStore::Memory(inner) => inner.$op($( $arg ),*).await,
            #[cfg(feature = "redis")]
            KeyValueStore::Redis(inner) => inner.$op($( $arg ),*).await,
        }
    };
}

// # Construction
impl KeyValueStore {
    /// Opens the store for the given URI.
    ///
    /// Supported schemes are `memory` and, with the `redis` feature,
    /// `redis` and `rediss`.
    pub async fn create(storage_uri: &Url) -> StorageResult<Self> {
        match storage_uri.scheme() {
            "memory" => {
                let name = match storage_uri.host_str() {
                    Some(host) => host.to_string(),
                    None => storage_uri.path().trim_matches('/').to_string(),
                };
                Ok(KeyValueStore::Memory(Memory::new(Some(&name))?))
            }
            #[cfg(feature = "redis")]
            "redis" | "rediss" => {
                Ok(KeyValueStore::Redis(Redis::connect(storage_uri).await?))
            }
            scheme => Err(KeyValueError::UnknownScheme(scheme.to_owned())),
        }
    }

    /// Returns whether this build can open the given URI scheme.
    pub fn supports_scheme(scheme: &str) -> bool {
        match scheme {
            "memory" => true,
            "redis" | "rediss" => cfg!(feature = "redis"),
            _ => false,
        }
    }
}

// # Lists
//
// Producers push onto the head of a list and consumers pop from its tail,
// so lists are FIFO queues with the oldest element at the tail.
impl KeyValueStore {
    /// Pushes a value onto the head of a list, returns the new length.
    pub async fn lpush(&self, key: &str, value: &str) -> StorageResult<usize> {
        dispatch!(self, lpush(key, value))
    }

    /// Appends a value to the tail of a list, making it the next one to
    /// be popped.
    pub async fn rpush(&self, key: &str, value: &str) -> StorageResult<usize> {
        dispatch!(self, rpush(key, value))
    }

    /// Pops the oldest value from a list, waiting up to `timeout` for one
    /// to arrive.
    pub async fn brpop(
        &self, key: &str, timeout: Duration
    ) -> StorageResult<Option<String>> {
        dispatch!(await self, brpop(key, timeout))
    }

    /// Atomically moves the oldest value of `src` onto the head of `dst`,
    /// waiting up to `timeout` for a value to arrive.
    pub async fn brpoplpush(
        &self, src: &str, dst: &str, timeout: Duration
    ) -> StorageResult<Option<String>> {
        dispatch!(await self, brpoplpush(src, dst, timeout))
    }

    /// Atomically moves the newest value of `src` to the tail of `dst`.
    pub async fn lpop_rpush(
        &self, src: &str, dst: &str
    ) -> StorageResult<Option<String>> {
        dispatch!(self, lpop_rpush(src, dst))
    }

    /// Removes one occurrence of `value`, returns the number removed.
    pub async fn lrem(&self, key: &str, value: &str) -> StorageResult<usize> {
        dispatch!(self, lrem(key, value))
    }

    pub async fn llen(&self, key: &str) -> StorageResult<usize> {
        dispatch!(self, llen(key))
    }

    /// Keeps only the elements in the inclusive index range.
    pub async fn ltrim(
        &self, key: &str, start: isize, stop: isize
    ) -> StorageResult<()> {
        dispatch!(self, ltrim(key, start, stop))
    }

    pub async fn lrange(
        &self, key: &str, start: isize, stop: isize
    ) -> StorageResult<Vec<String>> {
        dispatch!(self, lrange(key, start, stop))
    }
}

// # Plain values and counters
impl KeyValueStore {
    pub async fn get(&self, key: &str) -> StorageResult<Option<String>> {
        dispatch!(self, get(key))
    }

    pub async fn set(
        &self, key: &str, value: &str, ttl: Option<Duration>
    ) -> StorageResult<()> {
        dispatch!(self, set(key, value, ttl))
    }

    /// Sets the value only if the key does not exist.
    pub async fn set_nx(
        &self, key: &str, value: &str, ttl: Duration
    ) -> StorageResult<bool> {
        dispatch!(self, set_nx(key, value, ttl))
    }

    /// Extends the lifetime of a key if it still holds `value`.
    pub async fn expire_if_equal(
        &self, key: &str, value: &str, ttl: Duration
    ) -> StorageResult<bool> {
        dispatch!(self, expire_if_equal(key, value, ttl))
    }

    /// Removes a key only if it still holds `value`.
    pub async fn del_if_equal(
        &self, key: &str, value: &str
    ) -> StorageResult<bool> {
        dispatch!(self, del_if_equal(key, value))
    }

    pub async fn incr(&self, key: &str) -> StorageResult<i64> {
        dispatch!(self, incr(key))
    }

    pub async fn del(&self, key: &str) -> StorageResult<bool> {
        dispatch!(self, del(key))
    }
}

// # Hashes
impl KeyValueStore {
    pub async fn hincr(
        &self, key: &str, field: &str, by: i64
    ) -> StorageResult<i64> {
        dispatch!(self, hincr(key, field, by))
    }

    pub async fn hgetall(
        &self, key: &str
    ) -> StorageResult<HashMap<String, i64>> {
        dispatch!(self, hgetall(key))
    }
}

impl fmt::Display for KeyValueStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyValueStore::Memory(inner) => fmt::Display::fmt(inner, f),
            #[cfg(feature = "redis")]
            KeyValueStore::Redis(inner) => fmt::Display::fmt(inner, f),
        }
    }
}


//------------ KeyValueError -------------------------------------------------

#[derive(Debug)]
pub enum KeyValueError {
    UnknownScheme(String),
    WrongType(String),
    NotAnInteger(String),
    Backend(String),
}

impl fmt::Display for KeyValueError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            KeyValueError::UnknownScheme(e) => {
                write!(f, "Unknown storage scheme: {e}")
            }
            KeyValueError::WrongType(key) => {
                write!(f, "Key holds the wrong kind of value: {key}")
            }
            KeyValueError::NotAnInteger(key) => {
                write!(f, "Key does not hold an integer: {key}")
            }
            KeyValueError::Backend(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for KeyValueError { }


//------------ Tests ---------------------------------------------------------
