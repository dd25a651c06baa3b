//! An in-process key-value store.
//!
//! Stores are shared per name for the lifetime of the process, so that
//! every `memory://name` URI resolves to the same data. This allows
//! components that each open their own store handle to see the same
//! queues, just like they would with an external server.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use lazy_static::lazy_static;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{KeyValueError, StorageResult};


//------------ Value ---------------------------------------------------------

#[derive(Clone, Debug)]
enum Value {
    Str(String),
    List(VecDeque<String>),
    Hash(HashMap<String, i64>),
}

#[derive(Clone, Debug)]
struct Entry {
    value: Value,
    expires: Option<Instant>,
}

impl Entry {
    fn new(value: Value) -> Self {
        Entry { value, expires: None }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires.map(|at| at <= now).unwrap_or(false)
    }
}


//------------ MemoryData ----------------------------------------------------

#[derive(Debug, Default)]
struct MemoryData(HashMap<String, Entry>);

impl MemoryData {
    /// Returns the live entry for a key, dropping it if it has expired.
    fn live(&mut self, key: &str) -> Option<&mut Entry> {
        let now = Instant::now();
        if self.0.get(key).map(|e| e.is_expired(now)).unwrap_or(false) {
            self.0.remove(key);
        }
        self.0.get_mut(key)
    }

    fn list_mut(
        &mut self, key: &str, create: bool
    ) -> StorageResult<Option<&mut VecDeque<String>>> {
        if self.live(key).is_none() {
            if !create {
                return Ok(None)
            }
            self.0.insert(
                key.to_string(), Entry::new(Value::List(VecDeque::new()))
            );
        }
        match self.0.get_mut(key).map(|e| &mut e.value) {
            Some(Value::List(list)) => Ok(Some(list)),
            Some(_) => Err(KeyValueError::WrongType(key.to_string())),
            None => Ok(None),
        }
    }

    fn hash_mut(
        &mut self, key: &str, create: bool
    ) -> StorageResult<Option<&mut HashMap<String, i64>>> {
        if self.live(key).is_none() {
            if !create {
                return Ok(None)
            }
            self.0.insert(
                key.to_string(), Entry::new(Value::Hash(HashMap::new()))
            );
        }
        match self.0.get_mut(key).map(|e| &mut e.value) {
            Some(Value::Hash(hash)) => Ok(Some(hash)),
            Some(_) => Err(KeyValueError::WrongType(key.to_string())),
            None => Ok(None),
        }
    }

    /// Removes a list that became empty, the way a server would.
    fn drop_if_empty(&mut self, key: &str) {
        let empty = matches!(
            self.0.get(key).map(|e| &e.value),
            Some(Value::List(list)) if list.is_empty()
        );
        if empty {
            self.0.remove(key);
        }
    }

    fn rpop(&mut self, key: &str) -> StorageResult<Option<String>> {
        let res = match self.list_mut(key, false)? {
            Some(list) => list.pop_back(),
            None => None,
        };
        self.drop_if_empty(key);
        Ok(res)
    }

    fn lpop(&mut self, key: &str) -> StorageResult<Option<String>> {
        let res = match self.list_mut(key, false)? {
            Some(list) => list.pop_front(),
            None => None,
        };
        self.drop_if_empty(key);
        Ok(res)
    }
}


//------------ MemoryInner ---------------------------------------------------

#[derive(Debug, Default)]
struct MemoryInner {
    data: Mutex<MemoryData>,

    /// Woken whenever a list receives a new element.
    pushed: Notify,
}

lazy_static! {
    static ref STORES: Mutex<HashMap<String, Arc<MemoryInner>>> =
        Mutex::new(HashMap::new());
}


//------------ Memory --------------------------------------------------------

#[derive(Clone)]
pub struct Memory {
    name: String,
    inner: Arc<MemoryInner>,
}

impl Memory {
    /// Opens the shared store with the given name, creating it if needed.
    pub(crate) fn new(name: Option<&str>) -> StorageResult<Self> {
        let name = name.unwrap_or_default().to_string();
        let mut stores = STORES.lock().map_err(|e| {
            KeyValueError::Backend(format!("cannot lock memory stores: {e}"))
        })?;
        let inner = stores.entry(name.clone()).or_default().clone();
        Ok(Memory { name, inner })
    }

    fn lock(&self) -> StorageResult<MutexGuard<'_, MemoryData>> {
        self.inner.data.lock().map_err(|e| {
            KeyValueError::Backend(format!("cannot lock memory store: {e}"))
        })
    }
}

impl fmt::Debug for Memory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Memory({})", self.name)
    }
}

impl fmt::Display for Memory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "memory://{}", self.name)
    }
}

// # Lists
impl Memory {
    pub fn lpush(&self, key: &str, value: &str) -> StorageResult<usize> {
        let len = {
            let mut data = self.lock()?;
            let list = data.list_mut(key, true)?.ok_or_else(|| {
                KeyValueError::Backend(format!("cannot create list {key}"))
            })?;
            list.push_front(value.to_string());
            list.len()
        };
        self.inner.pushed.notify_waiters();
        Ok(len)
    }

    pub fn rpush(&self, key: &str, value: &str) -> StorageResult<usize> {
        let len = {
            let mut data = self.lock()?;
            let list = data.list_mut(key, true)?.ok_or_else(|| {
                KeyValueError::Backend(format!("cannot create list {key}"))
            })?;
            list.push_back(value.to_string());
            list.len()
        };
        self.inner.pushed.notify_waiters();
        Ok(len)
    }

    pub fn rpop(&self, key: &str) -> StorageResult<Option<String>> {
        self.lock()?.rpop(key)
    }

    pub fn rpoplpush(
        &self, src: &str, dst: &str
    ) -> StorageResult<Option<String>> {
        let moved = {
            let mut data = self.lock()?;
            // Check the destination type before taking anything out of
            // the source.
            data.list_mut(dst, false)?;
            match data.rpop(src)? {
                Some(value) => {
                    if let Some(list) = data.list_mut(dst, true)? {
                        list.push_front(value.clone());
                    }
                    Some(value)
                }
                None => None,
            }
        };
        if moved.is_some() {
            self.inner.pushed.notify_waiters();
        }
        Ok(moved)
    }

    pub fn lpop_rpush(
        &self, src: &str, dst: &str
    ) -> StorageResult<Option<String>> {
        let moved = {
            let mut data = self.lock()?;
            data.list_mut(dst, false)?;
            match data.lpop(src)? {
                Some(value) => {
                    if let Some(list) = data.list_mut(dst, true)? {
                        list.push_back(value.clone());
                    }
                    Some(value)
                }
                None => None,
            }
        };
        if moved.is_some() {
            self.inner.pushed.notify_waiters();
        }
        Ok(moved)
    }

    /// Waits until `op` yields a value or the timeout expires.
    async fn blocking<F>(
        &self, timeout: Duration, op: F
    ) -> StorageResult<Option<String>>
    where
        F: Fn(&Self) -> StorageResult<Option<String>>,
    {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.inner.pushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(value) = op(self)? {
                return Ok(Some(value))
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None)
            }
        }
    }

    pub async fn brpop(
        &self, key: &str, timeout: Duration
    ) -> StorageResult<Option<String>> {
        self.blocking(timeout, |m| m.rpop(key)).await
    }

    pub async fn brpoplpush(
        &self, src: &str, dst: &str, timeout: Duration
    ) -> StorageResult<Option<String>> {
        self.blocking(timeout, |m| m.rpoplpush(src, dst)).await
    }

    pub fn lrem(&self, key: &str, value: &str) -> StorageResult<usize> {
        let mut data = self.lock()?;
        let removed = match data.list_mut(key, false)? {
            Some(list) => match list.iter().position(|v| v == value) {
                Some(idx) => {
                    list.remove(idx);
                    1
                }
                None => 0,
            },
            None => 0,
        };
        data.drop_if_empty(key);
        Ok(removed)
    }

    pub fn llen(&self, key: &str) -> StorageResult<usize> {
        let mut data = self.lock()?;
        Ok(data.list_mut(key, false)?.map(|l| l.len()).unwrap_or(0))
    }

    pub fn ltrim(
        &self, key: &str, start: isize, stop: isize
    ) -> StorageResult<()> {
        let mut data = self.lock()?;
        if let Some(list) = data.list_mut(key, false)? {
            match list_range(list.len(), start, stop) {
                Some((from, to)) => {
                    list.truncate(to + 1);
                    list.drain(..from);
                }
                None => list.clear(),
            }
        }
        data.drop_if_empty(key);
        Ok(())
    }

    pub fn lrange(
        &self, key: &str, start: isize, stop: isize
    ) -> StorageResult<Vec<String>> {
        let mut data = self.lock()?;
        let list = match data.list_mut(key, false)? {
            Some(list) => list,
            None => return Ok(Vec::new()),
        };
        Ok(match list_range(list.len(), start, stop) {
            Some((from, to)) => {
                list.range(from..=to).cloned().collect()
            }
            None => Vec::new(),
        })
    }
}

// # Plain values and counters
impl Memory {
    pub fn get(&self, key: &str) -> StorageResult<Option<String>> {
        let mut data = self.lock()?;
        match data.live(key).map(|e| &e.value) {
            Some(Value::Str(s)) => Ok(Some(s.clone())),
            Some(_) => Err(KeyValueError::WrongType(key.to_string())),
            None => Ok(None),
        }
    }

    pub fn set(
        &self, key: &str, value: &str, ttl: Option<Duration>
    ) -> StorageResult<()> {
        let mut entry = Entry::new(Value::Str(value.to_string()));
        entry.expires = ttl.map(|ttl| Instant::now() + ttl);
        self.lock()?.0.insert(key.to_string(), entry);
        Ok(())
    }

    pub fn set_nx(
        &self, key: &str, value: &str, ttl: Duration
    ) -> StorageResult<bool> {
        let mut data = self.lock()?;
        if data.live(key).is_some() {
            return Ok(false)
        }
        let mut entry = Entry::new(Value::Str(value.to_string()));
        entry.expires = Some(Instant::now() + ttl);
        data.0.insert(key.to_string(), entry);
        Ok(true)
    }

    pub fn expire_if_equal(
        &self, key: &str, value: &str, ttl: Duration
    ) -> StorageResult<bool> {
        let mut data = self.lock()?;
        match data.live(key) {
            Some(entry) => match &entry.value {
                Value::Str(s) if s == value => {
                    entry.expires = Some(Instant::now() + ttl);
                    Ok(true)
                }
                _ => Ok(false),
            },
            None => Ok(false),
        }
    }

    pub fn del_if_equal(&self, key: &str, value: &str) -> StorageResult<bool> {
        let mut data = self.lock()?;
        let equal = matches!(
            data.live(key).map(|e| &e.value),
            Some(Value::Str(s)) if s == value
        );
        if equal {
            data.0.remove(key);
        }
        Ok(equal)
    }

    pub fn incr(&self, key: &str) -> StorageResult<i64> {
        let mut data = self.lock()?;
        let next = match data.live(key) {
            Some(entry) => match &entry.value {
                Value::Str(s) => s.parse::<i64>().map_err(|_| {
                    KeyValueError::NotAnInteger(key.to_string())
                })? + 1,
                _ => return Err(KeyValueError::WrongType(key.to_string())),
            },
            None => 1,
        };
        match data.live(key) {
            Some(entry) => entry.value = Value::Str(next.to_string()),
            None => {
                data.0.insert(
                    key.to_string(),
                    Entry::new(Value::Str(next.to_string()))
                );
            }
        }
        Ok(next)
    }

    pub fn del(&self, key: &str) -> StorageResult<bool> {
        let mut data = self.lock()?;
        let existed = data.live(key).is_some();
        data.0.remove(key);
        Ok(existed)
    }
}

// # Hashes
impl Memory {
    pub fn hincr(
        &self, key: &str, field: &str, by: i64
    ) -> StorageResult<i64> {
        let mut data = self.lock()?;
        let hash = data.hash_mut(key, true)?.ok_or_else(|| {
            KeyValueError::Backend(format!("cannot create hash {key}"))
        })?;
        let value = hash.entry(field.to_string()).or_insert(0);
        *value += by;
        Ok(*value)
    }

    pub fn hgetall(&self, key: &str) -> StorageResult<HashMap<String, i64>> {
        let mut data = self.lock()?;
        Ok(data.hash_mut(key, false)?.cloned().unwrap_or_default())
    }
}

/// Resolves an inclusive index range with negative offsets counted from
/// the end. Returns `None` if the range is empty.
fn list_range(
    len: usize, start: isize, stop: isize
) -> Option<(usize, usize)> {
    let len = len as isize;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if len == 0 || start > stop || start >= len || stop < 0 {
        None
    }
    else {
        Some((start as usize, stop as usize))
    }
}


//------------ Tests ---------------------------------------------------------
