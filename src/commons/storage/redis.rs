//! A key-value store backed by a Redis server.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use log::debug;
use redis::aio::MultiplexedConnection;
use redis::{Client, Cmd, FromRedisValue, Script};
use url::Url;

use super::{KeyValueError, StorageResult};

/// Extends a key's lifetime only while it still holds the given value.
const EXPIRE_IF_EQUAL: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
else
    return 0
end
";

/// Removes a key only while it still holds the given value.
const DEL_IF_EQUAL: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
else
    return 0
end
";

#[derive(Clone)]
pub struct Redis {
    uri: String,
    client: Client,

    /// Shared by all non-blocking commands.
    conn: MultiplexedConnection,
}

impl Redis {
    pub(crate) async fn connect(uri: &Url) -> StorageResult<Self> {
        let client = Client::open(uri.as_str())?;
        let conn = client.get_multiplexed_async_connection().await?;
        debug!("connected to redis at {}", redacted(uri));
        Ok(Redis { uri: redacted(uri), client, conn })
    }

    async fn query<T: FromRedisValue>(&self, cmd: &Cmd) -> StorageResult<T> {
        let mut conn = self.conn.clone();
        let res: T = cmd.query_async(&mut conn).await?;
        Ok(res)
    }

    /// Runs a blocking command on a connection of its own, so it does not
    /// hold up the shared connection while it waits.
    async fn query_blocking<T: FromRedisValue>(
        &self, cmd: &Cmd
    ) -> StorageResult<T> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let res: T = cmd.query_async(&mut conn).await?;
        Ok(res)
    }
}

// # Lists
impl Redis {
    pub async fn lpush(&self, key: &str, value: &str) -> StorageResult<usize> {
        self.query(redis::cmd("LPUSH").arg(key).arg(value)).await
    }

    pub async fn rpush(&self, key: &str, value: &str) -> StorageResult<usize> {
        self.query(redis::cmd("RPUSH").arg(key).arg(value)).await
    }

    pub async fn brpop(
        &self, key: &str, timeout: Duration
    ) -> StorageResult<Option<String>> {
        let res: Option<(String, String)> = self.query_blocking(
            redis::cmd("BRPOP").arg(key).arg(timeout_secs(timeout))
        ).await?;
        Ok(res.map(|(_, value)| value))
    }

    pub async fn brpoplpush(
        &self, src: &str, dst: &str, timeout: Duration
    ) -> StorageResult<Option<String>> {
        self.query_blocking(
            redis::cmd("BRPOPLPUSH")
                .arg(src).arg(dst).arg(timeout_secs(timeout))
        ).await
    }

    pub async fn lpop_rpush(
        &self, src: &str, dst: &str
    ) -> StorageResult<Option<String>> {
        self.query(
            redis::cmd("LMOVE").arg(src).arg(dst).arg("LEFT").arg("RIGHT")
        ).await
    }

    pub async fn lrem(&self, key: &str, value: &str) -> StorageResult<usize> {
        self.query(redis::cmd("LREM").arg(key).arg(1).arg(value)).await
    }

    pub async fn llen(&self, key: &str) -> StorageResult<usize> {
        self.query(redis::cmd("LLEN").arg(key)).await
    }

    pub async fn ltrim(
        &self, key: &str, start: isize, stop: isize
    ) -> StorageResult<()> {
        self.query(redis::cmd("LTRIM").arg(key).arg(start).arg(stop)).await
    }

    pub async fn lrange(
        &self, key: &str, start: isize, stop: isize
    ) -> StorageResult<Vec<String>> {
        self.query(redis::cmd("LRANGE").arg(key).arg(start).arg(stop)).await
    }
}

// # Plain values and counters
impl Redis {
    pub async fn get(&self, key: &str) -> StorageResult<Option<String>> {
        self.query(redis::cmd("GET").arg(key)).await
    }

    pub async fn set(
        &self, key: &str, value: &str, ttl: Option<Duration>
    ) -> StorageResult<()> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl_millis(ttl));
        }
        self.query(&cmd).await
    }

    pub async fn set_nx(
        &self, key: &str, value: &str, ttl: Duration
    ) -> StorageResult<bool> {
        let res: Option<String> = self.query(
            redis::cmd("SET")
                .arg(key).arg(value).arg("NX").arg("PX").arg(ttl_millis(ttl))
        ).await?;
        Ok(res.is_some())
    }

    pub async fn expire_if_equal(
        &self, key: &str, value: &str, ttl: Duration
    ) -> StorageResult<bool> {
        let mut conn = self.conn.clone();
        let res: i64 = Script::new(EXPIRE_IF_EQUAL)
            .key(key)
            .arg(value)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(res == 1)
    }

    pub async fn del_if_equal(
        &self, key: &str, value: &str
    ) -> StorageResult<bool> {
        let mut conn = self.conn.clone();
        let res: i64 = Script::new(DEL_IF_EQUAL)
            .key(key)
            .arg(value)
            .invoke_async(&mut conn)
            .await?;
        Ok(res == 1)
    }

    pub async fn incr(&self, key: &str) -> StorageResult<i64> {
        self.query(redis::cmd("INCR").arg(key)).await
    }

    pub async fn del(&self, key: &str) -> StorageResult<bool> {
        let removed: i64 = self.query(redis::cmd("DEL").arg(key)).await?;
        Ok(removed > 0)
    }
}

// # Hashes
impl Redis {
    pub async fn hincr(
        &self, key: &str, field: &str, by: i64
    ) -> StorageResult<i64> {
        self.query(redis::cmd("HINCRBY").arg(key).arg(field).arg(by)).await
    }

    pub async fn hgetall(
        &self, key: &str
    ) -> StorageResult<HashMap<String, i64>> {
        self.query(redis::cmd("HGETALL").arg(key)).await
    }
}

impl fmt::Debug for Redis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Redis({})", self.uri)
    }
}

impl fmt::Display for Redis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.uri)
    }
}

impl From<redis::RedisError> for KeyValueError {
    fn from(e: redis::RedisError) -> Self {
        KeyValueError::Backend(format!("redis error: {e}"))
    }
}

/// Blocking commands take whole seconds, zero would block forever.
fn timeout_secs(timeout: Duration) -> u64 {
    timeout.as_secs().max(1)
}

fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

/// Strips credentials from a URI so it can be logged.
fn redacted(uri: &Url) -> String {
    let mut uri = uri.clone();
    let _ = uri.set_password(None);
    let _ = uri.set_username("");
    uri.to_string()
}
