use crate::error::{Error, Result};
use crate::registry::StorageFactory;
use crate::scope::ScopeId;
use crate::scoped_config::AdmissionController;
use crate::source::ScopedOptions;
use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use scopecrab::{Quota, RateLimiter, Store};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

pub const URL_OPTION: &str = "ratelimit.redis.url";
pub const KEY_PREFIX: &str = "scopecrab";

/// Values are compared as strings; Lua numbers lose precision past 2^53
const CAS_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if current ~= ARGV[1] then
    return 0
end
redis.call('SET', KEYS[1], ARGV[2], 'PX', ARGV[3])
return 1
"#;

/// TAT store shared through Redis
///
/// Expiry is left to Redis (`PX`), so `now` is not consulted.
pub struct RedisStore {
    conn: ConnectionManager,
    prefix: String,
    timeout: Duration,
    cas: Script,
}

impl RedisStore {
    pub fn new(conn: ConnectionManager, scope: ScopeId, timeout: Duration) -> Self {
        Self {
            conn,
            prefix: format!("{KEY_PREFIX}:{scope}:"),
            timeout,
            cas: Script::new(CAS_SCRIPT),
        }
    }

    fn key(&self, key: &str) -> String {
        format!("{}{key}", self.prefix)
    }

    async fn call<T, F>(&self, op: &str, fut: F) -> Result<T, String>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                tracing::warn!(op, error = %e, "redis call failed");
                Err(format!("redis {op}: {e}"))
            }
            Err(_) => {
                tracing::warn!(op, timeout = ?self.timeout, "redis call timed out");
                Err(format!("redis {op}: timed out after {:?}", self.timeout))
            }
        }
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    // PX 0 is rejected by Redis
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl Store for RedisStore {
    async fn get(&self, key: &str, _now: SystemTime) -> Result<Option<i64>, String> {
        let mut conn = self.conn.clone();
        let key = self.key(key);
        let value: Option<i64> = self
            .call("GET", async move {
                redis::cmd("GET").arg(&key).query_async(&mut conn).await
            })
            .await?;
        Ok(value)
    }

    async fn compare_and_swap_with_ttl(
        &self,
        key: &str,
        old: i64,
        new: i64,
        ttl: Duration,
        _now: SystemTime,
    ) -> Result<bool, String> {
        let mut conn = self.conn.clone();
        let key = self.key(key);
        let swapped: i64 = self
            .call("CAS", async {
                self.cas
                    .key(&key)
                    .arg(old)
                    .arg(new)
                    .arg(ttl_millis(ttl))
                    .invoke_async(&mut conn)
                    .await
            })
            .await?;
        Ok(swapped == 1)
    }

    async fn set_if_not_exists_with_ttl(
        &self,
        key: &str,
        value: i64,
        ttl: Duration,
        _now: SystemTime,
    ) -> Result<bool, String> {
        let mut conn = self.conn.clone();
        let key = self.key(key);
        let reply: Option<String> = self
            .call("SET NX", async move {
                redis::cmd("SET")
                    .arg(&key)
                    .arg(value)
                    .arg("NX")
                    .arg("PX")
                    .arg(ttl_millis(ttl))
                    .query_async(&mut conn)
                    .await
            })
            .await?;
        Ok(reply.is_some())
    }
}

/// The `redis` engine; one connection manager per distinct URL
pub struct RedisStorage {
    connections: Mutex<HashMap<String, ConnectionManager>>,
    timeout: Duration,
}

impl RedisStorage {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(250);

    pub fn new(timeout: Duration) -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    async fn connection(&self, url: &str) -> Result<ConnectionManager> {
        if let Some(conn) = self.connections.lock().get(url) {
            return Ok(conn.clone());
        }

        let client = Client::open(url).map_err(|e| Error::NotValid(format!("{URL_OPTION}: {e}")))?;
        // Connecting can take longer than a single command
        let connect_timeout = self.timeout.saturating_mul(4);
        let conn = tokio::time::timeout(connect_timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| Error::Unavailable(format!("connecting to redis timed out after {connect_timeout:?}")))?
            .map_err(|e| Error::Backend(format!("connecting to redis: {e}")))?;

        tracing::info!("connected to redis");
        let conn = self
            .connections
            .lock()
            .entry(url.to_string())
            .or_insert(conn)
            .clone();
        Ok(conn)
    }
}

impl Default for RedisStorage {
    fn default() -> Self {
        Self::new(Self::DEFAULT_TIMEOUT)
    }
}

#[async_trait]
impl StorageFactory for RedisStorage {
    async fn create(
        &self,
        scope: ScopeId,
        quota: Quota,
        options: &ScopedOptions<'_>,
    ) -> Result<Arc<dyn AdmissionController>> {
        let url = options
            .string(URL_OPTION)
            .await?
            .map(|u| u.trim().to_string())
            .unwrap_or_default();
        if url.is_empty() {
            return Err(Error::Empty(format!("{URL_OPTION} is required for the redis engine")));
        }

        let conn = self.connection(&url).await?;
        tracing::debug!(scope = %scope, quota = %quota, "creating redis store");
        let store = RedisStore::new(conn, scope, self.timeout);
        Ok(Arc::new(RateLimiter::new(store, quota)))
    }
}
