//! Redis-backed lease queue
//!
//! A queue descriptor names one or more Redis servers and a key. Every
//! server holds an independent shard made of three structures:
//!
//! ```text
//! {key}:pending   LIST   payloads waiting for a consumer
//! {key}:leases    ZSET   lease id -> lease deadline (ms, server clock)
//! {key}:payloads  HASH   lease id -> leased payload
//! ```
//!
//! Pushes go to a random shard, pops walk the shards round-robin. All
//! lease transitions run as Lua scripts so they are atomic per shard.
//! Leases whose deadline passed are moved back to `pending` before each
//! pop, and a held lease is renewed in the background until its terminal
//! action runs.

use async_trait::async_trait;
use rand::Rng;
use ::redis::aio::ConnectionManager;
use ::redis::{AsyncCommands, Script};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::{broadcast, OnceCell};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::{
    Lease, LeaseGuard, LeaseHandle, LeaseTracker, QueueError, QueueFactory, Readiness, SharedQueue,
    WorkQueue,
};
use crate::config::QueueConfig;
use crate::coordination::SessionOptions;
use crate::models::{Endpoint, QueueDescriptor};

// ============================================================================
// Lua Scripts
// ============================================================================

const NOW_MS: &str = r"
local t = redis.call('TIME')
local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
";

fn pop_script() -> &'static Script {
    static SCRIPT: OnceLock<Script> = OnceLock::new();
    SCRIPT.get_or_init(|| {
        Script::new(&format!(
            r"{NOW_MS}
local expired = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', now)
for _, id in ipairs(expired) do
  local payload = redis.call('HGET', KEYS[3], id)
  redis.call('ZREM', KEYS[2], id)
  redis.call('HDEL', KEYS[3], id)
  if payload then
    redis.call('LPUSH', KEYS[1], payload)
  end
end
local item = redis.call('RPOP', KEYS[1])
if not item then
  return false
end
redis.call('ZADD', KEYS[2], now + tonumber(ARGV[2]), ARGV[1])
redis.call('HSET', KEYS[3], ARGV[1], item)
return item
"
        ))
    })
}

fn complete_script() -> &'static Script {
    static SCRIPT: OnceLock<Script> = OnceLock::new();
    SCRIPT.get_or_init(|| {
        Script::new(
            r"
if redis.call('ZREM', KEYS[1], ARGV[1]) == 1 then
  redis.call('HDEL', KEYS[2], ARGV[1])
  return 1
end
return 0
",
        )
    })
}

fn release_script() -> &'static Script {
    static SCRIPT: OnceLock<Script> = OnceLock::new();
    SCRIPT.get_or_init(|| {
        Script::new(
            r"
if redis.call('ZREM', KEYS[2], ARGV[1]) == 1 then
  local payload = redis.call('HGET', KEYS[3], ARGV[1])
  redis.call('HDEL', KEYS[3], ARGV[1])
  if payload then
    redis.call('LPUSH', KEYS[1], payload)
  end
  return 1
end
return 0
",
        )
    })
}

fn renew_script() -> &'static Script {
    static SCRIPT: OnceLock<Script> = OnceLock::new();
    SCRIPT.get_or_init(|| {
        Script::new(&format!(
            r"{NOW_MS}
if redis.call('ZSCORE', KEYS[1], ARGV[1]) then
  redis.call('ZADD', KEYS[1], 'XX', now + tonumber(ARGV[2]), ARGV[1])
  return 1
end
return 0
"
        ))
    })
}

// ============================================================================
// Shard Keys
// ============================================================================

#[derive(Debug, Clone)]
struct ShardKeys {
    pending: String,
    leases: String,
    payloads: String,
}

impl ShardKeys {
    fn new(key: &str) -> Self {
        Self {
            pending: format!("{key}:pending"),
            leases: format!("{key}:leases"),
            payloads: format!("{key}:payloads"),
        }
    }
}

// ============================================================================
// Redis Queue
// ============================================================================

struct Inner {
    descriptor: QueueDescriptor,
    keys: ShardKeys,
    shards: OnceCell<Vec<ConnectionManager>>,
    cursor: AtomicUsize,
    readiness: Readiness,
    tracker: LeaseTracker,
    errors: broadcast::Sender<QueueError>,
    closed: AtomicBool,
    lease_timeout: Duration,
    connect_backoff: Duration,
}

impl Inner {
    fn emit(&self, error: QueueError) {
        tracing::warn!(key = %self.descriptor.key, error = %error, "Queue error");
        let _ = self.errors.send(error);
    }

    fn shards(&self) -> Result<&[ConnectionManager], QueueError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Closed);
        }
        self.shards
            .get()
            .map(Vec::as_slice)
            .ok_or(QueueError::NotReady)
    }

    async fn connect_server(&self, server: &Endpoint) -> Option<ConnectionManager> {
        let url = format!("redis://{}:{}/", server.host, server.port);

        loop {
            if self.closed.load(Ordering::SeqCst) {
                return None;
            }

            let attempt = match ::redis::Client::open(url.as_str()) {
                Ok(client) => ConnectionManager::new(client).await.map_err(QueueError::from),
                Err(e) => Err(QueueError::Connection(e.to_string())),
            };

            match attempt {
                Ok(conn) => {
                    tracing::debug!(server = %server, "Connected to queue server");
                    return Some(conn);
                }
                Err(e) => {
                    self.emit(e);
                    tokio::time::sleep(self.connect_backoff).await;
                }
            }
        }
    }

    async fn connect_all(self: Arc<Self>) {
        let mut shards = Vec::with_capacity(self.descriptor.servers.len());

        for server in &self.descriptor.servers {
            match self.connect_server(server).await {
                Some(conn) => shards.push(conn),
                None => return,
            }
        }

        if self.shards.set(shards).is_ok() {
            tracing::info!(
                key = %self.descriptor.key,
                servers = self.descriptor.servers.len(),
                "Queue ready"
            );
            self.readiness.mark_ready();
        }
    }
}

/// [`WorkQueue`] sharded over the Redis servers of a queue descriptor
#[derive(Clone)]
pub struct RedisQueue {
    inner: Arc<Inner>,
    connector: Arc<JoinHandle<()>>,
}

impl RedisQueue {
    /// Start connecting to every server of `descriptor`
    ///
    /// Returns immediately; the queue reports ready once all servers are
    /// connected. Connection failures are retried and published as errors.
    pub fn connect(descriptor: &QueueDescriptor, config: &QueueConfig) -> Result<Self, QueueError> {
        if descriptor.servers.is_empty() {
            return Err(QueueError::Connection(format!(
                "queue '{}' lists no servers",
                descriptor.key
            )));
        }

        let (errors, _) = broadcast::channel(config.error_channel_capacity);

        let inner = Arc::new(Inner {
            descriptor: descriptor.clone(),
            keys: ShardKeys::new(&descriptor.key),
            shards: OnceCell::new(),
            cursor: AtomicUsize::new(0),
            readiness: Readiness::new(false),
            tracker: LeaseTracker::new(),
            errors,
            closed: AtomicBool::new(false),
            lease_timeout: config.lease_timeout(),
            connect_backoff: config.connect_backoff(),
        });

        let connector = tokio::spawn(Arc::clone(&inner).connect_all());

        Ok(Self {
            inner,
            connector: Arc::new(connector),
        })
    }

    pub fn descriptor(&self) -> &QueueDescriptor {
        &self.inner.descriptor
    }

    async fn pop_from(&self, conn: &ConnectionManager) -> Result<Option<Lease>, QueueError> {
        let lease_id = Uuid::new_v4().to_string();
        let keys = &self.inner.keys;
        let mut conn = conn.clone();

        let item: Option<String> = pop_script()
            .key(&keys.pending)
            .key(&keys.leases)
            .key(&keys.payloads)
            .arg(&lease_id)
            .arg(self.inner.lease_timeout.as_millis() as u64)
            .invoke_async(&mut conn)
            .await?;

        let Some(payload) = item else {
            return Ok(None);
        };

        let renewal = spawn_renewal(
            conn.clone(),
            keys.clone(),
            lease_id.clone(),
            self.inner.lease_timeout,
            self.inner.errors.clone(),
        );

        let handle = RedisLease {
            lease_id,
            conn,
            keys: keys.clone(),
            renewal,
            _guard: self.inner.tracker.acquire(),
        };

        Ok(Some(Lease::new(payload, Box::new(handle))))
    }
}

#[async_trait]
impl WorkQueue for RedisQueue {
    async fn push(&self, payload: String) -> Result<(), QueueError> {
        let shards = self.inner.shards()?;
        let index = rand::thread_rng().gen_range(0..shards.len());
        let mut conn = shards[index].clone();

        let _: () = conn.lpush(&self.inner.keys.pending, payload).await?;
        Ok(())
    }

    async fn pop(&self) -> Result<Option<Lease>, QueueError> {
        let shards = self.inner.shards()?;
        let start = self.inner.cursor.fetch_add(1, Ordering::Relaxed);
        let mut first_error = None;

        for offset in 0..shards.len() {
            let conn = &shards[(start + offset) % shards.len()];
            match self.pop_from(conn).await {
                Ok(Some(lease)) => return Ok(Some(lease)),
                Ok(None) => {}
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(None),
        }
    }

    fn is_ready(&self) -> bool {
        self.inner.readiness.is_ready()
    }

    async fn wait_ready(&self) {
        self.inner.readiness.wait().await;
    }

    fn subscribe_errors(&self) -> broadcast::Receiver<QueueError> {
        self.inner.errors.subscribe()
    }

    async fn size(&self) -> Result<usize, QueueError> {
        let mut total = 0;
        for conn in self.inner.shards()? {
            let mut conn = conn.clone();
            let (pending, leased): (usize, usize) = ::redis::pipe()
                .llen(&self.inner.keys.pending)
                .hlen(&self.inner.keys.payloads)
                .query_async(&mut conn)
                .await?;
            total += pending + leased;
        }
        Ok(total)
    }

    async fn wait_idle(&self) {
        self.inner.tracker.wait_idle().await;
    }

    async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.connector.abort();
        tracing::info!(key = %self.inner.descriptor.key, "Queue closed");
    }
}

// ============================================================================
// Redis Lease
// ============================================================================

fn spawn_renewal(
    mut conn: ConnectionManager,
    keys: ShardKeys,
    lease_id: String,
    lease_timeout: Duration,
    errors: broadcast::Sender<QueueError>,
) -> JoinHandle<()> {
    let period = (lease_timeout / 3).max(Duration::from_millis(100));

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;

        loop {
            ticker.tick().await;

            let renewed: Result<i64, _> = renew_script()
                .key(&keys.leases)
                .arg(&lease_id)
                .arg(lease_timeout.as_millis() as u64)
                .invoke_async(&mut conn)
                .await;

            match renewed {
                Ok(1) => tracing::trace!(lease = %lease_id, "Lease renewed"),
                Ok(_) => {
                    let _ = errors.send(QueueError::LeaseLost(lease_id.clone()));
                    return;
                }
                Err(e) => {
                    let _ = errors.send(QueueError::from(e));
                }
            }
        }
    })
}

struct RedisLease {
    lease_id: String,
    conn: ConnectionManager,
    keys: ShardKeys,
    renewal: JoinHandle<()>,
    _guard: LeaseGuard,
}

impl RedisLease {
    fn held(&self, result: i64) -> Result<(), QueueError> {
        if result == 1 {
            Ok(())
        } else {
            Err(QueueError::LeaseLost(self.lease_id.clone()))
        }
    }
}

#[async_trait]
impl LeaseHandle for RedisLease {
    async fn complete(&mut self) -> Result<(), QueueError> {
        self.renewal.abort();

        let result: i64 = complete_script()
            .key(&self.keys.leases)
            .key(&self.keys.payloads)
            .arg(&self.lease_id)
            .invoke_async(&mut self.conn)
            .await?;

        self.held(result)
    }

    async fn release(&mut self) -> Result<(), QueueError> {
        self.renewal.abort();

        let result: i64 = release_script()
            .key(&self.keys.pending)
            .key(&self.keys.leases)
            .key(&self.keys.payloads)
            .arg(&self.lease_id)
            .invoke_async(&mut self.conn)
            .await?;

        self.held(result)
    }
}

impl Drop for RedisLease {
    fn drop(&mut self) {
        // An abandoned lease expires and is reclaimed by the next pop
        self.renewal.abort();
    }
}

// ============================================================================
// Factory
// ============================================================================

/// Builds a [`RedisQueue`] for every queue descriptor the supervisor reads
#[derive(Debug, Clone, Default)]
pub struct RedisQueueFactory {
    config: QueueConfig,
}

impl RedisQueueFactory {
    pub fn new(config: QueueConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl QueueFactory for RedisQueueFactory {
    async fn create(
        &self,
        descriptor: &QueueDescriptor,
        session: &SessionOptions,
    ) -> Result<SharedQueue, QueueError> {
        tracing::info!(
            key = %descriptor.key,
            servers = descriptor.servers.len(),
            config_root = %session.root,
            "Creating Redis queue"
        );

        let queue = RedisQueue::connect(descriptor, &self.config)?;
        Ok(Arc::new(queue))
    }
}
