//! The dispatcher owns the broker connection pool and the shared discovery
//! state: the receiver status hash, the per-service uid hash, and the
//! message-to-queue resolution built on top of them.

use crate::codec::{Codec, JsonCodec};
use crate::error::RpcError;
use crate::identity;
use crate::payload::{JsonMap, MessageEnvelope, RequestPayload, SessionData};
use crate::response::ResponseHandle;
use crate::{RedisConnection, RedisPool};
use redis::Commands;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};
use uuid::Uuid;

/// Hash of every live receiver's status, keyed by service uid.
pub const ACTIVE_SERVICES_HASH: &str = "receiver_services";
/// Per-service hash of uid to last-heartbeat seconds.
pub const SERVICE_UIDS_HASH_PREFIX: &str = "rdisq_uids:";
/// Prefix of queues provisioned for ad-hoc target sets.
pub const GENERATED_QUEUE_PREFIX: &str = "rdisq_queue__";

/// Connection and policy knobs for a [`Dispatcher`](Dispatcher).
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub redis_url: String,
    /// Applied when a caller gives no explicit timeout; also the TTL of
    /// request records.
    pub default_timeout: Duration,
    /// Status records older than this are garbage-collected on read.
    pub staleness: Duration,
    /// Prefix for the discovery hashes and generated queue names. Lets
    /// several deployments (or test runs) share one broker.
    pub namespace: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379/0".to_string(),
            default_timeout: Duration::from_secs(10),
            staleness: Duration::from_secs(10),
            namespace: String::new(),
        }
    }
}

impl DispatcherConfig {
    pub fn with_url(redis_url: impl Into<String>) -> Self {
        Self {
            redis_url: redis_url.into(),
            ..Self::default()
        }
    }
}

/// Snapshot of one receiver's capabilities, published on every loop
/// iteration and garbage-collected when stale.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ReceiverStatus {
    pub uid: String,
    /// Class ids the receiver currently handles.
    pub registered_messages: BTreeSet<String>,
    /// Every queue the receiver polls: direct and broadcast. Publishing the
    /// full set is what lets a single-uid target resolve to a direct queue.
    pub listening_queues: BTreeSet<String>,
    pub tags: JsonMap,
    pub stopping: bool,
    /// Unix seconds at publish time.
    pub timestamp: f64,
}

/// Owns the pool, the codec, and the discovery views. Cheap to clone; all
/// clones share the pool.
#[derive(Clone)]
pub struct Dispatcher {
    pool: RedisPool,
    codec: Arc<dyn Codec>,
    config: DispatcherConfig,
}

impl Dispatcher {
    /// Connects with default policy. See
    /// [`DispatcherConfig`](DispatcherConfig) for the knobs.
    pub fn connect(redis_url: &str) -> Result<Self, RpcError> {
        Self::with_config(DispatcherConfig::with_url(redis_url))
    }

    pub fn with_config(config: DispatcherConfig) -> Result<Self, RpcError> {
        let pool = crate::helpers::connect(&config.redis_url)?;
        Ok(Self::with_pool(pool, config))
    }

    /// Builds a dispatcher over an existing pool.
    pub fn with_pool(pool: RedisPool, config: DispatcherConfig) -> Self {
        Self {
            pool,
            codec: Arc::new(JsonCodec),
            config,
        }
    }

    /// Swaps the codec. Every party on the broker must agree on it.
    pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn default_timeout(&self) -> Duration {
        self.config.default_timeout
    }

    pub(crate) fn connection(&self) -> Result<RedisConnection, RpcError> {
        Ok(self.pool.get()?)
    }

    pub(crate) fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, RpcError> {
        crate::codec::encode_as(self.codec.as_ref(), value)
    }

    pub(crate) fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, RpcError> {
        crate::codec::decode_as(self.codec.as_ref(), bytes)
    }

    fn services_hash_key(&self) -> String {
        format!("{}{}", self.config.namespace, ACTIVE_SERVICES_HASH)
    }

    fn uids_hash_key(&self, service_name: &str) -> String {
        format!(
            "{}{}{}",
            self.config.namespace, SERVICE_UIDS_HASH_PREFIX, service_name
        )
    }

    /// Stores the request payload under its request key (with the timeout as
    /// TTL) and pushes the task id onto `queue`. Returns the handle the
    /// caller waits on.
    pub fn queue_task(
        &self,
        queue: &str,
        message: MessageEnvelope,
        session_data: Option<SessionData>,
        timeout: Option<Duration>,
    ) -> Result<ResponseHandle, RpcError> {
        let timeout = timeout.unwrap_or(self.config.default_timeout);
        let seconds = timeout.as_secs().max(1);
        let task_id = identity::new_task_id(queue);
        let payload = RequestPayload {
            task_id: task_id.clone(),
            timeout: seconds,
            message,
            session_data,
        };
        let encoded = self.encode(&payload)?;
        let mut conn = self.connection()?;
        conn.set_ex::<&str, &[u8], ()>(&identity::request_key(&task_id), &encoded, seconds)?;
        conn.lpush::<&str, &str, ()>(queue, &task_id)?;
        debug!(queue, %task_id, "queued task");
        Ok(ResponseHandle::new(self.clone(), task_id))
    }

    /// Publishes one receiver's status into the active-services hash.
    pub fn update_receiver_status(&self, status: &ReceiverStatus) -> Result<(), RpcError> {
        let encoded = self.encode(status)?;
        let mut conn = self.connection()?;
        conn.hset::<&str, &str, &[u8], ()>(&self.services_hash_key(), &status.uid, &encoded)?;
        Ok(())
    }

    /// Reads every fresh receiver status. Stale and unreadable entries are
    /// deleted from the hash on the way.
    pub fn list_receiver_statuses(&self) -> Result<HashMap<String, ReceiverStatus>, RpcError> {
        let key = self.services_hash_key();
        let mut conn = self.connection()?;
        let raw: HashMap<String, Vec<u8>> = conn.hgetall(&key)?;
        let cutoff = unix_time_seconds()? - self.config.staleness.as_secs_f64();
        let mut statuses = HashMap::new();
        let mut stale_uids: Vec<String> = Vec::new();
        for (uid, bytes) in raw {
            match self.decode::<ReceiverStatus>(&bytes) {
                Ok(status) if status.timestamp >= cutoff => {
                    statuses.insert(uid, status);
                }
                Ok(_) => stale_uids.push(uid),
                Err(e) => {
                    warn!(%uid, error = %e, "dropping unreadable receiver status");
                    stale_uids.push(uid);
                }
            }
        }
        for uid in stale_uids {
            conn.hdel::<&str, &str, ()>(&key, &uid)?;
        }
        Ok(statuses)
    }

    /// Fresh statuses that pass the given predicate.
    pub fn filter_services<F>(&self, filter: F) -> Result<Vec<ReceiverStatus>, RpcError>
    where
        F: Fn(&ReceiverStatus) -> bool,
    {
        let statuses = self.list_receiver_statuses()?;
        Ok(statuses.into_values().filter(|s| filter(s)).collect())
    }

    /// Queues whose listener set is exactly `uids`. Sorted, so callers that
    /// need one queue can take the first deterministically. Empty when no
    /// such queue exists; the caller then has to provision one.
    pub fn queues_serving_exactly(
        &self,
        uids: &BTreeSet<String>,
    ) -> Result<BTreeSet<String>, RpcError> {
        let statuses = self.list_receiver_statuses()?;
        let mut listeners: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for status in statuses.values() {
            for queue in &status.listening_queues {
                listeners
                    .entry(queue.clone())
                    .or_default()
                    .insert(status.uid.clone());
            }
        }
        Ok(listeners
            .into_iter()
            .filter(|(_, serving)| serving == uids)
            .map(|(queue, _)| queue)
            .collect())
    }

    /// Fresh name for a queue that will serve an ad-hoc target set.
    pub fn new_queue_name(&self) -> String {
        format!(
            "{}{}{}",
            self.config.namespace,
            GENERATED_QUEUE_PREFIX,
            Uuid::new_v4()
        )
    }

    /// Refreshes a receiver's entry in the per-service uid hash.
    pub fn heartbeat(&self, service_name: &str, uid: &str) -> Result<(), RpcError> {
        let mut conn = self.connection()?;
        conn.hset::<&str, &str, f64, ()>(&self.uids_hash_key(service_name), uid, unix_time_seconds()?)?;
        Ok(())
    }

    /// Uids of the service's instances with a fresh heartbeat. Stale entries
    /// are deleted on the way.
    pub fn list_live_uids(&self, service_name: &str) -> Result<Vec<String>, RpcError> {
        let key = self.uids_hash_key(service_name);
        let mut conn = self.connection()?;
        let raw: HashMap<String, String> = conn.hgetall(&key)?;
        let cutoff = unix_time_seconds()? - self.config.staleness.as_secs_f64();
        let mut live = Vec::new();
        let mut stale: Vec<String> = Vec::new();
        for (uid, stamp) in raw {
            match stamp.parse::<f64>() {
                Ok(seconds) if seconds >= cutoff => live.push(uid),
                _ => stale.push(uid),
            }
        }
        for uid in stale {
            conn.hdel::<&str, &str, ()>(&key, &uid)?;
        }
        live.sort();
        Ok(live)
    }
}

/// Current unix time as float seconds, the timestamp unit used in the shared
/// hashes.
pub(crate) fn unix_time_seconds() -> Result<f64, RpcError> {
    Ok(SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs_f64())
}
