//! Redis-backed queue with reliable dequeue and parent/child flows.
//!
//! # Key layout
//!
//! For a prefix `p` and queue `q`:
//!
//! - `p:queue:q`: pending jobs (LPUSH in, BRPOPLPUSH out)
//! - `p:queue:q:processing:{consumer}`: jobs held by one process, for crash
//!   recovery
//! - `p:queue:q:consumers`: set of consumers that ever held a job of `q`
//! - `p:queue:q:dead_letter`: jobs that exhausted their attempts
//! - `p:consumer:{consumer}`: lease of a live process, refreshed while the
//!   queue is alive and expiring [`CONSUMER_LEASE_SECS`] after it is not
//! - `p:results:{job}`: return value of a completed job
//!
//! A flow with parent `P` adds:
//!
//! - `p:flow:P:parent`: the serialized parent, parked until released
//! - `p:flow:P:pending`: number of children not yet finished
//! - `p:flow:P:children`: hash of child id to [`ChildOutcome`]
//!
//! The last child to finish moves the parked parent onto its queue. The
//! record, decrement and release happen in one Lua script, so concurrent
//! children release the parent exactly once and a re-reported child is
//! ignored.
//!
//! # Recovery
//!
//! Every [`RedisQueue`] is one consumer with its own processing list.
//! [`QueueBackend::recover_processing`] only drains lists whose consumer
//! lease has expired, claiming entries one at a time with RPOPLPUSH so two
//! recovering processes never requeue the same job.
//!
//! Blocking dequeues run on dedicated connections checked out of a small
//! pool, never on the shared multiplexed connection that carries every
//! other command.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::AsyncCommands;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::backend::{dead_letter_entry, QueueBackend, QueueError, QueueStats, RESULT_TTL_SECS};
use super::job::{ChildOutcome, Flow, Job};

/// Default key prefix.
pub const DEFAULT_KEY_PREFIX: &str = "debt-forge";

/// Lifetime of a consumer lease without a refresh.
pub const CONSUMER_LEASE_SECS: u64 = 30;

/// Records a child outcome and releases the parent after the last child.
///
/// Returns -1 for a duplicate report, 0 when the parent was released,
/// otherwise the number of children still pending.
const CHILD_FINISHED_SCRIPT: &str = r#"
if redis.call('HEXISTS', KEYS[1], ARGV[1]) == 1 then
  return -1
end
redis.call('HSET', KEYS[1], ARGV[1], ARGV[2])
redis.call('EXPIRE', KEYS[1], tonumber(ARGV[3]))
local remaining = redis.call('DECR', KEYS[2])
if remaining <= 0 then
  local parent = redis.call('GET', KEYS[3])
  if parent then
    redis.call('LPUSH', KEYS[4], parent)
  end
  redis.call('DEL', KEYS[3], KEYS[2])
  return 0
end
return remaining
"#;

/// Redis queue backend.
pub struct RedisQueue {
    client: redis::Client,
    /// Connection manager (handles reconnection automatically).
    redis: ConnectionManager,
    /// Idle connections reserved for blocking dequeues.
    blocking: Mutex<Vec<MultiplexedConnection>>,
    prefix: String,
    consumer_id: Uuid,
    heartbeat: JoinHandle<()>,
    child_finished: redis::Script,
}

impl RedisQueue {
    /// Connects to Redis and takes out a consumer lease.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::ConnectionFailed` if the connection fails.
    pub async fn connect(redis_url: &str, prefix: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        let mut redis = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        let consumer_id = Uuid::now_v7();
        let lease_key = lease_key(prefix, consumer_id);
        renew_lease(&mut redis, &lease_key).await?;
        let heartbeat = tokio::spawn(refresh_lease(redis.clone(), lease_key));
        info!(consumer_id = %consumer_id, "Redis queue consumer registered");

        Ok(Self {
            client,
            redis,
            blocking: Mutex::new(Vec::new()),
            prefix: prefix.to_string(),
            consumer_id,
            heartbeat,
            child_finished: redis::Script::new(CHILD_FINISHED_SCRIPT),
        })
    }

    /// Identifier of this process's processing lists and lease.
    pub fn consumer_id(&self) -> Uuid {
        self.consumer_id
    }

    fn queue_key(&self, queue: &str) -> String {
        queue_key(&self.prefix, queue)
    }

    fn processing_key(&self, queue: &str) -> String {
        processing_key(&self.prefix, queue, self.consumer_id)
    }

    fn consumers_key(&self, queue: &str) -> String {
        format!("{}:consumers", self.queue_key(queue))
    }

    fn dead_letter_key(&self, queue: &str) -> String {
        format!("{}:dead_letter", self.queue_key(queue))
    }

    fn result_key(&self, job_id: Uuid) -> String {
        format!("{}:results:{}", self.prefix, job_id)
    }

    fn flow_key(&self, parent_id: Uuid, suffix: &str) -> String {
        flow_key(&self.prefix, parent_id, suffix)
    }

    async fn checkout_blocking(&self) -> Result<MultiplexedConnection, QueueError> {
        if let Some(conn) = self.blocking.lock().await.pop() {
            return Ok(conn);
        }
        debug!(consumer_id = %self.consumer_id, "Opening dedicated dequeue connection");
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    async fn checkin_blocking(&self, conn: MultiplexedConnection) {
        self.blocking.lock().await.push(conn);
    }

    /// Consumers of `queue` other than this one whose lease has expired.
    async fn expired_consumers(&self, queue: &str) -> Result<Vec<Uuid>, QueueError> {
        let mut conn = self.redis.clone();
        let members: Vec<String> = conn.smembers(self.consumers_key(queue)).await?;

        let mut expired = Vec::new();
        for member in members {
            let Ok(consumer) = Uuid::parse_str(&member) else {
                continue;
            };
            if consumer == self.consumer_id {
                continue;
            }
            let alive: bool = conn.exists(lease_key(&self.prefix, consumer)).await?;
            if !alive {
                expired.push(consumer);
            }
        }
        Ok(expired)
    }

    /// Moves every job held by an expired consumer back into circulation.
    async fn recover_consumer(&self, queue: &str, consumer: Uuid) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        let abandoned = processing_key(&self.prefix, queue, consumer);
        let own = self.processing_key(queue);
        let mut recovered = 0;

        conn.sadd::<_, _, ()>(self.consumers_key(queue), self.consumer_id.to_string())
            .await?;

        loop {
            // Claiming into our own list keeps the job recoverable if we die too.
            let claimed: Option<String> = conn.rpoplpush(&abandoned, &own).await?;
            let Some(entry) = claimed else {
                break;
            };
            let Ok(mut job) = serde_json::from_str::<Job>(&entry) else {
                warn!(queue = %queue, consumer_id = %consumer, "Dropping unreadable processing entry");
                conn.lrem::<_, _, ()>(&own, 1, &entry).await?;
                continue;
            };
            // The interrupted run counts as an attempt.
            job.increment_attempts();

            if job.should_retry() {
                let serialized = serde_json::to_string(&job)?;
                let mut pipe = redis::pipe();
                pipe.atomic()
                    .lrem(&own, 1, &entry)
                    .rpush(self.queue_key(queue), &serialized);
                pipe.query_async::<_, ()>(&mut conn).await?;
                recovered += 1;
            } else {
                self.fail(&job, "Recovered from processing queue after max attempts")
                    .await?;
            }
        }

        conn.srem::<_, _, ()>(self.consumers_key(queue), consumer.to_string())
            .await?;
        Ok(recovered)
    }

    /// Reports a finished child to its parent's flow.
    async fn notify_parent(&self, job: &Job, outcome: &ChildOutcome) -> Result<(), QueueError> {
        let Some(parent) = &job.parent else {
            return Ok(());
        };

        let mut conn = self.redis.clone();
        let remaining: i64 = self
            .child_finished
            .key(self.flow_key(parent.id, "children"))
            .key(self.flow_key(parent.id, "pending"))
            .key(self.flow_key(parent.id, "parent"))
            .key(self.queue_key(&parent.queue_name))
            .arg(job.id.to_string())
            .arg(serde_json::to_string(outcome)?)
            .arg(RESULT_TTL_SECS)
            .invoke_async::<_, i64>(&mut conn)
            .await?;

        match remaining {
            -1 => debug!(job_id = %job.id, parent_id = %parent.id, "Child already reported"),
            0 => info!(parent_id = %parent.id, queue = %parent.queue_name, "All children finished; parent released"),
            n => debug!(parent_id = %parent.id, remaining = n, "Child finished"),
        }
        Ok(())
    }

    /// Removes a job from its processing list by id.
    async fn remove_from_processing(&self, job: &Job) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        let processing = self.processing_key(&job.queue_name);
        let entries: Vec<String> = conn.lrange(&processing, 0, -1).await?;

        for entry in entries {
            if let Ok(held) = serde_json::from_str::<Job>(&entry) {
                if held.id == job.id {
                    conn.lrem::<_, _, ()>(&processing, 1, &entry).await?;
                    return Ok(());
                }
            }
        }

        Ok(())
    }
}

#[async_trait]
impl QueueBackend for RedisQueue {
    fn name(&self) -> &str {
        "redis"
    }

    async fn add_flow(&self, flow: Flow) -> Result<(), QueueError> {
        if flow.children.is_empty() {
            return self.enqueue(flow.parent).await;
        }

        let parent_id = flow.parent.id;
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("SET")
            .arg(self.flow_key(parent_id, "parent"))
            .arg(serde_json::to_string(&flow.parent)?)
            .arg("EX")
            .arg(RESULT_TTL_SECS)
            .ignore()
            .cmd("SET")
            .arg(self.flow_key(parent_id, "pending"))
            .arg(flow.children.len())
            .arg("EX")
            .arg(RESULT_TTL_SECS)
            .ignore();
        for child in &flow.children {
            pipe.lpush(self.queue_key(&child.queue_name), serde_json::to_string(child)?)
                .ignore();
        }

        let mut conn = self.redis.clone();
        pipe.query_async::<_, ()>(&mut conn).await?;

        debug!(parent_id = %parent_id, children = flow.children.len(), "Flow added");
        Ok(())
    }

    async fn enqueue(&self, job: Job) -> Result<(), QueueError> {
        let serialized = serde_json::to_string(&job)?;
        let mut conn = self.redis.clone();
        conn.lpush::<_, _, ()>(self.queue_key(&job.queue_name), serialized)
            .await?;
        Ok(())
    }

    async fn dequeue(&self, queue: &str, timeout: Duration) -> Result<Option<Job>, QueueError> {
        let timeout_secs = timeout.as_secs().max(1) as usize;

        let mut shared = self.redis.clone();
        shared
            .sadd::<_, _, ()>(self.consumers_key(queue), self.consumer_id.to_string())
            .await?;

        // A connection that errored mid-command is dropped rather than reused.
        let mut conn = self.checkout_blocking().await?;
        let result: Option<String> = redis::cmd("BRPOPLPUSH")
            .arg(self.queue_key(queue))
            .arg(self.processing_key(queue))
            .arg(timeout_secs)
            .query_async(&mut conn)
            .await?;
        self.checkin_blocking(conn).await;

        match result {
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }

    async fn complete(&self, job: &Job, return_value: serde_json::Value) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        redis::cmd("SET")
            .arg(self.result_key(job.id))
            .arg(serde_json::to_string(&return_value)?)
            .arg("EX")
            .arg(RESULT_TTL_SECS)
            .query_async::<_, ()>(&mut conn)
            .await?;

        self.notify_parent(job, &ChildOutcome::completed(job, return_value))
            .await?;
        self.remove_from_processing(job).await
    }

    async fn retry(&self, job: Job) -> Result<(), QueueError> {
        self.remove_from_processing(&job).await?;

        // RPUSH puts the job at the dequeue end for immediate retry.
        let serialized = serde_json::to_string(&job)?;
        let mut conn = self.redis.clone();
        conn.rpush::<_, _, ()>(self.queue_key(&job.queue_name), serialized)
            .await?;
        Ok(())
    }

    async fn fail(&self, job: &Job, error: &str) -> Result<(), QueueError> {
        let entry = serde_json::to_string(&dead_letter_entry(job, error))?;
        let mut conn = self.redis.clone();
        conn.lpush::<_, _, ()>(self.dead_letter_key(&job.queue_name), entry)
            .await?;

        self.notify_parent(job, &ChildOutcome::failed(job, error))
            .await?;
        self.remove_from_processing(job).await
    }

    async fn child_outcomes(&self, parent_id: Uuid) -> Result<Vec<ChildOutcome>, QueueError> {
        let mut conn = self.redis.clone();
        let values: Vec<String> = conn.hvals(self.flow_key(parent_id, "children")).await?;

        let mut outcomes = Vec::with_capacity(values.len());
        for value in values {
            match serde_json::from_str::<ChildOutcome>(&value) {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => warn!(parent_id = %parent_id, error = %e, "Skipping unreadable child outcome"),
            }
        }
        Ok(outcomes)
    }

    async fn recover_processing(&self, queue: &str) -> Result<usize, QueueError> {
        let mut recovered = 0;
        for consumer in self.expired_consumers(queue).await? {
            let count = self.recover_consumer(queue, consumer).await?;
            debug!(queue = %queue, consumer_id = %consumer, count, "Drained expired consumer");
            recovered += count;
        }

        if recovered > 0 {
            info!(queue = %queue, recovered, "Recovered jobs from processing queue");
        }
        Ok(recovered)
    }

    async fn stats(&self, queue: &str) -> Result<QueueStats, QueueError> {
        let mut pending_conn = self.redis.clone();
        let mut dead_conn = self.redis.clone();
        let pending_key = self.queue_key(queue);
        let dead_letter_key = self.dead_letter_key(queue);

        let (pending_jobs, dead_letter_jobs): (usize, usize) = tokio::try_join!(
            pending_conn.llen(&pending_key),
            dead_conn.llen(&dead_letter_key),
        )?;

        let mut conn = self.redis.clone();
        let members: Vec<String> = conn.smembers(self.consumers_key(queue)).await?;
        let mut processing_jobs = 0;
        for member in members {
            let Ok(consumer) = Uuid::parse_str(&member) else {
                continue;
            };
            let held: usize = conn
                .llen(processing_key(&self.prefix, queue, consumer))
                .await?;
            processing_jobs += held;
        }

        Ok(QueueStats {
            queue_name: queue.to_string(),
            pending_jobs,
            processing_jobs,
            dead_letter_jobs,
        })
    }

    async fn peek_dead_letter(
        &self,
        queue: &str,
        limit: usize,
    ) -> Result<Vec<serde_json::Value>, QueueError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.redis.clone();
        let data: Vec<String> = conn
            .lrange(self.dead_letter_key(queue), 0, limit as isize - 1)
            .await?;

        let entries: Result<Vec<serde_json::Value>, _> =
            data.iter().map(|s| serde_json::from_str(s)).collect();
        Ok(entries?)
    }
}

impl Drop for RedisQueue {
    fn drop(&mut self) {
        // The lease then lapses and other processes may recover our jobs.
        self.heartbeat.abort();
    }
}

/// Keeps a consumer lease alive until the owning queue is dropped.
async fn refresh_lease(mut redis: ConnectionManager, lease_key: String) {
    let mut ticker = tokio::time::interval(Duration::from_secs(CONSUMER_LEASE_SECS / 3));
    loop {
        ticker.tick().await;
        if let Err(e) = renew_lease(&mut redis, &lease_key).await {
            warn!(lease = %lease_key, error = %e, "Failed to refresh consumer lease");
        }
    }
}

async fn renew_lease(redis: &mut ConnectionManager, lease_key: &str) -> Result<(), QueueError> {
    redis::cmd("SET")
        .arg(lease_key)
        .arg("alive")
        .arg("EX")
        .arg(CONSUMER_LEASE_SECS)
        .query_async::<_, ()>(redis)
        .await?;
    Ok(())
}

fn queue_key(prefix: &str, queue: &str) -> String {
    format!("{}:queue:{}", prefix, queue)
}

fn processing_key(prefix: &str, queue: &str, consumer: Uuid) -> String {
    format!("{}:processing:{}", queue_key(prefix, queue), consumer)
}

fn lease_key(prefix: &str, consumer: Uuid) -> String {
    format!("{}:consumer:{}", prefix, consumer)
}

fn flow_key(prefix: &str, parent_id: Uuid, suffix: &str) -> String {
    format!("{}:flow:{}:{}", prefix, parent_id, suffix)
}
