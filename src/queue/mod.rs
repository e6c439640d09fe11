//! Redis-backed dispatch queue.
//!
//! Three ordered lists define dispatch state: jobs wait in
//! `pending_jobs`, move atomically to `processing_jobs` while a worker
//! holds them, and park in `dlq_tasks` once their retry budget is
//! spent. The client keeps one persistent connection, pings before
//! every operation, and reconnects once on failure.
//!
//! Queue operations deliberately do not take the caller's cancellation
//! token: an interrupted pending→processing move could lose the id.
//! The bounded pop timeout keeps shutdown prompt instead.

use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;

use crate::error::{Result, SchedulerError};

pub const PENDING_JOBS_QUEUE: &str = "pending_jobs";
pub const PROCESSING_JOBS_QUEUE: &str = "processing_jobs";
pub const DLQ_JOBS_QUEUE: &str = "dlq_tasks";

const POP_TIMEOUT_SECS: u64 = 5;

pub struct DispatchQueue {
    client: redis::Client,
    conn: Option<MultiplexedConnection>,
}

impl DispatchQueue {
    /// Connect to the broker. `addr` is `host:port` or a full redis URL.
    pub async fn connect(addr: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url(addr))?;
        let mut queue = Self { client, conn: None };
        queue.reconnect().await?;
        tracing::info!(addr, "connected to redis broker");
        Ok(queue)
    }

    async fn reconnect(&mut self) -> Result<MultiplexedConnection> {
        self.conn = None;
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        debug_assert_eq!(pong, "PONG");
        self.conn = Some(conn.clone());
        Ok(conn)
    }

    /// Health-check the cached connection, reconnecting if the ping fails.
    async fn ensure_connected(&mut self) -> Result<MultiplexedConnection> {
        if let Some(conn) = &mut self.conn {
            let ping: redis::RedisResult<String> =
                redis::cmd("PING").query_async(&mut *conn).await;
            match ping {
                Ok(_) => return Ok(conn.clone()),
                Err(e) => tracing::warn!(error = %e, "redis connection lost, reconnecting"),
            }
        }
        self.reconnect().await
    }

    /// Append a job id to the tail of the pending list. Duplicates are
    /// permitted here; the store's unique id keeps lifecycles single.
    pub async fn push(&mut self, id: &str) -> Result<()> {
        let mut conn = self.ensure_connected().await?;
        let _: i64 = conn.rpush(PENDING_JOBS_QUEUE, id).await?;
        Ok(())
    }

    /// Atomically move the head of pending to the tail of processing,
    /// blocking up to the pop timeout. An empty queue surfaces as
    /// QueueTimeout; broker errors trigger one reconnect before the
    /// error is returned.
    pub async fn pop(&mut self) -> Result<String> {
        let mut conn = self.ensure_connected().await?;
        let moved: Option<String> = match redis::cmd("BLMOVE")
            .arg(PENDING_JOBS_QUEUE)
            .arg(PROCESSING_JOBS_QUEUE)
            .arg("LEFT")
            .arg("RIGHT")
            .arg(POP_TIMEOUT_SECS)
            .query_async(&mut conn)
            .await
        {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "blocking pop failed");
                self.reconnect().await?;
                return Err(SchedulerError::Queue(e));
            }
        };
        moved.ok_or(SchedulerError::QueueTimeout)
    }

    /// Drop the first occurrence of `id` from the processing list.
    pub async fn ack(&mut self, id: &str) -> Result<()> {
        let mut conn = self.ensure_connected().await?;
        let removed: i64 = conn.lrem(PROCESSING_JOBS_QUEUE, 1, id).await?;
        if removed == 0 {
            tracing::debug!(job_id = id, "ack found no processing entry");
        }
        Ok(())
    }

    /// Move a job from processing back to the tail of pending.
    pub async fn requeue(&mut self, id: &str) -> Result<()> {
        let mut conn = self.ensure_connected().await?;
        let _: i64 = conn.lrem(PROCESSING_JOBS_QUEUE, 1, id).await?;
        let _: i64 = conn.rpush(PENDING_JOBS_QUEUE, id).await?;
        Ok(())
    }

    /// Move a job from processing to the dead-letter list.
    pub async fn dead_letter(&mut self, id: &str) -> Result<()> {
        let mut conn = self.ensure_connected().await?;
        let _: i64 = conn.lrem(PROCESSING_JOBS_QUEUE, 1, id).await?;
        let _: i64 = conn.rpush(DLQ_JOBS_QUEUE, id).await?;
        Ok(())
    }

    /// Current length of one of the queue lists.
    pub async fn depth(&mut self, list: &str) -> Result<i64> {
        let mut conn = self.ensure_connected().await?;
        let len: i64 = conn.llen(list).await?;
        Ok(len)
    }
}

fn redis_url(addr: &str) -> String {
    if addr.contains("://") {
        addr.to_string()
    } else {
        format!("redis://{addr}")
    }
}
