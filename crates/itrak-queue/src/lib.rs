//! Durable FIFO hand-off of company names to the people-search stage.
//!
//! The queue is the one multi-process seam in the system: the monitor process
//! enqueues, worker processes dequeue. Deduplication is set-based over
//! normalized (trimmed, case-folded) names and is monotone for the store's
//! lifetime: a name ever enqueued is never enqueued again, even after the
//! FIFO has drained. Delivery is at-least-once and lossy by design; a dequeue
//! that is never acted on downstream is simply lost, not requeued.

use std::collections::{HashSet, VecDeque};
use std::num::NonZeroUsize;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use redis::Commands;
use serde_json::json;
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "itrak-queue";

pub const DEFAULT_QUEUE_KEY: &str = "itrak:companies";
pub const DEFAULT_SEEN_SET_KEY: &str = "itrak:companies:seen";
pub const DEFAULT_DEQUEUE_TIMEOUT: Duration = Duration::from_secs(5);

/// Transport failures are hard failures for the caller; there is no local
/// fallback queue.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue transport error: {0}")]
    Transport(#[from] redis::RedisError),
}

pub trait WorkQueue: Send + Sync {
    /// Enqueue a company name unless its normalized form has ever been seen.
    /// The FIFO entry carries the original, non-normalized name. Returns
    /// whether the name was newly enqueued; blank names are rejected.
    fn enqueue(&self, name: &str) -> Result<bool, QueueError>;

    /// Pop the next company name. In blocking mode, waits up to `timeout`
    /// before returning `None`; otherwise returns immediately.
    fn dequeue(&self, block: bool, timeout: Duration) -> Result<Option<String>, QueueError>;

    /// Current FIFO depth. The dedup set is not counted and never shrinks.
    fn len(&self) -> Result<usize, QueueError>;

    /// Administrative reset of both the FIFO and the dedup set.
    fn clear(&self) -> Result<(), QueueError>;
}

fn normalize(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Redis-backed queue: SADD on the seen set gates an RPUSH of a JSON payload;
/// consumers BLPOP with a bounded timeout.
pub struct RedisQueue {
    conn: Mutex<redis::Connection>,
    queue_key: String,
    seen_key: String,
}

impl RedisQueue {
    pub fn connect(url: &str, queue_key: &str, seen_key: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection()?;
        Ok(Self {
            conn: Mutex::new(conn),
            queue_key: queue_key.to_string(),
            seen_key: seen_key.to_string(),
        })
    }

    fn decode_payload(payload: &str) -> Option<String> {
        let value: serde_json::Value = match serde_json::from_str(payload) {
            Ok(value) => value,
            Err(err) => {
                debug!(%err, "discarding undecodable queue payload");
                return None;
            }
        };
        value
            .get("company")
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }
}

impl WorkQueue for RedisQueue {
    fn enqueue(&self, name: &str) -> Result<bool, QueueError> {
        let original = name.trim();
        if original.is_empty() {
            return Ok(false);
        }
        let normalized = normalize(original);

        let mut conn = self.conn.lock().expect("queue connection lock poisoned");
        let added: bool = conn.sadd(&self.seen_key, &normalized)?;
        if !added {
            return Ok(false);
        }
        let payload = json!({ "company": original }).to_string();
        let _: () = conn.rpush(&self.queue_key, payload)?;
        Ok(true)
    }

    fn dequeue(&self, block: bool, timeout: Duration) -> Result<Option<String>, QueueError> {
        let mut conn = self.conn.lock().expect("queue connection lock poisoned");
        let payload: Option<String> = if block {
            // BLPOP treats 0 as "wait forever"; clamp to at least one second
            // so a bounded timeout stays bounded.
            let secs = timeout.as_secs().max(1) as f64;
            let popped: Option<(String, String)> = conn.blpop(&self.queue_key, secs)?;
            popped.map(|(_, payload)| payload)
        } else {
            conn.lpop(&self.queue_key, None::<NonZeroUsize>)?
        };
        Ok(payload.as_deref().and_then(Self::decode_payload))
    }

    fn len(&self) -> Result<usize, QueueError> {
        let mut conn = self.conn.lock().expect("queue connection lock poisoned");
        Ok(conn.llen(&self.queue_key)?)
    }

    fn clear(&self) -> Result<(), QueueError> {
        let mut conn = self.conn.lock().expect("queue connection lock poisoned");
        let _: () = conn.del(&[&self.queue_key, &self.seen_key])?;
        Ok(())
    }
}

/// In-process queue with the same contract, for tests and single-process
/// runs. The dedup set lives as long as the value does.
#[derive(Default)]
pub struct MemoryQueue {
    inner: Mutex<Inner>,
    available: Condvar,
}

#[derive(Default)]
struct Inner {
    fifo: VecDeque<String>,
    seen: HashSet<String>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WorkQueue for MemoryQueue {
    fn enqueue(&self, name: &str) -> Result<bool, QueueError> {
        let original = name.trim();
        if original.is_empty() {
            return Ok(false);
        }
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        if !inner.seen.insert(normalize(original)) {
            return Ok(false);
        }
        inner.fifo.push_back(original.to_string());
        self.available.notify_one();
        Ok(true)
    }

    fn dequeue(&self, block: bool, timeout: Duration) -> Result<Option<String>, QueueError> {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        if block && inner.fifo.is_empty() {
            let deadline = Instant::now() + timeout;
            while inner.fifo.is_empty() {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Ok(None);
                }
                let (guard, _timed_out) = self
                    .available
                    .wait_timeout(inner, remaining)
                    .expect("queue lock poisoned");
                inner = guard;
            }
        }
        Ok(inner.fifo.pop_front())
    }

    fn len(&self) -> Result<usize, QueueError> {
        Ok(self.inner.lock().expect("queue lock poisoned").fifo.len())
    }

    fn clear(&self) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        inner.fifo.clear();
        inner.seen.clear();
        Ok(())
    }
}
