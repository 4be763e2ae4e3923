//! Transport between the gateway and workers: the audio-jobs stream workers
//! consume from, and the per-client pub/sub channel results arrive on.
//! Modeled the same way as the session store — a trait plus a Redis-backed
//! implementation, with in-memory fakes for tests.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::Config;
use crate::envelopes::JobEnvelope;
use crate::error::BusError;

/// The queue workers pull audio jobs from. `stream_depth` backs the
/// admission-control backpressure check in the job dispatcher.
#[async_trait]
pub trait AudioJobStream: Send + Sync {
    async fn publish(&self, job: &JobEnvelope) -> Result<(), BusError>;
    async fn stream_depth(&self) -> Result<u64, BusError>;
}

/// Per-client result delivery. A distinct subscription is opened per
/// connected client so cross-client leakage is prevented by topic
/// isolation rather than by filtering at the receiver.
#[async_trait]
pub trait ResultBus: Send + Sync {
    /// Subscribe to `results:<client_id>`, returning a channel of raw
    /// message bytes. Dropping the receiver does not unsubscribe; callers
    /// must call `unsubscribe` explicitly on client disconnect.
    async fn subscribe(&self, client_id: &str) -> Result<mpsc::Receiver<Vec<u8>>, BusError>;
    async fn unsubscribe(&self, client_id: &str);
}

pub struct RedisAudioJobStream {
    conn: ConnectionManager,
    stream_name: String,
}

impl RedisAudioJobStream {
    pub fn new(conn: ConnectionManager, config: &Config) -> Self {
        Self {
            conn,
            stream_name: config.audio_jobs_stream.clone(),
        }
    }
}

#[async_trait]
impl AudioJobStream for RedisAudioJobStream {
    async fn publish(&self, job: &JobEnvelope) -> Result<(), BusError> {
        let mut conn = self.conn.clone();
        let fields = job.to_fields();
        let field_refs: Vec<(&str, &str)> = fields.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        conn.xadd::<_, _, _, _, ()>(&self.stream_name, "*", &field_refs)
            .await
            .map_err(|e| BusError::PublishFailed {
                stream: self.stream_name.clone(),
                reason: e.to_string(),
            })?;
        debug!(job_id = %job.job_id, client_id = %job.client_id, "audio job published");
        Ok(())
    }

    async fn stream_depth(&self) -> Result<u64, BusError> {
        let mut conn = self.conn.clone();
        let len: u64 = conn
            .xlen(&self.stream_name)
            .await
            .map_err(|e| BusError::Unavailable(e.to_string()))?;
        Ok(len)
    }
}

/// Redis pub/sub backed result bus. Each subscription spawns a dedicated
/// task reading a fresh pub/sub connection and forwarding raw message bytes
/// into an mpsc channel; the task exits when told to unsubscribe or when
/// the channel's receiver is dropped and a send fails.
pub struct RedisResultBus {
    client: redis::Client,
    channel_prefix: String,
    subscriptions: Mutex<HashMap<String, tokio::task::JoinHandle<()>>>,
}

impl RedisResultBus {
    pub fn new(client: redis::Client, config: &Config) -> Self {
        Self {
            client,
            channel_prefix: config.results_channel_prefix.clone(),
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    fn channel(&self, client_id: &str) -> String {
        format!("{}{}", self.channel_prefix, client_id)
    }
}

#[async_trait]
impl ResultBus for RedisResultBus {
    async fn subscribe(&self, client_id: &str) -> Result<mpsc::Receiver<Vec<u8>>, BusError> {
        let channel = self.channel(client_id);
        let (tx, rx) = mpsc::channel(64);

        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| BusError::Unavailable(e.to_string()))?;
        pubsub
            .subscribe(&channel)
            .await
            .map_err(|e| BusError::Unavailable(e.to_string()))?;

        let channel_for_task = channel.clone();
        let handle = tokio::spawn(async move {
            use futures::StreamExt;
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let payload: Vec<u8> = match msg.get_payload_bytes() {
                    bytes => bytes.to_vec(),
                };
                if tx.send(payload).await.is_err() {
                    break;
                }
            }
            debug!(channel = %channel_for_task, "result subscription task exiting");
        });

        self.subscriptions.lock().unwrap().insert(client_id.to_string(), handle);
        Ok(rx)
    }

    async fn unsubscribe(&self, client_id: &str) {
        if let Some(handle) = self.subscriptions.lock().unwrap().remove(client_id) {
            handle.abort();
        }
    }
}

/// In-memory job stream for tests: records published jobs and reports a
/// caller-controlled depth so backpressure paths can be exercised.
#[derive(Default)]
pub struct InMemoryJobStream {
    pub published: Mutex<Vec<JobEnvelope>>,
    pub depth: Mutex<u64>,
}

impl InMemoryJobStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_depth(&self, depth: u64) {
        *self.depth.lock().unwrap() = depth;
    }

    pub fn published_jobs(&self) -> Vec<JobEnvelope> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait]
impl AudioJobStream for InMemoryJobStream {
    async fn publish(&self, job: &JobEnvelope) -> Result<(), BusError> {
        self.published.lock().unwrap().push(job.clone());
        Ok(())
    }

    async fn stream_depth(&self) -> Result<u64, BusError> {
        Ok(*self.depth.lock().unwrap())
    }
}

/// In-memory result bus for tests: the test harness pushes bytes directly
/// into a client's sender half to simulate a worker publishing a result.
#[derive(Default)]
pub struct InMemoryResultBus {
    senders: Mutex<HashMap<String, mpsc::Sender<Vec<u8>>>>,
}

impl InMemoryResultBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a raw result message to a subscribed client, as a worker would.
    pub async fn deliver(&self, client_id: &str, payload: Vec<u8>) -> bool {
        let sender = self.senders.lock().unwrap().get(client_id).cloned();
        match sender {
            Some(sender) => sender.send(payload).await.is_ok(),
            None => {
                warn!(client_id, "deliver called with no active subscription");
                false
            }
        }
    }
}

#[async_trait]
impl ResultBus for InMemoryResultBus {
    async fn subscribe(&self, client_id: &str) -> Result<mpsc::Receiver<Vec<u8>>, BusError> {
        let (tx, rx) = mpsc::channel(64);
        self.senders.lock().unwrap().insert(client_id.to_string(), tx);
        Ok(rx)
    }

    async fn unsubscribe(&self, client_id: &str) {
        self.senders.lock().unwrap().remove(client_id);
    }
}
