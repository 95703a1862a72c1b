//! Dispatch queue
//!
//! At-least-once delivery of job batches from producers to forwarder
//! workers. Every [`Delivery`] must be settled with `ack` or `nack`; a
//! delivery dropped unsettled (worker crashed or was cancelled mid-batch)
//! goes back on the queue.

use crate::error::{Result, SyncError};
use crate::job::JobBatch;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

#[async_trait]
pub trait DispatchQueue: Send + Sync {
    /// Destination name
    fn name(&self) -> &str;

    /// Enqueue a batch; never waits for indexing
    async fn publish(&self, batch: &JobBatch) -> Result<()>;

    /// Next delivery, or None once the queue is closed
    async fn receive(&self) -> Result<Option<Delivery>>;

    /// Stop accepting and handing out batches
    fn close(&self);
}

/// Puts an unsettled batch back on its queue
pub trait Redelivery: Send + Sync {
    fn redeliver(&self, batch: JobBatch);
}

/// A received batch awaiting acknowledgement
pub struct Delivery {
    batch: JobBatch,
    redelivery: Arc<dyn Redelivery>,
    settled: bool,
}

impl Delivery {
    pub fn new(batch: JobBatch, redelivery: Arc<dyn Redelivery>) -> Self {
        Self {
            batch,
            redelivery,
            settled: false,
        }
    }

    pub fn batch(&self) -> &JobBatch {
        &self.batch
    }

    /// Batch fully handled; remove it from the queue
    pub fn ack(mut self) {
        self.settled = true;
        debug!(batch_id = %self.batch.batch_id, "Batch acked");
    }

    /// Batch not handled; put it back for another attempt if `requeue`
    pub fn nack(mut self, requeue: bool) {
        self.settled = true;
        if requeue {
            self.redelivery.redeliver(self.batch.clone().redelivered());
        } else {
            warn!(batch_id = %self.batch.batch_id, "Batch nacked without requeue, dropped");
        }
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        if !self.settled {
            warn!(
                batch_id = %self.batch.batch_id,
                attempt = self.batch.attempt,
                "Delivery dropped unsettled, redelivering"
            );
            self.redelivery.redeliver(self.batch.clone().redelivered());
        }
    }
}

struct ChannelRedelivery {
    sender: mpsc::UnboundedSender<Vec<u8>>,
}

impl Redelivery for ChannelRedelivery {
    fn redeliver(&self, batch: JobBatch) {
        let payload = match batch.to_bytes() {
            Ok(payload) => payload,
            Err(e) => {
                error!(batch_id = %batch.batch_id, error = %e, "Cannot serialize batch for redelivery");
                return;
            }
        };
        if self.sender.send(payload).is_err() {
            warn!(batch_id = %batch.batch_id, "Queue gone, redelivery lost");
        }
    }
}

/// In-process queue over an unbounded tokio channel of serialized batches
///
/// Consumers share one receiver; each batch goes to exactly one of them.
pub struct InMemoryDispatchQueue {
    name: String,
    sender: mpsc::UnboundedSender<Vec<u8>>,
    receiver: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    redelivery: Arc<ChannelRedelivery>,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

impl InMemoryDispatchQueue {
    pub fn new(name: impl Into<String>) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            name: name.into(),
            redelivery: Arc::new(ChannelRedelivery {
                sender: sender.clone(),
            }),
            sender,
            receiver: Mutex::new(receiver),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl DispatchQueue for InMemoryDispatchQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn publish(&self, batch: &JobBatch) -> Result<()> {
        if self.is_closed() {
            return Err(SyncError::QueueClosed(self.name.clone()));
        }
        let payload = batch.to_bytes()?;
        self.sender
            .send(payload)
            .map_err(|_| SyncError::QueueClosed(self.name.clone()))?;
        debug!(
            queue = %self.name,
            batch_id = %batch.batch_id,
            items = batch.items.len(),
            "Batch published"
        );
        Ok(())
    }

    async fn receive(&self) -> Result<Option<Delivery>> {
        loop {
            if self.is_closed() {
                return Ok(None);
            }

            let payload = {
                let mut receiver = self.receiver.lock().await;
                tokio::select! {
                    _ = self.shutdown.cancelled() => return Ok(None),
                    payload = receiver.recv() => payload,
                }
            };

            let Some(payload) = payload else {
                return Ok(None);
            };

            match JobBatch::from_bytes(&payload) {
                Ok(batch) => {
                    let redelivery: Arc<dyn Redelivery> = self.redelivery.clone();
                    return Ok(Some(Delivery::new(batch, redelivery)));
                }
                // Undecodable payloads can never succeed; drop them
                Err(e) => error!(queue = %self.name, error = %e, "Discarding malformed batch"),
            }
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.shutdown.cancel();
    }
}
