//! Ordering pipeline: bounded multi-producer queue with a fixed consumer pool.
//!
//! ARCHITECTURE
//! ============
//! Every connection task publishes `EditEvent`s; a fixed set of worker tasks
//! consumes them. Events are partitioned by picture id, one bounded channel
//! and one worker per partition, so a room is always drained by the same
//! worker and unrelated rooms proceed in parallel.
//!
//! ORDERING
//! ========
//! Publishing first claims a slot in the partition's queue without holding
//! any lock. Only then does it take the partition's publish lock, draw the
//! next value of the shared sequence counter and enqueue. Sequence numbers
//! therefore form one total order, and each partition's queue (and with it
//! each room) sees a sub-order of it. The lock is never held across a wait
//! for capacity.
//!
//! BACKPRESSURE
//! ============
//! `publish` waits for a free slot; `try_publish` fails with
//! `QueueSaturated`. Queues never grow past their configured capacity.
//!
//! FAULTS
//! ======
//! A handler error or panic is logged and the event is dropped. The worker
//! moves on to the next event.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::FutureExt;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::message::{EditRequest, EditUser, ErrorCode};
use crate::services::broadcast::DispatchFault;
use crate::services::registry::{ConnectionHandle, PictureId};

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, Clone)]
pub enum EventKind {
    /// Connection starts watching the picture.
    Join,
    Request(EditRequest),
    /// Connection went away, cleanly or not.
    Leave,
}

/// Envelope around one inbound event. Built at publish time, immutable after.
#[derive(Debug, Clone)]
pub struct EditEvent {
    pub sequence: u64,
    pub picture_id: PictureId,
    pub session: ConnectionHandle,
    pub kind: EventKind,
}

impl EditEvent {
    #[must_use]
    pub fn user(&self) -> &EditUser {
        &self.session.user
    }
}

#[async_trait::async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &EditEvent) -> Result<(), DispatchFault>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PipelineError {
    #[error("edit queue saturated, try again shortly")]
    QueueSaturated,
    #[error("edit pipeline is shut down")]
    Closed,
}

impl ErrorCode for PipelineError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::QueueSaturated => "E_QUEUE_SATURATED",
            Self::Closed => "E_PIPELINE_CLOSED",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::QueueSaturated)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineConfig {
    pub workers: usize,
    /// Slots per partition.
    pub capacity: usize,
}

// =============================================================================
// PIPELINE
// =============================================================================

#[derive(Clone)]
pub struct EditPipeline {
    inner: Arc<PipelineInner>,
}

struct PipelineInner {
    partitions: Vec<Mutex<Option<mpsc::Sender<EditEvent>>>>,
    sequence: AtomicU64,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl EditPipeline {
    /// Start one consumer task per partition, all feeding `handler`.
    #[must_use]
    pub fn spawn(config: PipelineConfig, handler: Arc<dyn EventHandler>) -> Self {
        let workers = config.workers.max(1);
        let capacity = config.capacity.max(1);

        let mut partitions = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);
        for index in 0..workers {
            let (tx, rx) = mpsc::channel(capacity);
            partitions.push(Mutex::new(Some(tx)));
            handles.push(tokio::spawn(run_partition(index, rx, Arc::clone(&handler))));
        }

        info!(workers, capacity, "edit pipeline started");
        Self {
            inner: Arc::new(PipelineInner {
                partitions,
                sequence: AtomicU64::new(0),
                workers: Mutex::new(handles),
            }),
        }
    }

    /// Publish, waiting for a free slot if the partition is full.
    ///
    /// # Errors
    ///
    /// Returns `Closed` after shutdown.
    pub async fn publish(
        &self,
        picture_id: PictureId,
        session: ConnectionHandle,
        kind: EventKind,
    ) -> Result<u64, PipelineError> {
        let tx = self.sender(picture_id).await?;
        let permit = tx.reserve().await.map_err(|_| PipelineError::Closed)?;
        Ok(self.commit(permit, picture_id, session, kind).await)
    }

    /// Publish without waiting for capacity.
    ///
    /// # Errors
    ///
    /// Returns `QueueSaturated` if the partition is full, `Closed` after
    /// shutdown.
    pub async fn try_publish(
        &self,
        picture_id: PictureId,
        session: ConnectionHandle,
        kind: EventKind,
    ) -> Result<u64, PipelineError> {
        use tokio::sync::mpsc::error::TrySendError;

        let tx = self.sender(picture_id).await?;
        let permit = tx.try_reserve().map_err(|e| match e {
            TrySendError::Full(()) => PipelineError::QueueSaturated,
            TrySendError::Closed(()) => PipelineError::Closed,
        })?;
        Ok(self.commit(permit, picture_id, session, kind).await)
    }

    /// Stop accepting events and wait for workers to drain what is queued.
    pub async fn shutdown(&self) {
        for partition in &self.inner.partitions {
            partition.lock().await.take();
        }
        let handles = std::mem::take(&mut *self.inner.workers.lock().await);
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "edit pipeline worker join failed");
            }
        }
        info!("edit pipeline stopped");
    }

    /// Clone of the partition's sender. The lock is released on return.
    async fn sender(&self, picture_id: PictureId) -> Result<mpsc::Sender<EditEvent>, PipelineError> {
        self.partition(picture_id)
            .lock()
            .await
            .clone()
            .ok_or(PipelineError::Closed)
    }

    // Sequence draw and enqueue happen under the partition lock, so sequence
    // order matches queue order. Nothing inside awaits.
    async fn commit(
        &self,
        permit: mpsc::Permit<'_, EditEvent>,
        picture_id: PictureId,
        session: ConnectionHandle,
        kind: EventKind,
    ) -> u64 {
        let _order = self.partition(picture_id).lock().await;
        let sequence = self.inner.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        permit.send(EditEvent { sequence, picture_id, session, kind });
        sequence
    }

    fn partition(&self, picture_id: PictureId) -> &Mutex<Option<mpsc::Sender<EditEvent>>> {
        &self.inner.partitions[partition_index(picture_id, self.inner.partitions.len())]
    }
}

fn partition_index(picture_id: PictureId, partitions: usize) -> usize {
    let n = u64::try_from(partitions).unwrap_or(1).max(1);
    usize::try_from(picture_id.unsigned_abs() % n).unwrap_or(0)
}

// =============================================================================
// WORKER
// =============================================================================

async fn run_partition(index: usize, mut rx: mpsc::Receiver<EditEvent>, handler: Arc<dyn EventHandler>) {
    while let Some(event) = rx.recv().await {
        let seq = event.sequence;
        let picture_id = event.picture_id;
        match AssertUnwindSafe(handler.handle(&event)).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(partition = index, seq, %picture_id, error = %e, "edit pipeline: event dropped");
            }
            Err(_) => {
                error!(partition = index, seq, %picture_id, "edit pipeline: handler panicked, event dropped");
            }
        }
    }
    debug!(partition = index, "edit pipeline worker exited");
}

#[cfg(test)]
#[path = "pipeline_test.rs"]
mod tests;
