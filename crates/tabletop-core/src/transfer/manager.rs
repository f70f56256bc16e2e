//! Per-connection transfer bookkeeping.
//!
//! # Fairness
//!
//! Producers sit in a FIFO queue.  [`AssetTransferManager::next_chunk`] pops
//! the head, takes one chunk from it and pushes it back to the tail unless it
//! is finished.  Two producers A and B with three chunks each therefore yield
//! A, B, A, B, A, B rather than A, A, A, B, B, B, so a small token image is
//! never stuck behind a huge map.
//!
//! # Locking
//!
//! One mutex guards both the producer queue and the consumer map.  Each call
//! holds it for at most one chunk of file I/O.  Listener callbacks run while
//! the lock is held, which keeps events for one manager in order; listeners
//! must return quickly and must not call back into the same manager.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, warn};

use super::{AssetConsumer, AssetProducer, TransferError, TransferEvent};
use crate::domain::asset::{AssetChunk, AssetId};
use crate::observer::ObserverList;

/// Receives progress and completion events from a manager.
pub trait TransferListener: Send + Sync {
    fn on_transfer_event(&self, event: &TransferEvent);
}

#[derive(Default)]
struct TransferState {
    producers: VecDeque<AssetProducer>,
    consumers: HashMap<AssetId, AssetConsumer>,
}

/// All in-flight transfers for one connection, in both directions.
#[derive(Default)]
pub struct AssetTransferManager {
    state: Mutex<TransferState>,
    listeners: ObserverList<dyn TransferListener>,
}

impl AssetTransferManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, TransferState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_listener(&self, listener: Arc<dyn TransferListener>) {
        self.listeners.add(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn TransferListener>) -> bool {
        self.listeners.remove(listener)
    }

    // ── Send side ─────────────────────────────────────────────────────────────

    /// Queues `producer` behind the transfers already in progress.
    pub fn add_producer(&self, producer: AssetProducer) {
        debug!("queued asset {} for sending", producer.id());
        self.lock().producers.push_back(producer);
    }

    /// Takes one chunk of at most `max_size` bytes from the producer at the
    /// head of the queue.
    ///
    /// Returns `Ok(None)` when nothing is queued.  Producers with nothing
    /// left to send are discarded without yielding a chunk.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::Io`] when the head producer cannot read its
    /// source.  That producer is dropped; every other transfer is untouched.
    pub fn next_chunk(&self, max_size: usize) -> Result<Option<AssetChunk>, TransferError> {
        let mut state = self.lock();
        while let Some(mut producer) = state.producers.pop_front() {
            if producer.is_complete() {
                continue;
            }
            match producer.next_chunk(max_size) {
                Ok(chunk) => {
                    if !producer.is_complete() {
                        state.producers.push_back(producer);
                    }
                    return Ok(Some(chunk));
                }
                Err(source) => {
                    warn!("aborting send of asset {}: {source}", producer.id());
                    return Err(TransferError::Io {
                        id: producer.id().clone(),
                        source,
                    });
                }
            }
        }
        Ok(None)
    }

    pub fn pending_producers(&self) -> usize {
        self.lock().producers.len()
    }

    // ── Receive side ──────────────────────────────────────────────────────────

    /// Registers a download announced by an asset header.
    ///
    /// An empty asset needs no chunks: its destination is created and the
    /// completion event fires immediately.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::DuplicateConsumer`] if the asset is already
    /// being downloaded, or [`TransferError::Io`] if an empty asset's
    /// destination cannot be created.
    pub fn add_consumer(&self, consumer: AssetConsumer) -> Result<(), TransferError> {
        let mut state = self.lock();
        if state.consumers.contains_key(consumer.id()) {
            return Err(TransferError::DuplicateConsumer(consumer.id().clone()));
        }
        if consumer.is_complete() {
            create_empty(&consumer)?;
            self.fire(&completion(&consumer));
            return Ok(());
        }
        state.consumers.insert(consumer.id().clone(), consumer);
        Ok(())
    }

    /// Routes `chunk` to its consumer and reports progress or completion.
    ///
    /// # Errors
    ///
    /// - [`TransferError::UnknownAsset`] when no header was announced for the
    ///   chunk's asset: the two ends disagree about what is being sent.
    /// - Any error from [`AssetConsumer::update`]; the failing consumer is
    ///   removed so the asset can be requested again.
    pub fn update(&self, chunk: &AssetChunk) -> Result<(), TransferError> {
        let mut state = self.lock();
        let consumer = state
            .consumers
            .get_mut(&chunk.id)
            .ok_or_else(|| TransferError::UnknownAsset(chunk.id.clone()))?;

        if let Err(e) = consumer.update(chunk) {
            warn!("aborting download of asset {}: {e}", chunk.id);
            state.consumers.remove(&chunk.id);
            return Err(e);
        }

        if consumer.is_complete() {
            if let Some(done) = state.consumers.remove(&chunk.id) {
                debug!("asset {} downloaded to {}", done.id(), done.destination().display());
                self.fire(&completion(&done));
            }
        } else {
            let event = TransferEvent::Progress {
                id: chunk.id.clone(),
                received: consumer.received(),
                total: consumer.header().size,
            };
            self.fire(&event);
        }
        Ok(())
    }

    pub fn pending_consumers(&self) -> usize {
        self.lock().consumers.len()
    }

    pub fn is_downloading(&self, id: &AssetId) -> bool {
        self.lock().consumers.contains_key(id)
    }

    /// Drops every producer and consumer, e.g. when the connection goes away.
    pub fn flush(&self) {
        let mut state = self.lock();
        if !state.producers.is_empty() || !state.consumers.is_empty() {
            debug!(
                "flushing {} producer(s) and {} consumer(s)",
                state.producers.len(),
                state.consumers.len()
            );
        }
        state.producers.clear();
        state.consumers.clear();
    }

    pub fn is_idle(&self) -> bool {
        let state = self.lock();
        state.producers.is_empty() && state.consumers.is_empty()
    }

    fn fire(&self, event: &TransferEvent) {
        self.listeners.for_each(|l| l.on_transfer_event(event));
    }
}

fn completion(consumer: &AssetConsumer) -> TransferEvent {
    TransferEvent::Complete {
        id: consumer.id().clone(),
        name: consumer.header().name.clone(),
        path: consumer.destination().to_path_buf(),
    }
}

fn create_empty(consumer: &AssetConsumer) -> Result<(), TransferError> {
    let io = |source| TransferError::Io {
        id: consumer.id().clone(),
        source,
    };
    if let Some(dir) = consumer.destination().parent() {
        std::fs::create_dir_all(dir).map_err(io)?;
    }
    std::fs::File::create(consumer.destination()).map_err(io)?;
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
