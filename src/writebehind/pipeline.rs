use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;

use super::batcher::next_batch;
use super::store::ExistenceStore;
use crate::session::types::{SessionDeletion, SessionId, now_unix_seconds};

const EXISTENCE_BATCH_SIZE: usize = 5_000;
const DELETION_BATCH_SIZE: usize = 500;
const BATCH_WINDOW: Duration = Duration::from_millis(1_000);
const CHANNEL_CAPACITY: usize = 16_384;

/// Producer side of the pipeline, cloned into every session actor.
///
/// Sends never block an actor turn: when a channel is full the event is
/// dropped with a warning, consistent with the at-most-once contract of
/// the tracking table.
#[derive(Clone)]
pub struct WriteBehindHandle {
    existence_tx: mpsc::Sender<SessionId>,
    deletion_tx: mpsc::Sender<SessionDeletion>,
}

impl WriteBehindHandle {
    pub fn record_existence(&self, session_id: SessionId) {
        if let Err(e) = self.existence_tx.try_send(session_id) {
            tracing::warn!("Dropping existence event for {}: {}", session_id, e);
        }
    }

    pub fn record_deletion(&self, deletion: SessionDeletion) {
        if let Err(e) = self.deletion_tx.try_send(deletion) {
            tracing::warn!("Dropping deletion event: {}", e);
        }
    }
}

/// One entry of the JSON array POSTed to the invalidation callback.
#[derive(Debug, Serialize)]
struct DeletionNotification {
    session_id: SessionId,
    reason: String,
    deleted_at_unix_seconds: i64,
}

/// Spawns the two single-consumer drain tasks (existence upserts and
/// deletions) and returns the producer handle.
pub fn spawn(
    store: Arc<dyn ExistenceStore>,
    invalidation_callback_url: Option<String>,
) -> WriteBehindHandle {
    let (existence_tx, existence_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (deletion_tx, deletion_rx) = mpsc::channel(CHANNEL_CAPACITY);

    tokio::spawn(existence_loop(store.clone(), existence_rx));
    tokio::spawn(deletion_loop(store, deletion_rx, invalidation_callback_url));

    WriteBehindHandle {
        existence_tx,
        deletion_tx,
    }
}

async fn existence_loop(store: Arc<dyn ExistenceStore>, mut rx: mpsc::Receiver<SessionId>) {
    while let Some(batch) = next_batch(&mut rx, EXISTENCE_BATCH_SIZE, BATCH_WINDOW).await {
        tracing::debug!("Flushing {} existence event(s)", batch.len());

        if let Err(e) = store.create_sessions(&batch).await {
            // At-most-once: the batch is gone, the next one starts clean.
            tracing::error!("Write existence batch error: {}", e);
        }
    }

    tracing::info!("Existence pipeline drained");
}

async fn deletion_loop(
    store: Arc<dyn ExistenceStore>,
    mut rx: mpsc::Receiver<SessionDeletion>,
    callback_url: Option<String>,
) {
    let http_client = reqwest::Client::new();

    while let Some(batch) = next_batch(&mut rx, DELETION_BATCH_SIZE, BATCH_WINDOW).await {
        tracing::debug!("Flushing {} deletion event(s)", batch.len());

        if let Err(e) = store.delete_sessions(&batch).await {
            tracing::error!("Delete sessions batch error: {}", e);
            continue;
        }

        if let Some(url) = &callback_url {
            let deleted_at = now_unix_seconds();
            let notifications: Vec<DeletionNotification> = batch
                .iter()
                .map(|deletion| DeletionNotification {
                    session_id: deletion.session_id,
                    reason: deletion.reason.clone(),
                    deleted_at_unix_seconds: deleted_at,
                })
                .collect();

            // Fire-and-forget: a failed callback never blocks or fails the
            // pipeline.
            if let Err(e) = http_client.post(url).json(&notifications).send().await {
                tracing::warn!("Invalidation callback to {} failed: {}", url, e);
            }
        }
    }

    tracing::info!("Deletion pipeline drained");
}
