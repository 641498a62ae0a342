//! The durable outbox and its drain loop.
//!
//! The store is the single source of truth: every read goes to it and every
//! mutation is a locked load-modify-save, so an enqueue racing a drain is never
//! lost and nothing cached in memory can drift from disk.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fieldreg_core::{MutationKind, QueueItem, QueueStatus};
use fieldreg_storage::{keys, load_json, save_json, KeyValueStore, RemoteError, StoreError};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio::sync::Mutex;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::dispatch::SyncBackend;

#[derive(Debug, Clone, Copy)]
pub struct QueuePolicy {
    pub submit_timeout: Duration,
    pub upload_timeout: Duration,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
    /// Dead-letter server rejections (4xx) and unroutable payloads on first failure.
    pub dead_letter_rejections: bool,
}

impl Default for QueuePolicy {
    fn default() -> Self {
        Self {
            submit_timeout: Duration::from_secs(15),
            upload_timeout: Duration::from_secs(90),
            max_attempts: None,
            dead_letter_rejections: false,
        }
    }
}

impl QueuePolicy {
    pub fn timeout_for(&self, kind: MutationKind) -> Duration {
        if kind.is_upload() {
            self.upload_timeout
        } else {
            self.submit_timeout
        }
    }

    fn should_dead_letter(&self, attempts: u32, err: &RemoteError) -> bool {
        let exhausted = self.max_attempts.is_some_and(|max| attempts >= max);
        let rejected = self.dead_letter_rejections && !err.is_retryable();
        exhausted || rejected
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DrainSummary {
    pub synced: usize,
    /// Includes items moved to the dead-letter state during this drain.
    pub failed: usize,
    pub dead_lettered: usize,
    pub total: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainOutcome {
    Completed(DrainSummary),
    /// Another drain held the guard; nothing was touched.
    AlreadyRunning,
}

impl DrainOutcome {
    pub fn summary(&self) -> Option<&DrainSummary> {
        match self {
            DrainOutcome::Completed(summary) => Some(summary),
            DrainOutcome::AlreadyRunning => None,
        }
    }
}

pub struct SyncQueue {
    store: Arc<dyn KeyValueStore>,
    backend: Arc<dyn SyncBackend>,
    policy: QueuePolicy,
    drain_guard: Mutex<()>,
    items_lock: Mutex<()>,
}

impl SyncQueue {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        backend: Arc<dyn SyncBackend>,
        policy: QueuePolicy,
    ) -> Self {
        Self {
            store,
            backend,
            policy,
            drain_guard: Mutex::new(()),
            items_lock: Mutex::new(()),
        }
    }

    async fn load(&self) -> Result<Vec<QueueItem>, StoreError> {
        Ok(load_json(self.store.as_ref(), keys::QUEUE_ITEMS)
            .await?
            .unwrap_or_default())
    }

    async fn update<R>(
        &self,
        apply: impl FnOnce(&mut Vec<QueueItem>) -> R,
    ) -> Result<R, StoreError> {
        let _lock = self.items_lock.lock().await;
        let mut items = self.load().await?;
        let result = apply(&mut items);
        save_json(self.store.as_ref(), keys::QUEUE_ITEMS, &items).await?;
        Ok(result)
    }

    /// Appends a pending mutation. `created_at` never goes backwards within a queue.
    pub async fn enqueue(
        &self,
        kind: MutationKind,
        payload: JsonValue,
    ) -> Result<QueueItem, StoreError> {
        let result = self
            .update(|items| {
                let now = Utc::now();
                let created_at = items
                    .iter()
                    .map(|i| i.created_at)
                    .max()
                    .map_or(now, |latest| latest.max(now));
                let item = QueueItem::new(kind, payload, created_at);
                items.push(item.clone());
                item
            })
            .await;

        match &result {
            Ok(item) => info!(id = %item.id, kind = %item.kind, "queued mutation"),
            Err(err) => warn!(%kind, error = %err, "failed to persist queued mutation"),
        }
        result
    }

    /// Items awaiting delivery (pending or failed), read from the store.
    /// Outside a drain, leftover `IN_FLIGHT` items are undelivered too and count.
    /// A store failure is logged and reported as zero.
    pub async fn pending_count(&self) -> usize {
        let idle = !self.is_draining();
        match self.load().await {
            Ok(items) => items
                .iter()
                .filter(|i| i.status.is_pending() || (idle && i.status == QueueStatus::InFlight))
                .count(),
            Err(err) => {
                warn!(error = %err, "reading queue for pending count failed");
                0
            }
        }
    }

    /// Ordered snapshot of every stored item.
    pub async fn get_queue(&self) -> Vec<QueueItem> {
        match self.load().await {
            Ok(mut items) => {
                items.sort_by_key(|i| i.created_at);
                items
            }
            Err(err) => {
                warn!(error = %err, "reading queue snapshot failed");
                Vec::new()
            }
        }
    }

    pub fn is_draining(&self) -> bool {
        self.drain_guard.try_lock().is_err()
    }

    /// Resets items left `IN_FLIGHT` by a process that died mid-submit.
    pub async fn recover_in_flight(&self) -> Result<usize, StoreError> {
        let Ok(_guard) = self.drain_guard.try_lock() else {
            return Ok(0);
        };
        let recovered = self
            .update(|items| {
                let mut recovered = 0;
                for item in items.iter_mut().filter(|i| i.status == QueueStatus::InFlight) {
                    item.status = QueueStatus::Pending;
                    recovered += 1;
                }
                recovered
            })
            .await?;
        if recovered > 0 {
            info!(recovered, "reset interrupted in-flight items");
        }
        Ok(recovered)
    }

    pub async fn retry_dead_letters(&self) -> Result<usize, StoreError> {
        self.update(|items| {
            let mut revived = 0;
            for item in items
                .iter_mut()
                .filter(|i| i.status == QueueStatus::DeadLetter)
            {
                item.status = QueueStatus::Pending;
                item.attempts = 0;
                revived += 1;
            }
            revived
        })
        .await
    }

    pub async fn clear_dead_letters(&self) -> Result<usize, StoreError> {
        self.update(|items| {
            let before = items.len();
            items.retain(|i| i.status != QueueStatus::DeadLetter);
            before - items.len()
        })
        .await
    }

    /// One pass over every drainable item in FIFO order. Never fails: per-item
    /// errors land in the summary and on the item itself.
    pub async fn drain(&self) -> DrainOutcome {
        let Ok(_guard) = self.drain_guard.try_lock() else {
            debug!("drain already in progress; skipping");
            return DrainOutcome::AlreadyRunning;
        };

        let span = info_span!("drain");
        async {
            let started_at = Utc::now();
            let mut summary = DrainSummary {
                synced: 0,
                failed: 0,
                dead_lettered: 0,
                total: 0,
                started_at,
                finished_at: started_at,
            };

            let mut eligible = match self.load().await {
                Ok(items) => items
                    .into_iter()
                    .filter(|i| i.status.is_drainable())
                    .collect::<Vec<_>>(),
                Err(err) => {
                    warn!(error = %err, "reading queue for drain failed");
                    summary.finished_at = Utc::now();
                    return DrainOutcome::Completed(summary);
                }
            };
            eligible.sort_by_key(|i| i.created_at);
            summary.total = eligible.len();

            for item in eligible {
                match self.process(item.id).await {
                    ItemResult::Synced => summary.synced += 1,
                    ItemResult::Failed => summary.failed += 1,
                    ItemResult::DeadLettered => {
                        summary.failed += 1;
                        summary.dead_lettered += 1;
                    }
                    ItemResult::Vanished => summary.total -= 1,
                }
            }

            summary.finished_at = Utc::now();
            info!(
                synced = summary.synced,
                failed = summary.failed,
                dead_lettered = summary.dead_lettered,
                total = summary.total,
                "drain finished"
            );
            DrainOutcome::Completed(summary)
        }
        .instrument(span)
        .await
    }

    async fn process(&self, id: Uuid) -> ItemResult {
        let claimed = self
            .update(|items| {
                let item = items.iter_mut().find(|i| i.id == id)?;
                item.status = QueueStatus::InFlight;
                item.last_attempt_at = Some(Utc::now());
                Some(item.clone())
            })
            .await;

        let item = match claimed {
            Ok(Some(item)) => item,
            Ok(None) => return ItemResult::Vanished,
            Err(err) => {
                warn!(%id, error = %err, "could not mark item in flight; leaving it for the next drain");
                return ItemResult::Failed;
            }
        };

        match self.submit(&item).await {
            Ok(()) => match self.update(|items| items.retain(|i| i.id != id)).await {
                Ok(()) => {
                    debug!(%id, kind = %item.kind, "item synced");
                    ItemResult::Synced
                }
                Err(err) => {
                    // Still stored, so it is resubmitted later; the server dedups by id.
                    warn!(%id, error = %err, "delivered item could not be removed");
                    self.release(id).await;
                    ItemResult::Failed
                }
            },
            Err(err) => self.record_failure(&item, &err).await,
        }
    }

    /// Best effort: puts a claimed item back to PENDING.
    async fn release(&self, id: Uuid) {
        let reset = self
            .update(|items| {
                if let Some(item) = items.iter_mut().find(|i| i.id == id) {
                    item.status = QueueStatus::Pending;
                }
            })
            .await;
        if let Err(err) = reset {
            warn!(%id, error = %err, "could not release in-flight item");
        }
    }

    async fn submit(&self, item: &QueueItem) -> Result<(), RemoteError> {
        let timeout = self.policy.timeout_for(item.kind);
        match tokio::time::timeout(timeout, self.backend.submit(item)).await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::Timeout(timeout)),
        }
    }

    async fn record_failure(&self, item: &QueueItem, err: &RemoteError) -> ItemResult {
        let policy = self.policy;
        let message = err.to_string();
        let updated = self
            .update(|items| {
                let stored = items.iter_mut().find(|i| i.id == item.id)?;
                stored.attempts += 1;
                stored.last_error = Some(message);
                stored.status = if policy.should_dead_letter(stored.attempts, err) {
                    QueueStatus::DeadLetter
                } else {
                    QueueStatus::Failed
                };
                Some((stored.status, stored.attempts))
            })
            .await;

        match updated {
            Ok(Some((QueueStatus::DeadLetter, attempts))) => {
                warn!(id = %item.id, kind = %item.kind, attempts, error = %err, "item moved to dead letter");
                ItemResult::DeadLettered
            }
            Ok(Some((_, attempts))) => {
                warn!(id = %item.id, kind = %item.kind, attempts, error = %err, "item sync failed");
                ItemResult::Failed
            }
            Ok(None) => ItemResult::Failed,
            Err(store_err) => {
                warn!(id = %item.id, error = %store_err, "could not record item failure");
                ItemResult::Failed
            }
        }
    }
}

enum ItemResult {
    Synced,
    Failed,
    DeadLettered,
    /// Removed from the store between snapshot and claim.
    Vanished,
}
