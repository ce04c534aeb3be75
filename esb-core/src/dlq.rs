//! Dead Letter Queue with caller-driven retry

use crate::{metrics, types::ServiceBusMessage, Error, Result};
use chrono::{DateTime, Utc};
use dashmap::{mapref::entry::Entry, DashMap};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Dead-letter policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterConfig {
    /// Retries before an entry is archived
    pub max_retry_attempts: u32,
    /// Age after which [`DeadLetterQueue::archive_expired`] archives an entry
    pub archive_after: Duration,
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self {
            max_retry_attempts: crate::DEFAULT_RETRY_ATTEMPTS,
            archive_after: Duration::from_secs(crate::DEFAULT_ARCHIVE_AFTER_HOURS * 3600),
        }
    }
}

/// Undeliverable message plus failure bookkeeping
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    /// Original message
    pub message: ServiceBusMessage,
    /// Why routing failed
    pub reason: String,
    /// Enqueued at
    pub enqueued_at: DateTime<Utc>,
    /// Retry attempts made
    pub retry_count: u32,
    /// No longer eligible for retry
    pub archived: bool,
    /// Last retry attempt
    pub last_retry_at: Option<DateTime<Utc>>,
    /// Failure reason of the last retry
    pub last_error: Option<String>,
    #[serde(skip)]
    sequence: u64,
    #[serde(skip)]
    retry_in_flight: bool,
}

/// Per-destination dead-letter counts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterMetrics {
    /// Service name
    pub service_name: String,
    /// Entries held
    pub total: usize,
    /// Entries still eligible for retry
    pub pending: usize,
    /// Entries retried at least once
    pub retried: usize,
    /// Archived entries
    pub archived: usize,
    /// Retry attempts across all entries
    pub retry_attempts: u64,
}

/// Result of a retry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetryOutcome {
    /// Redelivered; entry removed
    Delivered,
    /// Redelivery failed; entry kept for another attempt
    Failed {
        /// Attempts so far
        retry_count: u32,
    },
    /// Redelivery failed and the entry hit the retry limit
    Archived {
        /// Attempts so far
        retry_count: u32,
    },
    /// Another retry of the same entry is running
    InProgress,
}

/// In-memory dead letter queue keyed by message ID
pub struct DeadLetterQueue {
    entries: DashMap<String, DeadLetterEntry>,
    sequence: AtomicU64,
    config: DeadLetterConfig,
}

impl DeadLetterQueue {
    /// Create new DLQ
    pub fn new(config: DeadLetterConfig) -> Self {
        Self {
            entries: DashMap::new(),
            sequence: AtomicU64::new(0),
            config,
        }
    }

    /// Policy in force
    pub fn config(&self) -> &DeadLetterConfig {
        &self.config
    }

    /// Store a failed message.
    ///
    /// Re-adding an ID refreshes the message, reason and enqueue time of the
    /// existing entry but keeps its retry count, archive flag and any retry
    /// in flight.
    pub fn add(&self, message: ServiceBusMessage, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        let service = message.target_service.clone();
        warn!(
            "Message {} for {} dead-lettered: {}",
            message.id, service, reason
        );

        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let replaced_service = match self.entries.entry(message.id.clone()) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                debug!(
                    "Message {} re-added to DLQ (retry count {}, archived {})",
                    message.id, entry.retry_count, entry.archived
                );
                let previous = std::mem::replace(&mut entry.message, message);
                entry.reason = reason;
                entry.enqueued_at = Utc::now();
                entry.sequence = sequence;
                Some(previous.target_service)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(DeadLetterEntry {
                    message,
                    reason,
                    enqueued_at: Utc::now(),
                    retry_count: 0,
                    archived: false,
                    last_retry_at: None,
                    last_error: None,
                    sequence,
                    retry_in_flight: false,
                });
                None
            }
        };

        if let Some(previous) = replaced_service.filter(|previous| *previous != service) {
            self.publish_size(&previous);
        }
        self.publish_size(&service);
        true
    }

    /// Entry by message ID
    pub fn entry(&self, message_id: &str) -> Option<DeadLetterEntry> {
        self.entries.get(message_id).map(|e| e.clone())
    }

    /// Entries for `service_name`, most recent first
    pub fn entries_for(&self, service_name: &str) -> Vec<DeadLetterEntry> {
        let mut entries: Vec<_> = self
            .entries
            .iter()
            .filter(|e| e.message.target_service == service_name)
            .map(|e| e.value().clone())
            .collect();
        entries.sort_by(|a, b| b.sequence.cmp(&a.sequence));
        entries
    }

    /// Messages for `service_name`, most recent first
    pub fn messages_for(&self, service_name: &str) -> Vec<ServiceBusMessage> {
        self.entries_for(service_name)
            .into_iter()
            .map(|e| e.message)
            .collect()
    }

    /// Administrative delete
    pub fn remove(&self, message_id: &str) -> bool {
        match self.entries.remove(message_id) {
            Some((_, entry)) => {
                info!("Removed message {} from DLQ", message_id);
                self.publish_size(&entry.message.target_service);
                true
            }
            None => false,
        }
    }

    /// Retry an entry through `redeliver`.
    ///
    /// The attempt is counted whatever the outcome. Success removes the entry;
    /// failure keeps it and archives it once `max_attempts` is reached.
    /// Archived entries are refused with [`Error::RetryExhausted`].
    pub async fn retry<F, Fut>(
        &self,
        message_id: &str,
        max_attempts: u32,
        redeliver: F,
    ) -> Result<RetryOutcome>
    where
        F: FnOnce(ServiceBusMessage) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let (message, claimed) = match self.claim(message_id, max_attempts)? {
            Some(claim) => claim,
            None => return Ok(RetryOutcome::InProgress),
        };

        let mut guard = RetryGuard {
            dlq: self,
            message_id,
            claimed,
            max_attempts,
            armed: true,
        };
        let result = redeliver(message).await;
        guard.armed = false;

        Ok(self.finish(
            message_id,
            claimed,
            max_attempts,
            result.map_err(|e| e.to_string()),
        ))
    }

    /// Mark the entry as being retried and return its message with the
    /// sequence number it was claimed at; `None` if a retry is already running
    fn claim(
        &self,
        message_id: &str,
        max_attempts: u32,
    ) -> Result<Option<(ServiceBusMessage, u64)>> {
        let mut entry = self
            .entries
            .get_mut(message_id)
            .ok_or_else(|| Error::NotFound(format!("DLQ entry {}", message_id)))?;

        if !entry.archived && entry.retry_count >= max_attempts {
            warn!(
                "Archiving message {} after {} retries",
                message_id, entry.retry_count
            );
            entry.archived = true;
        }
        if entry.archived {
            return Err(Error::RetryExhausted {
                message_id: message_id.to_string(),
                attempts: entry.retry_count,
            });
        }
        if entry.retry_in_flight {
            return Ok(None);
        }

        entry.retry_in_flight = true;
        info!(
            "Retrying message {} for {} (attempt {}/{})",
            message_id,
            entry.message.target_service,
            entry.retry_count + 1,
            max_attempts
        );
        Ok(Some((entry.message.clone(), entry.sequence)))
    }

    fn finish(
        &self,
        message_id: &str,
        claimed: u64,
        max_attempts: u32,
        result: std::result::Result<(), String>,
    ) -> RetryOutcome {
        let (service, outcome) = match result {
            Ok(()) => match self
                .entries
                .remove_if(message_id, |_, entry| entry.sequence == claimed)
            {
                Some((_, entry)) => {
                    info!(
                        "Message {} redelivered after {} retries",
                        message_id,
                        entry.retry_count + 1
                    );
                    (entry.message.target_service, RetryOutcome::Delivered)
                }
                // Re-added while the retry ran: the newer failure stays queued
                None => {
                    let Some(mut entry) = self.entries.get_mut(message_id) else {
                        return RetryOutcome::Delivered;
                    };
                    info!(
                        "Message {} redelivered but re-added during the retry; keeping entry",
                        message_id
                    );
                    entry.retry_in_flight = false;
                    entry.retry_count += 1;
                    entry.last_retry_at = Some(Utc::now());
                    (entry.message.target_service.clone(), RetryOutcome::Delivered)
                }
            },
            Err(error) => {
                let Some(mut entry) = self.entries.get_mut(message_id) else {
                    return RetryOutcome::Failed { retry_count: 0 };
                };
                entry.retry_in_flight = false;
                entry.retry_count += 1;
                entry.last_retry_at = Some(Utc::now());
                entry.last_error = Some(error);

                let retry_count = entry.retry_count;
                let outcome = if retry_count >= max_attempts {
                    warn!(
                        "Message {} archived after {} failed retries",
                        message_id, retry_count
                    );
                    entry.archived = true;
                    RetryOutcome::Archived { retry_count }
                } else {
                    warn!(
                        "Retry {}/{} failed for message {}",
                        retry_count, max_attempts, message_id
                    );
                    RetryOutcome::Failed { retry_count }
                };
                (entry.message.target_service.clone(), outcome)
            }
        };

        self.publish_size(&service);
        outcome
    }

    /// Archive unarchived entries older than the configured age
    pub fn archive_expired(&self) -> usize {
        self.archive_older_than(self.config.archive_after)
    }

    /// Archive unarchived entries older than `max_age`
    pub fn archive_older_than(&self, max_age: Duration) -> usize {
        let now = Utc::now();
        let mut archived = 0;
        for mut entry in self.entries.iter_mut() {
            if entry.archived || entry.retry_in_flight {
                continue;
            }
            let expired = (now - entry.enqueued_at)
                .to_std()
                .map(|age| age >= max_age)
                .unwrap_or(false);
            if expired {
                entry.archived = true;
                archived += 1;
            }
        }
        if archived > 0 {
            info!("Archived {} expired DLQ entries", archived);
        }
        archived
    }

    /// Counts for `service_name` from the live entry set
    pub fn metrics(&self, service_name: &str) -> DeadLetterMetrics {
        let mut metrics = DeadLetterMetrics {
            service_name: service_name.to_string(),
            total: 0,
            pending: 0,
            retried: 0,
            archived: 0,
            retry_attempts: 0,
        };
        for entry in self
            .entries
            .iter()
            .filter(|e| e.message.target_service == service_name)
        {
            metrics.total += 1;
            if entry.archived {
                metrics.archived += 1;
            } else {
                metrics.pending += 1;
            }
            if entry.retry_count > 0 {
                metrics.retried += 1;
            }
            metrics.retry_attempts += u64::from(entry.retry_count);
        }
        metrics
    }

    /// Total entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn publish_size(&self, service_name: &str) {
        let size = self
            .entries
            .iter()
            .filter(|e| e.message.target_service == service_name)
            .count();
        metrics::set_dlq_size(service_name, size);
    }
}

impl Default for DeadLetterQueue {
    fn default() -> Self {
        Self::new(DeadLetterConfig::default())
    }
}

/// Counts a dropped retry as a failed attempt and releases the claim
struct RetryGuard<'a> {
    dlq: &'a DeadLetterQueue,
    message_id: &'a str,
    claimed: u64,
    max_attempts: u32,
    armed: bool,
}

impl Drop for RetryGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.dlq.finish(
                self.message_id,
                self.claimed,
                self.max_attempts,
                Err("retry cancelled".to_string()),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    fn message(id: &str, service: &str) -> ServiceBusMessage {
        ServiceBusMessage::new("WorkRequestCreated", service, json!({"id": id})).with_id(id)
    }

    fn delivery_failed() -> Error {
        Error::Delivery {
            service_name: "svc".to_string(),
            reason: "HTTP 503".to_string(),
        }
    }

    #[test]
    fn test_add_query_remove() {
        let dlq = DeadLetterQueue::default();
        assert!(dlq.add(message("m1", "Billing"), "Service unavailable"));

        let messages = dlq.messages_for("Billing");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id, "m1");
        assert_eq!(dlq.entry("m1").unwrap().reason, "Service unavailable");
        assert!(dlq.messages_for("Payroll").is_empty());

        assert!(dlq.remove("m1"));
        assert!(!dlq.remove("m1"));
        assert!(dlq.messages_for("Billing").is_empty());
        assert!(dlq.is_empty());
    }

    #[test]
    fn test_most_recent_first() {
        let dlq = DeadLetterQueue::default();
        dlq.add(message("first", "Billing"), "a");
        dlq.add(message("second", "Billing"), "b");
        dlq.add(message("third", "Billing"), "c");

        let ids: Vec<_> = dlq.messages_for("Billing").into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec!["third", "second", "first"]);
    }

    #[tokio::test]
    async fn test_retry_success_removes_entry() {
        let dlq = DeadLetterQueue::default();
        dlq.add(message("m1", "Billing"), "timeout");

        let outcome = dlq
            .retry("m1", 3, |msg| async move {
                assert_eq!(msg.id, "m1");
                Ok(())
            })
            .await
            .unwrap();

        assert_eq!(outcome, RetryOutcome::Delivered);
        assert!(dlq.entry("m1").is_none());
    }

    #[tokio::test]
    async fn test_retry_failures_archive_at_limit() {
        let dlq = DeadLetterQueue::default();
        dlq.add(message("m1", "Billing"), "timeout");

        for expected in 1..=2 {
            let outcome = dlq
                .retry("m1", 3, |_| async { Err(delivery_failed()) })
                .await
                .unwrap();
            assert_eq!(outcome, RetryOutcome::Failed { retry_count: expected });
        }

        let outcome = dlq
            .retry("m1", 3, |_| async { Err(delivery_failed()) })
            .await
            .unwrap();
        assert_eq!(outcome, RetryOutcome::Archived { retry_count: 3 });

        let entry = dlq.entry("m1").unwrap();
        assert!(entry.archived);
        assert_eq!(entry.retry_count, 3);
        assert!(entry.last_error.unwrap().contains("HTTP 503"));

        let err = dlq.retry("m1", 3, |_| async { Ok(()) }).await.unwrap_err();
        assert!(matches!(err, Error::RetryExhausted { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn test_retry_unknown_id() {
        let dlq = DeadLetterQueue::default();
        let err = dlq.retry("missing", 3, |_| async { Ok(()) }).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_concurrent_retry_of_same_entry() {
        let dlq = Arc::new(DeadLetterQueue::default());
        dlq.add(message("m1", "Billing"), "timeout");

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let first_dlq = dlq.clone();
        let first = tokio::spawn(async move {
            first_dlq
                .retry("m1", 3, |_| async move {
                    release_rx.await.ok();
                    Ok(())
                })
                .await
        });
        tokio::task::yield_now().await;

        let second = dlq.retry("m1", 3, |_| async { Ok(()) }).await.unwrap();
        assert_eq!(second, RetryOutcome::InProgress);

        release_tx.send(()).unwrap();
        assert_eq!(first.await.unwrap().unwrap(), RetryOutcome::Delivered);
        assert!(dlq.is_empty());
    }

    #[tokio::test]
    async fn test_re_adding_archived_entry_keeps_retry_history() {
        let dlq = DeadLetterQueue::default();
        dlq.add(message("m1", "Billing"), "timeout");
        for _ in 0..3 {
            let _ = dlq.retry("m1", 3, |_| async { Err(delivery_failed()) }).await;
        }
        assert!(dlq.entry("m1").unwrap().archived);

        dlq.add(message("m1", "Billing"), "Service unavailable");

        let entry = dlq.entry("m1").unwrap();
        assert_eq!(entry.reason, "Service unavailable");
        assert_eq!(entry.retry_count, 3);
        assert!(entry.archived);
        assert!(entry.last_error.unwrap().contains("HTTP 503"));
        assert_eq!(dlq.len(), 1);

        let err = dlq.retry("m1", 3, |_| async { Ok(()) }).await.unwrap_err();
        assert!(matches!(err, Error::RetryExhausted { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn test_re_add_during_retry_keeps_newer_entry() {
        let dlq = Arc::new(DeadLetterQueue::default());
        dlq.add(message("m1", "Billing"), "timeout");

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let retry_dlq = dlq.clone();
        let retry = tokio::spawn(async move {
            retry_dlq
                .retry("m1", 3, |_| async move {
                    release_rx.await.ok();
                    Ok(())
                })
                .await
        });
        tokio::task::yield_now().await;

        dlq.add(message("m1", "Billing"), "delivery failed again");
        assert!(dlq.entry("m1").unwrap().retry_in_flight);
        let second = dlq.retry("m1", 3, |_| async { Ok(()) }).await.unwrap();
        assert_eq!(second, RetryOutcome::InProgress);

        release_tx.send(()).unwrap();
        assert_eq!(retry.await.unwrap().unwrap(), RetryOutcome::Delivered);

        let entry = dlq.entry("m1").unwrap();
        assert_eq!(entry.reason, "delivery failed again");
        assert_eq!(entry.retry_count, 1);
        assert!(!entry.retry_in_flight);

        let outcome = dlq.retry("m1", 3, |_| async { Ok(()) }).await.unwrap();
        assert_eq!(outcome, RetryOutcome::Delivered);
        assert!(dlq.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_retry_counts_attempt() {
        let dlq = DeadLetterQueue::default();
        dlq.add(message("m1", "Billing"), "timeout");

        let cancelled = tokio::time::timeout(
            Duration::from_millis(50),
            dlq.retry("m1", 3, |_| std::future::pending::<Result<()>>()),
        )
        .await;
        assert!(cancelled.is_err());

        let entry = dlq.entry("m1").unwrap();
        assert_eq!(entry.retry_count, 1);
        assert_eq!(entry.last_error.as_deref(), Some("retry cancelled"));

        // Claim released
        let outcome = dlq.retry("m1", 3, |_| async { Ok(()) }).await.unwrap();
        assert_eq!(outcome, RetryOutcome::Delivered);
    }

    #[tokio::test]
    async fn test_metrics_from_live_entries() {
        let dlq = DeadLetterQueue::default();
        dlq.add(message("a", "Billing"), "x");
        dlq.add(message("b", "Billing"), "x");
        dlq.add(message("c", "Payroll"), "x");

        dlq.retry("a", 1, |_| async { Err(delivery_failed()) })
            .await
            .unwrap();
        dlq.retry("b", 3, |_| async { Err(delivery_failed()) })
            .await
            .unwrap();

        let metrics = dlq.metrics("Billing");
        assert_eq!(metrics.total, 2);
        assert_eq!(metrics.archived, 1);
        assert_eq!(metrics.pending, 1);
        assert_eq!(metrics.retried, 2);
        assert_eq!(metrics.retry_attempts, 2);

        let unseen = dlq.metrics("Nobody");
        assert_eq!(unseen.total, 0);
        assert_eq!(unseen.retry_attempts, 0);
    }

    #[test]
    fn test_archive_older_than() {
        let dlq = DeadLetterQueue::default();
        dlq.add(message("a", "Billing"), "x");
        dlq.add(message("b", "Billing"), "x");

        assert_eq!(dlq.archive_expired(), 0);
        assert_eq!(dlq.archive_older_than(Duration::ZERO), 2);
        assert_eq!(dlq.archive_older_than(Duration::ZERO), 0);
        assert_eq!(dlq.metrics("Billing").archived, 2);
    }
}
