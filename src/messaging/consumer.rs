//! Event Consumer
//!
//! Reads deliveries from one queue, decodes them, runs the local effect
//! handler and settles each delivery exactly once:
//!
//! ```text
//! Received -> Decoded -> HandlerInvoked -> Acked | NotAcked
//! ```
//!
//! Handler failures are retried in-process, then the message is republished
//! to its own queue with an incremented `x-retry-count`. Once the count
//! reaches the redelivery limit, or when the message cannot be decoded or
//! the handler rejects it outright, the message is published to the
//! dead-letter exchange and the original is acked. If any of those publishes
//! fails the delivery is nacked with requeue so the broker keeps it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use super::broker::{
    BrokerChannel, Delivery, OutgoingMessage, DEFAULT_EXCHANGE, RETRY_COUNT_HEADER,
};
use super::errors::MessagingError;
use super::topology::DeadLetterSpec;
use crate::handlers::EventHandler;

pub const DEAD_LETTER_REASON_HEADER: &str = "x-dead-letter-reason";
pub const ORIGINAL_QUEUE_HEADER: &str = "x-original-queue";
pub const FAILED_AT_HEADER: &str = "x-failed-at";

/// Consumer tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerSettings {
    pub consumer_tag: String,
    /// Unacknowledged deliveries allowed at once; also the handler concurrency
    pub prefetch: u16,
    pub handler_timeout: Duration,
    /// In-process handler attempts per delivery
    pub handler_attempts: u32,
    /// Wait between in-process attempts
    pub handler_backoff: Duration,
    /// Republishes allowed before a message is dead-lettered
    pub max_redeliveries: u32,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            consumer_tag: "order-events-consumer".to_string(),
            prefetch: 10,
            handler_timeout: Duration::from_secs(30),
            handler_attempts: 3,
            handler_backoff: Duration::from_millis(200),
            max_redeliveries: 3,
        }
    }
}

/// Where a message is in its processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageState {
    Received,
    Decoded,
    HandlerInvoked,
    Acked,
    NotAcked,
}

/// What happened to one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Handler succeeded
    Acked,
    /// Republished to its queue with this retry count; original acked
    Requeued { retry_count: u32 },
    /// Parked on the dead-letter exchange; original acked
    DeadLettered { reason: String },
    /// Rejected without requeue and with no dead-letter target, so the
    /// broker discarded it
    Dropped { reason: String },
    /// Left with the broker: nacked with requeue, or unsettled because the
    /// channel failed
    Returned { reason: String },
}

impl Disposition {
    /// Final state of the original delivery.
    pub fn final_state(&self) -> MessageState {
        match self {
            Disposition::Returned { .. } | Disposition::Dropped { .. } => MessageState::NotAcked,
            _ => MessageState::Acked,
        }
    }
}

/// Running counters for one consumer.
#[derive(Debug, Default)]
pub struct ConsumerStats {
    received: AtomicU64,
    acked: AtomicU64,
    requeued: AtomicU64,
    dead_lettered: AtomicU64,
    dropped: AtomicU64,
    returned: AtomicU64,
    malformed: AtomicU64,
    handler_failed: AtomicU64,
}

/// Point-in-time copy of [`ConsumerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConsumerStatsSnapshot {
    pub received: u64,
    pub acked: u64,
    pub requeued: u64,
    pub dead_lettered: u64,
    pub dropped: u64,
    pub returned: u64,
    pub malformed: u64,
    pub handler_failed: u64,
}

impl ConsumerStats {
    pub fn snapshot(&self) -> ConsumerStatsSnapshot {
        ConsumerStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            returned: self.returned.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            handler_failed: self.handler_failed.load(Ordering::Relaxed),
        }
    }

    fn record(&self, disposition: &Disposition) {
        let counter = match disposition {
            Disposition::Acked => &self.acked,
            Disposition::Requeued { .. } => &self.requeued,
            Disposition::DeadLettered { .. } => &self.dead_lettered,
            Disposition::Dropped { .. } => &self.dropped,
            Disposition::Returned { .. } => &self.returned,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

enum HandlerFailure {
    Transient(String),
    Permanent(String),
}

/// Consumes one queue with one handler.
pub struct EventConsumer<H: EventHandler> {
    channel: Arc<dyn BrokerChannel>,
    queue: String,
    handler: Arc<H>,
    settings: ConsumerSettings,
    dead_letter: Option<DeadLetterSpec>,
    stats: Arc<ConsumerStats>,
}

impl<H: EventHandler> EventConsumer<H> {
    pub fn new(
        channel: Arc<dyn BrokerChannel>,
        queue: impl Into<String>,
        handler: Arc<H>,
        settings: ConsumerSettings,
    ) -> Self {
        Self {
            channel,
            queue: queue.into(),
            handler,
            settings,
            dead_letter: None,
            stats: Arc::new(ConsumerStats::default()),
        }
    }

    pub fn with_dead_letter(mut self, dead_letter: DeadLetterSpec) -> Self {
        self.dead_letter = Some(dead_letter);
        self
    }

    /// Share counters across consumer instances, e.g. after a reconnect.
    pub fn with_stats(mut self, stats: Arc<ConsumerStats>) -> Self {
        self.stats = stats;
        self
    }

    pub fn stats(&self) -> Arc<ConsumerStats> {
        Arc::clone(&self.stats)
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Consume until the delivery stream ends, which happens when the
    /// channel or its connection closes.
    pub async fn run(&self) -> Result<ConsumerStatsSnapshot, MessagingError> {
        self.channel.set_prefetch(self.settings.prefetch).await?;
        let stream = self
            .channel
            .consume(&self.queue, &self.settings.consumer_tag)
            .await?;

        info!(
            queue = %self.queue,
            handler = self.handler.name(),
            consumer_tag = %self.settings.consumer_tag,
            prefetch = self.settings.prefetch,
            "Consumer started"
        );

        let concurrency = usize::from(self.settings.prefetch.max(1));
        stream
            .for_each_concurrent(concurrency, |delivery| async move {
                match delivery {
                    Ok(delivery) => {
                        self.process_delivery(delivery).await;
                    }
                    Err(e) => {
                        error!(queue = %self.queue, error = %e, "Delivery stream error");
                    }
                }
            })
            .await;

        let stats = self.stats.snapshot();
        info!(
            queue = %self.queue,
            received = stats.received,
            acked = stats.acked,
            requeued = stats.requeued,
            dead_lettered = stats.dead_lettered,
            dropped = stats.dropped,
            returned = stats.returned,
            malformed = stats.malformed,
            handler_failed = stats.handler_failed,
            "Consumer stopped"
        );
        Ok(stats)
    }

    /// Take one delivery through decode, handle and settle.
    #[instrument(
        skip(self, delivery),
        fields(
            queue = %self.queue,
            delivery_tag = delivery.delivery_tag,
            handler = self.handler.name()
        )
    )]
    pub async fn process_delivery(&self, delivery: Delivery) -> Disposition {
        self.stats.received.fetch_add(1, Ordering::Relaxed);
        let retry_count = delivery.retry_count();
        debug!(
            state = ?MessageState::Received,
            redelivered = delivery.redelivered,
            retry_count,
            size = delivery.body.len(),
            "Message received"
        );

        let event: H::Event = match serde_json::from_slice(&delivery.body) {
            Ok(event) => event,
            Err(e) => {
                self.stats.malformed.fetch_add(1, Ordering::Relaxed);
                let err = MessagingError::malformed(e.to_string());
                warn!(error = %err, "Malformed message");
                return self.finish(self.dead_letter(&delivery, &err.to_string()).await);
            }
        };
        debug!(state = ?MessageState::Decoded, "Message decoded");

        let outcome = self.invoke(&event).await;
        debug!(
            state = ?MessageState::HandlerInvoked,
            success = outcome.is_ok(),
            "Handler finished"
        );

        let disposition = match outcome {
            Ok(()) => match delivery.ack().await {
                Ok(()) => Disposition::Acked,
                Err(e) => Disposition::Returned {
                    reason: format!("ack failed: {e}"),
                },
            },
            Err(HandlerFailure::Permanent(reason)) => {
                self.stats.handler_failed.fetch_add(1, Ordering::Relaxed);
                self.dead_letter(&delivery, &reason).await
            }
            Err(HandlerFailure::Transient(reason)) => {
                self.stats.handler_failed.fetch_add(1, Ordering::Relaxed);
                if retry_count >= self.settings.max_redeliveries {
                    let reason = format!("{reason} (gave up after {retry_count} redeliveries)");
                    self.dead_letter(&delivery, &reason).await
                } else {
                    self.requeue(&delivery, retry_count + 1, &reason).await
                }
            }
        };
        self.finish(disposition)
    }

    fn finish(&self, disposition: Disposition) -> Disposition {
        self.stats.record(&disposition);
        match &disposition {
            Disposition::Acked => debug!(state = ?MessageState::Acked, "Message acked"),
            Disposition::Requeued { retry_count } => {
                info!(state = ?MessageState::Acked, retry_count, "Message requeued for retry")
            }
            Disposition::DeadLettered { reason } => {
                warn!(state = ?MessageState::Acked, reason = %reason, "Message dead-lettered")
            }
            Disposition::Dropped { reason } => {
                error!(state = ?MessageState::NotAcked, reason = %reason, "Message dropped")
            }
            Disposition::Returned { reason } => {
                warn!(state = ?MessageState::NotAcked, reason = %reason, "Message left with broker")
            }
        }
        disposition
    }

    /// Run the handler up to `handler_attempts` times. A timeout skips the
    /// remaining attempts; a permanent failure ends immediately.
    async fn invoke(&self, event: &H::Event) -> Result<(), HandlerFailure> {
        let attempts = self.settings.handler_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match tokio::time::timeout(self.settings.handler_timeout, self.handler.handle(event))
                .await
            {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(e)) => {
                    let failure = MessagingError::HandlerFailure {
                        handler: self.handler.name().to_string(),
                        message: e.to_string(),
                    };
                    if !e.is_transient() {
                        return Err(HandlerFailure::Permanent(failure.to_string()));
                    }
                    warn!(attempt, attempts, error = %failure, "Handler attempt failed");
                    last_error = failure.to_string();
                }
                Err(_) => {
                    let reason = format!(
                        "handler timed out after {}ms",
                        self.settings.handler_timeout.as_millis()
                    );
                    warn!(attempt, "{reason}");
                    return Err(HandlerFailure::Transient(reason));
                }
            }

            if attempt < attempts {
                tokio::time::sleep(self.settings.handler_backoff).await;
            }
        }

        Err(HandlerFailure::Transient(last_error))
    }

    /// Republish to this queue with the new retry count, then ack.
    async fn requeue(&self, delivery: &Delivery, retry_count: u32, reason: &str) -> Disposition {
        let mut message = OutgoingMessage::json(delivery.body.clone());
        message.headers = delivery.headers.clone();
        let message = message.with_header(RETRY_COUNT_HEADER, retry_count.to_string());

        debug!(retry_count, reason, "Republishing for retry");
        match self
            .channel
            .publish(DEFAULT_EXCHANGE, &self.queue, message)
            .await
        {
            Ok(()) => self.ack_after_publish(delivery, Disposition::Requeued { retry_count }).await,
            Err(e) => self.return_to_broker(delivery, format!("republish failed: {e}")).await,
        }
    }

    /// Publish to the dead-letter exchange, then ack.
    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Disposition {
        let Some(dead_letter) = &self.dead_letter else {
            // Without a dead-letter target the broker drops the message.
            error!(reason, "No dead-letter exchange configured, rejecting message");
            return match delivery.nack(false).await {
                Ok(()) => Disposition::Dropped {
                    reason: reason.to_string(),
                },
                Err(e) => Disposition::Returned {
                    reason: format!("reject failed: {e}"),
                },
            };
        };

        let mut message = OutgoingMessage::json(delivery.body.clone());
        message.headers = delivery.headers.clone();
        let message = message
            .with_header(DEAD_LETTER_REASON_HEADER, reason)
            .with_header(ORIGINAL_QUEUE_HEADER, self.queue.as_str())
            .with_header(RETRY_COUNT_HEADER, delivery.retry_count().to_string())
            .with_header(FAILED_AT_HEADER, Utc::now().to_rfc3339());

        match self
            .channel
            .publish(&dead_letter.exchange, &dead_letter.routing_key, message)
            .await
        {
            Ok(()) => {
                self.ack_after_publish(
                    delivery,
                    Disposition::DeadLettered {
                        reason: reason.to_string(),
                    },
                )
                .await
            }
            Err(e) => {
                self.return_to_broker(delivery, format!("dead-letter publish failed: {e}"))
                    .await
            }
        }
    }

    async fn ack_after_publish(&self, delivery: &Delivery, disposition: Disposition) -> Disposition {
        match delivery.ack().await {
            Ok(()) => disposition,
            Err(e) => Disposition::Returned {
                reason: format!("ack failed after republish: {e}"),
            },
        }
    }

    async fn return_to_broker(&self, delivery: &Delivery, reason: String) -> Disposition {
        if let Err(e) = delivery.nack(true).await {
            return Disposition::Returned {
                reason: format!("{reason}; nack failed: {e}"),
            };
        }
        Disposition::Returned { reason }
    }
}
