use crate::config::EventsConfig;
use crate::content_store::ContentStore;
use crate::error::Result;
use crate::lifecycle::LifecycleHandle;
use anyhow::Context;
use futures::StreamExt;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Message};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Operation carried by an uploads event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventOp {
    /// An attachment was attached to a resource
    ClaimAttachment,
    /// Attachments were detached, by id and/or by uploader
    UnclaimAttachment,
    /// Run garbage collection now
    RunBackgroundTasks,
    #[serde(other)]
    Unknown,
}

/// Message consumed from the uploads topic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadsEvent {
    pub op: EventOp,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub resource: Option<String>,
    #[serde(default)]
    pub uploader: Option<String>,
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(100);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Applies uploads events to the catalog
pub struct EventHandler {
    store: Arc<ContentStore>,
    lifecycle: LifecycleHandle,
    initial_delay: Duration,
    max_delay: Duration,
}

impl EventHandler {
    pub fn new(store: Arc<ContentStore>, lifecycle: LifecycleHandle) -> Self {
        Self {
            store,
            lifecycle,
            initial_delay: INITIAL_RETRY_DELAY,
            max_delay: MAX_RETRY_DELAY,
        }
    }

    pub fn with_retry_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_delay = initial;
        self.max_delay = max.max(initial);
        self
    }

    /// Apply one event, retrying transient failures with exponential backoff.
    ///
    /// Returns only once the event is applied, fails permanently, or
    /// `shutdown` fires mid-retry. In the last case the transient error is
    /// returned and the event must not be acknowledged.
    pub async fn apply(&self, event: &UploadsEvent, shutdown: &CancellationToken) -> Result<()> {
        let mut delay = self.initial_delay;
        let mut attempt = 1u32;

        loop {
            let err = match self.handle(event).await {
                Ok(()) => return Ok(()),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => e,
            };

            warn!(
                op = ?event.op,
                attempt = attempt,
                retry_in = ?delay,
                error = %err,
                "Transient failure applying event"
            );
            metrics::counter!("uploads.events.retried").increment(1);

            tokio::select! {
                _ = shutdown.cancelled() => return Err(err),
                _ = tokio::time::sleep(delay) => {}
            }

            delay = (delay * 2).min(self.max_delay);
            attempt = attempt.saturating_add(1);
        }
    }

    /// Apply one event. Events missing required fields are skipped.
    #[instrument(skip(self))]
    pub async fn handle(&self, event: &UploadsEvent) -> Result<()> {
        match event.op {
            EventOp::ClaimAttachment => {
                let (Some(id), Some(resource)) = (non_empty(&event.id), non_empty(&event.resource))
                else {
                    warn!("claim_attachment without id and resource, skipping");
                    return Ok(());
                };
                let updated = self.store.mark_used(id, resource).await?;
                debug!(id = %id, resource = %resource, updated = updated, "Attachment claimed");
            }
            EventOp::UnclaimAttachment => {
                let id = non_empty(&event.id);
                let uploader = non_empty(&event.uploader);
                if id.is_none() && uploader.is_none() {
                    warn!("unclaim_attachment without id or uploader, skipping");
                    return Ok(());
                }
                if let Some(id) = id {
                    self.store.clear_used_by_id(id).await?;
                }
                if let Some(uploader) = uploader {
                    self.store.clear_used_by_uploader(uploader).await?;
                }
            }
            EventOp::RunBackgroundTasks => self.lifecycle.trigger(),
            EventOp::Unknown => debug!("Ignoring unknown event op"),
        }
        Ok(())
    }
}

/// Base Kafka client settings shared by the consumer and producer
pub fn client_config(config: &EventsConfig) -> ClientConfig {
    let mut client_config = ClientConfig::new();
    client_config.set("bootstrap.servers", &config.bootstrap_servers);

    // Configure SSL if enabled
    if config.ssl_enabled {
        client_config.set("security.protocol", "SASL_SSL");
        if let Some(ref ca_location) = config.ssl_ca_location {
            client_config.set("ssl.ca.location", ca_location);
        }
    }

    // Configure SASL if credentials provided
    if let (Some(ref username), Some(ref password)) = (&config.sasl_username, &config.sasl_password) {
        client_config
            .set("sasl.mechanisms", "PLAIN")
            .set("sasl.username", username)
            .set("sasl.password", password);
    }

    client_config
}

/// Kafka consumer for the uploads topic
pub struct UploadsEventConsumer {
    consumer: StreamConsumer,
    handler: EventHandler,
}

impl UploadsEventConsumer {
    pub fn new(config: &EventsConfig, handler: EventHandler) -> anyhow::Result<Self> {
        let consumer: StreamConsumer = client_config(config)
            .set("group.id", &config.consumer_group)
            .set("auto.offset.reset", &config.auto_offset_reset)
            .set("enable.auto.commit", "false")
            .set("session.timeout.ms", config.session_timeout_ms.to_string())
            .create()
            .context("Failed to create Kafka consumer")?;

        consumer
            .subscribe(&[&config.uploads_topic])
            .context("Failed to subscribe to uploads topic")?;

        info!(
            topic = %config.uploads_topic,
            group = %config.consumer_group,
            "Subscribed to Kafka topic"
        );

        Ok(Self { consumer, handler })
    }

    /// Consume until cancelled. Offsets are committed once a message has been
    /// applied, found to be unreadable, or rejected permanently. Transient
    /// failures are retried in place so later offsets never pass a message
    /// that still has to be applied.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!("Starting uploads event consumer");

        let mut message_stream = self.consumer.stream();

        loop {
            let message_result = tokio::select! {
                _ = shutdown.cancelled() => break,
                next = message_stream.next() => match next {
                    Some(result) => result,
                    None => break,
                },
            };

            match message_result {
                Ok(message) => {
                    match self.process_message(&message, &shutdown).await {
                        Ok(()) => metrics::counter!("uploads.events.processed").increment(1),
                        Err(e) if shutdown.is_cancelled() => {
                            info!(
                                error = %e,
                                partition = message.partition(),
                                offset = message.offset(),
                                "Stopping before message was applied, leaving it uncommitted"
                            );
                            break;
                        }
                        Err(e) => {
                            error!(
                                error = %e,
                                partition = message.partition(),
                                offset = message.offset(),
                                "Dropping message that cannot be applied"
                            );
                            metrics::counter!("uploads.events.failed").increment(1);
                        }
                    }

                    if let Err(e) = self.consumer.commit_message(&message, CommitMode::Async) {
                        warn!(error = %e, "Failed to commit offset");
                    }
                }
                Err(e) => {
                    error!(error = %e, "Kafka consumer error");
                    metrics::counter!("uploads.kafka.errors").increment(1);
                }
            }
        }

        info!("Uploads event consumer stopped");
    }

    #[instrument(skip(self, message, shutdown), fields(partition = message.partition(), offset = message.offset()))]
    async fn process_message(
        &self,
        message: &BorrowedMessage<'_>,
        shutdown: &CancellationToken,
    ) -> Result<()> {
        let Some(payload) = message.payload() else {
            warn!("Message has no payload, skipping");
            return Ok(());
        };

        let event: UploadsEvent = match serde_json::from_slice(payload) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "Malformed uploads event, skipping");
                metrics::counter!("uploads.events.malformed").increment(1);
                return Ok(());
            }
        };

        self.handler.apply(&event, shutdown).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content_store::harness::{harness, upload};
    use crate::files::Bucket;
    use crate::lifecycle::LifecycleManager;

    fn parse(json: &str) -> UploadsEvent {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_event_parsing() {
        let event = parse(r#"{"op":"claim_attachment","id":"a","resource":"message:1"}"#);
        assert_eq!(event.op, EventOp::ClaimAttachment);
        assert_eq!(event.resource.as_deref(), Some("message:1"));
        assert_eq!(event.uploader, None);

        assert_eq!(parse(r#"{"op":"run_background_tasks"}"#).op, EventOp::RunBackgroundTasks);
        assert_eq!(parse(r#"{"op":"something_new","id":"x"}"#).op, EventOp::Unknown);
    }

    #[tokio::test]
    async fn test_claim_and_unclaim_by_id() {
        let h = harness();
        let (lifecycle, _rx) = LifecycleManager::handle();
        let handler = EventHandler::new(h.store.clone(), lifecycle);
        let file = h
            .store
            .create_file(upload(Bucket::Attachments, b"attached", "text/plain", "alice"))
            .await
            .unwrap();

        handler
            .handle(&parse(&format!(
                r#"{{"op":"claim_attachment","id":"{}","resource":"message:42"}}"#,
                file.id
            )))
            .await
            .unwrap();
        let claimed = h.store.get_file(&file.id).await.unwrap();
        assert!(claimed.claimed);
        assert_eq!(claimed.used_by.as_deref(), Some("message:42"));

        handler
            .handle(&parse(&format!(r#"{{"op":"unclaim_attachment","id":"{}"}}"#, file.id)))
            .await
            .unwrap();
        let released = h.store.get_file(&file.id).await.unwrap();
        assert!(!released.claimed);
        assert_eq!(released.used_by, None);
    }

    #[tokio::test]
    async fn test_unclaim_by_uploader_only_touches_attachments() {
        let h = harness();
        let (lifecycle, _rx) = LifecycleManager::handle();
        let handler = EventHandler::new(h.store.clone(), lifecycle);

        let attachment = h
            .store
            .create_file(upload(Bucket::Attachments, b"a", "text/plain", "dave"))
            .await
            .unwrap();
        let icon = h
            .store
            .create_file(upload(Bucket::Icons, &crate::transcoder::fixtures::png(4, 4), "image/png", "dave"))
            .await
            .unwrap();
        h.store.mark_used(&attachment.id, "message:1").await.unwrap();
        h.store.claim(&icon).await.unwrap();

        handler
            .handle(&parse(r#"{"op":"unclaim_attachment","uploader":"dave"}"#))
            .await
            .unwrap();

        assert!(!h.store.get_file(&attachment.id).await.unwrap().claimed);
        assert!(h.store.get_file(&icon.id).await.unwrap().claimed);
    }

    #[tokio::test]
    async fn test_incomplete_claim_is_skipped() {
        let h = harness();
        let (lifecycle, _rx) = LifecycleManager::handle();
        let handler = EventHandler::new(h.store.clone(), lifecycle);

        tokio_test::assert_ok!(handler.handle(&parse(r#"{"op":"claim_attachment","id":"x"}"#)).await);
        tokio_test::assert_ok!(handler.handle(&parse(r#"{"op":"unclaim_attachment"}"#)).await);
    }

    #[tokio::test]
    async fn test_run_background_tasks_triggers_a_sweep() {
        let h = harness();
        let (lifecycle, mut rx) = LifecycleManager::handle();
        let handler = EventHandler::new(h.store.clone(), lifecycle);

        handler
            .handle(&parse(r#"{"op":"run_background_tasks"}"#))
            .await
            .unwrap();
        assert_eq!(rx.try_recv(), Ok(()));
    }

    #[tokio::test]
    async fn test_catalog_failure_is_reported() {
        let h = harness();
        let (lifecycle, _rx) = LifecycleManager::handle();
        let handler = EventHandler::new(h.store.clone(), lifecycle);
        h.catalog.set_failing(true);

        assert!(handler
            .handle(&parse(r#"{"op":"claim_attachment","id":"x","resource":"r"}"#))
            .await
            .is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_is_retried_until_applied() {
        let h = harness();
        let (lifecycle, _rx) = LifecycleManager::handle();
        let handler = EventHandler::new(h.store.clone(), lifecycle);
        let file = h
            .store
            .create_file(upload(Bucket::Attachments, b"retried", "text/plain", "alice"))
            .await
            .unwrap();

        h.catalog.fail_next(3);
        let event = parse(&format!(
            r#"{{"op":"claim_attachment","id":"{}","resource":"message:7"}}"#,
            file.id
        ));
        tokio_test::assert_ok!(handler.apply(&event, &CancellationToken::new()).await);

        let claimed = h.store.get_file(&file.id).await.unwrap();
        assert!(claimed.claimed);
        assert_eq!(claimed.used_by.as_deref(), Some("message:7"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_interrupts_retries() {
        let h = harness();
        let (lifecycle, _rx) = LifecycleManager::handle();
        let handler = EventHandler::new(h.store.clone(), lifecycle)
            .with_retry_backoff(Duration::from_millis(10), Duration::from_millis(40));
        h.catalog.set_failing(true);

        let shutdown = CancellationToken::new();
        let cancel = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            cancel.cancel();
        });

        let err = handler
            .apply(&parse(r#"{"op":"claim_attachment","id":"x","resource":"r"}"#), &shutdown)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(shutdown.is_cancelled());
    }

    #[tokio::test]
    async fn test_unknown_id_is_applied_without_retry() {
        let h = harness();
        let (lifecycle, _rx) = LifecycleManager::handle();
        let handler = EventHandler::new(h.store.clone(), lifecycle);
        let shutdown = CancellationToken::new();

        tokio_test::assert_ok!(
            handler
                .apply(&parse(r#"{"op":"claim_attachment","id":"missing","resource":"r"}"#), &shutdown)
                .await
        );
    }

    #[test]
    fn test_client_config_applies_sasl() {
        let config = EventsConfig {
            bootstrap_servers: "localhost:9092".to_string(),
            consumer_group: "uploads-service".to_string(),
            uploads_topic: "uploads".to_string(),
            admin_topic: "admin".to_string(),
            ssl_enabled: true,
            ssl_ca_location: Some("/etc/ssl/ca.pem".to_string()),
            sasl_username: Some("user".to_string()),
            sasl_password: Some("pass".to_string()),
            auto_offset_reset: "latest".to_string(),
            session_timeout_ms: 30000,
            delivery_timeout_ms: 5000,
        };
        let client = client_config(&config);
        assert_eq!(client.get("security.protocol"), Some("SASL_SSL"));
        assert_eq!(client.get("sasl.username"), Some("user"));
        assert_eq!(client.get("bootstrap.servers"), Some("localhost:9092"));
    }
}
