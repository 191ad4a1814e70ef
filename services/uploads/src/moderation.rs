use crate::config::EventsConfig;
use crate::events::client_config;
use anyhow::Context;
use async_trait::async_trait;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, instrument};

/// Moderation message published when auto-ban content is uploaded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BanUserMessage {
    pub op: String,
    pub user: String,
    pub state: String,
    pub reason: String,
    pub note: String,
}

impl BanUserMessage {
    pub fn permanent(user: &str, hash: &str) -> Self {
        Self {
            op: "ban_user".to_string(),
            user: user.to_string(),
            state: "perm_ban".to_string(),
            reason: String::new(),
            note: format!("uploaded blocked content {}", hash),
        }
    }
}

/// Sink for ban notifications
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BanNotifier: Send + Sync {
    async fn ban_user(&self, user: &str, hash: &str) -> anyhow::Result<()>;
}

/// Publishes ban notifications to the admin topic
pub struct KafkaBanNotifier {
    producer: FutureProducer,
    topic: String,
    delivery_timeout: Duration,
}

impl KafkaBanNotifier {
    pub fn new(config: &EventsConfig) -> anyhow::Result<Self> {
        let producer: FutureProducer = client_config(config)
            .set(
                "message.timeout.ms",
                config.delivery_timeout_ms.to_string(),
            )
            .create()
            .context("Failed to create Kafka producer")?;

        info!(topic = %config.admin_topic, "Ban notifier ready");

        Ok(Self {
            producer,
            topic: config.admin_topic.clone(),
            delivery_timeout: Duration::from_millis(config.delivery_timeout_ms),
        })
    }
}

#[async_trait]
impl BanNotifier for KafkaBanNotifier {
    #[instrument(skip(self))]
    async fn ban_user(&self, user: &str, hash: &str) -> anyhow::Result<()> {
        let payload = serde_json::to_vec(&BanUserMessage::permanent(user, hash))?;
        let record = FutureRecord::to(&self.topic).key(user).payload(&payload);

        self.producer
            .send(record, Timeout::After(self.delivery_timeout))
            .await
            .map_err(|(e, _)| anyhow::anyhow!("failed to publish ban_user: {}", e))?;

        metrics::counter!("uploads.moderation.bans_published").increment(1);
        info!(user = %user, "Ban notification published");
        Ok(())
    }
}
