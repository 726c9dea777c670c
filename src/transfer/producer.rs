//! # Producteur vers les topics de sortie
//!
//! Publication clé-par-conversation avec rejeu à backoff exponentiel
//! borné; l'épuisement des tentatives remonte l'erreur et fait avorter le
//! batch appelant sans commit d'offset.

use std::time::Duration;

use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use rdkafka::ClientConfig;
use serde::Serialize;
use tracing::warn;

use crate::config::{KafkaConfig, TransferConfig};
use crate::error::{CourierError, Result};

pub struct TopicProducer {
    producer: FutureProducer,
    max_retries: u32,
    retry_backoff: Duration,
    send_timeout: Duration,
}

impl TopicProducer {
    pub fn new(kafka: &KafkaConfig, transfer: &TransferConfig) -> Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &kafka.brokers)
            .set("acks", "all")
            .set("message.timeout.ms", transfer.producer_send_timeout_ms.to_string())
            .create()
            .map_err(|e| CourierError::queue_error("create producer", e))?;
        Ok(Self {
            producer,
            max_retries: transfer.producer_max_retries,
            retry_backoff: transfer.producer_retry_backoff(),
            send_timeout: transfer.producer_send_timeout(),
        })
    }

    /// Publie `value` sérialisée en JSON sous `key` sur `topic`
    pub async fn send_json<T: Serialize>(&self, topic: &str, key: &str, value: &T) -> Result<()> {
        let payload = serde_json::to_vec(value)
            .map_err(|e| CourierError::serialization_error("encode produce", e))?;
        let mut backoff = self.retry_backoff;
        let mut attempt = 0;
        loop {
            let record = FutureRecord::to(topic).key(key).payload(payload.as_slice());
            match self
                .producer
                .send(record, Timeout::After(self.send_timeout))
                .await
            {
                Ok(_) => return Ok(()),
                Err((err, _)) if attempt < self.max_retries => {
                    attempt += 1;
                    warn!(topic, attempt, error = %err, "publication en échec, rejeu");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(Duration::from_secs(10));
                }
                Err((err, _)) => {
                    return Err(CourierError::queue_error("produce", err));
                }
            }
        }
    }
}
