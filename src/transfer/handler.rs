//! # Groupes de consommateurs Kafka
//!
//! Enveloppe commune des deux pipelines: drainage de batches avec fenêtre
//! d'accumulation, délégation à un handler par partition, commit des
//! offsets seulement après succès du traitement. Un batch en échec
//! transitoire est rejoué sur place; un échec persistant arrête le
//! consommateur et la relivraison at-least-once répare l'état au
//! redémarrage.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::OwnedMessage;
use rdkafka::{ClientConfig, Message, Offset, TopicPartitionList};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::KafkaConfig;
use crate::error::{CourierError, Result};

/// Tentatives de rejeu d'un batch en échec transitoire
const MAX_BATCH_RETRIES: u32 = 5;

/// Capacités d'un handler de groupe de consommateurs
#[async_trait]
pub trait BatchHandler: Send + Sync {
    /// Nom du handler pour les logs
    fn name(&self) -> &'static str;

    /// Appelé à l'installation du consommateur
    async fn setup(&self) -> Result<()> {
        Ok(())
    }

    /// Appelé au retrait du consommateur
    async fn cleanup(&self) -> Result<()> {
        Ok(())
    }

    /// Traite les messages d'une partition, dans l'ordre de lecture
    async fn handle_batch(&self, partition: i32, msgs: &[OwnedMessage]) -> Result<()>;
}

/// Groupe de consommateurs d'un topic
pub struct ConsumerGroup {
    consumer: StreamConsumer,
    topic: String,
    batch_size: usize,
    batch_wait: Duration,
}

impl ConsumerGroup {
    pub fn new(
        kafka: &KafkaConfig,
        group_id: &str,
        topic: &str,
        batch_size: usize,
        batch_wait: Duration,
    ) -> Result<Self> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &kafka.brokers)
            .set("group.id", group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .set("session.timeout.ms", kafka.session_timeout_ms.to_string())
            .create()
            .map_err(|e| CourierError::queue_error("create consumer", e))?;
        consumer
            .subscribe(&[topic])
            .map_err(|e| CourierError::queue_error("subscribe", e))?;
        Ok(Self {
            consumer,
            topic: topic.to_string(),
            batch_size,
            batch_wait,
        })
    }

    /// Boucle de consommation jusqu'à annulation.
    ///
    /// Les offsets d'un batch ne sont committés qu'après le retour en
    /// succès du handler pour toutes ses partitions.
    pub async fn run<H: BatchHandler>(&self, handler: &H, cancel: CancellationToken) -> Result<()> {
        handler.setup().await?;
        info!(handler = handler.name(), topic = %self.topic, "consommateur démarré");
        loop {
            let batch = tokio::select! {
                _ = cancel.cancelled() => break,
                batch = self.next_batch() => batch?,
            };
            if batch.is_empty() {
                continue;
            }
            self.dispatch(handler, &batch).await?;
            self.commit(&batch)?;
        }
        handler.cleanup().await?;
        info!(handler = handler.name(), topic = %self.topic, "consommateur arrêté");
        Ok(())
    }

    /// Draine un batch: bloque sur le premier message puis accumule
    /// jusqu'à la taille maximale ou la fin de la fenêtre.
    async fn next_batch(&self) -> Result<Vec<OwnedMessage>> {
        let mut batch = Vec::with_capacity(self.batch_size);
        let first = self
            .consumer
            .recv()
            .await
            .map_err(|e| CourierError::queue_error("recv", e))?;
        batch.push(first.detach());

        let deadline = tokio::time::Instant::now() + self.batch_wait;
        while batch.len() < self.batch_size {
            match tokio::time::timeout_at(deadline, self.consumer.recv()).await {
                Ok(Ok(msg)) => batch.push(msg.detach()),
                Ok(Err(e)) => return Err(CourierError::queue_error("recv", e)),
                Err(_) => break,
            }
        }
        Ok(batch)
    }

    /// Délègue le batch au handler, un worker par partition en parallèle
    async fn dispatch<H: BatchHandler>(&self, handler: &H, batch: &[OwnedMessage]) -> Result<()> {
        let mut partitions: Vec<(i32, Vec<OwnedMessage>)> = Vec::new();
        for msg in batch {
            match partitions.iter_mut().find(|(p, _)| *p == msg.partition()) {
                Some((_, msgs)) => msgs.push(msg.clone()),
                None => partitions.push((msg.partition(), vec![msg.clone()])),
            }
        }
        futures_util::future::try_join_all(
            partitions
                .into_iter()
                .map(|(partition, msgs)| self.handle_partition(handler, partition, msgs)),
        )
        .await?;
        Ok(())
    }

    /// Traite une partition avec rejeu borné des échecs transitoires
    async fn handle_partition<H: BatchHandler>(
        &self,
        handler: &H,
        partition: i32,
        msgs: Vec<OwnedMessage>,
    ) -> Result<()> {
        let mut backoff = Duration::from_millis(100);
        let mut attempt = 0;
        loop {
            match handler.handle_batch(partition, &msgs).await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_transient() && attempt < MAX_BATCH_RETRIES => {
                    attempt += 1;
                    warn!(
                        handler = handler.name(),
                        partition,
                        attempt,
                        error = %err,
                        "batch en échec transitoire, rejeu"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(Duration::from_secs(10));
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Committe l'offset suivant du dernier message de chaque partition
    fn commit(&self, batch: &[OwnedMessage]) -> Result<()> {
        let mut next_offsets: HashMap<i32, i64> = HashMap::new();
        for msg in batch {
            let next = next_offsets.entry(msg.partition()).or_insert(0);
            *next = (*next).max(msg.offset() + 1);
        }
        let mut tpl = TopicPartitionList::new();
        for (partition, offset) in next_offsets {
            tpl.add_partition_offset(&self.topic, partition, Offset::Offset(offset))
                .map_err(|e| CourierError::queue_error("build offsets", e))?;
        }
        self.consumer
            .commit(&tpl, CommitMode::Sync)
            .map_err(|e| CourierError::queue_error("commit", e))?;
        Ok(())
    }
}
