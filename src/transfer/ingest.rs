//! # Consommateur d'ingestion
//!
//! Draine les messages acceptés du topic d'ingestion (partitionné par
//! conversation), assigne les séquences via l'allocateur, écrit le journal
//! chaud puis publie vers les topics push et persistance. Les
//! modifications (éditions, réactions) partent sur leur propre topic sans
//! consommer de séquence. Les offsets ne sont committés par le groupe
//! qu'après le succès de toutes ces étapes.

use std::sync::Arc;

use async_trait::async_trait;
use metrics::counter;
use rdkafka::message::OwnedMessage;
use rdkafka::Message;
use tracing::{debug, warn};

use crate::cache::MessageCache;
use crate::config::KafkaConfig;
use crate::error::{CourierError, Result};
use crate::model::MsgRecord;
use crate::sequence::{SeqAllocator, SeqBuffer, SeqStore};
use crate::transfer::handler::BatchHandler;
use crate::transfer::producer::TopicProducer;

/// Batch ventilé: groupes séquencés par conversation (dans l'ordre de
/// lecture) et modifications hors séquencement
pub(crate) struct PreparedBatch {
    pub sequenced: Vec<(String, Vec<MsgRecord>)>,
    pub modifications: Vec<MsgRecord>,
}

/// Ventile un batch par conversation en préservant l'ordre de lecture
pub(crate) fn prepare_batch(msgs: Vec<MsgRecord>) -> PreparedBatch {
    let mut sequenced: Vec<(String, Vec<MsgRecord>)> = Vec::new();
    let mut modifications = Vec::new();
    for msg in msgs {
        if msg.content_type.is_modification() {
            modifications.push(msg);
            continue;
        }
        match sequenced
            .iter_mut()
            .find(|(conversation_id, _)| *conversation_id == msg.conversation_id)
        {
            Some((_, group)) => group.push(msg),
            None => sequenced.push((msg.conversation_id.clone(), vec![msg])),
        }
    }
    PreparedBatch {
        sequenced,
        modifications,
    }
}

/// Assigne les séquences allouées aux messages, dans l'ordre de lecture
pub(crate) fn assign_seqs(msgs: Vec<MsgRecord>, seqs: &[i64]) -> Result<Vec<MsgRecord>> {
    if msgs.len() != seqs.len() {
        return Err(CourierError::internal_error(format!(
            "allocation incohérente: {} messages pour {} séquences",
            msgs.len(),
            seqs.len()
        )));
    }
    Ok(msgs
        .into_iter()
        .zip(seqs)
        .map(|(msg, seq)| msg.with_seq(*seq))
        .collect())
}

/// Handler du pipeline d'ingestion
pub struct IngestHandler<S, B> {
    allocator: Arc<SeqAllocator<S, B>>,
    cache: Arc<MessageCache>,
    producer: Arc<TopicProducer>,
    push_topic: String,
    persist_topic: String,
    modify_topic: String,
}

impl<S: SeqStore, B: SeqBuffer> IngestHandler<S, B> {
    pub fn new(
        allocator: Arc<SeqAllocator<S, B>>,
        cache: Arc<MessageCache>,
        producer: Arc<TopicProducer>,
        kafka: &KafkaConfig,
    ) -> Self {
        Self {
            allocator,
            cache,
            producer,
            push_topic: kafka.push_topic.clone(),
            persist_topic: kafka.persist_topic.clone(),
            modify_topic: kafka.modify_topic.clone(),
        }
    }

    fn decode(&self, msgs: &[OwnedMessage]) -> Vec<MsgRecord> {
        let mut records = Vec::with_capacity(msgs.len());
        for msg in msgs {
            let Some(payload) = msg.payload() else {
                continue;
            };
            match serde_json::from_slice::<MsgRecord>(payload) {
                Ok(record) => records.push(record),
                Err(err) => {
                    // message empoisonné: écarté plutôt que rejoué sans fin
                    counter!("courier_ingest_decode_errors_total").increment(1);
                    warn!(offset = msg.offset(), error = %err, "message illisible écarté");
                }
            }
        }
        records
    }
}

#[async_trait]
impl<S: SeqStore, B: SeqBuffer> BatchHandler for IngestHandler<S, B> {
    fn name(&self) -> &'static str {
        "ingest"
    }

    async fn handle_batch(&self, partition: i32, msgs: &[OwnedMessage]) -> Result<()> {
        let batch = prepare_batch(self.decode(msgs));
        for (conversation_id, group) in batch.sequenced {
            let seqs = self
                .allocator
                .malloc(&conversation_id, group.len() as i64)
                .await?;
            let assigned = assign_seqs(group, &seqs)?;
            self.cache.set_messages(&conversation_id, &assigned).await?;
            for msg in &assigned {
                if msg.opts.send_push {
                    self.producer
                        .send_json(&self.push_topic, &conversation_id, msg)
                        .await?;
                }
                if msg.opts.persistent {
                    self.producer
                        .send_json(&self.persist_topic, &conversation_id, msg)
                        .await?;
                }
            }
            counter!("courier_ingest_messages_total").increment(assigned.len() as u64);
            debug!(
                partition,
                conversation_id = %conversation_id,
                count = assigned.len(),
                first_seq = assigned.first().map(|m| m.seq).unwrap_or(0),
                "messages séquencés"
            );
        }
        for msg in &batch.modifications {
            self.producer
                .send_json(&self.modify_topic, &msg.conversation_id, msg)
                .await?;
        }
        if !batch.modifications.is_empty() {
            counter!("courier_ingest_modifications_total")
                .increment(batch.modifications.len() as u64);
        }
        Ok(())
    }
}
