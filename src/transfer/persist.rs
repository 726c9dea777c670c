//! # Consommateur de persistance
//!
//! Draine le topic de persistance par batches, archive les messages dans
//! le store durable par conversation, puis retire les entrées
//! correspondantes du journal chaud. Le groupe committe les offsets en
//! dernier: un message n'est durable qu'après avoir été visible dans le
//! cache, les deux peuvent brièvement coexister.

use std::sync::Arc;

use async_trait::async_trait;
use metrics::counter;
use rdkafka::message::OwnedMessage;
use rdkafka::Message;
use tracing::{debug, warn};

use crate::cache::MessageCache;
use crate::error::Result;
use crate::model::MsgRecord;
use crate::storage::MessageStore;
use crate::transfer::handler::BatchHandler;

/// Regroupe les messages archivables par conversation, dans l'ordre
pub(crate) fn group_by_conversation(msgs: Vec<MsgRecord>) -> Vec<(String, Vec<MsgRecord>)> {
    let mut groups: Vec<(String, Vec<MsgRecord>)> = Vec::new();
    for msg in msgs {
        match groups
            .iter_mut()
            .find(|(conversation_id, _)| *conversation_id == msg.conversation_id)
        {
            Some((_, group)) => group.push(msg),
            None => groups.push((msg.conversation_id.clone(), vec![msg])),
        }
    }
    groups
}

/// Handler du pipeline de persistance
pub struct PersistHandler {
    store: Arc<MessageStore>,
    cache: Arc<MessageCache>,
}

impl PersistHandler {
    pub fn new(store: Arc<MessageStore>, cache: Arc<MessageCache>) -> Self {
        Self { store, cache }
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
                    counter!("courier_persist_decode_errors_total").increment(1);
                    warn!(offset = msg.offset(), error = %err, "message illisible écarté");
                }
            }
        }
        records
    }
}

#[async_trait]
impl BatchHandler for PersistHandler {
    fn name(&self) -> &'static str {
        "persist"
    }

    async fn handle_batch(&self, partition: i32, msgs: &[OwnedMessage]) -> Result<()> {
        for (conversation_id, group) in group_by_conversation(self.decode(msgs)) {
            self.store.batch_insert(&conversation_id, &group).await?;
            let seqs: Vec<i64> = group.iter().map(|m| m.seq).collect();
            self.cache.delete_messages(&conversation_id, &seqs).await?;
            counter!("courier_persist_messages_total").increment(group.len() as u64);
            debug!(
                partition,
                conversation_id = %conversation_id,
                count = group.len(),
                "messages archivés et purgés du cache chaud"
            );
        }
        Ok(())
    }
}
