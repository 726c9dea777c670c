//! # Stockage durable des messages
//!
//! Les messages archivés sont regroupés en seaux de taille fixe indexés
//! par `(conversation, seau)`, `msgs` trié par séquence croissante.
//! L'append déduplique par séquence: la relivraison at-least-once du
//! pipeline de persistance est sans effet.

use sqlx::{PgPool, Row};

use crate::error::{CourierError, Result};
use crate::model::MsgRecord;

/// Capacité logique d'un seau
pub const MSGS_PER_BUCKET: i64 = 100;

/// Seau d'une séquence (les séquences commencent à 1)
pub fn bucket_index(seq: i64) -> i64 {
    (seq - 1) / MSGS_PER_BUCKET
}

/// Identifiant de document d'un seau
pub fn doc_id(conversation_id: &str, bucket: i64) -> String {
    format!("{conversation_id}:{bucket}")
}

/// Store durable des messages
pub struct MessageStore {
    pool: PgPool,
}

impl MessageStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Archive un lot de messages d'une même conversation.
    ///
    /// Les messages sont ventilés par seau puis chaque seau est upserté en
    /// une instruction: concaténation, déduplication par séquence (les
    /// entrées déjà archivées gagnent) et tri croissant.
    pub async fn batch_insert(&self, conversation_id: &str, msgs: &[MsgRecord]) -> Result<()> {
        if msgs.is_empty() {
            return Ok(());
        }
        let mut by_bucket: Vec<(i64, Vec<&MsgRecord>)> = Vec::new();
        for msg in msgs {
            if msg.seq <= 0 {
                return Err(CourierError::invalid_argument(format!(
                    "message sans séquence pour {conversation_id}: {}",
                    msg.server_msg_id
                )));
            }
            let bucket = bucket_index(msg.seq);
            match by_bucket.iter_mut().find(|(b, _)| *b == bucket) {
                Some((_, group)) => group.push(msg),
                None => by_bucket.push((bucket, vec![msg])),
            }
        }
        for (bucket, group) in by_bucket {
            self.upsert_bucket(conversation_id, bucket, &group).await?;
        }
        Ok(())
    }

    async fn upsert_bucket(
        &self,
        conversation_id: &str,
        bucket: i64,
        msgs: &[&MsgRecord],
    ) -> Result<()> {
        let batch = serde_json::to_value(msgs)
            .map_err(|e| CourierError::serialization_error("encode bucket", e))?;
        sqlx::query(
            r#"INSERT INTO message_docs (doc_id, conversation_id, bucket, msgs)
               VALUES ($1, $2, $3, $4)
               ON CONFLICT (doc_id) DO UPDATE SET msgs = (
                   SELECT jsonb_agg(m ORDER BY seq)
                   FROM (
                       SELECT DISTINCT ON (seq) m, seq
                       FROM (
                           SELECT m, (m->>'seq')::bigint AS seq, ord
                           FROM jsonb_array_elements(message_docs.msgs || excluded.msgs)
                                WITH ORDINALITY AS t(m, ord)
                       ) AS unpacked
                       ORDER BY seq, ord
                   ) AS deduped
               )"#,
        )
        .bind(doc_id(conversation_id, bucket))
        .bind(conversation_id)
        .bind(bucket)
        .bind(batch)
        .execute(&self.pool)
        .await
        .map_err(|e| CourierError::database_error("upsert message bucket", e))?;
        Ok(())
    }

    /// Lit les messages demandés par séquence, triés par séquence
    pub async fn get_messages_by_seq(
        &self,
        conversation_id: &str,
        seqs: &[i64],
    ) -> Result<Vec<MsgRecord>> {
        if seqs.is_empty() {
            return Ok(Vec::new());
        }
        let mut buckets: Vec<i64> = seqs.iter().map(|seq| bucket_index(*seq)).collect();
        buckets.sort_unstable();
        buckets.dedup();

        let rows = sqlx::query(
            r#"SELECT msgs FROM message_docs
               WHERE conversation_id = $1 AND bucket = ANY($2)
               ORDER BY bucket"#,
        )
        .bind(conversation_id)
        .bind(&buckets)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| CourierError::database_error("get messages", e))?;

        let mut found = Vec::with_capacity(seqs.len());
        for row in rows {
            let msgs_json: serde_json::Value = row
                .try_get("msgs")
                .map_err(|e| CourierError::database_error("get messages", e))?;
            let msgs: Vec<MsgRecord> = serde_json::from_value(msgs_json)
                .map_err(|e| CourierError::serialization_error("decode bucket", e))?;
            found.extend(msgs.into_iter().filter(|m| seqs.contains(&m.seq)));
        }
        found.sort_by_key(|m| m.seq);
        Ok(found)
    }
}
