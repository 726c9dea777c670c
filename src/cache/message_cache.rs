//! # Cache chaud des messages
//!
//! Journal récent des messages indexé par `(conversation, seq)` avec TTL,
//! plus les compteurs de badge et les jetons FCM. Les écritures sont
//! idempotentes sous relivraison; les suppressions tolèrent les absents.

use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::cache::keys;
use crate::config::CacheSettings;
use crate::error::{CourierError, Result};
use crate::model::MsgRecord;

pub struct MessageCache {
    conn: ConnectionManager,
    msg_timeout: Duration,
}

impl MessageCache {
    pub fn new(conn: ConnectionManager, settings: &CacheSettings) -> Self {
        Self {
            conn,
            msg_timeout: settings.msg_cache_timeout(),
        }
    }

    /// Écrit les messages séquencés dans le journal chaud
    pub async fn set_messages(&self, conversation_id: &str, msgs: &[MsgRecord]) -> Result<()> {
        if msgs.is_empty() {
            return Ok(());
        }
        let mut pipe = redis::pipe();
        for msg in msgs {
            let payload = serde_json::to_string(msg)
                .map_err(|e| CourierError::serialization_error("encode message", e))?;
            pipe.set_ex(
                keys::message(conversation_id, msg.seq),
                payload,
                self.msg_timeout.as_secs(),
            )
            .ignore();
        }
        let mut conn = self.conn.clone();
        pipe.query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| CourierError::cache_error("set messages", e))?;
        Ok(())
    }

    /// Lit les messages demandés; retourne aussi les séquences absentes
    pub async fn get_messages_by_seq(
        &self,
        conversation_id: &str,
        seqs: &[i64],
    ) -> Result<(Vec<MsgRecord>, Vec<i64>)> {
        if seqs.is_empty() {
            return Ok((Vec::new(), Vec::new()));
        }
        let mut cmd = redis::cmd("MGET");
        for seq in seqs {
            cmd.arg(keys::message(conversation_id, *seq));
        }
        let mut conn = self.conn.clone();
        let values: Vec<Option<String>> = cmd
            .query_async(&mut conn)
            .await
            .map_err(|e| CourierError::cache_error("get messages", e))?;

        let mut found = Vec::with_capacity(values.len());
        let mut missing = Vec::new();
        for (seq, value) in seqs.iter().zip(values) {
            match value {
                Some(raw) => {
                    let msg: MsgRecord = serde_json::from_str(&raw)
                        .map_err(|e| CourierError::serialization_error("decode message", e))?;
                    found.push(msg);
                }
                None => missing.push(*seq),
            }
        }
        Ok((found, missing))
    }

    /// Supprime les messages du journal chaud (après archivage durable)
    pub async fn delete_messages(&self, conversation_id: &str, seqs: &[i64]) -> Result<()> {
        if seqs.is_empty() {
            return Ok(());
        }
        let mut cmd = redis::cmd("DEL");
        for seq in seqs {
            cmd.arg(keys::message(conversation_id, *seq));
        }
        let mut conn = self.conn.clone();
        cmd.query_async::<_, i64>(&mut conn)
            .await
            .map_err(|e| CourierError::cache_error("delete messages", e))?;
        Ok(())
    }

    /// Incrémente la somme de non-lus pilotant le badge de l'utilisateur
    pub async fn incr_badge_unread_sum(&self, user_id: &str) -> Result<i64> {
        let mut conn = self.conn.clone();
        conn.incr(keys::badge_unread_sum(user_id), 1)
            .await
            .map_err(|e| CourierError::cache_error("incr badge", e))
    }

    /// Enregistre le jeton FCM d'un appareil
    pub async fn set_fcm_token(
        &self,
        user_id: &str,
        platform_id: i32,
        token: &str,
        ttl: Duration,
    ) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.set_ex(
            keys::fcm_token(user_id, platform_id),
            token,
            ttl.as_secs(),
        )
        .await
        .map_err(|e| CourierError::cache_error("set fcm token", e))
    }

    /// Retourne le jeton FCM d'un appareil s'il existe
    pub async fn get_fcm_token(&self, user_id: &str, platform_id: i32) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        conn.get(keys::fcm_token(user_id, platform_id))
            .await
            .map_err(|e| CourierError::cache_error("get fcm token", e))
    }

    /// Supprime le jeton FCM d'un appareil
    pub async fn del_fcm_token(&self, user_id: &str, platform_id: i32) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.del(keys::fcm_token(user_id, platform_id))
            .await
            .map_err(|e| CourierError::cache_error("del fcm token", e))
    }
}
