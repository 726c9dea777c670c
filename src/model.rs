//! # Modèles de messages du pipeline de transfert
//!
//! Types partagés entre l'ingestion, le cache chaud et le stockage durable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Préfixes identifiant les conversations de groupe
const GROUP_CONVERSATION_PREFIXES: [&str; 2] = ["g_", "sg_"];

/// Retourne true si l'identifiant désigne une conversation de groupe.
///
/// La structure de l'identifiant n'est utilisée que pour le dimensionnement
/// des pas d'allocation de séquences.
pub fn is_group_conversation_id(conversation_id: &str) -> bool {
    GROUP_CONVERSATION_PREFIXES
        .iter()
        .any(|prefix| conversation_id.starts_with(prefix))
}

/// Types de contenu des messages
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Text,
    Picture,
    Sound,
    Video,
    File,
    Quote,
    Custom,
    System,
    /// Édition d'un message existant
    Edit,
    /// Réaction à un message existant
    Reaction,
    /// Révocation d'un message
    Revoke,
}

impl Default for ContentType {
    fn default() -> Self {
        ContentType::Text
    }
}

impl ContentType {
    /// Les modifications ne consomment pas de séquence et partent
    /// sur le topic de modification.
    pub fn is_modification(&self) -> bool {
        matches!(self, ContentType::Edit | ContentType::Reaction)
    }
}

/// Options de routage portées par chaque message
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct MsgOptions {
    /// Le message doit être poussé aux destinataires en ligne
    pub send_push: bool,
    /// Le message doit être archivé dans le stockage durable
    pub persistent: bool,
    /// Le message compte dans le badge de non-lus
    pub unread_count: bool,
}

impl Default for MsgOptions {
    fn default() -> Self {
        Self {
            send_push: true,
            persistent: true,
            unread_count: true,
        }
    }
}

/// Message accepté circulant dans le pipeline
///
/// Pour une conversation donnée, `seq` est unique et dense à partir de
/// `min_seq`; il vaut 0 tant que l'ingestion ne l'a pas assigné.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MsgRecord {
    pub conversation_id: String,
    #[serde(default)]
    pub seq: i64,
    pub send_id: String,
    pub client_msg_id: String,
    pub server_msg_id: String,
    pub content_type: ContentType,
    #[serde(default)]
    pub payload: Vec<u8>,
    pub send_time: DateTime<Utc>,
    #[serde(default)]
    pub opts: MsgOptions,
}

impl MsgRecord {
    /// Retourne une copie du message avec la séquence assignée
    pub fn with_seq(mut self, seq: i64) -> Self {
        self.seq = seq;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn sample_msg(conversation_id: &str, server_msg_id: &str) -> MsgRecord {
        MsgRecord {
            conversation_id: conversation_id.to_string(),
            seq: 0,
            send_id: "u1".to_string(),
            client_msg_id: format!("c-{server_msg_id}"),
            server_msg_id: server_msg_id.to_string(),
            content_type: ContentType::Text,
            payload: b"bonjour".to_vec(),
            send_time: Utc::now(),
            opts: MsgOptions::default(),
        }
    }

    #[test]
    fn test_group_conversation_detection() {
        assert!(is_group_conversation_id("g_team"));
        assert!(is_group_conversation_id("sg_large_team"));
        assert!(!is_group_conversation_id("si_u1_u2"));
        assert!(!is_group_conversation_id("c1"));
    }

    #[test]
    fn test_modification_routing() {
        assert!(ContentType::Edit.is_modification());
        assert!(ContentType::Reaction.is_modification());
        assert!(!ContentType::Text.is_modification());
        assert!(!ContentType::Revoke.is_modification());
    }

    #[test]
    fn test_default_opts() {
        let msg = sample_msg("c1", "s1");
        assert!(msg.opts.send_push);
        assert!(msg.opts.persistent);
        assert_eq!(msg.seq, 0);
        assert_eq!(msg.clone().with_seq(7).seq, 7);
    }
}
