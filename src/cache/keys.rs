//! Construction centralisée des clés du cache distribué.
//!
//! Toute clé Redis du serveur est fabriquée ici afin de garder le schéma
//! de nommage en un seul endroit.

/// Liste de pré-allocation de séquences d'une conversation
pub fn malloc_seq(conversation_id: &str) -> String {
    format!("malloc_seq:{conversation_id}")
}

/// Verrou single-flight de remplissage de la liste de pré-allocation
pub fn malloc_seq_lock(conversation_id: &str) -> String {
    format!("malloc_seq_lock:{conversation_id}")
}

/// Message chaud indexé par conversation et séquence
pub fn message(conversation_id: &str, seq: i64) -> String {
    format!("msg:{conversation_id}:{seq}")
}

/// Somme des non-lus pilotant le badge de notification d'un utilisateur
pub fn badge_unread_sum(user_id: &str) -> String {
    format!("badge_unread_sum:{user_id}")
}

/// Jeton FCM d'un appareil, par utilisateur et plateforme
pub fn fcm_token(user_id: &str, platform_id: i32) -> String {
    format!("fcm_token:{user_id}:{platform_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_formats() {
        assert_eq!(malloc_seq("g_team"), "malloc_seq:g_team");
        assert_eq!(malloc_seq_lock("g_team"), "malloc_seq_lock:g_team");
        assert_eq!(message("c1", 42), "msg:c1:42");
        assert_eq!(badge_unread_sum("u1"), "badge_unread_sum:u1");
        assert_eq!(fcm_token("u1", 2), "fcm_token:u1:2");
    }
}
