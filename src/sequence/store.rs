//! # Store de séquences faisant autorité
//!
//! Incrémente atomiquement la séquence maximale par conversation dans la
//! base durable. Les appelants concurrents de `malloc_seq` se sérialisent
//! sur le find-and-increment atomique.

use async_trait::async_trait;
use sqlx::PgPool;

use crate::error::{CourierError, Result};
use crate::storage::update::{SeqField, SeqRecordUpdate};

/// Enregistrement de séquences d'une conversation
///
/// `max_seq` est non décroissant; `min_seq <= max_seq`; `min_seq` n'avance
/// que par un trim explicite.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct SeqRecord {
    pub conversation_id: String,
    pub max_seq: i64,
    pub min_seq: i64,
}

/// Compteur de séquences faisant autorité
#[async_trait]
pub trait SeqStore: Send + Sync {
    /// Incrémente atomiquement `max_seq` de `size` et retourne le nouveau
    /// `max_seq`. Crée l'enregistrement `{max_seq: size, min_seq: 1}` s'il
    /// n'existe pas. `size <= 0` est rejeté.
    async fn malloc_seq(&self, conversation_id: &str, size: i64) -> Result<i64>;

    /// Retourne 0 si l'enregistrement n'existe pas
    async fn get_max_seq(&self, conversation_id: &str) -> Result<i64>;

    /// Retourne 0 si l'enregistrement n'existe pas
    async fn get_min_seq(&self, conversation_id: &str) -> Result<i64>;

    /// Avance `min_seq` (monotone: une régression est un conflit)
    async fn set_min_seq(&self, conversation_id: &str, seq: i64) -> Result<()>;

    /// Retourne l'enregistrement complet
    async fn get_conversation(&self, conversation_id: &str) -> Result<Option<SeqRecord>>;

    /// Alloue `size` séquences et dérive la plage émise
    /// `[dernier - size + 1 ..= dernier]`
    async fn malloc(&self, conversation_id: &str, size: i64) -> Result<Vec<i64>> {
        let last = self.malloc_seq(conversation_id, size).await?;
        Ok((last - size + 1..=last).collect())
    }
}

/// Implémentation PostgreSQL du compteur faisant autorité
pub struct PgSeqStore {
    pool: PgPool,
}

impl PgSeqStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Traduit une mise à jour parcellaire en clauses SET, avec gardes de
    /// monotonie par champ. Retourne le nombre de lignes affectées.
    pub async fn apply_update(
        &self,
        conversation_id: &str,
        update: &SeqRecordUpdate,
    ) -> Result<u64> {
        if update.is_empty() {
            return Err(CourierError::invalid_argument(
                "mise à jour de séquences vide",
            ));
        }
        let mut set_clauses = Vec::with_capacity(update.len());
        let mut guards = Vec::new();
        let mut placeholder = 2;
        for (field, _) in update.entries() {
            set_clauses.push(format!("{} = ${placeholder}", field.column()));
            // max_seq non décroissant, min_seq non régressif
            match field {
                SeqField::MaxSeq => guards.push(format!("max_seq <= ${placeholder}")),
                SeqField::MinSeq => guards.push(format!("min_seq <= ${placeholder}")),
            }
            placeholder += 1;
        }
        let mut sql = format!(
            "UPDATE conversation_seq SET {} WHERE conversation_id = $1",
            set_clauses.join(", ")
        );
        for guard in &guards {
            sql.push_str(" AND ");
            sql.push_str(guard);
        }
        let mut query = sqlx::query(&sql).bind(conversation_id);
        for (_, value) in update.entries() {
            query = query.bind(value);
        }
        let result = query
            .execute(&self.pool)
            .await
            .map_err(|e| CourierError::database_error("update conversation_seq", e))?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl SeqStore for PgSeqStore {
    async fn malloc_seq(&self, conversation_id: &str, size: i64) -> Result<i64> {
        if size <= 0 {
            return Err(CourierError::invalid_argument(
                "size must be greater than 0",
            ));
        }
        let max_seq: i64 = sqlx::query_scalar(
            r#"INSERT INTO conversation_seq (conversation_id, max_seq, min_seq)
               VALUES ($1, $2, 1)
               ON CONFLICT (conversation_id)
               DO UPDATE SET max_seq = conversation_seq.max_seq + EXCLUDED.max_seq
               RETURNING max_seq"#,
        )
        .bind(conversation_id)
        .bind(size)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| CourierError::database_error("malloc_seq", e))?;
        Ok(max_seq)
    }

    async fn get_max_seq(&self, conversation_id: &str) -> Result<i64> {
        let max_seq: Option<i64> = sqlx::query_scalar(
            "SELECT max_seq FROM conversation_seq WHERE conversation_id = $1",
        )
        .bind(conversation_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| CourierError::database_error("get_max_seq", e))?;
        Ok(max_seq.unwrap_or(0))
    }

    async fn get_min_seq(&self, conversation_id: &str) -> Result<i64> {
        let min_seq: Option<i64> = sqlx::query_scalar(
            "SELECT min_seq FROM conversation_seq WHERE conversation_id = $1",
        )
        .bind(conversation_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| CourierError::database_error("get_min_seq", e))?;
        Ok(min_seq.unwrap_or(0))
    }

    async fn set_min_seq(&self, conversation_id: &str, seq: i64) -> Result<()> {
        let update = SeqRecordUpdate::new().with_min_seq(seq);
        let affected = self.apply_update(conversation_id, &update).await?;
        if affected > 0 {
            return Ok(());
        }
        match self.get_conversation(conversation_id).await? {
            None => Err(CourierError::not_found("conversation_seq", conversation_id)),
            Some(record) => Err(CourierError::conflict(format!(
                "min_seq ne peut pas reculer: {} -> {} ({})",
                record.min_seq, seq, conversation_id
            ))),
        }
    }

    async fn get_conversation(&self, conversation_id: &str) -> Result<Option<SeqRecord>> {
        sqlx::query_as::<_, SeqRecord>(
            r#"SELECT conversation_id, max_seq, min_seq
               FROM conversation_seq WHERE conversation_id = $1"#,
        )
        .bind(conversation_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| CourierError::database_error("get_conversation", e))
    }
}


#[cfg(test)]
mod tests {
    use super::testing::MemSeqStore;
    use super::*;
    use crate::error::ErrorKind;

    #[tokio::test]
    async fn test_malloc_derives_dense_range() {
        let store = MemSeqStore::new();
        let seqs = store.malloc("c1", 5).await.unwrap();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
        assert_eq!(store.get_max_seq("c1").await.unwrap(), 5);

        let seqs = store.malloc("c1", 3).await.unwrap();
        assert_eq!(seqs, vec![6, 7, 8]);
    }

    #[tokio::test]
    async fn test_missing_record_reads_zero() {
        let store = MemSeqStore::new();
        assert_eq!(store.get_max_seq("absent").await.unwrap(), 0);
        assert_eq!(store.get_min_seq("absent").await.unwrap(), 0);
        assert!(store.get_conversation("absent").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_malloc_rejects_non_positive_size() {
        let store = MemSeqStore::new();
        let err = store.malloc_seq("c1", 0).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        let err = store.malloc_seq("c1", -4).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn test_set_min_seq_monotonicity() {
        let store = MemSeqStore::new();
        store.malloc("c1", 10).await.unwrap();
        store.set_min_seq("c1", 4).await.unwrap();
        assert_eq!(store.get_min_seq("c1").await.unwrap(), 4);

        let err = store.set_min_seq("c1", 2).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);

        let err = store.set_min_seq("absent", 2).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
