//! # Journal de modifications versionné
//!
//! Un document par entité synchronisable (`d_id`), portant un journal
//! compacté « dernière mutation par élément ». Chaque append incrémente la
//! version du document; les clients interrogent le journal avec la version
//! qu'ils détiennent et ne reçoivent que les deltas. Le filigrane
//! `deleted` marque la dernière version à laquelle un événement destructif
//! a imposé une resynchronisation complète.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};

use crate::error::{CourierError, Result};

/// Version d'un document fraîchement initialisé
pub const FIRST_VERSION: i64 = 1;
/// Filigrane `deleted` d'un document sans événement destructif
pub const DEFAULT_DELETE_VERSION: i64 = 0;

/// Dernière mutation connue d'un élément
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Elem {
    pub e_id: String,
    pub deleted: bool,
    pub version: i64,
    pub last_update: DateTime<Utc>,
}

/// Vue du journal retournée aux clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteLog {
    pub d_id: String,
    pub logs: Vec<Elem>,
    pub version: i64,
    pub deleted: i64,
    pub last_update: DateTime<Utc>,
    /// Nombre d'éléments qui correspondaient avant élision éventuelle
    pub log_len: i64,
}

impl WriteLog {
    /// Retourne true si le client doit repartir d'une lecture complète:
    /// le journal a été élidé (dépassement, fenêtre destructive) ou le
    /// document n'existait pas encore.
    pub fn full(&self) -> bool {
        if self.version == 0 {
            return true;
        }
        self.logs.len() as i64 != self.log_len
    }

    /// Sépare les identifiants supprimés des identifiants modifiés
    pub fn delete_and_change_ids(&self) -> (Vec<String>, Vec<String>) {
        let mut deleted = Vec::new();
        let mut changed = Vec::new();
        for log in &self.logs {
            if log.deleted {
                deleted.push(log.e_id.clone());
            } else {
                changed.push(log.e_id.clone());
            }
        }
        (deleted, changed)
    }
}

/// Document tel que stocké (sans `log_len`, calculé à la lecture)
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct StoredDoc {
    pub d_id: String,
    pub logs: Vec<Elem>,
    pub version: i64,
    pub deleted: i64,
    pub last_update: DateTime<Utc>,
}

/// Calcule la vue client d'un document pour `version` détenue et `limit`.
///
/// Cas, dans l'ordre:
/// 1. version du document dépassée par le client, ou version détenue
///    comprise dans une fenêtre destructive réelle (`deleted > 0` et
///    `deleted >= version`): journal élidé;
/// 2. sinon ne gardent que les éléments strictement plus récents;
/// 3. si le résultat excède `limit` (quand `limit > 0`), le journal est
///    élidé et le client retombe sur une lecture complète, qu'il infère
///    de `log_len != logs.len()`; aucun indicateur dédié n'est posé.
pub(crate) fn filter_change_log(doc: &StoredDoc, version: i64, limit: i64) -> WriteLog {
    let destructive_window = doc.deleted > DEFAULT_DELETE_VERSION && doc.deleted >= version;
    let mut logs: Vec<Elem> = if doc.version < version || destructive_window {
        Vec::new()
    } else {
        doc.logs
            .iter()
            .filter(|log| log.version > version)
            .cloned()
            .collect()
    };
    let log_len = logs.len() as i64;
    if limit > 0 && log_len > limit {
        logs.clear();
    }
    WriteLog {
        d_id: doc.d_id.clone(),
        logs,
        version: doc.version,
        deleted: doc.deleted,
        last_update: doc.last_update,
        log_len,
    }
}

fn validate_e_ids(d_id: &str, e_ids: &[String]) -> Result<()> {
    if e_ids.is_empty() {
        return Err(CourierError::invalid_argument(format!(
            "aucun identifiant d'élément pour {d_id}"
        )));
    }
    let distinct: HashSet<&String> = e_ids.iter().collect();
    if distinct.len() != e_ids.len() {
        return Err(CourierError::invalid_argument(format!(
            "identifiants d'élément dupliqués pour {d_id}"
        )));
    }
    Ok(())
}

/// Journal de modifications par document
#[async_trait]
pub trait ChangeLog: Send + Sync {
    /// Append idempotent: retire les mutations précédentes des éléments
    /// puis les rappend à la nouvelle version du document
    async fn write_log(&self, d_id: &str, e_ids: &[String], deleted: bool) -> Result<()>;

    /// Retourne les éléments que le client doit appliquer depuis `version`
    async fn find_change_log(&self, d_id: &str, version: i64, limit: i64) -> Result<WriteLog>;

    /// Purge les documents inchangés depuis `deadline`; retourne le nombre
    /// de documents supprimés
    async fn delete_after_unchanged_log(&self, deadline: DateTime<Utc>) -> Result<u64>;
}

/// Implémentation PostgreSQL du journal
pub struct PgChangeLog {
    pool: PgPool,
}

impl PgChangeLog {
    /// Construit le store et garantit l'index sur `d_id`
    pub async fn new(pool: PgPool) -> Result<Self> {
        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS write_logs_d_id_idx ON write_logs (d_id)",
        )
        .execute(&pool)
        .await
        .map_err(|e| CourierError::database_error("init write_logs index", e))?;
        Ok(Self { pool })
    }

    /// Append en un seul pipeline conditionnel: filtrage des éléments
    /// remplacés et concaténation des nouveaux, portés par `version + 1`,
    /// dans la même instruction; les écrivains concurrents sont
    /// linéarisés par le verrou de ligne.
    async fn write_log_batch(
        &self,
        d_id: &str,
        e_ids: &[String],
        deleted: bool,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"UPDATE write_logs SET
                   version = write_logs.version + 1,
                   last_update = $3,
                   logs = (
                       SELECT coalesce(jsonb_agg(l), '[]'::jsonb)
                       FROM jsonb_array_elements(write_logs.logs) AS l
                       WHERE NOT (l->>'e_id' = ANY($2))
                   ) || (
                       SELECT coalesce(jsonb_agg(jsonb_build_object(
                           'e_id', e,
                           'deleted', $4::bool,
                           'version', write_logs.version + 1,
                           'last_update', to_jsonb($3::timestamptz))), '[]'::jsonb)
                       FROM unnest($2::text[]) AS e
                   )
               WHERE d_id = $1"#,
        )
        .bind(d_id)
        .bind(e_ids)
        .bind(now)
        .bind(deleted)
        .execute(&self.pool)
        .await
        .map_err(|e| CourierError::database_error("write_log", e))?;
        Ok(result.rows_affected())
    }

    /// Initialise un document à la première version. Retourne false si un
    /// écrivain concurrent l'a créé entre-temps.
    async fn init_doc(
        &self,
        d_id: &str,
        e_ids: &[String],
        deleted: bool,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let logs: Vec<Elem> = e_ids
            .iter()
            .map(|e_id| Elem {
                e_id: e_id.clone(),
                deleted,
                version: FIRST_VERSION,
                last_update: now,
            })
            .collect();
        let logs_json = serde_json::to_value(&logs)
            .map_err(|e| CourierError::serialization_error("encode write_log", e))?;
        let result = sqlx::query(
            r#"INSERT INTO write_logs (d_id, logs, version, deleted, last_update)
               VALUES ($1, $2, $3, $4, $5)
               ON CONFLICT (d_id) DO NOTHING"#,
        )
        .bind(d_id)
        .bind(logs_json)
        .bind(FIRST_VERSION)
        .bind(DEFAULT_DELETE_VERSION)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| CourierError::database_error("init write_log", e))?;
        Ok(result.rows_affected() > 0)
    }

    async fn fetch_doc(&self, d_id: &str) -> Result<Option<StoredDoc>> {
        let row = sqlx::query(
            r#"SELECT d_id, logs, version, deleted, last_update
               FROM write_logs WHERE d_id = $1"#,
        )
        .bind(d_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| CourierError::database_error("fetch write_log", e))?;
        let Some(row) = row else {
            return Ok(None);
        };
        let logs_json: serde_json::Value = row
            .try_get("logs")
            .map_err(|e| CourierError::database_error("fetch write_log", e))?;
        let logs: Vec<Elem> = serde_json::from_value(logs_json)
            .map_err(|e| CourierError::serialization_error("decode write_log", e))?;
        Ok(Some(StoredDoc {
            d_id: row
                .try_get("d_id")
                .map_err(|e| CourierError::database_error("fetch write_log", e))?,
            logs,
            version: row
                .try_get("version")
                .map_err(|e| CourierError::database_error("fetch write_log", e))?,
            deleted: row
                .try_get("deleted")
                .map_err(|e| CourierError::database_error("fetch write_log", e))?,
            last_update: row
                .try_get("last_update")
                .map_err(|e| CourierError::database_error("fetch write_log", e))?,
        }))
    }
}

#[async_trait]
impl ChangeLog for PgChangeLog {
    async fn write_log(&self, d_id: &str, e_ids: &[String], deleted: bool) -> Result<()> {
        validate_e_ids(d_id, e_ids)?;
        let now = Utc::now();
        if self.write_log_batch(d_id, e_ids, deleted, now).await? > 0 {
            return Ok(());
        }
        if self.init_doc(d_id, e_ids, deleted, now).await? {
            return Ok(());
        }
        // créé par un concurrent entre l'update et l'insert: on rejoue
        if self.write_log_batch(d_id, e_ids, deleted, now).await? == 0 {
            return Err(CourierError::internal_error(format!(
                "write_log: document {d_id} introuvable après initialisation"
            )));
        }
        Ok(())
    }

    async fn find_change_log(&self, d_id: &str, version: i64, limit: i64) -> Result<WriteLog> {
        if let Some(doc) = self.fetch_doc(d_id).await? {
            return Ok(filter_change_log(&doc, version, limit));
        }
        // document absent: initialisation paresseuse à la première version
        let now = Utc::now();
        if self.init_doc(d_id, &[], false, now).await? {
            return Ok(WriteLog {
                d_id: d_id.to_string(),
                logs: Vec::new(),
                version: FIRST_VERSION,
                deleted: DEFAULT_DELETE_VERSION,
                last_update: now,
                log_len: 0,
            });
        }
        let doc = self.fetch_doc(d_id).await?.ok_or_else(|| {
            CourierError::internal_error(format!(
                "find_change_log: document {d_id} introuvable après initialisation"
            ))
        })?;
        Ok(filter_change_log(&doc, version, limit))
    }

    async fn delete_after_unchanged_log(&self, deadline: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM write_logs WHERE last_update < $1")
            .bind(deadline)
            .execute(&self.pool)
            .await
            .map_err(|e| CourierError::database_error("delete_after_unchanged_log", e))?;
        Ok(result.rows_affected())
    }
}

/// Implémentation en mémoire, partageant la logique de lecture avec le
/// store PostgreSQL; sert aux tests des invariants du journal
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::HashMap;
    use tokio::sync::Mutex;

    #[derive(Default)]
    pub struct MemChangeLog {
        docs: Mutex<HashMap<String, StoredDoc>>,
    }

    impl MemChangeLog {
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl ChangeLog for MemChangeLog {
        async fn write_log(&self, d_id: &str, e_ids: &[String], deleted: bool) -> Result<()> {
            validate_e_ids(d_id, e_ids)?;
            let now = Utc::now();
            let mut docs = self.docs.lock().await;
            match docs.get_mut(d_id) {
                Some(doc) => {
                    doc.version += 1;
                    doc.last_update = now;
                    doc.logs.retain(|log| !e_ids.contains(&log.e_id));
                    for e_id in e_ids {
                        doc.logs.push(Elem {
                            e_id: e_id.clone(),
                            deleted,
                            version: doc.version,
                            last_update: now,
                        });
                    }
                }
                None => {
                    docs.insert(
                        d_id.to_string(),
                        StoredDoc {
                            d_id: d_id.to_string(),
                            logs: e_ids
                                .iter()
                                .map(|e_id| Elem {
                                    e_id: e_id.clone(),
                                    deleted,
                                    version: FIRST_VERSION,
                                    last_update: now,
                                })
                                .collect(),
                            version: FIRST_VERSION,
                            deleted: DEFAULT_DELETE_VERSION,
                            last_update: now,
                        },
                    );
                }
            }
            Ok(())
        }

        async fn find_change_log(&self, d_id: &str, version: i64, limit: i64) -> Result<WriteLog> {
            let mut docs = self.docs.lock().await;
            let doc = docs.entry(d_id.to_string()).or_insert_with(|| StoredDoc {
                d_id: d_id.to_string(),
                logs: Vec::new(),
                version: FIRST_VERSION,
                deleted: DEFAULT_DELETE_VERSION,
                last_update: Utc::now(),
            });
            Ok(filter_change_log(doc, version, limit))
        }

        async fn delete_after_unchanged_log(&self, deadline: DateTime<Utc>) -> Result<u64> {
            let mut docs = self.docs.lock().await;
            let before = docs.len();
            docs.retain(|_, doc| doc.last_update >= deadline);
            Ok((before - docs.len()) as u64)
        }
    }
}
