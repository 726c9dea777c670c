//! # Allocateur de séquences avec cache distribué
//!
//! Front du compteur faisant autorité: une liste de pré-allocation par
//! conversation amortit les allers-retours vers le store, un verrou
//! single-flight évite les remplissages en troupeau, et un contrôle de
//! contiguïté garantit que chaque batch retourné est dense même quand les
//! remplissages se croisent.
//!
//! Toutes les transitions multi-étapes côté cache (pop+trim+del,
//! del+rpush+expire) tiennent dans un script atomique unique.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use redis::aio::ConnectionManager;
use redis::Script;

use crate::cache::keys;
use crate::config::CacheSettings;
use crate::error::{CourierError, Result};
use crate::model::is_group_conversation_id;
use crate::sequence::store::SeqStore;

/// Nombre de tentatives avant d'abandonner une allocation
const MAX_MALLOC_ATTEMPTS: u32 = 10;

/// Dépile en tête de liste puis supprime le verrou de remplissage quand la
/// liste se vide.
static POP_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
local result = redis.call("LRANGE", KEYS[1], 0, ARGV[1]-1)
if #result == 0 then
	return result
end
redis.call("LTRIM", KEYS[1], #result, -1)
if redis.call("LLEN", KEYS[1]) == 0 then
	redis.call("DEL", KEYS[2])
end
return result
"#,
    )
});

/// Remplace le contenu de la liste et arme son TTL; libère le verrou si le
/// remplissage ne laisse aucun reliquat.
static PUSH_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
redis.call("DEL", KEYS[1])
for i = 2, #ARGV do
	redis.call("RPUSH", KEYS[1], ARGV[i])
end
if redis.call("LLEN", KEYS[1]) == 0 then
	redis.call("DEL", KEYS[2])
else
	redis.call("EXPIRE", KEYS[1], ARGV[1])
end
return 1
"#,
    )
});

/// Surface de la liste de pré-allocation et de son verrou single-flight
#[async_trait]
pub trait SeqBuffer: Send + Sync {
    /// Dépile atomiquement jusqu'à `size` séquences en tête de liste
    async fn pop(&self, conversation_id: &str, size: i64) -> Result<Vec<i64>>;

    /// Remplace atomiquement le contenu de la liste par `seqs`
    async fn push(&self, conversation_id: &str, seqs: &[i64]) -> Result<()>;

    /// Tente de prendre le verrou de remplissage; false si un autre
    /// processus détient la fenêtre single-flight
    async fn try_begin_refill(&self, conversation_id: &str) -> Result<bool>;
}

/// Implémentation Redis de la liste de pré-allocation
pub struct RedisSeqBuffer {
    conn: ConnectionManager,
    list_expire: Duration,
    lock_expire: Duration,
}

impl RedisSeqBuffer {
    pub fn new(conn: ConnectionManager, settings: &CacheSettings) -> Self {
        Self {
            conn,
            list_expire: settings.seq_list_expire(),
            lock_expire: settings.seq_lock_expire(),
        }
    }
}

#[async_trait]
impl SeqBuffer for RedisSeqBuffer {
    async fn pop(&self, conversation_id: &str, size: i64) -> Result<Vec<i64>> {
        let mut conn = self.conn.clone();
        let seqs: Vec<i64> = POP_SCRIPT
            .key(keys::malloc_seq(conversation_id))
            .key(keys::malloc_seq_lock(conversation_id))
            .arg(size)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| CourierError::cache_error("seq pop", e))?;
        Ok(seqs)
    }

    async fn push(&self, conversation_id: &str, seqs: &[i64]) -> Result<()> {
        let mut conn = self.conn.clone();
        let mut invocation = PUSH_SCRIPT.prepare_invoke();
        invocation
            .key(keys::malloc_seq(conversation_id))
            .key(keys::malloc_seq_lock(conversation_id))
            .arg(self.list_expire.as_secs());
        for seq in seqs {
            invocation.arg(*seq);
        }
        let _: i64 = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(|e| CourierError::cache_error("seq push", e))?;
        Ok(())
    }

    async fn try_begin_refill(&self, conversation_id: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let acquired: Option<String> = redis::cmd("SET")
            .arg(keys::malloc_seq_lock(conversation_id))
            .arg(chrono::Utc::now().timestamp_micros())
            .arg("NX")
            .arg("EX")
            .arg(self.lock_expire.as_secs())
            .query_async(&mut conn)
            .await
            .map_err(|e| CourierError::cache_error("seq refill lock", e))?;
        Ok(acquired.is_some())
    }
}

/// Allocateur de séquences par conversation
///
/// `malloc(conv, size)` retourne exactement `size` identifiants strictement
/// croissants et contigus, tous supérieurs à tout identifiant déjà retourné
/// pour cette conversation.
pub struct SeqAllocator<S, B> {
    store: Arc<S>,
    buffer: Arc<B>,
    group_min_num: i64,
    user_min_num: i64,
    refill_retry_delay: Duration,
}

impl<S: SeqStore, B: SeqBuffer> SeqAllocator<S, B> {
    pub fn new(store: Arc<S>, buffer: Arc<B>, settings: &CacheSettings) -> Self {
        Self {
            store,
            buffer,
            group_min_num: settings.group_min_num,
            user_min_num: settings.user_min_num,
            refill_retry_delay: Duration::from_millis(20),
        }
    }

    /// Alloue `size` séquences pour la conversation
    pub async fn malloc(&self, conversation_id: &str, size: i64) -> Result<Vec<i64>> {
        if size <= 0 {
            return Err(CourierError::invalid_argument(
                "size must be greater than 0",
            ));
        }
        for _ in 0..MAX_MALLOC_ATTEMPTS {
            let mut seqs = self.buffer.pop(conversation_id, size).await?;
            if (seqs.len() as i64) < size {
                self.refill(conversation_id, size, &mut seqs).await?;
            }
            if (seqs.len() as i64) >= size {
                return Ok(seqs);
            }
        }
        Err(CourierError::internal_error(format!(
            "malloc seq failed: {conversation_id}"
        )))
    }

    /// Remplit la liste depuis le store sous le verrou single-flight et
    /// complète `seqs` quand la fenêtre nous appartient.
    async fn refill(
        &self,
        conversation_id: &str,
        size: i64,
        seqs: &mut Vec<i64>,
    ) -> Result<()> {
        if !self.buffer.try_begin_refill(conversation_id).await? {
            // un autre processus remplit: on reprendra en tête de liste
            tokio::time::sleep(self.refill_retry_delay).await;
            return Ok(());
        }
        let step = self.step_size(conversation_id, size);
        let mut range = self.store.malloc(conversation_id, step).await?;
        if (range.len() as i64) < size {
            return Err(CourierError::internal_error(
                "le store a émis une plage plus courte que demandé",
            ));
        }
        let take = match seqs.last() {
            // la plage fraîche prolonge la tranche déjà détenue
            Some(&last) if last + 1 == range[0] => size as usize - seqs.len(),
            _ => {
                // tranche partielle non adjacente: abandonnée, jamais réutilisée
                seqs.clear();
                size as usize
            }
        };
        seqs.extend(range.drain(..take));
        self.buffer.push(conversation_id, &range).await?;
        Ok(())
    }

    /// Pas de remplissage: `base + size` si la demande dépasse le pas de
    /// base, sinon le pas de base (1000 groupe / 100 un-à-un).
    fn step_size(&self, conversation_id: &str, size: i64) -> i64 {
        let base = if is_group_conversation_id(conversation_id) {
            self.group_min_num
        } else {
            self.user_min_num
        };
        if size > base {
            base + size
        } else {
            base
        }
    }

    /// Séquence maximale connue du store faisant autorité
    pub async fn get_max_seq(&self, conversation_id: &str) -> Result<i64> {
        self.store.get_max_seq(conversation_id).await
    }

    /// Séquence minimale connue du store faisant autorité
    pub async fn get_min_seq(&self, conversation_id: &str) -> Result<i64> {
        self.store.get_min_seq(conversation_id).await
    }

    /// Avance la séquence minimale (trim explicite)
    pub async fn set_min_seq(&self, conversation_id: &str, seq: i64) -> Result<()> {
        self.store.set_min_seq(conversation_id, seq).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::sequence::store::testing::MemSeqStore;
    use std::collections::{HashMap, HashSet, VecDeque};
    use std::sync::Arc;
    use tokio::sync::Mutex;

    /// Liste de pré-allocation en mémoire avec la sémantique des scripts
    /// Redis (verrou libéré quand la liste se vide)
    #[derive(Default)]
    struct MemSeqBuffer {
        lists: Mutex<HashMap<String, VecDeque<i64>>>,
        locks: Mutex<HashSet<String>>,
    }

    impl MemSeqBuffer {
        fn new() -> Self {
            Self::default()
        }

        async fn seed(&self, conversation_id: &str, seqs: impl IntoIterator<Item = i64>) {
            let mut lists = self.lists.lock().await;
            lists.insert(conversation_id.to_string(), seqs.into_iter().collect());
        }

        async fn list_len(&self, conversation_id: &str) -> usize {
            let lists = self.lists.lock().await;
            lists.get(conversation_id).map(|l| l.len()).unwrap_or(0)
        }

        async fn list_bounds(&self, conversation_id: &str) -> Option<(i64, i64)> {
            let lists = self.lists.lock().await;
            let list = lists.get(conversation_id)?;
            Some((*list.front()?, *list.back()?))
        }

        async fn hold_lock(&self, conversation_id: &str) {
            let mut locks = self.locks.lock().await;
            locks.insert(conversation_id.to_string());
        }
    }

    #[async_trait]
    impl SeqBuffer for MemSeqBuffer {
        async fn pop(&self, conversation_id: &str, size: i64) -> Result<Vec<i64>> {
            let mut lists = self.lists.lock().await;
            let Some(list) = lists.get_mut(conversation_id) else {
                return Ok(Vec::new());
            };
            let take = (size as usize).min(list.len());
            let popped: Vec<i64> = list.drain(..take).collect();
            if popped.is_empty() {
                return Ok(popped);
            }
            if list.is_empty() {
                lists.remove(conversation_id);
                self.locks.lock().await.remove(conversation_id);
            }
            Ok(popped)
        }

        async fn push(&self, conversation_id: &str, seqs: &[i64]) -> Result<()> {
            let mut lists = self.lists.lock().await;
            if seqs.is_empty() {
                lists.remove(conversation_id);
                self.locks.lock().await.remove(conversation_id);
            } else {
                lists.insert(conversation_id.to_string(), seqs.iter().copied().collect());
            }
            Ok(())
        }

        async fn try_begin_refill(&self, conversation_id: &str) -> Result<bool> {
            let mut locks = self.locks.lock().await;
            Ok(locks.insert(conversation_id.to_string()))
        }
    }

    fn allocator(
        store: Arc<MemSeqStore>,
        buffer: Arc<MemSeqBuffer>,
    ) -> SeqAllocator<MemSeqStore, MemSeqBuffer> {
        let mut allocator =
            SeqAllocator::new(store, buffer, &crate::config::CacheSettings::default());
        allocator.refill_retry_delay = Duration::from_millis(2);
        allocator
    }

    fn assert_dense(seqs: &[i64]) {
        for window in seqs.windows(2) {
            assert_eq!(window[1], window[0] + 1, "batch non contigu: {seqs:?}");
        }
    }

    #[tokio::test]
    async fn test_fresh_group_conversation_allocation() {
        let store = Arc::new(MemSeqStore::new());
        let buffer = Arc::new(MemSeqBuffer::new());
        let alloc = allocator(store.clone(), buffer.clone());

        let seqs = alloc.malloc("g_c1", 5).await.unwrap();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
        // pas de groupe: le store a émis 1000 ids, le reliquat est en liste
        assert_eq!(store.get_max_seq("g_c1").await.unwrap(), 1000);
        assert_eq!(buffer.list_len("g_c1").await, 995);
        assert_eq!(buffer.list_bounds("g_c1").await, Some((6, 1000)));
    }

    #[tokio::test]
    async fn test_fresh_single_conversation_allocation() {
        let store = Arc::new(MemSeqStore::new());
        let buffer = Arc::new(MemSeqBuffer::new());
        let alloc = allocator(store.clone(), buffer.clone());

        let seqs = alloc.malloc("si_u1_u2", 5).await.unwrap();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
        assert_eq!(store.get_max_seq("si_u1_u2").await.unwrap(), 100);
        assert_eq!(buffer.list_bounds("si_u1_u2").await, Some((6, 100)));
    }

    #[tokio::test]
    async fn test_large_request_grows_step() {
        let store = Arc::new(MemSeqStore::new());
        let buffer = Arc::new(MemSeqBuffer::new());
        let alloc = allocator(store.clone(), buffer.clone());

        // size > base: le pas devient base + size
        let seqs = alloc.malloc("si_u1_u2", 150).await.unwrap();
        assert_eq!(seqs.len(), 150);
        assert_eq!(seqs[0], 1);
        assert_dense(&seqs);
        assert_eq!(store.get_max_seq("si_u1_u2").await.unwrap(), 250);
        assert_eq!(buffer.list_len("si_u1_u2").await, 100);
    }

    #[tokio::test]
    async fn test_sequential_mallocs_never_duplicate() {
        let store = Arc::new(MemSeqStore::new());
        let buffer = Arc::new(MemSeqBuffer::new());
        let alloc = allocator(store.clone(), buffer.clone());

        let mut seen = HashSet::new();
        let mut previous_max = 0;
        for size in [5, 120, 1, 37, 1000, 3] {
            let seqs = alloc.malloc("g_room", size).await.unwrap();
            assert_eq!(seqs.len() as i64, size);
            assert_dense(&seqs);
            assert!(seqs[0] > previous_max, "les batches doivent croître");
            previous_max = *seqs.last().unwrap();
            for seq in seqs {
                assert!(seen.insert(seq), "séquence dupliquée: {seq}");
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_contended_refill() {
        let store = Arc::new(MemSeqStore::new());
        let buffer = Arc::new(MemSeqBuffer::new());
        // état initial: 50 ids pré-alloués restants
        store.malloc_seq("c2", 100).await.unwrap();
        buffer.seed("c2", 51..=100).await;
        let alloc = Arc::new(allocator(store.clone(), buffer.clone()));

        let a = tokio::spawn({
            let alloc = alloc.clone();
            async move { alloc.malloc("c2", 80).await }
        });
        let b = tokio::spawn({
            let alloc = alloc.clone();
            async move { alloc.malloc("c2", 80).await }
        });
        let first = a.await.unwrap().unwrap();
        let second = b.await.unwrap().unwrap();

        assert_eq!(first.len(), 80);
        assert_eq!(second.len(), 80);
        assert_dense(&first);
        assert_dense(&second);

        let union: HashSet<i64> = first.iter().chain(second.iter()).copied().collect();
        assert_eq!(union.len(), 160, "les deux batches doivent être disjoints");
    }

    #[tokio::test]
    async fn test_refill_exhaustion_is_internal() {
        let store = Arc::new(MemSeqStore::new());
        let buffer = Arc::new(MemSeqBuffer::new());
        // verrou détenu ailleurs et jamais relâché: aucune tentative n'aboutit
        buffer.hold_lock("c3").await;
        let alloc = allocator(store.clone(), buffer.clone());

        let err = alloc.malloc("c3", 10).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);
    }

    #[tokio::test]
    async fn test_malloc_rejects_non_positive_size() {
        let store = Arc::new(MemSeqStore::new());
        let buffer = Arc::new(MemSeqBuffer::new());
        let alloc = allocator(store, buffer);
        let err = alloc.malloc("c1", 0).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn test_non_adjacent_partial_is_discarded() {
        let store = Arc::new(MemSeqStore::new());
        let buffer = Arc::new(MemSeqBuffer::new());
        // le store est déjà à 300 mais la liste contient une vieille tranche
        store.malloc_seq("si_old", 300).await.unwrap();
        buffer.seed("si_old", 41..=50).await;
        let alloc = allocator(store.clone(), buffer.clone());

        let seqs = alloc.malloc("si_old", 40).await.unwrap();
        // la tranche [41..50] n'est pas adjacente à 301: abandonnée
        assert_eq!(seqs[0], 301);
        assert_eq!(seqs.len(), 40);
        assert_dense(&seqs);
    }
}
