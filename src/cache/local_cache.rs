//! # Cache local en processus
//!
//! Cache à slots hachés avec TTL par entrée. Les chargements réussis et
//! échoués portent des TTL distincts: un amont en panne n'empoisonne pas
//! le cache et ne déclenche pas de ruée au rechargement. Les suppressions
//! passent par des hooks d'invalidation et un canal de diffusion pour que
//! les processus pairs abandonnent les mêmes clés.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::config::CacheSettings;
use crate::error::CourierError;

/// Erreur partagée entre le cache et ses appelants
pub type SharedError = Arc<CourierError>;

/// Options du cache local
#[derive(Debug, Clone)]
pub struct LocalCacheOptions {
    slot_num: usize,
    slot_size: usize,
    success_ttl: Duration,
    failed_ttl: Duration,
}

impl Default for LocalCacheOptions {
    fn default() -> Self {
        Self {
            slot_num: 500,
            slot_size: 20_000,
            success_ttl: Duration::from_secs(60),
            failed_ttl: Duration::from_secs(5),
        }
    }
}

impl LocalCacheOptions {
    pub fn from_settings(settings: &CacheSettings) -> Self {
        Self {
            slot_num: settings.local_slot_num,
            slot_size: settings.local_slot_size,
            success_ttl: settings.local_success_ttl(),
            failed_ttl: settings.local_failed_ttl(),
        }
    }

    pub fn with_slot_num(mut self, slot_num: usize) -> Self {
        assert!(slot_num > 0, "slot_num doit être supérieur à 0");
        self.slot_num = slot_num;
        self
    }

    pub fn with_slot_size(mut self, slot_size: usize) -> Self {
        assert!(slot_size > 0, "slot_size doit être supérieur à 0");
        self.slot_size = slot_size;
        self
    }

    pub fn with_success_ttl(mut self, ttl: Duration) -> Self {
        self.success_ttl = ttl;
        self
    }

    pub fn with_failed_ttl(mut self, ttl: Duration) -> Self {
        self.failed_ttl = ttl;
        self
    }
}

/// Entrée de cache avec expiration
struct Entry<V> {
    value: Result<V, SharedError>,
    expires_at: Instant,
    last_accessed: Instant,
}

type Slot<V> = Mutex<HashMap<String, Entry<V>>>;
type DeleteHook = Box<dyn Fn(&str) + Send + Sync>;

/// Cache local à slots hachés
pub struct LocalCache<V> {
    slots: Vec<Slot<V>>,
    slot_size: usize,
    success_ttl: Duration,
    failed_ttl: Duration,
    delete_hooks: Vec<DeleteHook>,
    invalidations: broadcast::Sender<String>,
}

impl<V: Clone> LocalCache<V> {
    pub fn new(options: LocalCacheOptions) -> Self {
        let (invalidations, _) = broadcast::channel(1024);
        Self {
            slots: (0..options.slot_num)
                .map(|_| Mutex::new(HashMap::new()))
                .collect(),
            slot_size: options.slot_size,
            success_ttl: options.success_ttl,
            failed_ttl: options.failed_ttl,
            delete_hooks: Vec::new(),
            invalidations,
        }
    }

    /// Enregistre un hook exécuté avant chaque suppression (publication
    /// vers le canal externe, journalisation, ...)
    pub fn register_delete_hook(&mut self, hook: impl Fn(&str) + Send + Sync + 'static) {
        self.delete_hooks.push(Box::new(hook));
    }

    /// Abonnement au flux d'invalidations émises par ce processus
    pub fn subscribe_invalidations(&self) -> broadcast::Receiver<String> {
        self.invalidations.subscribe()
    }

    fn slot_for(&self, key: &str) -> &Slot<V> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.slots[(hasher.finish() as usize) % self.slots.len()]
    }

    fn lookup(&self, key: &str) -> Option<Result<V, SharedError>> {
        let mut slot = self.slot_for(key).lock();
        match slot.get_mut(key) {
            Some(entry) if entry.expires_at > Instant::now() => {
                entry.last_accessed = Instant::now();
                Some(entry.value.clone())
            }
            Some(_) => {
                slot.remove(key);
                None
            }
            None => None,
        }
    }

    fn store(&self, key: &str, value: Result<V, SharedError>) {
        let ttl = if value.is_ok() {
            self.success_ttl
        } else {
            self.failed_ttl
        };
        let now = Instant::now();
        let mut slot = self.slot_for(key).lock();
        slot.retain(|_, entry| entry.expires_at > now);
        if slot.len() >= self.slot_size {
            // éviction LRU quand le slot est plein
            if let Some(lru_key) = slot
                .iter()
                .min_by_key(|(_, entry)| entry.last_accessed)
                .map(|(key, _)| key.clone())
            {
                slot.remove(&lru_key);
            }
        }
        slot.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: now + ttl,
                last_accessed: now,
            },
        );
    }

    /// Lit la clé, en la chargeant via `loader` en cas d'absence. Un
    /// chargement échoué est mémorisé avec le TTL court.
    pub async fn get<F, Fut>(&self, key: &str, loader: F) -> Result<V, SharedError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = crate::error::Result<V>>,
    {
        if let Some(cached) = self.lookup(key) {
            return cached;
        }
        let loaded = loader().await.map_err(Arc::new);
        self.store(key, loaded.clone());
        loaded
    }

    /// Supprime les clés localement, déclenche les hooks et diffuse
    /// l'invalidation aux abonnés
    pub fn del(&self, keys: &[&str]) {
        for key in keys {
            for hook in &self.delete_hooks {
                hook(key);
            }
            self.remove_entry(key);
            let _ = self.invalidations.send((*key).to_string());
        }
    }

    /// Supprime les clés localement sans re-déclencher les hooks
    /// (application d'une invalidation reçue d'un pair)
    pub fn local_del(&self, keys: &[&str]) {
        for key in keys {
            self.remove_entry(key);
        }
    }

    fn remove_entry(&self, key: &str) {
        let mut slot = self.slot_for(key).lock();
        slot.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn small_cache(success_ttl: Duration, failed_ttl: Duration) -> LocalCache<String> {
        LocalCache::new(
            LocalCacheOptions::default()
                .with_slot_num(4)
                .with_slot_size(8)
                .with_success_ttl(success_ttl)
                .with_failed_ttl(failed_ttl),
        )
    }

    #[tokio::test]
    async fn test_hit_avoids_reload() {
        let cache = small_cache(Duration::from_secs(60), Duration::from_secs(5));
        let loads = AtomicUsize::new(0);

        for _ in 0..3 {
            let value = cache
                .get("k1", || async {
                    loads.fetch_add(1, Ordering::SeqCst);
                    Ok("v1".to_string())
                })
                .await
                .unwrap();
            assert_eq!(value, "v1");
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_load_cached_with_short_ttl() {
        let cache = small_cache(Duration::from_secs(60), Duration::from_millis(30));
        let loads = AtomicUsize::new(0);

        let load = || async {
            loads.fetch_add(1, Ordering::SeqCst);
            Err::<String, _>(CourierError::internal_error("amont indisponible"))
        };
        assert!(cache.get("k1", load).await.is_err());
        // l'échec est servi depuis le cache pendant le TTL court
        assert!(cache.get("k1", load).await.is_err());
        assert_eq!(loads.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(cache.get("k1", load).await.is_err());
        assert_eq!(loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_expiry_reloads() {
        let cache = small_cache(Duration::from_millis(30), Duration::from_millis(5));
        let loads = AtomicUsize::new(0);
        let load = || async {
            loads.fetch_add(1, Ordering::SeqCst);
            Ok("v".to_string())
        };
        cache.get("k1", load).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        cache.get("k1", load).await.unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_lru_eviction_when_slot_full() {
        let cache = LocalCache::new(
            LocalCacheOptions::default()
                .with_slot_num(1)
                .with_slot_size(2)
                .with_success_ttl(Duration::from_secs(60)),
        );
        cache.get("a", || async { Ok(1) }).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        cache.get("b", || async { Ok(2) }).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        // touche "a" pour que "b" devienne le moins récemment utilisé
        cache.get("a", || async { Ok(10) }).await.unwrap();
        cache.get("c", || async { Ok(3) }).await.unwrap();

        assert!(cache.lookup("a").is_some());
        assert!(cache.lookup("b").is_none(), "b doit avoir été évincé");
        assert!(cache.lookup("c").is_some());
    }

    #[tokio::test]
    async fn test_del_fires_hooks_and_broadcasts() {
        let mut cache = small_cache(Duration::from_secs(60), Duration::from_secs(5));
        let fired = Arc::new(AtomicUsize::new(0));
        let hook_fired = fired.clone();
        cache.register_delete_hook(move |_key| {
            hook_fired.fetch_add(1, Ordering::SeqCst);
        });
        let mut invalidations = cache.subscribe_invalidations();

        cache.get("k1", || async { Ok("v".to_string()) }).await.unwrap();
        cache.del(&["k1"]);

        assert!(cache.lookup("k1").is_none());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(invalidations.try_recv().unwrap(), "k1");
    }

    #[tokio::test]
    async fn test_local_del_skips_hooks() {
        let mut cache = small_cache(Duration::from_secs(60), Duration::from_secs(5));
        let fired = Arc::new(AtomicUsize::new(0));
        let hook_fired = fired.clone();
        cache.register_delete_hook(move |_key| {
            hook_fired.fetch_add(1, Ordering::SeqCst);
        });

        cache.get("k1", || async { Ok("v".to_string()) }).await.unwrap();
        cache.local_del(&["k1"]);

        assert!(cache.lookup("k1").is_none());
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
