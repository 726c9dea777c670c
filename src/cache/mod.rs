//! Caches du serveur: clés partagées, cache chaud des messages et shim
//! local en processus.

pub mod keys;
pub mod local_cache;
pub mod message_cache;

pub use local_cache::{LocalCache, LocalCacheOptions};
pub use message_cache::MessageCache;
