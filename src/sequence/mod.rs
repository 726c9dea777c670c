//! Séquencement des messages par conversation.
//!
//! `store` porte le compteur faisant autorité; `allocator` le front
//! distribué qui amortit les allers-retours et sérialise les remplissages.

pub mod allocator;
pub mod store;

pub use allocator::{RedisSeqBuffer, SeqAllocator, SeqBuffer};
pub use store::{PgSeqStore, SeqRecord, SeqStore};
