//! # Courier Server - Bibliothèque principale
//!
//! Cœur d'ingestion, de séquencement et de persistance de messages:
//! - allocateur de séquences par conversation (cache distribué devant le
//!   compteur faisant autorité)
//! - pipeline de transfert (ingestion → cache chaud → push + archivage)
//! - journal de modifications versionné pour la synchronisation
//!   incrémentale des clients

// ═══════════════════════════════════════════════════════════════════════
// MODULES
// ═══════════════════════════════════════════════════════════════════════

/// Gestion des erreurs du serveur
pub mod error;

/// Configuration du serveur
pub mod config;

/// Modèles de messages partagés
pub mod model;

/// Caches: clés, journal chaud, shim local
pub mod cache;

/// Séquencement par conversation
pub mod sequence;

/// Stores durables
pub mod storage;

/// Pipeline de transfert
pub mod transfer;

// ═══════════════════════════════════════════════════════════════════════
// RE-EXPORTS PUBLICS
// ═══════════════════════════════════════════════════════════════════════

pub use config::ServerConfig;
pub use error::{CourierError, ErrorKind, Result};
pub use model::{ContentType, MsgOptions, MsgRecord};
