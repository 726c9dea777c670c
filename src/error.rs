//! # Gestion d'erreurs unifiée pour Courier Server
//!
//! Ce module fournit un système d'erreurs cohérent avec:
//! - Catégorisation des erreurs par domaine (validation, stores, pipeline)
//! - Distinction des erreurs transitoires (réessayables) et contractuelles
//! - Conversion depuis les erreurs des dépendances externes

use std::fmt;
use thiserror::Error;

/// Type alias pour Result avec notre erreur personnalisée
pub type Result<T> = std::result::Result<T, CourierError>;

/// Erreurs principales du cœur de messagerie
#[derive(Error, Debug)]
pub enum CourierError {
    // ═══════════════════════════════════════════════════════════════════════
    // ERREURS DE VALIDATION
    // ═══════════════════════════════════════════════════════════════════════

    /// Argument invalide (taille nulle, identifiants vides ou dupliqués)
    #[error("Argument invalide: {reason}")]
    InvalidArgument { reason: String },

    /// Ressource non trouvée là où elle est requise
    #[error("{resource} non trouvé(e): {id}")]
    NotFound { resource: String, id: String },

    /// Violation de monotonie ou conflit d'écriture
    #[error("Conflit: {reason}")]
    Conflict { reason: String },

    // ═══════════════════════════════════════════════════════════════════════
    // ERREURS DES DÉPENDANCES EXTERNES (TRANSITOIRES)
    // ═══════════════════════════════════════════════════════════════════════

    /// Erreur du cache distribué
    #[error("Erreur cache: {operation}")]
    Cache {
        operation: String,
        #[source]
        source: redis::RedisError,
    },

    /// Erreur de base de données
    #[error("Erreur base de données: {operation}")]
    Database {
        operation: String,
        #[source]
        source: sqlx::Error,
    },

    /// Erreur du bus de messages
    #[error("Erreur Kafka: {operation}")]
    Queue {
        operation: String,
        #[source]
        source: rdkafka::error::KafkaError,
    },

    /// Erreur de sérialisation JSON
    #[error("Erreur de sérialisation {operation}: {source}")]
    Serialization {
        operation: String,
        #[source]
        source: serde_json::Error,
    },

    // ═══════════════════════════════════════════════════════════════════════
    // ERREURS SYSTÈME ET CONFIGURATION
    // ═══════════════════════════════════════════════════════════════════════

    /// Erreur de configuration
    #[error("Erreur configuration: {message}")]
    Configuration { message: String },

    /// Timeout lors de l'arrêt du serveur
    #[error("Timeout lors de l'arrêt du serveur")]
    ShutdownTimeout,

    /// Erreur interne (épuisement des tentatives, contrat violé)
    #[error("Erreur interne: {message}")]
    Internal { message: String },
}

/// Catégories d'erreurs exposées aux appelants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidArgument,
    NotFound,
    Conflict,
    Unavailable,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument => write!(f, "INVALID_ARGUMENT"),
            Self::NotFound => write!(f, "NOT_FOUND"),
            Self::Conflict => write!(f, "CONFLICT"),
            Self::Unavailable => write!(f, "UNAVAILABLE"),
            Self::Internal => write!(f, "INTERNAL"),
        }
    }
}

impl CourierError {
    /// Retourne la catégorie de l'erreur
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::Cache { .. } | Self::Database { .. } | Self::Queue { .. } => {
                ErrorKind::Unavailable
            }
            Self::Serialization { .. }
            | Self::Configuration { .. }
            | Self::ShutdownTimeout
            | Self::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Retourne true si l'opération peut être retentée
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Unavailable
    }

    /// Crée une erreur d'argument invalide
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// Crée une erreur de ressource non trouvée
    pub fn not_found(resource: &str, id: &str) -> Self {
        Self::NotFound {
            resource: resource.to_string(),
            id: id.to_string(),
        }
    }

    /// Crée une erreur de conflit
    pub fn conflict(reason: impl Into<String>) -> Self {
        Self::Conflict {
            reason: reason.into(),
        }
    }

    /// Crée une erreur de cache avec contexte
    pub fn cache_error(operation: &str, source: redis::RedisError) -> Self {
        Self::Cache {
            operation: operation.to_string(),
            source,
        }
    }

    /// Crée une erreur de base de données avec contexte
    pub fn database_error(operation: &str, source: sqlx::Error) -> Self {
        Self::Database {
            operation: operation.to_string(),
            source,
        }
    }

    /// Crée une erreur Kafka avec contexte
    pub fn queue_error(operation: &str, source: rdkafka::error::KafkaError) -> Self {
        Self::Queue {
            operation: operation.to_string(),
            source,
        }
    }

    /// Crée une erreur de sérialisation avec contexte
    pub fn serialization_error(operation: &str, source: serde_json::Error) -> Self {
        Self::Serialization {
            operation: operation.to_string(),
            source,
        }
    }

    /// Helper pour les erreurs de configuration
    pub fn configuration_error(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Helper pour les erreurs internes
    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

/// Implémentations de conversion depuis des erreurs externes
impl From<redis::RedisError> for CourierError {
    fn from(err: redis::RedisError) -> Self {
        Self::cache_error("command", err)
    }
}

impl From<sqlx::Error> for CourierError {
    fn from(err: sqlx::Error) -> Self {
        Self::database_error("query", err)
    }
}

impl From<rdkafka::error::KafkaError> for CourierError {
    fn from(err: rdkafka::error::KafkaError) -> Self {
        Self::queue_error("client", err)
    }
}

impl From<serde_json::Error> for CourierError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization_error("json", err)
    }
}

impl From<config::ConfigError> for CourierError {
    fn from(err: config::ConfigError) -> Self {
        Self::Configuration {
            message: err.to_string(),
        }
    }
}
