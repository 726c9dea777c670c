//! Pipeline de transfert: groupes de consommateurs, producteur de topics,
//! ingestion et persistance.

pub mod handler;
pub mod ingest;
pub mod persist;
pub mod producer;

pub use handler::{BatchHandler, ConsumerGroup};
pub use ingest::IngestHandler;
pub use persist::PersistHandler;
pub use producer::TopicProducer;
