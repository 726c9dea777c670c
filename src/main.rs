//! Serveur de transfert de messages Courier
//!
//! Draine le topic d'ingestion vers le cache chaud et les topics de
//! sortie, puis le topic de persistance vers le store durable. L'arrêt
//! est coopératif: sur signal, les consommateurs cessent de drainer,
//! terminent les batches en vol et committent les offsets sûrs dans la
//! fenêtre impartie.

use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use courier_server::cache::MessageCache;
use courier_server::config::ServerConfig;
use courier_server::error::{CourierError, Result};
use courier_server::sequence::{PgSeqStore, RedisSeqBuffer, SeqAllocator};
use courier_server::storage::MessageStore;
use courier_server::transfer::{ConsumerGroup, IngestHandler, PersistHandler, TopicProducer};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let config = ServerConfig::from_env()?;
    init_tracing(&config);

    info!(
        environment = %config.server.environment,
        brokers = %config.kafka.brokers,
        "🚀 Démarrage du serveur de transfert Courier"
    );

    if config.metrics.enable {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(([0, 0, 0, 0], config.metrics.port))
            .install()
            .map_err(|e| {
                CourierError::configuration_error(format!("exporteur Prometheus: {e}"))
            })?;
        info!(port = config.metrics.port, "exporteur Prometheus démarré");
    }

    // Connexions cache et base durable
    let redis_client = redis::Client::open(config.redis.url.as_str())
        .map_err(|e| CourierError::cache_error("open redis", e))?;
    let redis_conn = redis_client
        .get_connection_manager()
        .await
        .map_err(|e| CourierError::cache_error("connect redis", e))?;
    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect(&config.database.url)
        .await
        .map_err(|e| CourierError::database_error("connect postgres", e))?;
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .map_err(|e| CourierError::internal_error(format!("migrations: {e}")))?;

    // Graphe de construction: les composants reçoivent leurs dépendances
    // en paramètre, aucun singleton global
    let seq_store = Arc::new(PgSeqStore::new(pool.clone()));
    let seq_buffer = Arc::new(RedisSeqBuffer::new(redis_conn.clone(), &config.cache));
    let allocator = Arc::new(SeqAllocator::new(seq_store, seq_buffer, &config.cache));
    let message_cache = Arc::new(MessageCache::new(redis_conn, &config.cache));
    let message_store = Arc::new(MessageStore::new(pool));
    let producer = Arc::new(TopicProducer::new(&config.kafka, &config.transfer)?);

    let ingest_handler = IngestHandler::new(
        allocator,
        message_cache.clone(),
        producer,
        &config.kafka,
    );
    let ingest_group = ConsumerGroup::new(
        &config.kafka,
        &config.kafka.ingest_group_id,
        &config.kafka.ingest_topic,
        config.transfer.ingest_batch_size,
        config.transfer.ingest_batch_wait(),
    )?;

    let persist_handler = PersistHandler::new(message_store, message_cache);
    let persist_group = ConsumerGroup::new(
        &config.kafka,
        &config.kafka.persist_group_id,
        &config.kafka.persist_topic,
        config.transfer.persist_batch_size,
        config.transfer.persist_flush_interval(),
    )?;

    let cancel = CancellationToken::new();
    let mut workers = JoinSet::new();
    workers.spawn({
        let cancel = cancel.clone();
        async move { ingest_group.run(&ingest_handler, cancel).await }
    });
    workers.spawn({
        let cancel = cancel.clone();
        async move { persist_group.run(&persist_handler, cancel).await }
    });

    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| CourierError::internal_error(format!("installation SIGTERM: {e}")))?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("SIGINT reçu, arrêt en cours"),
        _ = sigterm.recv() => info!("SIGTERM reçu, arrêt en cours"),
        Some(finished) = workers.join_next() => match finished {
            Ok(Ok(())) => warn!("un consommateur s'est arrêté prématurément"),
            Ok(Err(err)) => error!(error = %err, "consommateur en échec, arrêt du serveur"),
            Err(err) => error!(error = %err, "tâche de consommation interrompue"),
        },
    }

    // Drain des batches en vol dans la fenêtre impartie
    cancel.cancel();
    let drained = tokio::time::timeout(config.server.shutdown_timeout(), async {
        while let Some(finished) = workers.join_next().await {
            if let Ok(Err(err)) = finished {
                warn!(error = %err, "consommateur terminé en erreur pendant le drain");
            }
        }
    })
    .await;
    if drained.is_err() {
        error!("le drain n'a pas terminé à temps, sortie forcée");
        return Err(CourierError::ShutdownTimeout);
    }

    info!("arrêt propre terminé");
    Ok(())
}

fn init_tracing(config: &ServerConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));
    if config.logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
