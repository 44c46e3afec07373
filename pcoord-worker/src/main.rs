//! Demo binary: wires an `EventProcessor` against the in-memory reference
//! checkpoint store and transport, and serves health/metrics alongside it.
use std::future::ready;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use envconfig::Envconfig;

use health::HealthRegistry;
use pcoord_common::metrics::{serve, setup_metrics_router};
use pcoord_common::model::UserStart;
use pcoord_common::transport::PartitionProcessor;
use pcoord_core::{EventProcessor, FairLoadBalancer, Target};
use pcoord_memstore::{FakeTransport, InMemoryCheckpointStore};
use pcoord_worker::config::Config;
use pcoord_worker::error::WorkerError;
use pcoord_worker::processor::LoggingProcessor;

#[tokio::main]
async fn main() -> Result<(), WorkerError> {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("Invalid configuration:");

    let liveness = HealthRegistry::new("liveness");
    let worker_liveness = liveness
        .register("processor".to_string(), time::Duration::seconds(60))
        .await;

    let partition_ids = (0..config.partition_count).map(|i| i.to_string()).collect();
    let transport = Arc::new(FakeTransport::new(
        &config.fully_qualified_namespace,
        config.event_hub_name.as_str(),
        partition_ids,
        i64::MAX,
    ));
    let store = Arc::new(InMemoryCheckpointStore::new());
    let handler = Arc::new(LoggingProcessor::new(worker_liveness))
        as Arc<dyn PartitionProcessor>;

    let processor = Arc::new(EventProcessor::new(
        config.owner_id.clone(),
        config.consumer_group.as_str().to_owned(),
        transport,
        store,
        handler,
        Target::Balanced(Arc::new(FairLoadBalancer)),
        UserStart::default(),
        config.loop_interval.0,
        config.inactive_time_limit.0.as_millis() as i64,
    ));

    processor.start().await;

    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || ready(liveness.get_status())));
    let router = router.merge(setup_metrics_router());
    let bind = config.bind();
    let metrics_server = tokio::task::spawn(async move {
        serve(router, &bind).await.expect("failed to start serving metrics");
    });

    tokio::signal::ctrl_c().await.expect("failed to listen for ctrl-c");
    tracing::info!("shutting down");
    processor.stop().await;
    metrics_server.abort();

    Ok(())
}

pub async fn index() -> &'static str {
    "pcoord worker"
}
