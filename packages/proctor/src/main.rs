use std::sync::Arc;

use clap::Parser;
use opentelemetry::global;
use proctor::args::CliArgs;
use proctor::artifacts::MemoryArtifactStore;
use proctor::catalog::{CachedCatalog, StaticCatalog};
use proctor::config::{Config, ConfigBuilder};
use proctor::health::create_shared_health_status;
use proctor::notify::BufferedNotifier;
use proctor::orchestrator::{ExternalDeps, Orchestrator};
use proctor::subsystems::collector::NullLogFanout;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utils::context::AppContext;
use utils::storage::memory::MemoryRepository;
use utils::storage::retry::RetryingRepository;
use utils::telemetry::{setup_metrics, setup_tracing, Metrics};

const NOTIFIER_BUFFER: usize = 256;
const CATALOG_CACHE_SIZE: usize = 128;

fn main() {
    let args = CliArgs::parse();
    let config: Config = ConfigBuilder::new(args).build().unwrap();

    let ctx = AppContext::new();

    // setup tracing
    let filters = config.tracing_env_filter().unwrap();
    let tracer_provider = if let Some(collector) = config.jaeger.as_ref() {
        Some(ctx.rt.block_on({
            let config = config.clone();
            async move { setup_tracing(collector, "proctor", config.tracing_env_filter().unwrap()) }
        }))
    } else {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .without_time()
                    .with_target(false),
            )
            .with(filters)
            .try_init()
            .unwrap();
        None
    };

    let meter_provider = config
        .prometheus
        .as_ref()
        .map(|collector| setup_metrics(collector, "proctor_metrics"));
    let meter = global::meter("proctor_metrics");
    let metrics = Metrics::init(&meter);

    // the minimal single-process deployment wires the in-memory
    // collaborators; production wires the real repository, manifest
    // resolver, object storage and notification channels here instead
    let (notifier, mut notifications) = BufferedNotifier::new(NOTIFIER_BUFFER);
    ctx.rt.spawn(async move {
        while let Some(event) = notifications.recv().await {
            tracing::info!("Notification: {:?}", event);
        }
    });

    let deps = ExternalDeps {
        repo: Arc::new(RetryingRepository::new(Arc::new(MemoryRepository::new()))),
        catalog: Arc::new(CachedCatalog::new(StaticCatalog::new(), CATALOG_CACHE_SIZE)),
        artifacts: Arc::new(MemoryArtifactStore::new()),
        notifier: Arc::new(notifier),
        log_fanout: Arc::new(NullLogFanout),
    };

    let orchestrator = Arc::new(Orchestrator::new(&config, deps, metrics.core));
    let health_status = create_shared_health_status();

    proctor::run_server(ctx, config, orchestrator, metrics.http, health_status);

    if let Some(tracer) = tracer_provider {
        let _ = tracer.shutdown();
    }
    if let Some(meter) = meter_provider {
        let _ = meter.shutdown();
    }
}
