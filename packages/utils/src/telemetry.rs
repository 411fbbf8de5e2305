use opentelemetry::{global, metrics::Meter, trace::TracerProvider as _};
use opentelemetry_otlp::{Protocol, SpanExporter, WithExportConfig};
use opentelemetry_sdk::{
    metrics::SdkMeterProvider,
    resource::Resource,
    trace::{self, Sampler, SdkTracerProvider},
};
use tracing_subscriber::layer::SubscriberExt;

pub fn setup_tracing(
    collector: &str,
    service_name: &str,
    filters: tracing_subscriber::EnvFilter,
) -> SdkTracerProvider {
    let endpoint = format!("{}/v1/traces", collector);
    let exporter = SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .expect("Failed to build OTLP exporter");

    let batch_processor = trace::BatchSpanProcessor::builder(exporter).build();

    let provider = SdkTracerProvider::builder()
        .with_span_processor(batch_processor)
        .with_sampler(Sampler::AlwaysOn)
        .with_resource(
            Resource::builder()
                .with_service_name(service_name.to_owned())
                .build(),
        )
        .build();
    global::set_tracer_provider(provider.clone());
    let tracer = provider.tracer(format!("{}-tracer", service_name));
    let telemetry = tracing_opentelemetry::layer().with_tracer(tracer);

    let subscriber = tracing_subscriber::Registry::default()
        .with(filters)
        .with(tracing_subscriber::fmt::layer()) // console logging layer
        .with(telemetry);

    tracing::subscriber::set_global_default(subscriber)
        .expect("Failed to set global default subscriber");

    tracing::info!("OTLP tracing enabled");
    provider
}

pub fn setup_metrics(collector: &str, service_name: &str) -> SdkMeterProvider {
    let endpoint = format!("{}/api/v1/otlp/v1/metrics", collector);

    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_endpoint(endpoint)
        .build()
        .expect("Failed to build OTLP exporter!");

    let meter_provider = SdkMeterProvider::builder()
        .with_resource(
            Resource::builder()
                .with_service_name(service_name.to_owned())
                .build(),
        )
        .with_periodic_exporter(exporter)
        .build();

    global::set_meter_provider(meter_provider.clone());

    tracing::info!("Metrics enabled and exporting to {}", collector);

    meter_provider
}

use opentelemetry::metrics::{Counter, Gauge, UpDownCounter};

pub struct Metrics {
    pub http: HttpMetrics,
    pub core: CoreMetrics,
}

impl Metrics {
    pub fn init(meter: &Meter) -> Self {
        Self {
            http: HttpMetrics::init(meter),
            core: CoreMetrics::init(meter),
        }
    }
}

#[derive(Clone, Debug)]
pub struct HttpMetrics {
    pub requests: Counter<u64>,
}

impl HttpMetrics {
    pub const LABEL: &'static str = "http";

    pub fn init(meter: &Meter) -> Self {
        HttpMetrics {
            requests: meter
                .u64_counter(format!("{}_requests", Self::LABEL))
                .with_description("Total operational http requests served")
                .build(),
        }
    }

    pub fn increment_requests(&self) {
        self.requests.add(1, &[]);
    }
}

#[derive(Clone, Debug)]
pub struct CoreMetrics {
    pub registry: RegistryMetrics,
    pub session: SessionMetrics,
    pub scheduler: SchedulerMetrics,
    pub collector: CollectorMetrics,
    pub reaper: ReaperMetrics,
}

impl CoreMetrics {
    pub fn init(meter: &Meter) -> Self {
        Self {
            registry: RegistryMetrics::init(meter),
            session: SessionMetrics::init(meter),
            scheduler: SchedulerMetrics::init(meter),
            collector: CollectorMetrics::init(meter),
            reaper: ReaperMetrics::init(meter),
        }
    }
}

#[derive(Clone, Debug)]
pub struct RegistryMetrics {
    pub connected_agents: UpDownCounter<i64>,
    pub registrations: Counter<u64>,
    pub heartbeats: Counter<u64>,
    pub claim_conflicts: Counter<u64>,
}

impl RegistryMetrics {
    pub const LABEL: &'static str = "registry";

    pub fn init(meter: &Meter) -> Self {
        Self {
            connected_agents: meter
                .i64_up_down_counter(format!("{}_connected_agents", Self::LABEL))
                .with_description("Agents currently registered and not offline")
                .build(),
            registrations: meter
                .u64_counter(format!("{}_registrations", Self::LABEL))
                .with_description("Total accepted agent registrations")
                .build(),
            heartbeats: meter
                .u64_counter(format!("{}_heartbeats", Self::LABEL))
                .with_description("Total heartbeats processed")
                .build(),
            claim_conflicts: meter
                .u64_counter(format!("{}_claim_conflicts", Self::LABEL))
                .with_description("Claims refused for capacity or eligibility")
                .build(),
        }
    }

    pub fn increment_registrations(&self) {
        self.registrations.add(1, &[]);
    }

    pub fn increment_heartbeats(&self) {
        self.heartbeats.add(1, &[]);
    }

    pub fn increment_claim_conflicts(&self) {
        self.claim_conflicts.add(1, &[]);
    }
}

#[derive(Clone, Debug)]
pub struct SessionMetrics {
    pub open_sessions: UpDownCounter<i64>,
    pub messages_in: Counter<u64>,
    pub messages_out: Counter<u64>,
    pub backpressure_closes: Counter<u64>,
    pub protocol_violations: Counter<u64>,
}

impl SessionMetrics {
    pub const LABEL: &'static str = "session";

    pub fn init(meter: &Meter) -> Self {
        Self {
            open_sessions: meter
                .i64_up_down_counter(format!("{}_open", Self::LABEL))
                .with_description("Currently open agent sessions")
                .build(),
            messages_in: meter
                .u64_counter(format!("{}_messages_in", Self::LABEL))
                .with_description("Frames received from agents")
                .build(),
            messages_out: meter
                .u64_counter(format!("{}_messages_out", Self::LABEL))
                .with_description("Frames written to agents")
                .build(),
            backpressure_closes: meter
                .u64_counter(format!("{}_backpressure_closes", Self::LABEL))
                .with_description("Sessions closed because the outbound queue overflowed")
                .build(),
            protocol_violations: meter
                .u64_counter(format!("{}_protocol_violations", Self::LABEL))
                .with_description("Inbound messages dropped as protocol violations")
                .build(),
        }
    }

    pub fn increment_messages_in(&self) {
        self.messages_in.add(1, &[]);
    }

    pub fn increment_messages_out(&self) {
        self.messages_out.add(1, &[]);
    }

    pub fn increment_backpressure_closes(&self) {
        self.backpressure_closes.add(1, &[]);
    }

    pub fn increment_protocol_violations(&self) {
        self.protocol_violations.add(1, &[]);
    }
}

#[derive(Clone, Debug)]
pub struct SchedulerMetrics {
    pub dispatched: Counter<u64>,
    pub rejected: Counter<u64>,
    pub passes: Counter<u64>,
    pub pending_runs: Gauge<u64>,
}

impl SchedulerMetrics {
    pub const LABEL: &'static str = "scheduler";

    pub fn init(meter: &Meter) -> Self {
        Self {
            dispatched: meter
                .u64_counter(format!("{}_dispatched", Self::LABEL))
                .with_description("Runs committed to an agent")
                .build(),
            rejected: meter
                .u64_counter(format!("{}_rejected", Self::LABEL))
                .with_description("Dispatches the agent rejected")
                .build(),
            passes: meter
                .u64_counter(format!("{}_passes", Self::LABEL))
                .with_description("Scheduling passes executed")
                .build(),
            pending_runs: meter
                .u64_gauge(format!("{}_pending_runs", Self::LABEL))
                .with_description("Pending runs at the last pass")
                .build(),
        }
    }

    pub fn increment_dispatched(&self) {
        self.dispatched.add(1, &[]);
    }

    pub fn increment_rejected(&self) {
        self.rejected.add(1, &[]);
    }

    pub fn record_pass(&self, pending: u64) {
        self.passes.add(1, &[]);
        self.pending_runs.record(pending, &[]);
    }
}

#[derive(Clone, Debug)]
pub struct CollectorMetrics {
    pub results_persisted: Counter<u64>,
    pub duplicates_dropped: Counter<u64>,
    pub parse_failures: Counter<u64>,
    pub artifacts_recorded: Counter<u64>,
    pub runs_finalized: Counter<u64>,
}

impl CollectorMetrics {
    pub const LABEL: &'static str = "collector";

    pub fn init(meter: &Meter) -> Self {
        Self {
            results_persisted: meter
                .u64_counter(format!("{}_results_persisted", Self::LABEL))
                .with_description("Normalized test result rows written")
                .build(),
            duplicates_dropped: meter
                .u64_counter(format!("{}_duplicates_dropped", Self::LABEL))
                .with_description("Re-delivered result rows discarded")
                .build(),
            parse_failures: meter
                .u64_counter(format!("{}_parse_failures", Self::LABEL))
                .with_description("Result payloads that failed normalization")
                .build(),
            artifacts_recorded: meter
                .u64_counter(format!("{}_artifacts_recorded", Self::LABEL))
                .with_description("Artifact references persisted")
                .build(),
            runs_finalized: meter
                .u64_counter(format!("{}_runs_finalized", Self::LABEL))
                .with_description("Runs driven to a terminal status")
                .build(),
        }
    }

    pub fn increment_results_persisted(&self) {
        self.results_persisted.add(1, &[]);
    }

    pub fn increment_duplicates_dropped(&self) {
        self.duplicates_dropped.add(1, &[]);
    }

    pub fn increment_parse_failures(&self) {
        self.parse_failures.add(1, &[]);
    }

    pub fn increment_artifacts_recorded(&self) {
        self.artifacts_recorded.add(1, &[]);
    }

    pub fn increment_runs_finalized(&self) {
        self.runs_finalized.add(1, &[]);
    }
}

#[derive(Clone, Debug)]
pub struct ReaperMetrics {
    pub agents_reaped: Counter<u64>,
    pub runs_requeued: Counter<u64>,
    pub runs_failed: Counter<u64>,
    pub runs_timed_out: Counter<u64>,
}

impl ReaperMetrics {
    pub const LABEL: &'static str = "reaper";

    pub fn init(meter: &Meter) -> Self {
        Self {
            agents_reaped: meter
                .u64_counter(format!("{}_agents_reaped", Self::LABEL))
                .with_description("Agents marked offline for missed heartbeats")
                .build(),
            runs_requeued: meter
                .u64_counter(format!("{}_runs_requeued", Self::LABEL))
                .with_description("Orphaned runs returned to the pending queue")
                .build(),
            runs_failed: meter
                .u64_counter(format!("{}_runs_failed", Self::LABEL))
                .with_description("Orphaned runs failed after exhausting requeues")
                .build(),
            runs_timed_out: meter
                .u64_counter(format!("{}_runs_timed_out", Self::LABEL))
                .with_description("Runs finalized for exceeding their deadline")
                .build(),
        }
    }

    pub fn increment_agents_reaped(&self) {
        self.agents_reaped.add(1, &[]);
    }

    pub fn increment_runs_requeued(&self) {
        self.runs_requeued.add(1, &[]);
    }

    pub fn increment_runs_failed(&self) {
        self.runs_failed.add(1, &[]);
    }

    pub fn increment_runs_timed_out(&self) {
        self.runs_timed_out.add(1, &[]);
    }
}

/// Metrics wired to a no-op meter, for tests and tools that don't export
pub fn noop_metrics() -> Metrics {
    let meter = opentelemetry::global::meter("proctor_noop");
    Metrics::init(&meter)
}
