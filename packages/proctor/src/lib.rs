#![allow(clippy::uninlined_format_args)]
#![allow(clippy::type_complexity)]

pub mod args;
pub mod artifacts;
pub mod catalog;
pub mod config;
pub mod health;
pub mod http;
pub mod listener;
pub mod notify;
pub mod orchestrator; // where we have the high-level composition root
pub mod subsystems; // subsystems: registry, session, scheduler, collector, reaper

use std::sync::Arc;

use config::Config;
use health::SharedHealthStatus;
use orchestrator::Orchestrator;
use utils::context::AppContext;
use utils::telemetry::HttpMetrics;

/// Bring the whole control plane up: subsystem tasks on the shared
/// runtime, the agent stream listener, and the operational http
/// endpoints. Blocks until the kill signal stops both listeners, so the
/// binary and the end-to-end tests share one entry point.
pub fn run_server(
    ctx: AppContext,
    config: Config,
    orchestrator: Arc<Orchestrator>,
    metrics: HttpMetrics,
    health_status: SharedHealthStatus,
) {
    // ctrl-c feeds the same kill signal tests trigger via ctx.kill()
    let _ = ctrlc::set_handler({
        let ctx = ctx.clone();
        move || {
            ctx.kill();
        }
    });

    orchestrator.start(ctx.clone());

    // each listener owns an OS thread and parks on the runtime from there;
    // both unwind once the kill signal fires
    let mut listeners = Vec::new();

    listeners.push(std::thread::spawn({
        let ctx = ctx.clone();
        let config = config.clone();
        let orchestrator = orchestrator.clone();
        let health_status = health_status.clone();
        move || {
            listener::start(ctx, config, orchestrator, health_status).unwrap();
        }
    }));

    listeners.push(std::thread::spawn(move || {
        http::server::start(ctx, config, orchestrator, metrics, health_status).unwrap();
    }));

    for handle in listeners {
        handle.join().unwrap();
    }
}

/// Install a bare fmt subscriber for tests and benches. The config-driven
/// setup is no good there: parallel tests rewrite config sources under
/// each other, and a process can only ever hold one global subscriber —
/// so install it once and let every later call fall through.
pub fn init_tracing_tests() {
    static INIT: std::sync::Once = std::sync::Once::new();

    INIT.call_once(|| {
        tracing_subscriber::fmt::init();
    });
}
