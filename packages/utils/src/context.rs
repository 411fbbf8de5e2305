use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::runtime::Runtime;

/// Process-wide runtime handle plus the shutdown signal, passed to every
/// subsystem's start(). Cloning is cheap; all clones observe the same
/// runtime and the same kill state.
#[derive(Clone)]
pub struct AppContext {
    /// The one multi-thread runtime all subsystem tasks run on
    pub rt: Arc<Runtime>,
    kill_tx: tokio::sync::broadcast::Sender<()>,
    killed: Arc<AtomicBool>,
}

impl AppContext {
    pub fn new() -> Self {
        // four workers cover the control plane's task mix (sessions,
        // scheduler, collector shards, reaper); benches and embedders
        // that fan out harder size the pool themselves
        Self::with_worker_threads(4)
    }

    pub fn with_worker_threads(worker_threads: usize) -> Self {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(worker_threads)
            .enable_all()
            .build()
            .expect("runtime construction failed");

        let (kill_tx, _) = tokio::sync::broadcast::channel(1);

        Self {
            rt: Arc::new(rt),
            kill_tx,
            killed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Subscribe to the shutdown signal. Long-lived tasks keep one of
    /// these in their select loop and wind down when it fires.
    pub fn get_kill_receiver(&self) -> tokio::sync::broadcast::Receiver<()> {
        self.kill_tx.subscribe()
    }

    /// Fire the shutdown signal. The binary wires this to ctrl-c; tests
    /// call it directly. Calling it again, or before anything subscribed,
    /// is harmless — the flag flips either way.
    pub fn kill(&self) {
        self.killed.store(true, Ordering::SeqCst);
        let _ = self.kill_tx.send(());
    }

    pub fn killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }
}

impl Default for AppContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kill_wakes_every_subscriber() {
        let ctx = AppContext::with_worker_threads(1);
        let mut first = ctx.get_kill_receiver();
        let mut second = ctx.get_kill_receiver();

        ctx.kill();

        ctx.rt.clone().block_on(async move {
            first.recv().await.unwrap();
            second.recv().await.unwrap();
        });
    }

    #[test]
    fn kill_without_subscribers_still_flips_the_flag() {
        let ctx = AppContext::with_worker_threads(1);
        assert!(!ctx.killed());

        // nothing is listening yet; this must not panic
        ctx.kill();
        ctx.kill();

        assert!(ctx.killed());
    }

    #[test]
    fn signal_is_buffered_for_existing_subscribers() {
        let ctx = AppContext::with_worker_threads(1);
        let mut receiver = ctx.get_kill_receiver();
        ctx.kill();

        // the receiver existed when the signal fired, so a read that
        // happens afterwards still sees it
        ctx.rt.clone().block_on(async move {
            receiver.recv().await.unwrap();
        });
    }
}
