//! Deadline enforcement and orphan exhaustion, driven by explicit sweeps.

mod support;

use std::time::Duration;

use proctor::init_tracing_tests;
use proctor::subsystems::reaper::{LivenessReaper, ReaperTuning};
use proctor_types::{RunStatus, Timestamp};
use support::*;
use utils::storage::Repository;
use utils::telemetry::noop_metrics;

fn tight_reaper(app: &TestApp, tuning: ReaperTuning) -> LivenessReaper {
    LivenessReaper::new(
        app.repo.clone(),
        app.orchestrator.registry.clone(),
        app.orchestrator.sessions.clone(),
        app.notifier.clone(),
        app.orchestrator.scheduler_sender(),
        tuning,
        noop_metrics().core.reaper,
    )
}

#[test]
fn deadline_breach_cancels_then_times_out() {
    init_tracing_tests();
    let app = TestApp::new();

    app.ctx.rt.clone().block_on(async {
        let service = app
            .seed_service("svc-slow", &["zone-a"], vec![spec("suite")])
            .await;

        let mut agent = MockAgent::connect(&app, "a1", &["zone-a"], 1).await;
        let run_id = app.submit(&service, 0).await;
        let work = agent.expect_assign().await;
        agent.accept(&work.run_id).await;
        wait_for("run to start", RECV_TIMEOUT, || async {
            run_field(&app.repo, &run_id, |r| r.status == RunStatus::Running).await
        })
        .await;

        // shrink the recorded deadline to the past; the scheduler computed
        // a generous one at dispatch
        {
            let run = app.repo.get_run(&run_id).await.unwrap().unwrap();
            let agent_id = run.agent_id.clone().unwrap();
            app.repo.requeue_run(&run_id, 0).await.unwrap();
            app.repo
                .mark_run_started(
                    &run_id,
                    &agent_id,
                    Timestamp::now(),
                    Timestamp::from_millis(1),
                )
                .await
                .unwrap();
        }

        let reaper = tight_reaper(
            &app,
            ReaperTuning {
                // keep offline detection out of this test
                heartbeat_timeout: Duration::from_secs(3600),
                cancel_grace: Duration::ZERO,
                ..Default::default()
            },
        );

        // first sweep asks the agent to stop
        reaper.sweep().await;
        let cancelled = agent.expect_cancel().await;
        assert_eq!(cancelled, run_id);

        // the agent ignores it; the grace has elapsed, so the next sweep
        // finalizes the run as timed out
        reaper.sweep().await;
        wait_for("run to time out", RECV_TIMEOUT, || async {
            run_field(&app.repo, &run_id, |r| r.status == RunStatus::Timeout).await
        })
        .await;

        // capacity was reclaimed
        wait_for("agent release", RECV_TIMEOUT, || async {
            app.orchestrator
                .registry
                .get(&agent.agent_id)
                .await
                .map(|a| a.active_runs.is_empty())
                .unwrap_or(false)
        })
        .await;
    });
}

#[test]
fn orphan_budget_exhaustion_fails_the_run() {
    init_tracing_tests();
    let app = TestApp::new();

    app.ctx.rt.clone().block_on(async {
        let service = app
            .seed_service("svc-doomed", &["zone-a"], vec![spec("suite")])
            .await;

        let run_id = {
            let mut agent = MockAgent::connect(&app, "a1", &["zone-a"], 1).await;
            let run_id = app.submit(&service, 0).await;
            let work = agent.expect_assign().await;
            agent.accept(&work.run_id).await;
            wait_for("run to start", RECV_TIMEOUT, || async {
                run_field(&app.repo, &run_id, |r| r.status == RunStatus::Running).await
            })
            .await;
            run_id
        };

        let reaper = tight_reaper(
            &app,
            ReaperTuning {
                heartbeat_timeout: Duration::from_millis(50),
                orphan_window: Duration::ZERO,
                // no requeue budget at all: first orphaning is fatal
                max_orphan_requeues: 0,
                ..Default::default()
            },
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        reaper.sweep().await;
        reaper.sweep().await;

        wait_for("run to fail", RECV_TIMEOUT, || async {
            run_field(&app.repo, &run_id, |r| r.status == RunStatus::Error).await
        })
        .await;

        // the failure reason reached the notification sink
        let events = app.notifier.events();
        assert!(events.iter().any(|e| {
            matches!(
                e,
                proctor::notify::Event::RunFinished {
                    run_id: r,
                    status: RunStatus::Error,
                    reason: Some(reason),
                    ..
                } if *r == run_id && reason == "AgentLost"
            )
        }));
    });
}
