//! Collector behavior beyond the happy path: per-test retries, result
//! files shipped as artifacts, inline size limits, summary authority,
//! allow_failure accounting.

mod support;

use std::time::Duration;

use proctor::init_tracing_tests;
use proctor_types::{
    ArtifactBytes, ArtifactPayload, ResultFormat, RunOutcome, RunStatus, TestResult, TestStatus,
};
use support::*;
use utils::storage::Repository;

#[test]
fn failed_test_with_retry_budget_is_resubmitted() {
    init_tracing_tests();
    let app = TestApp::new();

    app.ctx.rt.clone().block_on(async {
        let mut flaky = spec("flaky");
        flaky.retries = 1;
        let service = app.seed_service("svc-retry", &["zone-a"], vec![flaky]).await;

        let mut agent = MockAgent::connect(&app, "a1", &["zone-a"], 1).await;
        let run_id = app.submit(&service, 0).await;
        let work = agent.expect_assign().await;
        agent.accept(&work.run_id).await;
        wait_for("run to start", RECV_TIMEOUT, || async {
            run_field(&app.repo, &run_id, |r| r.status == RunStatus::Running).await
        })
        .await;

        agent
            .stream_result(&run_id, TestResult::failed("flaky", "socket reset"))
            .await;

        // the same test comes back alone, with the next attempt number
        let retry = agent.expect_assign().await;
        assert_eq!(retry.run_id, run_id);
        assert_eq!(retry.attempt, 2);
        assert_eq!(retry.tests.len(), 1);
        assert_eq!(retry.tests[0].name, "flaky");

        let mut second = TestResult::passed("flaky");
        second.attempt = 2;
        agent.stream_result(&run_id, second).await;
        agent
            .complete(&run_id, RunOutcome::Success, summary(1, 1, 0, 0))
            .await;

        wait_for("run to pass", Duration::from_secs(10), || async {
            run_field(&app.repo, &run_id, |r| r.status == RunStatus::Passed).await
        })
        .await;

        // both attempts persisted as distinct rows
        assert_eq!(app.repo.count_results(&run_id).await.unwrap(), 2);

        // an exhausted budget is not retried again
        let results = app.repo.list_results(&run_id).await.unwrap();
        assert!(results.iter().any(|r| r.attempt == 2 && r.status == TestStatus::Pass));
    });
}

#[test]
fn result_file_artifact_is_parsed_into_rows() {
    init_tracing_tests();
    let app = TestApp::new();

    app.ctx.rt.clone().block_on(async {
        let mut suite = spec("suite");
        suite.result_config.result_file = Some("junit.xml".to_string());
        suite.result_config.result_format = ResultFormat::Junit;
        let service = app.seed_service("svc-junit", &["zone-a"], vec![suite]).await;

        let mut agent = MockAgent::connect(&app, "a1", &["zone-a"], 1).await;
        let run_id = app.submit(&service, 0).await;
        let work = agent.expect_assign().await;
        agent.accept(&work.run_id).await;
        wait_for("run to start", RECV_TIMEOUT, || async {
            run_field(&app.repo, &run_id, |r| r.status == RunStatus::Running).await
        })
        .await;

        let junit = r#"<testsuite name="suite">
            <testcase name="alpha" time="0.1"/>
            <testcase name="beta" time="0.2">
                <failure message="boom"/>
            </testcase>
        </testsuite>"#;
        agent
            .stream_artifact(
                &run_id,
                ArtifactPayload {
                    name: "junit.xml".to_string(),
                    content_type: "application/xml".to_string(),
                    bytes: ArtifactBytes::Inline(junit.as_bytes().to_vec()),
                    test_name: None,
                },
            )
            .await;

        wait_for("rows from the result file", RECV_TIMEOUT, || async {
            app.repo.count_results(&run_id).await.unwrap() == 2
        })
        .await;

        // the file itself is also recorded as an artifact and stored
        let artifacts = app.repo.list_artifacts(&run_id).await.unwrap();
        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts[0].name, "junit.xml");
        assert!(app.artifacts.get(&artifacts[0].storage_key).is_some());

        let results = app.repo.list_results(&run_id).await.unwrap();
        let beta = results.iter().find(|r| r.name == "beta").unwrap();
        assert_eq!(beta.status, TestStatus::Fail);
        assert_eq!(beta.error_message.as_deref(), Some("boom"));
    });
}

#[test]
fn oversized_inline_artifact_is_refused() {
    init_tracing_tests();
    let mut config = test_config();
    config.max_artifact_inline_bytes = 64;
    let app = TestApp::with_config(config);

    app.ctx.rt.clone().block_on(async {
        let service = app
            .seed_service("svc-big", &["zone-a"], vec![spec("t1")])
            .await;

        let mut agent = MockAgent::connect(&app, "a1", &["zone-a"], 1).await;
        let run_id = app.submit(&service, 0).await;
        let work = agent.expect_assign().await;
        agent.accept(&work.run_id).await;
        wait_for("run to start", RECV_TIMEOUT, || async {
            run_field(&app.repo, &run_id, |r| r.status == RunStatus::Running).await
        })
        .await;

        agent
            .stream_artifact(
                &run_id,
                ArtifactPayload {
                    name: "huge.bin".to_string(),
                    content_type: "application/octet-stream".to_string(),
                    bytes: ArtifactBytes::Inline(vec![0u8; 4096]),
                    test_name: None,
                },
            )
            .await;
        // an upload reference has no size limit: the bytes never crossed
        // the session
        agent
            .stream_artifact(
                &run_id,
                ArtifactPayload {
                    name: "huge-uploaded.bin".to_string(),
                    content_type: "application/octet-stream".to_string(),
                    bytes: ArtifactBytes::UploadRef("bucket/huge".to_string()),
                    test_name: None,
                },
            )
            .await;

        wait_for("uploaded artifact row", RECV_TIMEOUT, || async {
            app.repo.list_artifacts(&run_id).await.unwrap().len() == 1
        })
        .await;
        let artifacts = app.repo.list_artifacts(&run_id).await.unwrap();
        assert_eq!(artifacts[0].name, "huge-uploaded.bin");
        assert_eq!(artifacts[0].storage_key, "bucket/huge");
    });
}

#[test]
fn agent_summary_wins_over_observed_rows() {
    init_tracing_tests();
    let app = TestApp::new();

    app.ctx.rt.clone().block_on(async {
        let service = app
            .seed_service("svc-sum", &["zone-a"], vec![spec("t1"), spec("t2")])
            .await;

        let mut agent = MockAgent::connect(&app, "a1", &["zone-a"], 1).await;
        let run_id = app.submit(&service, 0).await;
        let work = agent.expect_assign().await;
        agent.accept(&work.run_id).await;
        wait_for("run to start", RECV_TIMEOUT, || async {
            run_field(&app.repo, &run_id, |r| r.status == RunStatus::Running).await
        })
        .await;

        // only one row arrives, but the agent claims two ran
        agent.stream_result(&run_id, TestResult::passed("t1")).await;
        agent
            .complete(&run_id, RunOutcome::Success, summary(2, 2, 0, 0))
            .await;

        wait_for("run to pass", Duration::from_secs(10), || async {
            run_field(&app.repo, &run_id, |r| r.status == RunStatus::Passed).await
        })
        .await;

        let run = app.repo.get_run(&run_id).await.unwrap().unwrap();
        assert_eq!(run.summary, summary(2, 2, 0, 0));
        assert_eq!(app.repo.count_results(&run_id).await.unwrap(), 1);
    });
}

#[test]
fn allowed_failures_do_not_fail_the_run() {
    init_tracing_tests();
    let app = TestApp::new();

    app.ctx.rt.clone().block_on(async {
        let mut optional = spec("canary");
        optional.allow_failure = true;
        let service = app
            .seed_service("svc-canary", &["zone-a"], vec![spec("core"), optional])
            .await;

        let mut agent = MockAgent::connect(&app, "a1", &["zone-a"], 1).await;
        let run_id = app.submit(&service, 0).await;
        let work = agent.expect_assign().await;
        agent.accept(&work.run_id).await;
        wait_for("run to start", RECV_TIMEOUT, || async {
            run_field(&app.repo, &run_id, |r| r.status == RunStatus::Running).await
        })
        .await;

        agent.stream_result(&run_id, TestResult::passed("core")).await;
        agent
            .stream_result(&run_id, TestResult::failed("canary", "known flake"))
            .await;
        // the canary failure still counts in the failed column
        agent
            .complete(&run_id, RunOutcome::Failed, summary(2, 1, 1, 0))
            .await;

        wait_for("run to settle", Duration::from_secs(10), || async {
            run_field(&app.repo, &run_id, |r| r.status.is_terminal()).await
        })
        .await;

        let run = app.repo.get_run(&run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Passed);
        assert_eq!(run.summary, summary(2, 1, 1, 0));
    });
}
