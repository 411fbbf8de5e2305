//! Session-layer behavior: auth gating, last-writer-wins reconnects,
//! protocol-violation budgets, backpressure closure, heartbeat
//! reconciliation.

mod support;

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use proctor::init_tracing_tests;
use proctor::subsystems::session::codec::{decode_frame, encode_frame, frame_codec};
use proctor_types::{
    AgentCaps, AgentMessage, CoreMessage, Credential, RegisterRequest, RunId, PROTOCOL_VERSION,
};
use support::*;
use tokio_util::codec::{FramedRead, FramedWrite};

fn register_request(token: &str, protocol_version: &str) -> AgentMessage {
    AgentMessage::Register(RegisterRequest {
        agent_id: None,
        name: "intruder".to_string(),
        version: "1.0.0".to_string(),
        caps: AgentCaps {
            zones: ["zone-a".parse().unwrap()].into(),
            max_parallel: 1,
            ..Default::default()
        },
        protocol_version: protocol_version.to_string(),
        credential: Credential::Token(token.to_string()),
    })
}

/// Drive a raw connection: returns the first response frame, if any
async fn raw_handshake(app: &TestApp, register: AgentMessage) -> Option<CoreMessage> {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let orchestrator = app.orchestrator.clone();
    tokio::spawn(async move {
        let _ = orchestrator.serve_agent(server, false).await;
    });

    let (read_half, write_half) = tokio::io::split(client);
    let mut reader = FramedRead::new(read_half, frame_codec());
    let mut writer = FramedWrite::new(write_half, frame_codec());

    writer.send(encode_frame(&register).unwrap()).await.unwrap();

    match tokio::time::timeout(Duration::from_secs(2), reader.next()).await {
        Ok(Some(Ok(frame))) => Some(decode_frame(&frame).unwrap()),
        _ => None,
    }
}

#[test]
fn bad_token_is_refused_before_registry_touch() {
    init_tracing_tests();
    let app = TestApp::new();

    app.ctx.rt.clone().block_on(async {
        let response = raw_handshake(&app, register_request("wrong-token", PROTOCOL_VERSION)).await;
        assert!(response.is_none(), "auth failure must close the session");
        assert!(app.orchestrator.registry.snapshot().await.is_empty());
    });
}

#[test]
fn incompatible_protocol_is_refused() {
    init_tracing_tests();
    let app = TestApp::new();

    app.ctx.rt.clone().block_on(async {
        let response = raw_handshake(&app, register_request(TEST_TOKEN, "99.0.0")).await;
        assert!(response.is_none());
        assert!(app.orchestrator.registry.snapshot().await.is_empty());
    });
}

#[test]
fn first_message_must_be_register() {
    init_tracing_tests();
    let app = TestApp::new();

    app.ctx.rt.clone().block_on(async {
        let response = raw_handshake(
            &app,
            AgentMessage::WorkAccepted {
                run_id: RunId::new("run-1").unwrap(),
                accepted_at_ms: 0,
            },
        )
        .await;
        assert!(response.is_none());
    });
}

#[test]
fn newer_session_replaces_older_one() {
    init_tracing_tests();
    let app = TestApp::new();

    app.ctx.rt.clone().block_on(async {
        let mut first = MockAgent::connect(&app, "a1", &["zone-a"], 1).await;
        let agent_id = first.agent_id.clone();

        let second =
            MockAgent::connect_as(&app, Some(agent_id.clone()), "a1", &["zone-a"], 1).await;
        assert_eq!(second.agent_id, agent_id);

        // the older stream receives cancellation: it closes
        assert!(first.recv().await.is_none());

        // one logical agent record
        assert_eq!(app.orchestrator.registry.snapshot().await.len(), 1);
        assert!(app.orchestrator.sessions.is_connected(&agent_id));
    });
}

#[test]
fn garbage_frames_exhaust_the_violation_budget() {
    init_tracing_tests();
    let app = TestApp::new();

    app.ctx.rt.clone().block_on(async {
        let mut agent = MockAgent::connect(&app, "a1", &["zone-a"], 1).await;
        let agent_id = agent.agent_id.clone();

        // a single bad frame is logged and dropped, never fatal
        agent.send_raw(&[0xde, 0xad]).await;
        agent.heartbeat(&[]).await;
        assert!(app.orchestrator.sessions.is_connected(&agent_id));

        // but a peer that keeps violating gets closed
        for _ in 0..32 {
            agent.send_raw(&[0xde, 0xad, 0xbe, 0xef]).await;
        }
        wait_for("session to close", RECV_TIMEOUT, || async {
            !app.orchestrator.sessions.is_connected(&agent_id)
        })
        .await;
    });
}

#[test]
fn heartbeat_with_stale_run_gets_a_cancel() {
    init_tracing_tests();
    let app = TestApp::new();

    app.ctx.rt.clone().block_on(async {
        let mut agent = MockAgent::connect(&app, "a1", &["zone-a"], 1).await;

        let stale = RunId::new("run-stale").unwrap();
        agent.heartbeat(&[&stale]).await;

        let cancelled = agent.expect_cancel().await;
        assert_eq!(cancelled, stale);
    });
}

#[test]
fn outbound_overflow_closes_the_session() {
    init_tracing_tests();
    let mut config = test_config();
    config.session_outbound_capacity = 1;
    let app = TestApp::with_config(config);

    app.ctx.rt.clone().block_on(async {
        let service = app
            .seed_service("svc-flood", &["zone-a"], vec![spec("t1")])
            .await;

        // tiny transport buffer: the writer wedges on the first frame once
        // the agent stops reading
        let agent =
            MockAgent::connect_with_buffer(&app, None, "a1", &["zone-a"], 8, 128).await;
        let agent_id = agent.agent_id.clone();

        // the agent never reads; dispatches pile into the bounded queue
        for _ in 0..4 {
            app.submit(&service, 0).await;
        }

        wait_for("backpressure close", Duration::from_secs(10), || async {
            !app.orchestrator.sessions.is_connected(&agent_id)
        })
        .await;
    });
}
