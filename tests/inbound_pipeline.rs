mod support;

use automagik_omni::router::InboundOutcome;
use automagik_omni::trace::{Stage, TraceFilter, TraceStatus};
use serde_json::json;
use support::{whatsapp_text_event, TestGateway};
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn mock_agent_reply(server: &MockServer, reply: serde_json::Value) {
    Mock::given(method("POST"))
        .and(path("/"))
        .and(header("x-api-key", "agent-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(reply))
        .mount(server)
        .await;
}

async fn mock_broker_send_text(server: &MockServer, instance: &str) {
    Mock::given(method("POST"))
        .and(path(format!("/message/sendText/{instance}")))
        .and(header("apikey", "broker-key"))
        .respond_with(
            ResponseTemplate::new(201).set_body_json(json!({ "key": { "id": "OUT1" } })),
        )
        .mount(server)
        .await;
}

#[tokio::test]
async fn whatsapp_inbound_agent_reply_completes_with_ordered_stages() {
    let gw = TestGateway::new().await;
    gw.add_whatsapp_instance("acme").await;

    mock_agent_reply(&gw.agent, json!({ "message": "hi there" })).await;
    mock_broker_send_text(&gw.broker, "acme").await;

    let event = whatsapp_text_event("acme", "5511999", "M1", "hello");
    let outcome = gw.router.route_inbound("acme", &event).await;
    assert_eq!(outcome, InboundOutcome::Received);

    // Exactly one trace, completed.
    let traces = gw
        .traces
        .list(
            &gw.pool,
            &TraceFilter {
                page: 1,
                page_size: 10,
                ..TraceFilter::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(traces.len(), 1);
    let trace = &traces[0];
    assert_eq!(trace.trace_status, TraceStatus::Completed);
    assert_eq!(trace.sender_phone.as_deref(), Some("5511999"));
    assert!(trace.completed_at.is_some());
    assert!(trace.agent_session_id.is_some());

    // Four stages in pipeline order.
    let payloads = gw.traces.payloads(&gw.pool, &trace.trace_id).await.unwrap();
    let stages: Vec<Stage> = payloads.iter().map(|p| p.stage).collect();
    assert_eq!(
        stages,
        vec![
            Stage::WebhookReceived,
            Stage::AgentRequest,
            Stage::AgentResponse,
            Stage::EvolutionSend,
        ]
    );

    // Stage timestamps are monotonically non-decreasing.
    for pair in payloads.windows(2) {
        assert!(pair[0].timestamp <= pair[1].timestamp);
    }

    // Exactly one outbound sendText, to the sender, with the agent's reply.
    let sends = gw.broker.received_requests().await.unwrap();
    assert_eq!(sends.len(), 1);
    let body: serde_json::Value = serde_json::from_slice(&sends[0].body).unwrap();
    assert_eq!(body["number"], "5511999");
    assert_eq!(body["text"], "hi there");
}

#[tokio::test]
async fn agent_session_id_is_stable_per_chat() {
    let gw = TestGateway::new().await;
    gw.add_whatsapp_instance("acme").await;
    mock_agent_reply(&gw.agent, json!({ "message": "ok" })).await;
    mock_broker_send_text(&gw.broker, "acme").await;

    for id in ["M1", "M2"] {
        gw.router
            .route_inbound("acme", &whatsapp_text_event("acme", "5511999", id, "hey"))
            .await;
    }

    let requests = gw.agent.received_requests().await.unwrap();
    assert_eq!(requests.len(), 2);
    let first: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
    let second: serde_json::Value = serde_json::from_slice(&requests[1].body).unwrap();
    assert_eq!(first["session_id"], second["session_id"]);
    assert_eq!(first["agent"], "default");
}

#[tokio::test]
async fn agent_http_error_fails_trace_with_status_kind() {
    let gw = TestGateway::new().await;
    gw.add_whatsapp_instance("acme").await;

    Mock::given(method("POST"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(403).set_body_string("forbidden"))
        .mount(&gw.agent)
        .await;

    let outcome = gw
        .router
        .route_inbound("acme", &whatsapp_text_event("acme", "5511999", "M1", "hello"))
        .await;
    assert_eq!(outcome, InboundOutcome::Received);

    let traces = gw
        .traces
        .list(&gw.pool, &TraceFilter { page: 1, page_size: 10, ..TraceFilter::default() })
        .await
        .unwrap();
    assert_eq!(traces[0].trace_status, TraceStatus::Failed);
    assert_eq!(traces[0].error_kind.as_deref(), Some("agent_http_403"));

    // No outbound was attempted.
    assert!(gw.broker.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn empty_agent_reply_completes_without_outbound() {
    let gw = TestGateway::new().await;
    gw.add_whatsapp_instance("acme").await;
    mock_agent_reply(&gw.agent, json!({ "message": "" })).await;

    gw.router
        .route_inbound("acme", &whatsapp_text_event("acme", "5511999", "M1", "hello"))
        .await;

    let traces = gw
        .traces
        .list(&gw.pool, &TraceFilter { page: 1, page_size: 10, ..TraceFilter::default() })
        .await
        .unwrap();
    assert_eq!(traces[0].trace_status, TraceStatus::Completed);
    assert!(gw.broker.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn send_failure_marks_trace_send_failed() {
    let gw = TestGateway::new().await;
    gw.add_whatsapp_instance("acme").await;
    mock_agent_reply(&gw.agent, json!({ "message": "hi" })).await;

    Mock::given(method("POST"))
        .and(path("/message/sendText/acme"))
        .respond_with(ResponseTemplate::new(500).set_body_json(json!({ "error": "broker down" })))
        .mount(&gw.broker)
        .await;

    gw.router
        .route_inbound("acme", &whatsapp_text_event("acme", "5511999", "M1", "hello"))
        .await;

    let traces = gw
        .traces
        .list(&gw.pool, &TraceFilter { page: 1, page_size: 10, ..TraceFilter::default() })
        .await
        .unwrap();
    assert_eq!(traces[0].trace_status, TraceStatus::Failed);
    assert_eq!(traces[0].error_kind.as_deref(), Some("send_failed"));
}

#[tokio::test]
async fn unknown_instance_drops_without_trace() {
    let gw = TestGateway::new().await;

    let outcome = gw
        .router
        .route_inbound("ghost", &whatsapp_text_event("ghost", "5511999", "M1", "hello"))
        .await;
    assert_eq!(
        outcome,
        InboundOutcome::Dropped {
            reason: Some("unknown_instance")
        }
    );

    let traces = gw
        .traces
        .list(&gw.pool, &TraceFilter { page: 1, page_size: 10, ..TraceFilter::default() })
        .await
        .unwrap();
    assert!(traces.is_empty());
}

#[tokio::test]
async fn own_and_system_events_drop_silently() {
    let gw = TestGateway::new().await;
    gw.add_whatsapp_instance("acme").await;

    let own_message = json!({
        "instance": "acme",
        "event": "messages.upsert",
        "data": {
            "key": { "remoteJid": "5511999@s.whatsapp.net", "fromMe": true, "id": "M1" },
            "message": { "conversation": "me" },
        }
    });
    assert_eq!(
        gw.router.route_inbound("acme", &own_message).await,
        InboundOutcome::Dropped { reason: None }
    );

    let system = json!({ "instance": "acme", "event": "connection.update", "data": {} });
    assert_eq!(
        gw.router.route_inbound("acme", &system).await,
        InboundOutcome::Dropped { reason: None }
    );

    assert!(gw.agent.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn agent_request_carries_metadata_and_user() {
    let gw = TestGateway::new().await;
    gw.add_whatsapp_instance("acme").await;
    mock_agent_reply(&gw.agent, json!({ "message": "ok" })).await;
    mock_broker_send_text(&gw.broker, "acme").await;

    Mock::given(method("POST"))
        .and(path("/"))
        .and(body_partial_json(json!({ "message": "hello" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "message": "ok" })))
        .mount(&gw.agent)
        .await;

    gw.router
        .route_inbound("acme", &whatsapp_text_event("acme", "5511999", "M1", "hello"))
        .await;

    let requests = gw.agent.received_requests().await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(body["metadata"]["channel"], "whatsapp");
    assert_eq!(body["metadata"]["chat_id"], "5511999@s.whatsapp.net");
    // WhatsApp first contact creates a user.
    assert!(body["user_id"].as_str().is_some());
}
