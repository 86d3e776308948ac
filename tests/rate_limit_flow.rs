mod support;

use automagik_omni::config::RateLimitConfig;
use automagik_omni::router::InboundOutcome;
use automagik_omni::trace::{TraceFilter, TraceStatus};
use serde_json::json;
use support::{whatsapp_text_event, TestGateway};
use wiremock::matchers::{method, path};
use wiremock::{Mock, ResponseTemplate};

#[tokio::test]
async fn fourth_message_in_window_is_rate_limited() {
    let gw = TestGateway::with_rate_limit(RateLimitConfig {
        max_requests: 3,
        window_secs: 10,
        cleanup_interval_secs: 300,
    })
    .await;
    gw.add_whatsapp_instance("acme").await;

    Mock::given(method("POST"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "message": "hi" })))
        .expect(3)
        .mount(&gw.agent)
        .await;
    Mock::given(method("POST"))
        .and(path("/message/sendText/acme"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "key": { "id": "O" } })))
        .mount(&gw.broker)
        .await;

    let mut outcomes = Vec::new();
    for id in ["M1", "M2", "M3", "M4"] {
        outcomes.push(
            gw.router
                .route_inbound("acme", &whatsapp_text_event("acme", "5511999", id, "hello"))
                .await,
        );
    }

    assert_eq!(&outcomes[..3], &[InboundOutcome::Received, InboundOutcome::Received, InboundOutcome::Received]);
    assert_eq!(
        outcomes[3],
        InboundOutcome::Dropped {
            reason: Some("rate_limited")
        }
    );

    let traces = gw
        .traces
        .list(&gw.pool, &TraceFilter { page: 1, page_size: 10, ..TraceFilter::default() })
        .await
        .unwrap();
    assert_eq!(traces.len(), 4);

    let completed = traces
        .iter()
        .filter(|t| t.trace_status == TraceStatus::Completed)
        .count();
    let limited: Vec<_> = traces
        .iter()
        .filter(|t| t.error_kind.as_deref() == Some("rate_limited"))
        .collect();
    assert_eq!(completed, 3);
    assert_eq!(limited.len(), 1);
    assert_eq!(limited[0].trace_status, TraceStatus::Failed);

    // The fourth message never reached the agent.
    gw.agent.verify().await;
}

#[tokio::test]
async fn different_senders_have_independent_windows() {
    let gw = TestGateway::with_rate_limit(RateLimitConfig {
        max_requests: 1,
        window_secs: 10,
        cleanup_interval_secs: 300,
    })
    .await;
    gw.add_whatsapp_instance("acme").await;

    Mock::given(method("POST"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "message": "hi" })))
        .mount(&gw.agent)
        .await;
    Mock::given(method("POST"))
        .and(path("/message/sendText/acme"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({})))
        .mount(&gw.broker)
        .await;

    assert_eq!(
        gw.router
            .route_inbound("acme", &whatsapp_text_event("acme", "5511111", "M1", "a"))
            .await,
        InboundOutcome::Received
    );
    assert_eq!(
        gw.router
            .route_inbound("acme", &whatsapp_text_event("acme", "5522222", "M2", "b"))
            .await,
        InboundOutcome::Received
    );
    assert_eq!(
        gw.router
            .route_inbound("acme", &whatsapp_text_event("acme", "5511111", "M3", "c"))
            .await,
        InboundOutcome::Dropped {
            reason: Some("rate_limited")
        }
    );
}
