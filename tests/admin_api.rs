mod support;

use automagik_omni::api::{self, AppState};
use automagik_omni::channels::discord::EventQueue;
use automagik_omni::channels::AdapterSet;
use automagik_omni::config::{Config, Environment};
use serde_json::json;
use std::sync::Arc;
use support::{whatsapp_text_event, TestGateway};
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, ResponseTemplate};

/// Spin the real axum app on an ephemeral port.
async fn spawn_api(gw: &TestGateway, config: Config) -> String {
    let state = AppState {
        pool: gw.pool.clone(),
        config: Arc::new(config),
        registry: Arc::clone(&gw.registry),
        access: Arc::clone(&gw.access),
        traces: Arc::clone(&gw.traces),
        rate_limiter: Arc::clone(&gw.rate_limiter),
        router: Arc::clone(&gw.router),
        adapters: Arc::new(AdapterSet::new(reqwest::Client::new())),
        http: reqwest::Client::new(),
        discord_queue: Arc::new(EventQueue::new(16)),
        pipeline_slots: Arc::new(tokio::sync::Semaphore::new(8)),
    };

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(api::serve(state, listener, CancellationToken::new()));
    format!("http://{addr}/api/v1")
}

fn whatsapp_body(name: &str, broker_url: &str, agent_url: &str) -> serde_json::Value {
    json!({
        "name": name,
        "channel_type": "whatsapp",
        "evolution_url": broker_url,
        "evolution_key": "broker-key",
        "whatsapp_instance": name,
        "agent_api_url": agent_url,
        "agent_api_key": "agent-key",
        "default_agent": "default",
    })
}

#[tokio::test]
async fn health_is_public_and_reports_counters() {
    let gw = TestGateway::new().await;
    let base = spawn_api(&gw, Config::for_tests("sqlite::memory:")).await;

    let response = reqwest::get(format!("{base}/health")).await.unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["trace_store_failures"], 0);
    assert!(body["discord_queue"]["dropped_by_backpressure"].is_number());
}

#[tokio::test]
async fn instance_crud_round_trip() {
    let gw = TestGateway::new().await;
    let base = spawn_api(&gw, Config::for_tests("sqlite::memory:")).await;
    let client = reqwest::Client::new();

    // Create.
    let created = client
        .post(format!("{base}/instances"))
        .json(&whatsapp_body("acme", &gw.broker.uri(), &gw.agent.uri()))
        .send()
        .await
        .unwrap();
    assert_eq!(created.status(), 201);
    let body: serde_json::Value = created.json().await.unwrap();
    assert_eq!(body["name"], "acme");
    let masked_key = body["evolution_key"].as_str().unwrap();
    assert!(masked_key.starts_with("****"), "secrets read back masked");

    // Duplicate name conflicts.
    let duplicate = client
        .post(format!("{base}/instances"))
        .json(&whatsapp_body("acme", &gw.broker.uri(), &gw.agent.uri()))
        .send()
        .await
        .unwrap();
    assert_eq!(duplicate.status(), 409);

    // Missing credentials is a semantic invariant violation.
    let invalid = client
        .post(format!("{base}/instances"))
        .json(&json!({
            "name": "broken",
            "channel_type": "whatsapp",
            "agent_api_url": gw.agent.uri(),
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(invalid.status(), 422);
    let error: serde_json::Value = invalid.json().await.unwrap();
    assert!(error["error"]["message"]
        .as_str()
        .unwrap()
        .contains("credential"));

    // Read, update, list, delete.
    let fetched = client
        .get(format!("{base}/instances/acme"))
        .send()
        .await
        .unwrap();
    assert_eq!(fetched.status(), 200);

    let updated = client
        .patch(format!("{base}/instances/acme"))
        .json(&json!({ "default_agent": "specialist" }))
        .send()
        .await
        .unwrap();
    assert_eq!(updated.status(), 200);
    let body: serde_json::Value = updated.json().await.unwrap();
    assert_eq!(body["default_agent"], "specialist");

    let listed: serde_json::Value = client
        .get(format!("{base}/instances"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listed["instances"].as_array().unwrap().len(), 1);

    let deleted = client
        .delete(format!("{base}/instances/acme"))
        .send()
        .await
        .unwrap();
    assert_eq!(deleted.status(), 204);

    let missing = client
        .get(format!("{base}/instances/acme"))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), 404);
}

#[tokio::test]
async fn access_control_crud_and_listing() {
    let gw = TestGateway::new().await;
    let base = spawn_api(&gw, Config::for_tests("sqlite::memory:")).await;
    let client = reqwest::Client::new();

    let created = client
        .post(format!("{base}/access-control/deny"))
        .json(&json!({ "phone_number": "5511*", "label": "spam range" }))
        .send()
        .await
        .unwrap();
    assert_eq!(created.status(), 201);
    let body: serde_json::Value = created.json().await.unwrap();
    let rule_id = body["id"].as_i64().unwrap();

    // Unknown list type is a validation error.
    let invalid = client
        .post(format!("{base}/access-control/banlist"))
        .json(&json!({ "phone_number": "5511*" }))
        .send()
        .await
        .unwrap();
    assert_eq!(invalid.status(), 400);

    // Scoped rule against a missing instance 404s.
    let missing_instance = client
        .post(format!("{base}/access-control/allow"))
        .json(&json!({ "phone_number": "1234", "instance_name": "ghost" }))
        .send()
        .await
        .unwrap();
    assert_eq!(missing_instance.status(), 404);

    let listed: serde_json::Value = client
        .get(format!("{base}/access-control?list_type=deny"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listed["rules"].as_array().unwrap().len(), 1);

    let removed = client
        .delete(format!("{base}/access-control/rules/{rule_id}"))
        .send()
        .await
        .unwrap();
    assert_eq!(removed.status(), 204);

    let gone = client
        .delete(format!("{base}/access-control/rules/{rule_id}"))
        .send()
        .await
        .unwrap();
    assert_eq!(gone.status(), 404);
}

#[tokio::test]
async fn webhook_ingress_routes_and_traces() {
    let gw = TestGateway::new().await;
    gw.add_whatsapp_instance("acme").await;
    let base = spawn_api(&gw, Config::for_tests("sqlite::memory:")).await;
    let client = reqwest::Client::new();

    Mock::given(method("POST"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "message": "hi there" })))
        .mount(&gw.agent)
        .await;
    Mock::given(method("POST"))
        .and(path("/message/sendText/acme"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({})))
        .mount(&gw.broker)
        .await;

    let response = client
        .post(format!("{base}/webhook/evolution/acme"))
        .json(&whatsapp_text_event("acme", "5511999", "M1", "hello"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["status"], "received");

    // Unknown instance: 200 with a dropped status, never an error.
    let dropped: serde_json::Value = client
        .post(format!("{base}/webhook/evolution/ghost"))
        .json(&whatsapp_text_event("ghost", "5511999", "M2", "hello"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(dropped["status"], "dropped");
    assert_eq!(dropped["reason"], "unknown_instance");

    // The processed message shows up in the trace read model.
    let traces: serde_json::Value = client
        .get(format!("{base}/traces?instance_name=acme"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let rows = traces["traces"].as_array().unwrap();
    assert_eq!(rows.len(), 1);
    let trace_id = rows[0]["trace_id"].as_str().unwrap();

    let payloads: serde_json::Value = client
        .get(format!("{base}/traces/{trace_id}/payloads"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let stages: Vec<&str> = payloads["payloads"]
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["stage"].as_str().unwrap())
        .collect();
    assert_eq!(
        stages,
        vec!["webhook_received", "agent_request", "agent_response", "evolution_send"]
    );

    let analytics: serde_json::Value = client
        .get(format!("{base}/traces/analytics"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(analytics["by_status"]["completed"], 1);
}

#[tokio::test]
async fn send_text_endpoint_dispatches_and_traces() {
    let gw = TestGateway::new().await;
    gw.add_whatsapp_instance("acme").await;
    let base = spawn_api(&gw, Config::for_tests("sqlite::memory:")).await;
    let client = reqwest::Client::new();

    Mock::given(method("POST"))
        .and(path("/message/sendText/acme"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "key": { "id": "O1" } })))
        .mount(&gw.broker)
        .await;

    let response = client
        .post(format!("{base}/instance/acme/send-text"))
        .json(&json!({ "phone": "5511888", "message": "proactive hello" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["status"], "sent");
    assert_eq!(body["chunks"], 1);
    assert!(!body["trace_id"].as_str().unwrap().is_empty());

    // Empty message is a validation error.
    let invalid = client
        .post(format!("{base}/instance/acme/send-text"))
        .json(&json!({ "phone": "5511888", "message": "  " }))
        .send()
        .await
        .unwrap();
    assert_eq!(invalid.status(), 400);

    // Unknown instance 404s.
    let missing = client
        .post(format!("{base}/instance/ghost/send-text"))
        .json(&json!({ "phone": "5511888", "message": "hi" }))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), 404);
}

#[tokio::test]
async fn instance_actions_proxy_the_broker() {
    let gw = TestGateway::new().await;
    gw.add_whatsapp_instance("acme").await;
    let base = spawn_api(&gw, Config::for_tests("sqlite::memory:")).await;
    let client = reqwest::Client::new();

    Mock::given(method("GET"))
        .and(path("/instance/connect/acme"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "base64": "QR..." })))
        .mount(&gw.broker)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/instance/logout/acme"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "status": "SUCCESS" })))
        .mount(&gw.broker)
        .await;

    // QR fetch and connect both hit the broker's connect endpoint.
    let qr: serde_json::Value = client
        .get(format!("{base}/instances/acme/qr"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(qr["base64"], "QR...");

    let connect = client
        .post(format!("{base}/instances/acme/connect"))
        .send()
        .await
        .unwrap();
    assert_eq!(connect.status(), 200);

    // Disconnect closes the session but leaves the tenant active.
    let disconnect = client
        .post(format!("{base}/instances/acme/disconnect"))
        .send()
        .await
        .unwrap();
    assert_eq!(disconnect.status(), 200);
    let after_disconnect: serde_json::Value = client
        .get(format!("{base}/instances/acme"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(after_disconnect["is_active"], true);

    // Logout closes the session and deactivates the tenant.
    let logout = client
        .post(format!("{base}/instances/acme/logout"))
        .send()
        .await
        .unwrap();
    assert_eq!(logout.status(), 200);
    let after_logout: serde_json::Value = client
        .get(format!("{base}/instances/acme"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(after_logout["is_active"], false);

    // Broker actions are meaningless for discord tenants.
    gw.add_discord_instance("d1").await;
    let rejected = client
        .post(format!("{base}/instances/d1/restart"))
        .send()
        .await
        .unwrap();
    assert_eq!(rejected.status(), 400);
}

#[tokio::test]
async fn production_mode_requires_api_key() {
    let gw = TestGateway::new().await;
    let mut config = Config::for_tests("sqlite::memory:");
    config.environment = Environment::Production;
    config.api_key = Some("top-secret".into());
    let base = spawn_api(&gw, config).await;
    let client = reqwest::Client::new();

    // Admin routes reject a missing or wrong key.
    let unauthorized = client
        .get(format!("{base}/instances"))
        .send()
        .await
        .unwrap();
    assert_eq!(unauthorized.status(), 401);

    let wrong = client
        .get(format!("{base}/instances"))
        .header("x-api-key", "guess")
        .send()
        .await
        .unwrap();
    assert_eq!(wrong.status(), 401);

    let authorized = client
        .get(format!("{base}/instances"))
        .header("x-api-key", "top-secret")
        .send()
        .await
        .unwrap();
    assert_eq!(authorized.status(), 200);

    // Health stays public.
    let health = reqwest::get(format!("{base}/health")).await.unwrap();
    assert_eq!(health.status(), 200);
}
