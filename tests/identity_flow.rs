mod support;

use automagik_omni::identity::IdentityService;
use automagik_omni::router::InboundOutcome;
use serde_json::json;
use support::{discord_text_event, whatsapp_text_event, TestGateway};
use wiremock::matchers::{method, path};
use wiremock::{Mock, ResponseTemplate};

#[tokio::test]
async fn linked_discord_sender_forwards_the_shared_user_id() {
    let gw = TestGateway::new().await;
    gw.add_discord_instance("d1").await;

    // User U has a WhatsApp identity and a Discord link on instance d1.
    let user = IdentityService::get_or_create_by_phone(&gw.pool, "5511999", None, None)
        .await
        .unwrap();
    IdentityService::link_external(&gw.pool, &user.id, "discord", "42", Some("d1"))
        .await
        .unwrap();

    Mock::given(method("POST"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "message": "hello U" })))
        .mount(&gw.agent)
        .await;
    Mock::given(method("POST"))
        .and(path("/channels/777/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "out-1" })))
        .mount(&gw.discord)
        .await;

    let outcome = gw
        .router
        .route_inbound("d1", &discord_text_event("42", "777", "hi from discord"))
        .await;
    assert_eq!(outcome, InboundOutcome::Received);

    let requests = gw.agent.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(body["user_id"], json!(user.id), "must forward U.id, not nil");
}

#[tokio::test]
async fn unlinked_discord_sender_forwards_without_user_id() {
    let gw = TestGateway::new().await;
    gw.add_discord_instance("d1").await;

    Mock::given(method("POST"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "message": "who?" })))
        .mount(&gw.agent)
        .await;
    Mock::given(method("POST"))
        .and(path("/channels/777/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "out-1" })))
        .mount(&gw.discord)
        .await;

    let outcome = gw
        .router
        .route_inbound("d1", &discord_text_event("404", "777", "hello"))
        .await;
    assert_eq!(outcome, InboundOutcome::Received);

    let requests = gw.agent.received_requests().await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert!(body.get("user_id").is_none(), "unlinked sender stays nil");

    // No Discord user is auto-created.
    let users: Vec<(String,)> = sqlx::query_as("SELECT id FROM users")
        .fetch_all(&gw.pool)
        .await
        .unwrap();
    assert!(users.is_empty());
}

#[tokio::test]
async fn whatsapp_first_contact_creates_and_reuses_user() {
    let gw = TestGateway::new().await;
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

    for id in ["M1", "M2"] {
        gw.router
            .route_inbound("acme", &whatsapp_text_event("acme", "5511999", id, "oi"))
            .await;
    }

    let users: Vec<(String,)> = sqlx::query_as("SELECT id FROM users")
        .fetch_all(&gw.pool)
        .await
        .unwrap();
    assert_eq!(users.len(), 1, "second contact reuses the same user");

    let requests = gw.agent.received_requests().await.unwrap();
    let first: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
    let second: serde_json::Value = serde_json::from_slice(&requests[1].body).unwrap();
    assert_eq!(first["user_id"], second["user_id"]);
}

#[tokio::test]
async fn agent_user_id_links_known_user_for_discord_sender() {
    let gw = TestGateway::new().await;
    gw.add_discord_instance("d1").await;

    // The agent knows this sender as an existing local user.
    let user = IdentityService::get_or_create_by_phone(&gw.pool, "5511999", None, None)
        .await
        .unwrap();

    Mock::given(method("POST"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "message": "recognized you",
            "agent_user_id": user.id,
        })))
        .mount(&gw.agent)
        .await;
    Mock::given(method("POST"))
        .and(path("/channels/777/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "out-1" })))
        .mount(&gw.discord)
        .await;

    gw.router
        .route_inbound("d1", &discord_text_event("42", "777", "it's me"))
        .await;

    // The cross-channel handshake provisioned the link.
    let resolved = IdentityService::resolve_external(&gw.pool, "discord", "42", Some("d1"))
        .await
        .unwrap()
        .expect("link must exist after agent handshake");
    assert_eq!(resolved.id, user.id);
}
