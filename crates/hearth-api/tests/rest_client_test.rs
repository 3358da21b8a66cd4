#![allow(clippy::unwrap_used)]
// Integration tests for `RemoteClient` using wiremock.

use secrecy::{ExposeSecret, SecretString};
use serde_json::json;
use url::Url;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use hearth_api::{Error, RemoteClient};

// ── Helpers ─────────────────────────────────────────────────────────

async fn setup() -> (MockServer, RemoteClient) {
    let server = MockServer::start().await;
    let base_url = Url::parse(&server.uri()).unwrap();
    let client = RemoteClient::with_client(reqwest::Client::new(), base_url, "/api");
    (server, client)
}

// ── Authentication tests ────────────────────────────────────────────

#[tokio::test]
async fn test_login_success() {
    let (server, client) = setup().await;

    Mock::given(method("POST"))
        .and(path("/api-token-auth/"))
        .and(body_json(json!({"username": "admin", "password": "hunter2"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"token": "tok-123"})))
        .mount(&server)
        .await;

    let password = SecretString::from("hunter2".to_string());
    let token = client.login("admin", &password).await.unwrap();
    assert_eq!(token.expose_secret(), "tok-123");
}

#[tokio::test]
async fn test_login_failure() {
    let (server, client) = setup().await;

    Mock::given(method("POST"))
        .and(path("/api-token-auth/"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "non_field_errors": ["Unable to log in with provided credentials."]
        })))
        .mount(&server)
        .await;

    let password = SecretString::from("wrong".to_string());
    let result = client.login("admin", &password).await;

    assert!(
        matches!(result, Err(Error::Authentication { .. })),
        "expected Authentication error, got: {result:?}"
    );
}

// ── Health probe ────────────────────────────────────────────────────

#[tokio::test]
async fn test_health_ok() {
    let (server, client) = setup().await;

    Mock::given(method("GET"))
        .and(path("/status/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "ok"})))
        .mount(&server)
        .await;

    client.health().await.unwrap();
}

#[tokio::test]
async fn test_health_unreachable() {
    let client = RemoteClient::with_client(
        reqwest::Client::new(),
        Url::parse("http://127.0.0.1:1").unwrap(),
        "/api",
    );

    let result = client.health().await;
    assert!(matches!(result, Err(Error::Transport(_))));
}

// ── Resource CRUD ───────────────────────────────────────────────────

#[tokio::test]
async fn test_fetch_list_sends_token_header() {
    let (server, client) = setup().await;

    Mock::given(method("GET"))
        .and(path("/api/devices"))
        .and(header("Authorization", "Token tok-123"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"uuid": "d1", "name": "Desk plug", "device_type": "plug"},
            {"uuid": "d2", "name": "Shelf light", "device_type": "light"}
        ])))
        .mount(&server)
        .await;

    let value = client.fetch("devices", None, "tok-123").await.unwrap();
    let list = value.as_array().unwrap();
    assert_eq!(list.len(), 2);
    assert_eq!(list[0]["uuid"], "d1");
}

#[tokio::test]
async fn test_fetch_single() {
    let (server, client) = setup().await;

    Mock::given(method("GET"))
        .and(path("/api/devices/d1"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"uuid": "d1", "name": "Desk plug", "plug": "p1"})),
        )
        .mount(&server)
        .await;

    let value = client.fetch("devices", Some("d1"), "tok-123").await.unwrap();
    assert_eq!(value["plug"], "p1");
}

#[tokio::test]
async fn test_fetch_error_status() {
    let (server, client) = setup().await;

    Mock::given(method("GET"))
        .and(path("/api/devices"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;

    let result = client.fetch("devices", None, "tok-123").await;
    assert!(
        matches!(result, Err(Error::RemoteApi { status: 500, .. })),
        "expected RemoteApi error, got: {result:?}"
    );
}

#[tokio::test]
async fn test_create_returns_created_resource() {
    let (server, client) = setup().await;

    Mock::given(method("POST"))
        .and(path("/api/plugs"))
        .respond_with(
            ResponseTemplate::new(201).set_body_json(json!({"uuid": "p9", "is_on": true})),
        )
        .mount(&server)
        .await;

    let created = client
        .create("plugs", &json!({"is_on": true}), "tok-123")
        .await
        .unwrap();
    assert_eq!(created["uuid"], "p9");
}

#[tokio::test]
async fn test_delete_accepts_204() {
    let (server, client) = setup().await;

    Mock::given(method("DELETE"))
        .and(path("/api/plugs/p9"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    client.delete("plugs", "p9", "tok-123").await.unwrap();
}
