//! Integration tests for the REST surface: health, presence snapshot,
//! and notification listing.

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

use workroom_server::chat::presence::PresenceTracker;
use workroom_server::state::AppState;

struct TestServer {
    base_url: String,
    addr: SocketAddr,
    state: AppState,
}

async fn start_test_server() -> TestServer {
    let tmp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let data_dir = tmp_dir.path().to_str().unwrap().to_string();

    let db = workroom_server::db::init_db(&data_dir).expect("Failed to init DB");
    let jwt_secret = workroom_server::auth::jwt::load_or_generate_jwt_secret(&data_dir)
        .expect("Failed to generate JWT secret");

    let state = AppState {
        db,
        jwt_secret,
        connections: workroom_server::ws::new_connection_registry(),
        presence: Arc::new(PresenceTracker::new()),
    };

    let app = workroom_server::routes::build_router(state.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
        let _keep = tmp_dir;
    });

    TestServer {
        base_url: format!("http://{}", addr),
        addr,
        state,
    }
}

fn seed_fixture(state: &AppState) {
    let conn = state.db.lock().unwrap();
    conn.execute_batch(
        "INSERT INTO users (id, display_name) VALUES
             ('alice', 'Alice'), ('bob', 'Bob'), ('carol', 'Carol');
         INSERT INTO projects (id, name) VALUES ('p1', 'Apollo');
         INSERT INTO project_members (project_id, user_id, role) VALUES
             ('p1', 'alice', 'owner'), ('p1', 'bob', 'member');",
    )
    .unwrap();
}

fn token(state: &AppState, user_id: &str) -> String {
    workroom_server::auth::jwt::issue_access_token(&state.jwt_secret, user_id)
        .expect("Failed to issue token")
}

/// Open a socket, join a project, and wait for the join echo so presence
/// is settled before the HTTP call under test.
async fn connect_and_join(
    addr: SocketAddr,
    token: &str,
    project_id: &str,
) -> tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>> {
    let url = format!("ws://{}/ws?token={}", addr, token);
    let (mut stream, _) = tokio_tungstenite::connect_async(&url)
        .await
        .expect("Failed to connect to WebSocket");

    stream
        .send(Message::Text(
            json!({"type": "join_project", "projectId": project_id})
                .to_string()
                .into(),
        ))
        .await
        .expect("Failed to send join");

    loop {
        let msg = tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .expect("Timed out waiting for join echo")
            .expect("Stream ended")
            .expect("WebSocket error");
        if let Message::Text(text) = msg {
            let event: Value = serde_json::from_str(&text).unwrap();
            if event["type"] == "user_online" {
                return stream;
            }
            panic!("Unexpected event before join echo: {event}");
        }
    }
}

#[tokio::test]
async fn health_returns_ok() {
    let server = start_test_server().await;

    let resp = reqwest::get(format!("{}/health", server.base_url))
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "ok");
}

#[tokio::test]
async fn online_endpoint_reflects_presence() {
    let server = start_test_server().await;
    seed_fixture(&server.state);
    let client = reqwest::Client::new();

    let url = format!("{}/api/projects/p1/online", server.base_url);

    // Empty room before anyone joins
    let resp = client
        .get(&url)
        .bearer_auth(token(&server.state, "bob"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["projectId"], "p1");
    assert_eq!(body["online"], json!([]));

    let _alice_ws = connect_and_join(server.addr, &token(&server.state, "alice"), "p1").await;

    let resp = client
        .get(&url)
        .bearer_auth(token(&server.state, "bob"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["online"], json!(["alice"]));
}

#[tokio::test]
async fn online_endpoint_requires_membership() {
    let server = start_test_server().await;
    seed_fixture(&server.state);
    let client = reqwest::Client::new();

    let url = format!("{}/api/projects/p1/online", server.base_url);

    // No token
    let resp = client.get(&url).send().await.unwrap();
    assert_eq!(resp.status(), 401);

    // Valid token, not a member
    let resp = client
        .get(&url)
        .bearer_auth(token(&server.state, "carol"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);
}

#[tokio::test]
async fn notifications_listing_returns_persisted_mentions() {
    let server = start_test_server().await;
    seed_fixture(&server.state);
    let client = reqwest::Client::new();

    // Bob mentions alice over the socket; the notification is persisted
    // whether or not alice is connected
    let mut bob_ws = connect_and_join(server.addr, &token(&server.state, "bob"), "p1").await;
    bob_ws
        .send(Message::Text(
            json!({
                "type": "send_message",
                "projectId": "p1",
                "content": "ready for review @alice",
                "mentions": ["alice"]
            })
            .to_string()
            .into(),
        ))
        .await
        .unwrap();

    // Wait for the broadcast so persistence has definitely completed
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(2), bob_ws.next())
            .await
            .expect("Timed out waiting for broadcast")
            .expect("Stream ended")
            .expect("WebSocket error");
        if let Message::Text(text) = msg {
            let event: Value = serde_json::from_str(&text).unwrap();
            if event["type"] == "new_message" {
                break;
            }
        }
    }
    // Notification insert runs after the broadcast; give it a moment
    tokio::time::sleep(Duration::from_millis(200)).await;

    let resp = client
        .get(format!("{}/api/notifications", server.base_url))
        .bearer_auth(token(&server.state, "alice"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    let items = body.as_array().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["type"], "PROJECT_MENTION");
    assert_eq!(items[0]["projectId"], "p1");
    assert_eq!(items[0]["senderId"], "bob");
    assert_eq!(items[0]["message"], "ready for review @alice");

    // The sender has no notifications of their own
    let resp = client
        .get(format!("{}/api/notifications", server.base_url))
        .bearer_auth(token(&server.state, "bob"))
        .send()
        .await
        .unwrap();
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body.as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn notifications_listing_requires_auth() {
    let server = start_test_server().await;

    let resp = reqwest::get(format!("{}/api/notifications", server.base_url))
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
}
