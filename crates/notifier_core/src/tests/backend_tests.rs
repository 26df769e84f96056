use super::*;
use std::collections::HashMap;

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocketUpgrade},
        Path, Query,
    },
    http::{HeaderMap, StatusCode as HttpStatus},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use shared::domain::Role;
use tokio::net::TcpListener;

const GOOD_TOKEN: &str = "good-token";

fn authorized(headers: &HeaderMap) -> bool {
    let expected = format!("Bearer {GOOD_TOKEN}");
    headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        == Some(expected.as_str())
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    if params.get("token").map(String::as_str) != Some(GOOD_TOKEN) {
        return HttpStatus::UNAUTHORIZED.into_response();
    }
    ws.on_upgrade(|mut socket| async move {
        let frames = vec![
            "not json at all".to_string(),
            serde_json::to_string(&BackendEvent::TopicCreated {
                topic: TopicSummary::new("T3"),
            })
            .expect("encode topic"),
            serde_json::json!({
                "type": "message",
                "payload": { "id": "m-1", "topicId": "T3", "body": "hi" }
            })
            .to_string(),
        ];
        for frame in frames {
            if socket.send(WsMessage::Text(frame)).await.is_err() {
                return;
            }
        }
        let _ = socket.send(WsMessage::Close(None)).await;
    })
}

async fn topics_handler(
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Vec<TopicSummary>>, HttpStatus> {
    if !authorized(&headers) {
        return Err(HttpStatus::UNAUTHORIZED);
    }
    if params.get("role").map(String::as_str) != Some("agent")
        || params.get("identity_code").map(String::as_str) != Some("EQ1")
    {
        return Ok(Json(Vec::new()));
    }
    Ok(Json(vec![TopicSummary::new("T1"), TopicSummary::new("T2")]))
}

async fn join_handler(
    headers: HeaderMap,
    Path(topic_id): Path<String>,
) -> Result<Json<JoinResponse>, HttpStatus> {
    if !authorized(&headers) {
        return Err(HttpStatus::UNAUTHORIZED);
    }
    Ok(Json(JoinResponse {
        local_participant_id: Some(format!("me@{topic_id}")),
    }))
}

async fn spawn_backend() -> String {
    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/topics", get(topics_handler))
        .route("/topics/:topic_id/join", post(join_handler));
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    format!("http://{addr}")
}

fn selector() -> IdentitySelector {
    IdentitySelector {
        role: Role::Agent,
        identity_code: "EQ1".to_string(),
    }
}

#[test]
fn rejects_non_http_base_urls() {
    assert!(WsBackend::new("ftp://example.com").is_err());
    assert!(WsBackend::new("not a url").is_err());
}

#[test]
fn websocket_url_follows_base_scheme() {
    let backend = WsBackend::new("https://chat.example.com/api/").expect("backend");
    let url = backend.ws_url("abc 123").expect("ws url");
    assert_eq!(url.scheme(), "wss");
    assert_eq!(url.path(), "/api/ws");
    assert_eq!(url.query(), Some("token=abc+123"));
}

#[tokio::test]
async fn authenticate_streams_decoded_frames_until_close() {
    let base = spawn_backend().await;
    let backend = WsBackend::new(&base).expect("backend");

    let stream = backend.authenticate(GOOD_TOKEN).await.expect("connect");
    let frames: Vec<BackendEvent> = stream
        .map(|frame| frame.expect("frame"))
        .collect()
        .await;

    assert_eq!(frames.len(), 2);
    match &frames[0] {
        BackendEvent::TopicCreated { topic } => assert_eq!(topic.topic_id.as_str(), "T3"),
        other => panic!("unexpected frame: {other:?}"),
    }
    match &frames[1] {
        BackendEvent::Message(raw) => assert_eq!(raw["id"], "m-1"),
        other => panic!("unexpected frame: {other:?}"),
    }
}

#[tokio::test]
async fn bad_credential_is_reported_as_auth_rejection() {
    let base = spawn_backend().await;
    let backend = WsBackend::new(&base).expect("backend");

    let err = backend
        .authenticate("stolen-token")
        .await
        .err()
        .expect("handshake should fail");
    assert!(matches!(err, ConnectError::AuthRejected(_)), "{err}");
}

#[tokio::test]
async fn unreachable_backend_is_not_an_auth_rejection() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    drop(listener);
    let backend = WsBackend::new(&format!("http://{addr}")).expect("backend");

    let err = backend
        .authenticate(GOOD_TOKEN)
        .await
        .err()
        .expect("nothing is listening");
    assert!(matches!(err, ConnectError::Unreachable(_)), "{err}");
}

#[tokio::test]
async fn discover_and_join_use_bearer_credential() {
    let base = spawn_backend().await;
    let backend = WsBackend::new(&base).expect("backend");

    let topics = backend
        .discover_topics(GOOD_TOKEN, &selector())
        .await
        .expect("discover");
    let ids: Vec<&str> = topics.iter().map(|topic| topic.topic_id.as_str()).collect();
    assert_eq!(ids, vec!["T1", "T2"]);

    let joined = backend
        .join(GOOD_TOKEN, &TopicId::new("T1"))
        .await
        .expect("join");
    assert_eq!(joined.local_participant_id.as_deref(), Some("me@T1"));

    assert!(backend
        .discover_topics("stolen-token", &selector())
        .await
        .is_err());
}
