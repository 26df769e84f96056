use super::*;
use std::sync::Mutex as StdMutex;

use anyhow::Result;
use async_trait::async_trait;
use axum::{body, body::Body, http::Request};
use futures::StreamExt;
use notifier_core::{EngineSettings, EventStream, MessagingBackend};
use shared::{
    domain::IdentitySelector,
    protocol::{BackendEvent, EngineEvent, JoinResponse, TopicSummary},
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tower::ServiceExt;

const REJECTED: &str = "expired-token";
const UNREACHABLE: &str = "offline-token";

#[derive(Default)]
struct StubBackend {
    feeds: StdMutex<Vec<mpsc::UnboundedSender<Result<BackendEvent>>>>,
}

impl StubBackend {
    fn push_message(&self, raw: serde_json::Value) {
        if let Some(feed) = self.feeds.lock().expect("feeds").last() {
            let _ = feed.send(Ok(BackendEvent::Message(raw)));
        }
    }
}

#[async_trait]
impl MessagingBackend for StubBackend {
    async fn authenticate(&self, credential: &str) -> Result<EventStream, ConnectError> {
        match credential {
            REJECTED => Err(ConnectError::AuthRejected("401 Unauthorized".to_string())),
            UNREACHABLE => Err(ConnectError::Unreachable("connection refused".to_string())),
            _ => {
                let (tx, rx) = mpsc::unbounded_channel();
                self.feeds.lock().expect("feeds").push(tx);
                Ok(UnboundedReceiverStream::new(rx).boxed())
            }
        }
    }

    async fn discover_topics(
        &self,
        _credential: &str,
        _selector: &IdentitySelector,
    ) -> Result<Vec<TopicSummary>> {
        Ok(vec![TopicSummary::new("T1"), TopicSummary::new("T2")])
    }

    async fn join(&self, _credential: &str, topic_id: &TopicId) -> Result<JoinResponse> {
        Ok(JoinResponse {
            local_participant_id: Some(format!("local-{topic_id}")),
        })
    }
}

async fn test_app() -> (Router, Arc<AppState>, Arc<StubBackend>) {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let backend = Arc::new(StubBackend::default());
    let engine = NotificationEngine::new(
        backend.clone(),
        Arc::new(storage.clone()),
        EngineSettings::default(),
    );
    let state = Arc::new(AppState {
        engine: Arc::new(engine),
        storage,
    });
    (build_router(state.clone()), state, backend)
}

fn start_request(session_id: &str, credential: &str) -> Request<Body> {
    start_request_as(session_id, "agent", credential)
}

fn start_request_as(session_id: &str, role: &str, credential: &str) -> Request<Body> {
    Request::post("/sessions")
        .header("content-type", "application/json")
        .body(Body::from(
            serde_json::json!({
                "session_id": session_id,
                "role": role,
                "identity_code": "EQ1",
                "display_name": "Jane Coach",
                "email_address": "jane@example.com",
                "credential": credential,
            })
            .to_string(),
        ))
        .expect("request")
}

async fn json_body<T: serde::de::DeserializeOwned>(response: Response) -> T {
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    serde_json::from_slice(&bytes).expect("json")
}

#[tokio::test]
async fn healthz_reports_ok_when_storage_is_ready() {
    let (app, _state, _backend) = test_app().await;
    let request = Request::get("/healthz")
        .body(Body::empty())
        .expect("request");
    let response = app.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let body = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    assert_eq!(body.as_ref(), b"ok");
}

#[tokio::test]
async fn session_lifecycle_routes_work() {
    let (app, state, _backend) = test_app().await;

    let response = app
        .clone()
        .oneshot(start_request("s1", "good-token"))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::CREATED);
    let started: SessionResponse = json_body(response).await;
    assert_eq!(started.session_id, SessionId::new("s1"));

    let mut connection = state
        .engine
        .connection(&SessionId::new("s1"))
        .await
        .expect("connection");
    assert!(connection.wait_for(LinkState::Active).await);

    let response = app
        .clone()
        .oneshot(
            Request::get("/sessions/s1")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let current: SessionResponse = json_body(response).await;
    assert_eq!(current.state, LinkState::Active);

    let response = app
        .clone()
        .oneshot(
            Request::put("/sessions/s1/ui-context")
                .header("content-type", "application/json")
                .body(Body::from(
                    serde_json::json!({
                        "currently_viewed_topic_id": "T1",
                        "app_visibility": "background"
                    })
                    .to_string(),
                ))
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = app
        .clone()
        .oneshot(
            Request::delete("/sessions/s1")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = app
        .oneshot(
            Request::delete("/sessions/s1")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let error: ApiError = json_body(response).await;
    assert_eq!(error.code, ErrorCode::NotFound);
}

#[tokio::test]
async fn start_maps_connection_errors_to_status_codes() {
    let (app, _state, _backend) = test_app().await;

    let rejected = app
        .clone()
        .oneshot(start_request("s1", REJECTED))
        .await
        .expect("response");
    assert_eq!(rejected.status(), StatusCode::UNAUTHORIZED);
    let error: ApiError = json_body(rejected).await;
    assert_eq!(error.code, ErrorCode::Unauthorized);

    let unreachable = app
        .clone()
        .oneshot(start_request("s2", UNREACHABLE))
        .await
        .expect("response");
    assert_eq!(unreachable.status(), StatusCode::BAD_GATEWAY);

    let missing = app
        .oneshot(
            Request::get("/sessions/s1")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn blank_credential_is_a_validation_error() {
    let (app, _state, _backend) = test_app().await;
    let response = app
        .oneshot(start_request("s1", "  "))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let error: ApiError = json_body(response).await;
    assert_eq!(error.code, ErrorCode::Validation);
}

#[tokio::test]
async fn session_role_accepts_the_same_aliases_as_unread_paths() {
    let (app, state, _backend) = test_app().await;

    let response = app
        .clone()
        .oneshot(start_request_as("s1", "Support", "good-token"))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::CREATED);
    assert!(state
        .engine
        .connection(&SessionId::new("s1"))
        .await
        .is_some());

    let response = app
        .oneshot(start_request_as("s2", "robot", "good-token"))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let error: ApiError = json_body(response).await;
    assert_eq!(error.code, ErrorCode::Validation);
}

#[tokio::test]
async fn ui_context_for_unknown_session_is_not_found() {
    let (app, _state, _backend) = test_app().await;
    let response = app
        .oneshot(
            Request::put("/sessions/ghost/ui-context")
                .header("content-type", "application/json")
                .body(Body::from("{}"))
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn unread_routes_read_and_reset_counters() {
    let (app, state, _backend) = test_app().await;
    let topic = TopicId::new("T1");
    state
        .storage
        .increment_unread(Role::Agent, &topic)
        .await
        .expect("increment");
    state
        .storage
        .increment_unread(Role::Agent, &topic)
        .await
        .expect("increment");

    let response = app
        .clone()
        .oneshot(
            Request::get("/unread/agent/T1")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let entry: UnreadEntry = json_body(response).await;
    assert_eq!(entry.count, 2);

    let response = app
        .clone()
        .oneshot(
            Request::get("/unread/agent")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    let entries: Vec<UnreadEntry> = json_body(response).await;
    assert_eq!(entries.len(), 1);

    let response = app
        .clone()
        .oneshot(
            Request::post("/unread/agent/T1/read")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(
        state
            .storage
            .unread_count(Role::Agent, &topic)
            .await
            .expect("count"),
        0
    );

    let response = app
        .oneshot(
            Request::get("/unread/robot/T1")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn websocket_streams_the_sessions_qualifying_events() {
    let (app, state, backend) = test_app().await;
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });

    let session = Session {
        session_id: SessionId::new("s1"),
        role: Role::Agent,
        identity_code: "EQ1".to_string(),
        display_name: "Jane Coach".to_string(),
        email_address: None,
        credential: "good-token".to_string(),
    };
    let mut connection = state.engine.start(session).await.expect("start");
    assert!(connection.wait_for(LinkState::Active).await);

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws?session_id=s1"))
        .await
        .expect("connect ui stream");
    // The upgrade completes before the stream task subscribes; give it a beat.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    backend.push_message(serde_json::json!({
        "id": "m-1",
        "topicId": "T2",
        "senderName": "Carol",
        "text": "hello"
    }));

    let frame = tokio::time::timeout(std::time::Duration::from_secs(5), async {
        loop {
            let message = ws.next().await.expect("frame").expect("ws frame");
            if let tokio_tungstenite::tungstenite::Message::Text(text) = message {
                let event: EngineEvent = serde_json::from_str(&text).expect("engine event");
                if let EngineEvent::Qualifying(event) = event {
                    return event;
                }
            }
        }
    })
    .await
    .expect("qualifying event");

    assert_eq!(frame.session_id, SessionId::new("s1"));
    assert_eq!(frame.event.topic_id, TopicId::new("T2"));
    assert_eq!(
        state
            .storage
            .unread_count(Role::Agent, &TopicId::new("T2"))
            .await
            .expect("count"),
        1
    );
}
