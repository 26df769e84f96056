use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{ws::WebSocket, Path, Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use notifier_core::{ConnectError, NotificationEngine, NotifierError, WsBackend};
use serde::{Deserialize, Serialize};
use shared::{
    domain::{LinkState, Role, Session, SessionId, TopicId, UiContext, UnreadEntry},
    error::{ApiError, ErrorCode},
};
use storage::Storage;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

mod app_state;
mod config;

use app_state::AppState;
use config::{load_settings, prepare_database_url};

type ApiResult<T> = Result<T, (StatusCode, Json<ApiError>)>;

#[derive(Debug, Deserialize)]
struct StartSessionRequest {
    #[serde(default)]
    session_id: Option<String>,
    /// Parsed with the same aliases as the `/unread/:role` segments.
    role: String,
    identity_code: String,
    display_name: String,
    #[serde(default)]
    email_address: Option<String>,
    credential: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct SessionResponse {
    session_id: SessionId,
    state: LinkState,
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    session_id: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;
    let backend = WsBackend::new(&settings.backend_url)?;
    let engine = NotificationEngine::new(
        Arc::new(backend),
        Arc::new(storage.clone()),
        settings.engine_settings(),
    );

    let state = AppState {
        engine: Arc::new(engine),
        storage,
    };
    let app = build_router(Arc::new(state.clone()));

    let addr: SocketAddr = settings.bind_addr.parse()?;
    info!(%addr, backend_url = %settings.backend_url, "gateway listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    state.engine.shutdown().await;
    info!("gateway stopped");
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/sessions", post(start_session))
        .route("/sessions/:session_id", get(session_state).delete(stop_session))
        .route("/sessions/:session_id/ui-context", put(set_ui_context))
        .route("/unread/:role", get(list_unread))
        .route("/unread/:role/:topic_id", get(unread_count))
        .route("/unread/:role/:topic_id/read", post(mark_read))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

fn api_error(
    status: StatusCode,
    code: ErrorCode,
    message: impl Into<String>,
) -> (StatusCode, Json<ApiError>) {
    (status, Json(ApiError::new(code, message)))
}

fn notifier_error(err: NotifierError) -> (StatusCode, Json<ApiError>) {
    let message = err.to_string();
    match err {
        NotifierError::Connect(ConnectError::AuthRejected(_)) => {
            api_error(StatusCode::UNAUTHORIZED, ErrorCode::Unauthorized, message)
        }
        NotifierError::Connect(ConnectError::Unreachable(_)) => {
            api_error(StatusCode::BAD_GATEWAY, ErrorCode::Unavailable, message)
        }
        NotifierError::UnknownSession(_) => {
            api_error(StatusCode::NOT_FOUND, ErrorCode::NotFound, message)
        }
        NotifierError::Store(_) => {
            error!(%message, "unread store failure");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, ErrorCode::Internal, message)
        }
    }
}

fn parse_role(raw: &str) -> ApiResult<Role> {
    Role::parse(raw).ok_or_else(|| {
        api_error(
            StatusCode::BAD_REQUEST,
            ErrorCode::Validation,
            format!("unknown role '{raw}'"),
        )
    })
}

fn unknown_session(session_id: &SessionId) -> (StatusCode, Json<ApiError>) {
    notifier_error(NotifierError::UnknownSession(session_id.clone()))
}

async fn healthz(State(state): State<Arc<AppState>>) -> Response {
    match state.storage.health_check().await {
        Ok(()) => "ok".into_response(),
        Err(err) => {
            warn!(%err, "health check failed");
            api_error(StatusCode::SERVICE_UNAVAILABLE, ErrorCode::Unavailable, err.to_string())
                .into_response()
        }
    }
}

async fn start_session(
    State(state): State<Arc<AppState>>,
    Json(req): Json<StartSessionRequest>,
) -> ApiResult<(StatusCode, Json<SessionResponse>)> {
    if req.credential.trim().is_empty() || req.identity_code.trim().is_empty() {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            ErrorCode::Validation,
            "credential and identity_code are required",
        ));
    }
    let role = parse_role(&req.role)?;
    let session_id = req
        .session_id
        .filter(|id| !id.trim().is_empty())
        .map(SessionId::new)
        .unwrap_or_else(|| SessionId::new(Uuid::new_v4().to_string()));
    let session = Session {
        session_id: session_id.clone(),
        role,
        identity_code: req.identity_code,
        display_name: req.display_name,
        email_address: req.email_address,
        credential: req.credential,
    };

    let connection = state.engine.start(session).await.map_err(notifier_error)?;
    Ok((
        StatusCode::CREATED,
        Json(SessionResponse {
            session_id,
            state: connection.state(),
        }),
    ))
}

async fn session_state(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<SessionResponse>> {
    let session_id = SessionId::new(session_id);
    let link_state = state
        .engine
        .connection_state(&session_id)
        .await
        .ok_or_else(|| unknown_session(&session_id))?;
    Ok(Json(SessionResponse {
        session_id,
        state: link_state,
    }))
}

async fn stop_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> ApiResult<StatusCode> {
    let session_id = SessionId::new(session_id);
    if !state.engine.stop(&session_id).await {
        return Err(unknown_session(&session_id));
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn set_ui_context(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Json(context): Json<UiContext>,
) -> ApiResult<StatusCode> {
    state
        .engine
        .set_ui_context(&SessionId::new(session_id), context)
        .await
        .map_err(notifier_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_unread(
    State(state): State<Arc<AppState>>,
    Path(role): Path<String>,
) -> ApiResult<Json<Vec<UnreadEntry>>> {
    let role = parse_role(&role)?;
    let entries = state
        .engine
        .list_unread(role)
        .await
        .map_err(notifier_error)?;
    Ok(Json(entries))
}

async fn unread_count(
    State(state): State<Arc<AppState>>,
    Path((role, topic_id)): Path<(String, String)>,
) -> ApiResult<Json<UnreadEntry>> {
    let role = parse_role(&role)?;
    let topic_id = TopicId::new(topic_id);
    let count = state
        .engine
        .get_unread_count(role, &topic_id)
        .await
        .map_err(notifier_error)?;
    Ok(Json(UnreadEntry {
        role,
        topic_id,
        count,
    }))
}

async fn mark_read(
    State(state): State<Arc<AppState>>,
    Path((role, topic_id)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    let role = parse_role(&role)?;
    state
        .engine
        .mark_read(role, &TopicId::new(topic_id))
        .await
        .map_err(notifier_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(q): Query<WsQuery>,
) -> ApiResult<Response> {
    let session_id = SessionId::new(q.session_id);
    if state.engine.connection(&session_id).await.is_none() {
        return Err(unknown_session(&session_id));
    }
    Ok(ws.on_upgrade(move |socket| ws_connection(state, socket, session_id)))
}

async fn ws_connection(state: Arc<AppState>, socket: WebSocket, session_id: SessionId) {
    use axum::extract::ws::Message;
    use futures::{future, SinkExt, StreamExt};

    let (mut sender, mut receiver) = socket.split();
    let filter_id = session_id.clone();
    let mut events = BroadcastStream::new(state.engine.subscribe_events())
        .filter_map(move |event| {
            future::ready(match event {
                Ok(event) if event.session_id() == &filter_id => Some(event),
                Ok(_) => None,
                Err(err) => {
                    warn!(%err, "ui stream lagged behind engine events");
                    None
                }
            })
        })
        .boxed();
    info!(%session_id, "ui stream attached");

    let send_task = tokio::spawn(async move {
        while let Some(event) = events.next().await {
            let text = match serde_json::to_string(&event) {
                Ok(v) => v,
                Err(_) => continue,
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(_msg)) = receiver.next().await {}

    send_task.abort();
    info!(%session_id, "ui stream detached");
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
