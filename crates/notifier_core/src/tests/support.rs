use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use shared::{
    domain::{IdentitySelector, Role, Session, SessionId, TopicId},
    protocol::{BackendEvent, EngineEvent, JoinResponse, TopicSummary},
};
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::{
    backend::{EventStream, MessagingBackend},
    config::EngineSettings,
    error::ConnectError,
};

/// In-process backend whose push stream is driven by the test.
#[derive(Default)]
pub struct FakeBackend {
    topics: Mutex<Vec<TopicSummary>>,
    rejected: Mutex<HashSet<String>>,
    unreachable: Mutex<bool>,
    discover_delay: Mutex<Duration>,
    feeds: Mutex<Vec<mpsc::UnboundedSender<Result<BackendEvent>>>>,
    pub authentications: AtomicUsize,
    pub discoveries: AtomicUsize,
}

impl FakeBackend {
    pub fn with_topics(topics: &[&str]) -> Arc<Self> {
        let backend = Self::default();
        backend.set_topics(topics);
        Arc::new(backend)
    }

    pub fn set_topics(&self, topics: &[&str]) {
        *self.topics.lock().expect("topics") =
            topics.iter().map(|topic| TopicSummary::new(*topic)).collect();
    }

    pub fn reject(&self, credential: &str) {
        self.rejected
            .lock()
            .expect("rejected")
            .insert(credential.to_string());
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        *self.unreachable.lock().expect("unreachable") = unreachable;
    }

    pub fn set_discover_delay(&self, delay: Duration) {
        *self.discover_delay.lock().expect("delay") = delay;
    }

    /// Pushes a frame on the most recent connection.
    pub fn push(&self, frame: BackendEvent) {
        let feeds = self.feeds.lock().expect("feeds");
        let feed = feeds.last().expect("no connection was authenticated");
        // A stopped connection has dropped its receiver; the frame is lost.
        let _ = feed.send(Ok(frame));
    }

    pub fn push_message(&self, raw: Value) {
        self.push(BackendEvent::Message(raw));
    }

    /// Ends every open push stream, as a transport drop would.
    pub fn drop_connections(&self) {
        self.feeds.lock().expect("feeds").clear();
    }

    pub fn fail_transport(&self) {
        let feeds = self.feeds.lock().expect("feeds");
        if let Some(feed) = feeds.last() {
            let _ = feed.send(Err(anyhow!("connection reset by peer")));
        }
    }
}

#[async_trait]
impl MessagingBackend for FakeBackend {
    async fn authenticate(&self, credential: &str) -> Result<EventStream, ConnectError> {
        self.authentications.fetch_add(1, Ordering::SeqCst);
        if self.rejected.lock().expect("rejected").contains(credential) {
            return Err(ConnectError::AuthRejected("401 Unauthorized".to_string()));
        }
        if *self.unreachable.lock().expect("unreachable") {
            return Err(ConnectError::Unreachable("connection refused".to_string()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.feeds.lock().expect("feeds").push(tx);
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn discover_topics(
        &self,
        _credential: &str,
        _selector: &IdentitySelector,
    ) -> Result<Vec<TopicSummary>> {
        self.discoveries.fetch_add(1, Ordering::SeqCst);
        let delay = *self.discover_delay.lock().expect("delay");
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(self.topics.lock().expect("topics").clone())
    }

    async fn join(&self, _credential: &str, topic_id: &TopicId) -> Result<JoinResponse> {
        Ok(JoinResponse {
            local_participant_id: Some(format!("local-{topic_id}")),
        })
    }
}

pub fn fast_settings() -> EngineSettings {
    EngineSettings {
        reconnect_initial_backoff: Duration::from_millis(5),
        reconnect_max_backoff: Duration::from_millis(20),
        max_reconnect_attempts: 3,
        discovery_timeout: Duration::from_millis(200),
        join_timeout: Duration::from_millis(200),
        stop_grace: Duration::from_millis(500),
        ..EngineSettings::default()
    }
}

pub fn agent_session(id: &str) -> Session {
    Session {
        session_id: SessionId::new(id),
        role: Role::Agent,
        identity_code: "EQ1".to_string(),
        display_name: "Jane Coach".to_string(),
        email_address: Some("jane@example.com".to_string()),
        credential: format!("token-{id}"),
    }
}

pub fn customer_message(id: &str, topic: &str) -> Value {
    json!({
        "id": id,
        "topicId": topic,
        "senderName": "Carol",
        "senderRole": "customer",
        "senderCode": "C-12",
        "text": "Is anyone there?"
    })
}

/// Waits for the first engine event matching `predicate`.
pub async fn next_matching<F>(
    events: &mut broadcast::Receiver<EngineEvent>,
    mut predicate: F,
) -> EngineEvent
where
    F: FnMut(&EngineEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(event) if predicate(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("engine event bus closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for engine event")
}
