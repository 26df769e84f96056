use std::sync::Arc;

use shared::{
    domain::{LinkState, QualifyingEvent, Role, Session, SessionId, TopicId, UiContext, UnreadEntry},
    protocol::EngineEvent,
};
use storage::UnreadStore;
use tokio::sync::broadcast;
use tracing::info;

pub mod backend;
pub mod config;
pub mod dedup;
pub mod error;
pub mod identity;
pub mod membership;
pub mod normalize;
pub mod router;
pub mod sinks;
pub mod supervisor;

pub use backend::{EventStream, MessagingBackend, WsBackend};
pub use config::EngineSettings;
pub use error::{ConnectError, NotifierError};
pub use sinks::{DispatchReport, NotificationSink, SinkDispatcher};
pub use supervisor::{Connection, ConnectionSupervisor, QualifyingCallback};

/// Entry point for the UI layer: session lifecycle, screen context, unread
/// counters and qualifying-event callbacks.
pub struct NotificationEngine {
    supervisor: ConnectionSupervisor,
    unread: Arc<dyn UnreadStore>,
}

impl NotificationEngine {
    /// Engine whose unread-counter sink writes to `unread`; the audible,
    /// banner and OS sinks are left to the UI layer's callbacks.
    pub fn new(
        backend: Arc<dyn MessagingBackend>,
        unread: Arc<dyn UnreadStore>,
        settings: EngineSettings,
    ) -> Self {
        let dispatcher = SinkDispatcher::with_defaults(Arc::clone(&unread));
        Self::with_dispatcher(backend, unread, dispatcher, settings)
    }

    pub fn with_dispatcher(
        backend: Arc<dyn MessagingBackend>,
        unread: Arc<dyn UnreadStore>,
        dispatcher: SinkDispatcher,
        settings: EngineSettings,
    ) -> Self {
        Self {
            supervisor: ConnectionSupervisor::new(backend, Arc::new(dispatcher), settings),
            unread,
        }
    }

    pub async fn start(&self, session: Session) -> Result<Connection, NotifierError> {
        info!(
            session_id = %session.session_id,
            role = %session.role,
            "engine: starting session"
        );
        self.supervisor.start(session).await
    }

    pub async fn start_with_context(
        &self,
        session: Session,
        ui_context: UiContext,
    ) -> Result<Connection, NotifierError> {
        info!(
            session_id = %session.session_id,
            role = %session.role,
            "engine: starting session"
        );
        self.supervisor.start_with_context(session, ui_context).await
    }

    pub async fn stop(&self, session_id: &SessionId) -> bool {
        self.supervisor.stop(session_id).await
    }

    pub async fn set_ui_context(
        &self,
        session_id: &SessionId,
        context: UiContext,
    ) -> Result<(), NotifierError> {
        self.supervisor.set_ui_context(session_id, context).await
    }

    pub async fn get_unread_count(
        &self,
        role: Role,
        topic_id: &TopicId,
    ) -> Result<i64, NotifierError> {
        self.unread
            .count(role, topic_id)
            .await
            .map_err(NotifierError::Store)
    }

    /// Resets the counter. This is the only way a counter ever goes down.
    pub async fn mark_read(&self, role: Role, topic_id: &TopicId) -> Result<(), NotifierError> {
        self.unread
            .mark_read(role, topic_id)
            .await
            .map_err(NotifierError::Store)?;
        info!(%role, %topic_id, "engine: topic marked read");
        Ok(())
    }

    pub async fn list_unread(&self, role: Role) -> Result<Vec<UnreadEntry>, NotifierError> {
        self.unread.list(role).await.map_err(NotifierError::Store)
    }

    /// Registers a callback invoked once for every event that survives
    /// routing and selects at least one sink.
    pub async fn on_qualifying_event<F>(&self, callback: F)
    where
        F: Fn(&QualifyingEvent) + Send + Sync + 'static,
    {
        self.supervisor.on_qualifying_event(Arc::new(callback)).await;
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.supervisor.subscribe_events()
    }

    pub async fn connection(&self, session_id: &SessionId) -> Option<Connection> {
        self.supervisor.connection(session_id).await
    }

    pub async fn connection_state(&self, session_id: &SessionId) -> Option<LinkState> {
        self.supervisor.connection_state(session_id).await
    }

    pub async fn active_sessions(&self) -> Vec<SessionId> {
        self.supervisor.active_sessions().await
    }

    pub async fn shutdown(&self) {
        self.supervisor.stop_all().await;
    }
}

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
