use std::{
    collections::HashMap,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Weak,
    },
};

use chrono::Utc;
use futures::StreamExt;
use shared::{
    domain::{LinkState, QualifyingEvent, Session, SessionId, TopicId, UiContext},
    protocol::{BackendEvent, EngineEvent, TopicSummary},
};
use tokio::{
    sync::{broadcast, watch, Mutex, RwLock},
    task::{JoinHandle, JoinSet},
    time::{sleep, timeout},
};
use tracing::{debug, error, info, warn};

use crate::{
    backend::{EventStream, MessagingBackend},
    config::EngineSettings,
    dedup::Deduplicator,
    error::{ConnectError, NotifierError},
    membership::{self, JoinOutcome},
    normalize::normalize_event,
    router::{ConnectionContext, DeliveryRouter, RouteDecision, RoutingPolicy},
    sinks::SinkDispatcher,
};

pub type QualifyingCallback = Arc<dyn Fn(&QualifyingEvent) + Send + Sync>;

type ConnectionMap = Mutex<HashMap<SessionId, ActiveConnection>>;

/// Caller-side view of one supervised connection.
#[derive(Clone)]
pub struct Connection {
    session_id: SessionId,
    state: watch::Receiver<LinkState>,
}

impl Connection {
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    /// Waits until the connection reaches `target`. Returns `false` if the
    /// connection was released first.
    pub async fn wait_for(&mut self, target: LinkState) -> bool {
        self.state.wait_for(|state| *state == target).await.is_ok()
    }
}

struct ActiveConnection {
    generation: u64,
    connection: Connection,
    ui_context: watch::Sender<UiContext>,
    shutdown: watch::Sender<bool>,
    gate: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl ActiveConnection {
    async fn teardown(mut self, grace: std::time::Duration) {
        // Close the gate before the worker can observe shutdown so no sink
        // fires for frames still buffered in the transport.
        self.gate.store(false, Ordering::Release);
        let _ = self.shutdown.send(true);
        if timeout(grace, &mut self.task).await.is_err() {
            warn!(
                session_id = %self.connection.session_id,
                "supervisor: connection task ignored shutdown, aborting"
            );
            self.task.abort();
        }
    }
}

/// Owns every session's connection: authentication, discovery, reconnects and
/// teardown. Each connection runs as its own task with private routing state.
pub struct ConnectionSupervisor {
    backend: Arc<dyn MessagingBackend>,
    dispatcher: Arc<SinkDispatcher>,
    router: DeliveryRouter,
    settings: EngineSettings,
    connections: Arc<ConnectionMap>,
    generations: AtomicU64,
    callbacks: Arc<RwLock<Vec<QualifyingCallback>>>,
    events: broadcast::Sender<EngineEvent>,
}

impl ConnectionSupervisor {
    pub fn new(
        backend: Arc<dyn MessagingBackend>,
        dispatcher: Arc<SinkDispatcher>,
        settings: EngineSettings,
    ) -> Self {
        let (events, _) = broadcast::channel(settings.event_buffer.max(1));
        let router = DeliveryRouter::new(RoutingPolicy {
            constrained_platform: settings.constrained_platform,
            preview_chars: settings.preview_chars,
        });
        Self {
            backend,
            dispatcher,
            router,
            settings,
            connections: Arc::new(Mutex::new(HashMap::new())),
            generations: AtomicU64::new(0),
            callbacks: Arc::new(RwLock::new(Vec::new())),
            events,
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub async fn on_qualifying_event(&self, callback: QualifyingCallback) {
        self.callbacks.write().await.push(callback);
    }

    /// Opens the session's connection, replacing any previous one.
    ///
    /// Authentication failures are returned to the caller and leave nothing
    /// running; discovery problems are absorbed by the connection task. A
    /// replaced connection hands its UI context over to the new one.
    pub async fn start(&self, session: Session) -> Result<Connection, NotifierError> {
        self.start_connection(session, None).await
    }

    /// Like [`start`](Self::start), with the UI context in place before the
    /// first event is routed.
    pub async fn start_with_context(
        &self,
        session: Session,
        ui_context: UiContext,
    ) -> Result<Connection, NotifierError> {
        self.start_connection(session, Some(ui_context)).await
    }

    async fn start_connection(
        &self,
        session: Session,
        ui_context: Option<UiContext>,
    ) -> Result<Connection, NotifierError> {
        let session_id = session.session_id.clone();
        let previous = self.connections.lock().await.remove(&session_id);
        let carried = previous
            .as_ref()
            .map(|active| active.ui_context.borrow().clone());
        if let Some(previous) = previous {
            previous.teardown(self.settings.stop_grace).await;
            info!(%session_id, "supervisor: replaced existing connection");
        }
        let ui_context = ui_context.or(carried).unwrap_or_default();

        let (state_tx, state_rx) = watch::channel(LinkState::Connecting);
        let _ = self.events.send(EngineEvent::StateChanged {
            session_id: session_id.clone(),
            state: LinkState::Connecting,
        });

        let stream = match self.backend.authenticate(&session.credential).await {
            Ok(stream) => stream,
            Err(err) => {
                warn!(%session_id, %err, "supervisor: connection failed");
                state_tx.send_replace(LinkState::Disconnected);
                let _ = self.events.send(EngineEvent::Disconnected {
                    session_id,
                    reason: err.to_string(),
                });
                return Err(err.into());
            }
        };

        let gate = Arc::new(AtomicBool::new(true));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (ui_tx, ui_rx) = watch::channel(ui_context);
        let generation = self.generations.fetch_add(1, Ordering::Relaxed);

        let worker = ConnectionWorker {
            session,
            backend: Arc::clone(&self.backend),
            dispatcher: Arc::clone(&self.dispatcher),
            router: self.router.clone(),
            settings: self.settings.clone(),
            callbacks: Arc::clone(&self.callbacks),
            events: self.events.clone(),
            state: state_tx,
            gate: Arc::clone(&gate),
            ui_context: ui_rx,
            registry: Arc::downgrade(&self.connections),
            generation,
        };

        // Held across the spawn so a worker that ends at once cannot try to
        // release its entry before it is inserted.
        let mut connections = self.connections.lock().await;
        let task = tokio::spawn(worker.run(stream, shutdown_rx));

        let connection = Connection {
            session_id: session_id.clone(),
            state: state_rx,
        };
        let active = ActiveConnection {
            generation,
            connection: connection.clone(),
            ui_context: ui_tx,
            shutdown: shutdown_tx,
            gate,
            task,
        };

        let previous = connections.insert(session_id.clone(), active);
        drop(connections);
        if let Some(previous) = previous {
            // A concurrent start for the same session won the race to insert.
            previous.teardown(self.settings.stop_grace).await;
        }

        Ok(connection)
    }

    /// Tears the session's connection down. Returns `false` if none existed.
    pub async fn stop(&self, session_id: &SessionId) -> bool {
        let Some(active) = self.connections.lock().await.remove(session_id) else {
            return false;
        };
        active.teardown(self.settings.stop_grace).await;
        info!(%session_id, "supervisor: connection stopped");
        true
    }

    pub async fn stop_all(&self) {
        let drained: Vec<ActiveConnection> = {
            let mut guard = self.connections.lock().await;
            guard.drain().map(|(_, active)| active).collect()
        };
        for active in drained {
            active.teardown(self.settings.stop_grace).await;
        }
    }

    pub async fn set_ui_context(
        &self,
        session_id: &SessionId,
        context: UiContext,
    ) -> Result<(), NotifierError> {
        let guard = self.connections.lock().await;
        let active = guard
            .get(session_id)
            .ok_or_else(|| NotifierError::UnknownSession(session_id.clone()))?;
        active.ui_context.send_replace(context);
        Ok(())
    }

    pub async fn connection(&self, session_id: &SessionId) -> Option<Connection> {
        let guard = self.connections.lock().await;
        guard.get(session_id).map(|active| active.connection.clone())
    }

    pub async fn connection_state(&self, session_id: &SessionId) -> Option<LinkState> {
        self.connection(session_id)
            .await
            .map(|connection| connection.state())
    }

    /// Sessions whose connection has not reached its terminal state.
    pub async fn active_sessions(&self) -> Vec<SessionId> {
        let guard = self.connections.lock().await;
        let mut sessions: Vec<SessionId> = guard
            .values()
            .filter(|active| active.connection.state() != LinkState::Disconnected)
            .map(|active| active.connection.session_id.clone())
            .collect();
        sessions.sort();
        sessions
    }
}

enum StreamEnd {
    Stopped,
    Lost(String),
}

struct ConnectionWorker {
    session: Session,
    backend: Arc<dyn MessagingBackend>,
    dispatcher: Arc<SinkDispatcher>,
    router: DeliveryRouter,
    settings: EngineSettings,
    callbacks: Arc<RwLock<Vec<QualifyingCallback>>>,
    events: broadcast::Sender<EngineEvent>,
    state: watch::Sender<LinkState>,
    gate: Arc<AtomicBool>,
    ui_context: watch::Receiver<UiContext>,
    registry: Weak<ConnectionMap>,
    generation: u64,
}

impl ConnectionWorker {
    async fn run(self, mut stream: EventStream, mut shutdown: watch::Receiver<bool>) {
        let mut context = ConnectionContext::new(Deduplicator::new(self.settings.dedup_window));
        let mut sequence: u64 = 0;

        let reason = loop {
            context.reset_for_reconnect();
            let mut joins: JoinSet<JoinOutcome> = JoinSet::new();

            self.set_state(LinkState::Discovering);
            let discovered = tokio::select! {
                biased;
                _ = shutdown.changed() => break "stopped".to_string(),
                topics = membership::discover_topics(
                    self.backend.as_ref(),
                    &self.session,
                    self.settings.discovery_timeout,
                ) => topics,
            };
            for summary in &discovered {
                self.admit_topic(&mut context, &mut joins, summary);
            }

            self.set_state(LinkState::Active);
            let _ = self.events.send(EngineEvent::Connected {
                session_id: self.session.session_id.clone(),
                topic_count: context.membership.len(),
            });

            let end = loop {
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => break StreamEnd::Stopped,
                    Some(joined) = joins.join_next(), if !joins.is_empty() => match joined {
                        Ok(outcome) => self.record_join(&mut context, outcome),
                        Err(err) => warn!(session_id = %self.session.session_id, %err, "membership: join task failed"),
                    },
                    frame = stream.next() => match frame {
                        Some(Ok(event)) => {
                            self.handle_frame(&mut context, &mut joins, event, &mut sequence).await;
                        }
                        Some(Err(err)) => break StreamEnd::Lost(err.to_string()),
                        None => break StreamEnd::Lost("backend closed the connection".to_string()),
                    },
                }
            };
            // Dropping the set aborts joins still in flight.
            drop(joins);

            let lost = match end {
                StreamEnd::Stopped => break "stopped".to_string(),
                StreamEnd::Lost(lost) => lost,
            };
            warn!(session_id = %self.session.session_id, reason = %lost, "supervisor: connection lost");

            match self.reconnect(&mut shutdown).await {
                Ok(next) => stream = next,
                Err(reason) => break reason,
            }
        };

        self.gate.store(false, Ordering::Release);
        self.release().await;
        self.set_state(LinkState::Disconnected);
        let _ = self.events.send(EngineEvent::Disconnected {
            session_id: self.session.session_id.clone(),
            reason,
        });
    }

    /// Drops this connection's entry from the supervisor unless a newer
    /// connection for the session already replaced it.
    async fn release(&self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let mut connections = registry.lock().await;
        let owned = connections
            .get(&self.session.session_id)
            .is_some_and(|active| active.generation == self.generation);
        if owned {
            connections.remove(&self.session.session_id);
        }
    }

    async fn reconnect(&self, shutdown: &mut watch::Receiver<bool>) -> Result<EventStream, String> {
        for attempt in 1..=self.settings.max_reconnect_attempts {
            self.set_state(LinkState::Reconnecting);
            let _ = self.events.send(EngineEvent::Reconnecting {
                session_id: self.session.session_id.clone(),
                attempt,
            });

            let delay = self.settings.backoff_for(attempt);
            tokio::select! {
                biased;
                _ = shutdown.changed() => return Err("stopped".to_string()),
                _ = sleep(delay) => {}
            }

            let result = tokio::select! {
                biased;
                _ = shutdown.changed() => return Err("stopped".to_string()),
                result = self.backend.authenticate(&self.session.credential) => result,
            };
            match result {
                Ok(stream) => {
                    info!(session_id = %self.session.session_id, attempt, "supervisor: reconnected");
                    return Ok(stream);
                }
                Err(ConnectError::AuthRejected(reason)) => {
                    warn!(session_id = %self.session.session_id, %reason, "supervisor: credential rejected on reconnect");
                    return Err(format!("authentication rejected: {reason}"));
                }
                Err(ConnectError::Unreachable(reason)) => {
                    debug!(session_id = %self.session.session_id, attempt, %reason, "supervisor: reconnect attempt failed");
                }
            }
        }
        Err(format!(
            "gave up after {} reconnect attempts",
            self.settings.max_reconnect_attempts
        ))
    }

    fn set_state(&self, state: LinkState) {
        self.state.send_replace(state);
        let _ = self.events.send(EngineEvent::StateChanged {
            session_id: self.session.session_id.clone(),
            state,
        });
    }

    fn admit_topic(
        &self,
        context: &mut ConnectionContext,
        joins: &mut JoinSet<JoinOutcome>,
        summary: &TopicSummary,
    ) {
        context.identity.seed_participants(summary);
        context.membership.insert(summary.topic_id.clone());
        self.spawn_join(context, joins, summary.topic_id.clone());
    }

    fn spawn_join(
        &self,
        context: &mut ConnectionContext,
        joins: &mut JoinSet<JoinOutcome>,
        topic_id: TopicId,
    ) {
        if !context.membership.begin_join(&topic_id) {
            return;
        }
        joins.spawn(membership::join_topic(
            Arc::clone(&self.backend),
            self.session.credential.clone(),
            topic_id,
            self.settings.join_timeout,
        ));
    }

    fn record_join(&self, context: &mut ConnectionContext, outcome: JoinOutcome) {
        context
            .membership
            .complete_join(&outcome.topic_id, outcome.confirmed);
        if let Some(participant_id) = outcome.local_participant_id {
            context
                .identity
                .record_local_participant(outcome.topic_id, participant_id);
        }
    }

    async fn handle_frame(
        &self,
        context: &mut ConnectionContext,
        joins: &mut JoinSet<JoinOutcome>,
        frame: BackendEvent,
        sequence: &mut u64,
    ) {
        match frame {
            BackendEvent::TopicCreated { topic } => {
                info!(
                    session_id = %self.session.session_id,
                    topic_id = %topic.topic_id,
                    "membership: topic created"
                );
                self.admit_topic(context, joins, &topic);
            }
            BackendEvent::Message(raw) => {
                *sequence += 1;
                self.handle_message(context, &raw, *sequence).await;
            }
            BackendEvent::Error(err) => {
                warn!(
                    session_id = %self.session.session_id,
                    code = ?err.code,
                    message = %err.message,
                    "backend reported an error"
                );
            }
        }
    }

    async fn handle_message(
        &self,
        context: &mut ConnectionContext,
        raw: &serde_json::Value,
        sequence: u64,
    ) {
        let Some(event) = normalize_event(raw, Utc::now(), sequence) else {
            warn!(
                session_id = %self.session.session_id,
                "dropping message that names no topic"
            );
            return;
        };

        let ui = self.ui_context.borrow().clone();
        let sinks = match self.router.decide(context, &event, &self.session, &ui) {
            RouteDecision::Discard(reason) => {
                debug!(
                    session_id = %self.session.session_id,
                    topic_id = %event.topic_id,
                    event_key = %event.event_id,
                    ?reason,
                    "router: event discarded"
                );
                return;
            }
            RouteDecision::Deliver(sinks) => sinks,
        };
        if sinks.is_empty() {
            debug!(
                session_id = %self.session.session_id,
                topic_id = %event.topic_id,
                "router: topic is on screen, nothing to deliver"
            );
            return;
        }
        if !self.gate.load(Ordering::Acquire) {
            return;
        }

        let report = self.dispatcher.dispatch(&sinks).await;
        debug!(
            session_id = %self.session.session_id,
            event_key = %event.event_id,
            delivered = report.delivered,
            failed = report.failed.len(),
            "router: event dispatched"
        );

        let qualifying = QualifyingEvent {
            session_id: self.session.session_id.clone(),
            event,
            sinks,
        };
        for callback in self.callbacks.read().await.iter() {
            if catch_unwind(AssertUnwindSafe(|| callback(&qualifying))).is_err() {
                error!(
                    session_id = %self.session.session_id,
                    event_key = %qualifying.event.event_id,
                    "qualifying-event callback panicked"
                );
            }
        }
        let _ = self.events.send(EngineEvent::Qualifying(qualifying));
    }
}

#[cfg(test)]
#[path = "tests/supervisor_tests.rs"]
mod tests;
