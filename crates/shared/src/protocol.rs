use serde::{Deserialize, Serialize};

use crate::{
    domain::{LinkState, QualifyingEvent, Role, SessionId, TopicId},
    error::ApiError,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantSummary {
    pub participant_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicSummary {
    pub topic_id: TopicId,
    #[serde(default)]
    pub participants: Vec<ParticipantSummary>,
}

impl TopicSummary {
    pub fn new(topic_id: impl Into<TopicId>) -> Self {
        Self {
            topic_id: topic_id.into(),
            participants: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_participant_id: Option<String>,
}

/// Frames pushed by the messaging backend over the multiplexed connection.
///
/// Message payloads stay untyped here: the backend only guarantees a topic
/// identifier and best-effort sender attributes, so they are normalized by
/// the engine rather than rejected at deserialization time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum BackendEvent {
    TopicCreated { topic: TopicSummary },
    Message(serde_json::Value),
    Error(ApiError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum EngineEvent {
    Connected {
        session_id: SessionId,
        topic_count: usize,
    },
    Reconnecting {
        session_id: SessionId,
        attempt: u32,
    },
    Disconnected {
        session_id: SessionId,
        reason: String,
    },
    StateChanged {
        session_id: SessionId,
        state: LinkState,
    },
    Qualifying(QualifyingEvent),
}

impl EngineEvent {
    pub fn session_id(&self) -> &SessionId {
        match self {
            EngineEvent::Connected { session_id, .. }
            | EngineEvent::Reconnecting { session_id, .. }
            | EngineEvent::Disconnected { session_id, .. }
            | EngineEvent::StateChanged { session_id, .. } => session_id,
            EngineEvent::Qualifying(event) => &event.session_id,
        }
    }
}
