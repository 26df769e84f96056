use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

id_newtype!(SessionId);
id_newtype!(TopicId);
id_newtype!(EventId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Customer,
    Agent,
    Admin,
}

impl Role {
    /// Agents and admins share the staff side of a conversation.
    pub fn is_staff(self) -> bool {
        matches!(self, Role::Agent | Role::Admin)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Customer => "customer",
            Role::Agent => "agent",
            Role::Admin => "admin",
        }
    }

    /// Lenient parse used for sender tags and path segments.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "customer" | "client" | "user" => Some(Role::Customer),
            "agent" | "staff" | "coach" | "support" => Some(Role::Agent),
            "admin" | "administrator" => Some(Role::Admin),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: SessionId,
    pub role: Role,
    pub identity_code: String,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email_address: Option<String>,
    pub credential: String,
}

impl Session {
    pub fn identity_selector(&self) -> IdentitySelector {
        IdentitySelector {
            role: self.role,
            identity_code: self.identity_code.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentitySelector {
    pub role: Role,
    pub identity_code: String,
}

/// Best-effort sender attributes; the backend populates any subset of them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderIdentity {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participant_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_id: EventId,
    /// True when `event_id` was composed locally because the backend sent none.
    #[serde(default)]
    pub synthesized_id: bool,
    pub topic_id: TopicId,
    pub sender: SenderIdentity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_display_name: Option<String>,
    pub body: serde_json::Value,
    pub arrived_at: DateTime<Utc>,
}

impl Event {
    /// Short plain-text rendering of the body for banners and OS notifications.
    pub fn preview(&self, max_chars: usize) -> String {
        let text = match &self.body {
            serde_json::Value::String(text) => text.clone(),
            serde_json::Value::Null => String::new(),
            serde_json::Value::Object(map) => map
                .get("text")
                .or_else(|| map.get("content"))
                .and_then(|value| value.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| "New message".to_string()),
            other => other.to_string(),
        };
        let text = text.trim();
        if text.chars().count() <= max_chars {
            return text.to_string();
        }
        let mut truncated: String = text.chars().take(max_chars.saturating_sub(1)).collect();
        truncated.push('…');
        truncated
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppVisibility {
    #[default]
    Foreground,
    Background,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UiContext {
    #[serde(default)]
    pub currently_viewed_topic_id: Option<TopicId>,
    #[serde(default)]
    pub app_visibility: AppVisibility,
    /// Whether the open topic view renders incoming messages live.
    #[serde(default = "default_live_view")]
    pub live_view: bool,
}

fn default_live_view() -> bool {
    true
}

impl Default for UiContext {
    fn default() -> Self {
        Self {
            currently_viewed_topic_id: None,
            app_visibility: AppVisibility::Foreground,
            live_view: true,
        }
    }
}

impl UiContext {
    pub fn is_viewing(&self, topic_id: &TopicId) -> bool {
        self.currently_viewed_topic_id.as_ref() == Some(topic_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkKind {
    Audible,
    Banner,
    OsNotification,
    UnreadCounter,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SinkInvocation {
    pub sink: SinkKind,
    pub role: Role,
    pub topic_id: TopicId,
    pub event_id: EventId,
    pub title: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualifyingEvent {
    pub session_id: SessionId,
    pub event: Event,
    pub sinks: Vec<SinkInvocation>,
}

impl QualifyingEvent {
    pub fn fires(&self, sink: SinkKind) -> bool {
        self.sinks.iter().any(|invocation| invocation.sink == sink)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Disconnected,
    Connecting,
    Discovering,
    Active,
    Reconnecting,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnreadEntry {
    pub role: Role,
    pub topic_id: TopicId,
    pub count: i64,
}
