//! Self-echo detection.
//!
//! No single sender attribute is reliably present on every event, so the
//! resolver walks an ordered list of rules from the most to the least
//! reliable signal and stops at the first match.

use std::collections::HashMap;

use shared::{
    domain::{Event, Role, Session, TopicId},
    protocol::{ParticipantSummary, TopicSummary},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdentityRule {
    /// Sender participant id equals the id the backend assigned us on join.
    LocalParticipant,
    Email,
    DisplayName,
    /// Same side of the conversation with the same team or customer code.
    RoleFallback,
}

pub const DEFAULT_RULES: [IdentityRule; 4] = [
    IdentityRule::LocalParticipant,
    IdentityRule::Email,
    IdentityRule::DisplayName,
    IdentityRule::RoleFallback,
];

/// Case-insensitive comparison of trimmed, non-empty values.
pub fn same_text(left: &str, right: &str) -> bool {
    let left = left.trim();
    let right = right.trim();
    !left.is_empty() && left.to_lowercase() == right.to_lowercase()
}

/// Sender attributes after filling gaps from the topic's participant list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SenderView<'a> {
    pub participant_id: Option<&'a str>,
    pub email: Option<&'a str>,
    pub display_name: Option<&'a str>,
    pub role: Option<Role>,
    pub code: Option<&'a str>,
}

impl SenderView<'_> {
    fn has_personal_signal(&self) -> bool {
        self.participant_id.is_some() || self.email.is_some() || self.display_name.is_some()
    }
}

impl IdentityRule {
    pub fn matches(
        self,
        sender: &SenderView<'_>,
        local_participant_id: Option<&str>,
        session: &Session,
    ) -> bool {
        match self {
            IdentityRule::LocalParticipant => match (sender.participant_id, local_participant_id)
            {
                (Some(theirs), Some(ours)) => theirs == ours,
                _ => false,
            },
            IdentityRule::Email => match (sender.email, session.email_address.as_deref()) {
                (Some(theirs), Some(ours)) => same_text(theirs, ours),
                _ => false,
            },
            IdentityRule::DisplayName => sender
                .display_name
                .is_some_and(|name| same_text(name, &session.display_name)),
            IdentityRule::RoleFallback => {
                let Some(sender_role) = sender.role else {
                    return false;
                };
                if session.role.is_staff() {
                    sender_role.is_staff()
                        && sender
                            .code
                            .is_some_and(|code| same_text(code, &session.identity_code))
                } else {
                    sender_role == Role::Customer
                        && match sender.code {
                            Some(code) => same_text(code, &session.identity_code),
                            None => !sender.has_personal_signal(),
                        }
                }
            }
        }
    }
}

/// Per-connection identity state: the rule order plus what joins and
/// discovery taught us about each topic's participants.
#[derive(Debug)]
pub struct IdentityResolver {
    rules: Vec<IdentityRule>,
    local_participants: HashMap<TopicId, String>,
    directory: HashMap<TopicId, HashMap<String, ParticipantSummary>>,
}

impl Default for IdentityResolver {
    fn default() -> Self {
        Self::with_rules(DEFAULT_RULES.to_vec())
    }
}

impl IdentityResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rules(rules: Vec<IdentityRule>) -> Self {
        Self {
            rules,
            local_participants: HashMap::new(),
            directory: HashMap::new(),
        }
    }

    pub fn rules(&self) -> &[IdentityRule] {
        &self.rules
    }

    pub fn record_local_participant(&mut self, topic_id: TopicId, participant_id: String) {
        self.local_participants.insert(topic_id, participant_id);
    }

    pub fn local_participant(&self, topic_id: &TopicId) -> Option<&str> {
        self.local_participants.get(topic_id).map(String::as_str)
    }

    pub fn seed_participants(&mut self, summary: &TopicSummary) {
        if summary.participants.is_empty() {
            return;
        }
        let entries = self.directory.entry(summary.topic_id.clone()).or_default();
        for participant in &summary.participants {
            entries.insert(participant.participant_id.clone(), participant.clone());
        }
    }

    pub fn sender_view<'a>(&'a self, event: &'a Event) -> SenderView<'a> {
        let known = event.sender.participant_id.as_deref().and_then(|id| {
            self.directory
                .get(&event.topic_id)
                .and_then(|participants| participants.get(id))
        });

        SenderView {
            participant_id: event.sender.participant_id.as_deref(),
            email: event
                .sender
                .email
                .as_deref()
                .or_else(|| known.and_then(|p| p.email.as_deref())),
            display_name: event
                .sender_display_name
                .as_deref()
                .or_else(|| known.and_then(|p| p.display_name.as_deref())),
            role: event.sender.role.or_else(|| known.and_then(|p| p.role)),
            code: event
                .sender
                .code
                .as_deref()
                .or_else(|| known.and_then(|p| p.code.as_deref())),
        }
    }

    /// The first rule that identifies the event as our own, if any.
    pub fn classify(&self, event: &Event, session: &Session) -> Option<IdentityRule> {
        let sender = self.sender_view(event);
        let local = self.local_participant(&event.topic_id);
        self.rules
            .iter()
            .copied()
            .find(|rule| rule.matches(&sender, local, session))
    }

    pub fn is_self(&self, event: &Event, session: &Session) -> bool {
        self.classify(event, session).is_some()
    }

    pub fn clear(&mut self) {
        self.local_participants.clear();
        self.directory.clear();
    }
}

#[cfg(test)]
#[path = "tests/identity_tests.rs"]
mod tests;
