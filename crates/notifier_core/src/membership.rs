use std::{collections::HashSet, sync::Arc, time::Duration};

use shared::{
    domain::{Session, TopicId},
    protocol::TopicSummary,
};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::backend::MessagingBackend;

/// Topics one connection is entitled to be notified about.
///
/// A topic counts as a member as soon as it is discovered or announced; the
/// join round trip only resolves the local participant id and never gates
/// notification eligibility.
#[derive(Debug, Default)]
pub struct MembershipTracker {
    topics: HashSet<TopicId>,
    joined: HashSet<TopicId>,
    joining: HashSet<TopicId>,
}

impl MembershipTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, topic_id: &TopicId) -> bool {
        self.topics.contains(topic_id)
    }

    /// Returns `true` when the topic was not tracked yet.
    pub fn insert(&mut self, topic_id: TopicId) -> bool {
        self.topics.insert(topic_id)
    }

    pub fn len(&self) -> usize {
        self.topics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }

    pub fn topics(&self) -> impl Iterator<Item = &TopicId> {
        self.topics.iter()
    }

    pub fn is_joined(&self, topic_id: &TopicId) -> bool {
        self.joined.contains(topic_id)
    }

    /// Marks a join as in flight. Returns `false` when the topic is already
    /// joined or being joined, making repeated joins a no-op.
    pub fn begin_join(&mut self, topic_id: &TopicId) -> bool {
        if self.joined.contains(topic_id) || self.joining.contains(topic_id) {
            return false;
        }
        self.joining.insert(topic_id.clone());
        true
    }

    pub fn complete_join(&mut self, topic_id: &TopicId, confirmed: bool) {
        self.joining.remove(topic_id);
        if confirmed {
            self.joined.insert(topic_id.clone());
        }
    }

    pub fn clear(&mut self) {
        self.topics.clear();
        self.joined.clear();
        self.joining.clear();
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinOutcome {
    pub topic_id: TopicId,
    pub confirmed: bool,
    pub local_participant_id: Option<String>,
}

/// Lists the session's topics. Timeouts and backend errors yield an empty
/// list: the connection stays up without notifications until a later
/// discovery or a topic-created push.
pub async fn discover_topics(
    backend: &dyn MessagingBackend,
    session: &Session,
    limit: Duration,
) -> Vec<TopicSummary> {
    let selector = session.identity_selector();
    match timeout(limit, backend.discover_topics(&session.credential, &selector)).await {
        Ok(Ok(topics)) => {
            info!(
                session_id = %session.session_id,
                topic_count = topics.len(),
                "membership: discovery completed"
            );
            topics
        }
        Ok(Err(err)) => {
            warn!(session_id = %session.session_id, %err, "membership: discovery failed");
            Vec::new()
        }
        Err(_) => {
            warn!(
                session_id = %session.session_id,
                timeout_ms = limit.as_millis() as u64,
                "membership: discovery timed out"
            );
            Vec::new()
        }
    }
}

pub async fn join_topic(
    backend: Arc<dyn MessagingBackend>,
    credential: String,
    topic_id: TopicId,
    limit: Duration,
) -> JoinOutcome {
    match timeout(limit, backend.join(&credential, &topic_id)).await {
        Ok(Ok(response)) => {
            debug!(%topic_id, local_participant_id = ?response.local_participant_id, "membership: joined topic");
            JoinOutcome {
                topic_id,
                confirmed: true,
                local_participant_id: response.local_participant_id,
            }
        }
        Ok(Err(err)) => {
            warn!(%topic_id, %err, "membership: join failed");
            JoinOutcome {
                topic_id,
                confirmed: false,
                local_participant_id: None,
            }
        }
        Err(_) => {
            warn!(%topic_id, "membership: join timed out");
            JoinOutcome {
                topic_id,
                confirmed: false,
                local_participant_id: None,
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/membership_tests.rs"]
mod tests;
