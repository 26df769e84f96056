use std::time::Instant;

use shared::domain::{
    AppVisibility, Event, Session, SinkInvocation, SinkKind, UiContext,
};

use crate::{
    dedup::{Admission, Deduplicator},
    identity::{IdentityResolver, IdentityRule},
    membership::MembershipTracker,
};

/// Mutable routing state owned by a single connection.
///
/// The deduplicator spans the whole connection lifetime so replays after a
/// reconnect are still caught; membership and identity caches are rebuilt on
/// every fresh transport.
#[derive(Debug)]
pub struct ConnectionContext {
    pub membership: MembershipTracker,
    pub dedup: Deduplicator,
    pub identity: IdentityResolver,
}

impl ConnectionContext {
    pub fn new(dedup: Deduplicator) -> Self {
        Self {
            membership: MembershipTracker::new(),
            dedup,
            identity: IdentityResolver::new(),
        }
    }

    pub fn reset_for_reconnect(&mut self) {
        self.membership.clear();
        self.identity.clear();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    NotMember,
    Duplicate,
    SelfEcho(IdentityRule),
}

#[derive(Debug, Clone, PartialEq)]
pub enum RouteDecision {
    Discard(DiscardReason),
    /// The event qualified; the list is empty when the open view already
    /// shows it.
    Deliver(Vec<SinkInvocation>),
}

impl RouteDecision {
    pub fn into_sinks(self) -> Vec<SinkInvocation> {
        match self {
            RouteDecision::Discard(_) => Vec::new(),
            RouteDecision::Deliver(sinks) => sinks,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RoutingPolicy {
    pub constrained_platform: bool,
    pub preview_chars: usize,
}

impl Default for RoutingPolicy {
    fn default() -> Self {
        Self {
            constrained_platform: false,
            preview_chars: 140,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DeliveryRouter {
    policy: RoutingPolicy,
}

impl DeliveryRouter {
    pub fn new(policy: RoutingPolicy) -> Self {
        Self { policy }
    }

    pub fn route(
        &self,
        context: &mut ConnectionContext,
        event: &Event,
        session: &Session,
        ui: &UiContext,
    ) -> Vec<SinkInvocation> {
        self.decide(context, event, session, ui).into_sinks()
    }

    pub fn decide(
        &self,
        context: &mut ConnectionContext,
        event: &Event,
        session: &Session,
        ui: &UiContext,
    ) -> RouteDecision {
        self.decide_at(context, event, session, ui, Instant::now())
    }

    pub fn decide_at(
        &self,
        context: &mut ConnectionContext,
        event: &Event,
        session: &Session,
        ui: &UiContext,
        now: Instant,
    ) -> RouteDecision {
        if !context.membership.contains(&event.topic_id) {
            return RouteDecision::Discard(DiscardReason::NotMember);
        }
        if context.dedup.seen_at(&event.event_id, now) == Admission::Duplicate {
            return RouteDecision::Discard(DiscardReason::Duplicate);
        }
        if let Some(rule) = context.identity.classify(event, session) {
            return RouteDecision::Discard(DiscardReason::SelfEcho(rule));
        }

        let viewing = ui.is_viewing(&event.topic_id);
        let mut kinds = Vec::with_capacity(4);
        if !(viewing && ui.live_view) {
            match ui.app_visibility {
                AppVisibility::Foreground => {
                    kinds.push(SinkKind::Audible);
                    kinds.push(SinkKind::Banner);
                    if self.policy.constrained_platform {
                        kinds.push(SinkKind::OsNotification);
                    }
                }
                AppVisibility::Background => kinds.push(SinkKind::OsNotification),
            }
        }
        if !viewing {
            kinds.push(SinkKind::UnreadCounter);
        }

        let title = context
            .identity
            .sender_view(event)
            .display_name
            .unwrap_or("New message")
            .to_string();
        let body = event.preview(self.policy.preview_chars);

        RouteDecision::Deliver(
            kinds
                .into_iter()
                .map(|sink| SinkInvocation {
                    sink,
                    role: session.role,
                    topic_id: event.topic_id.clone(),
                    event_id: event.event_id.clone(),
                    title: title.clone(),
                    body: body.clone(),
                })
                .collect(),
        )
    }
}

#[cfg(test)]
#[path = "tests/router_tests.rs"]
mod tests;
