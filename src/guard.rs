//! The inbound security pipeline.
//!
//! Every command or callback passes the guard before any business logic runs:
//! blocked actors are turned away, the request is counted against the sliding
//! window, and the text is classified. Hostile input and rate abuse are
//! recorded as violations and feed the threat responder.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::ValidationError;
use crate::rate_limit::RateLimiter;
use crate::roles::ActorIdentity;
use crate::threat::{Decision, DecisionReason, ThreatResponder, ThreatStats};
use crate::validation::{InputContext, ThreatCategory, ValidationEngine};

/// Security counters exposed to privileged actors.
#[derive(Debug, Clone, Serialize)]
pub struct SecurityStats {
    #[serde(flatten)]
    pub threats: ThreatStats,
    pub rate_windows: usize,
}

pub struct Guard {
    engine: ValidationEngine,
    limiter: RateLimiter,
    responder: ThreatResponder,
}

impl Guard {
    pub fn new(engine: ValidationEngine, limiter: RateLimiter, responder: ThreatResponder) -> Self {
        Self {
            engine,
            limiter,
            responder,
        }
    }

    pub fn engine(&self) -> &ValidationEngine {
        &self.engine
    }

    pub fn responder(&self) -> &ThreatResponder {
        &self.responder
    }

    /// Admit or refuse one request from `actor`.
    ///
    /// Blocked actors are refused without touching their request window.
    pub fn check(&self, actor: &ActorIdentity, now: DateTime<Utc>) -> Decision {
        if actor.is_privileged() {
            return Decision::allow(DecisionReason::Exempt);
        }

        let decision = self.responder.check(actor, now);
        if !decision.allow {
            debug!(actor = actor.id, "Request from blocked actor refused");
            return decision;
        }

        match self.limiter.hit(actor.id, now) {
            Ok(()) => decision,
            Err(exceeded) => {
                warn!(
                    actor = actor.id,
                    retry_after_secs = exceeded.retry_after.num_seconds(),
                    "Rate limit exceeded"
                );
                let after = self
                    .responder
                    .record_violation(actor, ThreatCategory::RateAbuse, now);
                let retry_after = after
                    .retry_after
                    .map_or(exceeded.retry_after, |r| r.max(exceeded.retry_after));
                Decision::deny(DecisionReason::RateLimited, Some(retry_after))
            }
        }
    }

    /// Record a violation against `actor`.
    pub fn record_violation(
        &self,
        actor: &ActorIdentity,
        category: ThreatCategory,
        now: DateTime<Utc>,
    ) -> Decision {
        self.responder.record_violation(actor, category, now)
    }

    /// Classify `text` and penalize the actor if it is hostile.
    pub fn screen(
        &self,
        actor: &ActorIdentity,
        text: &str,
        context: InputContext,
        now: DateTime<Utc>,
    ) -> Decision {
        match self.engine.validate(text, context) {
            Ok(()) => Decision::allow(DecisionReason::Allowed),
            Err(err) => self.reject(actor, &err, now),
        }
    }

    /// Turn a validation failure into a deny decision, recording a violation
    /// when the input was hostile.
    pub fn reject(
        &self,
        actor: &ActorIdentity,
        err: &ValidationError,
        now: DateTime<Utc>,
    ) -> Decision {
        let retry_after = if err.category.is_hostile() {
            warn!(
                actor = actor.id,
                category = err.category.as_str(),
                rule = err.rule.as_deref().unwrap_or(""),
                "Hostile input rejected"
            );
            self.responder
                .record_violation(actor, err.category, now)
                .retry_after
        } else {
            debug!(actor = actor.id, "Malformed input rejected");
            None
        };
        Decision::deny(DecisionReason::Rejected(err.category), retry_after)
    }

    /// Lift every restriction on `actor`.
    pub fn unblock(&self, actor: i64) -> bool {
        self.limiter.reset(actor);
        self.responder.unblock(actor)
    }

    pub fn stats(&self, now: DateTime<Utc>) -> SecurityStats {
        SecurityStats {
            threats: self.responder.stats(now),
            rate_windows: self.limiter.tracked_actors(),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::rate_limit::RateLimitConfig;
    use crate::roles::Role;
    use crate::threat::ThreatPolicy;

    fn guard(max_requests: usize) -> Guard {
        Guard::new(
            ValidationEngine::default(),
            RateLimiter::new(RateLimitConfig {
                max_requests,
                ..RateLimitConfig::default()
            }),
            ThreatResponder::new(ThreatPolicy::default()),
        )
    }

    #[test]
    fn test_rate_abuse_is_denied_and_recorded() {
        let guard = guard(2);
        let actor = ActorIdentity::new(10, Role::Member);
        let now = Utc::now();

        assert!(guard.check(&actor, now).allow);
        assert!(guard.check(&actor, now).allow);

        let denied = guard.check(&actor, now);
        assert!(!denied.allow);
        assert_eq!(denied.reason, DecisionReason::RateLimited);
        assert_eq!(denied.retry_after, Some(Duration::seconds(60)));
        assert_eq!(guard.responder().violations(10, now).len(), 1);
    }

    #[test]
    fn test_repeated_injection_blocks_actor() {
        let guard = guard(100);
        let actor = ActorIdentity::new(11, Role::Member);
        let now = Utc::now();

        for _ in 0..3 {
            let d = guard.screen(&actor, "1; DROP TABLE users", InputContext::System, now);
            assert_eq!(d.reason, DecisionReason::Rejected(ThreatCategory::SqlPattern));
        }
        assert!(guard.check(&actor, now).allow);

        let d = guard.screen(&actor, "' or '1'='1", InputContext::System, now);
        assert!(d.retry_after.is_some());

        let blocked = guard.check(&actor, now + Duration::seconds(1));
        assert_eq!(blocked.reason, DecisionReason::Blocked);
    }

    #[test]
    fn test_typos_do_not_count() {
        let guard = guard(100);
        let actor = ActorIdentity::new(12, Role::Member);
        let now = Utc::now();

        for _ in 0..10 {
            let d = guard.screen(&actor, "twelve", InputContext::Numeric, now);
            assert!(!d.allow);
        }
        assert!(guard.responder().violations(12, now).is_empty());
    }

    #[test]
    fn test_privileged_bypasses_everything() {
        let guard = guard(1);
        let boss = ActorIdentity::new(1, Role::Privileged);
        let now = Utc::now();

        for _ in 0..10 {
            assert!(guard.check(&boss, now).allow);
            guard.screen(&boss, "rm -rf /", InputContext::System, now);
        }
        assert!(guard.check(&boss, now).allow);
    }

    #[test]
    fn test_unblock_restores_access() {
        let guard = guard(1);
        let actor = ActorIdentity::new(13, Role::Member);
        let now = Utc::now();

        guard.check(&actor, now);
        for _ in 0..5 {
            guard.record_violation(&actor, ThreatCategory::XssPattern, now);
        }
        assert!(!guard.check(&actor, now).allow);

        assert!(guard.unblock(13));
        assert!(guard.check(&actor, now).allow);
    }
}
