//! Escalating response to repeated violations.
//!
//! Every actor moves through `clean → warned → blocked`. Violations are kept in
//! a sliding window; blocks grow with the actor's strike count and decay after
//! a clean period without violations. Privileged actors are exempt.

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::rate_limit::ActorTable;
use crate::roles::ActorIdentity;
use crate::validation::{Severity, ThreatCategory};

/// Escalation policy.
#[derive(Debug, Clone)]
pub struct ThreatPolicy {
    /// Width of the violation window.
    pub window: Duration,

    /// Violations in the window that move a clean actor to `warned`.
    pub warn_threshold: usize,

    /// Violations in the window that block from any state.
    pub block_threshold: usize,

    /// Duration of the first block.
    pub base_block: Duration,

    /// Upper bound on any block.
    pub max_block: Duration,

    /// Time without violations after which all state is forgotten.
    pub clean_period: Duration,
}

impl Default for ThreatPolicy {
    fn default() -> Self {
        Self {
            window: Duration::seconds(60),
            warn_threshold: 3,
            block_threshold: 5,
            base_block: Duration::minutes(5),
            max_block: Duration::hours(24),
            clean_period: Duration::hours(1),
        }
    }
}

impl ThreatPolicy {
    /// Block length for an actor that has already been blocked `strikes` times.
    pub fn block_duration(&self, strikes: u32) -> Duration {
        let base = self.base_block.num_seconds().max(1);
        let factor = 1_i64.checked_shl(strikes.min(62)).unwrap_or(i64::MAX);
        let secs = base
            .saturating_mul(factor)
            .min(self.max_block.num_seconds().max(base));
        Duration::seconds(secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreatState {
    #[default]
    Clean,
    Warned,
    Blocked,
}

/// One recorded violation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ViolationRecord {
    pub actor: i64,
    pub timestamp: DateTime<Utc>,
    pub category: ThreatCategory,
    pub severity: Severity,
}

/// Public view of an actor's block.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BlockState {
    pub actor: i64,
    pub blocked_until: Option<DateTime<Utc>>,
    pub strike_count: u32,
}

/// Why a decision was made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionReason {
    Allowed,
    /// Privileged actor; no checks apply.
    Exempt,
    /// Allowed, but one more violation blocks.
    Warned,
    Blocked,
    RateLimited,
    Rejected(ThreatCategory),
}

/// Allow/deny verdict for an actor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Decision {
    pub allow: bool,
    pub reason: DecisionReason,
    #[serde(skip)]
    pub retry_after: Option<Duration>,
}

impl Decision {
    pub fn allow(reason: DecisionReason) -> Self {
        Self {
            allow: true,
            reason,
            retry_after: None,
        }
    }

    pub fn deny(reason: DecisionReason, retry_after: Option<Duration>) -> Self {
        Self {
            allow: false,
            reason,
            retry_after,
        }
    }
}

#[derive(Debug, Default)]
struct ActorRecord {
    violations: VecDeque<ViolationRecord>,
    state: ThreatState,
    blocked_until: Option<DateTime<Utc>>,
    strike_count: u32,
    last_violation_at: Option<DateTime<Utc>>,
}

impl ActorRecord {
    /// Apply every time-driven transition up to `now`.
    fn refresh(&mut self, now: DateTime<Utc>, policy: &ThreatPolicy) {
        let cutoff = now - policy.window;
        while self.violations.front().is_some_and(|v| v.timestamp <= cutoff) {
            self.violations.pop_front();
        }

        if let Some(until) = self.blocked_until
            && until <= now
        {
            // Violations during a block re-block immediately, so an elapsed
            // block has seen none.
            self.blocked_until = None;
            self.state = ThreatState::Clean;
        }

        if self.state != ThreatState::Blocked
            && self
                .last_violation_at
                .is_some_and(|at| now - at >= policy.clean_period)
        {
            *self = ActorRecord::default();
        }
    }

    fn block(&mut self, now: DateTime<Utc>, policy: &ThreatPolicy) -> Duration {
        let duration = policy.block_duration(self.strike_count);
        self.strike_count = self.strike_count.saturating_add(1);
        self.blocked_until = Some(now + duration);
        self.state = ThreatState::Blocked;
        duration
    }

    fn decision(&self, now: DateTime<Utc>) -> Decision {
        match self.blocked_until {
            Some(until) if until > now => {
                Decision::deny(DecisionReason::Blocked, Some(until - now))
            }
            _ if self.state == ThreatState::Warned => Decision::allow(DecisionReason::Warned),
            _ => Decision::allow(DecisionReason::Allowed),
        }
    }

    fn is_idle(&self, now: DateTime<Utc>, policy: &ThreatPolicy) -> bool {
        self.blocked_until.is_none_or(|until| until <= now)
            && self
                .last_violation_at
                .is_none_or(|at| now - at >= policy.clean_period)
    }
}

/// Aggregate view for operators.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ThreatStats {
    pub tracked_actors: usize,
    pub warned_actors: usize,
    pub blocked_actors: usize,
    pub violations_in_window: usize,
}

/// Owns the violation log and block list of every actor.
pub struct ThreatResponder {
    policy: ThreatPolicy,
    actors: ActorTable<ActorRecord>,
}

impl ThreatResponder {
    pub fn new(policy: ThreatPolicy) -> Self {
        Self {
            policy,
            actors: ActorTable::new(),
        }
    }

    pub fn policy(&self) -> &ThreatPolicy {
        &self.policy
    }

    /// Whether `actor` may proceed right now.
    pub fn check(&self, actor: &ActorIdentity, now: DateTime<Utc>) -> Decision {
        if actor.is_privileged() {
            return Decision::allow(DecisionReason::Exempt);
        }
        let Some(entry) = self.actors.get(actor.id) else {
            return Decision::allow(DecisionReason::Allowed);
        };
        let mut record = entry.lock();
        record.refresh(now, &self.policy);
        record.decision(now)
    }

    /// Append a violation and escalate if needed.
    ///
    /// Returns the actor's decision after the violation is applied.
    pub fn record_violation(
        &self,
        actor: &ActorIdentity,
        category: ThreatCategory,
        now: DateTime<Utc>,
    ) -> Decision {
        if actor.is_privileged() {
            info!(
                actor = actor.id,
                category = category.as_str(),
                "Violation by privileged actor ignored"
            );
            return Decision::allow(DecisionReason::Exempt);
        }

        let policy = &self.policy;
        self.actors.retain_if_large(|r| !r.is_idle(now, policy));

        let entry = self.actors.entry(actor.id);
        let mut record = entry.lock();
        record.refresh(now, policy);

        record.violations.push_back(ViolationRecord {
            actor: actor.id,
            timestamp: now,
            category,
            severity: category.severity(),
        });
        record.last_violation_at = Some(now);
        let count = record.violations.len();

        let escalate = match record.state {
            ThreatState::Blocked | ThreatState::Warned => true,
            ThreatState::Clean => count >= policy.block_threshold,
        };

        if escalate {
            let duration = record.block(now, policy);
            warn!(
                actor = actor.id,
                category = category.as_str(),
                violations = count,
                strikes = record.strike_count,
                block_secs = duration.num_seconds(),
                "Actor blocked"
            );
        } else if count >= policy.warn_threshold {
            record.state = ThreatState::Warned;
            warn!(
                actor = actor.id,
                category = category.as_str(),
                violations = count,
                "Actor warned"
            );
        } else {
            info!(
                actor = actor.id,
                category = category.as_str(),
                violations = count,
                "Violation recorded"
            );
        }

        record.decision(now)
    }

    pub fn state(&self, actor: i64, now: DateTime<Utc>) -> ThreatState {
        self.actors.get(actor).map_or(ThreatState::Clean, |entry| {
            let mut record = entry.lock();
            record.refresh(now, &self.policy);
            record.state
        })
    }

    pub fn block_state(&self, actor: i64, now: DateTime<Utc>) -> BlockState {
        let (blocked_until, strike_count) = self.actors.get(actor).map_or((None, 0), |entry| {
            let mut record = entry.lock();
            record.refresh(now, &self.policy);
            (record.blocked_until, record.strike_count)
        });
        BlockState {
            actor,
            blocked_until,
            strike_count,
        }
    }

    /// Violations of `actor` still inside the window.
    pub fn violations(&self, actor: i64, now: DateTime<Utc>) -> Vec<ViolationRecord> {
        self.actors.get(actor).map_or_else(Vec::new, |entry| {
            let mut record = entry.lock();
            record.refresh(now, &self.policy);
            record.violations.iter().cloned().collect()
        })
    }

    /// Forget everything about `actor`. Returns false if nothing was tracked.
    pub fn unblock(&self, actor: i64) -> bool {
        let removed = self.actors.remove(actor);
        if removed {
            info!(actor, "Actor unblocked");
        }
        removed
    }

    /// Drop actors with no live block and no recent violation.
    pub fn prune_idle(&self, now: DateTime<Utc>) {
        let policy = &self.policy;
        self.actors.retain(|r| !r.is_idle(now, policy));
    }

    pub fn stats(&self, now: DateTime<Utc>) -> ThreatStats {
        self.prune_idle(now);
        let mut stats = ThreatStats::default();
        self.actors.for_each(|_, record| {
            record.refresh(now, &self.policy);
            stats.tracked_actors += 1;
            stats.violations_in_window += record.violations.len();
            match record.state {
                ThreatState::Warned => stats.warned_actors += 1,
                ThreatState::Blocked => stats.blocked_actors += 1,
                ThreatState::Clean => {}
            }
        });
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::roles::Role;

    fn member(id: i64) -> ActorIdentity {
        ActorIdentity::new(id, Role::Member)
    }

    fn responder() -> ThreatResponder {
        ThreatResponder::new(ThreatPolicy::default())
    }

    #[test]
    fn test_warn_then_block_after_threshold_plus_one() {
        let responder = responder();
        let actor = member(1);
        let now = Utc::now();

        for i in 0..2 {
            let d = responder.record_violation(
                &actor,
                ThreatCategory::SqlPattern,
                now + Duration::seconds(i),
            );
            assert_eq!(d.reason, DecisionReason::Allowed);
        }

        let third =
            responder.record_violation(&actor, ThreatCategory::SqlPattern, now + Duration::seconds(2));
        assert!(third.allow);
        assert_eq!(third.reason, DecisionReason::Warned);
        assert_eq!(responder.state(1, now + Duration::seconds(2)), ThreatState::Warned);

        let fourth =
            responder.record_violation(&actor, ThreatCategory::SqlPattern, now + Duration::seconds(3));
        assert!(!fourth.allow);
        assert_eq!(fourth.reason, DecisionReason::Blocked);
        assert_eq!(fourth.retry_after, Some(Duration::minutes(5)));

        // Denied for the whole block, allowed afterwards.
        let during = responder.check(&actor, now + Duration::minutes(4));
        assert!(!during.allow);
        let after = responder.check(&actor, now + Duration::seconds(3) + Duration::minutes(5));
        assert!(after.allow);
        assert_eq!(responder.state(1, now + Duration::minutes(6)), ThreatState::Clean);
    }

    #[test]
    fn test_privileged_is_exempt() {
        let responder = responder();
        let boss = ActorIdentity::new(99, Role::Privileged);
        let now = Utc::now();

        for _ in 0..20 {
            let d = responder.record_violation(&boss, ThreatCategory::CommandPattern, now);
            assert!(d.allow);
        }
        assert_eq!(responder.check(&boss, now).reason, DecisionReason::Exempt);
        assert_eq!(responder.block_state(99, now).strike_count, 0);
    }

    #[test]
    fn test_block_duration_escalates_and_caps() {
        let policy = ThreatPolicy::default();
        assert_eq!(policy.block_duration(0), Duration::minutes(5));
        assert_eq!(policy.block_duration(1), Duration::minutes(10));
        assert_eq!(policy.block_duration(3), Duration::minutes(40));
        assert_eq!(policy.block_duration(40), Duration::hours(24));
    }

    #[test]
    fn test_violation_while_blocked_extends_block() {
        let responder = responder();
        let actor = member(2);
        let now = Utc::now();

        for i in 0..4 {
            responder.record_violation(&actor, ThreatCategory::RateAbuse, now + Duration::seconds(i));
        }
        assert_eq!(responder.block_state(2, now).strike_count, 1);

        let later = now + Duration::minutes(1);
        let d = responder.record_violation(&actor, ThreatCategory::RateAbuse, later);
        assert!(!d.allow);
        assert_eq!(d.retry_after, Some(Duration::minutes(10)));
        assert_eq!(responder.block_state(2, later).strike_count, 2);
    }

    #[test]
    fn test_strikes_persist_until_clean_period() {
        let responder = responder();
        let actor = member(3);
        let now = Utc::now();

        for i in 0..4 {
            responder.record_violation(&actor, ThreatCategory::XssPattern, now + Duration::seconds(i));
        }

        // Block expired but the clean period has not: the next offence
        // escalates from the previous strike count.
        let second_round = now + Duration::minutes(10);
        for i in 0..4 {
            responder.record_violation(
                &actor,
                ThreatCategory::XssPattern,
                second_round + Duration::seconds(i),
            );
        }
        let state = responder.block_state(3, second_round + Duration::seconds(3));
        assert_eq!(state.strike_count, 2);
        assert_eq!(
            state.blocked_until,
            Some(second_round + Duration::seconds(3) + Duration::minutes(10))
        );

        // A full clean period after the last violation forgets everything.
        let much_later = second_round + Duration::hours(2);
        assert_eq!(responder.block_state(3, much_later).strike_count, 0);
        assert_eq!(responder.state(3, much_later), ThreatState::Clean);
    }

    #[test]
    fn test_block_threshold_from_clean() {
        let responder = ThreatResponder::new(ThreatPolicy {
            warn_threshold: 10,
            block_threshold: 3,
            ..ThreatPolicy::default()
        });
        let actor = member(4);
        let now = Utc::now();

        responder.record_violation(&actor, ThreatCategory::SqlPattern, now);
        responder.record_violation(&actor, ThreatCategory::SqlPattern, now);
        let d = responder.record_violation(&actor, ThreatCategory::SqlPattern, now);
        assert_eq!(d.reason, DecisionReason::Blocked);
    }

    #[test]
    fn test_window_prunes_old_violations() {
        let responder = responder();
        let actor = member(5);
        let now = Utc::now();

        responder.record_violation(&actor, ThreatCategory::SqlPattern, now);
        responder.record_violation(&actor, ThreatCategory::SqlPattern, now);
        assert_eq!(responder.violations(5, now).len(), 2);

        let later = now + Duration::seconds(61);
        assert!(responder.violations(5, later).is_empty());
        let d = responder.record_violation(&actor, ThreatCategory::SqlPattern, later);
        assert_eq!(d.reason, DecisionReason::Allowed);
    }

    #[test]
    fn test_unblock_and_stats() {
        let responder = responder();
        let now = Utc::now();

        for i in 0..4 {
            responder.record_violation(&member(6), ThreatCategory::SqlPattern, now + Duration::seconds(i));
        }
        for _ in 0..3 {
            responder.record_violation(&member(7), ThreatCategory::SqlPattern, now);
        }

        let stats = responder.stats(now + Duration::seconds(5));
        assert_eq!(stats.tracked_actors, 2);
        assert_eq!(stats.blocked_actors, 1);
        assert_eq!(stats.warned_actors, 1);
        assert_eq!(stats.violations_in_window, 7);

        assert!(responder.unblock(6));
        assert!(responder.check(&member(6), now + Duration::seconds(5)).allow);
        assert!(!responder.unblock(6));
    }

    #[test]
    fn test_pruning_never_loses_concurrent_violations() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let responder = responder();
        let now = Utc::now();
        let writing = AtomicBool::new(true);

        std::thread::scope(|scope| {
            scope.spawn(|| {
                while writing.load(Ordering::Relaxed) {
                    responder.prune_idle(now);
                }
            });

            let writers: Vec<_> = (0..4_i64)
                .map(|t| {
                    let responder = &responder;
                    scope.spawn(move || {
                        for i in 0..300 {
                            responder.record_violation(
                                &member(t * 1_000 + i),
                                ThreatCategory::XssPattern,
                                now,
                            );
                        }
                    })
                })
                .collect();
            for writer in writers {
                writer.join().unwrap();
            }
            writing.store(false, Ordering::Relaxed);
        });

        for t in 0..4_i64 {
            for i in 0..300 {
                assert_eq!(responder.violations(t * 1_000 + i, now).len(), 1);
            }
        }
        assert_eq!(responder.stats(now).violations_in_window, 1_200);
    }
}
