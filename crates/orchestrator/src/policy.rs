//! Restart policy engine.
//!
//! Decides whether and when a failed worker is restarted:
//!
//! - exponential backoff per bot, capped by exponent and by delay
//! - per-bot cooldown after each restart
//! - per-bot hourly rate limit
//! - a debounced queue with at most one entry per bot
//! - the fleet-wide circuit breaker ("emergency protocol")
//!
//! The engine is a plain data structure owned by the registry. It never
//! performs a restart itself; the supervisor drains [`RestartPolicy::take_due`].

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use fleet_core::BotId;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::alerts::{AlertRecord, EmergencyKind};
use crate::config::{EmergencyConfig, RestartConfig};

const HOUR: Duration = Duration::from_secs(3600);

/// Calculate exponential backoff duration.
#[must_use]
pub fn calculate_backoff(exponent: u32, base_ms: u64, max_ms: u64) -> Duration {
    let backoff = base_ms.saturating_mul(2u64.saturating_pow(exponent));
    Duration::from_millis(backoff.min(max_ms))
}

/// `delay(attempt) = min(max, base * 2^min(attempt - 1, cap_exponent))`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    pub cap_exponent: u32,
}

impl BackoffPolicy {
    #[must_use]
    pub const fn new(base: Duration, max: Duration, cap_exponent: u32) -> Self {
        Self {
            base,
            max,
            cap_exponent,
        }
    }

    /// Delay before the given 1-based attempt.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(self.cap_exponent);
        calculate_backoff(exponent, millis(self.base), millis(self.max))
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Why a restart was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartReason {
    /// Unexpected process exit.
    Crash,
    /// Heartbeats stopped.
    HealthTimeout,
    /// Memory ceiling exceeded.
    ResourceLimit,
    /// The registered process was lost during duplicate remediation.
    ProcessLost,
    /// The synchronizer found a crashed worker that is still desired.
    Resync,
}

impl RestartReason {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Crash => "crash",
            Self::HealthTimeout => "health_timeout",
            Self::ResourceLimit => "resource_limit",
            Self::ProcessLost => "process_lost",
            Self::Resync => "resync",
        }
    }
}

/// A pending restart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartQueueEntry {
    pub bot_id: BotId,
    pub reason: RestartReason,
    pub attempt: u32,
    pub delay: Duration,
    pub enqueued_at: Instant,
    pub enqueued_at_utc: DateTime<Utc>,
    /// Earliest time the restart may run.
    pub ready_at: Instant,
}

/// `duration * factor`, saturating at [`Duration::MAX`]. A factor that is not
/// a positive finite number leaves the duration unchanged.
#[must_use]
pub fn scale(duration: Duration, factor: f64) -> Duration {
    if !factor.is_finite() || factor <= 0.0 {
        return duration;
    }
    Duration::try_from_secs_f64(duration.as_secs_f64() * factor).unwrap_or(Duration::MAX)
}

/// Per-bot restart bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestartHistory {
    /// Restarts since the last stabilization. Never decreases otherwise.
    pub count: u32,
    pub last_restart_at: Option<Instant>,
    /// Restart times within the last hour.
    recent: VecDeque<Instant>,
}

impl RestartHistory {
    fn record(&mut self, now: Instant) {
        self.count = self.count.saturating_add(1);
        self.last_restart_at = Some(now);
        self.recent.push_back(now);
    }

    fn prune(&mut self, now: Instant) {
        while self
            .recent
            .front()
            .is_some_and(|t| now.saturating_duration_since(*t) >= HOUR)
        {
            self.recent.pop_front();
        }
    }

    /// Restarts within the hour ending at `now`.
    #[must_use]
    pub fn last_hour(&self, now: Instant) -> usize {
        self.recent
            .iter()
            .filter(|t| now.saturating_duration_since(**t) < HOUR)
            .count()
    }
}

/// Outcome of a restart request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    Enqueued { attempt: u32, delay: Duration },
    AlreadyQueued,
    AlreadyStarting,
    CoolingDown { remaining: Duration },
    RateLimited { restarts_last_hour: usize },
}

impl RestartDecision {
    #[must_use]
    pub const fn is_enqueued(&self) -> bool {
        matches!(self, Self::Enqueued { .. })
    }
}

/// Active circuit-breaker state.
#[derive(Debug, Clone, PartialEq)]
pub struct EmergencyState {
    pub kind: EmergencyKind,
    pub cooldown_multiplier: f64,
    pub activated_at: Instant,
    pub activated_at_utc: DateTime<Utc>,
    pub expires_at: Instant,
    pub reason: String,
}

/// What the controller must do after a breaker fires.
#[derive(Debug, Clone, PartialEq)]
pub enum EmergencyAction {
    /// Stop every worker, pause, then resynchronize.
    ReloadFleet(AlertRecord),
    /// Cooldowns and heartbeat timeouts are widened until the state expires.
    Throttle(AlertRecord),
}

impl EmergencyAction {
    #[must_use]
    pub const fn alert(&self) -> &AlertRecord {
        match self {
            Self::ReloadFleet(alert) | Self::Throttle(alert) => alert,
        }
    }
}

/// The restart policy engine.
#[derive(Debug)]
pub struct RestartPolicy {
    config: RestartConfig,
    emergency_config: EmergencyConfig,
    backoff: BackoffPolicy,
    history: HashMap<BotId, RestartHistory>,
    queue: BTreeMap<BotId, RestartQueueEntry>,
    fleet_restarts: VecDeque<Instant>,
    emergency: Option<EmergencyState>,
    last_fleet_reload: Option<Instant>,
}

impl RestartPolicy {
    #[must_use]
    pub fn new(config: RestartConfig, emergency_config: EmergencyConfig) -> Self {
        let backoff = BackoffPolicy::new(config.base_delay, config.max_delay, config.cap_exponent);
        Self {
            config,
            emergency_config,
            backoff,
            history: HashMap::new(),
            queue: BTreeMap::new(),
            fleet_restarts: VecDeque::new(),
            emergency: None,
            last_fleet_reload: None,
        }
    }

    #[must_use]
    pub const fn backoff(&self) -> &BackoffPolicy {
        &self.backoff
    }

    #[must_use]
    pub const fn config(&self) -> &RestartConfig {
        &self.config
    }

    /// Factor applied to cooldowns and heartbeat timeouts right now.
    #[must_use]
    pub fn cooldown_multiplier(&self, now: Instant) -> f64 {
        self.emergency
            .as_ref()
            .filter(|e| now < e.expires_at)
            .map_or(1.0, |e| e.cooldown_multiplier)
    }

    /// Cooldown after the emergency multiplier.
    #[must_use]
    pub fn effective_cooldown(&self, now: Instant) -> Duration {
        scale(self.config.cooldown, self.cooldown_multiplier(now))
    }

    /// Ask for a restart of `bot_id`.
    ///
    /// `starting` is the caller's knowledge that a start is already in flight
    /// for this bot (start-lock held or lifecycle operation running).
    pub fn request(
        &mut self,
        bot_id: BotId,
        reason: RestartReason,
        starting: bool,
        now: Instant,
    ) -> RestartDecision {
        if self.queue.contains_key(&bot_id) {
            debug!(bot_id = %bot_id, reason = reason.as_str(), "Restart already queued");
            return RestartDecision::AlreadyQueued;
        }
        if starting {
            debug!(bot_id = %bot_id, reason = reason.as_str(), "Restart skipped, start in flight");
            return RestartDecision::AlreadyStarting;
        }

        let cooldown = self.effective_cooldown(now);
        let history = self.history.entry(bot_id).or_default();
        history.prune(now);

        if let Some(last) = history.last_restart_at {
            let since = now.saturating_duration_since(last);
            if since < cooldown {
                let remaining = cooldown.saturating_sub(since);
                info!(
                    bot_id = %bot_id,
                    remaining_ms = millis(remaining),
                    "Restart suppressed by cooldown"
                );
                return RestartDecision::CoolingDown { remaining };
            }
        }

        let recent = history.last_hour(now);
        if recent >= self.config.max_restarts_per_hour as usize {
            warn!(
                bot_id = %bot_id,
                restarts_last_hour = recent,
                limit = self.config.max_restarts_per_hour,
                "Restart refused, hourly limit reached"
            );
            return RestartDecision::RateLimited {
                restarts_last_hour: recent,
            };
        }

        let attempt = history.count.saturating_add(1);
        let delay = self.backoff.delay(attempt);
        let wait = delay.max(self.config.dwell);
        self.queue.insert(
            bot_id,
            RestartQueueEntry {
                bot_id,
                reason,
                attempt,
                delay,
                enqueued_at: now,
                enqueued_at_utc: Utc::now(),
                ready_at: now + wait,
            },
        );

        info!(
            bot_id = %bot_id,
            reason = reason.as_str(),
            attempt,
            delay_ms = millis(delay),
            "Restart enqueued"
        );
        RestartDecision::Enqueued { attempt, delay }
    }

    /// Whether a request made at `now` would be refused by cooldown or the
    /// hourly limit.
    #[must_use]
    pub fn is_held_back(&self, bot_id: BotId, now: Instant) -> bool {
        let Some(history) = self.history.get(&bot_id) else {
            return false;
        };
        let cooling = history
            .last_restart_at
            .is_some_and(|last| now.saturating_duration_since(last) < self.effective_cooldown(now));
        cooling || history.last_hour(now) >= self.config.max_restarts_per_hour as usize
    }

    #[must_use]
    pub fn is_queued(&self, bot_id: BotId) -> bool {
        self.queue.contains_key(&bot_id)
    }

    #[must_use]
    pub fn queued(&self, bot_id: BotId) -> Option<&RestartQueueEntry> {
        self.queue.get(&bot_id)
    }

    pub fn queue(&self) -> impl Iterator<Item = &RestartQueueEntry> {
        self.queue.values()
    }

    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Remove and return entries whose dwell has elapsed, oldest first.
    pub fn take_due(&mut self, now: Instant) -> Vec<RestartQueueEntry> {
        let due: Vec<BotId> = self
            .queue
            .values()
            .filter(|e| e.ready_at <= now)
            .map(|e| e.bot_id)
            .collect();
        let mut entries: Vec<RestartQueueEntry> = due
            .into_iter()
            .filter_map(|id| self.queue.remove(&id))
            .collect();
        entries.sort_by_key(|e| e.enqueued_at);
        entries
    }

    /// Drop a queued restart without touching history.
    pub fn cancel(&mut self, bot_id: BotId) -> bool {
        self.queue.remove(&bot_id).is_some()
    }

    /// Count an executed restart.
    pub fn record_restart(&mut self, bot_id: BotId, now: Instant) {
        self.history.entry(bot_id).or_default().record(now);
        self.fleet_restarts.push_back(now);
    }

    #[must_use]
    pub fn history(&self, bot_id: BotId) -> Option<&RestartHistory> {
        self.history.get(&bot_id)
    }

    pub fn histories(&self) -> impl Iterator<Item = (&BotId, &RestartHistory)> {
        self.history.iter()
    }

    /// Clear a bot's history after a sustained healthy period.
    pub fn stabilize(&mut self, bot_id: BotId) -> bool {
        let had = self.history.get(&bot_id).is_some_and(|h| h.count > 0);
        if had {
            self.history.remove(&bot_id);
            info!(bot_id = %bot_id, "Worker stabilized, restart history reset");
        }
        had
    }

    /// Remove every trace of a bot.
    pub fn purge(&mut self, bot_id: BotId) {
        self.history.remove(&bot_id);
        self.queue.remove(&bot_id);
    }

    /// Restarts across the fleet within the last hour.
    pub fn restarts_last_hour(&mut self, now: Instant) -> usize {
        while self
            .fleet_restarts
            .front()
            .is_some_and(|t| now.saturating_duration_since(*t) >= HOUR)
        {
            self.fleet_restarts.pop_front();
        }
        self.fleet_restarts.len()
    }

    /// Active emergency state, expiring it first if its time is up.
    pub fn emergency(&mut self, now: Instant) -> Option<&EmergencyState> {
        if self.emergency.as_ref().is_some_and(|e| now >= e.expires_at) {
            if let Some(expired) = self.emergency.take() {
                info!(kind = expired.kind.as_str(), "Emergency state expired, intervals restored");
            }
        }
        self.emergency.as_ref()
    }

    fn activate(&mut self, kind: EmergencyKind, reason: &str, now: Instant) {
        self.emergency = Some(EmergencyState {
            kind,
            cooldown_multiplier: self.emergency_config.cooldown_multiplier,
            activated_at: now,
            activated_at_utc: Utc::now(),
            expires_at: now + self.emergency_config.duration,
            reason: reason.to_string(),
        });
    }

    /// Evaluate both circuit breakers.
    ///
    /// Nothing fires while the fleet is no larger than `min_fleet_size`.
    #[allow(clippy::cast_precision_loss)]
    pub fn evaluate_emergency(
        &mut self,
        fleet_size: usize,
        unresponsive: usize,
        now: Instant,
    ) -> Vec<EmergencyAction> {
        let already_active = self.emergency(now).is_some();
        let mut actions = Vec::new();

        if fleet_size <= self.emergency_config.min_fleet_size {
            return actions;
        }

        let unresponsive_ratio = unresponsive as f64 / fleet_size as f64;
        let reload_due = self
            .last_fleet_reload
            .is_none_or(|t| now.saturating_duration_since(t) >= self.emergency_config.duration);
        if unresponsive_ratio > self.emergency_config.unresponsive_ratio && reload_due {
            let reason = format!("{unresponsive} of {fleet_size} workers unresponsive");
            self.last_fleet_reload = Some(now);
            self.activate(EmergencyKind::UnresponsiveFleet, &reason, now);
            actions.push(EmergencyAction::ReloadFleet(AlertRecord::new(
                EmergencyKind::UnresponsiveFleet,
                fleet_size,
                unresponsive_ratio,
                self.emergency_config.unresponsive_ratio,
                reason,
            )));
        }

        let restarts = self.restarts_last_hour(now);
        let scaled = (fleet_size as f64 * self.emergency_config.restart_rate_ratio).ceil();
        let over_scaled = restarts as f64 > scaled;
        let over_absolute = restarts > self.emergency_config.restart_rate_absolute;
        if (over_scaled || over_absolute) && !already_active && actions.is_empty() {
            let threshold = if over_scaled {
                scaled
            } else {
                self.emergency_config.restart_rate_absolute as f64
            };
            let reason = format!("{restarts} restarts in the last hour across {fleet_size} workers");
            self.activate(EmergencyKind::RestartStorm, &reason, now);
            actions.push(EmergencyAction::Throttle(AlertRecord::new(
                EmergencyKind::RestartStorm,
                fleet_size,
                restarts as f64,
                threshold,
                reason,
            )));
        }

        actions
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::panic)]

    use super::*;

    fn policy() -> RestartPolicy {
        RestartPolicy::new(RestartConfig::default(), EmergencyConfig::default())
    }

    #[test]
    fn test_scale_never_panics() {
        let ten = Duration::from_secs(10);
        assert_eq!(scale(ten, 3.0), Duration::from_secs(30));
        assert_eq!(scale(ten, f64::NAN), ten);
        assert_eq!(scale(ten, f64::INFINITY), ten);
        assert_eq!(scale(ten, -2.0), ten);
        assert_eq!(scale(Duration::MAX, 1e300), Duration::MAX);
    }

    #[test]
    fn test_default_backoff_sequence() {
        let backoff = policy().backoff;
        let delays: Vec<u64> = (1..=7).map(|a| backoff.delay(a).as_secs()).collect();
        assert_eq!(delays, vec![5, 10, 20, 40, 60, 60, 60]);
    }

    #[test]
    fn test_backoff_attempt_zero_uses_base() {
        assert_eq!(policy().backoff.delay(0), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_crash_enqueues_attempt_one_with_base_delay() {
        let mut policy = policy();
        let now = Instant::now();

        let decision = policy.request(BotId::new(42), RestartReason::Crash, false, now);

        assert_eq!(
            decision,
            RestartDecision::Enqueued {
                attempt: 1,
                delay: Duration::from_secs(5)
            }
        );
        assert_eq!(policy.queue_len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_requests_collapse() {
        let mut policy = policy();
        let now = Instant::now();
        let bot = BotId::new(1);

        assert!(policy.request(bot, RestartReason::Crash, false, now).is_enqueued());
        assert_eq!(
            policy.request(bot, RestartReason::HealthTimeout, false, now),
            RestartDecision::AlreadyQueued
        );
        assert_eq!(policy.queue_len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_starting_bot_is_not_enqueued() {
        let mut policy = policy();
        let decision = policy.request(BotId::new(1), RestartReason::Crash, true, Instant::now());
        assert_eq!(decision, RestartDecision::AlreadyStarting);
        assert_eq!(policy.queue_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dwell_holds_entries() {
        let mut policy = RestartPolicy::new(
            RestartConfig {
                base_delay: Duration::from_millis(10),
                dwell: Duration::from_secs(2),
                ..RestartConfig::default()
            },
            EmergencyConfig::default(),
        );
        let start = Instant::now();
        policy.request(BotId::new(1), RestartReason::Crash, false, start);

        assert!(policy.take_due(start + Duration::from_secs(1)).is_empty());
        assert_eq!(policy.take_due(start + Duration::from_secs(2)).len(), 1);
        assert_eq!(policy.queue_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_then_escalating_attempts() {
        let mut policy = policy();
        let bot = BotId::new(3);
        let t0 = Instant::now();

        policy.request(bot, RestartReason::Crash, false, t0);
        let entry = policy.take_due(t0 + Duration::from_secs(5)).pop().unwrap();
        policy.record_restart(entry.bot_id, t0 + Duration::from_secs(5));

        let early = policy.request(bot, RestartReason::Crash, false, t0 + Duration::from_secs(10));
        assert!(matches!(early, RestartDecision::CoolingDown { .. }));

        let later = policy.request(bot, RestartReason::Crash, false, t0 + Duration::from_secs(40));
        assert_eq!(
            later,
            RestartDecision::Enqueued {
                attempt: 2,
                delay: Duration::from_secs(10)
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_hourly_rate_limit() {
        let mut policy = RestartPolicy::new(
            RestartConfig::default()
                .with_cooldown(Duration::ZERO)
                .with_max_restarts_per_hour(2),
            EmergencyConfig::default(),
        );
        let bot = BotId::new(9);
        let t0 = Instant::now();
        policy.record_restart(bot, t0);
        policy.record_restart(bot, t0 + Duration::from_secs(1));

        let decision = policy.request(bot, RestartReason::Crash, false, t0 + Duration::from_secs(2));
        assert_eq!(decision, RestartDecision::RateLimited { restarts_last_hour: 2 });

        let after = policy.request(bot, RestartReason::Crash, false, t0 + HOUR + Duration::from_secs(2));
        assert!(after.is_enqueued());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stabilize_resets_history() {
        let mut policy = policy();
        let bot = BotId::new(5);
        policy.record_restart(bot, Instant::now());
        assert_eq!(policy.history(bot).unwrap().count, 1);

        assert!(policy.stabilize(bot));
        assert!(policy.history(bot).is_none());
        assert!(!policy.stabilize(bot));
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_floor_blocks_all_triggers() {
        let mut policy = policy();
        let now = Instant::now();
        for i in 0..500 {
            policy.record_restart(BotId::new(i), now);
        }

        assert!(policy.evaluate_emergency(1, 1, now).is_empty());
        assert!(policy.evaluate_emergency(2, 2, now).is_empty());
        assert!(policy.emergency(now).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unresponsive_fleet_triggers_reload_once() {
        let mut policy = policy();
        let now = Instant::now();

        let actions = policy.evaluate_emergency(10, 10, now);
        assert!(matches!(actions.as_slice(), [EmergencyAction::ReloadFleet(_)]));
        assert!(policy.evaluate_emergency(10, 10, now + Duration::from_secs(60)).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_storm_throttles_and_reverts() {
        let config = EmergencyConfig::default();
        let duration = config.duration;
        let mut policy = RestartPolicy::new(RestartConfig::default(), config);
        let now = Instant::now();
        for i in 0..6 {
            policy.record_restart(BotId::new(i), now);
        }

        let actions = policy.evaluate_emergency(10, 0, now);
        match actions.as_slice() {
            [EmergencyAction::Throttle(alert)] => {
                assert_eq!(alert.kind, EmergencyKind::RestartStorm);
                assert!((alert.threshold - 5.0).abs() < f64::EPSILON);
            }
            other => panic!("expected throttle, got {other:?}"),
        }
        assert!((policy.cooldown_multiplier(now) - 3.0).abs() < f64::EPSILON);
        assert_eq!(policy.effective_cooldown(now), Duration::from_secs(90));

        let later = now + duration;
        assert!(policy.emergency(later).is_none());
        assert!((policy.cooldown_multiplier(later) - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn test_absolute_restart_threshold() {
        let mut policy = RestartPolicy::new(
            RestartConfig::default(),
            EmergencyConfig::default().with_restart_rate_absolute(3),
        );
        let now = Instant::now();
        for i in 0..4 {
            policy.record_restart(BotId::new(i), now);
        }

        let actions = policy.evaluate_emergency(100, 0, now);
        assert_eq!(actions.len(), 1);
        assert!((actions[0].alert().threshold - 3.0).abs() < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_removes_queue_and_history() {
        let mut policy = policy();
        let bot = BotId::new(8);
        let now = Instant::now();
        policy.record_restart(bot, now);
        policy.request(bot, RestartReason::Crash, false, now + Duration::from_secs(60));

        policy.purge(bot);

        assert!(!policy.is_queued(bot));
        assert!(policy.history(bot).is_none());
    }
}
