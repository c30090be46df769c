//! Refresh scheduling: policy derivation, damage rate limiting, timers
//!
//! In event-driven mode refreshes are triggered by damage notifications
//! and throttled to a minimum period; a throttled notification parks a
//! single deferred task that re-validates its tag before firing, so a
//! newer notification can supersede it without double refreshes.

use std::time::{Duration, Instant};

use crate::config::Config;

const DEFAULT_POLL_FPS: u32 = 25;
const DEFAULT_LIMIT_FPS: u32 = 50;

/// How often the X server clock may jump backwards before we treat a
/// timestamp as a discontinuity rather than an out-of-order event.
const CLOCK_WRAP_GUARD_MS: u32 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshStrategy {
    /// Fixed-interval timer; no damage events consumed.
    Polling,
    /// Damage notifications, rate limited to `min_period_ms`.
    EventDriven,
}

/// Derived once at enable time from configuration and probed capabilities.
#[derive(Debug, Clone, Copy)]
pub struct RefreshPolicy {
    pub strategy: RefreshStrategy,
    /// Minimum period between damage-driven refreshes (0 = unlimited).
    pub min_period_ms: u32,
    /// Poll rate, when a poll timer is needed at all. Event-driven mode
    /// still polls at this rate when raw motion events are unavailable,
    /// to keep the cursor location current.
    pub poll_fps: Option<u32>,
}

impl RefreshPolicy {
    pub fn derive(config: &Config, has_damage: bool, has_raw_motion: bool) -> Self {
        let event_driven = has_damage && config.rate_fps.is_none();

        let min_period_ms = match config.limit_fps {
            Some(0) => 0,
            Some(fps) => 1000 / fps,
            None => 1000 / DEFAULT_LIMIT_FPS,
        };

        let poll_fps = if event_driven && has_raw_motion {
            None
        } else {
            let mut fps = config.rate_fps.unwrap_or(DEFAULT_POLL_FPS);
            if config.rate_fps.is_none() {
                if let Some(limit) = config.limit_fps {
                    if limit > 0 && limit < fps {
                        fps = limit;
                    }
                }
            }
            Some(fps.max(1))
        };

        Self {
            strategy: if event_driven {
                RefreshStrategy::EventDriven
            } else {
                RefreshStrategy::Polling
            },
            min_period_ms,
            poll_fps,
        }
    }
}

/// Outcome of a damage notification under rate limiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DamageAction {
    /// Refresh immediately.
    RefreshNow,
    /// Schedule a deferred refresh `delay_ms` from now, tagged so a later
    /// notification can invalidate it.
    Defer { delay_ms: u32, tag: u32 },
    /// A deferred refresh is already parked; nothing to do.
    AlreadyPending,
}

/// Rate limiter over X server timestamps (milliseconds, wrapping u32).
#[derive(Debug)]
pub struct RateLimiter {
    min_period_ms: u32,
    next_allowed: u32,
    pending: Option<u32>,
}

impl RateLimiter {
    pub fn new(min_period_ms: u32) -> Self {
        Self {
            min_period_ms,
            next_allowed: 0,
            pending: None,
        }
    }

    /// A damage notification arrived at server time `t`.
    pub fn on_damage(&mut self, t: u32) -> DamageAction {
        if t >= self.next_allowed || t < self.next_allowed.wrapping_sub(CLOCK_WRAP_GUARD_MS) {
            // due, or the server clock jumped: refresh right away and
            // drop any parked task
            self.pending = None;
            self.next_allowed = t.wrapping_add(self.min_period_ms);
            DamageAction::RefreshNow
        } else if self.pending.is_none() {
            let tag = self.next_allowed;
            self.pending = Some(tag);
            DamageAction::Defer {
                delay_ms: self.next_allowed - t,
                tag,
            }
        } else {
            DamageAction::AlreadyPending
        }
    }

    /// The deferred task fired. Returns true if it is still current and
    /// the refresh should happen; a stale tag means a newer notification
    /// already advanced the schedule.
    pub fn on_deferred_fire(&mut self, tag: u32) -> bool {
        self.pending = None;
        if tag == self.next_allowed {
            self.next_allowed = tag.wrapping_add(self.min_period_ms);
            true
        } else {
            false
        }
    }
}

/// At most one pending deferred task; scheduling replaces any previous
/// one, and `take_due` hands the tag back exactly once.
#[derive(Debug, Default)]
pub struct TaskSlot {
    slot: Option<(Instant, u32)>,
}

impl TaskSlot {
    pub fn schedule(&mut self, delay: Duration, tag: u32) {
        self.slot = Some((Instant::now() + delay, tag));
    }

    pub fn cancel(&mut self) {
        self.slot = None;
    }

    pub fn is_scheduled(&self) -> bool {
        self.slot.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.slot.map(|(at, _)| at)
    }

    pub fn take_due(&mut self, now: Instant) -> Option<u32> {
        match self.slot {
            Some((at, tag)) if now >= at => {
                self.slot = None;
                Some(tag)
            }
            _ => None,
        }
    }
}

/// Periodic poll timer for fixed-rate refresh.
#[derive(Debug)]
pub struct PollTimer {
    period: Duration,
    next: Instant,
}

impl PollTimer {
    pub fn new(fps: u32) -> Self {
        let period = Duration::from_millis(1000 / fps.max(1) as u64);
        Self {
            period,
            next: Instant::now() + period,
        }
    }

    pub fn deadline(&self) -> Instant {
        self.next
    }

    /// True once per elapsed period; late ticks are coalesced rather
    /// than replayed.
    pub fn tick(&mut self, now: Instant) -> bool {
        if now >= self.next {
            self.next = now + self.period;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config::default()
    }

    #[test]
    fn test_policy_event_driven_when_damage_available() {
        let policy = RefreshPolicy::derive(&config(), true, true);
        assert_eq!(policy.strategy, RefreshStrategy::EventDriven);
        assert_eq!(policy.min_period_ms, 20); // 50 fps default cap
        assert_eq!(policy.poll_fps, None);
    }

    #[test]
    fn test_policy_polls_for_cursor_without_raw_motion() {
        let policy = RefreshPolicy::derive(&config(), true, false);
        assert_eq!(policy.strategy, RefreshStrategy::EventDriven);
        assert_eq!(policy.poll_fps, Some(25));
    }

    #[test]
    fn test_policy_fixed_rate_forces_polling() {
        let mut cfg = config();
        cfg.rate_fps = Some(30);
        let policy = RefreshPolicy::derive(&cfg, true, true);
        assert_eq!(policy.strategy, RefreshStrategy::Polling);
        assert_eq!(policy.poll_fps, Some(30));
    }

    #[test]
    fn test_policy_no_damage_falls_back_to_polling() {
        let policy = RefreshPolicy::derive(&config(), false, true);
        assert_eq!(policy.strategy, RefreshStrategy::Polling);
        assert_eq!(policy.poll_fps, Some(25));
    }

    #[test]
    fn test_policy_limit_caps_poll_rate() {
        let mut cfg = config();
        cfg.limit_fps = Some(10);
        let policy = RefreshPolicy::derive(&cfg, false, false);
        assert_eq!(policy.poll_fps, Some(10));
        assert_eq!(policy.min_period_ms, 100);
    }

    #[test]
    fn test_limiter_first_damage_refreshes() {
        let mut limiter = RateLimiter::new(20);
        assert_eq!(limiter.on_damage(1000), DamageAction::RefreshNow);
    }

    #[test]
    fn test_limiter_defers_within_period() {
        // damage at t=1000, then t=1005 with a 20 ms minimum period
        // parks a deferred refresh for t=1020
        let mut limiter = RateLimiter::new(20);
        assert_eq!(limiter.on_damage(1000), DamageAction::RefreshNow);
        assert_eq!(
            limiter.on_damage(1005),
            DamageAction::Defer {
                delay_ms: 15,
                tag: 1020
            }
        );
        // further damage in the window is absorbed by the parked task
        assert_eq!(limiter.on_damage(1010), DamageAction::AlreadyPending);

        // the task is still current when it fires, and advances the window
        assert!(limiter.on_deferred_fire(1020));
        assert_eq!(limiter.on_damage(1041), DamageAction::RefreshNow);
    }

    #[test]
    fn test_limiter_stale_deferred_is_dropped() {
        let mut limiter = RateLimiter::new(20);
        limiter.on_damage(1000);
        assert!(matches!(
            limiter.on_damage(1005),
            DamageAction::Defer { tag: 1020, .. }
        ));
        // a timestamp past the window refreshes immediately and advances
        // next_allowed, invalidating the parked tag
        assert_eq!(limiter.on_damage(1025), DamageAction::RefreshNow);
        assert!(!limiter.on_deferred_fire(1020));
    }

    #[test]
    fn test_limiter_clock_discontinuity_refreshes() {
        let mut limiter = RateLimiter::new(20);
        limiter.on_damage(500_000);
        // server clock jumped backwards far beyond the guard window
        assert_eq!(limiter.on_damage(3000), DamageAction::RefreshNow);
    }

    #[test]
    fn test_limiter_rate_bound() {
        // damage every 5 ms for 200 ms with a 20 ms minimum period must
        // produce at most ceil((tn - t1) / 20) + 1 refreshes
        let min_period = 20u32;
        let mut limiter = RateLimiter::new(min_period);

        let t1 = 1000u32;
        let tn = 1200u32;
        let mut refreshes = 0u32;
        let mut parked: Option<u32> = None;

        let mut t = t1;
        while t <= tn {
            if let Some(tag) = parked {
                if tag <= t {
                    parked = None;
                    if limiter.on_deferred_fire(tag) {
                        refreshes += 1;
                    }
                }
            }
            match limiter.on_damage(t) {
                DamageAction::RefreshNow => refreshes += 1,
                DamageAction::Defer { tag, .. } => parked = Some(tag),
                DamageAction::AlreadyPending => {}
            }
            t += 5;
        }

        let bound = (tn - t1).div_ceil(min_period) + 1;
        assert!(refreshes <= bound, "{refreshes} refreshes > bound {bound}");
        assert!(refreshes > 0);
    }

    #[test]
    fn test_poll_timer_not_due_again_after_tick() {
        let mut timer = PollTimer::new(25);
        let now = timer.deadline();
        assert!(timer.tick(now));
        // the deadline moves a full period out, so an event loop that
        // re-checks timers right after firing settles instead of spinning
        assert!(!timer.tick(now));
        assert!(timer.deadline() > now);
    }

    #[test]
    fn test_task_slot_replaces_and_fires_once() {
        let mut slot = TaskSlot::default();
        assert!(!slot.is_scheduled());

        slot.schedule(Duration::from_millis(0), 7);
        slot.schedule(Duration::from_millis(0), 9);
        let now = Instant::now() + Duration::from_millis(1);
        assert_eq!(slot.take_due(now), Some(9));
        assert_eq!(slot.take_due(now), None);

        slot.schedule(Duration::from_secs(60), 11);
        assert_eq!(slot.take_due(Instant::now()), None);
        assert!(slot.is_scheduled());
        slot.cancel();
        assert!(!slot.is_scheduled());
    }
}
