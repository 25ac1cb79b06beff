//! Per-destination concurrency and backoff state.
//!
//! A destination is a `(transport, nexthop)` pair, the unit of concurrency
//! control. Limits adapt under load: a periodic sampler smooths the active
//! count into a moving average and decays the effective limit linearly from
//! the peak toward the long-term average.

use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use tracing::debug;

use crate::backoff::retry_delay;

/// Destination key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DestKey {
    pub transport: String,
    pub nexthop: String,
}

impl DestKey {
    #[must_use]
    pub fn new(transport: impl Into<String>, nexthop: impl Into<String>) -> Self {
        Self {
            transport: transport.into(),
            nexthop: nexthop.into(),
        }
    }
}

impl std::fmt::Display for DestKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.transport, self.nexthop)
    }
}

/// Moving-average smoothing factor, as in the supervisor's process sampler.
const NSAMPLE: f64 = 5.0;

#[derive(Debug)]
pub(crate) struct Destination {
    /// Delivery agents currently working for this destination.
    pub active: usize,
    /// Effective concurrency limit, between average and peak.
    pub limit: usize,
    pub peak: usize,
    pub average: usize,
    /// Smoothed active count maintained by the sampler.
    pub active_avg: f64,
    /// Consecutive soft failures.
    pub failures: u32,
    /// Do not dispatch before this time.
    pub next_eligible: SystemTime,
    /// Set when the destination goes idle; idle destinations expire.
    pub idle_since: Option<SystemTime>,
}

/// Concurrent destination registry.
#[derive(Debug)]
pub struct DestinationTable {
    destinations: DashMap<DestKey, Destination>,
    initial: usize,
    peak: usize,
    average: usize,
}

/// Idle destinations are dropped after this long.
const IDLE_EXPIRY: Duration = Duration::from_secs(300);

impl DestinationTable {
    #[must_use]
    pub fn new(initial: usize, peak: usize, average: usize) -> Self {
        Self {
            destinations: DashMap::new(),
            initial: initial.max(1),
            peak: peak.max(1),
            average: average.clamp(1, peak.max(1)),
        }
    }

    /// Whether a dispatch toward `key` may start now; reserves a slot when
    /// it may.
    pub fn try_reserve(&self, key: &DestKey, now: SystemTime) -> bool {
        let mut dest = self
            .destinations
            .entry(key.clone())
            .or_insert_with(|| Destination {
                active: 0,
                limit: self.initial,
                peak: self.peak,
                average: self.average,
                active_avg: 0.0,
                failures: 0,
                next_eligible: SystemTime::UNIX_EPOCH,
                idle_since: None,
            });
        if now < dest.next_eligible || dest.active >= dest.limit {
            return false;
        }
        dest.active += 1;
        dest.idle_since = None;
        true
    }

    /// Release a slot after the delivery finished and its results were
    /// recorded. The recipient DONE markers must already be on disk; the
    /// release makes the slot observable to other dispatches.
    pub fn release(&self, key: &DestKey, now: SystemTime) {
        if let Some(mut dest) = self.destinations.get_mut(key) {
            dest.active = dest.active.saturating_sub(1);
            if dest.active == 0 {
                dest.idle_since = Some(now);
            }
        }
    }

    /// A successful delivery: the destination is healthy again and its
    /// concurrency may grow back toward the effective limit.
    pub fn record_success(&self, key: &DestKey) {
        if let Some(mut dest) = self.destinations.get_mut(key) {
            dest.failures = 0;
            dest.next_eligible = SystemTime::UNIX_EPOCH;
            let limit = dest.limit.max(self.initial).min(dest.peak);
            dest.limit = limit;
        }
    }

    /// A soft failure: back the destination off exponentially with jitter,
    /// bounded by the configured maximum.
    ///
    /// Returns when the destination becomes eligible again.
    pub fn record_failure(
        &self,
        key: &DestKey,
        now: SystemTime,
        min_backoff_secs: u64,
        max_backoff_secs: u64,
    ) -> SystemTime {
        let mut dest = match self.destinations.get_mut(key) {
            Some(dest) => dest,
            None => return now,
        };
        dest.failures = dest.failures.saturating_add(1);
        let delay = retry_delay(dest.failures, min_backoff_secs, max_backoff_secs);
        dest.next_eligible = now + delay;
        debug!(destination = %key, failures = dest.failures, delay_secs = delay.as_secs(), "destination backed off");
        dest.next_eligible
    }

    /// When `key` may next be dispatched to, for retry-time bookkeeping.
    #[must_use]
    pub fn next_eligible(&self, key: &DestKey) -> SystemTime {
        self.destinations
            .get(key)
            .map_or(SystemTime::UNIX_EPOCH, |d| d.next_eligible)
    }

    /// Number of in-flight agents toward `key`.
    #[must_use]
    pub fn active(&self, key: &DestKey) -> usize {
        self.destinations.get(key).map_or(0, |d| d.active)
    }

    /// The effective concurrency limit toward `key`.
    #[must_use]
    pub fn limit(&self, key: &DestKey) -> usize {
        self.destinations.get(key).map_or(self.initial, |d| d.limit)
    }

    /// Forget every destination's failure history, used when an operator
    /// flushes the queue and wants delivery attempted right now.
    pub fn clear_backoff(&self) {
        for mut entry in self.destinations.iter_mut() {
            entry.failures = 0;
            entry.next_eligible = SystemTime::UNIX_EPOCH;
        }
    }

    /// One sampler tick: smooth active counts and modulate the effective
    /// limits. A destination whose peak equals its average keeps a static
    /// limit. Idle destinations past their expiry are dropped.
    pub fn sample(&self, now: SystemTime) {
        self.destinations.retain(|_, dest| {
            !dest
                .idle_since
                .is_some_and(|idle| now.duration_since(idle).unwrap_or_default() > IDLE_EXPIRY)
        });

        for mut entry in self.destinations.iter_mut() {
            let dest = entry.value_mut();
            if dest.peak == dest.average {
                continue;
            }
            #[allow(clippy::cast_precision_loss)]
            {
                dest.active_avg += (dest.active as f64 - dest.active_avg) / NSAMPLE;
            }
            #[allow(
                clippy::cast_precision_loss,
                clippy::cast_possible_truncation,
                clippy::cast_sign_loss
            )]
            let limit = if dest.active_avg >= dest.average as f64 {
                dest.average
            } else {
                let span = (dest.peak - dest.average) as f64;
                let decay = dest.active_avg * span / dest.average as f64;
                dest.peak - decay.round() as usize
            };
            dest.limit = limit.clamp(dest.average, dest.peak);
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.destinations.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.destinations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> SystemTime {
        SystemTime::now()
    }

    #[test]
    fn reservation_respects_the_limit() {
        let table = DestinationTable::new(2, 2, 2);
        let key = DestKey::new("smtp", "mx.example.net");

        assert!(table.try_reserve(&key, now()));
        assert!(table.try_reserve(&key, now()));
        assert!(!table.try_reserve(&key, now()));

        table.release(&key, now());
        assert!(table.try_reserve(&key, now()));
    }

    #[test]
    fn failure_backs_the_destination_off() {
        let table = DestinationTable::new(5, 20, 5);
        let key = DestKey::new("smtp", "dead.example.net");
        assert!(table.try_reserve(&key, now()));
        table.release(&key, now());

        let eligible = table.record_failure(&key, now(), 300, 4000);
        assert!(eligible > now());
        assert!(!table.try_reserve(&key, now()));

        // Eligible again once the backoff has elapsed.
        assert!(table.try_reserve(&key, eligible + Duration::from_secs(1)));
    }

    #[test]
    fn consecutive_failures_are_bounded_by_max_backoff() {
        let table = DestinationTable::new(5, 20, 5);
        let key = DestKey::new("smtp", "dead.example.net");
        table.try_reserve(&key, now());
        table.release(&key, now());

        let mut last = now();
        for _ in 0..30 {
            last = table.record_failure(&key, now(), 300, 4000);
        }
        let delay = last.duration_since(now()).unwrap_or_default();
        assert!(delay <= Duration::from_secs(4000 + 400), "delay {delay:?}");
    }

    #[test]
    fn success_resets_the_failure_history() {
        let table = DestinationTable::new(5, 20, 5);
        let key = DestKey::new("smtp", "flaky.example.net");
        table.try_reserve(&key, now());
        table.release(&key, now());

        table.record_failure(&key, now(), 300, 4000);
        table.record_success(&key);
        assert!(table.try_reserve(&key, now()));
    }

    #[test]
    fn static_limit_when_peak_equals_average() {
        let table = DestinationTable::new(4, 4, 4);
        let key = DestKey::new("smtp", "mx.example.net");
        table.try_reserve(&key, now());
        for _ in 0..10 {
            table.sample(now());
        }
        assert_eq!(table.limit(&key), 4);
    }

    #[test]
    fn sustained_load_decays_the_limit_toward_the_average() {
        let table = DestinationTable::new(10, 10, 2);
        let key = DestKey::new("smtp", "busy.example.net");
        // Hold many slots so the smoothed load climbs.
        for _ in 0..10 {
            table.try_reserve(&key, now());
        }
        for _ in 0..40 {
            table.sample(now());
        }
        assert_eq!(table.limit(&key), 2);

        // Load gone: the moving average decays and the limit recovers.
        for _ in 0..10 {
            table.release(&key, now());
        }
        for _ in 0..40 {
            table.sample(now());
        }
        assert!(table.limit(&key) > 2);
    }

    #[test]
    fn idle_destinations_expire() {
        let table = DestinationTable::new(5, 20, 5);
        let key = DestKey::new("smtp", "old.example.net");
        table.try_reserve(&key, now());
        table.release(&key, now());
        assert_eq!(table.len(), 1);

        table.sample(now() + IDLE_EXPIRY + Duration::from_secs(1));
        assert!(table.is_empty());
    }
}
