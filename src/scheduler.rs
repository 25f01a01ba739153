//! Update-frequency policy.
//!
//! Every podcast carries a `frequency`: the estimated interval between new
//! episodes. It is derived from the gaps between item publish dates on each
//! successful parse, and inflated step by step while a podcast stays quiet so
//! that dormant feeds are checked less and less often. Selection of due
//! podcasts (the query side) lives in [`crate::storage`].

use chrono::{DateTime, TimeDelta, Utc};

use crate::feed::Feed;

/// Smallest inflation step applied; smaller factors would stall the
/// reschedule loop.
pub const MIN_INFLATION_FACTOR: f64 = 1e-4;

/// Tunable constants of the frequency policy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SchedulePolicy {
    /// Used when fewer than two items are available to measure a gap.
    pub default_frequency: TimeDelta,
    /// Lower clamp on every rescheduled frequency.
    pub min_frequency: TimeDelta,
    /// A podcast not parsed for this long is due regardless of its frequency.
    pub max_frequency: TimeDelta,
    /// Relative growth per inflation step.
    pub inflation_factor: f64,
}

impl Default for SchedulePolicy {
    fn default() -> Self {
        Self {
            default_frequency: TimeDelta::hours(24),
            min_frequency: TimeDelta::hours(1),
            max_frequency: TimeDelta::days(7),
            inflation_factor: 0.01,
        }
    }
}

impl SchedulePolicy {
    /// Minimum gap between chronologically adjacent item publish dates.
    ///
    /// Item order in the feed is irrelevant: dates are sorted before pairing.
    /// Falls back to `default_frequency` when fewer than two items exist.
    pub fn estimate_frequency(&self, feed: &Feed) -> TimeDelta {
        let dates: Vec<DateTime<Utc>> = feed.items.iter().map(|item| item.pub_date).collect();
        self.estimate_from_dates(&dates)
    }

    pub fn estimate_from_dates(&self, dates: &[DateTime<Utc>]) -> TimeDelta {
        let mut sorted = dates.to_vec();
        sorted.sort_unstable_by(|a, b| b.cmp(a));

        sorted
            .windows(2)
            .map(|pair| pair[0] - pair[1])
            .min()
            .unwrap_or(self.default_frequency)
    }

    /// Inflates `frequency` until `pub_date + frequency` lies in the future.
    ///
    /// A missing `pub_date` yields `default_frequency`. The result is never
    /// below `min_frequency`; there is no upper clamp on this path.
    pub fn reschedule(&self, pub_date: Option<DateTime<Utc>>, frequency: TimeDelta) -> TimeDelta {
        self.reschedule_at(pub_date, frequency, Utc::now())
    }

    /// [`reschedule`](Self::reschedule) against an explicit clock.
    pub fn reschedule_at(
        &self,
        pub_date: Option<DateTime<Utc>>,
        frequency: TimeDelta,
        now: DateTime<Utc>,
    ) -> TimeDelta {
        let Some(pub_date) = pub_date else {
            return self.default_frequency.max(self.min_frequency);
        };

        // Zero or negative frequencies can never be inflated past `now`.
        let mut seconds = if frequency > TimeDelta::zero() {
            frequency.num_milliseconds() as f64 / 1000.0
        } else {
            self.min_frequency.num_seconds() as f64
        };

        let elapsed = (now - pub_date).num_milliseconds() as f64 / 1000.0;
        let factor = 1.0 + self.inflation_factor.max(MIN_INFLATION_FACTOR);

        while seconds <= elapsed {
            seconds *= factor;
        }

        // Round up so truncation can never land back on `elapsed`.
        let inflated = TimeDelta::milliseconds((seconds * 1000.0).ceil() as i64);
        inflated.max(self.min_frequency)
    }

    /// Frequency for a freshly parsed feed: estimate, then reschedule from the
    /// latest item.
    pub fn schedule(&self, feed: &Feed) -> TimeDelta {
        self.reschedule(feed.pub_date, self.estimate_frequency(feed))
    }
}
