//! Adaptive sizing of sync time windows.
//!
//! A sync pass asks the server how many messages fall into a time window
//! ending at some point in time. Too many messages and the window is
//! bisected, assuming a linear message density; none at all and the window
//! grows for the next pass, never reaching further back than the oldest
//! sync date.

use chrono::{DateTime, Duration, Utc};

use crate::config::SyncConfig;
use crate::model::DateRange;

const MILLIS_PER_DAY: f64 = 86_400_000.0;

/// A window of `days` days ending at `end`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncWindow {
    /// Exclusive end of the window.
    pub end: DateTime<Utc>,
    /// Window length in (fractional) days.
    pub days: f64,
}

impl SyncWindow {
    /// Creates a window.
    #[must_use]
    pub const fn new(end: DateTime<Utc>, days: f64) -> Self {
        Self { end, days }
    }

    /// First window of a folder that has never been synced.
    #[must_use]
    pub fn initial(end: DateTime<Utc>, config: &SyncConfig) -> Self {
        let days = config.initial_sync_days.min(days_between(config.oldest_sync_date, end));
        Self::new(end, days.max(0.0))
    }

    /// Start of the window.
    #[must_use]
    pub fn start(&self) -> DateTime<Utc> {
        self.end - days_to_duration(self.days)
    }

    /// The window as a date range.
    #[must_use]
    pub fn range(&self) -> DateRange {
        DateRange::new(self.start(), self.end)
    }

    /// The adjacent window of `days` days just before this one.
    #[must_use]
    pub fn older(&self, days: f64) -> Self {
        Self::new(self.start(), days)
    }
}

/// What the caller should do with the window it just queried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowAction {
    /// Far too many messages: discard and re-issue with a smaller window.
    Bisect,
    /// Nothing found: use a larger window for the next pass.
    Grow,
    /// Process the window as it is.
    Accept,
}

/// Advice from [`next_window`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowAdvice {
    /// What to do.
    pub action: WindowAction,
    /// Window length for the next request.
    pub days: f64,
    /// The next window would start at (or was clamped to) the oldest
    /// permitted sync date; the caller should stop expanding.
    pub reached_beginning: bool,
}

/// Decides how to size the next request after `observed` messages were
/// reported for `window`.
#[must_use]
pub fn next_window(config: &SyncConfig, window: SyncWindow, observed: u32) -> WindowAdvice {
    let available = days_between(config.oldest_sync_date, window.end);

    if observed > config.too_many_messages {
        let scale = f64::from(config.bisect_date_at_n_messages) / f64::from(observed);
        let days = (window.days * scale).max(config.min_sync_window_days);
        if days < window.days {
            tracing::debug!(observed, from = window.days, to = days, "Bisecting sync window");
            return WindowAdvice {
                action: WindowAction::Bisect,
                days,
                reached_beginning: false,
            };
        }
        // Already as small as we go; take what we can get.
        tracing::warn!(observed, days = window.days, "Sync window too dense to bisect");
        return accept(window.days, available);
    }

    if observed == 0 {
        let grown = (window.days * config.time_scale_factor_on_no_messages)
            .min(config.max_sync_days);
        let older_available = days_between(config.oldest_sync_date, window.start());
        let reached_beginning = grown >= older_available;
        let days = grown.min(older_available).max(0.0);
        return WindowAdvice {
            action: WindowAction::Grow,
            days,
            reached_beginning,
        };
    }

    accept(window.days, available)
}

fn accept(days: f64, available: f64) -> WindowAdvice {
    WindowAdvice {
        action: WindowAction::Accept,
        days,
        reached_beginning: days >= available,
    }
}

/// Fractional days from `from` to `to` (zero if `to` is earlier).
#[must_use]
#[allow(clippy::cast_precision_loss)] // millisecond spans fit comfortably
pub fn days_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    ((to - from).num_milliseconds() as f64 / MILLIS_PER_DAY).max(0.0)
}

#[allow(clippy::cast_possible_truncation)]
fn days_to_duration(days: f64) -> Duration {
    Duration::milliseconds((days * MILLIS_PER_DAY).round() as i64)
}
