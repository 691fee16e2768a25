//! Reconnect backoff bookkeeping for one named resource.
//!
//! The endpoint counts consecutive connect failures, decides whether another
//! automatic attempt is worthwhile and owns the (single) timer that fires it.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;

use crate::config::SharedConfig;

/// Health of the resource as seen by the endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EndpointState {
    /// Last attempt succeeded (or none was made yet).
    #[default]
    Healthy,
    /// Failing, but another automatic attempt will be made.
    Unreachable,
    /// Given up; waits for an external trigger.
    Broken,
    /// Shut down; nothing will ever be scheduled again.
    Shutdown,
}

/// Consecutive-failure tracker and retry scheduler.
pub struct BackoffEndpoint {
    name: String,
    config: SharedConfig,
    state: EndpointState,
    consecutive_failures: u32,
    last_failure_at: Option<DateTime<Utc>>,
    scheduled_retry_at: Option<DateTime<Utc>>,
    pending: Option<JoinHandle<()>>,
}

impl BackoffEndpoint {
    /// Creates a healthy endpoint for the named resource.
    #[must_use]
    pub fn new(name: impl Into<String>, config: SharedConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: EndpointState::Healthy,
            consecutive_failures: 0,
            last_failure_at: None,
            scheduled_retry_at: None,
            pending: None,
        }
    }

    /// Resource name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> EndpointState {
        self.state
    }

    /// Failures since the last success.
    #[must_use]
    pub const fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// When the most recent failure was noted.
    #[must_use]
    pub const fn last_failure_at(&self) -> Option<DateTime<Utc>> {
        self.last_failure_at
    }

    /// When the pending retry is due, if one is pending.
    #[must_use]
    pub fn scheduled_retry_at(&self) -> Option<DateTime<Utc>> {
        if self.has_pending_retry() {
            self.scheduled_retry_at
        } else {
            None
        }
    }

    /// Whether a retry timer is armed and has not fired yet.
    #[must_use]
    pub fn has_pending_retry(&self) -> bool {
        self.pending.as_ref().is_some_and(|handle| !handle.is_finished())
    }

    /// Resets the failure count and cancels any scheduled retry.
    pub fn note_connect_success(&mut self) {
        if self.state == EndpointState::Shutdown {
            return;
        }
        if self.consecutive_failures > 0 {
            tracing::debug!(endpoint = %self.name, "Connection recovered");
        }
        self.cancel_pending();
        self.consecutive_failures = 0;
        self.state = EndpointState::Healthy;
    }

    /// Records a failure; returns whether the caller should retry.
    ///
    /// Only reachability-class failures are retried, and only while the
    /// failure count stays within the configured ceiling.
    pub fn note_connect_failure_maybe_retry(&mut self, reachable: bool) -> bool {
        if self.state == EndpointState::Shutdown {
            return false;
        }
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_failure_at = Some(Utc::now());

        let ceiling = self.config.current().backoff_max_failures;
        let retry = reachable && self.consecutive_failures <= ceiling;
        tracing::debug!(
            endpoint = %self.name,
            failures = self.consecutive_failures,
            reachable,
            retry,
            "Connect failure"
        );
        if retry {
            self.state = EndpointState::Unreachable;
        }
        retry
    }

    /// Marks the resource dead until something external retriggers it.
    pub fn note_broken_connection(&mut self) {
        if self.state == EndpointState::Shutdown {
            return;
        }
        tracing::warn!(
            endpoint = %self.name,
            failures = self.consecutive_failures,
            "Giving up on automatic reconnects"
        );
        self.cancel_pending();
        self.state = EndpointState::Broken;
    }

    /// Delay the next scheduled attempt would wait.
    ///
    /// Doubles per consecutive failure, capped by the configured maximum.
    #[must_use]
    pub fn retry_delay(&self) -> Duration {
        if self.consecutive_failures == 0 {
            return Duration::ZERO;
        }
        let config = self.config.current();
        let exponent = (self.consecutive_failures - 1).min(16);
        config
            .backoff_base_delay
            .saturating_mul(1 << exponent)
            .min(config.backoff_max_delay)
    }

    /// Arranges a single delayed invocation of `retry`.
    ///
    /// Returns `false` without scheduling anything when a retry is already
    /// pending or the endpoint is broken or shut down.
    pub fn schedule_connect_attempt<F>(&mut self, retry: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        if matches!(self.state, EndpointState::Broken | EndpointState::Shutdown) {
            return false;
        }
        if self.has_pending_retry() {
            tracing::debug!(endpoint = %self.name, "Retry already scheduled");
            return false;
        }

        let delay = self.retry_delay();
        let due_in = chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        self.scheduled_retry_at = Some(Utc::now() + due_in);
        tracing::info!(endpoint = %self.name, ?delay, "Scheduling reconnect");

        self.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            retry();
        }));
        true
    }

    /// Cancels any pending retry; the endpoint stays inert afterwards.
    pub fn shutdown(&mut self) {
        self.cancel_pending();
        self.state = EndpointState::Shutdown;
    }

    fn cancel_pending(&mut self) {
        if let Some(handle) = self.pending.take() {
            handle.abort();
        }
        self.scheduled_retry_at = None;
    }
}

impl Drop for BackoffEndpoint {
    fn drop(&mut self) {
        self.cancel_pending();
    }
}

impl std::fmt::Debug for BackoffEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackoffEndpoint")
            .field("name", &self.name)
            .field("state", &self.state)
            .field("consecutive_failures", &self.consecutive_failures)
            .field("pending_retry", &self.has_pending_retry())
            .finish_non_exhaustive()
    }
}
