//! Fixed-window rate limiter per provider.
//!
//! `check` both reports the window's utilization and admits the request when
//! capacity remains. Limits can be reconfigured at runtime, backed off after
//! overload signals and recovered to their configured values; every change
//! resets the window.

use crate::error::{OrchestrationError, Result};
use crate::events::{CoreEvent, EventBus};
use crate::server::duration_ms;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Utilization samples kept for tuning.
const SAMPLE_WINDOW: usize = 10;

/// Samples required before a tuning suggestion is made.
const MIN_SAMPLES: usize = 5;

/// Average utilization (percent) below which raising the limit is suggested.
const UNDERUSED_PERCENT: f64 = 30.0;

/// Average utilization (percent) above which lowering the limit is suggested.
const SATURATED_PERCENT: f64 = 85.0;

/// Utilization (percent) from which callers are asked to slow down.
const NEAR_LIMIT_PERCENT: f64 = 80.0;

/// Longest window an adjustment or backoff may produce.
const MAX_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

/// Change to a provider's request limit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LimitChange {
    /// Keep the limit in force.
    #[default]
    Keep,
    /// Allow this many requests per window.
    Set(u32),
    /// Remove the limit.
    Unlimited,
}

impl From<Option<u32>> for LimitChange {
    fn from(limit: Option<u32>) -> Self {
        limit.map_or(Self::Keep, Self::Set)
    }
}

/// Rate limit configuration for a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitSettings {
    /// Requests allowed per window; `None` means unlimited.
    pub limit: Option<u32>,
    /// Window length.
    pub window: Duration,
    /// Apply tuning suggestions automatically.
    pub auto_tune: bool,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self { limit: None, window: Duration::from_secs(60), auto_tune: false }
    }
}

/// Result of a rate-limit check.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimitStatus {
    /// Provider name.
    pub provider: String,
    /// Whether this request was admitted.
    pub allowed: bool,
    /// Whether the window's limit has been reached.
    pub exceeded: bool,
    /// Requests allowed per window.
    pub limit: Option<u32>,
    /// Requests admitted in the current window.
    pub current_count: u32,
    /// Requests still admissible in the current window.
    pub remaining: Option<u32>,
    /// Percentage of the window's limit in use.
    pub utilization: f64,
    /// Window length.
    pub window_ms: u64,
    /// Time until the window restarts.
    pub time_until_reset_ms: u64,
    /// Recommended delay before the next request.
    pub retry_after_ms: u64,
    /// When the current window started.
    pub window_start: DateTime<Utc>,
}

/// Advisory change to a provider's limit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TuningSuggestion {
    /// Provider name.
    pub provider: String,
    /// Limit in force.
    pub current_limit: u32,
    /// Suggested limit.
    pub suggested_limit: u32,
    /// Average utilization over the sampled checks.
    pub average_utilization: f64,
    /// Why the change is suggested.
    pub reason: String,
    /// Whether the suggestion was applied.
    pub applied: bool,
}

#[derive(Debug, Clone)]
struct Window {
    configured: RateLimitSettings,
    limit: Option<u32>,
    window: Duration,
    current_count: u32,
    window_start: Instant,
    window_started_at: DateTime<Utc>,
    samples: VecDeque<f64>,
}

impl Window {
    fn new(settings: RateLimitSettings) -> Self {
        Self {
            configured: settings,
            limit: settings.limit,
            window: settings.window,
            current_count: 0,
            window_start: Instant::now(),
            window_started_at: Utc::now(),
            samples: VecDeque::with_capacity(SAMPLE_WINDOW),
        }
    }

    fn roll(&mut self) {
        if self.window_start.elapsed() >= self.window {
            self.restart();
        }
    }

    fn restart(&mut self) {
        self.current_count = 0;
        self.window_start = Instant::now();
        self.window_started_at = Utc::now();
    }

    fn utilization(&self) -> f64 {
        match self.limit {
            Some(limit) if limit > 0 => (f64::from(self.current_count) / f64::from(limit) * 100.0).min(100.0),
            _ => 0.0,
        }
    }

    fn exceeded(&self) -> bool {
        self.limit.is_some_and(|limit| self.current_count >= limit)
    }

    fn status(&self, provider: &str, allowed: bool) -> RateLimitStatus {
        let time_until_reset = self.window.saturating_sub(self.window_start.elapsed());
        let utilization = self.utilization();
        let exceeded = self.exceeded();
        let retry_after = if exceeded {
            time_until_reset
        } else if utilization >= NEAR_LIMIT_PERCENT {
            time_until_reset / 4
        } else {
            Duration::ZERO
        };

        RateLimitStatus {
            provider: provider.to_string(),
            allowed,
            exceeded,
            limit: self.limit,
            current_count: self.current_count,
            remaining: self.limit.map(|limit| limit.saturating_sub(self.current_count)),
            utilization,
            window_ms: duration_ms(self.window),
            time_until_reset_ms: duration_ms(time_until_reset),
            retry_after_ms: duration_ms(retry_after),
            window_start: self.window_started_at,
        }
    }

    fn sample(&mut self) {
        if self.samples.len() == SAMPLE_WINDOW {
            self.samples.pop_front();
        }
        self.samples.push_back(self.utilization());
    }
}

/// Rate limiter for every known provider.
pub struct RateLimiter {
    windows: Mutex<HashMap<String, Window>>,
    defaults: RateLimitSettings,
    events: EventBus,
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter").field("defaults", &self.defaults).finish_non_exhaustive()
    }
}

impl RateLimiter {
    /// Creates a rate limiter.
    ///
    /// # Arguments
    /// * `defaults` - Settings for providers that were never configured
    /// * `events` - Sink for limit adjustments
    #[must_use]
    pub fn new(defaults: RateLimitSettings, events: EventBus) -> Self {
        Self { windows: Mutex::new(HashMap::new()), defaults, events }
    }

    fn windows(&self) -> MutexGuard<'_, HashMap<String, Window>> {
        self.windows.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_window<T>(&self, provider: &str, f: impl FnOnce(&mut Window) -> T) -> T {
        let mut windows = self.windows();
        let window = windows.entry(provider.to_string()).or_insert_with(|| Window::new(self.defaults));
        window.roll();
        f(window)
    }

    /// Sets a provider's configured limit and starts a fresh window.
    pub fn configure(&self, provider: &str, settings: RateLimitSettings) {
        self.windows().insert(provider.to_string(), Window::new(settings));
        debug!(provider = %provider, limit = ?settings.limit, window = ?settings.window, "Configured rate limit");
    }

    /// Admits a request if the current window has capacity.
    ///
    /// # Returns
    /// The window's status; `allowed` is false and `exceeded` true once the limit is reached.
    pub fn check(&self, provider: &str) -> RateLimitStatus {
        let status = self.with_window(provider, |window| {
            let allowed = !window.exceeded();
            if allowed {
                window.current_count += 1;
            }
            window.sample();
            window.status(provider, allowed)
        });

        if !status.allowed {
            warn!(provider = %provider, retry_after_ms = status.retry_after_ms, "Rate limit exceeded");
        }
        status
    }

    /// Reports the current window without admitting a request.
    pub fn status(&self, provider: &str) -> RateLimitStatus {
        self.with_window(provider, |window| {
            let allowed = !window.exceeded();
            window.status(provider, allowed)
        })
    }

    /// Reconfigures a provider's limit and/or window, resetting the counters.
    ///
    /// `limit` accepts a [`LimitChange`]; `Some(n)` sets and `None` keeps the
    /// current limit. The new values become the provider's configured baseline.
    ///
    /// # Errors
    /// Returns `OrchestrationError::InvalidAdjustment` for a zero limit, or a
    /// window that is zero or longer than a day.
    pub fn adjust(
        &self,
        provider: &str,
        limit: impl Into<LimitChange>,
        window: Option<Duration>,
    ) -> Result<RateLimitStatus> {
        let limit = limit.into();
        if limit == LimitChange::Set(0) {
            return Err(OrchestrationError::InvalidAdjustment("limit must be positive".into()));
        }
        if window.is_some_and(|w| w.is_zero()) {
            return Err(OrchestrationError::InvalidAdjustment("window must be positive".into()));
        }
        if window.is_some_and(|w| w > MAX_WINDOW) {
            return Err(OrchestrationError::InvalidAdjustment(format!(
                "window must not exceed {}s",
                MAX_WINDOW.as_secs()
            )));
        }

        let status = self.with_window(provider, |w| {
            match limit {
                LimitChange::Keep => {}
                LimitChange::Set(limit) => {
                    w.limit = Some(limit);
                    w.configured.limit = Some(limit);
                }
                LimitChange::Unlimited => {
                    w.limit = None;
                    w.configured.limit = None;
                }
            }
            if let Some(window) = window {
                w.window = window;
                w.configured.window = window;
            }
            w.restart();
            w.status(provider, true)
        });
        self.announce(&status, "adjusted");
        Ok(status)
    }

    /// Zeroes a provider's counters and starts a fresh window.
    pub fn reset(&self, provider: &str) -> RateLimitStatus {
        let status = self.with_window(provider, |w| {
            w.restart();
            w.samples.clear();
            w.status(provider, true)
        });
        info!(provider = %provider, "Rate limit reset");
        status
    }

    /// Backs off after an overload signal: the window grows and the limit shrinks by `factor`.
    ///
    /// # Errors
    /// Returns `OrchestrationError::InvalidAdjustment` if `factor` is below 1,
    /// not finite, or would stretch the window past a day. The window is left
    /// unchanged in that case.
    pub fn backoff(&self, provider: &str, factor: f64) -> Result<RateLimitStatus> {
        if !factor.is_finite() || factor < 1.0 {
            return Err(OrchestrationError::InvalidAdjustment(format!(
                "backoff factor must be at least 1, got {factor}"
            )));
        }

        let status = self.with_window(provider, |w| {
            let window = Duration::try_from_secs_f64(w.window.as_secs_f64() * factor)
                .ok()
                .filter(|window| *window <= MAX_WINDOW)
                .ok_or_else(|| {
                    OrchestrationError::InvalidAdjustment(format!(
                        "backoff x{factor} would stretch the window past {}s",
                        MAX_WINDOW.as_secs()
                    ))
                })?;
            w.window = window;
            w.limit = w.limit.map(|limit| scale(limit, 1.0 / factor));
            w.restart();
            Ok::<_, OrchestrationError>(w.status(provider, true))
        })?;
        self.announce(&status, &format!("backoff x{factor}"));
        Ok(status)
    }

    /// Restores a provider's configured limit and window.
    pub fn recover(&self, provider: &str) -> RateLimitStatus {
        let status = self.with_window(provider, |w| {
            w.limit = w.configured.limit;
            w.window = w.configured.window;
            w.restart();
            w.status(provider, true)
        });
        self.announce(&status, "recovered");
        status
    }

    /// Suggests a limit change from recent utilization.
    ///
    /// Persistently low utilization suggests +20%, persistently high utilization
    /// suggests -20%. The suggestion is applied only when auto-tuning is enabled
    /// for the provider.
    pub fn auto_tune(&self, provider: &str) -> Option<TuningSuggestion> {
        let suggestion = self.with_window(provider, |w| {
            let current = w.limit?;
            if w.samples.len() < MIN_SAMPLES {
                return None;
            }
            #[allow(clippy::cast_precision_loss)] // Bounded by SAMPLE_WINDOW
            let average = w.samples.iter().sum::<f64>() / w.samples.len() as f64;

            let (suggested, reason) = if average < UNDERUSED_PERCENT {
                (scale(current, 1.2).max(current + 1), "utilization persistently low")
            } else if average > SATURATED_PERCENT {
                (scale(current, 0.8).min(current.saturating_sub(1).max(1)), "utilization persistently high")
            } else {
                return None;
            };
            if suggested == current {
                return None;
            }

            let applied = w.configured.auto_tune;
            if applied {
                w.limit = Some(suggested);
                w.configured.limit = Some(suggested);
                w.samples.clear();
                w.restart();
            }
            Some((
                TuningSuggestion {
                    provider: provider.to_string(),
                    current_limit: current,
                    suggested_limit: suggested,
                    average_utilization: average,
                    reason: reason.to_string(),
                    applied,
                },
                w.status(provider, true),
            ))
        });

        let (suggestion, status) = suggestion?;
        if suggestion.applied {
            self.announce(&status, "auto_tune");
        } else {
            debug!(
                provider = %provider,
                current = suggestion.current_limit,
                suggested = suggestion.suggested_limit,
                "Rate limit tuning suggested"
            );
        }
        Some(suggestion)
    }

    fn announce(&self, status: &RateLimitStatus, reason: &str) {
        info!(provider = %status.provider, limit = ?status.limit, window_ms = status.window_ms, reason = %reason, "Rate limit adjusted");
        self.events.emit(CoreEvent::RateLimitAdjusted {
            provider: status.provider.clone(),
            limit: status.limit,
            window_ms: status.window_ms,
            reason: reason.to_string(),
        });
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitSettings::default(), EventBus::default())
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)] // Clamped to u32 range
fn scale(limit: u32, factor: f64) -> u32 {
    (f64::from(limit) * factor).round().clamp(1.0, f64::from(u32::MAX)) as u32
}
