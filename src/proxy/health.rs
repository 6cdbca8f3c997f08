//! Per-endpoint rolling outcome window and blacklist transitions.
//!
//! An endpoint is blacklisted when its window holds more than one outcome
//! and every one of them is a blacklist-eligible failure. It sits out for
//! the recovery period, comes back as `Recovering`, and is `Healthy` again
//! after one more success.

use serde::Serialize;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::config::{EndpointConfig, HealthConfig};
use crate::error::ErrorCategory;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Recovering,
    Degraded,
    Blacklisted,
}

impl HealthStatus {
    /// Selection order, lower is better.
    pub fn rank(&self) -> u8 {
        match self {
            HealthStatus::Healthy => 0,
            HealthStatus::Recovering => 1,
            HealthStatus::Degraded => 2,
            HealthStatus::Blacklisted => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthSettings {
    pub window: Duration,
    pub recovery: Duration,
}

impl From<HealthConfig> for HealthSettings {
    fn from(config: HealthConfig) -> Self {
        Self {
            window: Duration::from_secs(config.window_secs),
            recovery: Duration::from_secs(config.recovery_secs),
        }
    }
}

impl Default for HealthSettings {
    fn default() -> Self {
        HealthConfig::default().into()
    }
}

/// `<category>_safe` toggles: a safe category never blacklists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlacklistPolicy {
    pub business_error_safe: bool,
    pub config_error_safe: bool,
    pub server_error_safe: bool,
}

impl BlacklistPolicy {
    pub fn from_endpoint(config: &EndpointConfig) -> Self {
        Self {
            business_error_safe: config.business_error_safe,
            config_error_safe: config.config_error_safe,
            server_error_safe: config.server_error_safe,
        }
    }

    pub fn is_eligible(&self, category: ErrorCategory) -> bool {
        match category {
            ErrorCategory::Business => !self.business_error_safe,
            ErrorCategory::Config => !self.config_error_safe,
            ErrorCategory::Server => !self.server_error_safe,
        }
    }
}

impl Default for BlacklistPolicy {
    fn default() -> Self {
        Self {
            business_error_safe: true,
            config_error_safe: false,
            server_error_safe: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success,
    Failure { eligible: bool },
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    at: Instant,
    outcome: Outcome,
}

#[derive(Debug, Clone)]
pub struct HealthState {
    samples: VecDeque<Sample>,
    status: HealthStatus,
    blacklisted_at: Option<Instant>,
    reason: Option<String>,
    last_latency: Option<Duration>,
}

impl Default for HealthState {
    fn default() -> Self {
        Self {
            samples: VecDeque::new(),
            status: HealthStatus::Healthy,
            blacklisted_at: None,
            reason: None,
            last_latency: None,
        }
    }
}

impl HealthState {
    pub fn status(&self) -> HealthStatus {
        self.status
    }

    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    pub fn last_latency(&self) -> Option<Duration> {
        self.last_latency
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    pub fn blacklisted_at(&self) -> Option<Instant> {
        self.blacklisted_at
    }

    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(front) = self.samples.front() {
            if now.saturating_duration_since(front.at) > window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    fn has_eligible_failures(&self) -> bool {
        self.samples
            .iter()
            .any(|s| s.outcome == Outcome::Failure { eligible: true })
    }

    fn all_eligible_failures(&self) -> bool {
        self.samples.len() > 1
            && self
                .samples
                .iter()
                .all(|s| s.outcome == Outcome::Failure { eligible: true })
    }

    /// Age out samples and apply time-based transitions.
    pub fn refresh(&mut self, now: Instant, settings: &HealthSettings) -> HealthStatus {
        self.prune(now, settings.window);
        match self.status {
            HealthStatus::Blacklisted => {
                let elapsed = self
                    .blacklisted_at
                    .map(|at| now.saturating_duration_since(at))
                    .unwrap_or(settings.recovery);
                if elapsed >= settings.recovery {
                    self.enter_recovering();
                }
            }
            HealthStatus::Degraded if !self.has_eligible_failures() => {
                self.status = HealthStatus::Healthy;
            }
            _ => {}
        }
        self.status
    }

    pub fn record_success(&mut self, now: Instant, latency: Option<Duration>, settings: &HealthSettings) {
        self.prune(now, settings.window);
        self.samples.push_back(Sample {
            at: now,
            outcome: Outcome::Success,
        });
        if latency.is_some() {
            self.last_latency = latency;
        }
        self.status = match self.status {
            HealthStatus::Blacklisted => {
                self.blacklisted_at = None;
                HealthStatus::Recovering
            }
            HealthStatus::Recovering => {
                self.reason = None;
                HealthStatus::Healthy
            }
            _ if self.has_eligible_failures() => HealthStatus::Degraded,
            _ => HealthStatus::Healthy,
        };
    }

    /// Returns `true` when this failure blacklisted the endpoint.
    pub fn record_failure(
        &mut self,
        now: Instant,
        category: ErrorCategory,
        detail: &str,
        policy: &BlacklistPolicy,
        settings: &HealthSettings,
    ) -> bool {
        self.prune(now, settings.window);
        let eligible = policy.is_eligible(category);
        self.samples.push_back(Sample {
            at: now,
            outcome: Outcome::Failure { eligible },
        });

        if self.status == HealthStatus::Blacklisted || !eligible {
            return false;
        }

        if self.status == HealthStatus::Recovering || self.all_eligible_failures() {
            self.status = HealthStatus::Blacklisted;
            self.blacklisted_at = Some(now);
            self.reason = Some(format!("{}: {}", category.as_str(), truncate(detail, 200)));
            return true;
        }

        self.status = HealthStatus::Degraded;
        false
    }

    /// Manual recovery: a blacklisted endpoint goes back into rotation.
    pub fn manual_recover(&mut self) {
        if self.status == HealthStatus::Blacklisted {
            self.enter_recovering();
        }
    }

    fn enter_recovering(&mut self) {
        self.status = HealthStatus::Recovering;
        self.blacklisted_at = None;
        self.samples.clear();
    }
}

/// Category for a non-2xx upstream reply.
///
/// 401/403/422 are configuration problems; 408, 429 and 5xx are server
/// problems; any other 4xx is a caller-content problem when it carries a
/// structured error payload, otherwise a configuration problem (wrong path,
/// proxy HTML page).
pub fn classify_status(status: u16, body: &str) -> ErrorCategory {
    match status {
        401 | 403 | 422 => ErrorCategory::Config,
        408 | 429 => ErrorCategory::Server,
        s if s >= 500 => ErrorCategory::Server,
        s if (400..500).contains(&s) => {
            if has_error_payload(body) {
                ErrorCategory::Business
            } else {
                ErrorCategory::Config
            }
        }
        _ => ErrorCategory::Server,
    }
}

fn has_error_payload(body: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(body)
        .map(|v| v.get("error").is_some() || v.get("message").is_some() || v.get("detail").is_some())
        .unwrap_or(false)
}

fn truncate(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> HealthSettings {
        HealthSettings {
            window: Duration::from_secs(60),
            recovery: Duration::from_secs(300),
        }
    }

    fn policy(server_error_safe: bool) -> BlacklistPolicy {
        BlacklistPolicy {
            server_error_safe,
            ..BlacklistPolicy::default()
        }
    }

    #[test]
    fn test_classify_status() {
        let structured = r#"{"error":{"type":"invalid_request_error","message":"bad model"}}"#;
        assert_eq!(classify_status(400, structured), ErrorCategory::Business);
        assert_eq!(classify_status(404, "<html>not found</html>"), ErrorCategory::Config);
        assert_eq!(classify_status(401, structured), ErrorCategory::Config);
        assert_eq!(classify_status(403, ""), ErrorCategory::Config);
        assert_eq!(classify_status(422, structured), ErrorCategory::Config);
        assert_eq!(classify_status(429, structured), ErrorCategory::Server);
        assert_eq!(classify_status(503, ""), ErrorCategory::Server);
    }

    #[test]
    fn test_two_server_errors_blacklist() {
        let s = settings();
        let mut state = HealthState::default();
        let t0 = Instant::now();

        assert!(!state.record_failure(t0, ErrorCategory::Server, "502", &policy(false), &s));
        assert_eq!(state.status(), HealthStatus::Degraded);
        assert!(state.record_failure(
            t0 + Duration::from_secs(1),
            ErrorCategory::Server,
            "503",
            &policy(false),
            &s
        ));
        assert_eq!(state.status(), HealthStatus::Blacklisted);
        assert!(state.reason().unwrap().starts_with("server_error"));
    }

    #[test]
    fn test_safe_category_never_blacklists() {
        let s = settings();
        let mut state = HealthState::default();
        let t0 = Instant::now();
        for i in 0..5 {
            state.record_failure(t0 + Duration::from_secs(i), ErrorCategory::Server, "502", &policy(true), &s);
        }
        assert_ne!(state.status(), HealthStatus::Blacklisted);
    }

    #[test]
    fn test_single_failure_is_not_enough() {
        let s = settings();
        let mut state = HealthState::default();
        let t0 = Instant::now();
        assert!(!state.record_failure(t0, ErrorCategory::Config, "401", &policy(false), &s));
        assert_ne!(state.status(), HealthStatus::Blacklisted);
    }

    #[test]
    fn test_success_in_window_prevents_blacklist() {
        let s = settings();
        let mut state = HealthState::default();
        let t0 = Instant::now();
        state.record_success(t0, Some(Duration::from_millis(120)), &s);
        state.record_failure(t0 + Duration::from_secs(1), ErrorCategory::Server, "x", &policy(false), &s);
        state.record_failure(t0 + Duration::from_secs(2), ErrorCategory::Server, "x", &policy(false), &s);
        assert_eq!(state.status(), HealthStatus::Degraded);
    }

    #[test]
    fn test_business_errors_do_not_count_by_default() {
        let s = settings();
        let mut state = HealthState::default();
        let t0 = Instant::now();
        state.record_failure(t0, ErrorCategory::Business, "bad model", &BlacklistPolicy::default(), &s);
        state.record_failure(t0, ErrorCategory::Business, "bad model", &BlacklistPolicy::default(), &s);
        assert_eq!(state.status(), HealthStatus::Healthy);
    }

    #[test]
    fn test_old_samples_age_out_by_time() {
        let s = settings();
        let mut state = HealthState::default();
        let t0 = Instant::now();
        state.record_failure(t0, ErrorCategory::Server, "x", &policy(false), &s);
        assert!(!state.record_failure(
            t0 + Duration::from_secs(120),
            ErrorCategory::Server,
            "x",
            &policy(false),
            &s
        ));
        assert_eq!(state.sample_count(), 1);
        assert_eq!(state.refresh(t0 + Duration::from_secs(400), &s), HealthStatus::Healthy);
    }

    #[test]
    fn test_recovery_cycle() {
        let s = settings();
        let mut state = HealthState::default();
        let t0 = Instant::now();
        state.record_failure(t0, ErrorCategory::Server, "x", &policy(false), &s);
        state.record_failure(t0, ErrorCategory::Server, "x", &policy(false), &s);
        assert_eq!(state.refresh(t0 + Duration::from_secs(10), &s), HealthStatus::Blacklisted);
        assert_eq!(state.refresh(t0 + Duration::from_secs(301), &s), HealthStatus::Recovering);

        state.record_success(t0 + Duration::from_secs(302), None, &s);
        assert_eq!(state.status(), HealthStatus::Healthy);
        assert!(state.reason().is_none());
    }

    #[test]
    fn test_failure_while_recovering_blacklists_again() {
        let s = settings();
        let mut state = HealthState::default();
        let t0 = Instant::now();
        state.record_failure(t0, ErrorCategory::Server, "x", &policy(false), &s);
        state.record_failure(t0, ErrorCategory::Server, "x", &policy(false), &s);
        state.manual_recover();
        assert_eq!(state.status(), HealthStatus::Recovering);
        assert!(state.record_failure(t0, ErrorCategory::Server, "x", &policy(false), &s));
        assert_eq!(state.status(), HealthStatus::Blacklisted);
    }
}
