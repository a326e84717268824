use crate::config::RetryConfig;
use crate::proxy::classify::{is_retryable_status, ErrorContext, ErrorKind};
use std::time::Duration;

/// Terminal disposition carried by a decision. `None` means the request is
/// not terminal yet (a retry, switch, or suspension follows).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalStatus {
    None,
    Cancelled,
    AuthError,
    RateLimited,
    Error,
    StreamError,
}

impl FinalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinalStatus::None => "",
            FinalStatus::Cancelled => "cancelled",
            FinalStatus::AuthError => "auth_error",
            FinalStatus::RateLimited => "rate_limited",
            FinalStatus::Error => "error",
            FinalStatus::StreamError => "stream_error",
        }
    }

    /// Status code sent to the client when no upstream status is available.
    pub fn fallback_http_status(&self) -> u16 {
        match self {
            FinalStatus::Cancelled => 499,
            FinalStatus::AuthError => 401,
            FinalStatus::RateLimited => 429,
            FinalStatus::None | FinalStatus::Error | FinalStatus::StreamError => 502,
        }
    }
}

/// What to do after one failed attempt.
///
/// At most one of the three action flags dominates: suspension is consulted
/// first by handlers, then same-endpoint retry, then endpoint switch; with
/// all three unset the decision is terminal. `delay` is meaningful only when
/// `retry_same_endpoint` is set.
#[derive(Debug, Clone)]
pub struct RetryDecision {
    pub retry_same_endpoint: bool,
    pub switch_endpoint: bool,
    pub suspend_request: bool,
    pub delay: Duration,
    pub final_status: FinalStatus,
    pub reason: String,
}

impl RetryDecision {
    fn terminate(final_status: FinalStatus, reason: impl Into<String>) -> Self {
        Self {
            retry_same_endpoint: false,
            switch_endpoint: false,
            suspend_request: false,
            delay: Duration::ZERO,
            final_status,
            reason: reason.into(),
        }
    }

    fn retry_same(delay: Duration, reason: impl Into<String>) -> Self {
        Self {
            retry_same_endpoint: true,
            switch_endpoint: false,
            suspend_request: false,
            delay,
            final_status: FinalStatus::None,
            reason: reason.into(),
        }
    }

    fn switch(reason: impl Into<String>) -> Self {
        Self {
            retry_same_endpoint: false,
            switch_endpoint: true,
            suspend_request: false,
            delay: Duration::ZERO,
            final_status: FinalStatus::None,
            reason: reason.into(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !self.retry_same_endpoint && !self.switch_endpoint && !self.suspend_request
    }
}

/// Pure retry decision function. Writes no state; identical inputs yield
/// identical decisions.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    cfg: RetryConfig,
}

impl RetryPolicy {
    pub fn new(cfg: RetryConfig) -> Self {
        Self { cfg }
    }

    pub fn max_attempts(&self) -> u32 {
        self.cfg.max_attempts
    }

    /// Decide the next step after a failed attempt.
    ///
    /// `local_attempt` counts attempts against the current endpoint (1-based);
    /// `global_attempt` counts attempts across all endpoints for this request
    /// and bounds rate-limit persistence.
    pub fn decide(
        &self,
        ctx: &ErrorContext,
        local_attempt: u32,
        global_attempt: u32,
        is_streaming: bool,
    ) -> RetryDecision {
        match ctx.kind {
            ErrorKind::ClientCancel => {
                RetryDecision::terminate(FinalStatus::Cancelled, "cancelled by client")
            }

            // 401 means bad credentials for this endpoint's token. Switching
            // endpoints would mask a configuration problem, so surface it.
            ErrorKind::Auth => {
                RetryDecision::terminate(FinalStatus::AuthError, "upstream authentication failed")
            }

            ErrorKind::RateLimit => self.decide_rate_limit(ctx, local_attempt, global_attempt),

            ErrorKind::ServerError | ErrorKind::Network | ErrorKind::Timeout => {
                if local_attempt < self.cfg.max_attempts {
                    let delay = self.backoff_delay(local_attempt);
                    RetryDecision::retry_same(
                        delay,
                        format!("{} (attempt {}/{})", ctx.kind.as_str(), local_attempt, self.cfg.max_attempts),
                    )
                } else {
                    RetryDecision::switch(format!(
                        "{} persisted after {} attempts",
                        ctx.kind.as_str(),
                        local_attempt
                    ))
                }
            }

            ErrorKind::Http => {
                let status = ctx.http_status.unwrap_or(0);
                if is_retryable_status(status) {
                    RetryDecision::switch(format!("HTTP {} may be endpoint-local", status))
                } else {
                    RetryDecision::terminate(
                        FinalStatus::Error,
                        format!("non-retryable HTTP {}", status),
                    )
                }
            }

            // Bytes already left for the client; a second endpoint would
            // corrupt the stream.
            ErrorKind::Stream => {
                RetryDecision::terminate(FinalStatus::StreamError, ctx.message.clone())
            }

            ErrorKind::Parsing => {
                if is_streaming {
                    RetryDecision::terminate(FinalStatus::StreamError, ctx.message.clone())
                } else {
                    self.decide_unknown(local_attempt)
                }
            }

            // The handler resolves the relaxed-candidate fallback itself;
            // reaching the policy means only suspension can still help.
            ErrorKind::NoHealthyEndpoints => RetryDecision {
                retry_same_endpoint: false,
                switch_endpoint: false,
                suspend_request: true,
                delay: Duration::ZERO,
                final_status: FinalStatus::Error,
                reason: "no healthy endpoints available".to_string(),
            },

            ErrorKind::Unknown => self.decide_unknown(local_attempt),
        }
    }

    fn decide_rate_limit(
        &self,
        ctx: &ErrorContext,
        local_attempt: u32,
        global_attempt: u32,
    ) -> RetryDecision {
        if global_attempt < self.cfg.max_attempts {
            // Honor an upstream Retry-After hint when it is tighter than our
            // own backoff would be; cap both at max_delay.
            let delay = match ctx.retryable_after {
                Some(hint) => hint.min(self.cfg.max_delay()),
                None => self.backoff_delay(local_attempt),
            };
            return RetryDecision::retry_same(
                delay,
                format!("rate limited (global attempt {}/{})", global_attempt, self.cfg.max_attempts),
            );
        }

        // Budget spent on this endpoint — move on, and let the handler park
        // the request if every endpoint turns out to be saturated.
        RetryDecision {
            retry_same_endpoint: false,
            switch_endpoint: true,
            suspend_request: true,
            delay: Duration::ZERO,
            final_status: FinalStatus::RateLimited,
            reason: format!("rate limit persisted through {} global attempts", global_attempt),
        }
    }

    fn decide_unknown(&self, local_attempt: u32) -> RetryDecision {
        if local_attempt < self.cfg.max_attempts {
            RetryDecision::retry_same(
                self.backoff_delay(local_attempt),
                format!("unclassified error (attempt {}/{})", local_attempt, self.cfg.max_attempts),
            )
        } else {
            RetryDecision::switch("unclassified error persisted")
        }
    }

    /// `base_delay × multiplier^(local_attempt-1)`, capped at `max_delay`.
    pub fn backoff_delay(&self, local_attempt: u32) -> Duration {
        let exponent = local_attempt.saturating_sub(1).min(30);
        let millis = self.cfg.base_delay_ms as f64 * self.cfg.multiplier.powi(exponent as i32);
        let capped = millis.min(self.cfg.max_delay_ms as f64);
        Duration::from_millis(capped as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ForwardError;
    use crate::proxy::classify::build_context;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            max_attempts: 3,
            base_delay_ms: 100,
            multiplier: 2.0,
            max_delay_ms: 1000,
        })
    }

    fn ctx_for(err: &ForwardError) -> ErrorContext {
        build_context("req_1", "primary", "main", 1, 3, err, None)
    }

    #[test]
    fn test_backoff_progression_and_cap() {
        let p = policy();
        assert_eq!(p.backoff_delay(1), Duration::from_millis(100));
        assert_eq!(p.backoff_delay(2), Duration::from_millis(200));
        assert_eq!(p.backoff_delay(3), Duration::from_millis(400));
        // 100 * 2^5 = 3200 → capped.
        assert_eq!(p.backoff_delay(6), Duration::from_millis(1000));
        assert_eq!(p.backoff_delay(30), Duration::from_millis(1000));
    }

    #[test]
    fn test_cancel_terminates_without_retry_or_suspend() {
        let d = policy().decide(&ctx_for(&ForwardError::Cancelled), 1, 1, false);
        assert!(d.is_terminal());
        assert_eq!(d.final_status, FinalStatus::Cancelled);
    }

    #[test]
    fn test_auth_terminates_without_retry_or_suspend() {
        let err = ForwardError::Http { status: 401, body: String::new() };
        let d = policy().decide(&ctx_for(&err), 1, 1, false);
        assert!(!d.retry_same_endpoint);
        assert!(!d.suspend_request);
        assert!(!d.switch_endpoint);
        assert_eq!(d.final_status, FinalStatus::AuthError);
    }

    #[test]
    fn test_generic_4xx_terminates_without_retry_or_suspend() {
        for status in [404, 410] {
            let err = ForwardError::Http { status, body: String::new() };
            let d = policy().decide(&ctx_for(&err), 1, 1, false);
            assert!(!d.retry_same_endpoint, "status {status}");
            assert!(!d.suspend_request, "status {status}");
            assert!(d.is_terminal(), "status {status}");
        }
    }

    #[test]
    fn test_endpoint_local_4xx_switches() {
        for status in [400, 403, 413] {
            let err = ForwardError::Http { status, body: String::new() };
            let d = policy().decide(&ctx_for(&err), 1, 1, false);
            assert!(d.switch_endpoint, "status {status}");
            assert!(!d.retry_same_endpoint, "status {status}");
            assert!(!d.suspend_request, "status {status}");
        }
    }

    #[test]
    fn test_server_error_retries_then_switches() {
        let p = policy();
        let err = ForwardError::Http { status: 503, body: String::new() };

        let d1 = p.decide(&ctx_for(&err), 1, 1, false);
        assert!(d1.retry_same_endpoint);
        assert_eq!(d1.delay, Duration::from_millis(100));

        let d2 = p.decide(&ctx_for(&err), 2, 2, false);
        assert!(d2.retry_same_endpoint);
        assert_eq!(d2.delay, Duration::from_millis(200));

        let d3 = p.decide(&ctx_for(&err), 3, 3, false);
        assert!(d3.switch_endpoint);
        assert!(!d3.retry_same_endpoint);
    }

    #[test]
    fn test_delay_never_exceeds_max() {
        let p = policy();
        let err = ForwardError::RequestTimeout;
        for local in 1..10 {
            let d = p.decide(&ctx_for(&err), local, local, false);
            assert!(d.delay <= Duration::from_millis(1000));
        }
    }

    #[test]
    fn test_first_attempt_delay_equals_base() {
        let p = policy();
        let err = ForwardError::RequestTimeout;
        let d = p.decide(&ctx_for(&err), 1, 1, false);
        assert_eq!(d.delay, Duration::from_millis(100));
    }

    #[test]
    fn test_rate_limit_retries_within_global_budget() {
        let p = policy();
        let err = ForwardError::Http { status: 429, body: String::new() };

        let d = p.decide(&ctx_for(&err), 1, 2, false);
        assert!(d.retry_same_endpoint);

        let d = p.decide(&ctx_for(&err), 2, 3, false);
        assert!(d.switch_endpoint);
        assert!(d.suspend_request);
        assert_eq!(d.final_status, FinalStatus::RateLimited);
    }

    #[test]
    fn test_rate_limit_honors_retry_after_hint() {
        let p = policy();
        let err = ForwardError::Http { status: 429, body: String::new() };
        let mut ctx = ctx_for(&err);
        ctx.retryable_after = Some(Duration::from_millis(250));

        let d = p.decide(&ctx, 1, 1, false);
        assert!(d.retry_same_endpoint);
        assert_eq!(d.delay, Duration::from_millis(250));

        // Hint above max_delay is capped.
        ctx.retryable_after = Some(Duration::from_secs(60));
        let d = p.decide(&ctx, 1, 1, false);
        assert_eq!(d.delay, Duration::from_millis(1000));
    }

    #[test]
    fn test_stream_error_is_terminal() {
        let err = ForwardError::Stream("connection reset mid-stream".into());
        let d = policy().decide(&ctx_for(&err), 1, 1, true);
        assert!(d.is_terminal());
        assert_eq!(d.final_status, FinalStatus::StreamError);
    }

    #[test]
    fn test_parsing_maps_by_phase() {
        let err = ForwardError::Body("truncated json".into());

        let streaming = policy().decide(&ctx_for(&err), 1, 1, true);
        assert_eq!(streaming.final_status, FinalStatus::StreamError);
        assert!(streaming.is_terminal());

        let unary = policy().decide(&ctx_for(&err), 1, 1, false);
        assert!(unary.retry_same_endpoint);
    }

    #[test]
    fn test_no_healthy_endpoints_requests_suspension() {
        let d = policy().decide(&ctx_for(&ForwardError::NoHealthyEndpoints), 1, 1, false);
        assert!(d.suspend_request);
        assert!(!d.retry_same_endpoint);
        assert!(!d.switch_endpoint);
    }

    #[test]
    fn test_determinism() {
        let p = policy();
        let err = ForwardError::Http { status: 502, body: String::new() };
        let ctx = ctx_for(&err);
        let a = p.decide(&ctx, 2, 4, false);
        let b = p.decide(&ctx, 2, 4, false);
        assert_eq!(a.retry_same_endpoint, b.retry_same_endpoint);
        assert_eq!(a.delay, b.delay);
        assert_eq!(a.reason, b.reason);
    }

    #[test]
    fn test_fallback_http_status_mapping() {
        assert_eq!(FinalStatus::Cancelled.fallback_http_status(), 499);
        assert_eq!(FinalStatus::AuthError.fallback_http_status(), 401);
        assert_eq!(FinalStatus::RateLimited.fallback_http_status(), 429);
        assert_eq!(FinalStatus::Error.fallback_http_status(), 502);
    }
}
