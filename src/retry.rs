use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use http::{HeaderMap, Method, StatusCode};
use rand::RngExt;

use crate::IDEMPOTENCY_KEY_HEADER;
use crate::error::TransportErrorKind;

/// Why an attempt is a retry candidate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryCause {
    Status(StatusCode),
    Transport(TransportErrorKind),
    AttemptTimeout,
}

/// Facts about a failed attempt handed to a [`RetryClassifier`].
#[derive(Clone, Debug)]
pub struct RetryDecision {
    pub attempt: usize,
    pub max_attempts: usize,
    pub method: Method,
    pub uri: String,
    pub cause: RetryCause,
}

/// Overrides the built-in retry rules of a [`RetryPolicy`].
pub trait RetryClassifier: Send + Sync {
    fn should_retry(&self, decision: &RetryDecision) -> bool;
}

/// Delay strategy between attempts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backoff {
    Fixed(Duration),
    Exponential { base: Duration, cap: Duration },
}

impl Backoff {
    /// Un-jittered delay before retry number `retry` (1-based).
    pub fn delay(self, retry: usize) -> Duration {
        match self {
            Self::Fixed(delay) => delay,
            Self::Exponential { base, cap } => {
                let doublings = retry.saturating_sub(1).min(31) as u32;
                base.saturating_mul(1_u32 << doublings).min(cap)
            }
        }
    }

    /// Upper bound no jittered delay may exceed.
    fn ceiling(self) -> Duration {
        match self {
            Self::Fixed(delay) => delay,
            Self::Exponential { cap, .. } => cap,
        }
    }
}

#[derive(Clone)]
pub struct RetryPolicy {
    attempts: usize,
    backoff: Backoff,
    jitter: f64,
    statuses: BTreeSet<StatusCode>,
    transport_kinds: BTreeSet<TransportErrorKind>,
    on_attempt_timeout: bool,
    idempotent_only: bool,
    classifier: Option<Arc<dyn RetryClassifier>>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("RetryPolicy")
            .field("attempts", &self.attempts)
            .field("backoff", &self.backoff)
            .field("jitter", &self.jitter)
            .field("statuses", &self.statuses)
            .field("transport_kinds", &self.transport_kinds)
            .field("on_attempt_timeout", &self.on_attempt_timeout)
            .field("idempotent_only", &self.idempotent_only)
            .field("classifier", &self.classifier.is_some())
            .finish()
    }
}

impl RetryPolicy {
    /// Single attempt, nothing is retried.
    pub fn disabled() -> Self {
        Self {
            attempts: 1,
            backoff: Backoff::Exponential {
                base: Duration::from_millis(200),
                cap: Duration::from_secs(2),
            },
            jitter: 0.0,
            statuses: [
                StatusCode::TOO_MANY_REQUESTS,
                StatusCode::INTERNAL_SERVER_ERROR,
                StatusCode::BAD_GATEWAY,
                StatusCode::SERVICE_UNAVAILABLE,
                StatusCode::GATEWAY_TIMEOUT,
            ]
            .into(),
            transport_kinds: [
                TransportErrorKind::Dns,
                TransportErrorKind::Connect,
                TransportErrorKind::Read,
            ]
            .into(),
            on_attempt_timeout: true,
            idempotent_only: true,
            classifier: None,
        }
    }

    /// Three attempts, jittered exponential backoff from 200ms up to 2s.
    pub fn standard() -> Self {
        Self {
            attempts: 3,
            jitter: 0.2,
            ..Self::disabled()
        }
    }

    pub fn max_attempts(mut self, max_attempts: usize) -> Self {
        self.attempts = max_attempts.max(1);
        self
    }

    pub fn fixed_backoff(mut self, delay: Duration) -> Self {
        self.backoff = Backoff::Fixed(delay);
        self
    }

    pub fn exponential_backoff(mut self, base: Duration, cap: Duration) -> Self {
        let base = base.max(Duration::from_millis(1));
        self.backoff = Backoff::Exponential {
            base,
            cap: cap.max(base),
        };
        self
    }

    /// Spread each delay by up to `ratio` of itself in either direction.
    pub fn jitter_ratio(mut self, ratio: f64) -> Self {
        self.jitter = ratio.clamp(0.0, 1.0);
        self
    }

    /// Replaces the retryable status set. Codes outside 100..=999 are ignored.
    pub fn retryable_status_codes(mut self, codes: impl IntoIterator<Item = u16>) -> Self {
        self.statuses = codes
            .into_iter()
            .filter_map(|code| StatusCode::from_u16(code).ok())
            .collect();
        self
    }

    pub fn retryable_transport_error_kinds(
        mut self,
        kinds: impl IntoIterator<Item = TransportErrorKind>,
    ) -> Self {
        self.transport_kinds = kinds.into_iter().collect();
        self
    }

    pub fn retry_on_attempt_timeout(mut self, retry: bool) -> Self {
        self.on_attempt_timeout = retry;
        self
    }

    pub fn retry_on_proxy_error(mut self, retry: bool) -> Self {
        match retry {
            true => self.transport_kinds.insert(TransportErrorKind::Proxy),
            false => self.transport_kinds.remove(&TransportErrorKind::Proxy),
        };
        self
    }

    /// When set, non-idempotent requests without an `Idempotency-Key` are sent once.
    pub fn idempotent_only(mut self, idempotent_only: bool) -> Self {
        self.idempotent_only = idempotent_only;
        self
    }

    pub fn retry_classifier(mut self, classifier: Arc<dyn RetryClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn configured_max_attempts(&self) -> usize {
        self.attempts
    }

    pub fn backoff(&self) -> Backoff {
        self.backoff
    }

    pub(crate) fn permits_request(&self, method: &Method, headers: &HeaderMap) -> bool {
        !self.idempotent_only || request_supports_retry(method, headers)
    }

    pub(crate) fn allows(&self, decision: &RetryDecision) -> bool {
        if let Some(classifier) = &self.classifier {
            return classifier.should_retry(decision);
        }
        match decision.cause {
            RetryCause::Status(status) => self.statuses.contains(&status),
            RetryCause::Transport(kind) => self.transport_kinds.contains(&kind),
            RetryCause::AttemptTimeout => self.on_attempt_timeout,
        }
    }

    /// A server-requested `Retry-After`, held to the backoff's ceiling.
    pub(crate) fn bound_retry_after(&self, requested: Duration) -> Duration {
        requested.min(self.backoff.ceiling())
    }

    /// Delay before retry number `retry`, jittered but never above the
    /// backoff's ceiling.
    pub(crate) fn delay_before(&self, retry: usize) -> Duration {
        let delay = self.backoff.delay(retry);
        if self.jitter <= f64::EPSILON || delay <= Duration::from_millis(1) {
            return delay;
        }
        let spread = delay.mul_f64(self.jitter).max(Duration::from_millis(1));
        let low = delay.saturating_sub(spread).as_millis() as u64;
        let high = delay.saturating_add(spread).min(self.backoff.ceiling()).as_millis() as u64;
        let sampled = rand::rng().random_range(low..=high.max(low));
        Duration::from_millis(sampled)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::disabled()
    }
}

/// Idempotent methods, or any request carrying an `Idempotency-Key`.
fn request_supports_retry(method: &Method, headers: &HeaderMap) -> bool {
    let idempotent = matches!(
        *method,
        Method::GET | Method::HEAD | Method::PUT | Method::DELETE | Method::OPTIONS | Method::TRACE
    );
    idempotent || headers.contains_key(IDEMPOTENCY_KEY_HEADER)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use http::{HeaderMap, HeaderValue, Method, StatusCode};

    use super::{Backoff, RetryCause, RetryDecision, RetryPolicy};
    use crate::error::TransportErrorKind;

    fn failed_with(cause: RetryCause) -> RetryDecision {
        RetryDecision {
            attempt: 1,
            max_attempts: 3,
            method: Method::GET,
            uri: "https://api.test/v1/items".to_owned(),
            cause,
        }
    }

    #[test]
    fn jitter_stays_under_the_cap() {
        let policy = RetryPolicy::standard()
            .exponential_backoff(Duration::from_millis(100), Duration::from_millis(120))
            .jitter_ratio(1.0);

        for _ in 0..256 {
            assert!(policy.delay_before(3) <= Duration::from_millis(120));
        }
    }

    #[test]
    fn exponential_delays_double_then_clamp() {
        let backoff = Backoff::Exponential {
            base: Duration::from_millis(100),
            cap: Duration::from_millis(350),
        };
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(200));
        assert_eq!(backoff.delay(3), Duration::from_millis(350));
        assert_eq!(backoff.delay(200), Duration::from_millis(350));
    }

    #[test]
    fn fixed_delay_ignores_retry_number() {
        let policy = RetryPolicy::standard()
            .fixed_backoff(Duration::from_millis(40))
            .jitter_ratio(0.0);

        assert_eq!(policy.delay_before(1), Duration::from_millis(40));
        assert_eq!(policy.delay_before(5), Duration::from_millis(40));
    }

    #[test]
    fn proxy_failures_need_opt_in() {
        let proxy_failure = failed_with(RetryCause::Transport(TransportErrorKind::Proxy));

        assert!(!RetryPolicy::standard().allows(&proxy_failure));
        assert!(
            RetryPolicy::standard()
                .retry_on_proxy_error(true)
                .allows(&proxy_failure)
        );
    }

    #[test]
    fn throttling_and_gateway_statuses_retry_by_default() {
        let policy = RetryPolicy::standard();
        assert!(policy.allows(&failed_with(RetryCause::Status(StatusCode::SERVICE_UNAVAILABLE))));
        assert!(policy.allows(&failed_with(RetryCause::Status(StatusCode::TOO_MANY_REQUESTS))));
        assert!(!policy.allows(&failed_with(RetryCause::Status(StatusCode::NOT_FOUND))));
    }

    #[test]
    fn retry_after_is_held_to_the_backoff_ceiling() {
        let policy = RetryPolicy::standard()
            .exponential_backoff(Duration::from_millis(10), Duration::from_millis(50));
        assert_eq!(
            policy.bound_retry_after(Duration::from_secs(3600)),
            Duration::from_millis(50)
        );
        assert_eq!(
            policy.bound_retry_after(Duration::from_millis(20)),
            Duration::from_millis(20)
        );
    }

    #[test]
    fn attempt_timeouts_follow_their_flag() {
        let timeout = failed_with(RetryCause::AttemptTimeout);
        assert!(RetryPolicy::standard().allows(&timeout));
        assert!(
            !RetryPolicy::standard()
                .retry_on_attempt_timeout(false)
                .allows(&timeout)
        );
    }

    #[test]
    fn post_needs_an_idempotency_key_unless_unrestricted() {
        let policy = RetryPolicy::standard().idempotent_only(true);
        let mut headers = HeaderMap::new();
        assert!(!policy.permits_request(&Method::POST, &headers));
        headers.insert("idempotency-key", HeaderValue::from_static("abc"));
        assert!(policy.permits_request(&Method::POST, &headers));
        assert!(
            RetryPolicy::standard()
                .idempotent_only(false)
                .permits_request(&Method::POST, &HeaderMap::new())
        );
    }
}
