use std::time::{Duration, Instant, SystemTime};

use http::{HeaderMap, Method, Response, StatusCode, Uri};
use tracing::{Instrument, debug, info_span, warn};

use crate::body::{OutgoingBody, build_http_request};
use crate::error::{BoxError, Error, TransportErrorKind};
use crate::proxy::ProxyConfig;
use crate::retry::{RetryCause, RetryDecision, RetryPolicy};
use crate::signal::{Interruption, Signal};
use crate::transport::{ResponseBody, Transport, TransportError};
use crate::util::parse_retry_after;

/// Everything one logical request needs to run its physical attempts.
pub(crate) struct AttemptPlan<'a> {
    pub(crate) transport: &'a dyn Transport,
    pub(crate) method: &'a Method,
    pub(crate) uri: &'a Uri,
    pub(crate) log_uri: &'a str,
    pub(crate) headers: &'a HeaderMap,
    pub(crate) body: &'a OutgoingBody,
    pub(crate) proxy: Option<&'a ProxyConfig>,
    pub(crate) retry: &'a RetryPolicy,
    pub(crate) attempt_timeout: Option<Duration>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) signal: &'a Signal,
}

enum AttemptOutcome {
    Success(Response<ResponseBody>),
    Status(Response<ResponseBody>),
    Network {
        kind: TransportErrorKind,
        source: BoxError,
    },
    AttemptTimeout,
    DeadlineElapsed,
    Cancelled,
}

impl AttemptOutcome {
    fn label(&self) -> &'static str {
        match self {
            Self::Success(_) => "success",
            Self::Status(_) => "retryable_status",
            Self::Network { .. } => "network_error",
            Self::AttemptTimeout => "attempt_timeout",
            Self::DeadlineElapsed => "deadline_elapsed",
            Self::Cancelled => "cancelled",
        }
    }
}

struct AttemptRecord {
    attempt: usize,
    elapsed: Duration,
    outcome: AttemptOutcome,
}

impl AttemptPlan<'_> {
    /// Runs attempts until one succeeds, a terminal outcome is reached, or
    /// the policy is exhausted. Returns at response headers; the body of the
    /// returned response has not been read.
    pub(crate) async fn run(&self) -> Result<Response<ResponseBody>, Error> {
        let max_attempts = self.retry.configured_max_attempts();
        let retry_allowed = max_attempts > 1
            && self.body.is_replayable()
            && self.retry.permits_request(self.method, self.headers);

        let mut attempt = 0_usize;
        loop {
            attempt += 1;
            if let Err(interruption) = self.signal.check() {
                return Err(self.interruption_error(interruption));
            }

            let span = info_span!(
                "fetchx.request",
                method = %self.method,
                uri = %self.log_uri,
                attempt,
                max_attempts,
            );
            let started_at = Instant::now();
            let outcome = self.attempt_once(attempt).instrument(span).await?;
            let record = AttemptRecord {
                attempt,
                elapsed: started_at.elapsed(),
                outcome,
            };
            debug!(
                method = %self.method,
                uri = %self.log_uri,
                attempt = record.attempt,
                elapsed_ms = record.elapsed.as_millis() as u64,
                outcome = record.outcome.label(),
                "http attempt finished"
            );

            let can_retry = retry_allowed && record.attempt < max_attempts;
            let retry_delay = match record.outcome {
                AttemptOutcome::Success(response) => return Ok(response),
                AttemptOutcome::Cancelled => {
                    return Err(self.interruption_error(Interruption::Cancelled));
                }
                AttemptOutcome::DeadlineElapsed => {
                    return Err(self.interruption_error(Interruption::DeadlineElapsed));
                }
                AttemptOutcome::Status(response) => {
                    if !retry_allowed {
                        return Ok(response);
                    }
                    let status = response.status();
                    if !can_retry {
                        return Err(self.exhausted(attempt, self.status_error(status)));
                    }
                    let delay = match parse_retry_after(response.headers(), SystemTime::now()) {
                        Some(requested) => self.retry.bound_retry_after(requested),
                        None => self.retry.delay_before(attempt),
                    };
                    warn!(
                        method = %self.method,
                        uri = %self.log_uri,
                        status = status.as_u16(),
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "retrying http request after retryable status"
                    );
                    drop(response);
                    delay
                }
                AttemptOutcome::Network { kind, source } => {
                    let error = self.network_error(kind, source);
                    let cause = RetryCause::Transport(kind);
                    if !retry_allowed || !self.retry.allows(&self.decision(attempt, cause)) {
                        return Err(error);
                    }
                    if !can_retry {
                        return Err(self.exhausted(attempt, error));
                    }
                    let delay = self.retry.delay_before(attempt);
                    warn!(
                        method = %self.method,
                        uri = %self.log_uri,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "retrying http request after transport error"
                    );
                    delay
                }
                AttemptOutcome::AttemptTimeout => {
                    let error = self.attempt_timeout_error();
                    let cause = RetryCause::AttemptTimeout;
                    if !retry_allowed || !self.retry.allows(&self.decision(attempt, cause)) {
                        return Err(error);
                    }
                    if !can_retry {
                        return Err(self.exhausted(attempt, error));
                    }
                    let delay = self.retry.delay_before(attempt);
                    warn!(
                        method = %self.method,
                        uri = %self.log_uri,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "retrying http request after attempt timeout"
                    );
                    delay
                }
            };

            let delay = match self.signal.remaining() {
                Some(remaining) => retry_delay.min(remaining),
                None => retry_delay,
            };
            if let Err(interruption) = self.signal.sleep(delay).await {
                return Err(self.interruption_error(interruption));
            }
        }
    }

    async fn attempt_once(&self, attempt: usize) -> Result<AttemptOutcome, Error> {
        let body = self.body.attempt_body().ok_or(Error::StreamAlreadyConsumed)?;
        let request = build_http_request(self.method.clone(), self.uri.clone(), self.headers, body)?;
        let attempt_signal = self.signal.narrowed(self.attempt_timeout);

        let exchange = async {
            let connection = self
                .transport
                .dial(self.uri, self.proxy, &attempt_signal)
                .await?;
            connection.send(request, &attempt_signal).await
        };
        let outcome = match exchange.await {
            Ok(response) => {
                let status = response.status();
                let retryable = self
                    .retry
                    .allows(&self.decision(attempt, RetryCause::Status(status)));
                if retryable && !status.is_success() {
                    AttemptOutcome::Status(response)
                } else {
                    AttemptOutcome::Success(response)
                }
            }
            Err(TransportError::Interrupted(Interruption::Cancelled)) => AttemptOutcome::Cancelled,
            Err(TransportError::Interrupted(Interruption::DeadlineElapsed)) => {
                if self.signal.is_expired() {
                    AttemptOutcome::DeadlineElapsed
                } else {
                    AttemptOutcome::AttemptTimeout
                }
            }
            Err(TransportError::Io { kind, source }) => AttemptOutcome::Network { kind, source },
        };
        Ok(outcome)
    }

    fn decision(&self, attempt: usize, cause: RetryCause) -> RetryDecision {
        RetryDecision {
            attempt,
            max_attempts: self.retry.configured_max_attempts(),
            method: self.method.clone(),
            uri: self.log_uri.to_owned(),
            cause,
        }
    }

    fn exhausted(&self, attempts: usize, last_error: Error) -> Error {
        Error::MaxRetriesExceeded {
            attempts,
            source: Box::new(last_error),
        }
    }

    fn status_error(&self, status: StatusCode) -> Error {
        Error::RetryableStatus {
            status: status.as_u16(),
            method: self.method.clone(),
            uri: self.log_uri.to_owned(),
        }
    }

    fn network_error(&self, kind: TransportErrorKind, source: BoxError) -> Error {
        match (kind, self.proxy) {
            (TransportErrorKind::Proxy, Some(proxy)) => Error::ProxyConnect {
                proxy: proxy.to_string(),
                method: self.method.clone(),
                uri: self.log_uri.to_owned(),
                source,
            },
            _ => Error::Transport {
                kind,
                method: self.method.clone(),
                uri: self.log_uri.to_owned(),
                source,
            },
        }
    }

    fn attempt_timeout_error(&self) -> Error {
        Error::AttemptTimeout {
            timeout_ms: self.attempt_timeout.map(|timeout| timeout.as_millis()).unwrap_or(0),
            method: self.method.clone(),
            uri: self.log_uri.to_owned(),
        }
    }

    fn interruption_error(&self, interruption: Interruption) -> Error {
        match interruption {
            Interruption::Cancelled => Error::Cancelled {
                method: self.method.clone(),
                uri: self.log_uri.to_owned(),
            },
            Interruption::DeadlineElapsed => Error::Timeout {
                timeout_ms: self.timeout.map(|timeout| timeout.as_millis()).unwrap_or(0),
                method: self.method.clone(),
                uri: self.log_uri.to_owned(),
            },
        }
    }
}
