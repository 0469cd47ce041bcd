use std::future::Future;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

/// Caller-side handle used to abort an in-flight logical request.
///
/// Clones share the same underlying token, so firing any clone cancels every
/// request that was given one of them.
#[derive(Clone, Debug, Default)]
pub struct CancelHandle {
    token: CancellationToken,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub(crate) fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Interruption {
    Cancelled,
    DeadlineElapsed,
}

/// Cancellation token plus an optional absolute deadline.
#[derive(Clone, Debug)]
pub struct Signal {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Signal {
    pub fn new(cancel: Option<&CancelHandle>, timeout: Option<Duration>) -> Self {
        let token = cancel.map(CancelHandle::token).unwrap_or_default();
        let deadline = timeout
            .filter(|timeout| !timeout.is_zero())
            .and_then(|timeout| Instant::now().checked_add(timeout));
        Self { token, deadline }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub fn is_expired(&self) -> bool {
        self.deadline
            .is_some_and(|deadline| Instant::now() >= deadline)
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn check(&self) -> Result<(), Interruption> {
        if self.is_cancelled() {
            return Err(Interruption::Cancelled);
        }
        if self.is_expired() {
            return Err(Interruption::DeadlineElapsed);
        }
        Ok(())
    }

    /// Same token, deadline tightened to at most `attempt_timeout` from now.
    pub fn narrowed(&self, attempt_timeout: Option<Duration>) -> Self {
        let attempt_deadline =
            attempt_timeout.and_then(|timeout| Instant::now().checked_add(timeout));
        let deadline = match (self.deadline, attempt_deadline) {
            (Some(overall), Some(attempt)) => Some(overall.min(attempt)),
            (overall, attempt) => overall.or(attempt),
        };
        Self {
            token: self.token.clone(),
            deadline,
        }
    }

    /// Drives `future` until it completes or the signal fires.
    pub async fn run<F>(&self, future: F) -> Result<F::Output, Interruption>
    where
        F: Future,
    {
        self.check()?;
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(Interruption::Cancelled),
            _ = sleep_until_deadline(self.deadline) => Err(Interruption::DeadlineElapsed),
            output = future => Ok(output),
        }
    }

    pub async fn sleep(&self, duration: Duration) -> Result<(), Interruption> {
        self.run(tokio::time::sleep(duration)).await
    }

    /// Resolves once the signal fires.
    pub async fn interrupted(&self) -> Interruption {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Interruption::Cancelled,
            _ = sleep_until_deadline(self.deadline) => Interruption::DeadlineElapsed,
        }
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await,
        None => std::future::pending::<()>().await,
    }
}
