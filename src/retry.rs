use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::sleep;

use crate::{RequestError, Response, Result};

/// Observer invoked once per attempt, whatever its outcome.
pub type AttemptObserver = Arc<dyn Fn(&Attempt<'_>) + Send + Sync>;

/// Decides whether a failed attempt may be retried.
pub type RetryPredicate = Arc<dyn Fn(&RequestError) -> bool + Send + Sync>;

/// One try of a logical request.
#[derive(Debug)]
pub struct Attempt<'a> {
    /// 0-based position of this attempt.
    pub ordinal: u32,
    pub outcome: std::result::Result<&'a Response, &'a RequestError>,
    pub elapsed: Duration,
}

/// Delay inserted between two attempts of the same request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Backoff {
    None,
    Fixed(Duration),
    /// `base * 2^attempt`, never more than `max`.
    Exponential { base: Duration, max: Duration },
}

impl Default for Backoff {
    fn default() -> Self {
        Self::Exponential {
            base: Duration::from_millis(100),
            max: Duration::from_secs(5),
        }
    }
}

impl Backoff {
    /// Delay to wait after the failed attempt `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            Self::None => Duration::ZERO,
            Self::Fixed(delay) => *delay,
            Self::Exponential { base, max } => {
                let multiplier = 1u32 << attempt.min(16);
                base.saturating_mul(multiplier).min(*max)
            }
        }
    }
}

/// Outcome of consulting the policy after a failed attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { next: u32, delay: Duration },
    Stop,
}

enum RetryState {
    Attempting(u32),
    Succeeded(Response),
    Failed(RequestError),
}

/// Retry-versus-stop rules for one logical request.
#[derive(Clone)]
pub struct RetryPolicy {
    retry_limit: u32,
    backoff: Backoff,
    predicate: Option<RetryPredicate>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("retry_limit", &self.retry_limit)
            .field("backoff", &self.backoff)
            .field("custom_predicate", &self.predicate.is_some())
            .finish()
    }
}

impl RetryPolicy {
    /// Policy allowing `retry_limit` retries with the default classification.
    pub fn new(retry_limit: u32, backoff: Backoff) -> Self {
        Self {
            retry_limit,
            backoff,
            predicate: None,
        }
    }

    /// Replaces [`RequestError::is_retryable_by_default`] as the retry test.
    pub fn with_predicate(mut self, predicate: RetryPredicate) -> Self {
        self.predicate = Some(predicate);
        self
    }

    /// Retries allowed after the initial attempt.
    pub fn retry_limit(&self) -> u32 {
        self.retry_limit
    }

    fn is_retryable(&self, error: &RequestError) -> bool {
        match &self.predicate {
            Some(predicate) => predicate(error),
            None => error.is_retryable_by_default(),
        }
    }

    /// Decides what follows the failure of attempt `ordinal`.
    pub fn decide(&self, ordinal: u32, error: &RequestError) -> RetryDecision {
        if ordinal < self.retry_limit && self.is_retryable(error) {
            RetryDecision::Retry {
                next: ordinal + 1,
                delay: self.backoff.delay(ordinal),
            }
        } else {
            RetryDecision::Stop
        }
    }

    /// Runs `attempt` until it succeeds or the policy stops retrying.
    ///
    /// Attempts are strictly sequential. A request that never succeeds is
    /// tried at most `retry_limit + 1` times and fails with the last error.
    pub async fn run<F, Fut>(&self, observer: Option<&AttemptObserver>, mut attempt: F) -> Result<Response>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<Response>>,
    {
        let mut state = RetryState::Attempting(0);
        loop {
            state = match state {
                RetryState::Attempting(ordinal) => {
                    let started = Instant::now();
                    let outcome = attempt(ordinal).await;
                    if let Some(observer) = observer {
                        observer(&Attempt {
                            ordinal,
                            outcome: outcome.as_ref(),
                            elapsed: started.elapsed(),
                        });
                    }

                    match outcome {
                        Ok(response) => RetryState::Succeeded(response),
                        Err(error) => match self.decide(ordinal, &error) {
                            RetryDecision::Retry { next, delay } => {
                                wait_before_retry(ordinal, delay, &error).await;
                                RetryState::Attempting(next)
                            }
                            RetryDecision::Stop => RetryState::Failed(error),
                        },
                    }
                }
                RetryState::Succeeded(response) => return Ok(response),
                RetryState::Failed(error) => return Err(error),
            };
        }
    }
}

async fn wait_before_retry(attempt: u32, delay: Duration, error: &RequestError) {
    #[cfg(feature = "tracing")]
    tracing::debug!(
        attempt,
        delay_ms = delay.as_millis() as u64,
        %error,
        "retrying request"
    );
    #[cfg(not(feature = "tracing"))]
    let _ = (attempt, error);

    if !delay.is_zero() {
        sleep(delay).await;
    }
}
