//! Retry policy: one logical request as a bounded series of physical attempts.
//!
//! Semantics:
//! - `retries` counts attempts after the first (default 3, so 4 attempts total).
//! - Before every attempt the governor is consulted:
//!   - concurrency ceiling reached: wait for a slot, on any attempt;
//!   - throttled on the **first** attempt: wait out the remaining window once, then proceed
//!     without re-checking the throttle;
//!   - throttled on a **retry**: fail with [`RequestError::Throttled`].
//! - Only errors with [`RequestError::is_retryable`] are retried. The delay before retry `n`
//!   is `backoff.delay(n)` (with jitter), or the server's `Retry-After` if that is longer.
//! - On exhaustion or a terminal error the last error is returned unchanged.
//! - The cancellation token is checked at every suspension point; a cancelled call returns
//!   `Ok(None)` and never issues another attempt.
//! - The attempt's active-set membership is released on every path.
//!
//! ```rust
//! use apiguard::governor::{AdmissionLimits, RequestGovernor};
//! use apiguard::{Backoff, InstantSleeper, RequestError, RetryPolicy};
//! use serde_json::json;
//! use std::time::Duration;
//! use tokio_util::sync::CancellationToken;
//!
//! # tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap().block_on(async {
//! let policy = RetryPolicy::builder()
//!     .retries(2)
//!     .backoff(Backoff::exponential(Duration::from_millis(100)))
//!     .with_sleeper(InstantSleeper)
//!     .build();
//! let limits = AdmissionLimits { throttle: Duration::ZERO, max_concurrent: 5 };
//!
//! let mut failures = 1;
//! let result = policy
//!     .execute(&RequestGovernor::new(), "/api/flaky", &limits, &CancellationToken::new(), || {
//!         let outcome = if failures > 0 {
//!             failures -= 1;
//!             Err(RequestError::from_status(503, b"", None))
//!         } else {
//!             Ok(json!({"ok": true}))
//!         };
//!         async move { outcome }
//!     })
//!     .await;
//! assert_eq!(result, Ok(Some(json!({"ok": true}))));
//! # });
//! ```

use crate::backoff::Backoff;
use crate::config::DEFAULT_RETRIES;
use crate::error::{RequestError, TransportError, TransportErrorKind};
use crate::governor::{ActiveGuard, Admission, AdmissionLimits, CallResult, RequestGovernor};
use crate::jitter::Jitter;
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::telemetry::{CallOutcome, ClientEvent, EventSink, LogSink};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Bounded exponential-backoff retry around a single logical request.
#[derive(Clone)]
pub struct RetryPolicy {
    retries: usize,
    backoff: Backoff,
    jitter: Jitter,
    attempt_timeout: Option<Duration>,
    sleeper: Arc<dyn Sleeper>,
    sink: Arc<dyn EventSink>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("retries", &self.retries)
            .field("backoff", &self.backoff)
            .field("jitter", &self.jitter)
            .field("attempt_timeout", &self.attempt_timeout)
            .field("sleeper", &self.sleeper)
            .finish()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicyBuilder::new().build()
    }
}

impl RetryPolicy {
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder::new()
    }

    /// Retries after the first attempt.
    pub fn retries(&self) -> usize {
        self.retries
    }

    /// Total physical attempts this policy may make.
    pub fn max_attempts(&self) -> usize {
        self.retries.saturating_add(1)
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    /// Copy of this policy with different retry/backoff knobs; sleeper and sink are kept.
    pub(crate) fn tuned(&self, retries: usize, backoff: Backoff) -> Self {
        Self { retries, backoff, ..self.clone() }
    }

    /// Run `operation` under the governor until it succeeds, fails terminally, runs out of
    /// attempts, or `cancel` fires.
    pub async fn execute<Op, Fut>(
        &self,
        governor: &RequestGovernor,
        endpoint: &str,
        limits: &AdmissionLimits,
        cancel: &CancellationToken,
        mut operation: Op,
    ) -> CallResult
    where
        Op: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<Value, RequestError>> + Send,
    {
        let max_attempts = self.max_attempts();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let guard = match self.admit(governor, endpoint, limits, attempt, cancel).await {
                Ok(Some(guard)) => guard,
                Ok(None) => return self.abandoned(endpoint, attempt - 1),
                Err(err) => return self.failed(endpoint, attempt - 1, err),
            };

            self.sink.record(&ClientEvent::AttemptStarted { endpoint: endpoint.to_owned(), attempt });
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                result = self.attempt(&mut operation) => Some(result),
            };
            drop(guard);

            let err = match outcome {
                None => return self.abandoned(endpoint, attempt),
                Some(Ok(value)) => {
                    self.settled(endpoint, attempt, CallOutcome::Success);
                    return Ok(Some(value));
                }
                Some(Err(err)) => err,
            };

            if !err.is_retryable() {
                return self.failed(endpoint, attempt, err);
            }
            if attempt >= max_attempts {
                self.sink.record(&ClientEvent::RetryExhausted {
                    endpoint: endpoint.to_owned(),
                    attempts: attempt,
                });
                return self.failed(endpoint, attempt, err);
            }

            let delay = self.delay_for(attempt, &err);
            self.sink.record(&ClientEvent::RetryScheduled {
                endpoint: endpoint.to_owned(),
                attempt,
                delay,
                error: err.to_string(),
            });
            if !self.wait(delay, cancel).await {
                return self.abandoned(endpoint, attempt);
            }
        }
    }

    /// Wait until the governor admits `attempt`. `Ok(None)` means cancelled while waiting.
    async fn admit(
        &self,
        governor: &RequestGovernor,
        endpoint: &str,
        limits: &AdmissionLimits,
        attempt: usize,
        cancel: &CancellationToken,
    ) -> Result<Option<ActiveGuard>, RequestError> {
        let mut bypass_throttle = false;
        loop {
            if cancel.is_cancelled() {
                return Ok(None);
            }
            let slot_freed = governor.slot_freed();
            tokio::pin!(slot_freed);
            slot_freed.as_mut().enable();

            match governor.try_start(endpoint, limits, bypass_throttle) {
                Ok(guard) => return Ok(Some(guard)),
                Err(Admission::Throttled { retry_in }) if attempt == 1 && !bypass_throttle => {
                    self.sink.record(&ClientEvent::ThrottleWait {
                        endpoint: endpoint.to_owned(),
                        wait: retry_in,
                    });
                    if !self.wait(retry_in, cancel).await {
                        return Ok(None);
                    }
                    bypass_throttle = true;
                }
                Err(Admission::Throttled { retry_in }) => {
                    return Err(RequestError::Throttled { endpoint: endpoint.to_owned(), retry_in });
                }
                Err(Admission::Saturated { active, limit }) => {
                    self.sink.record(&ClientEvent::SlotWait {
                        endpoint: endpoint.to_owned(),
                        active,
                        limit,
                    });
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Ok(None),
                        _ = slot_freed => {}
                    }
                }
                // try_start only denies with Throttled or Saturated.
                Err(Admission::Allowed) => {}
            }
        }
    }

    async fn attempt<Op, Fut>(&self, operation: &mut Op) -> Result<Value, RequestError>
    where
        Op: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<Value, RequestError>> + Send,
    {
        match self.attempt_timeout {
            Some(limit) => match tokio::time::timeout(limit, operation()).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::new(
                    TransportErrorKind::Timeout,
                    format!("attempt exceeded {:?}", limit),
                )
                .into()),
            },
            None => operation().await,
        }
    }

    fn delay_for(&self, attempt: usize, err: &RequestError) -> Duration {
        let delay = self.jitter.apply(self.backoff.delay(attempt));
        match err.retry_after() {
            Some(requested) => delay.max(requested),
            None => delay,
        }
    }

    /// Sleep unless cancelled first. Returns false if the token fired.
    async fn wait(&self, delay: Duration, cancel: &CancellationToken) -> bool {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            _ = self.sleeper.sleep(delay) => !cancel.is_cancelled(),
        }
    }

    fn settled(&self, endpoint: &str, attempts: usize, outcome: CallOutcome) {
        self.sink.record(&ClientEvent::Settled { endpoint: endpoint.to_owned(), attempts, outcome });
    }

    fn failed(&self, endpoint: &str, attempts: usize, err: RequestError) -> CallResult {
        self.settled(endpoint, attempts, CallOutcome::Failure);
        Err(err)
    }

    fn abandoned(&self, endpoint: &str, attempts: usize) -> CallResult {
        self.settled(endpoint, attempts, CallOutcome::Abandoned);
        Ok(None)
    }
}

/// Builder for [`RetryPolicy`].
pub struct RetryPolicyBuilder {
    retries: usize,
    backoff: Backoff,
    jitter: Jitter,
    attempt_timeout: Option<Duration>,
    sleeper: Arc<dyn Sleeper>,
    sink: Arc<dyn EventSink>,
}

impl RetryPolicyBuilder {
    /// Defaults: 3 retries, exponential backoff from 1s, no jitter, tokio timer, tracing sink.
    pub fn new() -> Self {
        Self {
            retries: DEFAULT_RETRIES,
            backoff: Backoff::default(),
            jitter: Jitter::None,
            attempt_timeout: None,
            sleeper: Arc::new(TokioSleeper),
            sink: Arc::new(LogSink),
        }
    }

    /// Attempts after the first one.
    pub fn retries(mut self, retries: usize) -> Self {
        self.retries = retries;
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    /// Bound each physical attempt; a timeout counts as a retryable transport failure.
    pub fn attempt_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    pub fn with_sleeper<S>(mut self, sleeper: S) -> Self
    where
        S: Sleeper + 'static,
    {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub(crate) fn with_shared_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn build(self) -> RetryPolicy {
        RetryPolicy {
            retries: self.retries,
            backoff: self.backoff,
            jitter: self.jitter,
            attempt_timeout: self.attempt_timeout,
            sleeper: self.sleeper,
            sink: self.sink,
        }
    }
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self::new()
    }
}
