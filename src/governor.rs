//! Request governor: admission control and in-flight deduplication.
//!
//! One governor is shared by every client and scope in the process (it is a cheap `Clone`
//! handle over shared state). It tracks three things:
//!
//! - the **active set**: endpoints with a physical attempt in flight,
//! - the **last attempt** time per endpoint, for the throttle window,
//! - the **pending table**: logical calls in flight, keyed by [`RequestKey`], so identical
//!   concurrent requests attach to one call instead of issuing another.
//!
//! Invariants:
//! - Every mutation happens inside a single critical section with no `.await` in it.
//! - An [`ActiveGuard`] is the only way to leave the active set, so cleanup runs on every path
//!   (success, error, cancellation, panic unwinding).
//! - A pending entry is removed exactly once: when its call settles, or when its last
//!   [`Subscription`] is dropped first, in which case the call's cancellation token fires.
//!   Entries made by [`RequestGovernor::register_pending`] belong to the registrant and are
//!   only removed on settle.
//!
//! ```rust
//! use apiguard::governor::{Admission, AdmissionLimits, RequestGovernor};
//! use std::time::Duration;
//!
//! # tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap().block_on(async {
//! let governor = RequestGovernor::new();
//! let limits = AdmissionLimits { throttle: Duration::from_secs(1), max_concurrent: 5 };
//!
//! let guard = governor.try_start("https://crm/api/customers", &limits, false).unwrap();
//! assert_eq!(governor.active_count(), 1);
//! drop(guard);
//! assert_eq!(governor.active_count(), 0);
//!
//! // Same endpoint again within the window is throttled.
//! assert!(matches!(
//!     governor.can_start("https://crm/api/customers", &limits),
//!     Admission::Throttled { .. }
//! ));
//! # });
//! ```

use crate::config::{DEFAULT_MAX_CONCURRENT, DEFAULT_THROTTLE_INTERVAL};
use crate::error::RequestError;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Result of one logical call. `Ok(None)` means the call was aborted or abandoned.
pub type CallResult = Result<Option<Value>, RequestError>;

/// A logical call that any number of callers can await; all of them see the same result.
pub type SharedCall = Shared<BoxFuture<'static, CallResult>>;

/// Per-attempt admission parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionLimits {
    /// Minimum spacing between attempts to the same endpoint.
    pub throttle: Duration,
    /// Maximum distinct endpoints with an attempt in flight.
    pub max_concurrent: usize,
}

impl Default for AdmissionLimits {
    fn default() -> Self {
        Self { throttle: DEFAULT_THROTTLE_INTERVAL, max_concurrent: DEFAULT_MAX_CONCURRENT }
    }
}

/// Answer to "may an attempt to this endpoint start now?".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    /// The last attempt to the endpoint was too recent.
    Throttled { retry_in: Duration },
    /// The concurrency ceiling is reached.
    Saturated { active: usize, limit: usize },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed)
    }
}

/// Identity of a logical request for deduplication: method, resolved URL and body bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
    method: String,
    url: String,
    body: Option<Vec<u8>>,
}

impl RequestKey {
    pub fn new(method: impl Into<String>, url: impl Into<String>, body: Option<Vec<u8>>) -> Self {
        Self { method: method.into(), url: url.into(), body }
    }

    /// The endpoint key used for throttling and the active set.
    pub fn endpoint(&self) -> &str {
        &self.url
    }

    pub fn method(&self) -> &str {
        &self.method
    }
}

struct PendingCall {
    id: u64,
    call: SharedCall,
    subscribers: usize,
    /// False for registrant-owned entries; subscribers leaving never cancels those.
    abandonable: bool,
    cancel: CancellationToken,
}

#[derive(Default)]
struct State {
    /// endpoint -> number of attempts in flight; `len()` is the distinct-endpoint count.
    active: HashMap<String, usize>,
    last_attempt: HashMap<String, Instant>,
    pending: HashMap<RequestKey, PendingCall>,
    next_id: u64,
}

impl State {
    fn admission(
        &self,
        key: &str,
        limits: &AdmissionLimits,
        bypass_throttle: bool,
        now: Instant,
    ) -> Admission {
        if !bypass_throttle {
            if let Some(last) = self.last_attempt.get(key) {
                let elapsed = now.saturating_duration_since(*last);
                if elapsed < limits.throttle {
                    return Admission::Throttled { retry_in: limits.throttle - elapsed };
                }
            }
        }
        let active = self.active.len();
        if active >= limits.max_concurrent {
            return Admission::Saturated { active, limit: limits.max_concurrent };
        }
        Admission::Allowed
    }

    fn start(&mut self, key: &str, now: Instant) {
        *self.active.entry(key.to_owned()).or_insert(0) += 1;
        self.last_attempt.insert(key.to_owned(), now);
    }

    fn finish(&mut self, key: &str) {
        if let Some(count) = self.active.get_mut(key) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.active.remove(key);
            }
        }
    }
}

struct Inner {
    state: Mutex<State>,
    slot_freed: Notify,
}

/// Process-wide admission controller and deduplication table.
#[derive(Clone)]
pub struct RequestGovernor {
    inner: Arc<Inner>,
}

impl Default for RequestGovernor {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RequestGovernor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestGovernor")
            .field("active", &self.active_count())
            .field("pending", &self.pending_count())
            .finish()
    }
}

impl RequestGovernor {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner { state: Mutex::new(State::default()), slot_freed: Notify::new() }),
        }
    }

    // Critical sections never panic, so a poisoned lock still holds consistent state.
    fn state(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether an attempt to `key` may start now. No side effects.
    pub fn can_start(&self, key: &str, limits: &AdmissionLimits) -> Admission {
        self.state().admission(key, limits, false, Instant::now())
    }

    /// Record an attempt to `key`: add it to the active set and stamp its last-attempt time.
    ///
    /// The returned guard calls [`mark_finished`](Self::mark_finished) when dropped.
    pub fn mark_started(&self, key: &str) -> ActiveGuard {
        self.state().start(key, Instant::now());
        ActiveGuard { governor: self.clone(), key: key.to_owned() }
    }

    /// Remove one attempt to `key` from the active set and wake tasks waiting for a slot.
    pub fn mark_finished(&self, key: &str) {
        self.state().finish(key);
        self.inner.slot_freed.notify_waiters();
    }

    /// [`can_start`](Self::can_start) and [`mark_started`](Self::mark_started) in one step.
    ///
    /// `bypass_throttle` skips the throttle check (used when resuming after a throttle wait);
    /// the concurrency ceiling always applies.
    pub fn try_start(
        &self,
        key: &str,
        limits: &AdmissionLimits,
        bypass_throttle: bool,
    ) -> Result<ActiveGuard, Admission> {
        let mut state = self.state();
        let now = Instant::now();
        match state.admission(key, limits, bypass_throttle, now) {
            Admission::Allowed => {
                state.start(key, now);
                Ok(ActiveGuard { governor: self.clone(), key: key.to_owned() })
            }
            denied => Err(denied),
        }
    }

    /// Resolves on the next [`mark_finished`](Self::mark_finished).
    ///
    /// Call `enable()` on the pinned future before re-checking admission so a slot freed in
    /// between is not missed.
    pub fn slot_freed(&self) -> Notified<'_> {
        self.inner.slot_freed.notified()
    }

    /// Distinct endpoints with an attempt in flight.
    pub fn active_count(&self) -> usize {
        self.state().active.len()
    }

    pub fn is_active(&self, key: &str) -> bool {
        self.state().active.contains_key(key)
    }

    /// When the last attempt to `key` started.
    pub fn last_attempt(&self, key: &str) -> Option<Instant> {
        self.state().last_attempt.get(key).copied()
    }

    /// The in-flight call for `key`, if any. No side effects.
    pub fn pending(&self, key: &RequestKey) -> Option<SharedCall> {
        self.state().pending.get(key).map(|p| p.call.clone())
    }

    /// Logical calls currently in flight.
    pub fn pending_count(&self) -> usize {
        self.state().pending.len()
    }

    /// Register `call` as the in-flight call for `key`, replacing any previous entry.
    ///
    /// The entry removes itself when the returned future settles, so something must poll it.
    /// The caller owns the call: callers that later join through
    /// [`join_or_register`](Self::join_or_register) and leave never cancel it, and `cancel` is
    /// only for the registrant's own use.
    pub fn register_pending(
        &self,
        key: RequestKey,
        call: BoxFuture<'static, CallResult>,
        cancel: CancellationToken,
    ) -> SharedCall {
        let mut state = self.state();
        let (previous, _, shared) = self.insert_pending(&mut state, key, call, cancel, 0, false);
        drop(state);
        drop(previous);
        shared
    }

    /// Attach to the in-flight call for `key`, or register a new one built by `make`.
    ///
    /// `make` receives the call's cancellation token. It runs while the governor lock is held,
    /// so it must only construct the (lazy) future and never call back into the governor.
    pub fn join_or_register<F>(&self, key: RequestKey, make: F) -> Subscription
    where
        F: FnOnce(CancellationToken) -> BoxFuture<'static, CallResult>,
    {
        let mut state = self.state();
        if let Some(entry) = state.pending.get_mut(&key) {
            entry.subscribers += 1;
            let (id, call) = (entry.id, entry.call.clone());
            drop(state);
            return Subscription { governor: self.clone(), key, id, call, joined: true };
        }
        let cancel = CancellationToken::new();
        let call = make(cancel.clone());
        let (_, id, shared) = self.insert_pending(&mut state, key.clone(), call, cancel, 1, true);
        drop(state);
        Subscription { governor: self.clone(), key, id, call: shared, joined: false }
    }

    fn insert_pending(
        &self,
        state: &mut State,
        key: RequestKey,
        call: BoxFuture<'static, CallResult>,
        cancel: CancellationToken,
        subscribers: usize,
        abandonable: bool,
    ) -> (Option<PendingCall>, u64, SharedCall) {
        state.next_id += 1;
        let id = state.next_id;
        let governor = self.clone();
        let settled_key = key.clone();
        let shared = async move {
            let result = call.await;
            governor.remove_pending(&settled_key, id);
            result
        }
        .boxed()
        .shared();
        let previous = state
            .pending
            .insert(key, PendingCall { id, call: shared.clone(), subscribers, abandonable, cancel });
        (previous, id, shared)
    }

    fn remove_pending(&self, key: &RequestKey, id: u64) {
        let removed = {
            let mut state = self.state();
            match state.pending.get(key) {
                Some(entry) if entry.id == id => state.pending.remove(key),
                _ => None,
            }
        };
        // Dropping an entry can drop the call future (and its ActiveGuard), which takes the lock.
        drop(removed);
    }

    fn unsubscribe(&self, key: &RequestKey, id: u64) {
        let abandoned = {
            let mut state = self.state();
            match state.pending.get_mut(key) {
                Some(entry) if entry.id == id => {
                    entry.subscribers = entry.subscribers.saturating_sub(1);
                    if entry.subscribers == 0 && entry.abandonable {
                        state.pending.remove(key)
                    } else {
                        None
                    }
                }
                _ => None,
            }
        };
        if let Some(entry) = abandoned {
            tracing::debug!(endpoint = key.endpoint(), "last subscriber left; cancelling call");
            entry.cancel.cancel();
        }
    }
}

/// Membership of one attempt in the active set. Dropping it marks the attempt finished.
#[must_use = "dropping the guard immediately marks the attempt finished"]
pub struct ActiveGuard {
    governor: RequestGovernor,
    key: String,
}

impl ActiveGuard {
    pub fn endpoint(&self) -> &str {
        &self.key
    }
}

impl fmt::Debug for ActiveGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveGuard").field("endpoint", &self.key).finish()
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.governor.mark_finished(&self.key);
    }
}

/// One caller attached to a pending call.
///
/// Dropping the last subscription before the call settles removes the pending entry and
/// cancels the call.
pub struct Subscription {
    governor: RequestGovernor,
    key: RequestKey,
    id: u64,
    call: SharedCall,
    joined: bool,
}

impl Subscription {
    /// The shared call; await it for the result.
    pub fn call(&self) -> SharedCall {
        self.call.clone()
    }

    /// True if this caller attached to a call someone else started.
    pub fn joined_existing(&self) -> bool {
        self.joined
    }

    pub fn key(&self) -> &RequestKey {
        &self.key
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("joined", &self.joined)
            .finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.governor.unsubscribe(&self.key, self.id);
    }
}
