//! Shared signing-key cache.
//!
//! Holds the active key set for a TTL, keeps keys dropped by a rotation
//! usable for a grace period, and funnels concurrent refreshes into a single
//! fetch. The cache fails closed: once the active set has expired and a
//! refresh fails, its keys are no longer served.
//!
//! # Singleflight
//!
//! A refresh runs as one shared future stored in an in-flight slot. Every
//! caller that needs a refresh while it runs awaits a clone of that future.
//! The future clears the slot itself when the fetch completes, so a waiter
//! being cancelled never strands or cancels the refresh for the others.
//!
//! # Backoff
//!
//! A failed refresh is remembered. Lookups that would refresh again return
//! the recorded error until the backoff elapses. The backoff starts at
//! `min_refresh_interval` and doubles per consecutive failure, capped at
//! [`MAX_FAILURE_BACKOFF`] (or `min_refresh_interval` if that is larger).

use crate::auth::jwks::{KeySet, KeySource, SigningKey};
use crate::errors::FetchError;
use crate::observability::metrics;
use crate::policy::BadSignaturePolicy;
use chrono::Utc;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::instrument;

/// Default lifetime of a fetched key set (5 minutes).
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);

/// Default time a key dropped by a rotation stays usable.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(60);

/// Default minimum gap between refreshes caused by unknown kids while the
/// active set is still fresh.
pub const DEFAULT_MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(5);

/// Longest wait between refresh attempts while the key source keeps failing.
pub const MAX_FAILURE_BACKOFF: Duration = Duration::from_secs(60);

/// Timing knobs for [`KeyCache`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyCacheConfig {
    pub ttl: Duration,
    pub grace_period: Duration,
    pub min_refresh_interval: Duration,
}

impl Default for KeyCacheConfig {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_CACHE_TTL,
            grace_period: DEFAULT_GRACE_PERIOD,
            min_refresh_interval: DEFAULT_MIN_REFRESH_INTERVAL,
        }
    }
}

/// A key lookup that produced no key.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyLookupError {
    #[error("No usable signing key for the requested kid")]
    NotFound,

    #[error(transparent)]
    Fetch(#[from] FetchError),
}

type SharedRefresh = Shared<BoxFuture<'static, Result<Arc<KeySet>, FetchError>>>;

struct InFlight {
    id: u64,
    refresh: SharedRefresh,
}

struct RefreshFailure {
    at: Instant,
    error: FetchError,
    consecutive: u32,
}

struct Superseded {
    key: Arc<SigningKey>,
    until: Instant,
}

#[derive(Default)]
struct CacheState {
    active: HashMap<String, Arc<SigningKey>>,
    fetched_at: Option<Instant>,
    /// `None` until the first fetch and after invalidation.
    expires_at: Option<Instant>,
    superseded: HashMap<String, Superseded>,
    /// Cleared by every successful install.
    last_failure: Option<RefreshFailure>,
}

impl CacheState {
    fn is_fresh(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|expires_at| now < expires_at)
    }

    fn lookup(&self, kid: &str, now: Instant, unix_now: i64) -> Option<Arc<SigningKey>> {
        if self.is_fresh(now) {
            if let Some(key) = self.active.get(kid).filter(|k| k.is_valid_at(unix_now)) {
                return Some(Arc::clone(key));
            }
        }

        self.superseded
            .get(kid)
            .filter(|entry| now < entry.until && entry.key.is_valid_at(unix_now))
            .map(|entry| Arc::clone(&entry.key))
    }

    fn may_refresh_on_miss(&self, now: Instant, min_refresh_interval: Duration) -> bool {
        if !self.is_fresh(now) {
            return true;
        }
        self.fetched_at
            .map_or(true, |at| now.saturating_duration_since(at) >= min_refresh_interval)
    }

    fn refreshed_within(&self, now: Instant, interval: Duration) -> bool {
        self.fetched_at
            .is_some_and(|at| now.saturating_duration_since(at) < interval)
    }

    /// The error of the last failed refresh while its backoff is running.
    fn backoff_error(&self, now: Instant, min_refresh_interval: Duration) -> Option<FetchError> {
        let failure = self.last_failure.as_ref()?;
        let backoff = failure_backoff(min_refresh_interval, failure.consecutive);
        (now.saturating_duration_since(failure.at) < backoff).then(|| failure.error.clone())
    }
}

fn failure_backoff(min_refresh_interval: Duration, consecutive: u32) -> Duration {
    let doublings = consecutive.saturating_sub(1).min(16);
    min_refresh_interval
        .saturating_mul(1 << doublings)
        .min(MAX_FAILURE_BACKOFF.max(min_refresh_interval))
}

/// `now + duration`, saturating far in the future instead of overflowing.
fn deadline(now: Instant, duration: Duration) -> Instant {
    now.checked_add(duration)
        .or_else(|| now.checked_add(Duration::from_secs(u64::from(u32::MAX))))
        .unwrap_or(now)
}

struct Inner {
    source: Arc<dyn KeySource>,
    config: KeyCacheConfig,
    state: RwLock<CacheState>,
    in_flight: Mutex<Option<InFlight>>,
    next_flight_id: AtomicU64,
    /// Bumped under the state write lock on every successful install.
    generation: AtomicU64,
    bad_signatures: Mutex<HashMap<String, u32>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Inner {
    fn start_refresh(self: &Arc<Self>, slot: &mut Option<InFlight>) -> SharedRefresh {
        let id = self.next_flight_id.fetch_add(1, Ordering::Relaxed);
        let refresh = Arc::clone(self).run_refresh(id).boxed().shared();
        *slot = Some(InFlight {
            id,
            refresh: refresh.clone(),
        });
        refresh
    }

    async fn run_refresh(self: Arc<Self>, id: u64) -> Result<Arc<KeySet>, FetchError> {
        tracing::debug!(
            target: "authn.key_cache",
            endpoint = %self.source.endpoint(),
            "Refreshing signing keys"
        );

        let started = Instant::now();
        let result = self.source.fetch().await.map(Arc::new);
        let elapsed = started.elapsed();

        match &result {
            Ok(set) => {
                metrics::record_key_fetch("success", elapsed);
                self.install(set).await;
            }
            Err(e) => {
                metrics::record_key_fetch(e.kind(), elapsed);
                let consecutive = self.record_failure(e).await;
                tracing::warn!(
                    target: "authn.key_cache",
                    error = %e,
                    elapsed_ms = elapsed.as_millis(),
                    consecutive_failures = consecutive,
                    "Signing key refresh failed"
                );
            }
        }

        {
            let mut slot = lock(&self.in_flight);
            if slot.as_ref().is_some_and(|flight| flight.id == id) {
                *slot = None;
            }
        }

        result
    }

    async fn record_failure(&self, error: &FetchError) -> u32 {
        let mut state = self.state.write().await;
        let consecutive = state
            .last_failure
            .as_ref()
            .map_or(1, |failure| failure.consecutive.saturating_add(1));
        state.last_failure = Some(RefreshFailure {
            at: Instant::now(),
            error: error.clone(),
            consecutive,
        });
        consecutive
    }

    async fn install(&self, set: &KeySet) {
        let now = Instant::now();
        let grace_until = deadline(now, self.config.grace_period);
        let fresh: HashMap<String, Arc<SigningKey>> = set
            .keys()
            .map(|key| (key.kid().to_string(), Arc::clone(key)))
            .collect();

        let mut state = self.state.write().await;

        let previous = std::mem::take(&mut state.active);
        for (kid, key) in previous {
            if !fresh.contains_key(&kid) {
                state.superseded.insert(
                    kid,
                    Superseded {
                        key,
                        until: grace_until,
                    },
                );
            }
        }
        state
            .superseded
            .retain(|kid, entry| now < entry.until && !fresh.contains_key(kid));

        let key_count = fresh.len();
        let superseded_count = state.superseded.len();
        state.active = fresh;
        state.fetched_at = Some(now);
        state.expires_at = Some(deadline(now, self.config.ttl));
        state.last_failure = None;
        self.generation.fetch_add(1, Ordering::AcqRel);
        drop(state);

        lock(&self.bad_signatures).clear();

        tracing::info!(
            target: "authn.key_cache",
            key_count,
            superseded_count,
            "Signing key cache refreshed"
        );
    }

    async fn invalidate(&self, reason: &'static str) {
        let mut state = self.state.write().await;
        state.expires_at = None;
        drop(state);

        metrics::record_cache_invalidation(reason);
        tracing::info!(target: "authn.key_cache", reason, "Signing key cache invalidated");
    }
}

/// Cache of verification keys in front of a [`KeySource`].
///
/// Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct KeyCache {
    inner: Arc<Inner>,
}

impl KeyCache {
    pub fn new(source: Arc<dyn KeySource>, config: KeyCacheConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                source,
                config,
                state: RwLock::new(CacheState::default()),
                in_flight: Mutex::new(None),
                next_flight_id: AtomicU64::new(0),
                generation: AtomicU64::new(0),
                bad_signatures: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn endpoint(&self) -> &str {
        self.inner.source.endpoint()
    }

    pub fn config(&self) -> &KeyCacheConfig {
        &self.inner.config
    }

    /// Look up a verification key by kid.
    ///
    /// A miss refreshes the key set (subject to the minimum refresh
    /// interval while the active set is fresh) and retries once.
    ///
    /// # Errors
    ///
    /// Returns `KeyLookupError::NotFound` if no usable key exists after the
    /// retry, or `KeyLookupError::Fetch` if the refresh failed or a previous
    /// failure's backoff is still running.
    #[instrument(skip(self), fields(kid = %kid))]
    pub async fn get(&self, kid: &str) -> Result<Arc<SigningKey>, KeyLookupError> {
        let min_refresh_interval = self.inner.config.min_refresh_interval;
        let (observed_generation, may_refresh, backoff_error) = {
            let state = self.inner.state.read().await;
            let now = Instant::now();
            if let Some(key) = state.lookup(kid, now, Utc::now().timestamp()) {
                tracing::trace!(target: "authn.key_cache", "Signing key cache hit");
                metrics::record_key_cache_lookup("hit");
                return Ok(key);
            }
            (
                self.inner.generation.load(Ordering::Acquire),
                state.may_refresh_on_miss(now, min_refresh_interval),
                state.backoff_error(now, min_refresh_interval),
            )
        };
        metrics::record_key_cache_lookup("miss");

        if !may_refresh {
            tracing::debug!(
                target: "authn.key_cache",
                "Unknown kid in fresh key set, refresh rate limited"
            );
            return Err(KeyLookupError::NotFound);
        }

        if let Some(error) = backoff_error {
            tracing::debug!(
                target: "authn.key_cache",
                error = %error,
                "Key source failing, refresh backing off"
            );
            return Err(KeyLookupError::Fetch(error));
        }

        if let Some(refresh) = self.refresh_after(observed_generation) {
            refresh.await?;
        }

        let state = self.inner.state.read().await;
        state
            .lookup(kid, Instant::now(), Utc::now().timestamp())
            .ok_or_else(|| {
                tracing::warn!(target: "authn.key_cache", "Signing key not found after refresh");
                KeyLookupError::NotFound
            })
    }

    /// Fetch a new key set now, joining a refresh already in flight.
    ///
    /// Does not wait out a failure backoff.
    ///
    /// # Errors
    ///
    /// Returns the shared [`FetchError`] if the fetch failed.
    pub async fn refresh(&self) -> Result<Arc<KeySet>, FetchError> {
        let refresh = {
            let mut slot = lock(&self.inner.in_flight);
            match slot.as_ref() {
                Some(flight) => flight.refresh.clone(),
                None => self.inner.start_refresh(&mut slot),
            }
        };
        refresh.await
    }

    /// The refresh to wait on after a miss observed at `observed_generation`.
    ///
    /// Returns `None` when another refresh installed a new set in between,
    /// in which case the caller only needs to look again.
    fn refresh_after(&self, observed_generation: u64) -> Option<SharedRefresh> {
        let mut slot = lock(&self.inner.in_flight);
        if let Some(flight) = slot.as_ref() {
            tracing::debug!(target: "authn.key_cache", "Joining in-flight refresh");
            return Some(flight.refresh.clone());
        }
        if self.inner.generation.load(Ordering::Acquire) != observed_generation {
            return None;
        }
        Some(self.inner.start_refresh(&mut slot))
    }

    /// Drop the active key set so the next lookup refetches. Superseded
    /// keys keep their grace period.
    pub async fn invalidate(&self) {
        self.inner.invalidate("manual").await;
    }

    /// Count a failed signature check made with the cached key `kid`.
    ///
    /// Returns true when this report reached the policy threshold and the
    /// active key set was invalidated. Counts reset on every refresh.
    ///
    /// Reaching the threshold within `min_refresh_interval` of the last
    /// refresh does not invalidate; the count starts over instead.
    pub async fn report_bad_signature(&self, kid: &str, policy: BadSignaturePolicy) -> bool {
        let Some(threshold) = policy.threshold() else {
            return false;
        };

        let reached = {
            let mut counts = lock(&self.inner.bad_signatures);
            let count = counts.entry(kid.to_string()).or_insert(0);
            *count = count.saturating_add(1);
            if *count >= threshold.get() {
                counts.remove(kid);
                true
            } else {
                false
            }
        };

        if !reached {
            return false;
        }

        let min_refresh_interval = self.inner.config.min_refresh_interval;
        let recently_refreshed = self
            .inner
            .state
            .read()
            .await
            .refreshed_within(Instant::now(), min_refresh_interval);
        if recently_refreshed {
            tracing::debug!(
                target: "authn.key_cache",
                kid = %kid,
                "Bad signature threshold reached, key set refreshed too recently to invalidate"
            );
            return false;
        }

        tracing::warn!(
            target: "authn.key_cache",
            kid = %kid,
            threshold = threshold.get(),
            "Repeated bad signatures for cached key, invalidating key set"
        );
        self.inner.invalidate("bad_signature").await;
        true
    }

    /// Number of keys in the active set, whether or not it has expired.
    pub async fn active_key_count(&self) -> usize {
        self.inner.state.read().await.active.len()
    }
}
