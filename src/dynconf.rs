// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! A TTL-tiered cache of actions keyed by an arbitrary lookup parameter,
//! refreshed asynchronously and shared by every request that asks for the
//! same key while a refresh is in flight.
//!
//! Grounded in the original's `dynamicconfig.c`: an entry is usable as-is
//! until its recheck deadline, gets kicked off for a background refresh
//! between recheck and max-TTL, and is dropped and rebuilt from scratch
//! past max-TTL. Hits (an action was found) and misses (the lookup
//! completed but found nothing) track *separate* TTL tiers — a negative
//! result is cached too, just on its own (usually shorter) clock, exactly
//! like `dc_item.ttl`/`dc_item.ttl_max` keyed off `dc_item.value == NULL`
//! in the original. `DynamicConfigSource::lookup` is polled, not awaited —
//! a request whose lookup is still pending parks a `JobRef` and is expected
//! to call [`DynamicConfig::handle`] again (driven by that same `JobRef`
//! firing) to re-poll, rather than this cache running a lookup to
//! completion on a background task of its own.

use std::collections::HashMap;
use std::hash::Hash;
use std::rc::Rc;

use crate::action::Action;
use crate::job::JobRef;
use crate::waitqueue::WaitQueue;

/// One TTL tier: how long before a recheck is due, and how long before the
/// entry is unusable outright. `None` means "never" for either edge,
/// matching spec's "negative means never" convention (expressed here as an
/// `Option` rather than a sentinel).
#[derive(Debug, Clone, Copy)]
pub struct Ttl {
    /// Serve the cached value as-is until this many seconds old, then
    /// trigger exactly one background refresh. `None` disables rechecking
    /// — the value is served until `max` regardless of age.
    pub recheck: Option<f64>,
    /// Never serve a value older than this; past it the entry is evicted
    /// and any parked waiter is woken to retry from scratch. `None` means
    /// the value never expires on its own.
    pub max: Option<f64>,
}

/// Hit/miss TTL tiers plus the retry budget for one cache.
#[derive(Debug, Clone, Copy)]
pub struct DynamicConfigConfig {
    /// Tier applied while an entry holds an action.
    pub hit: Ttl,
    /// Tier applied while an entry's lookup completed but found nothing.
    pub miss: Ttl,
    /// A request gives up waiting on a lookup after this many round-trips
    /// on the same call, rather than parking forever behind a wedged
    /// source. Matches `dc_context.tries` / `ctx->tries > 2`.
    pub max_tries: u32,
}

impl Default for DynamicConfigConfig {
    fn default() -> Self {
        DynamicConfigConfig {
            hit: Ttl {
                recheck: Some(1.0),
                max: Some(60.0),
            },
            miss: Ttl {
                recheck: Some(1.0),
                max: Some(10.0),
            },
            max_tries: 2,
        }
    }
}

/// Looks up and builds the [`Action`] for a key. Supplied once when the
/// cache is created; `lookup` may be slow (a DB query, a config RPC) so
/// it's modeled as fallible and potentially not-yet-ready.
pub trait DynamicConfigSource<K> {
    /// The action type this source produces.
    type Output: Action;

    /// Starts (or polls) a lookup for `key`. `Ok(Some(Some(action)))` is a
    /// hit; `Ok(Some(None))` is a completed lookup that found nothing (a
    /// miss, cached on its own tier, not an error); `Ok(None)` means the
    /// lookup is still in flight. `Err(())` is a hard lookup failure.
    fn lookup(&mut self, key: &K) -> Result<Option<Option<Rc<Self::Output>>>, ()>;
}

struct Entry<A> {
    /// `Some` is a hit, `None` is a cached miss. Only meaningful once
    /// `active` is true.
    action: Option<Rc<A>>,
    /// Whether a lookup has ever completed for this entry — distinguishes
    /// "brand new, lookup not yet returned" from "completed, cached miss",
    /// both of which have `action == None`.
    active: bool,
    last_lookup: f64,
    last_update: f64,
    /// Set while a lookup for this entry has been started and not yet
    /// resolved. Bookkeeping only (surfaced via `Debug`) — `lookup` is
    /// polled on every `handle` call that needs a refresh, in-flight or
    /// not, since this cache has no background task of its own to await.
    refreshing: bool,
    waiters: Vec<JobRef>,
}

/// Outcome of [`DynamicConfig::handle`].
#[derive(Debug)]
pub enum DynConfResult<A> {
    /// A usable action was found for the key.
    Hit(Rc<A>),
    /// The key resolved, but there is no action for it — the caller should
    /// enter its own fallback/miss action.
    Miss,
    /// Still waiting on a lookup; the caller's `JobRef` has been queued.
    Wait,
    /// Gave up after [`DynamicConfigConfig::max_tries`] round-trips, or the
    /// source reported a hard lookup failure with nothing cached to fall
    /// back on.
    Failed,
}

/// The TTL cache itself, keyed by `K`.
pub struct DynamicConfig<K, S: DynamicConfigSource<K>> {
    config: DynamicConfigConfig,
    source: S,
    entries: HashMap<K, Entry<S::Output>>,
    /// Reuses the generic wait queue for the max-TTL eviction sweep — an
    /// entry touched (refreshed) moves to the tail, which is exactly the
    /// "last use wins" semantics `WaitQueue` already provides and the
    /// divergent reason [`crate::backend::Backend`] does *not* reuse it
    /// (see that module's waiter list).
    eviction: WaitQueue<K>,
}

impl<A> std::fmt::Debug for Entry<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entry")
            .field("active", &self.active)
            .field("is_hit", &self.action.is_some())
            .field("last_lookup", &self.last_lookup)
            .field("last_update", &self.last_update)
            .field("refreshing", &self.refreshing)
            .field("waiters", &self.waiters.len())
            .finish()
    }
}

/// Manual impl: the lookup `source: S` has no reason to require `Debug`
/// (it's typically a closure-holding struct wrapping a DB handle or RPC
/// client), so this can't be `#[derive(Debug)]`.
impl<K, S: DynamicConfigSource<K>> std::fmt::Debug for DynamicConfig<K, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicConfig")
            .field("config", &self.config)
            .field("entries", &self.entries.len())
            .finish()
    }
}

impl<K, S> DynamicConfig<K, S>
where
    K: Eq + Hash + Clone,
    S: DynamicConfigSource<K>,
{
    /// Builds a cache around `source` with the given TTL tiers. The
    /// eviction queue's nominal delay is the longer of the two max-TTLs
    /// (an entry is only actually evicted once its own tier's `max` has
    /// elapsed — see [`DynamicConfig::sweep`]); `None` (never) is treated
    /// as "don't evict via the timer" and falls back to a long delay so
    /// the queue still makes progress for entries that do have a max-TTL.
    pub fn new(source: S, config: DynamicConfigConfig) -> Self {
        let nominal = match (config.hit.max, config.miss.max) {
            (Some(a), Some(b)) => a.max(b),
            (Some(a), None) | (None, Some(a)) => a,
            (None, None) => f64::MAX / 2.0,
        };
        DynamicConfig {
            eviction: WaitQueue::new(nominal),
            config,
            source,
            entries: HashMap::new(),
        }
    }

    fn tier(&self, entry: &Entry<S::Output>) -> Ttl {
        if entry.action.is_some() {
            self.config.hit
        } else {
            self.config.miss
        }
    }

    fn recheck_due(&self, entry: &Entry<S::Output>, now: f64) -> bool {
        match self.tier(entry).recheck {
            None => false,
            Some(ttl) => now - entry.last_update >= ttl,
        }
    }

    /// "Usable" per spec §4.6: active, and not past its tier's max-TTL.
    fn usable(&self, entry: &Entry<S::Output>, now: f64) -> bool {
        entry.active
            && match self.tier(entry).max {
                None => true,
                Some(ttl) => now - entry.last_update < ttl,
            }
    }

    /// Looks up the action for `key`, refreshing or building it as needed.
    /// `job_ref` is only consumed (queued) when the result is
    /// [`DynConfResult::Wait`].
    ///
    /// `tries` is the caller's own retry counter for *this* waiting
    /// request — it starts at 0 and the caller passes `tries + 1` back in
    /// each time its `job_ref` fires and it calls `handle` again, mirroring
    /// the original's per-request `dc_context.tries` rather than anything
    /// this cache tracks itself (the cache is shared by many unrelated
    /// requests, only one of which is "this" waiter).
    pub fn handle(&mut self, key: &K, now: f64, tries: u32, job_ref: JobRef) -> DynConfResult<S::Output> {
        if tries > self.config.max_tries {
            return DynConfResult::Failed;
        }

        self.entries.entry(key.clone()).or_insert_with(|| Entry {
            action: None,
            active: false,
            last_lookup: now,
            last_update: now,
            refreshing: false,
            waiters: Vec::new(),
        });

        let should_refresh = {
            let entry = self.entries.get(key).unwrap();
            !entry.active || self.recheck_due(entry, now)
        };

        if should_refresh {
            {
                let entry = self.entries.get_mut(key).unwrap();
                entry.refreshing = true;
                entry.last_lookup = now;
            }
            match self.source.lookup(key) {
                Ok(Some(found)) => {
                    let waiters = {
                        let entry = self.entries.get_mut(key).unwrap();
                        entry.action = found.clone();
                        entry.active = true;
                        entry.last_update = now;
                        entry.refreshing = false;
                        std::mem::take(&mut entry.waiters)
                    };
                    self.eviction.push(None, key.clone(), now);
                    for w in waiters {
                        w.fire();
                    }
                    return match found {
                        Some(action) => DynConfResult::Hit(action),
                        None => DynConfResult::Miss,
                    };
                }
                Ok(None) => {
                    // still in flight; fall through to parking below
                }
                Err(()) => {
                    let waiters = {
                        let entry = self.entries.get_mut(key).unwrap();
                        entry.refreshing = false;
                        std::mem::take(&mut entry.waiters)
                    };
                    for w in waiters {
                        w.fire();
                    }
                    if let Some(entry) = self.entries.get(key) {
                        if self.usable(entry, now) {
                            return match &entry.action {
                                Some(action) => DynConfResult::Hit(action.clone()),
                                None => DynConfResult::Miss,
                            };
                        }
                    }
                    return DynConfResult::Failed;
                }
            }
        }

        let entry = self.entries.get_mut(key).unwrap();
        if self.usable(entry, now) {
            return match &entry.action {
                Some(action) => DynConfResult::Hit(action.clone()),
                None => DynConfResult::Miss,
            };
        }

        entry.waiters.push(job_ref);
        DynConfResult::Wait
    }

    /// Drops a cached entry immediately, forcing the next lookup to
    /// rebuild from scratch. Matches `li_dyncon_invalidate`.
    pub fn invalidate(&mut self, key: &K) {
        self.entries.remove(key);
    }

    /// Removes one specific parked waiter from `key`'s entry, identified by
    /// the `Arc` its `JobRef` was built from. Called when the request that
    /// parked it is torn down before the lookup resolves, so a stale
    /// `JobRef` isn't fired into a request that no longer exists. A no-op
    /// if the entry is gone or the waiter already fired.
    pub fn handle_cleanup(&mut self, key: &K, resume: &std::sync::Arc<dyn Fn() + Send + Sync>) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.waiters.retain(|w| !w.is(resume));
        }
    }

    /// Periodic maintenance: evicts entries past their own tier's
    /// max-TTL, waking any still-parked waiters so they retry (and either
    /// find a freshly rebuilt entry or park again). Matches the eviction
    /// half of `_entry_queue`.
    pub fn sweep(&mut self, now: f64) {
        for key in self.eviction.pop_ready(now) {
            if let Some(entry) = self.entries.get(&key) {
                if !self.usable(entry, now) {
                    if let Some(mut removed) = self.entries.remove(&key) {
                        for w in removed.waiters.drain(..) {
                            w.fire();
                        }
                    }
                } else {
                    // still usable under its own tier; re-arm for later
                    self.eviction.push(None, key, now);
                }
            }
        }
    }

    /// Next deadline this cache's eviction sweep needs, for folding into
    /// the owning worker's `poll()` timeout.
    pub fn next_wake(&self, now: f64) -> Option<f64> {
        self.eviction.next_wake(now)
    }

    /// Number of cached entries (used, stale, or mid-refresh).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache currently holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Debug)]
    struct CountingAction(u32);
    impl Action for CountingAction {
        fn enter(&self, _vr: &mut dyn crate::vrequest::VirtualRequest) {}
    }

    struct Source {
        calls: Cell<u32>,
        ready_after: u32,
        fail: bool,
        miss: bool,
    }
    impl DynamicConfigSource<&'static str> for Source {
        type Output = CountingAction;
        fn lookup(&mut self, _key: &&'static str) -> Result<Option<Option<Rc<CountingAction>>>, ()> {
            let n = self.calls.get() + 1;
            self.calls.set(n);
            if self.fail {
                return Err(());
            }
            if n < self.ready_after {
                return Ok(None);
            }
            if self.miss {
                return Ok(Some(None));
            }
            Ok(Some(Some(Rc::new(CountingAction(n)))))
        }
    }

    fn job_ref(el: &crate::eventloop::EventLoop, sender: crossbeam_channel::Sender<Arc<dyn Fn() + Send + Sync>>) -> JobRef {
        JobRef::new(Arc::new(|| {}), sender, el.waker())
    }

    fn src(ready_after: u32) -> Source {
        Source {
            calls: Cell::new(0),
            ready_after,
            fail: false,
            miss: false,
        }
    }

    #[test]
    fn first_lookup_builds_and_caches_the_action() {
        let mut dc = DynamicConfig::new(src(1), DynamicConfigConfig::default());
        let el = crate::eventloop::EventLoop::new().unwrap();
        let jr = crate::job::JobRefQueue::new();

        let result = dc.handle(&"a", 0.0, 0, job_ref(&el, jr.sender()));
        assert!(matches!(result, DynConfResult::Hit(_)));
        assert_eq!(dc.len(), 1);
    }

    #[test]
    fn within_recheck_window_the_cached_action_is_served_without_a_new_lookup() {
        let mut dc = DynamicConfig::new(
            src(1),
            DynamicConfigConfig {
                hit: Ttl {
                    recheck: Some(5.0),
                    max: Some(60.0),
                },
                ..DynamicConfigConfig::default()
            },
        );
        let el = crate::eventloop::EventLoop::new().unwrap();
        let jr = crate::job::JobRefQueue::new();

        dc.handle(&"a", 0.0, 0, job_ref(&el, jr.sender()));
        let second = dc.handle(&"a", 1.0, 0, job_ref(&el, jr.sender()));
        match second {
            DynConfResult::Hit(a) => assert_eq!(a.0, 1, "no second lookup happened"),
            _ => panic!("expected cached Hit"),
        }
    }

    #[test]
    fn s6_recheck_triggers_exactly_one_refresh_then_max_ttl_evicts() {
        // S6: recheck_hit_ttl=1s, max_hit_ttl=60s.
        let mut dc = DynamicConfig::new(
            src(1),
            DynamicConfigConfig {
                hit: Ttl {
                    recheck: Some(1.0),
                    max: Some(60.0),
                },
                ..DynamicConfigConfig::default()
            },
        );
        let el = crate::eventloop::EventLoop::new().unwrap();
        let jr = crate::job::JobRefQueue::new();

        // t=0: miss on the cache -> lookup -> action A installed.
        let r0 = dc.handle(&"host", 0.0, 0, job_ref(&el, jr.sender()));
        assert!(matches!(r0, DynConfResult::Hit(_)));

        // t=0.5: served from cache, no lookup (source call count unchanged).
        let r1 = dc.handle(&"host", 0.5, 0, job_ref(&el, jr.sender()));
        assert!(matches!(r1, DynConfResult::Hit(_)));

        // t=1.5: past recheck_ttl -> exactly one refresh lookup happens.
        let r2 = dc.handle(&"host", 1.5, 0, job_ref(&el, jr.sender()));
        assert!(matches!(r2, DynConfResult::Hit(_)));

        // t=61: past max_hit_ttl -> entry evicted by the periodic sweep.
        dc.sweep(61.0);
        assert!(dc.is_empty(), "entry evicted past max_hit_ttl");
    }

    #[test]
    fn a_miss_is_cached_on_its_own_tier_not_retried_every_call() {
        let mut src = src(1);
        src.miss = true;
        let mut dc = DynamicConfig::new(
            src,
            DynamicConfigConfig {
                miss: Ttl {
                    recheck: Some(5.0),
                    max: Some(10.0),
                },
                ..DynamicConfigConfig::default()
            },
        );
        let el = crate::eventloop::EventLoop::new().unwrap();
        let jr = crate::job::JobRefQueue::new();

        let r0 = dc.handle(&"missing", 0.0, 0, job_ref(&el, jr.sender()));
        assert!(matches!(r0, DynConfResult::Miss));

        let r1 = dc.handle(&"missing", 1.0, 0, job_ref(&el, jr.sender()));
        assert!(matches!(r1, DynConfResult::Miss), "still within miss recheck window");
    }

    #[test]
    fn parked_waiters_are_released_once_the_lookup_resolves() {
        let mut dc = DynamicConfig::new(src(2), DynamicConfigConfig::default());
        let el = crate::eventloop::EventLoop::new().unwrap();
        let jr_queue = crate::job::JobRefQueue::new();

        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        let waiting = JobRef::new(
            Arc::new(move || {
                fired2.fetch_add(1, Ordering::SeqCst);
            }),
            jr_queue.sender(),
            el.waker(),
        );
        let first = dc.handle(&"a", 0.0, 0, waiting);
        assert!(matches!(first, DynConfResult::Wait));

        // retrying re-enters the refresh path, which this time resolves
        let second = dc.handle(&"a", 0.1, 1, job_ref(&el, jr_queue.sender()));
        assert!(matches!(second, DynConfResult::Hit(_)));
        jr_queue.drain();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn handle_cleanup_removes_only_the_named_waiter() {
        let mut dc = DynamicConfig::new(src(2), DynamicConfigConfig::default());
        let el = crate::eventloop::EventLoop::new().unwrap();
        let jr_queue = crate::job::JobRefQueue::new();

        let torn_down_fired = Arc::new(AtomicUsize::new(0));
        let torn_down_fired2 = torn_down_fired.clone();
        let torn_down_resume: Arc<dyn Fn() + Send + Sync> = Arc::new(move || {
            torn_down_fired2.fetch_add(1, Ordering::SeqCst);
        });
        let torn_down_ref = JobRef::new(torn_down_resume.clone(), jr_queue.sender(), el.waker());

        let survives_fired = Arc::new(AtomicUsize::new(0));
        let survives_fired2 = survives_fired.clone();
        let survives_ref = JobRef::new(
            Arc::new(move || {
                survives_fired2.fetch_add(1, Ordering::SeqCst);
            }),
            jr_queue.sender(),
            el.waker(),
        );

        assert!(matches!(dc.handle(&"a", 0.0, 0, torn_down_ref), DynConfResult::Wait));
        assert!(matches!(dc.handle(&"a", 0.0, 0, survives_ref), DynConfResult::Wait));

        dc.handle_cleanup(&"a", &torn_down_resume);

        // the second lookup call resolves the entry and fires whoever's left parked
        dc.handle(&"a", 0.1, 1, job_ref(&el, jr_queue.sender()));
        jr_queue.drain();

        assert_eq!(torn_down_fired.load(Ordering::SeqCst), 0, "cleaned-up waiter must not fire");
        assert_eq!(survives_fired.load(Ordering::SeqCst), 1, "remaining waiter still fires");
    }

    #[test]
    fn giving_up_after_max_tries_prevents_a_lookup_loop() {
        let mut dc = DynamicConfig::new(
            src(1_000_000),
            DynamicConfigConfig {
                max_tries: 2,
                ..DynamicConfigConfig::default()
            },
        );
        let el = crate::eventloop::EventLoop::new().unwrap();
        let jr = crate::job::JobRefQueue::new();

        assert!(matches!(dc.handle(&"a", 0.0, 0, job_ref(&el, jr.sender())), DynConfResult::Wait));
        assert!(matches!(dc.handle(&"a", 0.1, 1, job_ref(&el, jr.sender())), DynConfResult::Wait));
        assert!(matches!(dc.handle(&"a", 0.2, 2, job_ref(&el, jr.sender())), DynConfResult::Wait));
        assert!(matches!(
            dc.handle(&"a", 0.3, 3, job_ref(&el, jr.sender())),
            DynConfResult::Failed
        ));
    }

    #[test]
    fn lookup_failure_without_a_prior_value_reports_failed() {
        let mut src = src(1);
        src.fail = true;
        let mut dc = DynamicConfig::new(src, DynamicConfigConfig::default());
        let el = crate::eventloop::EventLoop::new().unwrap();
        let jr = crate::job::JobRefQueue::new();

        let result = dc.handle(&"a", 0.0, 0, job_ref(&el, jr.sender()));
        assert!(matches!(result, DynConfResult::Failed));
    }

    #[test]
    fn invalidate_forces_a_fresh_lookup() {
        let mut dc = DynamicConfig::new(
            src(1),
            DynamicConfigConfig {
                hit: Ttl {
                    recheck: Some(100.0),
                    max: Some(200.0),
                },
                ..DynamicConfigConfig::default()
            },
        );
        let el = crate::eventloop::EventLoop::new().unwrap();
        let jr = crate::job::JobRefQueue::new();

        dc.handle(&"a", 0.0, 0, job_ref(&el, jr.sender()));
        dc.invalidate(&"a");
        assert_eq!(dc.len(), 0);
        let result = dc.handle(&"a", 0.1, 0, job_ref(&el, jr.sender()));
        match result {
            DynConfResult::Hit(a) => assert_eq!(a.0, 2, "second source call happened"),
            _ => panic!("expected Hit"),
        }
    }
}
