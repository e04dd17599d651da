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

//! A per-upstream connection pool: idle reuse, a serialized non-blocking
//! connect path so one slow backend doesn't get hammered with simultaneous
//! connect attempts, a disable window after a connect failure, `max_requests`
//! connection recycling, and a FIFO of waiters released as capacity frees up.
//!
//! Grounded in the original's `li_backend_get`/`li_backend_put`
//! (`original_source/src/main/backends.c`): idle connections are tried
//! first, then a fresh non-blocking connect if under the connection limit
//! and nothing else is mid-connect, and otherwise the caller's
//! [`BackendWait`] ticket parks on [`Backend`]'s waiter list until woken by
//! a `put`, a connect completing, or the disable window expiring.
//!
//! The waiter list is its own small slab-backed doubly-linked list rather
//! than a reuse of [`crate::waitqueue::WaitQueue`], and that's deliberate:
//! `WaitQueue` moves a touched entry to the tail, which is right for the
//! dynamic-config eviction queue but wrong here, since a [`BackendWait`]
//! ticket's deadline is fixed at creation and a re-queued ticket must keep
//! its original place in line.

use slab::Slab;
use std::collections::VecDeque;

use crate::job::JobRef;
use crate::sockaddr::SocketAddress;

/// Outcome of a [`Backend::get`] call.
#[derive(Debug)]
pub enum BackendResult<C> {
    /// `bcon` is filled with an active connection handed to the caller.
    Success(BackendConnection<C>),
    /// No capacity right now; the caller's [`BackendWait`] ticket is (now,
    /// or already) queued and will fire its job reference once one frees
    /// up. The caller must hold on to the ticket and pass it back in on
    /// retry — it's the FIFO position.
    Wait,
    /// The ticket's deadline passed, or the backend is disabled. The
    /// ticket has been consumed; the caller should translate this to a
    /// gateway timeout response.
    Timeout,
}

/// What a non-blocking `connect()` attempt reported, collapsed from the
/// original's `errno` switch (`EINPROGRESS`/`EALREADY`/`EINTR` vs `EAGAIN`
/// vs `EISCONN`/`0` vs anything else).
#[derive(Debug)]
pub enum ConnectOutcome<C> {
    /// `EISCONN` or an immediate `0`: the connection is usable right now.
    Ready(C),
    /// `EINPROGRESS`/`EALREADY`/`EINTR`: the caller registered a writable
    /// watcher on the new fd and will report back via
    /// [`Backend::complete_connect`] once it fires.
    InProgress,
    /// `EAGAIN`: the backend is momentarily overloaded. Not a connect
    /// failure — no disable window, just park.
    Overloaded,
    /// Anything else: a hard connect failure. Opens the disable window.
    Failed(std::io::Error),
}

/// A connection handed out by [`Backend::get`]. Wraps the caller's
/// connection type with the request counter `max_requests` is measured
/// against.
#[derive(Debug)]
pub struct BackendConnection<C> {
    /// The caller's connection (a socket, typically).
    pub conn: C,
    requests: u32,
}

impl<C> BackendConnection<C> {
    /// Requests already served by this connection, including the one
    /// currently checked out.
    pub fn requests(&self) -> u32 {
        self.requests
    }
}

/// An opaque parked-waiter ticket, owned by the caller and persisted across
/// retries — the FIFO position [`Backend::get`] reuses on every call after
/// the first `Wait`. `key` is `None` only before the ticket has ever been
/// queued; once set it's paired with the `generation` the slot was stamped
/// with at insertion, so the owning [`Backend`] can tell a still-linked
/// ticket from one whose node has already been popped (signaled) even after
/// the slab key gets recycled for an unrelated waiter.
#[derive(Debug)]
pub struct BackendWait {
    key: Option<usize>,
    generation: u64,
    deadline: f64,
}

impl BackendWait {
    /// Whether this ticket has ever been queued. Doesn't by itself tell you
    /// whether it's still linked (only the owning [`Backend`] knows that) —
    /// use [`Backend::get`]/[`Backend::wait_stop`] rather than polling this.
    pub fn is_queued(&self) -> bool {
        self.key.is_some()
    }
}

#[derive(Debug)]
struct WaiterNode {
    job_ref: Option<JobRef>,
    deadline: f64,
    prev: Option<usize>,
    next: Option<usize>,
    generation: u64,
}

/// Slab-backed doubly-linked FIFO sorted by each ticket's fixed deadline.
/// Pushes normally land at the tail (deadlines are assigned as `now +
/// wait_timeout`, so insertion order already matches deadline order);
/// re-queueing a previously-signaled ticket walks back from the tail to
/// restore sorted order, since its deadline was fixed earlier than any
/// ticket queued since.
///
/// `slab` recycles freed keys with no generation guard, and a popped node's
/// key can't be echoed back to the [`BackendWait`] that owned it (the pool
/// calls that pop a waiter — `put`, `complete_connect`, `sweep` — never see
/// the caller's ticket). So every insert is stamped with a list-local
/// generation, and a `(key, generation)` pair is only "live" while the slot
/// at `key` still holds the generation it was handed — a later insert that
/// reuses the key gets a fresh one. [`WaiterList::is_live`] and
/// [`WaiterList::remove_if_live`] are how callers tell a still-queued ticket
/// from one that's already been signaled (or whose slot was recycled).
#[derive(Debug, Default)]
struct WaiterList {
    nodes: Slab<WaiterNode>,
    head: Option<usize>,
    tail: Option<usize>,
    next_generation: u64,
}

impl WaiterList {
    fn next_generation(&mut self) -> u64 {
        let g = self.next_generation;
        self.next_generation += 1;
        g
    }

    /// Whether `key` still refers to the node it was handed for — `false`
    /// once that node has been popped, whether or not its key has since
    /// been recycled for an unrelated waiter.
    fn is_live(&self, key: usize, generation: u64) -> bool {
        self.nodes.get(key).is_some_and(|n| n.generation == generation)
    }

    /// Removes `key` only if it's still the live node for `generation`.
    /// A stale `(key, generation)` — already popped, possibly recycled for a
    /// different waiter — is left untouched and this returns `None`.
    fn remove_if_live(&mut self, key: usize, generation: u64) -> Option<JobRef> {
        if !self.is_live(key, generation) {
            return None;
        }
        self.unlink(key);
        self.nodes.remove(key).job_ref
    }

    fn unlink(&mut self, key: usize) {
        let (prev, next) = {
            let n = &self.nodes[key];
            (n.prev, n.next)
        };
        match prev {
            Some(p) => self.nodes[p].next = next,
            None => self.head = next,
        }
        match next {
            Some(n2) => self.nodes[n2].prev = prev,
            None => self.tail = prev,
        }
    }

    fn push_tail(&mut self, job_ref: JobRef, deadline: f64) -> (usize, u64) {
        let generation = self.next_generation();
        let key = self.nodes.insert(WaiterNode {
            job_ref: Some(job_ref),
            deadline,
            prev: self.tail,
            next: None,
            generation,
        });
        match self.tail {
            Some(t) => self.nodes[t].next = Some(key),
            None => self.head = Some(key),
        }
        self.tail = Some(key);
        (key, generation)
    }

    /// Re-inserts a ticket whose deadline predates (or equals) everything
    /// currently queued after the insertion point, walking back from the
    /// tail.
    fn insert_sorted(&mut self, job_ref: JobRef, deadline: f64) -> (usize, u64) {
        let generation = self.next_generation();
        let mut after = None;
        let mut cursor = self.tail;
        while let Some(c) = cursor {
            if self.nodes[c].deadline <= deadline {
                after = Some(c);
                break;
            }
            cursor = self.nodes[c].prev;
        }
        let key = match after {
            None => {
                // deadline is earliest (or list empty): becomes new head
                let key = self.nodes.insert(WaiterNode {
                    job_ref: Some(job_ref),
                    deadline,
                    prev: None,
                    next: self.head,
                    generation,
                });
                match self.head {
                    Some(h) => self.nodes[h].prev = Some(key),
                    None => self.tail = Some(key),
                }
                self.head = Some(key);
                return (key, generation);
            }
            Some(a) => {
                let next = self.nodes[a].next;
                let key = self.nodes.insert(WaiterNode {
                    job_ref: Some(job_ref),
                    deadline,
                    prev: Some(a),
                    next,
                    generation,
                });
                self.nodes[a].next = Some(key);
                match next {
                    Some(n) => self.nodes[n].prev = Some(key),
                    None => self.tail = Some(key),
                }
                key
            }
        };
        (key, generation)
    }

    fn pop_front(&mut self) -> Option<JobRef> {
        let key = self.head?;
        self.unlink(key);
        self.nodes.remove(key).job_ref
    }

    fn pop_expired(&mut self, now: f64) -> Vec<usize> {
        let mut expired = Vec::new();
        while let Some(key) = self.head {
            if self.nodes[key].deadline > now {
                break;
            }
            self.unlink(key);
            expired.push(key);
        }
        expired
    }

    fn front_deadline(&self) -> Option<f64> {
        self.head.map(|k| self.nodes[k].deadline)
    }

    fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Tunables for one backend's pool. `-1`-as-unbounded in the original maps
/// to `None` here.
#[derive(Debug, Clone, Copy)]
pub struct BackendConfig {
    /// Maximum simultaneous connections (idle + in-use) to this backend.
    /// `None` means unbounded.
    pub max_connections: Option<usize>,
    /// How long an idle connection may sit before it's closed.
    pub idle_timeout: f64,
    /// How long a non-blocking connect attempt may take before it's
    /// treated as a failure and the disable window opens.
    pub connect_timeout: f64,
    /// How long a waiter ticket may sit queued before giving up with
    /// [`BackendResult::Timeout`].
    pub wait_timeout: f64,
    /// How long to stop handing out connections after a connect failure.
    pub disable_time: f64,
    /// Requests a single connection may serve before it's closed instead
    /// of returned to idle. `None` means unbounded.
    pub max_requests: Option<u32>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig {
            max_connections: Some(4),
            idle_timeout: 60.0,
            connect_timeout: 5.0,
            wait_timeout: 10.0,
            disable_time: 5.0,
            max_requests: None,
        }
    }
}

/// A pool of connections to one upstream address.
#[derive(Debug)]
pub struct Backend<C> {
    addr: SocketAddress,
    config: BackendConfig,
    /// Idle connections, most-recently-returned at the back — `get` pops
    /// from the back (reuse the warmest socket first), the periodic sweep
    /// expires from the front (the coldest first), same two-ended access
    /// pattern as the original's idle `GQueue`.
    idle: VecDeque<(BackendConnection<C>, f64)>,
    active: usize,
    /// At most one outstanding connect attempt at a time: `cur_connect_fd
    /// != -1` in the original. `connect_started` anchors the disable
    /// window at the *original* connect start, not whenever the failure is
    /// observed.
    connecting: bool,
    connect_started: Option<f64>,
    disabled_until: Option<f64>,
    waiters: WaiterList,
    shutdown: bool,
}

impl<C> Backend<C> {
    /// Creates an empty pool for `addr`.
    pub fn new(addr: SocketAddress, config: BackendConfig) -> Self {
        Backend {
            addr,
            config,
            idle: VecDeque::new(),
            active: 0,
            connecting: false,
            connect_started: None,
            disabled_until: None,
            waiters: WaiterList::default(),
            shutdown: false,
        }
    }

    /// The upstream address this pool connects to.
    pub fn addr(&self) -> SocketAddress {
        self.addr
    }

    /// Connections currently in use (checked out and not yet `put` back).
    pub fn active(&self) -> usize {
        self.active
    }

    /// Idle, reusable connections currently held.
    pub fn idle_count(&self) -> usize {
        self.idle.len()
    }

    /// Whether a connect attempt is currently in flight.
    pub fn is_connecting(&self) -> bool {
        self.connecting
    }

    fn total(&self) -> usize {
        self.active + self.idle.len()
    }

    fn is_disabled(&self, now: f64) -> bool {
        self.disabled_until.is_some_and(|t| t > now)
    }

    fn at_capacity(&self) -> bool {
        self.config
            .max_connections
            .is_some_and(|m| self.total() >= m)
    }

    /// Try idle reuse, then a fresh serialized connect, then park on the
    /// waiter list.
    ///
    /// `bwait` is the caller's ticket slot, reused across retries. `connect`
    /// is invoked at most once per call, and only when a fresh connect
    /// attempt is actually being started (idle reuse available, already
    /// connecting, disabled, or at capacity all skip it).
    pub fn get(
        &mut self,
        now: f64,
        bwait: &mut Option<BackendWait>,
        new_job_ref: impl FnOnce() -> JobRef,
        connect: impl FnOnce(SocketAddress) -> ConnectOutcome<C>,
    ) -> BackendResult<C> {
        if self.shutdown {
            self.forget_wait(bwait);
            return BackendResult::Timeout;
        }

        if let Some(w) = bwait {
            if w.deadline <= now {
                self.forget_wait(bwait);
                return BackendResult::Timeout;
            }
        }

        if let Some((mut conn, _)) = self.idle.pop_back() {
            self.active += 1;
            conn.requests += 1;
            self.forget_wait(bwait);
            return BackendResult::Success(conn);
        }

        if !self.connecting && !self.is_disabled(now) && !self.at_capacity() {
            self.connecting = true;
            self.connect_started = Some(now);
            return match connect(self.addr) {
                ConnectOutcome::Ready(c) => {
                    self.connecting = false;
                    self.connect_started = None;
                    self.active += 1;
                    self.forget_wait(bwait);
                    BackendResult::Success(BackendConnection { conn: c, requests: 1 })
                }
                ConnectOutcome::InProgress => {
                    self.park(now, bwait, new_job_ref);
                    BackendResult::Wait
                }
                ConnectOutcome::Overloaded => {
                    self.connecting = false;
                    self.connect_started = None;
                    self.park(now, bwait, new_job_ref);
                    BackendResult::Wait
                }
                ConnectOutcome::Failed(e) => {
                    log::error!("connect to {} failed: {e}", self.addr);
                    self.connecting = false;
                    self.disabled_until = Some(now + self.config.disable_time);
                    self.connect_started = None;
                    self.park(now, bwait, new_job_ref);
                    BackendResult::Wait
                }
            };
        }

        self.park(now, bwait, new_job_ref);
        BackendResult::Wait
    }

    fn forget_wait(&mut self, bwait: &mut Option<BackendWait>) {
        if let Some(w) = bwait.take() {
            if let Some(key) = w.key {
                self.waiters.remove_if_live(key, w.generation);
            }
        }
    }

    /// Ensures `bwait` is queued: creates a ticket on first `Wait`, or
    /// re-queues (in sorted position) a ticket that had been signaled but
    /// didn't end up with capacity after all. A ticket whose node is still
    /// live keeps its existing FIFO position untouched.
    fn park(&mut self, now: f64, bwait: &mut Option<BackendWait>, new_job_ref: impl FnOnce() -> JobRef) {
        match bwait {
            None => {
                let deadline = now + self.config.wait_timeout;
                let (key, generation) = self.waiters.push_tail(new_job_ref(), deadline);
                *bwait = Some(BackendWait {
                    key: Some(key),
                    generation,
                    deadline,
                });
            }
            Some(w) if !w.key.is_some_and(|k| self.waiters.is_live(k, w.generation)) => {
                let (key, generation) = self.waiters.insert_sorted(new_job_ref(), w.deadline);
                w.key = Some(key);
                w.generation = generation;
            }
            Some(_) => {
                // already linked under its current key — same FIFO position
            }
        }
    }

    /// Cancels an outstanding wait. If the ticket's node is still live
    /// (never signaled) it's simply unlinked. Otherwise — already signaled,
    /// or its slot has since been recycled for another waiter, which can
    /// only happen after it was signaled and popped — its wakeup is
    /// transferred to the current FIFO head so capacity isn't silently
    /// dropped.
    pub fn wait_stop(&mut self, bwait: &mut Option<BackendWait>) {
        let Some(w) = bwait.take() else { return };
        let Some(key) = w.key else { return };
        if self.waiters.remove_if_live(key, w.generation).is_none() {
            if let Some(next) = self.waiters.pop_front() {
                next.fire();
            }
        }
    }

    /// Returns a connection. Closes it (drops it, returning it to the
    /// caller so *they* close the fd) instead of pooling it when `closecon`
    /// is set, `max_requests` has been reached, or the pool is shutting
    /// down; otherwise places it at the idle LRU's tail. Wakes one queued
    /// waiter — and, if the connect slot is also free, a second.
    pub fn put(&mut self, conn: BackendConnection<C>, closecon: bool, now: f64) -> Option<C> {
        self.active -= 1;
        let exhausted = self
            .config
            .max_requests
            .is_some_and(|m| conn.requests >= m);
        if closecon || exhausted || self.shutdown {
            self.release_one_waiter();
            self.maybe_self_free();
            return Some(conn.conn);
        }
        self.idle.push_back((conn, now));
        self.release_one_waiter();
        None
    }

    /// Called when the in-flight non-blocking connect this pool started
    /// resolves (the owning worker observed its fd become writable and
    /// checked `getpeername`, or it timed out). On success the new
    /// connection joins the idle pool and up to two waiters are woken (the
    /// fresh connection, and the now-free connect slot); on failure the
    /// disable window opens, anchored at the original connect start.
    pub fn complete_connect(&mut self, now: f64, result: Result<C, std::io::Error>) {
        let started = self.connect_started.take();
        self.connecting = false;
        match result {
            Ok(conn) => {
                self.idle.push_back((
                    BackendConnection {
                        conn,
                        requests: 0,
                    },
                    now,
                ));
                self.release_one_waiter();
                self.release_one_waiter();
            }
            Err(e) => {
                log::error!("connect to {} failed: {e}", self.addr);
                let anchor = started.unwrap_or(now);
                self.disabled_until = Some(anchor + self.config.disable_time);
            }
        }
        self.maybe_self_free();
    }

    fn release_one_waiter(&mut self) {
        if let Some(job_ref) = self.waiters.pop_front() {
            job_ref.fire();
        }
    }

    /// Periodic maintenance: expires idle connections older than
    /// `idle_timeout`, times out queued waiters and the in-flight connect,
    /// and lifts the disable window once it elapses (waking one waiter so
    /// it can retry). Returns the expired idle connections so the caller
    /// can close them, and whether the in-flight connect fd should be
    /// closed by the caller because it just timed out.
    pub fn sweep(&mut self, now: f64) -> SweepResult<C> {
        let mut expired_idle = Vec::new();
        while let Some(front) = self.idle.front() {
            if front.1 + self.config.idle_timeout > now {
                break;
            }
            expired_idle.push(self.idle.pop_front().unwrap().0.conn);
        }

        for key in self.waiters.pop_expired(now) {
            // timed-out waiters' job refs are simply dropped: the caller's
            // BackendWait::deadline check on its next `get` (if it ever
            // retries) will independently observe TIMEOUT. Nothing to wake.
            let _ = key;
        }

        let mut connect_timed_out = false;
        if self.connecting {
            if let Some(started) = self.connect_started {
                if started + self.config.connect_timeout <= now {
                    self.connecting = false;
                    self.connect_started = None;
                    self.disabled_until = Some(started + self.config.disable_time);
                    connect_timed_out = true;
                }
            }
        }

        let mut disable_lifted = false;
        if let Some(t) = self.disabled_until {
            if t <= now {
                self.disabled_until = None;
                disable_lifted = true;
            }
        }
        if disable_lifted {
            self.release_one_waiter();
        }

        self.maybe_self_free();

        SweepResult {
            expired_idle,
            connect_timed_out,
        }
    }

    /// Earliest of the idle-expiry, waiter-timeout, connect-timeout, and
    /// disable-window deadlines, for folding into the owning worker's
    /// `poll()` timeout.
    pub fn next_wake(&self, now: f64) -> Option<f64> {
        let idle_deadline = self.idle.front().map(|(_, ts)| ts + self.config.idle_timeout);
        let waiter_deadline = self.waiters.front_deadline();
        let connect_deadline = self
            .connect_started
            .map(|t| t + self.config.connect_timeout);
        let disable_deadline = self.disabled_until;

        let _ = now;
        [idle_deadline, waiter_deadline, connect_deadline, disable_deadline]
            .into_iter()
            .flatten()
            .fold(None, |acc: Option<f64>, t| Some(acc.map_or(t, |a| a.min(t))))
    }

    /// Requests shutdown: no new connect attempts (`get` will only serve
    /// idle reuse, and the idle set below is drained), and once every
    /// in-use connection has been returned and no connect is in flight the
    /// pool is considered self-freed — callers should check
    /// [`Backend::is_freeable`] after each `put`/`sweep`.
    pub fn shutdown(&mut self) -> Vec<C> {
        self.shutdown = true;
        self.idle.drain(..).map(|(c, _)| c.conn).collect()
    }

    /// Whether shutdown has drained everything this pool can release on
    /// its own — no in-use connections and no in-flight connect. The
    /// caller should drop the pool once this is true.
    pub fn is_freeable(&self) -> bool {
        self.shutdown && self.active == 0 && !self.connecting
    }

    fn maybe_self_free(&mut self) {
        // Nothing to do here beyond what `is_freeable` already reports —
        // Rust has no destructor-triggering equivalent of the original's
        // `li_backend_free`'s final `g_slice_free`; the caller drops the
        // value once `is_freeable()` is true.
    }
}

/// Result of a [`Backend::sweep`] call.
#[derive(Debug)]
pub struct SweepResult<C> {
    /// Idle connections that aged out; the caller should close these.
    pub expired_idle: Vec<C>,
    /// Whether the in-flight connect fd just timed out and should be
    /// closed by the caller.
    pub connect_timed_out: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn addr() -> SocketAddress {
        SocketAddress::new(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9000))
    }

    struct Harness {
        el: crate::eventloop::EventLoop,
        jr_queue: crate::job::JobRefQueue,
        fired: Arc<AtomicUsize>,
    }

    impl Harness {
        fn new() -> Self {
            Harness {
                el: crate::eventloop::EventLoop::new().unwrap(),
                jr_queue: crate::job::JobRefQueue::new(),
                fired: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn job_ref(&self) -> JobRef {
            let fired = self.fired.clone();
            JobRef::new(
                Arc::new(move || {
                    fired.fetch_add(1, Ordering::SeqCst);
                }),
                self.jr_queue.sender(),
                self.el.waker(),
            )
        }

        fn drain(&self) -> usize {
            self.jr_queue.drain();
            self.fired.swap(0, Ordering::SeqCst)
        }
    }

    #[test]
    fn fresh_get_connects_synchronously_and_reuses_idle_afterwards() {
        let h = Harness::new();
        let mut backend: Backend<u32> = Backend::new(addr(), BackendConfig::default());
        let mut bwait = None;

        let result = backend.get(0.0, &mut bwait, || h.job_ref(), |_| ConnectOutcome::Ready(42));
        let conn = match result {
            BackendResult::Success(c) => c,
            _ => panic!("expected Success"),
        };
        assert_eq!(conn.conn, 42);
        assert_eq!(backend.active(), 1);
        assert!(bwait.is_none());

        backend.put(conn, false, 1.0);
        assert_eq!(backend.active(), 0);
        assert_eq!(backend.idle_count(), 1);

        let result = backend.get(2.0, &mut bwait, || h.job_ref(), |_| {
            panic!("should reuse idle, not reconnect")
        });
        match result {
            BackendResult::Success(c) => assert_eq!(c.conn, 42),
            _ => panic!("expected Success from idle reuse"),
        }
    }

    #[test]
    fn s1_fair_queueing_single_slot_three_waiters() {
        // S1: max_connections=1, 3 `get`s at t=0. First starts an async
        // connect; the other two park behind it in FIFO order.
        let h = Harness::new();
        let mut backend: Backend<u32> = Backend::new(
            addr(),
            BackendConfig {
                max_connections: Some(1),
                connect_timeout: 5.0,
                wait_timeout: 10.0,
                ..BackendConfig::default()
            },
        );

        let mut w1 = None;
        let r1 = backend.get(0.0, &mut w1, || h.job_ref(), |_| ConnectOutcome::InProgress);
        assert!(matches!(r1, BackendResult::Wait));
        assert!(backend.is_connecting());

        let mut w2 = None;
        let r2 = backend.get(0.0, &mut w2, || h.job_ref(), |_| {
            panic!("only one connect may be in flight")
        });
        assert!(matches!(r2, BackendResult::Wait));

        let mut w3 = None;
        let r3 = backend.get(0.0, &mut w3, || h.job_ref(), |_| {
            panic!("only one connect may be in flight")
        });
        assert!(matches!(r3, BackendResult::Wait));

        // t=1: connect succeeds -> TWO waiters resume (the fresh connection,
        // and the now-free connect slot): w1 (FIFO head) and w2.
        backend.complete_connect(1.0, Ok(100u32));
        assert_eq!(h.drain(), 2, "connect success wakes the head and the freed connect slot");

        let r1_retry = backend.get(1.0, &mut w1, || h.job_ref(), |_| {
            panic!("idle connection should be reused")
        });
        let c1 = match r1_retry {
            BackendResult::Success(c) => c,
            other => panic!("expected Success, got {other:?}"),
        };
        assert!(w1.is_none());

        // w2's wake was optimistic: w1 just took the only connection, so w2
        // is still at capacity and re-parks behind w3 rather than getting
        // served twice.
        let r2_retry = backend.get(1.0, &mut w2, || h.job_ref(), |_| {
            panic!("at capacity, must not attempt a second connect")
        });
        assert!(matches!(r2_retry, BackendResult::Wait));
        assert!(w2.is_some(), "w2 re-queues instead of being forgotten");

        // put without close at t=2: the current FIFO head (w3, never
        // signaled) resumes — not w2, who re-parked behind it above.
        backend.put(c1, false, 2.0);
        assert_eq!(h.drain(), 1);
        let r3_retry = backend.get(2.0, &mut w3, || h.job_ref(), |_| {
            panic!("idle connection should be reused")
        });
        let c3 = match r3_retry {
            BackendResult::Success(c) => c,
            other => panic!("expected Success, got {other:?}"),
        };

        // put at t=3: w2 finally gets its turn. No extra sockets.
        backend.put(c3, false, 3.0);
        assert_eq!(h.drain(), 1);
        let r2_final = backend.get(3.0, &mut w2, || h.job_ref(), |_| {
            panic!("idle connection should be reused")
        });
        assert!(matches!(r2_final, BackendResult::Success(_)));
    }

    #[test]
    fn s2_connect_timeout_opens_disable_window_anchored_at_connect_start() {
        let h = Harness::new();
        let mut backend: Backend<u32> = Backend::new(
            addr(),
            BackendConfig {
                max_connections: Some(1),
                connect_timeout: 1.0,
                disable_time: 5.0,
                wait_timeout: 10.0,
                ..BackendConfig::default()
            },
        );

        let mut w1 = None;
        backend.get(0.0, &mut w1, || h.job_ref(), |_| ConnectOutcome::InProgress);
        let mut w2 = None;
        backend.get(0.0, &mut w2, || h.job_ref(), |_| {
            panic!("only one connect in flight")
        });

        // t=1: connect_timeout elapses; sweep reports the fd should close
        // and opens the disable window anchored at connect start (t=0).
        let sweep = backend.sweep(1.0);
        assert!(sweep.connect_timed_out);
        assert!(!backend.is_connecting());

        // still inside the disable window
        let retry = backend.get(1.0, &mut w1, || h.job_ref(), |_| {
            panic!("disabled, must not attempt connect")
        });
        assert!(matches!(retry, BackendResult::Wait));

        // t=6: window (0 + 5) elapses; sweep wakes a waiter to retry.
        let sweep2 = backend.sweep(6.0);
        assert!(!sweep2.connect_timed_out);
        assert_eq!(h.drain(), 1, "disable window lift wakes one waiter");

        let r1 = backend.get(6.1, &mut w1, || h.job_ref(), |_| ConnectOutcome::Ready(9));
        assert!(matches!(r1, BackendResult::Success(_)));

        // w2's wait_timeout (10s from t=0) hasn't elapsed; it resumes once
        // the connection above is put back.
        if let BackendResult::Success(c) = r1 {
            backend.put(c, false, 6.2);
        }
        assert_eq!(h.drain(), 1);
        let r2 = backend.get(6.2, &mut w2, || h.job_ref(), |_| {
            panic!("idle reuse expected")
        });
        assert!(matches!(r2, BackendResult::Success(_)));
    }

    #[test]
    fn s3_cancelling_a_signaled_waiter_transfers_the_wakeup() {
        let h = Harness::new();
        let mut backend: Backend<u32> = Backend::new(
            addr(),
            BackendConfig {
                max_connections: Some(1),
                ..BackendConfig::default()
            },
        );

        // saturate the pool's one slot first so w1 and w2 below actually
        // park instead of connecting synchronously.
        let mut seed = None;
        let r0 = backend.get(0.0, &mut seed, || h.job_ref(), |_| ConnectOutcome::Ready(0));
        let c0 = match r0 {
            BackendResult::Success(c) => c,
            _ => panic!("expected Success"),
        };

        let mut w1 = None;
        let r1 = backend.get(0.0, &mut w1, || h.job_ref(), |_| {
            panic!("at capacity")
        });
        assert!(matches!(r1, BackendResult::Wait));

        let mut w2 = None;
        let r2 = backend.get(0.0, &mut w2, || h.job_ref(), |_| {
            panic!("at capacity")
        });
        assert!(matches!(r2, BackendResult::Wait));

        // capacity frees: w1 (FIFO head) is signaled by `put`.
        backend.put(c0, false, 0.1);
        assert_eq!(h.drain(), 1);

        // but w1 is cancelled before it retries `get` — its signal must
        // transfer to w2.
        backend.wait_stop(&mut w1);
        assert_eq!(h.drain(), 1, "w2 receives the transferred signal");

        let r2_retry = backend.get(0.2, &mut w2, || h.job_ref(), |_| {
            panic!("idle reuse expected")
        });
        assert!(matches!(r2_retry, BackendResult::Success(_)));
    }

    #[test]
    fn overloaded_connect_parks_without_opening_a_disable_window() {
        let h = Harness::new();
        let mut backend: Backend<u32> = Backend::new(addr(), BackendConfig::default());
        let mut bwait = None;
        let r = backend.get(0.0, &mut bwait, || h.job_ref(), |_| ConnectOutcome::Overloaded);
        assert!(matches!(r, BackendResult::Wait));
        assert!(!backend.is_disabled(0.0));
    }

    #[test]
    fn max_requests_closes_the_connection_instead_of_pooling_it() {
        let h = Harness::new();
        let mut backend: Backend<u32> = Backend::new(
            addr(),
            BackendConfig {
                max_requests: Some(1),
                ..BackendConfig::default()
            },
        );
        let mut bwait = None;
        let r = backend.get(0.0, &mut bwait, || h.job_ref(), |_| ConnectOutcome::Ready(5));
        let conn = match r {
            BackendResult::Success(c) => c,
            _ => panic!("expected Success"),
        };
        assert_eq!(conn.requests(), 1);
        let closed = backend.put(conn, false, 1.0);
        assert_eq!(closed, Some(5), "connection at max_requests is closed, not pooled");
        assert_eq!(backend.idle_count(), 0);
    }

    #[test]
    fn wait_ticket_deadline_expiry_reports_timeout() {
        let h = Harness::new();
        let mut backend: Backend<u32> = Backend::new(
            addr(),
            BackendConfig {
                max_connections: Some(1),
                wait_timeout: 5.0,
                ..BackendConfig::default()
            },
        );
        let mut w1 = None;
        backend.get(0.0, &mut w1, || h.job_ref(), |_| ConnectOutcome::InProgress);
        let mut w2 = None;
        let r2 = backend.get(0.0, &mut w2, || h.job_ref(), |_| {
            panic!("at capacity")
        });
        assert!(matches!(r2, BackendResult::Wait));

        let retry = backend.get(6.0, &mut w2, || h.job_ref(), |_| {
            panic!("ticket already past deadline")
        });
        assert!(matches!(retry, BackendResult::Timeout));
        assert!(w2.is_none());
    }

    #[test]
    fn sweep_expires_stale_idle_connections_from_the_head() {
        let mut backend: Backend<u32> = Backend::new(
            addr(),
            BackendConfig {
                idle_timeout: 1.0,
                ..BackendConfig::default()
            },
        );
        backend.idle.push_back((BackendConnection { conn: 1, requests: 1 }, 0.0));
        backend.idle.push_back((BackendConnection { conn: 2, requests: 1 }, 0.9));
        let sweep = backend.sweep(1.5);
        assert_eq!(sweep.expired_idle, vec![1]);
        assert_eq!(backend.idle_count(), 1);
    }

    #[test]
    fn shutdown_drains_idle_and_becomes_freeable_once_active_reaches_zero() {
        let h = Harness::new();
        let mut backend: Backend<u32> = Backend::new(addr(), BackendConfig::default());
        let mut bwait = None;
        let r = backend.get(0.0, &mut bwait, || h.job_ref(), |_| ConnectOutcome::Ready(1));
        let conn = match r {
            BackendResult::Success(c) => c,
            _ => panic!("expected Success"),
        };
        assert!(!backend.is_freeable());

        let drained = backend.shutdown();
        assert!(drained.is_empty(), "nothing idle yet");
        assert!(!backend.is_freeable(), "still one active connection");

        backend.put(conn, false, 1.0);
        assert!(backend.is_freeable());
    }
}
