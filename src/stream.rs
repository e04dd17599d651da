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

//! The stream graph: every stream embeds both a source half (its own
//! outgoing chunk queue, written by a producer callback) and a drain half
//! (a consumer callback that reads from whatever upstream stream it is
//! connected to). `connect(source_side, drain_side)` links `source_side`'s
//! production to `drain_side`'s consumption; a stream can simultaneously be
//! the drain of one connection and the source of another, which is how a
//! filter sits in the middle of a pipeline.
//!
//! Two objects reference each other for their whole connected lifetime —
//! the source needs to wake the drain when data arrives, the drain needs to
//! wake the source when it wants more. The original carries that as a raw
//! pointer cycle kept alive by manual `li_stream_acquire`/`release`
//! refcounts. Rust's borrow checker won't let two owners hold `&mut` to
//! each other, and an `Rc<RefCell<_>>` cycle here would simply leak (a
//! connected source and drain reference each other forever, so neither
//! `Rc`'s count ever reaches zero) — so this module keeps every stream in a
//! `Slab` owned by the worker and refers to peers by [`StreamHandle`]
//! (slab key + generation) instead of by pointer. A stale handle is a
//! catchable `None`, not a use-after-free.

use slab::Slab;

use crate::chunkqueue::{ChunkQueue, CqLimit};
use crate::job::{Job, JobQueue, Scheduled};
use std::rc::Rc;

/// A stable reference to a stream living in some [`StreamArena`]. Carries a
/// generation counter so a handle to a freed-and-recycled slot is detected
/// as stale rather than silently resolving to the wrong stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamHandle {
    key: usize,
    generation: u64,
}

/// What a stream's source side does when woken: push more data into the
/// stream's own outgoing queue, or notice EOF/error and close it.
pub trait Source {
    /// Called whenever this stream's source side might be able to make
    /// progress — after connecting, or after a paused state is lifted.
    fn wakeup(&mut self, cq: &mut ChunkQueue);
}

/// What a stream's drain side does when woken: consume from the connected
/// upstream stream's outgoing queue.
pub trait Drain {
    /// Called whenever the connected upstream's queue gained data or
    /// closed. `cq` is the *upstream* stream's outgoing queue, not this
    /// stream's own.
    fn wakeup(&mut self, cq: &mut ChunkQueue);
}

struct Slot {
    generation: u64,
    refs: usize,
    /// This stream's own produced data (written by `source_impl`, read by
    /// whatever drain is connected to us).
    out: ChunkQueue,
    /// Shared backpressure credit for `out`. Starts unlimited; may be
    /// replaced wholesale by [`StreamArena::set_cqlimit`] or inherited from
    /// a peer at connect time (see [`StreamArena::propagate_limit`]).
    limit: Rc<CqLimit>,
    source_impl: Option<Box<dyn Source>>,
    drain_impl: Option<Box<dyn Drain>>,
    /// My source is connected to this peer's drain (who I send to).
    connected_drain: Option<StreamHandle>,
    /// My drain is connected to this peer's source (who I read from).
    connected_source: Option<StreamHandle>,
    /// Backpressure: while true, wakeups for this stream are swallowed
    /// (matches `li_stream_notify_pause`). `notify_continue` clears this
    /// and runs one wakeup to catch up on whatever was missed.
    paused: bool,
    /// Set while `wakeup` is already running for this slot, so a wakeup
    /// triggered from inside a callback doesn't recurse — it observes the
    /// same in-progress pass instead. Mirrors the original's
    /// `handle_wakeup_entered` reentrancy guard.
    in_wakeup: bool,
}

/// Per-worker arena owning every stream. Streams never cross workers —
/// they're handed around by [`StreamHandle`], which is `Copy` but not
/// `Send`, matching the single-threaded-per-worker discipline the rest of
/// this crate follows.
#[derive(Default)]
pub struct StreamArena {
    slots: Slab<Slot>,
    /// Per-key generation counter, tracked independently of `slots` so it
    /// survives a slot's removal and still distinguishes a stale handle
    /// from whatever the slab later reuses that key for.
    generations: Vec<u64>,
}

/// Manual impl: `Slot` holds `Box<dyn Source>`/`Box<dyn Drain>`, neither of
/// which is `Debug`, so this can't be `#[derive(Debug)]`.
impl std::fmt::Debug for StreamArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamArena")
            .field("streams", &self.slots.len())
            .finish()
    }
}

impl StreamArena {
    /// An empty arena.
    pub fn new() -> Self {
        StreamArena::default()
    }

    /// Creates a new, unconnected stream with one reference held by the
    /// caller and an unlimited credit on its outgoing queue. Release it
    /// with [`StreamArena::release`] once done.
    pub fn new_stream(&mut self) -> StreamHandle {
        let key = self.slots.vacant_key();
        if self.generations.len() <= key {
            self.generations.resize(key + 1, 0);
        }
        let generation = self.generations[key];
        self.slots.insert(Slot {
            generation,
            refs: 1,
            out: ChunkQueue::new(),
            limit: CqLimit::unlimited(),
            source_impl: None,
            drain_impl: None,
            connected_drain: None,
            connected_source: None,
            paused: false,
            in_wakeup: false,
        });
        StreamHandle { key, generation }
    }

    fn get(&self, handle: StreamHandle) -> Option<&Slot> {
        self.slots
            .get(handle.key)
            .filter(|s| s.generation == handle.generation)
    }

    fn get_mut(&mut self, handle: StreamHandle) -> Option<&mut Slot> {
        self.slots
            .get_mut(handle.key)
            .filter(|s| s.generation == handle.generation)
    }

    /// Whether `handle` still names a live stream in this arena.
    pub fn is_valid(&self, handle: StreamHandle) -> bool {
        self.get(handle).is_some()
    }

    /// Adds one reference, keeping the stream alive even after its current
    /// owner releases it. Matches `li_stream_acquire`.
    pub fn acquire(&mut self, handle: StreamHandle) {
        if let Some(slot) = self.get_mut(handle) {
            slot.refs += 1;
        }
    }

    /// Drops one reference, freeing the slot once it reaches zero. Matches
    /// `li_stream_release`. `DESTROY`-equivalent cleanup is simply "the slot
    /// is gone" — there is no further callback, since Rust already runs
    /// `Box<dyn Source/Drain>`'s destructor on drop.
    pub fn release(&mut self, handle: StreamHandle) {
        let Some(slot) = self.get_mut(handle) else {
            return;
        };
        debug_assert!(
            slot.refs > 1 || (slot.connected_drain.is_none() && slot.connected_source.is_none()),
            "stream reached refcount 0 while still connected"
        );
        slot.refs -= 1;
        if slot.refs == 0 {
            self.slots.remove(handle.key);
            self.generations[handle.key] += 1;
        }
    }

    /// Installs `source` as this stream's producer. Call before connecting.
    pub fn set_source(&mut self, handle: StreamHandle, source: Box<dyn Source>) {
        if let Some(slot) = self.get_mut(handle) {
            slot.source_impl = Some(source);
        }
    }

    /// Installs `drain` as this stream's consumer. Call before connecting.
    pub fn set_drain(&mut self, handle: StreamHandle, drain: Box<dyn Drain>) {
        if let Some(slot) = self.get_mut(handle) {
            slot.drain_impl = Some(drain);
        }
    }

    /// Replaces the credit limit on `handle`'s own outgoing queue and walks
    /// its downstream chain the same way [`StreamArena::propagate_limit`]
    /// does for an implicit connect-time inheritance, so an explicit
    /// `set_cqlimit` behaves identically to the original's `NEW_CQLIMIT`
    /// event. Matches spec's "setting or replacing a limit... triggers a
    /// `NEW_CQLIMIT` event on connected streams."
    pub fn set_cqlimit(&mut self, handle: StreamHandle, limit: Rc<CqLimit>) {
        if let Some(slot) = self.get_mut(handle) {
            slot.limit = limit.clone();
        }
        let mut cur = self.get(handle).and_then(|s| s.connected_drain);
        while let Some(h) = cur {
            let has_own = self.get(h).map(|s| s.limit.remaining().is_some());
            match has_own {
                None | Some(true) => break,
                Some(false) => {
                    if let Some(slot) = self.get_mut(h) {
                        slot.limit = limit.clone();
                    }
                }
            }
            cur = self.get(h).and_then(|s| s.connected_drain);
        }
    }

    /// This stream's own credit limit (shared with any downstream peer it
    /// propagated to).
    pub fn cqlimit(&self, handle: StreamHandle) -> Option<Rc<CqLimit>> {
        self.get(handle).map(|s| s.limit.clone())
    }

    /// Connects two streams: `source_side`'s production becomes visible to
    /// `drain_side`'s consumption. Runs limit propagation (spec §4.3
    /// "Limit propagation at connect time"), then kicks a wakeup so a
    /// source that already has data or is closed gets delivered
    /// immediately rather than waiting for the next unrelated event.
    pub fn connect(&mut self, source_side: StreamHandle, drain_side: StreamHandle) {
        if let Some(s) = self.get_mut(source_side) {
            s.connected_drain = Some(drain_side);
        }
        if let Some(d) = self.get_mut(drain_side) {
            d.connected_source = Some(source_side);
        }
        self.propagate_limit(source_side, drain_side);
        self.wakeup(source_side);
    }

    /// If exactly one of `a`'s and `b`'s own limits is set, the limitless
    /// side (and its own downstream chain, up to the first pre-limited
    /// queue) inherits the limited side's credit cell.
    fn propagate_limit(&mut self, a: StreamHandle, b: StreamHandle) {
        let a_limit = self.get(a).map(|s| s.limit.clone());
        let b_limit = self.get(b).map(|s| s.limit.clone());
        let (Some(a_limit), Some(b_limit)) = (a_limit, b_limit) else {
            return;
        };
        let a_has = a_limit.remaining().is_some();
        let b_has = b_limit.remaining().is_some();
        if a_has && !b_has {
            self.set_cqlimit(b, a_limit);
        } else if b_has && !a_has {
            self.set_cqlimit(a, b_limit);
        }
    }

    /// Cooperative disconnect: only the drain side is unlinked, and this
    /// stream's own outgoing queue is closed so a connected downstream
    /// drain observes clean EOF instead of being cut off mid-stream.
    /// Matches the original's `li_stream_disconnect` default behavior.
    pub fn close(&mut self, handle: StreamHandle) {
        if let Some(slot) = self.get_mut(handle) {
            slot.out.close();
        }
        let peer = self.get(handle).and_then(|s| s.connected_drain);
        if let Some(slot) = self.get_mut(handle) {
            slot.connected_drain = None;
        }
        if let Some(peer) = peer {
            if let Some(peer_slot) = self.get_mut(peer) {
                peer_slot.connected_source = None;
            }
            self.wakeup(peer);
        }
    }

    /// Hard disconnect: unlinks both halves of `handle` from their
    /// respective peers and drops both callbacks, so no further wakeup can
    /// reach this stream. Matches the original's `li_stream_reset`.
    pub fn reset(&mut self, handle: StreamHandle) {
        let (drain_peer, source_peer) = match self.get(handle) {
            Some(s) => (s.connected_drain, s.connected_source),
            None => return,
        };
        if let Some(slot) = self.get_mut(handle) {
            slot.connected_drain = None;
            slot.connected_source = None;
            slot.source_impl = None;
            slot.drain_impl = None;
        }
        if let Some(peer) = drain_peer {
            if let Some(peer_slot) = self.get_mut(peer) {
                peer_slot.connected_source = None;
            }
        }
        if let Some(peer) = source_peer {
            if let Some(peer_slot) = self.get_mut(peer) {
                peer_slot.connected_drain = None;
            }
            self.wakeup(peer);
        }
    }

    /// Reads the stream's own outgoing queue without consuming it.
    pub fn out_queue(&self, handle: StreamHandle) -> Option<&ChunkQueue> {
        self.get(handle).map(|s| &s.out)
    }

    /// Mutable access to the stream's own outgoing queue, for a source to
    /// append to directly (e.g. an [`crate::iostream::IoStream`] filling it
    /// from a socket read).
    pub fn out_queue_mut(&mut self, handle: StreamHandle) -> Option<&mut ChunkQueue> {
        self.get_mut(handle).map(|s| &mut s.out)
    }

    /// Pauses wakeup delivery to this stream — used by a drain applying
    /// backpressure on its own upstream. Matches `li_stream_notify_pause`.
    pub fn notify_pause(&mut self, handle: StreamHandle) {
        if let Some(slot) = self.get_mut(handle) {
            slot.paused = true;
        }
    }

    /// Resumes wakeup delivery and immediately runs one, since whatever
    /// paused likely missed at least one notification while paused.
    /// Matches `li_stream_notify_continue`.
    pub fn notify_continue(&mut self, handle: StreamHandle) {
        if let Some(slot) = self.get_mut(handle) {
            slot.paused = false;
        }
        self.wakeup(handle);
    }

    /// Notifies `handle`'s source to produce, propagates that downstream if
    /// connected, then notifies `handle`'s drain to consume from whatever
    /// it's connected to. Reentrant-safe: a wakeup triggered while this
    /// stream is already mid-wakeup is dropped, matching the original's
    /// `handle_wakeup_entered` guard — the in-progress call will observe
    /// the same state change before it returns.
    pub fn wakeup(&mut self, handle: StreamHandle) {
        let (paused, already_in) = match self.get(handle) {
            Some(slot) => (slot.paused, slot.in_wakeup),
            None => return,
        };
        if paused || already_in {
            return;
        }
        if let Some(slot) = self.get_mut(handle) {
            slot.in_wakeup = true;
        }

        if let Some(mut producer) = self.get_mut(handle).and_then(|s| s.source_impl.take()) {
            if let Some(slot) = self.get_mut(handle) {
                producer.wakeup(&mut slot.out);
            }
            if let Some(slot) = self.get_mut(handle) {
                slot.source_impl = Some(producer);
            }
            if let Some(downstream) = self.get(handle).and_then(|s| s.connected_drain) {
                self.wakeup(downstream);
            }
        }

        if let Some(upstream) = self.get(handle).and_then(|s| s.connected_source) {
            if let Some(mut consumer) = self.get_mut(handle).and_then(|s| s.drain_impl.take()) {
                let mut borrowed = self
                    .get_mut(upstream)
                    .map(|s| std::mem::take(&mut s.out))
                    .unwrap_or_default();
                consumer.wakeup(&mut borrowed);
                let drained_and_closed = borrowed.is_empty() && borrowed.is_closed();
                if let Some(slot) = self.get_mut(upstream) {
                    slot.out = borrowed;
                }
                if let Some(slot) = self.get_mut(handle) {
                    slot.drain_impl = Some(consumer);
                }
                // SOURCE_CLOSED_DRAINING -> TORN_DOWN: once the upstream's
                // queue is both closed and fully drained, the drain side
                // auto-disconnects rather than polling a dead source.
                if drained_and_closed {
                    if let Some(slot) = self.get_mut(handle) {
                        slot.connected_source = None;
                    }
                    if let Some(slot) = self.get_mut(upstream) {
                        slot.connected_drain = None;
                    }
                }
            }
        }

        if let Some(slot) = self.get_mut(handle) {
            slot.in_wakeup = false;
        }
    }
}

/// A shareable reference a stream can hand to a [`JobQueue`] so a deferred
/// wakeup runs through the same reentrancy-guarded path as an immediate
/// one. Arenas are owned data, not `Rc`, so this wraps the arena itself —
/// callers typically keep one `Rc<RefCell<StreamArena>>` per worker and
/// build one `StreamJob` per stream that needs deferred wakeups.
#[derive(Debug)]
pub struct StreamJob {
    arena: Rc<std::cell::RefCell<StreamArena>>,
    handle: StreamHandle,
    job: Job,
}

impl StreamJob {
    /// Builds a postable handle for `handle`'s deferred wakeup.
    pub fn new(arena: Rc<std::cell::RefCell<StreamArena>>, handle: StreamHandle) -> Rc<Self> {
        Rc::new(StreamJob {
            arena,
            handle,
            job: Job::new(),
        })
    }

    /// Schedules this stream's wakeup to run on the next tick, coalescing
    /// with any other `wakeup_later` already pending for it.
    pub fn wakeup_later(self: &Rc<Self>, queue: &JobQueue) {
        queue.post_later(self);
    }
}

impl Scheduled for StreamJob {
    fn job(&self) -> &Job {
        &self.job
    }

    fn run(self: Rc<Self>) {
        self.arena.borrow_mut().wakeup(self.handle);
    }
}

#[derive(Debug, Default)]
struct PlugBuffer {
    held: ChunkQueue,
}

/// A forwarder: on wakeup, drains whatever's in its connected upstream
/// queue straight through to its own outgoing queue, propagating
/// `is_closed` along with it. Used to hold a filter slot open before the
/// real transform is ready to attach, without stalling the pipeline.
///
/// A single `Plug` sits in the middle of a pipeline as both a drain (it
/// consumes from whatever connects to it upstream) and a source (it
/// produces for whatever connects to it downstream); [`Plug::drain_handle`]
/// and [`Plug::source_handle`] hand out two trait-object halves sharing the
/// same buffered bytes, since `set_source`/`set_drain` each need their own
/// `Box<dyn _>`.
#[derive(Debug, Clone, Default)]
pub struct Plug(Rc<std::cell::RefCell<PlugBuffer>>);

impl Plug {
    /// A fresh plug with nothing buffered.
    pub fn new() -> Self {
        Plug::default()
    }

    /// A `Box<dyn Drain>` for [`StreamArena::set_drain`], sharing this
    /// plug's buffer.
    pub fn drain_handle(&self) -> Box<dyn Drain> {
        Box::new(self.clone())
    }

    /// A `Box<dyn Source>` for [`StreamArena::set_source`], sharing this
    /// plug's buffer.
    pub fn source_handle(&self) -> Box<dyn Source> {
        Box::new(self.clone())
    }
}

impl Drain for Plug {
    fn wakeup(&mut self, cq: &mut ChunkQueue) {
        let mut stolen = cq.steal_all();
        let mut buf = vec![0u8; stolen.len() as usize];
        let n = stolen.read(&mut buf);
        let mut inner = self.0.borrow_mut();
        if n > 0 {
            inner.held.append_buffer(buf[..n].to_vec());
        }
        if cq.is_closed() {
            inner.held.close();
        }
    }
}

impl Source for Plug {
    fn wakeup(&mut self, cq: &mut ChunkQueue) {
        let mut inner = self.0.borrow_mut();
        let was_closed = inner.held.is_closed();
        let mut stolen = inner.held.steal_all();
        let mut buf = vec![0u8; stolen.len() as usize];
        let n = stolen.read(&mut buf);
        if n > 0 {
            cq.append_buffer(buf[..n].to_vec());
        }
        if was_closed {
            cq.close();
        }
    }
}

/// A drain that discards everything offered to it unconditionally — used
/// to sink a body nobody wants (an upstream error page replacing a request
/// body still being read, say) without the source stalling on
/// backpressure. Its own outgoing queue (it can also sit as a source, e.g.
/// to answer a HEAD-like probe with nothing) is permanently closed.
#[derive(Debug, Default)]
pub struct Null;

impl Drain for Null {
    fn wakeup(&mut self, cq: &mut ChunkQueue) {
        cq.skip_all();
    }
}

impl Source for Null {
    fn wakeup(&mut self, cq: &mut ChunkQueue) {
        cq.close();
    }
}
