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

//! A chunk queue of in-memory byte chunks, plus the shared credit limit
//! ([`CqLimit`]) a stream connection uses for backpressure.
//!
//! The original also carries file and mmap chunk variants for zero-copy
//! sendfile; those are an I/O optimization orthogonal to the graph/pool
//! primitives this crate provides, so only the memory chunk variant is
//! implemented here — enough to exercise every invariant below.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::{Rc, Weak};

/// One queued unit of data. Only in-memory chunks are modeled; a real
/// gateway would add file-backed and mmap variants alongside this one.
#[derive(Debug, Clone)]
pub enum Chunk {
    /// Owned bytes.
    Mem(Vec<u8>),
}

impl Chunk {
    fn len(&self) -> usize {
        match self {
            Chunk::Mem(b) => b.len(),
        }
    }
}

/// FIFO queue of chunks with byte-accurate, monotonic accounting.
///
/// `length` and `bytes_in` are observable and never move backwards except
/// when chunks are consumed off the front (`length`) — `bytes_in` only ever
/// grows, matching spec's invariant that a chunk queue's byte counters are
/// monotonic for the life of the queue.
#[derive(Debug, Default)]
pub struct ChunkQueue {
    chunks: VecDeque<Chunk>,
    /// Bytes of `chunks[0]` already consumed by a previous partial read.
    front_offset: usize,
    length: u64,
    bytes_in: u64,
    closed: bool,
}

impl ChunkQueue {
    /// An empty, open queue.
    pub fn new() -> Self {
        ChunkQueue::default()
    }

    /// Bytes currently queued (not yet stolen, skipped, or read).
    pub fn len(&self) -> u64 {
        self.length
    }

    /// Whether the queue currently holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Total bytes ever appended to this queue. Monotonic for its lifetime.
    pub fn bytes_in(&self) -> u64 {
        self.bytes_in
    }

    /// Whether the producer side has signaled no more data is coming.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Marks the queue closed. Idempotent; closing never removes queued
    /// bytes — a reader can still drain what's already buffered.
    pub fn close(&mut self) {
        self.closed = true;
    }

    /// Appends an owned buffer as a single chunk.
    pub fn append_buffer(&mut self, buf: Vec<u8>) {
        if buf.is_empty() {
            return;
        }
        self.length += buf.len() as u64;
        self.bytes_in += buf.len() as u64;
        self.chunks.push_back(Chunk::Mem(buf));
    }

    /// Borrowing view over the queued bytes in order, respecting any
    /// partial consumption of the front chunk. Does not consume anything.
    pub fn iterate(&self) -> impl Iterator<Item = &[u8]> {
        self.chunks.iter().enumerate().map(move |(i, c)| match c {
            Chunk::Mem(b) => {
                if i == 0 {
                    &b[self.front_offset..]
                } else {
                    &b[..]
                }
            }
        })
    }

    /// Copies up to `buf.len()` queued bytes into `buf`, consuming them.
    /// Returns the number of bytes written.
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let mut written = 0;
        while written < buf.len() {
            let Some(front) = self.chunks.front() else {
                break;
            };
            let Chunk::Mem(data) = front;
            let available = &data[self.front_offset..];
            if available.is_empty() {
                self.pop_front_chunk();
                continue;
            }
            let take = available.len().min(buf.len() - written);
            buf[written..written + take].copy_from_slice(&available[..take]);
            written += take;
            self.front_offset += take;
            self.length -= take as u64;
            if self.front_offset >= data.len() {
                self.pop_front_chunk();
            }
        }
        written
    }

    fn pop_front_chunk(&mut self) {
        self.chunks.pop_front();
        self.front_offset = 0;
    }

    /// Moves every queued byte out of `self` and into a freshly built queue,
    /// leaving `self` empty. The closed flag is **not** transferred — the
    /// source queue keeps its own producer-closed state, matching the
    /// original's `cq_steal_all` (stealing chunks says nothing about whether
    /// more will arrive on the queue they came from).
    pub fn steal_all(&mut self) -> ChunkQueue {
        let mut stolen = ChunkQueue::new();
        if let Some(first) = self.chunks.front() {
            if self.front_offset > 0 {
                if let Chunk::Mem(b) = first {
                    let trimmed = b[self.front_offset..].to_vec();
                    stolen.chunks.push_back(Chunk::Mem(trimmed));
                    for c in self.chunks.iter().skip(1) {
                        stolen.chunks.push_back(c.clone());
                    }
                    stolen.length = self.length;
                    stolen.bytes_in = self.length;
                    self.chunks.clear();
                    self.front_offset = 0;
                    self.length = 0;
                    return stolen;
                }
            }
        }
        stolen.chunks = std::mem::take(&mut self.chunks);
        stolen.length = self.length;
        stolen.bytes_in = self.length;
        self.length = 0;
        self.front_offset = 0;
        stolen
    }

    /// Moves at most `len` queued bytes out of `self`, in order, leaving any
    /// remainder in place.
    pub fn steal_len(&mut self, len: u64) -> ChunkQueue {
        let mut stolen = ChunkQueue::new();
        let mut remaining = len;
        while remaining > 0 {
            let Some(front) = self.chunks.front() else {
                break;
            };
            let Chunk::Mem(data) = front;
            let available = (data.len() - self.front_offset) as u64;
            if available == 0 {
                self.pop_front_chunk();
                continue;
            }
            if available <= remaining {
                let bytes = data[self.front_offset..].to_vec();
                stolen.chunks.push_back(Chunk::Mem(bytes));
                stolen.length += available;
                self.length -= available;
                remaining -= available;
                self.pop_front_chunk();
            } else {
                let take = remaining as usize;
                let bytes = data[self.front_offset..self.front_offset + take].to_vec();
                stolen.chunks.push_back(Chunk::Mem(bytes));
                stolen.length += remaining;
                self.length -= remaining;
                self.front_offset += take;
                remaining = 0;
            }
        }
        stolen.bytes_in = stolen.length;
        stolen
    }

    /// Discards every queued byte without handing it anywhere — used to
    /// drain a body nobody wants to read (e.g. an upstream error response
    /// to a request whose body was never fully sent).
    pub fn skip_all(&mut self) {
        self.chunks.clear();
        self.front_offset = 0;
        self.length = 0;
    }
}

/// Something that wants to hear about a limit changing on a chunk queue it
/// cares about — typically the readiness watcher on the producing
/// [`crate::iostream::IoStream`], paused while credit is exhausted.
pub trait LimitWatcher {
    /// Called after the limit or its remaining credit changes in a way that
    /// might let a previously-paused producer make progress again.
    fn notify_new_cqlimit(&self);
}

/// Shared backpressure credit attached to a chunk queue connection.
///
/// Two streams connecting inherit whichever side already has a limit (see
/// [`CqLimit::propagate`]) — after that they share the *same* `Rc`, so
/// consuming credit on one end is visible to the other immediately, same as
/// the original's refcounted `cq->limit`.
#[derive(Debug, Default)]
pub struct CqLimit {
    /// Remaining credit in bytes; `None` means unlimited.
    remaining: Cell<Option<i64>>,
    watcher: RefCell<Weak<dyn LimitWatcher>>,
}

impl CqLimit {
    /// An unlimited credit cell.
    pub fn unlimited() -> Rc<Self> {
        Rc::new(CqLimit {
            remaining: Cell::new(None),
            watcher: RefCell::new(Weak::new()),
        })
    }

    /// A credit cell starting with `bytes` of budget.
    pub fn with_limit(bytes: i64) -> Rc<Self> {
        Rc::new(CqLimit {
            remaining: Cell::new(Some(bytes)),
            watcher: RefCell::new(Weak::new()),
        })
    }

    /// Whether any credit remains (always true for an unlimited cell).
    pub fn has_credit(&self) -> bool {
        match self.remaining.get() {
            None => true,
            Some(r) => r > 0,
        }
    }

    /// Remaining credit, or `None` if unlimited.
    pub fn remaining(&self) -> Option<i64> {
        self.remaining.get()
    }

    /// Accounts for `consumed` bytes of I/O against this limit and notifies
    /// the registered watcher — the caller finding `has_credit()` now false
    /// is expected to pause reading on its end of the connection.
    pub fn consume(&self, consumed: u64) {
        if let Some(r) = self.remaining.get() {
            self.remaining.set(Some(r - consumed as i64));
            self.notify();
        }
    }

    /// Replaces the limit (a `NEW_CQLIMIT` event in the original) and wakes
    /// the watcher so a previously-paused side gets a chance to resume.
    pub fn set_limit(&self, bytes: Option<i64>) {
        self.remaining.set(bytes);
        self.notify();
    }

    /// Registers the watcher to notify on future limit changes. Held
    /// weakly: a limit outliving its watcher is a no-op on notify, not a
    /// leak.
    pub fn set_watcher(&self, watcher: &Rc<dyn LimitWatcher>) {
        *self.watcher.borrow_mut() = Rc::downgrade(watcher);
    }

    fn notify(&self) {
        if let Some(w) = self.watcher.borrow().upgrade() {
            w.notify_new_cqlimit();
        }
    }

    /// When two streams connect, the side without its own limit inherits
    /// the other's shared credit cell (by `Rc` clone, not by value) so both
    /// ends observe the same budget. If both sides already have a limit,
    /// neither is touched — limits are never silently widened or narrowed
    /// by a connect.
    pub fn propagate(a: &Rc<CqLimit>, b: &Rc<CqLimit>) -> (Rc<CqLimit>, Rc<CqLimit>) {
        let a_limited = a.remaining.get().is_some();
        let b_limited = b.remaining.get().is_some();
        match (a_limited, b_limited) {
            (true, false) => (a.clone(), a.clone()),
            (false, true) => (b.clone(), b.clone()),
            _ => (a.clone(), b.clone()),
        }
    }
}
