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

//! The owning worker: one [`EventLoop`], one [`JobQueue`], one
//! [`StreamArena`], and the cross-thread wakeup channel everything else in
//! this crate parks a [`crate::job::JobRef`] against.
//!
//! A worker is single-threaded by construction — its stream arena and job
//! queue are plain (non-atomic) state, never touched from another thread.
//! Anything that needs to resume work here from elsewhere (a backend
//! connect finishing on another worker's loop, a dynamic config refresh
//! completing) does so exclusively through a `JobRef`, never by reaching
//! into this struct directly.
//!
//! This module intentionally doesn't own any [`crate::backend::Backend`]
//! or [`crate::dynconf::DynamicConfig`] instances itself — those are keyed
//! and typed by the application built on top (a backend pool per upstream,
//! a config cache per lookup kind). What a worker provides is the loop
//! they all fold their own `next_wake` deadlines into.

use std::io;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Sender;
use mio::{Events, Token};

use crate::eventloop::{Clock, EventLoop, WAKE_TOKEN};
use crate::job::{JobQueue, JobRef, JobRefQueue};
use crate::stream::StreamArena;

/// One worker's event loop plus the state every subsystem on it shares.
#[derive(Debug)]
pub struct Worker {
    event_loop: EventLoop,
    jobs: JobQueue,
    job_refs: JobRefQueue,
    streams: Rc<std::cell::RefCell<StreamArena>>,
}

impl Worker {
    /// Builds a worker with a fresh event loop, job queue, and stream
    /// arena.
    pub fn new() -> io::Result<Self> {
        Ok(Worker {
            event_loop: EventLoop::new()?,
            jobs: JobQueue::new(),
            job_refs: JobRefQueue::new(),
            streams: Rc::new(std::cell::RefCell::new(StreamArena::new())),
        })
    }

    /// This worker's event loop.
    pub fn event_loop(&self) -> &EventLoop {
        &self.event_loop
    }

    /// Mutable access to the event loop, for registering an
    /// [`crate::iostream::IoStream`].
    pub fn event_loop_mut(&mut self) -> &mut EventLoop {
        &mut self.event_loop
    }

    /// This worker's monotonic clock.
    pub fn clock(&self) -> &Clock {
        self.event_loop.clock()
    }

    /// Current monotonic time on this worker's loop.
    pub fn now(&self) -> f64 {
        self.event_loop.now()
    }

    /// This worker's coalesced job queue.
    pub fn jobs(&self) -> &JobQueue {
        &self.jobs
    }

    /// This worker's stream arena, shared by `Rc` with anything (an
    /// `IoStream`, a `StreamJob`) that needs to reach into it.
    pub fn streams(&self) -> Rc<std::cell::RefCell<StreamArena>> {
        self.streams.clone()
    }

    /// A cloneable sender that, paired with [`Worker::waker`], builds a
    /// [`JobRef`] targeting this worker from any thread.
    pub fn job_ref_sender(&self) -> Sender<Arc<dyn Fn() + Send + Sync>> {
        self.job_refs.sender()
    }

    /// Builds a `JobRef` that, when fired from any thread, runs `resume`
    /// on this worker and interrupts its blocked `poll()`.
    pub fn job_ref(&self, resume: Arc<dyn Fn() + Send + Sync>) -> JobRef {
        JobRef::new(resume, self.job_refs.sender(), self.event_loop.waker())
    }

    /// Blocks until readiness events arrive or `timeout` elapses. The
    /// caller is expected to dispatch each event in `events` to whatever
    /// owns that `Token` (typically an [`crate::iostream::IoStream`]),
    /// then call [`Worker::after_poll`] to drain cross-thread wakeups and
    /// run any jobs they scheduled.
    pub fn poll(&mut self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        self.event_loop.poll(events, timeout)
    }

    /// Whether `token` names this worker's own wakeup watcher rather than
    /// an application-registered source.
    pub fn is_wake_token(token: Token) -> bool {
        token == WAKE_TOKEN
    }

    /// Drains any cross-thread job references posted since the last call,
    /// then runs the job queue to completion for this tick. Call once per
    /// `poll()` iteration, after per-token dispatch.
    pub fn after_poll(&self) {
        self.job_refs.drain();
        self.jobs.run_ready();
    }

    /// Whether this worker has job-queue work pending right now — if so,
    /// the next `poll()` should use a zero timeout rather than blocking.
    pub fn has_pending_jobs(&self) -> bool {
        self.jobs.has_pending()
    }
}
