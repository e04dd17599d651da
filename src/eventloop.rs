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

//! The event-loop primitives every subsystem is built on: fd readiness,
//! a monotonic clock, and an async wakeup usable from any thread.
//!
//! Generalizes a `mio::Poll` + `Events` run loop so a single loop can host a
//! stream graph, one or more backend pools, and dynamic config caches side
//! by side.

use std::io;
use std::sync::Arc;
use std::time::Instant;

use mio::{Interest, Registry, Token};

/// Monotonic clock shared by every subsystem on one worker. Mirrors the
/// `now()` hook spec lists under "consumed from collaborators".
#[derive(Debug, Clone)]
pub struct Clock {
    epoch: Instant,
}

impl Clock {
    /// Starts a new clock; `now()` returns seconds elapsed since this call.
    pub fn new() -> Self {
        Clock {
            epoch: Instant::now(),
        }
    }

    /// Monotonic seconds since this clock was created.
    pub fn now(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

/// A registered fd-readiness + async-wakeup event loop for one worker.
///
/// Thin wrapper around `mio::Poll`: register/reregister/deregister plumb
/// straight through, `waker()` hands out the `Send + Sync` handle used by
/// [`crate::job::JobRef`] to interrupt a blocked `poll()` from another
/// thread.
#[derive(Debug)]
pub struct EventLoop {
    poll: mio::Poll,
    waker: Arc<mio::Waker>,
    clock: Clock,
}

/// Reserved token for the loop's own cross-thread wakeup.
pub const WAKE_TOKEN: Token = Token(usize::MAX - 1);

impl EventLoop {
    /// Creates a loop and registers its wakeup watcher.
    pub fn new() -> io::Result<Self> {
        let poll = mio::Poll::new()?;
        let waker = Arc::new(mio::Waker::new(poll.registry(), WAKE_TOKEN)?);
        Ok(EventLoop {
            poll,
            waker,
            clock: Clock::new(),
        })
    }

    /// The loop's monotonic clock.
    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    /// Current monotonic time, in seconds.
    pub fn now(&self) -> f64 {
        self.clock.now()
    }

    /// A cloneable, thread-safe handle that interrupts a blocked `poll()`.
    pub fn waker(&self) -> Arc<mio::Waker> {
        self.waker.clone()
    }

    /// The underlying registry, for registering readiness-watched sources.
    pub fn registry(&self) -> &Registry {
        self.poll.registry()
    }

    pub(crate) fn register<S>(&self, source: &mut S, token: Token, interest: Interest) -> io::Result<()>
    where
        S: mio::event::Source + ?Sized,
    {
        self.poll.registry().register(source, token, interest)
    }

    pub(crate) fn reregister<S>(&self, source: &mut S, token: Token, interest: Interest) -> io::Result<()>
    where
        S: mio::event::Source + ?Sized,
    {
        self.poll.registry().reregister(source, token, interest)
    }

    pub(crate) fn deregister<S>(&self, source: &mut S) -> io::Result<()>
    where
        S: mio::event::Source + ?Sized,
    {
        self.poll.registry().deregister(source)
    }

    /// Blocks until events are ready or `timeout` elapses, filling `events`.
    pub fn poll(&mut self, events: &mut mio::Events, timeout: Option<std::time::Duration>) -> io::Result<()> {
        self.poll.poll(events, timeout)
    }
}
