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

//! Binds a [`crate::stream::Stream`] pair to a non-blocking socket: reads
//! fill the stream graph's input, writes drain its output, both driven by
//! a registered readiness watcher rather than blocking syscalls.
//!
//! The original's `io_stream_update` reads from `stream->in` but writes
//! from the *other* stream's `out` in one branch — a real divergence
//! between the read and write sides that only one of them actually wants.
//! Both directions here consistently read/write this `IoStream`'s own
//! queues, via [`crate::stream::StreamArena::out_queue_mut`].

use std::io::{self, Read, Write};

use mio::event::Source;
use mio::{Interest, Registry, Token};

use crate::chunkqueue::CqLimit;
use crate::eventloop::EventLoop;
use crate::stream::{StreamArena, StreamHandle};
use std::rc::Rc;

/// A socket-like source of readiness events: `mio`'s `TcpStream` satisfies
/// this directly; tests use an in-memory stand-in.
pub trait Socket: Read + Write + Source + std::fmt::Debug {}
impl<T: Read + Write + Source + std::fmt::Debug> Socket for T {}

/// Readiness bound to one non-blocking socket, feeding/draining the given
/// stream's chunk queue. Registered on an [`EventLoop`] under `token`.
#[derive(Debug)]
pub struct IoStream<S: Socket> {
    socket: S,
    token: Token,
    handle: StreamHandle,
    can_read: bool,
    can_write: bool,
    in_closed: bool,
    out_closed: bool,
    read_limit: Option<Rc<CqLimit>>,
}

impl<S: Socket> IoStream<S> {
    /// Registers `socket` on `loop_`'s registry under `token`, bound to
    /// `handle`'s queue.
    pub fn new(
        loop_: &EventLoop,
        mut socket: S,
        token: Token,
        handle: StreamHandle,
    ) -> io::Result<Self> {
        loop_.register(&mut socket, token, Interest::READABLE | Interest::WRITABLE)?;
        Ok(IoStream {
            socket,
            token,
            handle,
            can_read: false,
            can_write: false,
            in_closed: false,
            out_closed: false,
            read_limit: None,
        })
    }

    /// Attaches a shared credit limit; reads stop being attempted once it
    /// reports no credit, same as a paused source upstream.
    pub fn set_read_limit(&mut self, limit: Rc<CqLimit>) {
        self.read_limit = Some(limit);
    }

    /// This stream's registration token.
    pub fn token(&self) -> Token {
        self.token
    }

    /// Updates readiness flags from a `mio` event. Call once per delivered
    /// event for this stream's token, before `update`.
    pub fn set_ready(&mut self, readable: bool, writable: bool) {
        self.can_read |= readable;
        self.can_write |= writable;
    }

    /// Whether the peer has shut down the read half (EOF seen).
    pub fn is_in_closed(&self) -> bool {
        self.in_closed
    }

    /// Whether this side has finished writing everything and shut down.
    pub fn is_out_closed(&self) -> bool {
        self.out_closed
    }

    /// Pumps both directions as far as current readiness and queued data
    /// allow: reads into the stream's input queue, writes out of the
    /// stream's output queue. Returns `true` if either direction made
    /// progress, so the caller can decide whether to wake the stream
    /// graph.
    pub fn update(&mut self, arena: &mut StreamArena) -> io::Result<bool> {
        let mut progressed = false;

        if self.can_read && !self.in_closed {
            let has_credit = self
                .read_limit
                .as_ref()
                .map(|l| l.has_credit())
                .unwrap_or(true);
            if has_credit {
                let mut buf = [0u8; 64 * 1024];
                match self.socket.read(&mut buf) {
                    Ok(0) => {
                        self.in_closed = true;
                        progressed = true;
                    }
                    Ok(n) => {
                        if let Some(cq) = arena.out_queue_mut(self.handle) {
                            cq.append_buffer(buf[..n].to_vec());
                        }
                        if let Some(limit) = &self.read_limit {
                            limit.consume(n as u64);
                        }
                        progressed = true;
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        self.can_read = false;
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => return Err(e),
                }
            }
        }

        if self.can_write && !self.out_closed {
            let pending = arena
                .out_queue(self.handle)
                .map(|cq| !cq.is_empty())
                .unwrap_or(false);
            if pending {
                let mut stolen = arena
                    .out_queue_mut(self.handle)
                    .map(|cq| cq.steal_all())
                    .unwrap_or_default();
                let mut buf = vec![0u8; stolen.len() as usize];
                let n = stolen.read(&mut buf);
                match self.socket.write(&buf[..n]) {
                    Ok(written) => {
                        if written < n {
                            // push back whatever didn't make it out this round
                            if let Some(cq) = arena.out_queue_mut(self.handle) {
                                cq.append_buffer(buf[written..n].to_vec());
                            }
                        }
                        progressed = true;
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        self.can_write = false;
                        if let Some(cq) = arena.out_queue_mut(self.handle) {
                            cq.append_buffer(buf[..n].to_vec());
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                        if let Some(cq) = arena.out_queue_mut(self.handle) {
                            cq.append_buffer(buf[..n].to_vec());
                        }
                    }
                    Err(e) => return Err(e),
                }
            } else if arena
                .out_queue(self.handle)
                .map(|cq| cq.is_closed())
                .unwrap_or(false)
            {
                let _ = self.socket.flush();
                self.out_closed = true;
                progressed = true;
            }
        }

        Ok(progressed)
    }

    /// Deregisters the socket and returns it, for callers that want to
    /// reuse the underlying fd (e.g. returning it to
    /// [`crate::backend::Backend`]'s idle pool).
    pub fn detach(mut self, loop_: &EventLoop) -> io::Result<S> {
        loop_.deregister(&mut self.socket)?;
        Ok(self.socket)
    }

    /// Re-registers interest after a pause/resume cycle (e.g. after
    /// [`crate::chunkqueue::CqLimit`] frees up credit).
    pub fn reregister(&mut self, registry: &Registry) -> io::Result<()> {
        registry.reregister(&mut self.socket, self.token, Interest::READABLE | Interest::WRITABLE)
    }
}
