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

#![deny(
    missing_debug_implementations,
    rust_2018_idioms,
    unused_imports,
)]

//! Core runtime primitives for a high-throughput reverse-proxy / application
//! gateway: a per-upstream backend connection pool and the stream graph that
//! carries request/response bodies between sockets, filters and handlers.
//!
//! This crate deliberately does not parse HTTP, speak TLS, or know anything
//! about configuration languages. It is the plumbing every handler, gateway
//! module and filter above it is built from.
//!
//! ## Layout
//!
//! Leaves first, mirroring the dependency order between components:
//!
//! - [`waitqueue`] — timer-ordered FIFO used by the dynamic config cache's
//!   max-TTL eviction.
//! - [`chunkqueue`] — byte-counted buffer queue with shared backpressure
//!   credit ([`chunkqueue::CqLimit`]).
//! - [`job`] — coalesced single-shot deferred work within a [`worker::Worker`],
//!   plus [`job::JobRef`] for posting wakeups across threads.
//! - [`stream`] — the stream graph: source/drain halves, refcounted
//!   connect/disconnect, the `Plug`/`Null` specializations.
//! - [`iostream`] — a stream bound to a non-blocking socket and a readiness
//!   watcher.
//! - [`backend`] — the per-upstream connection pool.
//! - [`dynconf`] — the dynamic configuration cache.
//! - [`worker`] and [`eventloop`] — the event loop a stream graph, backend
//!   pool and dynamic config cache all live on.

pub mod action;
pub mod backend;
pub mod chunkqueue;
pub mod dynconf;
pub mod eventloop;
pub mod iostream;
pub mod job;
pub mod sockaddr;
pub mod stream;
pub mod vrequest;
pub mod waitqueue;
pub mod worker;

pub use action::Action;
pub use sockaddr::SocketAddress;
pub use vrequest::VirtualRequest;
