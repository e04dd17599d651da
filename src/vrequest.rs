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

//! The collaborator interface for an in-flight request.
//!
//! Request/response bodies, header parsing, routing — all out of scope
//! (that's the HTTP layer this crate doesn't implement). What the core
//! needs from a virtual request is narrower: a way to get a thread-safe
//! handle that can re-post this request's job once it's parked.

use crate::job::JobRef;

/// An in-flight request traversing the action graph and the stream graph.
pub trait VirtualRequest {
    /// Returns a `Send + Sync` handle that, when fired, posts a coalesced
    /// wakeup back onto this request's owning worker.
    fn job_ref(&self) -> JobRef;

    /// Monotonic seconds on this request's owning worker's event loop.
    /// Matches spec's `CUR_TS(vr->wrk)`.
    fn now(&self) -> f64;
}
