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

//! The collaborator interface for a compiled configuration subtree.
//!
//! The config language itself is out of scope; only the hook the dynamic
//! config cache needs — "enter this action on a request" — is specified
//! here. A real `Action` is refcounted configuration; `Arc` gives that for
//! free, so `action_enter`/`action_release` from the original collapse to
//! `Arc::clone`/`Drop`.

use crate::vrequest::VirtualRequest;

/// A compiled configuration subtree that can be entered on a request.
pub trait Action {
    /// Runs this action against `vr`. What "running" means is entirely up to
    /// the collaborator (routing, header rewriting, proxying to a backend,
    /// ...); the core only needs to be able to trigger it.
    fn enter(&self, vr: &mut dyn VirtualRequest);
}

/// An `Action` that does nothing — useful as a fallback/miss action in tests.
#[derive(Debug, Default)]
pub struct NullAction;

impl Action for NullAction {
    fn enter(&self, _vr: &mut dyn VirtualRequest) {}
}
