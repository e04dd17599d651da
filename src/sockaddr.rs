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

//! Upstream socket address, duplicated and rendered the way a backend logs it.

use std::fmt;
use std::net::SocketAddr;

/// Target address of one [`crate::backend::Backend`]. Thin enough that
/// `Clone` is the "duplicate" operation spec collaborators expect, and
/// `Display` is the "render to string" one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketAddress(SocketAddr);

impl SocketAddress {
    /// Wraps a standard socket address.
    pub fn new(addr: SocketAddr) -> Self {
        SocketAddress(addr)
    }

    /// The wrapped address family/len/sockaddr is just `std::net::SocketAddr`
    /// on this platform; expose it for `connect()`/`socket()` calls.
    pub fn inner(&self) -> SocketAddr {
        self.0
    }
}

impl fmt::Display for SocketAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<SocketAddr> for SocketAddress {
    fn from(addr: SocketAddr) -> Self {
        SocketAddress(addr)
    }
}
