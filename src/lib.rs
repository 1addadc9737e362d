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

//! A non-blocking HTTP/1.1 connection and dispatch core, built around a
//! single-threaded [`mio`] event loop.
//!
//! [`server::Server`] owns the poll loop: it accepts connections, negotiates
//! TLS handshakes, drives each connection's [`driver::Driver`] as bytes
//! arrive, and hands complete requests to [`pipeline::dispatch`], which
//! routes them through a [`vhost::VirtualHostRegistry`] and each host's
//! [`filter::Filter`] chain before reaching its [`vhost::Application`].
//!
//! Admission control ([`admission`]), keep-alive expiry ([`keepalive`]), and
//! graceful shutdown are the server's own bookkeeping; [`export`] is the one
//! escape hatch, handing a live socket to a caller that wants to upgrade the
//! connection to something this crate doesn't speak (e.g. WebSockets).

pub mod admission;
pub mod clock;
pub mod connection;
pub mod driver;
pub mod error;
pub mod export;
pub mod filter;
pub mod keepalive;
pub mod listener;
pub mod monitor;
pub mod net;
pub mod options;
pub mod parser;
pub mod pipeline;
pub mod response;
pub mod server;
pub mod tls;
pub mod vhost;

pub use error::{CoreError, CoreResult};
pub use options::Options;
pub use server::{Observer, Server, ServerState};
