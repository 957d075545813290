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
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unused_imports
)]
// Disallow warnings in examples.
#![doc(test(attr(deny(warnings))))]

//! seine is a reusable TCP server framework built around an edge-triggered
//! event loop with a listener/worker reactor topology.
//!
//! A server is constructed from a bind address and a per-connection handler.
//! The framework drives readiness notification, connection lifecycle, buffer
//! management, reactor assignment, and inactivity timeouts; handlers only
//! read, frame, and reply.
//!
//! ## Examples
//!
//! Runnable consumers of the embedding contract live in the `demos` directory
//! of the source tree (an echo server and a newline-framed key-value store).

pub mod acceptor;
pub mod buffer;
pub mod cache;
pub mod connection;
pub mod logger;
pub mod looper;
pub mod net;
pub mod poller;
pub mod pool;
pub mod server;
pub mod timer;

pub use buffer::Buffer;
pub use cache::Cache;
pub use connection::{Connection, Handler};
pub use looper::Looper;
pub use net::address::NetAddress;
pub use server::{Server, ServerConfig, ServerError, ServerHandle};
