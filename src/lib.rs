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

//! relay is the server side of a framed TCP message transport: a
//! multi-threaded acceptor and reader for length-prefixed RPC messages.
//!
//! One accept thread distributes inbound connections round-robin across a
//! fixed pool of I/O threads. Each I/O thread runs its own readiness loop,
//! assembles length-prefixed frames off its sockets, and hands every
//! complete message to a [`FrameHandler`] supplied at startup. The
//! handler's return value becomes the connection's session, threaded back
//! into later callbacks on the same connection, and surrendered through a
//! terminal callback when the connection goes away.
//!
//! ```no_run
//! use std::net::Ipv4Addr;
//! use std::sync::Arc;
//!
//! use relay::{ConnHandle, Frame, FrameHandler, ServerConfig, TcpServer};
//!
//! struct Echo;
//!
//! impl FrameHandler for Echo {
//!     type Session = u64;
//!
//!     fn on_frame(
//!         &self,
//!         frame: Frame,
//!         conn: &ConnHandle<u64>,
//!         session: Option<u64>,
//!     ) -> Option<u64> {
//!         conn.send(frame.payload()).ok()?;
//!         Some(session.map_or(1, |frames| frames + 1))
//!     }
//! }
//!
//! fn main() -> std::io::Result<()> {
//!     let config = ServerConfig {
//!         bind_ip: Ipv4Addr::LOCALHOST,
//!         port: 7000,
//!         label: "echo".into(),
//!         workers: 4,
//!     };
//!     let server = TcpServer::start(config, Arc::new(Echo))?;
//!     println!("listening on {}", server.local_addr());
//!     std::thread::park();
//!     server.stop();
//!     Ok(())
//! }
//! ```

mod connection;
mod frame;
mod handler;
mod listener;
mod server;
mod socket;
mod worker;

pub use connection::ConnHandle;
pub use frame::{Frame, FrameRead, FrameReader, HEADER_LEN, MAX_MSG_LEN, RESERVE_LEN};
pub use handler::{ConnKind, FrameHandler};
pub use server::{ServerConfig, TcpServer};
