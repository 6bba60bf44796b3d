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

//! Echo server: every frame is written straight back to its sender.
//!
//! Try it with a 16-byte header whose first four bytes are the big-endian
//! total length, e.g. `printf '\x00\x00\x00\x14...' | nc 127.0.0.1 13265`.

use std::net::Ipv4Addr;
use std::sync::Arc;

use relay::{ConnHandle, Frame, FrameHandler, ServerConfig, TcpServer};

struct Echo;

impl FrameHandler for Echo {
    type Session = u64;

    fn on_frame(&self, frame: Frame, conn: &ConnHandle<u64>, session: Option<u64>) -> Option<u64> {
        println!(
            "{} byte frame from {}:{}",
            frame.len(),
            conn.peer_ip(),
            conn.peer_port()
        );
        conn.send(frame.payload()).ok()?;
        Some(session.map_or(1, |frames| frames + 1))
    }

    fn on_disconnect(&self, frames: u64) {
        println!("connection closed after {frames} frames");
    }
}

fn main() -> std::io::Result<()> {
    env_logger::init();

    let config = ServerConfig {
        bind_ip: Ipv4Addr::LOCALHOST,
        port: 13265,
        label: "echo".into(),
        workers: 4,
    };
    let server = TcpServer::start(config, Arc::new(Echo))?;
    println!("echo server listening on {}", server.local_addr());

    loop {
        std::thread::park();
    }
}
