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

//! The accept loop: owns the listening socket and hands every inbound
//! connection to an I/O worker, round-robin.

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;

use log::{debug, error, trace};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};

use crate::connection::Connection;
use crate::handler::FrameHandler;
use crate::socket;
use crate::worker::WorkerHandle;

const LISTEN_TOKEN: Token = Token(usize::MAX);
const STOP_TOKEN: Token = Token(usize::MAX - 1);

/// Accept loop state. Runs on its own thread; stopped by waking
/// [`STOP_TOKEN`] through the waker returned from [`Listener::new`].
pub(crate) struct Listener<H: FrameHandler> {
    inner: TcpListener,
    poll: Poll,
    label: String,
    workers: Vec<WorkerHandle<H::Session>>,
    accepted: usize,
}

impl<H: FrameHandler> Listener<H> {
    pub(crate) fn new(
        mut listener: TcpListener,
        label: String,
        workers: Vec<WorkerHandle<H::Session>>,
    ) -> std::io::Result<(Self, Arc<Waker>)> {
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTEN_TOKEN, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), STOP_TOKEN)?);

        Ok((
            Self {
                inner: listener,
                poll,
                label,
                workers,
                accepted: 0,
            },
            waker,
        ))
    }

    /// Accepts connections until the stop waker fires.
    pub(crate) fn run(&mut self) {
        let mut events = Events::with_capacity(16);

        loop {
            if let Err(e) = self.poll.poll(&mut events, None) {
                if e.kind() != ErrorKind::Interrupted {
                    error!("{} accept thread: poll failed: {}", self.label, e);
                }
                continue;
            }

            for event in events.iter() {
                match event.token() {
                    STOP_TOKEN => return,
                    LISTEN_TOKEN => self.accept(),
                    _ => {}
                }
            }
        }
    }

    /// Drains the accept queue. A transient accept failure is logged and
    /// the loop keeps going; only exhaustion of the queue returns.
    fn accept(&mut self) {
        loop {
            match self.inner.accept() {
                Ok((stream, addr)) => self.admit(stream, addr),
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => return,
                Err(e) => error!("{} accept failed: {}", self.label, e),
            }
        }
    }

    /// Assigns a fresh connection to the next worker and publishes it into
    /// that worker's connection set.
    fn admit(&mut self, stream: TcpStream, addr: SocketAddr) {
        let peer = match addr {
            SocketAddr::V4(peer) => peer,
            SocketAddr::V6(_) => {
                debug!("{} dropping non-IPv4 peer {}", self.label, addr);
                return;
            }
        };

        if let Err(e) = socket::set_keepalive(&stream) {
            debug!("{} keepalive on {} failed: {}", self.label, peer, e);
        }

        let id = self.accepted % self.workers.len();
        self.accepted = self.accepted.wrapping_add(1);
        let worker = &self.workers[id];

        let mut conns = worker.conns.lock().unwrap();
        let token = Token(conns.vacant_key());
        let conn = Arc::new(Connection::new(
            stream,
            token,
            id,
            peer,
            worker.ctl.clone(),
            worker.waker.clone(),
        ));

        // Register before publishing; a connection the worker can't poll
        // must never enter its set. Dropping the record closes the socket
        // and the upper layer never hears about the connection.
        if let Err(e) = conn.register(&worker.registry) {
            error!(
                "{} failed to register {} with io thread {}: {}",
                self.label, peer, id, e
            );
            return;
        }

        let key = conns.insert(conn);
        debug_assert_eq!(key, token.0);

        trace!(
            "{} io thread {}: new connection from {} ({} live)",
            self.label,
            id,
            peer,
            conns.len()
        );
    }
}
