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

//! I/O worker threads. Each worker owns a readiness set and the set of
//! connections assigned to it, drains frames off ready sockets, and runs
//! connection teardown.

use std::io::{self, ErrorKind};
use std::sync::{Arc, Mutex};

use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};
use log::{debug, error, trace};
use mio::event::Event;
use mio::{Events, Poll, Registry, Token, Waker};
use slab::Slab;

use crate::connection::{ConnHandle, Connection};
use crate::frame::FrameRead;
use crate::handler::FrameHandler;

/// Reserved token for the worker's waker; slab keys grow from zero and
/// never reach it.
const WAKE_TOKEN: Token = Token(usize::MAX - 1);

/// Upper bound on readiness events taken per wakeup.
const MAX_EVENTS: usize = 10;

/// Control messages posted to a worker from other threads.
pub(crate) enum Ctl<S> {
    /// Tear down this connection if the worker still owns it.
    Close(Arc<Connection<S>>),
    /// Tear down everything and exit the thread.
    Shutdown,
}

/// Shared registry of a worker's live connections, keyed by token.
pub(crate) type ConnSlab<S> = Arc<Mutex<Slab<Arc<Connection<S>>>>>;

/// Admission and control surface for one worker, held by the acceptor and
/// the server. The kernel makes registration against a polling worker's
/// readiness set safe, so admission never has to synchronise with the
/// worker beyond the slab mutex.
pub(crate) struct WorkerHandle<S> {
    pub(crate) id: usize,
    pub(crate) registry: Registry,
    pub(crate) conns: ConnSlab<S>,
    pub(crate) ctl: Sender<Ctl<S>>,
    pub(crate) waker: Arc<Waker>,
}

impl<S> WorkerHandle<S> {
    pub(crate) fn try_clone(&self) -> io::Result<Self> {
        Ok(Self {
            id: self.id,
            registry: self.registry.try_clone()?,
            conns: Arc::clone(&self.conns),
            ctl: self.ctl.clone(),
            waker: Arc::clone(&self.waker),
        })
    }

    pub(crate) fn connections(&self) -> usize {
        self.conns.lock().unwrap().len()
    }
}

/// One I/O thread: readiness loop, frame pump, teardown.
pub(crate) struct Worker<H: FrameHandler> {
    id: usize,
    label: String,
    poll: Poll,
    conns: ConnSlab<H::Session>,
    ctl: Receiver<Ctl<H::Session>>,
    handler: Arc<H>,
}

impl<H: FrameHandler> Worker<H> {
    /// Builds a worker runtime and its control handle. No thread is spawned
    /// here, so a failure leaves nothing to unwind.
    pub(crate) fn new(
        id: usize,
        label: String,
        handler: Arc<H>,
    ) -> io::Result<(Self, WorkerHandle<H::Session>)> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
        let (tx, rx) = unbounded();
        let conns: ConnSlab<H::Session> = Arc::new(Mutex::new(Slab::new()));

        let worker = Self {
            id,
            label,
            poll,
            conns: Arc::clone(&conns),
            ctl: rx,
            handler,
        };
        let handle = WorkerHandle {
            id,
            registry,
            conns,
            ctl: tx,
            waker,
        };

        Ok((worker, handle))
    }

    /// Main loop of the worker; blocks until shutdown is requested.
    pub(crate) fn run(&mut self) {
        let mut events = Events::with_capacity(MAX_EVENTS);

        loop {
            if let Err(e) = self.poll.poll(&mut events, None) {
                if e.kind() != ErrorKind::Interrupted {
                    error!("{} io thread {}: poll failed: {}", self.label, self.id, e);
                }
                continue;
            }

            for event in events.iter() {
                if event.token() == WAKE_TOKEN {
                    if self.drain_ctl() {
                        return;
                    }
                    continue;
                }
                self.conn_event(event);
            }
        }
    }

    /// Processes queued control messages. Returns true when the worker
    /// should exit.
    fn drain_ctl(&mut self) -> bool {
        loop {
            match self.ctl.try_recv() {
                Ok(Ctl::Close(conn)) => self.teardown(&conn),
                Ok(Ctl::Shutdown) | Err(TryRecvError::Disconnected) => {
                    self.teardown_all();
                    return true;
                }
                Err(TryRecvError::Empty) => return false,
            }
        }
    }

    fn conn_event(&mut self, event: &Event) {
        // Sporadic events for tokens we no longer own happen; ignore them.
        let conn = match self.conns.lock().unwrap().get(event.token().0) {
            Some(conn) => Arc::clone(conn),
            None => return,
        };

        if event.is_readable() {
            self.pump(&conn);
            return;
        }

        if event.is_error() || event.is_read_closed() || event.is_write_closed() {
            trace!(
                "{} io thread {}: error or hangup on {}",
                self.label,
                self.id,
                conn.peer()
            );
            self.teardown(&conn);
        }
    }

    /// Drains every complete frame currently available on the connection
    /// and delivers it upward. Readiness is edge-style, so this reads until
    /// the stream would block.
    fn pump(&mut self, conn: &Arc<Connection<H::Session>>) {
        loop {
            match conn.pull_frame() {
                Ok(FrameRead::Complete(frame)) => {
                    trace!(
                        "{} io thread {}: {} byte message from {}",
                        self.label,
                        self.id,
                        frame.len(),
                        conn.peer()
                    );

                    let handle = ConnHandle::new(Arc::clone(conn));
                    let session = conn.take_session();
                    match self.handler.on_frame(frame, &handle, session) {
                        Some(session) => conn.store_session(session),
                        None => {
                            self.teardown(conn);
                            return;
                        }
                    }
                }
                Ok(FrameRead::Blocked) => return,
                Ok(FrameRead::Closed) => {
                    trace!(
                        "{} io thread {}: {} closed the connection",
                        self.label,
                        self.id,
                        conn.peer()
                    );
                    self.teardown(conn);
                    return;
                }
                Err(e) => {
                    error!(
                        "{} io thread {}: read error on {}: {}",
                        self.label,
                        self.id,
                        conn.peer(),
                        e
                    );
                    self.teardown(conn);
                    return;
                }
            }
        }
    }

    /// Tears down one connection: unlink, deregister, close, then the
    /// terminal callback iff a session was established.
    ///
    /// Only the record currently in the slab under its token is acted on;
    /// a stale request (double close, or a token already reused by a newer
    /// connection) is a no-op.
    fn teardown(&mut self, conn: &Arc<Connection<H::Session>>) {
        let token = conn.token();
        {
            let mut conns = self.conns.lock().unwrap();
            let owned = matches!(conns.get(token.0), Some(live) if Arc::ptr_eq(live, conn));
            if !owned {
                drop(conns);
                trace!(
                    "{} io thread {}: stale close request for {}",
                    self.label,
                    self.id,
                    conn.peer()
                );
                return;
            }
            conns.remove(token.0);
        }

        if let Some(mut stream) = conn.take_stream() {
            if let Err(e) = self.poll.registry().deregister(&mut stream) {
                debug!(
                    "{} io thread {}: deregister of {} failed: {}",
                    self.label,
                    self.id,
                    conn.peer(),
                    e
                );
            }
        }

        if let Some(session) = conn.take_session() {
            self.handler.on_disconnect(session);
        }

        trace!(
            "{} io thread {}: dropped {} ({} live)",
            self.label,
            self.id,
            conn.peer(),
            self.conns.lock().unwrap().len()
        );
    }

    fn teardown_all(&mut self) {
        let conns: Vec<_> = {
            let guard = self.conns.lock().unwrap();
            guard.iter().map(|(_, conn)| Arc::clone(conn)).collect()
        };
        for conn in conns {
            self.teardown(&conn);
        }
    }
}
