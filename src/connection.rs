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

//! Per-connection state and the opaque handle given to the upper layer.

use std::fmt;
use std::io::{self, ErrorKind, Write};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::{Arc, Mutex};

use crossbeam_channel::Sender;
use mio::net::TcpStream;
use mio::{Interest, Registry, Token, Waker};

use crate::frame::{FrameRead, FrameReader};
use crate::handler::ConnKind;
use crate::worker::Ctl;

/// One live connection, owned by exactly one I/O thread.
///
/// The stream sits behind a mutex shared between the owning thread (reads)
/// and any thread calling [`ConnHandle::send`] (writes). Teardown takes the
/// stream out of its slot, so the descriptor closes exactly once no matter
/// how many handles to the record are still alive.
pub(crate) struct Connection<S> {
    token: Token,
    worker: usize,
    peer: SocketAddrV4,
    stream: Mutex<Option<TcpStream>>,
    reader: Mutex<FrameReader>,
    session: Mutex<Option<S>>,
    ctl: Sender<Ctl<S>>,
    waker: Arc<Waker>,
}

impl<S> Connection<S> {
    pub(crate) fn new(
        stream: TcpStream,
        token: Token,
        worker: usize,
        peer: SocketAddrV4,
        ctl: Sender<Ctl<S>>,
        waker: Arc<Waker>,
    ) -> Self {
        Self {
            token,
            worker,
            peer,
            stream: Mutex::new(Some(stream)),
            reader: Mutex::new(FrameReader::new()),
            session: Mutex::new(None),
            ctl,
            waker,
        }
    }

    pub(crate) fn token(&self) -> Token {
        self.token
    }

    pub(crate) fn peer(&self) -> SocketAddrV4 {
        self.peer
    }

    /// Registers the stream with the owning thread's readiness set.
    pub(crate) fn register(&self, registry: &Registry) -> io::Result<()> {
        match self.stream.lock().unwrap().as_mut() {
            Some(stream) => registry.register(stream, self.token, Interest::READABLE),
            None => Err(ErrorKind::NotConnected.into()),
        }
    }

    /// Advances the frame reader against the stream. Called only by the
    /// owning I/O thread.
    pub(crate) fn pull_frame(&self) -> io::Result<FrameRead> {
        let mut guard = self.stream.lock().unwrap();
        let stream = match guard.as_mut() {
            Some(stream) => stream,
            None => return Ok(FrameRead::Closed),
        };
        self.reader.lock().unwrap().read_frame(stream)
    }

    /// Removes the stream from the record; dropping the returned value
    /// closes the descriptor.
    pub(crate) fn take_stream(&self) -> Option<TcpStream> {
        self.stream.lock().unwrap().take()
    }

    pub(crate) fn take_session(&self) -> Option<S> {
        self.session.lock().unwrap().take()
    }

    pub(crate) fn store_session(&self, session: S) {
        *self.session.lock().unwrap() = Some(session);
    }
}

/// Opaque reference to a live connection, given to the upper layer so it
/// can write to and close the connection from any thread.
///
/// Handles are cheap to clone and never own the connection: the owning I/O
/// thread may tear the connection down at any point, after which
/// [`send`](ConnHandle::send) fails with [`ErrorKind::NotConnected`] and
/// [`close`](ConnHandle::close) is a no-op.
pub struct ConnHandle<S> {
    conn: Arc<Connection<S>>,
}

impl<S> ConnHandle<S> {
    pub(crate) fn new(conn: Arc<Connection<S>>) -> Self {
        Self { conn }
    }

    /// Peer IPv4 address.
    pub fn peer_ip(&self) -> Ipv4Addr {
        *self.conn.peer.ip()
    }

    /// Peer TCP port.
    pub fn peer_port(&self) -> u16 {
        self.conn.peer.port()
    }

    /// Transport this connection arrived on.
    pub fn kind(&self) -> ConnKind {
        ConnKind::Tcp
    }

    /// Writes a fully framed byte sequence to the connection.
    ///
    /// The transport makes no framing decisions here; the caller supplies
    /// the complete header + body. Returns the number of bytes written,
    /// which is short of `bytes.len()` when the kernel buffer fills up;
    /// retrying the remainder is the caller's policy. Concurrent senders
    /// are serialised only per call, not per message sequence.
    pub fn send(&self, bytes: &[u8]) -> io::Result<usize> {
        let mut guard = self.conn.stream.lock().unwrap();
        let stream = guard
            .as_mut()
            .ok_or_else(|| io::Error::from(ErrorKind::NotConnected))?;

        let mut written = 0;
        while written < bytes.len() {
            match stream.write(&bytes[written..]) {
                Ok(0) => return Err(ErrorKind::WriteZero.into()),
                Ok(n) => written += n,
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                    if written == 0 {
                        return Err(ErrorKind::WouldBlock.into());
                    }
                    break;
                }
                Err(ref e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }

        Ok(written)
    }

    /// Requests teardown of the connection.
    ///
    /// The request is routed to the owning I/O thread, so the actual close
    /// happens there; calling this twice, or racing it against the peer
    /// hanging up, is harmless. The terminal
    /// [`on_disconnect`](crate::FrameHandler::on_disconnect) fires iff a
    /// session was established.
    pub fn close(&self) {
        if self
            .conn
            .ctl
            .send(Ctl::Close(Arc::clone(&self.conn)))
            .is_ok()
        {
            let _ = self.conn.waker.wake();
        }
    }
}

impl<S> Clone for ConnHandle<S> {
    fn clone(&self) -> Self {
        Self {
            conn: Arc::clone(&self.conn),
        }
    }
}

impl<S> fmt::Debug for ConnHandle<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnHandle")
            .field("token", &self.conn.token)
            .field("worker", &self.conn.worker)
            .field("peer", &self.conn.peer)
            .finish()
    }
}
