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

//! Contract between the transport and the upper RPC layer.

use crate::connection::ConnHandle;
use crate::frame::Frame;

/// Transport that delivered a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConnKind {
    /// Stream-oriented TCP connection.
    Tcp,
}

/// Upper-layer message processor, shared by every I/O thread of a server.
///
/// One value implementing this trait is supplied to
/// [`TcpServer::start`](crate::TcpServer::start) inside an `Arc`; the same
/// `&self` is passed into every callback, so process-wide state (dispatch
/// tables, auth caches) lives on the implementor itself.
///
/// Callbacks run synchronously on the I/O thread that owns the connection.
/// Long-running work belongs on the upper layer's own executor, otherwise
/// every other connection sharing the thread stalls behind it.
pub trait FrameHandler: Send + Sync + 'static {
    /// Per-connection state. Established by the first [`on_frame`] return
    /// value and handed back on every later callback for the same
    /// connection.
    ///
    /// [`on_frame`]: FrameHandler::on_frame
    type Session: Send + 'static;

    /// Called once per message, in wire order for any given connection.
    ///
    /// `session` is whatever the previous `on_frame` on this connection
    /// returned (`None` on the first message). Return the session to store;
    /// returning `None` asks the transport to drop the connection. In that
    /// case no [`on_disconnect`] follows, since this call already consumed
    /// the session.
    ///
    /// [`on_disconnect`]: FrameHandler::on_disconnect
    fn on_frame(
        &self,
        frame: Frame,
        conn: &ConnHandle<Self::Session>,
        session: Option<Self::Session>,
    ) -> Option<Self::Session>;

    /// Terminal event for a connection that had established a session:
    /// delivered exactly once, after the socket is closed, with the stored
    /// session moved back out so its state can be released.
    ///
    /// Connections that never established a session (or whose last
    /// `on_frame` returned `None`) go away silently.
    fn on_disconnect(&self, session: Self::Session) {
        drop(session);
    }
}
