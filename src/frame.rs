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

//! Wire framing: the fixed message header, the delivery buffer handed to the
//! upper layer, and the incremental reader that assembles frames from a
//! nonblocking stream.

use std::io::{self, ErrorKind, Read};
use std::mem;

/// Size of the fixed wire header in bytes. The first four bytes carry the
/// total message length as a big-endian `u32`; the remaining bytes belong to
/// the upper RPC layer and are carried verbatim.
pub const HEADER_LEN: usize = 16;

/// Bytes reserved in front of every delivered frame so the upper layer can
/// stamp routing metadata without reallocating or copying the message.
pub const RESERVE_LEN: usize = 8;

/// Upper bound accepted for the declared message length. A header declaring
/// more than this is treated as a framing error and the connection is
/// dropped rather than allocating whatever the peer asked for.
pub const MAX_MSG_LEN: usize = 16 * 1024 * 1024;

/// A fully assembled message as delivered to the upper layer.
///
/// The backing buffer is laid out as `[reserve][header][body]`, contiguous,
/// so [`Frame::payload`] (header + body) can be written back out or handed
/// onward without a copy.
#[derive(Debug)]
pub struct Frame {
    buf: Vec<u8>,
}

impl Frame {
    /// Allocates a frame for `msg_len` total message bytes and copies the
    /// already-read header into place. `msg_len` has been validated by
    /// [`decode_msg_len`].
    pub(crate) fn new(header: [u8; HEADER_LEN], msg_len: usize) -> Self {
        let mut buf = vec![0u8; RESERVE_LEN + msg_len];
        buf[RESERVE_LEN..RESERVE_LEN + HEADER_LEN].copy_from_slice(&header);
        Self { buf }
    }

    /// Total message length: header plus body.
    pub fn len(&self) -> usize {
        self.buf.len() - RESERVE_LEN
    }

    /// Always false; a frame carries at least its header.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The full message as read off the wire: header followed by body.
    pub fn payload(&self) -> &[u8] {
        &self.buf[RESERVE_LEN..]
    }

    /// The verbatim wire header.
    pub fn header(&self) -> &[u8] {
        &self.buf[RESERVE_LEN..RESERVE_LEN + HEADER_LEN]
    }

    /// The message body (everything after the header).
    pub fn body(&self) -> &[u8] {
        &self.buf[RESERVE_LEN + HEADER_LEN..]
    }

    /// The reserved prelude in front of the message, writable by the upper
    /// layer.
    pub fn reserve_mut(&mut self) -> &mut [u8] {
        &mut self.buf[..RESERVE_LEN]
    }

    /// Consumes the frame, returning the backing buffer
    /// (`[reserve][header][body]`).
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    fn body_mut(&mut self) -> &mut [u8] {
        &mut self.buf[RESERVE_LEN + HEADER_LEN..]
    }
}

/// Decodes and bounds-checks the total message length from a wire header.
fn decode_msg_len(header: &[u8; HEADER_LEN]) -> io::Result<usize> {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&header[..4]);
    let msg_len = u32::from_be_bytes(raw) as usize;

    if msg_len < HEADER_LEN || msg_len > MAX_MSG_LEN {
        return Err(io::Error::new(
            ErrorKind::InvalidData,
            format!("declared message length {msg_len} outside {HEADER_LEN}..={MAX_MSG_LEN}"),
        ));
    }

    Ok(msg_len)
}

/// Outcome of pumping a [`FrameReader`].
#[derive(Debug)]
pub enum FrameRead {
    /// A full message was assembled.
    Complete(Frame),
    /// The stream has no more bytes for now; call again on the next
    /// readiness event. Partial progress is kept.
    Blocked,
    /// The peer closed the stream on a message boundary.
    Closed,
}

#[derive(Debug)]
enum State {
    Header { buf: [u8; HEADER_LEN], filled: usize },
    Body { frame: Frame, filled: usize },
}

/// Incremental frame assembler for one connection.
///
/// Messages are strictly sequential on the stream: one header, one body,
/// repeat, with no separator. The reader tolerates arbitrarily fragmented
/// input and reports end-of-stream inside a message as an error, since a
/// truncated frame can never be delivered.
#[derive(Debug)]
pub struct FrameReader {
    state: State,
}

impl FrameReader {
    /// Creates a reader positioned at a message boundary.
    pub fn new() -> Self {
        Self {
            state: State::Header {
                buf: [0; HEADER_LEN],
                filled: 0,
            },
        }
    }

    /// Pulls bytes from `reader` until a frame completes, the stream would
    /// block, or the stream ends.
    ///
    /// Returns `Err` for read failures, for a declared length out of bounds,
    /// and for end-of-stream in the middle of a message.
    pub fn read_frame(&mut self, reader: &mut impl Read) -> io::Result<FrameRead> {
        loop {
            match &mut self.state {
                State::Header { buf, filled } => {
                    while *filled < HEADER_LEN {
                        match reader.read(&mut buf[*filled..]) {
                            Ok(0) => {
                                return if *filled == 0 {
                                    Ok(FrameRead::Closed)
                                } else {
                                    Err(io::Error::new(
                                        ErrorKind::UnexpectedEof,
                                        "stream closed inside a frame header",
                                    ))
                                };
                            }
                            Ok(n) => *filled += n,
                            Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                                return Ok(FrameRead::Blocked)
                            }
                            Err(ref e) if e.kind() == ErrorKind::Interrupted => {}
                            Err(e) => return Err(e),
                        }
                    }

                    let msg_len = decode_msg_len(buf)?;
                    let frame = Frame::new(*buf, msg_len);
                    self.state = State::Body { frame, filled: 0 };
                }

                State::Body { frame, filled } => {
                    let body = frame.body_mut();
                    while *filled < body.len() {
                        match reader.read(&mut body[*filled..]) {
                            Ok(0) => {
                                return Err(io::Error::new(
                                    ErrorKind::UnexpectedEof,
                                    "stream closed inside a frame body",
                                ));
                            }
                            Ok(n) => *filled += n,
                            Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                                return Ok(FrameRead::Blocked)
                            }
                            Err(ref e) if e.kind() == ErrorKind::Interrupted => {}
                            Err(e) => return Err(e),
                        }
                    }

                    let state = mem::replace(
                        &mut self.state,
                        State::Header {
                            buf: [0; HEADER_LEN],
                            filled: 0,
                        },
                    );
                    match state {
                        State::Body { frame, .. } => return Ok(FrameRead::Complete(frame)),
                        State::Header { .. } => unreachable!(),
                    }
                }
            }
        }
    }
}

impl Default for FrameReader {
    fn default() -> Self {
        Self::new()
    }
}
