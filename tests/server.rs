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

//! End-to-end tests driving a running server with plain blocking sockets
//! as synthetic peers.

use std::io::{ErrorKind, Read, Write};
use std::net::{Ipv4Addr, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};

use relay::{ConnHandle, ConnKind, Frame, FrameHandler, ServerConfig, TcpServer, HEADER_LEN};

/// What the handler observed, in arrival order.
#[derive(Debug)]
enum Cb {
    Frame {
        body: Vec<u8>,
        payload_len: usize,
        session: Option<u64>,
    },
    Closed {
        session: u64,
    },
}

#[derive(Clone, Copy)]
enum Mode {
    Accept,
    RejectFirst,
    RejectSecond,
}

/// Test handler: reports every callback on a channel and assigns each
/// connection a distinct session id starting at 1.
struct Recorder {
    tx: Sender<Cb>,
    handles: Mutex<Vec<ConnHandle<u64>>>,
    mode: Mode,
    next_session: AtomicU64,
}

impl FrameHandler for Recorder {
    type Session = u64;

    fn on_frame(
        &self,
        frame: Frame,
        conn: &ConnHandle<u64>,
        session: Option<u64>,
    ) -> Option<u64> {
        if session.is_none() {
            self.handles.lock().unwrap().push(conn.clone());
        }
        let _ = self.tx.send(Cb::Frame {
            body: frame.body().to_vec(),
            payload_len: frame.payload().len(),
            session,
        });

        match self.mode {
            Mode::RejectFirst => None,
            Mode::RejectSecond if session.is_some() => None,
            _ => Some(
                session.unwrap_or_else(|| self.next_session.fetch_add(1, Ordering::SeqCst) + 1),
            ),
        }
    }

    fn on_disconnect(&self, session: u64) {
        let _ = self.tx.send(Cb::Closed { session });
    }
}

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn start_server(workers: usize, mode: Mode) -> (TcpServer<Recorder>, Receiver<Cb>, Arc<Recorder>) {
    init_logging();
    let (tx, rx) = unbounded();
    let handler = Arc::new(Recorder {
        tx,
        handles: Mutex::new(Vec::new()),
        mode,
        next_session: AtomicU64::new(0),
    });
    let config = ServerConfig {
        bind_ip: Ipv4Addr::LOCALHOST,
        port: 0,
        label: "test".into(),
        workers,
    };
    let server = TcpServer::start(config, Arc::clone(&handler)).expect("server should start");
    (server, rx, handler)
}

fn wire_frame(body: &[u8]) -> Vec<u8> {
    let total = HEADER_LEN + body.len();
    let mut buf = vec![0u8; total];
    buf[..4].copy_from_slice(&(total as u32).to_be_bytes());
    buf[HEADER_LEN..].copy_from_slice(body);
    buf
}

fn recv(rx: &Receiver<Cb>) -> Cb {
    rx.recv_timeout(Duration::from_secs(5))
        .expect("handler callback should arrive")
}

fn assert_silent(rx: &Receiver<Cb>) {
    if let Ok(cb) = rx.recv_timeout(Duration::from_millis(300)) {
        panic!("expected no callback, got {cb:?}");
    }
}

fn await_connections(server: &TcpServer<Recorder>, expected: usize) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if server.connections() == expected {
            return;
        }
        if Instant::now() > deadline {
            panic!(
                "expected {expected} connections, still have {}",
                server.connections()
            );
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

fn expect_eof(client: &mut TcpStream) {
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let mut buf = [0u8; 1];
    assert_eq!(0, client.read(&mut buf).expect("peer should see a close"));
}

#[test]
fn delivers_single_frame_and_terminal_close() {
    let (server, rx, _) = start_server(1, Mode::Accept);

    let mut client = TcpStream::connect(server.local_addr()).unwrap();
    client.write_all(&wire_frame(b"ping")).unwrap();

    match recv(&rx) {
        Cb::Frame {
            body,
            payload_len,
            session,
        } => {
            assert_eq!(b"ping".to_vec(), body);
            assert_eq!(HEADER_LEN + 4, payload_len);
            assert_eq!(None, session);
        }
        other => panic!("expected a frame callback, got {other:?}"),
    }

    drop(client);
    match recv(&rx) {
        Cb::Closed { session } => assert_eq!(1, session),
        other => panic!("expected the terminal callback, got {other:?}"),
    }
    await_connections(&server, 0);
    server.stop();
}

#[test]
fn delivers_frames_in_wire_order_with_session() {
    let (server, rx, _) = start_server(1, Mode::Accept);

    let mut client = TcpStream::connect(server.local_addr()).unwrap();
    let mut bytes = wire_frame(b"A");
    bytes.extend_from_slice(&wire_frame(b"BB"));
    client.write_all(&bytes).unwrap();

    match recv(&rx) {
        Cb::Frame { body, session, .. } => {
            assert_eq!(b"A".to_vec(), body);
            assert_eq!(None, session);
        }
        other => panic!("expected the first frame, got {other:?}"),
    }
    match recv(&rx) {
        Cb::Frame { body, session, .. } => {
            assert_eq!(b"BB".to_vec(), body);
            assert_eq!(Some(1), session);
        }
        other => panic!("expected the second frame, got {other:?}"),
    }

    drop(client);
    match recv(&rx) {
        Cb::Closed { session } => assert_eq!(1, session),
        other => panic!("expected the terminal callback, got {other:?}"),
    }
    server.stop();
}

#[test]
fn short_header_never_reaches_handler() {
    let (server, rx, _) = start_server(1, Mode::Accept);

    let mut client = TcpStream::connect(server.local_addr()).unwrap();
    await_connections(&server, 1);
    client.write_all(&vec![0u8; HEADER_LEN / 2]).unwrap();
    drop(client);

    await_connections(&server, 0);
    assert_silent(&rx);
    server.stop();
}

#[test]
fn truncated_body_never_reaches_handler() {
    let (server, rx, _) = start_server(1, Mode::Accept);

    let mut client = TcpStream::connect(server.local_addr()).unwrap();
    await_connections(&server, 1);

    // header promises 100 body bytes, only 10 arrive
    let mut bytes = vec![0u8; HEADER_LEN + 10];
    bytes[..4].copy_from_slice(&((HEADER_LEN + 100) as u32).to_be_bytes());
    client.write_all(&bytes).unwrap();
    drop(client);

    await_connections(&server, 0);
    assert_silent(&rx);
    server.stop();
}

#[test]
fn rejected_first_frame_closes_without_terminal() {
    let (server, rx, _) = start_server(1, Mode::RejectFirst);

    let mut client = TcpStream::connect(server.local_addr()).unwrap();
    client.write_all(&wire_frame(b"denied")).unwrap();

    match recv(&rx) {
        Cb::Frame { session, .. } => assert_eq!(None, session),
        other => panic!("expected the frame callback, got {other:?}"),
    }

    await_connections(&server, 0);
    assert_silent(&rx);
    expect_eof(&mut client);
    server.stop();
}

#[test]
fn rejected_later_frame_consumes_the_session() {
    let (server, rx, _) = start_server(1, Mode::RejectSecond);

    let mut client = TcpStream::connect(server.local_addr()).unwrap();
    client.write_all(&wire_frame(b"first")).unwrap();
    client.write_all(&wire_frame(b"second")).unwrap();

    match recv(&rx) {
        Cb::Frame { session, .. } => assert_eq!(None, session),
        other => panic!("expected the first frame, got {other:?}"),
    }
    match recv(&rx) {
        Cb::Frame { session, .. } => assert_eq!(Some(1), session),
        other => panic!("expected the second frame, got {other:?}"),
    }

    // the handler took the session and returned None, so nothing is left
    // for a terminal callback to deliver
    await_connections(&server, 0);
    assert_silent(&rx);
    expect_eof(&mut client);
    server.stop();
}

#[test]
fn distributes_connections_round_robin() {
    let (server, _rx, _) = start_server(3, Mode::Accept);

    let clients: Vec<TcpStream> = (0..6)
        .map(|_| TcpStream::connect(server.local_addr()).unwrap())
        .collect();
    await_connections(&server, 6);

    assert_eq!(vec![2, 2, 2], server.worker_loads());

    drop(clients);
    server.stop();
}

#[test]
fn stop_tears_down_every_connection() {
    let (server, rx, _) = start_server(2, Mode::Accept);

    let mut clients: Vec<TcpStream> = (0..4)
        .map(|_| TcpStream::connect(server.local_addr()).unwrap())
        .collect();
    for client in &mut clients {
        client.write_all(&wire_frame(b"hello")).unwrap();
    }
    for _ in 0..4 {
        match recv(&rx) {
            Cb::Frame { .. } => {}
            other => panic!("expected a frame callback, got {other:?}"),
        }
    }

    server.stop();

    // every established session is surrendered before stop returns
    let mut sessions: Vec<u64> = (0..4)
        .map(|_| match rx.try_recv().expect("terminal callback missing") {
            Cb::Closed { session } => session,
            other => panic!("expected a terminal callback, got {other:?}"),
        })
        .collect();
    sessions.sort_unstable();
    assert_eq!(vec![1, 2, 3, 4], sessions);

    for client in &mut clients {
        expect_eof(client);
    }
}

#[test]
fn close_handle_is_idempotent() {
    let (server, rx, handler) = start_server(1, Mode::Accept);

    let mut client = TcpStream::connect(server.local_addr()).unwrap();
    client.write_all(&wire_frame(b"hi")).unwrap();
    match recv(&rx) {
        Cb::Frame { .. } => {}
        other => panic!("expected the frame callback, got {other:?}"),
    }

    let handle = handler.handles.lock().unwrap()[0].clone();
    assert_eq!(ConnKind::Tcp, handle.kind());
    handle.close();
    handle.close();

    match recv(&rx) {
        Cb::Closed { session } => assert_eq!(1, session),
        other => panic!("expected the terminal callback, got {other:?}"),
    }
    assert_silent(&rx);
    await_connections(&server, 0);
    expect_eof(&mut client);
    server.stop();
}

#[test]
fn send_works_until_the_connection_is_torn_down() {
    let (server, rx, handler) = start_server(1, Mode::Accept);

    let mut client = TcpStream::connect(server.local_addr()).unwrap();
    client.write_all(&wire_frame(b"hi")).unwrap();
    match recv(&rx) {
        Cb::Frame { .. } => {}
        other => panic!("expected the frame callback, got {other:?}"),
    }

    let handle = handler.handles.lock().unwrap()[0].clone();
    assert_eq!(5, handle.send(b"hello").unwrap());
    let mut buf = [0u8; 5];
    client.read_exact(&mut buf).unwrap();
    assert_eq!(b"hello", &buf);

    handle.close();
    match recv(&rx) {
        Cb::Closed { session } => assert_eq!(1, session),
        other => panic!("expected the terminal callback, got {other:?}"),
    }
    await_connections(&server, 0);
    assert_eq!(
        ErrorKind::NotConnected,
        handle.send(b"late").unwrap_err().kind()
    );
    server.stop();
}

#[test]
fn start_rejects_zero_workers() {
    init_logging();
    let (tx, _rx) = unbounded();
    let handler = Arc::new(Recorder {
        tx,
        handles: Mutex::new(Vec::new()),
        mode: Mode::Accept,
        next_session: AtomicU64::new(0),
    });
    let config = ServerConfig {
        bind_ip: Ipv4Addr::LOCALHOST,
        port: 0,
        label: "test".into(),
        workers: 0,
    };
    let err = TcpServer::start(config, handler).unwrap_err();
    assert_eq!(ErrorKind::InvalidInput, err.kind());
}

#[test]
fn start_surfaces_bind_failures() {
    init_logging();
    let (tx, _rx) = unbounded();
    let handler = Arc::new(Recorder {
        tx,
        handles: Mutex::new(Vec::new()),
        mode: Mode::Accept,
        next_session: AtomicU64::new(0),
    });
    // TEST-NET-1 is never assigned to a local interface
    let config = ServerConfig {
        bind_ip: Ipv4Addr::new(192, 0, 2, 1),
        port: 0,
        label: "test".into(),
        workers: 1,
    };
    assert!(TcpServer::start(config, handler).is_err());
}
