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

//! Server lifecycle: configuration, startup, shutdown.

use std::fmt;
use std::io::{self, ErrorKind};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::trace;
use mio::net::TcpListener;
use mio::Waker;

use crate::handler::FrameHandler;
use crate::listener::Listener;
use crate::worker::{Ctl, Worker, WorkerHandle};

/// Startup configuration for a [`TcpServer`]. None of it is mutable after
/// [`TcpServer::start`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// IPv4 address to bind.
    pub bind_ip: Ipv4Addr,
    /// Port to bind; 0 asks the kernel for an ephemeral port, readable back
    /// through [`TcpServer::local_addr`].
    pub port: u16,
    /// Short name used to prefix every log line of this server.
    pub label: String,
    /// Number of I/O worker threads. Fixed for the server's lifetime; must
    /// be at least 1.
    pub workers: usize,
}

/// The server side of the framed transport: one accept thread feeding a
/// fixed pool of I/O worker threads.
///
/// Messages arriving on any connection are delivered to the
/// [`FrameHandler`] supplied at startup; the handler's returned session
/// value ties later messages on the same connection to upper-layer state.
pub struct TcpServer<H: FrameHandler> {
    label: String,
    local_addr: SocketAddr,
    workers: Vec<WorkerHandle<H::Session>>,
    worker_threads: Vec<JoinHandle<()>>,
    acceptor: Option<JoinHandle<()>>,
    stop: Arc<Waker>,
    stopped: bool,
}

impl<H: FrameHandler> TcpServer<H> {
    /// Binds the listening socket, spawns the worker pool and the accept
    /// thread, and returns the running server.
    ///
    /// On any failure everything already created is undone: started threads
    /// are signalled and joined, descriptors are closed, and the error is
    /// returned to the caller.
    pub fn start(config: ServerConfig, handler: Arc<H>) -> io::Result<Self> {
        if config.workers == 0 {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                "at least one io thread is required",
            ));
        }

        let addr = SocketAddr::V4(SocketAddrV4::new(config.bind_ip, config.port));
        let listener = TcpListener::bind(addr)?;
        let local_addr = listener.local_addr()?;

        // Build every runtime before spawning any thread, so failures up to
        // this point unwind by plain drops.
        let mut runtimes = Vec::with_capacity(config.workers);
        let mut workers = Vec::with_capacity(config.workers);
        for id in 0..config.workers {
            let (worker, handle) = Worker::new(id, config.label.clone(), Arc::clone(&handler))?;
            runtimes.push(worker);
            workers.push(handle);
        }

        let mut admission = Vec::with_capacity(config.workers);
        for handle in &workers {
            admission.push(handle.try_clone()?);
        }
        let (mut accept_loop, stop) =
            Listener::<H>::new(listener, config.label.clone(), admission)?;

        let mut worker_threads = Vec::with_capacity(config.workers);
        for mut worker in runtimes {
            let name = format!("{}-io-{}", config.label, worker_threads.len());
            match thread::Builder::new().name(name).spawn(move || worker.run()) {
                Ok(join) => worker_threads.push(join),
                Err(e) => {
                    Self::halt_workers(&workers, &mut worker_threads);
                    return Err(e);
                }
            }
        }

        let acceptor = match thread::Builder::new()
            .name(format!("{}-accept", config.label))
            .spawn(move || accept_loop.run())
        {
            Ok(join) => join,
            Err(e) => {
                Self::halt_workers(&workers, &mut worker_threads);
                return Err(e);
            }
        };

        trace!(
            "{} server ready on {} with {} io threads",
            config.label,
            local_addr,
            config.workers
        );

        Ok(Self {
            label: config.label,
            local_addr,
            workers,
            worker_threads,
            acceptor: Some(acceptor),
            stop,
            stopped: false,
        })
    }

    /// Address the server is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of live connections across all workers.
    pub fn connections(&self) -> usize {
        self.workers.iter().map(WorkerHandle::connections).sum()
    }

    /// Live connection count per worker, indexed by worker id.
    pub fn worker_loads(&self) -> Vec<usize> {
        self.workers.iter().map(WorkerHandle::connections).collect()
    }

    /// Stops the server: the accept thread first, then every worker.
    ///
    /// Each worker tears down all connections it still owns before its
    /// thread exits, so every terminal callback has fired and every
    /// descriptor is closed by the time this returns.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;

        let _ = self.stop.wake();
        if let Some(join) = self.acceptor.take() {
            let _ = join.join();
        }

        for handle in &self.workers {
            let _ = handle.ctl.send(Ctl::Shutdown);
            let _ = handle.waker.wake();
        }
        for join in self.worker_threads.drain(..) {
            let _ = join.join();
        }

        trace!("{} server stopped", self.label);
    }

    fn halt_workers(handles: &[WorkerHandle<H::Session>], threads: &mut Vec<JoinHandle<()>>) {
        for handle in handles {
            let _ = handle.ctl.send(Ctl::Shutdown);
            let _ = handle.waker.wake();
        }
        for join in threads.drain(..) {
            let _ = join.join();
        }
    }
}

impl<H: FrameHandler> Drop for TcpServer<H> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<H: FrameHandler> fmt::Debug for TcpServer<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpServer")
            .field("label", &self.label)
            .field("local_addr", &self.local_addr)
            .field("workers", &self.workers.len())
            .field("stopped", &self.stopped)
            .finish()
    }
}
