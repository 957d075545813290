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

//! The embedding surface: wire a bind address and handlers, then run.

use std::fmt;
use std::io;
use std::sync::Arc;

use crate::acceptor::Acceptor;
use crate::cache::{Cache, DEFAULT_CACHE_CAPACITY};
use crate::connection::{Connection, Handler};
use crate::logger::{self, LogSink};
use crate::looper::{Looper, DEFAULT_POLL_TIMEOUT_MS};
use crate::net::address::NetAddress;
use crate::net::socket::Socket;
use crate::pool::ThreadPool;

/// Tunables for a [`Server`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the listener binds to.
    pub bind_address: NetAddress,
    /// Number of worker reactors. Values below 2 are clamped up; 0 is a
    /// configuration error.
    pub worker_count: usize,
    /// Per-connection inactivity window in milliseconds; 0 disables idle
    /// eviction.
    pub inactivity_timeout_ms: u64,
    /// Byte budget of the shared content cache.
    pub cache_capacity_bytes: usize,
    /// Multiplexer wait per loop iteration, in milliseconds.
    pub poll_timeout_ms: u64,
    /// Where framework log records are written.
    pub logger_sink: LogSink,
}

impl ServerConfig {
    /// Defaults: hardware-concurrency-derived worker count, idle eviction
    /// off, 10 MiB cache, 3000 ms poll timeout, stdout logging.
    pub fn new(bind_address: NetAddress) -> Self {
        Self {
            bind_address,
            worker_count: ThreadPool::default_size(),
            inactivity_timeout_ms: 0,
            cache_capacity_bytes: DEFAULT_CACHE_CAPACITY,
            poll_timeout_ms: DEFAULT_POLL_TIMEOUT_MS,
            logger_sink: LogSink::Stdout,
        }
    }
}

/// Errors surfaced while configuring or starting a server. Fatal conditions
/// are limited to startup; per-connection failures never reach here.
#[derive(Debug)]
pub enum ServerError {
    /// Required configuration is missing or inconsistent.
    Configuration(&'static str),
    /// The OS refused a startup step (bind, listen, timer descriptor).
    Io(io::Error),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuration(msg) => write!(f, "configuration error: {msg}"),
            Self::Io(err) => write!(f, "initialization failed: {err}"),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Configuration(_) => None,
            Self::Io(err) => Some(err),
        }
    }
}

impl From<io::Error> for ServerError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

/// Stops every reactor of a running server from any thread.
#[derive(Debug, Clone)]
pub struct ServerHandle {
    loopers: Vec<Arc<Looper>>,
}

impl ServerHandle {
    /// Flags every reactor to exit; each loop stops after its current poll
    /// returns and in-flight handlers finish first.
    pub fn shutdown(&self) {
        for looper in &self.loopers {
            looper.set_exit();
        }
    }
}

/// A framework server: one listener reactor accepting clients and a pool of
/// worker reactors running the embedder's handler.
///
/// The listening socket is bound at construction, so bind and listen
/// failures surface before [`Server::begin`] and an ephemeral bind port can
/// be read back through [`Server::local_addr`].
pub struct Server {
    config: ServerConfig,
    cache: Arc<Cache>,
    listener: Arc<Looper>,
    workers: Vec<Arc<Looper>>,
    pool: ThreadPool,
    listen_socket: Socket,
    bound_addr: NetAddress,
    on_accept: Option<Handler>,
    on_handle: Option<Handler>,
}

impl Server {
    /// Creates a server with default configuration.
    pub fn new(bind_address: NetAddress) -> Result<Self, ServerError> {
        Self::with_config(ServerConfig::new(bind_address))
    }

    /// Creates a server from an explicit configuration, binding the
    /// listening socket and building every reactor.
    pub fn with_config(config: ServerConfig) -> Result<Self, ServerError> {
        if config.worker_count == 0 {
            return Err(ServerError::Configuration("worker_count must be positive"));
        }
        let worker_count = config.worker_count.max(2);

        let listen_socket = Socket::bind_listener(&config.bind_address)?;
        let bound_addr = listen_socket.local_addr()?;

        let listener = Looper::with_config(config.poll_timeout_ms, 0)?;
        let workers = (0..worker_count)
            .map(|_| Looper::with_config(config.poll_timeout_ms, config.inactivity_timeout_ms))
            .collect::<io::Result<Vec<_>>>()?;
        let pool = ThreadPool::new(worker_count);
        let cache = Arc::new(Cache::with_capacity(config.cache_capacity_bytes));

        Ok(Self {
            config,
            cache,
            listener,
            workers,
            pool,
            listen_socket,
            bound_addr,
            on_accept: None,
            on_handle: None,
        })
    }

    /// Optional callback run on the listener reactor after each base accept,
    /// with the listener connection.
    pub fn on_accept(mut self, on_accept: impl Fn(&mut Connection) + Send + Sync + 'static) -> Self {
        self.on_accept = Some(Arc::new(on_accept));
        self
    }

    /// Mandatory callback run on a worker reactor for every readiness event
    /// on a client connection. [`Server::begin`] fails without it.
    pub fn on_handle(mut self, on_handle: impl Fn(&mut Connection) + Send + Sync + 'static) -> Self {
        self.on_handle = Some(Arc::new(on_handle));
        self
    }

    /// The shared content cache, for handlers to capture.
    pub fn shared_cache(&self) -> Arc<Cache> {
        Arc::clone(&self.cache)
    }

    /// The address the listener actually bound (resolves an ephemeral port).
    pub fn local_addr(&self) -> NetAddress {
        self.bound_addr
    }

    /// The worker reactors, in dispatch order.
    pub fn workers(&self) -> &[Arc<Looper>] {
        &self.workers
    }

    /// A handle that can stop this server from another thread.
    pub fn shutdown_handle(&self) -> ServerHandle {
        let mut loopers = vec![Arc::clone(&self.listener)];
        loopers.extend(self.workers.iter().cloned());
        ServerHandle { loopers }
    }

    /// Starts the worker loops and blocks in the listener loop until
    /// shutdown. On the way out, workers are stopped and joined and the
    /// logger flushed.
    pub fn begin(self) -> Result<(), ServerError> {
        let Server {
            config,
            cache: _,
            listener,
            workers,
            pool,
            listen_socket,
            bound_addr,
            on_accept,
            on_handle,
        } = self;
        let Some(on_handle) = on_handle else {
            return Err(ServerError::Configuration(
                "on_handle must be set before begin",
            ));
        };

        let _logger = logger::init(config.logger_sink.clone())?;

        let _acceptor = Acceptor::new(&listener, workers.clone(), listen_socket, on_accept, on_handle)?;

        for worker in &workers {
            let worker = Arc::clone(worker);
            pool.execute(move || worker.run());
        }

        log::info!("server listening on {bound_addr}");
        listener.run();

        for worker in &workers {
            worker.set_exit();
        }
        drop(pool);
        log::info!("server on {bound_addr} shut down");
        Ok(())
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("bound_addr", &self.bound_addr)
            .field("workers", &self.workers.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
