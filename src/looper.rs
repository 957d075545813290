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

//! The reactor: one thread polling one multiplexer, owning a connection
//! table keyed by descriptor and an optional timer wheel for idle eviction.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use mio::{Interest, Registry};

use crate::connection::Connection;
use crate::poller::{self, Poller, Ready};
use crate::timer::{TimerHandle, TimerWheel};

/// Default multiplexer wait per loop iteration, in milliseconds.
pub const DEFAULT_POLL_TIMEOUT_MS: u64 = 3000;

struct LooperState {
    connections: HashMap<RawFd, Box<Connection>>,
    timer_handles: HashMap<RawFd, TimerHandle>,
}

fn lock_error() -> io::Error {
    io::Error::new(io::ErrorKind::Other, "could not take a lock on mutex")
}

/// A single-threaded event loop: polls its multiplexer and dispatches
/// handlers for every ready connection, one looper per thread.
///
/// Other threads interact with a looper only through `add_connection`,
/// `delete_connection`, `refresh_connection`, and `set_exit`; everything a
/// handler touches runs on the owning thread.
pub struct Looper {
    weak: Weak<Looper>,
    registry: Registry,
    poller: Mutex<Poller>,
    state: Mutex<LooperState>,
    acceptor: Mutex<Option<Box<Connection>>>,
    timer: Option<Arc<TimerWheel>>,
    poll_timeout: Duration,
    inactivity_timeout_ms: u64,
    exit: AtomicBool,
}

impl Looper {
    /// Creates a looper with the default poll timeout and no idle eviction.
    pub fn new() -> io::Result<Arc<Self>> {
        Self::with_config(DEFAULT_POLL_TIMEOUT_MS, 0)
    }

    /// Creates a looper. A positive `inactivity_timeout_ms` attaches a timer
    /// wheel whose synthetic connection is registered in this looper's
    /// multiplexer; every connection then gets a single-shot eviction timer.
    pub fn with_config(poll_timeout_ms: u64, inactivity_timeout_ms: u64) -> io::Result<Arc<Self>> {
        let poller = Poller::new()?;
        let registry = poller.registry()?;
        let timer = if inactivity_timeout_ms > 0 {
            let wheel = TimerWheel::new()?;
            poller::register(&registry, wheel.fd(), Interest::READABLE)?;
            Some(wheel)
        } else {
            None
        };
        Ok(Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            registry,
            poller: Mutex::new(poller),
            state: Mutex::new(LooperState {
                connections: HashMap::new(),
                timer_handles: HashMap::new(),
            }),
            acceptor: Mutex::new(None),
            timer,
            poll_timeout: Duration::from_millis(poll_timeout_ms),
            inactivity_timeout_ms,
            exit: AtomicBool::new(false),
        }))
    }

    /// Polls and dispatches until the exit flag is set, then drops every
    /// descriptor this looper owns. Runs on the calling thread.
    pub fn run(&self) {
        let Ok(mut poller) = self.poller.lock() else {
            log::error!("reactor: could not take a lock on mutex");
            return;
        };
        while !self.exit.load(Ordering::Acquire) {
            let ready = match poller.poll(Some(self.poll_timeout)) {
                Ok(ready) => ready,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    log::error!("poll failed: {err}");
                    break;
                }
            };
            for (fd, ready_mask) in ready {
                self.dispatch(fd, ready_mask);
            }
        }
        drop(poller);
        self.drain();
    }

    /// Registers the listening connection with the multiplexer. The acceptor
    /// connection never enters the connection table.
    pub fn add_acceptor(&self, conn: Box<Connection>) -> io::Result<()> {
        let mut slot = self.acceptor.lock().map_err(|_| lock_error())?;
        poller::register(&self.registry, conn.fd(), conn.interest())?;
        *slot = Some(conn);
        Ok(())
    }

    /// Takes ownership of a connection: registers it, inserts it into the
    /// table, and, when idle eviction is enabled, installs its single-shot
    /// eviction timer. Callable from any thread; the listener reactor uses
    /// this to hand accepted clients to a worker.
    pub fn add_connection(&self, conn: Box<Connection>) -> io::Result<()> {
        let fd = conn.fd();
        let mut state = self.state.lock().map_err(|_| lock_error())?;
        poller::register(&self.registry, fd, conn.interest())?;
        state.connections.insert(fd, conn);
        if let Some(timer) = &self.timer {
            match self.install_eviction_timer(timer, fd) {
                Ok(handle) => {
                    state.timer_handles.insert(fd, handle);
                }
                Err(err) => {
                    state.connections.remove(&fd);
                    let _ = poller::deregister(&self.registry, fd);
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// Replaces `fd`'s eviction timer with a fresh one expiring the full
    /// inactivity window from now. No-op when eviction is disabled or the
    /// descriptor has no pending timer. Runs automatically before each user
    /// handler invocation.
    pub fn refresh_connection(&self, fd: RawFd) {
        let Some(timer) = &self.timer else {
            return;
        };
        let Ok(mut state) = self.state.lock() else {
            log::error!("reactor: could not take a lock on mutex");
            return;
        };
        let Some(old) = state.timer_handles.remove(&fd) else {
            return;
        };
        timer.remove(old);
        match self.install_eviction_timer(timer, fd) {
            Ok(handle) => {
                state.timer_handles.insert(fd, handle);
            }
            Err(err) => log::warn!("failed to refresh timer for fd={fd}: {err}"),
        }
    }

    /// Removes a connection from the table, unregisters its descriptor, and
    /// cancels its eviction timer. The socket closes when the connection
    /// drops. Returns false when `fd` is not in the table.
    pub fn delete_connection(&self, fd: RawFd) -> bool {
        let (conn, handle) = {
            let Ok(mut state) = self.state.lock() else {
                log::error!("reactor: could not take a lock on mutex");
                return false;
            };
            let Some(conn) = state.connections.remove(&fd) else {
                return false;
            };
            (conn, state.timer_handles.remove(&fd))
        };
        self.unregister(fd, handle);
        drop(conn);
        true
    }

    /// Flags the loop to exit after the current poll returns.
    pub fn set_exit(&self) {
        self.exit.store(true, Ordering::Release);
    }

    /// Number of connections currently owned by this looper.
    pub fn connection_count(&self) -> usize {
        self.state.lock().map_or(0, |state| state.connections.len())
    }

    /// Number of pending eviction timers.
    pub fn timer_count(&self) -> usize {
        self.state
            .lock()
            .map_or(0, |state| state.timer_handles.len())
    }

    fn dispatch(&self, fd: RawFd, ready: Ready) {
        if let Some(timer) = &self.timer {
            if timer.fd() == fd {
                if let Some(mut conn) = timer.take_connection() {
                    conn.set_ready(ready);
                    if let Some(handler) = conn.handler() {
                        handler(&mut conn);
                    }
                    timer.restore_connection(conn);
                }
                return;
            }
        }

        if let Some(mut conn) = self.take_acceptor(fd) {
            conn.set_ready(ready);
            if let Some(handler) = conn.handler() {
                handler(&mut conn);
            }
            if let Ok(mut slot) = self.acceptor.lock() {
                *slot = Some(conn);
            } else {
                log::error!("reactor: could not take a lock on mutex");
            }
            return;
        }

        // check the connection out of the table so the handler runs without
        // the state mutex held
        let mut conn = {
            let Ok(mut state) = self.state.lock() else {
                log::error!("reactor: could not take a lock on mutex");
                return;
            };
            match state.connections.remove(&fd) {
                Some(conn) => conn,
                None => return,
            }
        };
        conn.set_ready(ready);
        if let Some(handler) = conn.handler() {
            handler(&mut conn);
        }
        if conn.close_requested() {
            let handle = self
                .state
                .lock()
                .ok()
                .and_then(|mut state| state.timer_handles.remove(&fd));
            self.unregister(fd, handle);
        } else if let Ok(mut state) = self.state.lock() {
            state.connections.insert(fd, conn);
        } else {
            log::error!("reactor: could not take a lock on mutex");
        }
    }

    fn take_acceptor(&self, fd: RawFd) -> Option<Box<Connection>> {
        let mut slot = self.acceptor.lock().ok()?;
        if slot.as_ref().is_some_and(|conn| conn.fd() == fd) {
            slot.take()
        } else {
            None
        }
    }

    fn install_eviction_timer(&self, timer: &TimerWheel, fd: RawFd) -> io::Result<TimerHandle> {
        let looper = self.weak.clone();
        timer.add(self.inactivity_timeout_ms, move || {
            if let Some(looper) = looper.upgrade() {
                log::info!("client fd={fd} has expired and will be kicked out");
                looper.delete_connection(fd);
            }
        })
    }

    fn unregister(&self, fd: RawFd, handle: Option<TimerHandle>) {
        if let Err(err) = poller::deregister(&self.registry, fd) {
            log::warn!("deregister failed for fd={fd}: {err}");
        }
        if let (Some(timer), Some(handle)) = (&self.timer, handle) {
            timer.remove(handle);
        }
    }

    fn drain(&self) {
        if let Ok(mut slot) = self.acceptor.lock() {
            slot.take();
        }
        let fds: Vec<RawFd> = match self.state.lock() {
            Ok(state) => state.connections.keys().copied().collect(),
            Err(_) => {
                log::error!("reactor: could not take a lock on mutex");
                return;
            }
        };
        for fd in fds {
            self.delete_connection(fd);
        }
    }
}

impl fmt::Debug for Looper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Looper")
            .field("connections", &self.connection_count())
            .field("poll_timeout", &self.poll_timeout)
            .field("inactivity_timeout_ms", &self.inactivity_timeout_ms)
            .field("exit", &self.exit.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}
