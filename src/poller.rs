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

//! Readiness multiplexer shared by every reactor.
//!
//! Registrations are keyed by raw descriptor: the mio token for a descriptor
//! is the descriptor itself, so poll results identify connections without a
//! separate lookup table. mio registers edge-triggered on every platform;
//! level-triggered listener semantics are recovered by the acceptor draining
//! `accept` until would-block.

use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use bitflags::bitflags;
use mio::event::Event;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token};

/// Default maximum number of events returned by one poll.
pub const DEFAULT_EVENTS_LISTENED: usize = 1024;

bitflags! {
    /// Observed readiness of one descriptor, captured from the multiplexer
    /// and stored on the connection before its handler runs.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Ready: u8 {
        /// Bytes (or a pending accept) are available to read.
        const READABLE = 0b0001;
        /// The descriptor can be written without blocking.
        const WRITABLE = 0b0010;
        /// The descriptor is in an error state.
        const ERROR = 0b0100;
        /// The peer closed its write half.
        const READ_CLOSED = 0b1000;
    }
}

impl From<&Event> for Ready {
    fn from(event: &Event) -> Self {
        let mut ready = Ready::empty();
        if event.is_readable() {
            ready |= Ready::READABLE;
        }
        if event.is_writable() {
            ready |= Ready::WRITABLE;
        }
        if event.is_error() {
            ready |= Ready::ERROR;
        }
        if event.is_read_closed() {
            ready |= Ready::READ_CLOSED;
        }
        ready
    }
}

/// One instance per reactor: owns the OS readiness queue and the event
/// buffer the reactor polls into.
#[derive(Debug)]
pub struct Poller {
    poll: Poll,
    events: Events,
}

impl Poller {
    /// Creates a multiplexer with the default event capacity.
    pub fn new() -> io::Result<Self> {
        Self::with_capacity(DEFAULT_EVENTS_LISTENED)
    }

    /// Creates a multiplexer returning at most `capacity` events per poll.
    pub fn with_capacity(capacity: usize) -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(capacity),
        })
    }

    /// Clones a registration handle usable from any thread while this
    /// poller blocks in [`Poller::poll`].
    pub fn registry(&self) -> io::Result<Registry> {
        self.poll.registry().try_clone()
    }

    /// Blocks up to `timeout` (`None` = indefinitely) and returns every
    /// ready descriptor with its observed event mask.
    pub fn poll(&mut self, timeout: Option<Duration>) -> io::Result<Vec<(RawFd, Ready)>> {
        self.poll.poll(&mut self.events, timeout)?;
        Ok(self
            .events
            .iter()
            .map(|event| (event.token().0 as RawFd, Ready::from(event)))
            .collect())
    }
}

/// Adds `fd` to the multiplexer behind `registry`. A descriptor is
/// registered at most once per multiplexer.
pub fn register(registry: &Registry, fd: RawFd, interest: Interest) -> io::Result<()> {
    registry.register(&mut SourceFd(&fd), Token(fd as usize), interest)
}

/// Removes `fd` from the multiplexer behind `registry`.
pub fn deregister(registry: &Registry, fd: RawFd) -> io::Result<()> {
    registry.deregister(&mut SourceFd(&fd))
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::os::fd::AsRawFd;

    use super::*;

    #[test]
    fn ready_mask_maps_event_flags() {
        assert_eq!(Ready::default(), Ready::empty());
        let mask = Ready::READABLE | Ready::READ_CLOSED;
        assert!(mask.contains(Ready::READABLE));
        assert!(!mask.contains(Ready::WRITABLE));
    }

    #[test]
    fn polls_a_readable_descriptor() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        let addr = listener.local_addr().unwrap();
        let fd = listener.as_raw_fd();

        let mut poller = Poller::new().unwrap();
        let registry = poller.registry().unwrap();
        register(&registry, fd, Interest::READABLE).unwrap();

        let mut client = std::net::TcpStream::connect(addr).unwrap();
        client.write_all(b"x").unwrap();

        let ready = poller.poll(Some(Duration::from_secs(2))).unwrap();
        assert!(ready
            .iter()
            .any(|&(ready_fd, mask)| ready_fd == fd && mask.contains(Ready::READABLE)));

        deregister(&registry, fd).unwrap();
    }
}
