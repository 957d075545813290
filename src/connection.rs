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

//! A TCP connection bound to one reactor, with its buffer pair and handler.

use std::fmt;
use std::io::{self, ErrorKind};
use std::os::fd::RawFd;
use std::sync::Arc;

use mio::Interest;

use crate::buffer::Buffer;
use crate::net::socket::Socket;
use crate::poller::Ready;

const SCRATCH_BUF_SIZE: usize = 2048;

/// Callback a reactor runs once per readiness event on a connection.
///
/// The reactor hands the connection out by mutable reference; a handler that
/// wants the connection gone calls [`Connection::request_close`] and returns.
pub type Handler = Arc<dyn Fn(&mut Connection) + Send + Sync>;

/// One endpoint registered with a reactor: an owned socket, a read and a
/// write buffer, the desired-event and last-ready-event masks, and the
/// handler closure.
///
/// Client connections are created by the acceptor; the listener connection
/// carries only a callback and never touches its buffers. A connection is
/// mutated exclusively by its owning reactor thread.
pub struct Connection {
    socket: Socket,
    read_buffer: Buffer,
    write_buffer: Buffer,
    interest: Interest,
    ready: Ready,
    handler: Option<Handler>,
    close_requested: bool,
}

impl Connection {
    /// Wraps a socket with empty buffers and read interest.
    pub fn new(socket: Socket) -> Self {
        Self {
            socket,
            read_buffer: Buffer::new(),
            write_buffer: Buffer::new(),
            interest: Interest::READABLE,
            ready: Ready::empty(),
            handler: None,
            close_requested: false,
        }
    }

    /// The descriptor backing this connection.
    pub fn fd(&self) -> RawFd {
        self.socket.fd()
    }

    /// The owned socket.
    pub fn socket(&self) -> &Socket {
        &self.socket
    }

    /// Events this connection wants the multiplexer to watch.
    pub fn interest(&self) -> Interest {
        self.interest
    }

    /// Replaces the desired-event mask. Read by the reactor at registration.
    pub fn set_interest(&mut self, interest: Interest) {
        self.interest = interest;
    }

    /// Events the multiplexer last observed on this connection.
    pub fn ready(&self) -> Ready {
        self.ready
    }

    /// Records the observed-event mask. Called by the reactor before the
    /// handler runs.
    pub fn set_ready(&mut self, ready: Ready) {
        self.ready = ready;
    }

    /// Stores the callback run on each readiness event.
    pub fn set_handler(&mut self, handler: Handler) {
        self.handler = Some(handler);
    }

    /// The stored callback, if any.
    pub fn handler(&self) -> Option<Handler> {
        self.handler.clone()
    }

    /// Asks the owning reactor to tear this connection down once the current
    /// handler returns.
    pub fn request_close(&mut self) {
        self.close_requested = true;
    }

    /// Whether teardown has been requested.
    pub fn close_requested(&self) -> bool {
        self.close_requested
    }

    /// Drains the socket into the read buffer until would-block or EOF.
    ///
    /// Returns `(bytes_read, closed)`. Readers are registered edge-triggered,
    /// so a partial drain would silently stall the connection: the loop only
    /// stops on would-block (`closed = false`), EOF (`closed = true`), or a
    /// hard error (`closed = true`, logged). Interrupts are retried.
    pub fn recv(&mut self) -> (usize, bool) {
        let mut total = 0;
        let mut scratch = [0u8; SCRATCH_BUF_SIZE];
        loop {
            match self.socket.read(&mut scratch) {
                Ok(0) => {
                    log::info!("client exited: fd={}", self.fd());
                    return (total, true);
                }
                Ok(n) => {
                    total += n;
                    self.read_buffer.append(&scratch[..n]);
                }
                Err(ref err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    log::warn!("recv failed on fd={}: {err}", self.fd());
                    return (total, true);
                }
            }
        }
        (total, false)
    }

    /// Robustly writes the whole write buffer to the socket, retrying on
    /// interrupt and would-block. A hard error clears the buffer and is
    /// returned; the caller is expected to close the connection. The write
    /// buffer is cleared in every outcome.
    pub fn send(&mut self) -> io::Result<usize> {
        let mut sent = 0;
        let result = loop {
            let pending = &self.write_buffer.view()[sent..];
            if pending.is_empty() {
                break Ok(sent);
            }
            match self.socket.write(pending) {
                Ok(n) => sent += n,
                Err(ref err)
                    if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) =>
                {
                    continue
                }
                Err(err) => {
                    log::warn!("send failed on fd={}: {err}", self.fd());
                    break Err(err);
                }
            }
        };
        self.write_buffer.clear();
        result
    }

    /// Appends bytes to the read buffer.
    pub fn write_to_read_buffer(&mut self, data: impl AsRef<[u8]>) {
        self.read_buffer.append(data);
    }

    /// Appends bytes to the write buffer, to be flushed by [`Connection::send`].
    pub fn write_to_write_buffer(&mut self, data: impl AsRef<[u8]>) {
        self.write_buffer.append(data);
    }

    /// Pops one delimiter-bounded frame off the read buffer.
    pub fn find_and_pop_until(&mut self, delim: &[u8]) -> Option<Vec<u8>> {
        self.read_buffer.find_and_pop_until(delim)
    }

    /// Borrows the read buffer contents.
    pub fn read_buffer(&self) -> &[u8] {
        self.read_buffer.view()
    }

    /// The read buffer rendered as a string, lossily.
    pub fn read_as_string(&self) -> String {
        String::from_utf8_lossy(self.read_buffer.view()).into_owned()
    }

    /// Bytes currently queued in the read buffer.
    pub fn read_buffer_len(&self) -> usize {
        self.read_buffer.len()
    }

    /// Bytes currently queued in the write buffer.
    pub fn write_buffer_len(&self) -> usize {
        self.write_buffer.len()
    }

    /// Empties the read buffer.
    pub fn clear_read_buffer(&mut self) {
        self.read_buffer.clear();
    }

    /// Empties the write buffer.
    pub fn clear_write_buffer(&mut self) {
        self.write_buffer.clear();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("fd", &self.fd())
            .field("interest", &self.interest)
            .field("ready", &self.ready)
            .field("read_buffered", &self.read_buffer.len())
            .field("write_buffered", &self.write_buffer.len())
            .field("close_requested", &self.close_requested)
            .finish_non_exhaustive()
    }
}
