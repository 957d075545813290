//! Endpoint sockets owning exactly one descriptor each.

use std::fmt;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::sync::Arc;

use mio::net::{TcpListener, TcpStream};
use nix::sys::timerfd::TimerFd;
use socket2::{Domain, Protocol as RawProtocol, Socket as RawSocket, Type};

use super::address::{NetAddress, Protocol};

const LISTEN_BACKLOG: i32 = 128;

/// A connected, listening, or timer endpoint. Each descriptor is closed
/// exactly once: TCP endpoints are owned by exactly one `Socket`, and the
/// timer descriptor closes when its last owner drops.
pub enum Socket {
    /// A listening TCP endpoint.
    Listener(TcpListener),
    /// A connected TCP endpoint, non-blocking.
    Stream(TcpStream),
    /// A kernel timer descriptor, readable when the timer fires. Shared
    /// with the timer wheel that arms it.
    Timer(Arc<TimerFd>),
}

impl Socket {
    /// Creates a non-blocking listening socket bound to `addr` with
    /// `SO_REUSEADDR | SO_REUSEPORT` set. Failures carry the OS errno and are
    /// fatal at startup.
    pub fn bind_listener(addr: &NetAddress) -> io::Result<Self> {
        let domain = match addr.protocol() {
            Protocol::Ipv4 => Domain::IPV4,
            Protocol::Ipv6 => Domain::IPV6,
        };
        let raw = RawSocket::new(domain, Type::STREAM, Some(RawProtocol::TCP))?;
        raw.set_reuse_address(true)?;
        raw.set_reuse_port(true)?;
        raw.bind(&addr.socket_addr().into())?;
        raw.listen(LISTEN_BACKLOG)?;
        raw.set_nonblocking(true)?;
        Ok(Self::Listener(TcpListener::from_std(raw.into())))
    }

    /// Connects to a remote listener and switches the stream non-blocking.
    pub fn connect(addr: &NetAddress) -> io::Result<Self> {
        let stream = std::net::TcpStream::connect(addr.socket_addr())?;
        stream.set_nonblocking(true)?;
        Ok(Self::Stream(TcpStream::from_std(stream)))
    }

    /// Accepts one pending client. The returned stream is already
    /// non-blocking.
    pub fn accept(&self) -> io::Result<(Socket, NetAddress)> {
        match self {
            Self::Listener(listener) => {
                let (stream, peer) = listener.accept()?;
                Ok((Self::Stream(stream), NetAddress::from(peer)))
            }
            _ => Err(not_supported("accept on a non-listening socket")),
        }
    }

    /// The raw descriptor backing this endpoint.
    pub fn fd(&self) -> RawFd {
        match self {
            Self::Listener(listener) => listener.as_raw_fd(),
            Self::Stream(stream) => stream.as_raw_fd(),
            Self::Timer(timer) => timer.as_fd().as_raw_fd(),
        }
    }

    /// The locally bound address.
    pub fn local_addr(&self) -> io::Result<NetAddress> {
        match self {
            Self::Listener(listener) => listener.local_addr().map(NetAddress::from),
            Self::Stream(stream) => stream.local_addr().map(NetAddress::from),
            Self::Timer(_) => Err(not_supported("timer descriptors have no address")),
        }
    }

    /// The remote peer's address.
    pub fn peer_addr(&self) -> io::Result<NetAddress> {
        match self {
            Self::Stream(stream) => stream.peer_addr().map(NetAddress::from),
            _ => Err(not_supported("peer_addr on a non-connected socket")),
        }
    }

    pub(crate) fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Stream(stream) => stream.read(buf),
            _ => Err(not_supported("read on a non-connected socket")),
        }
    }

    pub(crate) fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Stream(stream) => stream.write(buf),
            _ => Err(not_supported("write on a non-connected socket")),
        }
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            Self::Listener(_) => "listener",
            Self::Stream(_) => "stream",
            Self::Timer(_) => "timer",
        };
        f.debug_struct("Socket")
            .field("kind", &kind)
            .field("fd", &self.fd())
            .finish()
    }
}

fn not_supported(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, msg)
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[test]
    fn binds_on_ephemeral_port() {
        let addr: NetAddress = "127.0.0.1:0".parse().unwrap();
        let listener = Socket::bind_listener(&addr).unwrap();
        let bound = listener.local_addr().unwrap();
        assert_ne!(bound.port(), 0);
    }

    #[test]
    fn accepts_a_client() {
        let addr: NetAddress = "127.0.0.1:0".parse().unwrap();
        let listener = Socket::bind_listener(&addr).unwrap();
        let bound = listener.local_addr().unwrap();

        let client = thread::spawn(move || {
            let mut stream = std::net::TcpStream::connect(bound.socket_addr()).unwrap();
            stream.write_all(b"hi").unwrap();
        });

        // non-blocking accept: retry until the connect lands
        let accepted = loop {
            match listener.accept() {
                Ok((socket, _)) => break socket,
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(10));
                }
                Err(err) => panic!("accept failed: {err}"),
            }
        };
        assert!(matches!(accepted, Socket::Stream(_)));
        client.join().unwrap();
    }

    #[test]
    fn accept_on_stream_is_rejected() {
        let addr: NetAddress = "127.0.0.1:0".parse().unwrap();
        let listener = Socket::bind_listener(&addr).unwrap();
        let bound = listener.local_addr().unwrap();
        let stream = Socket::connect(&bound).unwrap();
        assert_eq!(
            stream.accept().unwrap_err().kind(),
            io::ErrorKind::InvalidInput
        );
    }
}
