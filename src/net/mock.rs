//! In-memory [`TcpStream`]/[`TcpListener`] pair for unit tests.
//!
//! Lets the connection, admission, and lifecycle state machines be exercised
//! without a real socket: `MockStream::read`/`write` operate against plain
//! `Vec<u8>` buffers, and [`mio::event::Source`] is implemented as a no-op
//! since these tests call the core's methods directly rather than driving a
//! real `mio::Poll`.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::sync::{Arc, Mutex};

use mio::event::Source;
use mio::{Interest, Registry, Token};

use super::tcp_listener::TcpListener;
use super::tcp_stream::TcpStream;

#[derive(Debug, Default)]
struct Shared {
    inbound: Vec<u8>,
    outbound: Vec<u8>,
    shutdown_read: bool,
    shutdown_write: bool,
}

/// A mock socket. Cloning shares the same underlying buffers (as the two
/// ends of a real `TcpStream` would each see the same pipe), so tests can
/// hold one handle to feed bytes in and another to read bytes written back.
#[derive(Debug, Clone)]
pub struct MockStream {
    shared: Arc<Mutex<Shared>>,
    peer: SocketAddr,
    local: SocketAddr,
}

impl MockStream {
    pub fn new(peer: SocketAddr, local: SocketAddr) -> Self {
        MockStream {
            shared: Arc::new(Mutex::new(Shared::default())),
            peer,
            local,
        }
    }

    /// Queues bytes as if the peer had sent them.
    pub fn push_inbound(&self, bytes: &[u8]) {
        self.shared.lock().unwrap().inbound.extend_from_slice(bytes);
    }

    /// Drains bytes the connection under test has written.
    pub fn take_outbound(&self) -> Vec<u8> {
        std::mem::take(&mut self.shared.lock().unwrap().outbound)
    }

    pub fn close_read_side(&self) {
        self.shared.lock().unwrap().shutdown_read = true;
    }

    /// `(shutdown_read, shutdown_write)`, for asserting a caller shut both
    /// directions down rather than just dropping the stream.
    pub fn shutdown_state(&self) -> (bool, bool) {
        let shared = self.shared.lock().unwrap();
        (shared.shutdown_read, shared.shutdown_write)
    }
}

impl Read for MockStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut shared = self.shared.lock().unwrap();
        if shared.inbound.is_empty() {
            if shared.shutdown_read {
                return Ok(0);
            }
            return Err(io::Error::new(io::ErrorKind::WouldBlock, "no data"));
        }
        let n = buf.len().min(shared.inbound.len());
        buf[..n].copy_from_slice(&shared.inbound[..n]);
        shared.inbound.drain(..n);
        Ok(n)
    }
}

impl Write for MockStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut shared = self.shared.lock().unwrap();
        if shared.shutdown_write {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed"));
        }
        shared.outbound.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Source for MockStream {
    fn register(&mut self, _: &Registry, _: Token, _: Interest) -> io::Result<()> {
        Ok(())
    }

    fn reregister(&mut self, _: &Registry, _: Token, _: Interest) -> io::Result<()> {
        Ok(())
    }

    fn deregister(&mut self, _: &Registry) -> io::Result<()> {
        Ok(())
    }
}

impl TcpStream for MockStream {
    fn connect(addr: SocketAddr) -> io::Result<Self> {
        Ok(MockStream::new(addr, addr))
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.peer)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.local)
    }

    fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        let mut shared = self.shared.lock().unwrap();
        match how {
            Shutdown::Read => shared.shutdown_read = true,
            Shutdown::Write => shared.shutdown_write = true,
            Shutdown::Both => {
                shared.shutdown_read = true;
                shared.shutdown_write = true;
            }
        }
        Ok(())
    }

    fn set_nodelay(&self, _: bool) -> io::Result<()> {
        Ok(())
    }

    fn nodelay(&self) -> io::Result<bool> {
        Ok(true)
    }

    fn set_ttl(&self, _: u32) -> io::Result<()> {
        Ok(())
    }

    fn ttl(&self) -> io::Result<u32> {
        Ok(64)
    }

    fn take_error(&self) -> io::Result<Option<io::Error>> {
        Ok(None)
    }

    fn peek(&self, buf: &mut [u8]) -> io::Result<usize> {
        let shared = self.shared.lock().unwrap();
        let n = buf.len().min(shared.inbound.len());
        buf[..n].copy_from_slice(&shared.inbound[..n]);
        Ok(n)
    }
}

/// Hands out pre-seeded [`MockStream`]s on `accept`, one per call, in order.
#[derive(Debug)]
pub struct MockListener {
    local: Mutex<SocketAddr>,
    queue: Mutex<Vec<(MockStream, SocketAddr)>>,
}

impl Default for MockListener {
    fn default() -> Self {
        MockListener {
            local: Mutex::new(SocketAddr::from(([0, 0, 0, 0], 0))),
            queue: Mutex::new(Vec::new()),
        }
    }
}

impl Source for MockListener {
    fn register(&mut self, _: &Registry, _: Token, _: Interest) -> io::Result<()> {
        Ok(())
    }

    fn reregister(&mut self, _: &Registry, _: Token, _: Interest) -> io::Result<()> {
        Ok(())
    }

    fn deregister(&mut self, _: &Registry) -> io::Result<()> {
        Ok(())
    }
}

impl MockListener {
    pub fn push_connection(&self, stream: MockStream, addr: SocketAddr) {
        self.queue.lock().unwrap().push((stream, addr));
    }
}

impl TcpListener<MockStream> for MockListener {
    fn bind(addr: SocketAddr) -> io::Result<Self> {
        Ok(MockListener {
            local: Mutex::new(addr),
            queue: Mutex::new(Vec::new()),
        })
    }

    fn accept(&self) -> io::Result<(MockStream, SocketAddr)> {
        let mut queue = self.queue.lock().unwrap();
        if queue.is_empty() {
            return Err(io::Error::new(io::ErrorKind::WouldBlock, "no pending connections"));
        }
        Ok(queue.remove(0))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(*self.local.lock().unwrap())
    }

    fn set_ttl(&self, _: u32) -> io::Result<()> {
        Ok(())
    }

    fn ttl(&self) -> io::Result<u32> {
        Ok(64)
    }

    fn take_error(&self) -> io::Result<Option<io::Error>> {
        Ok(None)
    }
}
