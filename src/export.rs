//! Connection export (C12): handing a live socket to an external upgrader
//! (e.g. a WebSocket library) without closing it.
//!
//! No teacher equivalent — `multilistener.rs` only ever closes connections.
//! Built directly from spec.md section 4.4's "Export" paragraph: the
//! server's claim on the socket (admission slot, connection-table entry) is
//! released, but the socket itself is handed back alive.

use std::io::{Read, Write};
use std::net::SocketAddr;

use mio::event::Source;

use crate::admission::AdmissionCounters;
use crate::connection::Connection;
use crate::net::TcpStream;

/// A socket released from the core's bookkeeping, ready to be wrapped by
/// whatever protocol the caller is upgrading to.
pub struct ExportedConnection<S> {
    pub stream: S,
    pub peer_addr: Option<SocketAddr>,
}

/// Releases `conn`'s admission slot and returns its raw socket. The caller
/// is responsible for removing the connection's entry from the server's
/// connection table and deregistering it from the poll registry — this
/// function only knows about the connection itself, not the table it lives
/// in.
pub fn export<S>(mut conn: Connection<S>, counters: &mut AdmissionCounters) -> ExportedConnection<S>
where
    S: TcpStream + Read + Write + Source,
{
    let peer_addr = conn.peer_addr();
    conn.mark_exported();
    counters.release(peer_addr.map(|a| a.ip()));
    ExportedConnection {
        stream: conn.into_stream(),
        peer_addr,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::mock::MockStream;
    use crate::parser::h1::H1Driver;
    use mio::Token;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr(n: u8) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, n)), 1234)
    }

    #[test]
    fn export_releases_admission_and_returns_live_stream() {
        let mut counters = AdmissionCounters::new(10, 10);
        let peer = addr(1);
        counters.try_admit(Some(peer.ip()));
        assert_eq!(counters.global_count(), 1);

        let stream = MockStream::new(peer, addr(2));
        let conn = Connection::new(1, Token(1), stream, Box::new(H1Driver::new()), 100, 8192, 65536);

        let exported = export(conn, &mut counters);
        assert_eq!(exported.peer_addr, Some(peer));
        assert_eq!(counters.global_count(), 0);
    }
}
