//! TLS handshake negotiation (C5).
//!
//! Generalizes `examples/ryanseipp-rask-old/src/connection.rs`'s
//! `TlsConnection::read_tls`/`event_set` mechanics (an `IoState`-driven
//! interest toggle, already grounded per-connection) into a standalone
//! pending-handshake table the listener can poll independently of a fully
//! built `Connection`, so a stalled handshake never occupies a connection
//! slot. ALPN is checked once the handshake completes to decide H1 vs. H2
//! driver selection; admission-counter rollback on failure is this module's
//! job since it's the one that knows the handshake never produced a request.

use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;

use mio::event::Source;
use mio::{Interest, Registry, Token};
use rustls::{ServerConfig, ServerConnection};

use crate::admission::AdmissionCounters;
use crate::net::TcpStream;

struct Pending<S> {
    stream: S,
    tls: ServerConnection,
    peer_addr: Option<SocketAddr>,
}

/// Outcome of polling one pending handshake.
pub enum HandshakeOutcome<S> {
    /// Still negotiating; nothing more to do until the next readable event.
    Pending,
    /// Handshake complete. `alpn_h2` is true when the peer negotiated `h2`
    /// over ALPN, the connection's sole signal for driver selection since
    /// this crate does not parse the client's preface itself under TLS.
    Ready { stream: S, alpn_h2: bool },
    /// Handshake failed (protocol error, or the peer hung up mid-negotiation).
    /// The caller's admission slot has already been released.
    Failed,
}

/// Holds every in-progress TLS handshake, keyed by the connection token the
/// listener assigned at accept time.
pub struct TlsNegotiator<S> {
    config: Arc<ServerConfig>,
    pending: HashMap<Token, Pending<S>>,
}

impl<S> TlsNegotiator<S>
where
    S: TcpStream + Read + Write + Source,
{
    pub fn new(config: Arc<ServerConfig>) -> Self {
        TlsNegotiator {
            config,
            pending: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Registers a freshly accepted socket for handshake, returning the
    /// `rustls::Error` (and leaving the counter alone) if `ServerConnection`
    /// can't be built from the server's own config — a configuration bug,
    /// not a per-connection failure.
    pub fn begin(
        &mut self,
        token: Token,
        stream: S,
        peer_addr: Option<SocketAddr>,
    ) -> Result<(), rustls::Error> {
        let tls = ServerConnection::new(Arc::clone(&self.config))?;
        self.pending.insert(
            token,
            Pending {
                stream,
                tls,
                peer_addr,
            },
        );
        Ok(())
    }

    /// Advances one pending handshake on a readable event. On failure,
    /// releases `counters` for the peer address this handshake was admitted
    /// under and drops the entry; callers must not call `progress` again for
    /// a token once `Failed` or `Ready` has been returned.
    pub fn progress(&mut self, token: Token, counters: &mut AdmissionCounters) -> HandshakeOutcome<S> {
        let Some(entry) = self.pending.get_mut(&token) else {
            return HandshakeOutcome::Failed;
        };

        match read_tls(&mut entry.tls, &mut entry.stream) {
            Ok(0) => return self.fail(token, counters),
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(_) => return self.fail(token, counters),
        }

        if entry.tls.process_new_packets().is_err() {
            return self.fail(token, counters);
        }

        if entry.tls.is_handshaking() {
            return HandshakeOutcome::Pending;
        }

        let alpn_h2 = entry
            .tls
            .alpn_protocol()
            .map(|p| p == b"h2")
            .unwrap_or(false);
        let entry = self.pending.remove(&token).expect("checked above");
        HandshakeOutcome::Ready {
            stream: entry.stream,
            alpn_h2,
        }
    }

    /// Drops a pending handshake outright (e.g. its socket failed to
    /// register with the poll registry), releasing its admission slot.
    pub fn discard(&mut self, token: Token, counters: &mut AdmissionCounters) {
        self.fail(token, counters);
    }

    fn fail(&mut self, token: Token, counters: &mut AdmissionCounters) -> HandshakeOutcome<S> {
        if let Some(entry) = self.pending.remove(&token) {
            // Shut down both directions so a FIN reaches the peer even if a
            // forked child inherited the fd, mirroring the plaintext close
            // path in `connection.rs`.
            let _ = entry.stream.shutdown(std::net::Shutdown::Both);
            counters.release(entry.peer_addr.map(|a| a.ip()));
        }
        HandshakeOutcome::Failed
    }

    /// The interest this handshake wants on its next poll cycle, mirroring
    /// the teacher's `TlsConnection::event_set`.
    pub fn event_set(&self, token: Token) -> Option<Interest> {
        let entry = self.pending.get(&token)?;
        let read = entry.tls.wants_read();
        let write = entry.tls.wants_write();
        Some(if read && write {
            Interest::READABLE | Interest::WRITABLE
        } else if write {
            Interest::WRITABLE
        } else {
            Interest::READABLE
        })
    }

    pub fn register(&mut self, token: Token, registry: &Registry) -> std::io::Result<()> {
        let interest = self.event_set(token).unwrap_or(Interest::READABLE);
        let entry = self.pending.get_mut(&token).expect("register called on unknown token");
        registry.register(&mut entry.stream, token, interest)
    }

    pub fn reregister(&mut self, token: Token, registry: &Registry) -> std::io::Result<()> {
        let interest = self.event_set(token).unwrap_or(Interest::READABLE);
        let entry = self.pending.get_mut(&token).expect("reregister called on unknown token");
        registry.reregister(&mut entry.stream, token, interest)
    }
}

fn read_tls<S: Read>(tls: &mut ServerConnection, stream: &mut S) -> std::io::Result<usize> {
    let mut read = 0;
    loop {
        match tls.read_tls(stream) {
            Ok(0) => return Ok(read),
            Ok(n) => read += n,
            Err(e) => match e.kind() {
                ErrorKind::WouldBlock => {
                    return if read == 0 { Err(e) } else { Ok(read) };
                }
                ErrorKind::Interrupted => {}
                _ => return Err(e),
            },
        }
    }
}
