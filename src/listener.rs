//! Bound listener registry and accept loop (C4).
//!
//! Generalizes `examples/ryanseipp-rask-old/src/multilistener.rs`'s
//! `MultiListener::accept`/`LISTEN_TOKEN` reservation to more than one bound
//! socket (plain and TLS ports bind independently) and separates "accept a
//! socket, check admission, hand back a typed event" from the rest of the
//! event loop, which `src/server.rs` owns.

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;

use mio::event::Source;
use mio::{Interest, Registry, Token};
use rustls::ServerConfig;

use crate::admission::{Admission, AdmissionCounters};
use crate::net::{TcpListener, TcpStream};

/// One accepted socket, tagged with whether it needs a TLS handshake before
/// it can be handed to a [`crate::connection::Connection`].
pub enum Accepted<S> {
    Plain { stream: S, addr: SocketAddr },
    Tls { stream: S, addr: SocketAddr },
}

/// A single bound socket: either plaintext or backed by a TLS config. The
/// listener set may hold several of these (e.g. one plain, one TLS, on
/// different ports).
struct Bound<T, S> {
    listener: T,
    token: Token,
    tls: Option<Arc<ServerConfig>>,
    _marker: std::marker::PhantomData<S>,
}

/// The set of sockets a server instance accepts connections on. Reserves a
/// contiguous block of tokens starting at `first_token` for its bound
/// listeners, leaving the remainder of the token space to the connection
/// table.
pub struct ListenerSet<T, S> {
    bound: Vec<Bound<T, S>>,
}

impl<T, S> ListenerSet<T, S>
where
    T: TcpListener<S> + Source,
    S: TcpStream,
{
    pub fn new() -> Self {
        ListenerSet { bound: Vec::new() }
    }

    /// Binds and registers a new listener, returning the token it was
    /// assigned. `tls` selects plaintext vs. TLS-handshake-required for every
    /// connection accepted on this socket.
    pub fn bind(
        &mut self,
        addr: SocketAddr,
        tls: Option<Arc<ServerConfig>>,
        registry: &Registry,
        token: Token,
    ) -> std::io::Result<Token> {
        let mut listener = T::bind(addr)?;
        registry.register(&mut listener, token, Interest::READABLE)?;
        self.bound.push(Bound {
            listener,
            token,
            tls,
            _marker: std::marker::PhantomData,
        });
        Ok(token)
    }

    pub fn tokens(&self) -> impl Iterator<Item = Token> + '_ {
        self.bound.iter().map(|b| b.token)
    }

    pub fn is_listener_token(&self, token: Token) -> bool {
        self.bound.iter().any(|b| b.token == token)
    }

    /// Drains every pending connection on the listener bound to `token`,
    /// admitting each against `counters` and yielding only the ones that
    /// passed. Denied sockets are closed immediately by dropping them.
    pub fn accept_ready(&self, token: Token, counters: &mut AdmissionCounters) -> Vec<Accepted<S>> {
        let Some(bound) = self.bound.iter().find(|b| b.token == token) else {
            return Vec::new();
        };

        let mut out = Vec::new();
        loop {
            match bound.listener.accept() {
                Ok((stream, addr)) => match counters.try_admit(Some(addr.ip())) {
                    Admission::Admitted => {
                        out.push(if bound.tls.is_some() {
                            Accepted::Tls { stream, addr }
                        } else {
                            Accepted::Plain { stream, addr }
                        });
                    }
                    Admission::GlobalCapReached | Admission::PerIpCapReached => {
                        drop(stream);
                    }
                },
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(_) => break,
            }
        }
        out
    }

    pub fn tls_config(&self, token: Token) -> Option<Arc<ServerConfig>> {
        self.bound.iter().find(|b| b.token == token).and_then(|b| b.tls.clone())
    }

    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.bound.iter().filter_map(|b| b.listener.local_addr().ok()).collect()
    }
}

impl<T, S> Default for ListenerSet<T, S>
where
    T: TcpListener<S> + Source,
    S: TcpStream,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::mock::{MockListener, MockStream};
    use std::net::{IpAddr, Ipv4Addr};

    fn addr(n: u8) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, n)), 8080)
    }

    #[test]
    fn accept_ready_admits_up_to_cap_then_denies() {
        let listener = MockListener::default();
        listener.push_connection(MockStream::new(addr(1), addr(99)), addr(1));
        listener.push_connection(MockStream::new(addr(2), addr(99)), addr(2));

        let mut set: ListenerSet<MockListener, MockStream> = ListenerSet::new();
        set.bound.push(Bound {
            listener,
            token: Token(0),
            tls: None,
            _marker: std::marker::PhantomData,
        });

        let mut counters = AdmissionCounters::new(1, 10);
        let accepted = set.accept_ready(Token(0), &mut counters);
        assert_eq!(accepted.len(), 1);
        assert_eq!(counters.global_count(), 1);
    }

    #[test]
    fn unknown_token_yields_nothing() {
        let set: ListenerSet<MockListener, MockStream> = ListenerSet::new();
        let mut counters = AdmissionCounters::new(10, 10);
        assert!(set.accept_ready(Token(0), &mut counters).is_empty());
    }
}
