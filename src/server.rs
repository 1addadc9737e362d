//! Server lifecycle, event loop, and observer fan-out (C10).
//!
//! Generalizes `examples/ryanseipp-rask-old/src/multilistener.rs`'s
//! `run()`/`event()`/`close_connection()` shape (poll, route by token,
//! read-then-parse-then-write, deregister-and-remove on close) into a
//! three-way token space — bound listeners, in-progress TLS handshakes, and
//! established connections — plus the Starting/Started/Stopping/Stopped
//! state machine and observer notifications spec.md section 4.1 describes,
//! neither of which the teacher has any equivalent for.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use mio::event::Source;
use mio::{Events, Poll, Token};
use rustls::ServerConfig;
use slab::Slab;

use crate::admission::AdmissionCounters;
use crate::clock::{Clock, Tick};
use crate::connection::{h1_stream_id, Connection, StreamId};
use crate::driver::{Driver, ParserEvent, RequestHead};
use crate::error::{CoreError, CoreResult};
use crate::export::{self, ExportedConnection};
use crate::filter::FilterChain;
use crate::keepalive::KeepAliveQueue;
use crate::listener::{Accepted, ListenerSet};
use crate::monitor::ServerSnapshot;
use crate::net::{TcpListener, TcpStream};
use crate::options::Options;
use crate::parser::h1::H1Driver;
use crate::parser::status::Status;
use crate::parser::HttpVersion;
use crate::pipeline;
use crate::response::Response;
use crate::tls::{HandshakeOutcome, TlsNegotiator};
use crate::vhost::{VirtualHost, VirtualHostRegistry};

/// Pending TLS handshakes live in a disjoint token range starting here,
/// leaving `0..TLS_TOKEN_BASE` to the connection table's `Slab` keys and
/// `usize::MAX` downward to bound listeners, mirroring the teacher's
/// `LISTEN_TOKEN`/`WAKE_TOKEN` constant-reservation idiom at the other end
/// of the token space.
const TLS_TOKEN_BASE: usize = 1 << 48;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Stopped,
    Starting,
    Started,
    Stopping,
}

/// Receives a read-only snapshot whenever the server's state changes.
/// Synchronous per the single-threaded event-loop model (see DESIGN.md's
/// open question on observer futures): every observer runs in registration
/// order and every error is collected rather than short-circuiting, which is
/// observably the same as a concurrent join since nothing here can block a
/// sibling callback.
pub trait Observer {
    fn update(&mut self, snapshot: &ServerSnapshot) -> Result<(), CoreError>;
}

fn no_driver_filters() -> Vec<Box<dyn crate::filter::Filter>> {
    Vec::new()
}

/// The connection and dispatch core. Owns the bound sockets, the poll
/// reactor, the connection table, and everything needed to drive one tick of
/// the event loop via [`Server::run_once`].
pub struct Server<T, S>
where
    T: TcpListener<S> + Source,
    S: TcpStream + Read + Write + Source,
{
    state: ServerState,
    options: Options,
    hosts: VirtualHostRegistry,
    poll: Poll,
    listeners: ListenerSet<T, S>,
    next_listener_token: usize,
    connections: Slab<Connection<S>>,
    tls: Option<TlsNegotiator<S>>,
    next_tls_token: usize,
    pending_heads: HashMap<usize, RequestHead>,
    admission: AdmissionCounters,
    keepalive: KeepAliveQueue,
    clock: Clock,
    observers: Vec<Box<dyn Observer>>,
    stopping_deadline: Option<Tick>,
}

impl<T, S> Server<T, S>
where
    T: TcpListener<S> + Source,
    S: TcpStream + Read + Write + Source,
{
    pub fn new(options: Options) -> CoreResult<Self> {
        let poll = Poll::new().map_err(CoreError::Accept)?;
        let admission = AdmissionCounters::new(options.max_connections, options.connections_per_ip);
        Ok(Server {
            state: ServerState::Stopped,
            options,
            hosts: VirtualHostRegistry::new(),
            poll,
            listeners: ListenerSet::new(),
            next_listener_token: 0,
            connections: Slab::new(),
            tls: None,
            next_tls_token: TLS_TOKEN_BASE,
            pending_heads: HashMap::new(),
            admission,
            keepalive: KeepAliveQueue::new(),
            clock: Clock::new(),
            observers: Vec::new(),
            stopping_deadline: None,
        })
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    pub fn register_vhost(&mut self, host: VirtualHost) -> CoreResult<()> {
        if self.options.is_locked() {
            return Err(CoreError::Configuration("cannot register a vhost after start()"));
        }
        self.hosts.register(host);
        Ok(())
    }

    pub fn bind_plain(&mut self, addr: SocketAddr) -> CoreResult<Token> {
        self.bind(addr, None)
    }

    /// Binds a TLS-handshake-required listener. All TLS listeners on this
    /// server share one negotiator and therefore one `ServerConfig`,
    /// matching the teacher's `ListenerConfig` (a single `tls` field shared
    /// by every socket the `MultiListener` owns).
    pub fn bind_tls(&mut self, addr: SocketAddr, config: Arc<ServerConfig>) -> CoreResult<Token> {
        if self.tls.is_none() {
            self.tls = Some(TlsNegotiator::new(Arc::clone(&config)));
        }
        self.bind(addr, Some(config))
    }

    fn bind(&mut self, addr: SocketAddr, tls: Option<Arc<ServerConfig>>) -> CoreResult<Token> {
        let token = Token(usize::MAX - self.next_listener_token);
        self.next_listener_token += 1;
        self.listeners
            .bind(addr, tls, self.poll.registry(), token)
            .map_err(CoreError::Accept)
    }

    pub fn attach_observer(&mut self, observer: Box<dyn Observer>) {
        self.observers.push(observer);
    }

    pub fn snapshot(&self) -> ServerSnapshot {
        ServerSnapshot {
            state: self.state,
            bindings: self.listeners.local_addrs(),
            clients: self.connections.len(),
            unique_ip_blocks: self.admission.unique_ip_blocks(),
            pending_inputs: self.pending_heads.len(),
            hosts: self.hosts.names().into_iter().map(String::from).collect(),
            uptime: self.clock.uptime(),
        }
    }

    fn notify_observers(&mut self) -> Vec<CoreError> {
        let snapshot = self.snapshot();
        let mut errors = Vec::new();
        for observer in &mut self.observers {
            if let Err(e) = observer.update(&snapshot) {
                errors.push(e);
            }
        }
        errors
    }

    /// Validates and locks `options`, then walks Stopped -> Starting ->
    /// Started, notifying observers at each step. An observer error that
    /// `is_fatal_to_server` at either step aborts the transition and leaves
    /// the server Stopped; any other observer error is logged and ignored.
    pub fn start(&mut self) -> CoreResult<()> {
        if self.state != ServerState::Stopped {
            return Err(CoreError::Configuration("start() called outside the Stopped state"));
        }
        if self.hosts.is_empty() {
            return Err(CoreError::Configuration("start() requires at least one registered vhost"));
        }
        self.options.freeze()?;

        self.state = ServerState::Starting;
        if let Some(e) = self.notify_fatal() {
            self.state = ServerState::Stopped;
            return Err(e);
        }

        self.state = ServerState::Started;
        if let Some(e) = self.notify_fatal() {
            self.state = ServerState::Stopped;
            return Err(e);
        }

        tracing::info!(bindings = ?self.listeners.local_addrs(), "server started");
        Ok(())
    }

    fn notify_fatal(&mut self) -> Option<CoreError> {
        for err in self.notify_observers() {
            if err.is_fatal_to_server() {
                return Some(err);
            }
            tracing::warn!(error = %err, "observer rejected a lifecycle notification");
        }
        None
    }

    /// Begins graceful shutdown: the server stops admitting new connections
    /// and arms the shutdown-timeout deadline. [`Server::run_once`] finishes
    /// the transition to Stopped once every connection has drained, or
    /// reports [`CoreError::ShutdownTimeout`] if `shutdown_timeout` passes
    /// first.
    pub fn request_stop(&mut self) -> CoreResult<()> {
        if self.state != ServerState::Started {
            return Err(CoreError::Configuration("request_stop() called outside the Started state"));
        }
        self.state = ServerState::Stopping;
        self.stopping_deadline = self.clock.now().checked_add(self.options.shutdown_timeout);
        for err in self.notify_observers() {
            tracing::warn!(error = %err, "observer rejected the Stopping notification");
        }
        Ok(())
    }

    fn finish_stop(&mut self) {
        self.state = ServerState::Stopped;
        self.stopping_deadline = None;
        for err in self.notify_observers() {
            tracing::warn!(error = %err, "observer rejected the Stopped notification");
        }
    }

    /// One tick of the event loop: advances the clock, polls for at most
    /// `poll_timeout` (blocking indefinitely on `None`), routes every
    /// readiness event by where its token falls in the three-way token
    /// space, then sweeps expired keep-alive connections. Callers drive this
    /// in a loop, interleaving whatever else they need (signal handling,
    /// metrics scraping) between ticks.
    pub fn run_once(&mut self, poll_timeout: Option<Duration>) -> CoreResult<()> {
        self.clock.tick();

        if self.state == ServerState::Stopping {
            let drained = self.connections.is_empty() && self.tls.as_ref().map_or(true, |t| t.is_empty());
            if drained {
                self.finish_stop();
                return Ok(());
            }
            let timed_out = self
                .stopping_deadline
                .map(|deadline| self.clock.now() > deadline)
                .unwrap_or(false);
            if timed_out {
                self.finish_stop();
                return Err(CoreError::ShutdownTimeout(self.options.shutdown_timeout));
            }
        }

        let mut events = Events::with_capacity(1024);
        self.poll.poll(&mut events, poll_timeout).map_err(CoreError::Accept)?;

        for event in events.iter() {
            let token = event.token();
            if self.listeners.is_listener_token(token) {
                self.handle_accept(token);
            } else if token.0 >= TLS_TOKEN_BASE {
                self.handle_tls_event(token);
            } else {
                self.handle_connection_event(token);
            }
        }

        for id in self.keepalive.sweep_expired(self.clock.now()) {
            // The timer is already cleared by `sweep_expired` popping the
            // entry. A connection still producing a response is busy, not
            // idle (spec section 4.7), so it's left alone rather than closed;
            // it gets a fresh timer when the response completes.
            if self.connections.get(id).map_or(false, Connection::is_producing_response) {
                continue;
            }
            self.close_connection(id);
        }

        Ok(())
    }

    fn handle_accept(&mut self, token: Token) {
        for accepted in self.listeners.accept_ready(token, &mut self.admission) {
            let (stream, addr, is_tls) = match accepted {
                Accepted::Plain { stream, addr } => (stream, addr, false),
                Accepted::Tls { stream, addr } => (stream, addr, true),
            };

            // No new work is admitted once shutdown has begun; the slot was
            // already charged by `accept_ready`, so it must be refunded.
            if self.state == ServerState::Stopping {
                self.admission.release(Some(addr.ip()));
                drop(stream);
                continue;
            }

            if is_tls {
                self.begin_tls_handshake(stream, Some(addr));
            } else {
                self.insert_plain_connection(stream);
            }
        }
    }

    fn insert_plain_connection(&mut self, stream: S) {
        let entry = self.connections.vacant_entry();
        let id = entry.key();
        let token = Token(id);
        let driver: Box<dyn Driver> = Box::new(H1Driver::new());
        let mut conn = Connection::new(
            id,
            token,
            stream,
            driver,
            self.options.max_requests_per_connection,
            self.options.soft_stream_cap,
            self.options.hard_stream_cap,
        );
        if let Err(e) = conn.register(self.poll.registry()) {
            tracing::warn!(error = %e, "failed to register an accepted connection");
            self.admission.release(conn.peer_addr().map(|a| a.ip()));
            return;
        }
        self.keepalive.renew(id, self.clock.now(), self.options.connection_timeout);
        entry.insert(conn);
    }

    fn begin_tls_handshake(&mut self, stream: S, peer_addr: Option<SocketAddr>) {
        let token = Token(self.next_tls_token);
        self.next_tls_token += 1;

        let Some(negotiator) = self.tls.as_mut() else {
            tracing::error!("accepted a TLS connection with no TLS listener configured");
            self.admission.release(peer_addr.map(|a| a.ip()));
            return;
        };
        if let Err(e) = negotiator.begin(token, stream, peer_addr) {
            tracing::warn!(error = %e, "failed to start a TLS handshake");
            self.admission.release(peer_addr.map(|a| a.ip()));
            return;
        }
        if let Err(e) = negotiator.register(token, self.poll.registry()) {
            tracing::warn!(error = %e, "failed to register a TLS handshake socket");
            negotiator.discard(token, &mut self.admission);
        }
    }

    fn handle_tls_event(&mut self, token: Token) {
        let Some(negotiator) = self.tls.as_mut() else { return };
        match negotiator.progress(token, &mut self.admission) {
            HandshakeOutcome::Pending => {
                if let Err(e) = negotiator.reregister(token, self.poll.registry()) {
                    tracing::warn!(error = %e, "failed to reregister an in-progress TLS handshake");
                }
            }
            HandshakeOutcome::Ready { stream, alpn_h2: _ } => {
                // H2 framing is out of scope (see driver.rs); every TLS
                // connection becomes an H1 connection regardless of ALPN.
                self.insert_plain_connection(stream);
            }
            HandshakeOutcome::Failed => {}
        }
    }

    fn handle_connection_event(&mut self, token: Token) {
        let id = token.0;

        let read_result = match self.connections.get_mut(id) {
            Some(conn) => conn.read(self.options.io_granularity),
            None => return,
        };

        match read_result {
            Ok(events) => {
                for event in events {
                    self.dispatch_event(id, event);
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, connection = id, "connection read failed");
                self.close_connection(id);
                return;
            }
        }

        let Some(conn) = self.connections.get_mut(id) else { return };
        let write_failed = conn.write().is_err();
        if write_failed || conn.is_closed() {
            self.close_connection(id);
            return;
        }

        if conn.is_idle() {
            self.keepalive.renew(id, self.clock.now(), self.options.connection_timeout);
        }
        if let Err(e) = conn.reregister(self.poll.registry()) {
            tracing::warn!(error = %e, connection = id, "failed to reregister connection");
            self.close_connection(id);
        }
    }

    /// Applies one driver event to `connection_id`'s emitter bookkeeping
    /// and, once a full request is available, dispatches it. A request with
    /// an entity body is buffered head-first in `pending_heads` and only
    /// dispatched on `EntityComplete`, so applications never see a partial
    /// body (see DESIGN.md's body-buffering decision).
    fn dispatch_event(&mut self, connection_id: usize, event: ParserEvent) {
        match event {
            ParserEvent::HeadersOnly(head) => {
                self.run_dispatch(connection_id, head, Vec::new());
            }
            ParserEvent::EntityHeaders(head) => {
                let stream_id = h1_stream_id(&head);
                if let Some(conn) = self.connections.get_mut(connection_id) {
                    conn.apply_event(stream_id, &ParserEvent::EntityHeaders(head.clone()));
                }
                self.pending_heads.insert(connection_id, head);
            }
            ParserEvent::EntityPart(chunk) => {
                let stream_id = self.pending_stream_id(connection_id);
                if let Some(conn) = self.connections.get_mut(connection_id) {
                    conn.apply_event(stream_id, &ParserEvent::EntityPart(chunk));
                }
            }
            ParserEvent::EntityComplete => {
                let stream_id = self.pending_stream_id(connection_id);
                if let Some(conn) = self.connections.get_mut(connection_id) {
                    conn.apply_event(stream_id, &ParserEvent::EntityComplete);
                }
                if let Some(head) = self.pending_heads.remove(&connection_id) {
                    let body = self
                        .connections
                        .get_mut(connection_id)
                        .and_then(|c| c.emitter_mut(stream_id))
                        .map(|e| e.take_chunks())
                        .unwrap_or_default();
                    self.run_dispatch(connection_id, head, body);
                }
            }
            ParserEvent::SizeWarning => {
                let stream_id = self.pending_stream_id(connection_id);
                if let Some(conn) = self.connections.get_mut(connection_id) {
                    conn.apply_event(stream_id, &ParserEvent::SizeWarning);
                }
            }
            ParserEvent::ParseError { status, message, .. } => {
                self.respond_parse_error(connection_id, status, message);
            }
        }
    }

    fn pending_stream_id(&self, connection_id: usize) -> StreamId {
        self.pending_heads.get(&connection_id).map(h1_stream_id).unwrap_or(0)
    }

    fn run_dispatch(&mut self, connection_id: usize, head: RequestHead, body: Vec<u8>) {
        let stream_id = h1_stream_id(&head);
        let shutting_down = self.state == ServerState::Stopping;

        let Some(conn) = self.connections.get_mut(connection_id) else { return };
        conn.begin_response();
        let out_of_requests = conn.remaining_requests() == 0;

        let dispatched = pipeline::dispatch(
            head,
            body,
            connection_id,
            stream_id,
            &self.options,
            &mut self.hosts,
            &self.clock,
            shutting_down,
            no_driver_filters,
        );

        let Some(conn) = self.connections.get_mut(connection_id) else { return };
        let close = dispatched.force_close || out_of_requests;
        let bytes = dispatched.response.encode_h1(close, &self.clock);
        conn.queue_response_bytes(&bytes);
        let fully_drained_after_eof = conn.end_response();
        if close || fully_drained_after_eof {
            conn.mark_close_after_flush();
        }
    }

    /// Responds to an unrecoverable parse failure directly, bypassing
    /// vhost dispatch entirely since no well-formed request head exists to
    /// route with.
    fn respond_parse_error(&mut self, connection_id: usize, status: u16, message: String) {
        let chain = FilterChain::compose(no_driver_filters(), Vec::new(), &[]);
        let mut response = Response::new(HttpVersion::H1_1, Status::BadRequest, chain);
        let _ = response.set_status(status);
        let _ = response.set_header("Connection", "close");
        let _ = response.end(Some(message.into_bytes()));
        let bytes = response.encode_h1(true, &self.clock);

        let Some(conn) = self.connections.get_mut(connection_id) else { return };
        conn.begin_response();
        conn.queue_response_bytes(&bytes);
        conn.end_response();
        conn.mark_close_after_flush();
    }

    fn close_connection(&mut self, connection_id: usize) {
        if let Some(conn) = self.connections.get_mut(connection_id) {
            conn.close();
            let _ = conn.deregister(self.poll.registry());
        }
        self.keepalive.remove(connection_id);
        self.pending_heads.remove(&connection_id);
        if let Some(conn) = self.connections.try_remove(connection_id) {
            self.admission.release(conn.peer_addr().map(|a| a.ip()));
        }
    }

    /// Removes `connection_id` from this server's bookkeeping and hands
    /// back its live socket for an external upgrader to take over (C12).
    /// Returns `None` if no such connection exists.
    pub fn export_connection(&mut self, connection_id: usize) -> Option<ExportedConnection<S>> {
        let conn = self.connections.get_mut(connection_id)?;
        let _ = conn.deregister(self.poll.registry());
        let conn = self.connections.try_remove(connection_id)?;
        self.keepalive.remove(connection_id);
        self.pending_heads.remove(&connection_id);
        Some(export::export(conn, &mut self.admission))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::mock::{MockListener, MockStream};
    use crate::parser::HttpMethod;
    use std::net::{IpAddr, Ipv4Addr};

    struct Echo;
    impl crate::vhost::Application for Echo {
        fn handle(&mut self, _req: &pipeline::Request, resp: &mut Response) -> Result<(), CoreError> {
            resp.end(Some(b"hi".to_vec()))
        }
    }

    fn addr(n: u8) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, n)), 1234)
    }

    fn echo_vhost() -> VirtualHost {
        VirtualHost {
            name: "example.org".to_string(),
            application: Box::new(Echo),
            filter_factory: Box::new(Vec::new),
        }
    }

    fn started_server() -> Server<MockListener, MockStream> {
        let mut server: Server<MockListener, MockStream> = Server::new(Options::new()).unwrap();
        server.register_vhost(echo_vhost()).unwrap();
        server.start().unwrap();
        server
    }

    #[test]
    fn start_requires_a_registered_vhost() {
        let mut server: Server<MockListener, MockStream> = Server::new(Options::new()).unwrap();
        assert!(server.start().is_err());
        assert_eq!(server.state(), ServerState::Stopped);
    }

    #[test]
    fn request_stop_requires_started_state() {
        let mut server: Server<MockListener, MockStream> = Server::new(Options::new()).unwrap();
        assert!(server.request_stop().is_err());
    }

    #[test]
    fn request_stop_drains_to_stopped_with_no_connections() {
        let mut server = started_server();
        server.request_stop().unwrap();
        assert_eq!(server.state(), ServerState::Stopping);
        server.run_once(Some(Duration::ZERO)).unwrap();
        assert_eq!(server.state(), ServerState::Stopped);
    }

    #[test]
    fn run_dispatch_queues_an_encoded_response() {
        let mut server = started_server();
        let stream = MockStream::new(addr(1), addr(2));
        server.insert_plain_connection(stream.clone());

        let head = RequestHead {
            method: HttpMethod::Get,
            target: "/".to_string(),
            version: HttpVersion::H1_1,
            headers: vec![crate::driver::Header {
                name: "Host".to_string(),
                value: b"example.org".to_vec(),
            }],
        };
        server.run_dispatch(0, head, Vec::new());
        server.connections.get_mut(0).unwrap().write().unwrap();

        let out = stream.take_outbound();
        let text = String::from_utf8_lossy(&out);
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.ends_with("hi"));
    }

    #[test]
    fn last_allowed_request_closes_after_flush() {
        let mut opts = Options::new();
        opts.max_requests_per_connection = 1;
        let mut server: Server<MockListener, MockStream> = Server::new(opts).unwrap();
        server.register_vhost(echo_vhost()).unwrap();
        server.start().unwrap();

        let stream = MockStream::new(addr(1), addr(2));
        server.insert_plain_connection(stream.clone());
        let head = RequestHead {
            method: HttpMethod::Get,
            target: "/".to_string(),
            version: HttpVersion::H1_1,
            headers: vec![crate::driver::Header {
                name: "Host".to_string(),
                value: b"example.org".to_vec(),
            }],
        };
        server.run_dispatch(0, head, Vec::new());
        let conn = server.connections.get_mut(0).unwrap();
        conn.write().unwrap();
        assert!(conn.is_closed());
    }

    #[test]
    fn export_connection_releases_admission_and_removes_entry() {
        let mut server = started_server();
        let peer = addr(9);
        server.admission.try_admit(Some(peer.ip()));
        let stream = MockStream::new(peer, addr(2));
        server.insert_plain_connection(stream);

        let exported = server.export_connection(0).expect("connection was inserted");
        assert_eq!(exported.peer_addr, Some(peer));
        assert_eq!(server.admission.global_count(), 0);
        assert!(server.connections.get_mut(0).is_none());
    }

    #[test]
    fn keepalive_sweep_spares_a_connection_still_producing_a_response() {
        let mut server = started_server();
        let stream = MockStream::new(addr(1), addr(2));
        server.insert_plain_connection(stream);
        // A response is in flight but its entity streamed through and
        // completed already, so there's no active body emitter to show for
        // it: exactly the "slow response" case spec section 4.7 calls out.
        server.connections.get_mut(0).unwrap().begin_response();
        server.keepalive.renew(0, server.clock.now(), Duration::ZERO);

        server.run_once(Some(Duration::ZERO)).unwrap();

        let conn = server
            .connections
            .get(0)
            .expect("a connection still producing a response must not be closed by the sweep");
        assert!(!conn.is_closed());
    }

    #[test]
    fn keepalive_sweep_closes_a_truly_idle_connection() {
        let mut server = started_server();
        let stream = MockStream::new(addr(1), addr(2));
        server.insert_plain_connection(stream);
        server.keepalive.renew(0, server.clock.now(), Duration::ZERO);

        server.run_once(Some(Duration::ZERO)).unwrap();

        assert!(server.connections.get(0).is_none());
    }
}
