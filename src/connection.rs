//! Per-connection I/O state (C6).
//!
//! Generalizes the teacher's `ConnectionType`/`Connection` trait/
//! `ConnectionBuilder` shape (`examples/ryanseipp-rask-old/src/connection.rs`)
//! from "parse one request, forget everything" into the half-close,
//! backpressure, keep-alive-budget, and body-streaming contract described in
//! the design doc's data model and section 4.4.

use std::collections::HashMap;
use std::io::{self, ErrorKind, Read, Write};
use std::net::SocketAddr;

use mio::event::Source;
use mio::{Interest, Registry, Token};

use crate::driver::{Driver, ParserEvent, RequestHead};
use crate::error::CoreError;
use crate::net::TcpStream;

/// The write end of a streamed request entity, as seen by whatever consumes
/// `ENTITY_PART` chunks. Chunks accumulate until taken; on a client
/// disconnect or size-cap failure the emitter is marked failed and further
/// chunks are simply dropped (a fresh sink per the SIZE_WARNING policy).
#[derive(Debug, Default)]
pub struct BodyEmitter {
    chunks: Vec<u8>,
    completed: bool,
    failed: Option<CoreError>,
}

impl BodyEmitter {
    pub fn push(&mut self, chunk: Vec<u8>) {
        if self.failed.is_none() {
            self.chunks.extend_from_slice(&chunk);
        }
    }

    pub fn complete(&mut self) {
        self.completed = true;
    }

    pub fn fail(&mut self, err: CoreError) {
        self.failed = Some(err);
        self.chunks.clear();
    }

    pub fn is_failed(&self) -> bool {
        self.failed.is_some()
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    pub fn take_chunks(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.chunks)
    }
}

/// One dispatched request's entity stream, keyed by the driver's stream id
/// (always `0` for HTTP/1.1's single request-in-flight-at-a-time model;
/// HTTP/2 drivers would use the real stream id).
pub type StreamId = u64;

/// A single client connection. Owns its socket, buffers, keep-alive budget,
/// and any body emitters for entities still streaming in.
pub struct Connection<S: TcpStream + Read + Write + Source> {
    id: usize,
    token: Token,
    stream: S,
    peer_addr: Option<SocketAddr>,
    driver: Box<dyn Driver>,
    write_buf: Vec<u8>,
    read_closed: bool,
    write_closed: bool,
    in_flight_responses: u32,
    remaining_requests: u32,
    emitters: HashMap<StreamId, BodyEmitter>,
    exported: bool,
    write_suspended: bool,
    close_after_flush: bool,
    soft_cap: usize,
    hard_cap: usize,
}

impl<S: TcpStream + Read + Write + Source> Connection<S> {
    pub fn new(
        id: usize,
        token: Token,
        stream: S,
        driver: Box<dyn Driver>,
        max_requests: u32,
        soft_cap: usize,
        hard_cap: usize,
    ) -> Self {
        let peer_addr = stream.peer_addr().ok();
        let mut driver = driver;
        driver.set_soft_stream_cap(soft_cap);
        Connection {
            id,
            token,
            stream,
            peer_addr,
            driver,
            write_buf: Vec::new(),
            read_closed: false,
            write_closed: false,
            in_flight_responses: 0,
            remaining_requests: max_requests,
            emitters: HashMap::new(),
            exported: false,
            write_suspended: false,
            close_after_flush: false,
            soft_cap,
            hard_cap,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn remaining_requests(&self) -> u32 {
        self.remaining_requests
    }

    pub fn in_flight_responses(&self) -> u32 {
        self.in_flight_responses
    }

    pub fn is_exported(&self) -> bool {
        self.exported
    }

    /// Fully closed once both directions are shut. The terminal state the
    /// server removes the connection in.
    pub fn is_closed(&self) -> bool {
        self.read_closed && self.write_closed
    }

    pub fn is_idle(&self) -> bool {
        self.in_flight_responses == 0 && self.emitters.values().all(|e| e.is_completed() || e.is_failed())
    }

    /// True when a response is still being produced for a request whose body
    /// has already finished streaming: `in_flight_responses` outnumbers the
    /// emitters still actively receiving chunks. The keep-alive sweep treats
    /// such a connection as busy rather than idle (spec section 4.7) even
    /// though its timer has expired, since it never gets to renew while a
    /// slow response is in flight.
    pub fn is_producing_response(&self) -> bool {
        let active_emitters = self.emitters.values().filter(|e| !e.is_completed() && !e.is_failed()).count();
        self.in_flight_responses as usize > active_emitters
    }

    /// Reads up to `io_granularity` bytes and feeds them to the driver.
    /// Mirrors the design doc's readable-path rules for EOF and half-close.
    pub fn read(&mut self, io_granularity: usize) -> CoreResult<Vec<ParserEvent>> {
        let mut buf = vec![0u8; io_granularity];
        match self.stream.read(&mut buf) {
            Ok(0) => {
                if self.write_closed || self.in_flight_responses == 0 {
                    self.read_closed = true;
                    self.write_closed = true;
                } else {
                    self.read_closed = true;
                    self.fail_emitters(CoreError::ClientDisconnect);
                }
                Ok(Vec::new())
            }
            Ok(n) => Ok(self.driver.feed(&buf[..n])),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(Vec::new()),
            Err(e) => {
                self.read_closed = true;
                self.write_closed = true;
                Err(CoreError::Accept(e))
            }
        }
    }

    /// Applies a driver event to this connection's body-emitter bookkeeping.
    /// Request-head events (`HeadersOnly`/`EntityHeaders`) are returned to
    /// the caller untouched; the pipeline decides dispatch for those.
    pub fn apply_event(&mut self, stream_id: StreamId, event: &ParserEvent) {
        match event {
            ParserEvent::EntityHeaders(_) => {
                self.emitters.insert(stream_id, BodyEmitter::default());
            }
            ParserEvent::EntityPart(chunk) => {
                self.emitters.entry(stream_id).or_default().push(chunk.clone());
            }
            ParserEvent::EntityComplete => {
                if let Some(emitter) = self.emitters.get_mut(&stream_id) {
                    emitter.complete();
                }
            }
            ParserEvent::SizeWarning => {
                if let Some(emitter) = self.emitters.get_mut(&stream_id) {
                    emitter.fail(CoreError::Application {
                        filter_key: None,
                        message: "entity body exceeded soft_stream_cap".to_string(),
                    });
                }
                // SIZE_WARNING policy (open question, resolved in DESIGN.md):
                // replace with a fresh sink rather than closing, so the wire
                // keeps draining even though the application already saw the
                // failure.
                self.emitters.insert(stream_id, BodyEmitter::default());
            }
            ParserEvent::HeadersOnly(_) | ParserEvent::ParseError { .. } => {}
        }
    }

    pub fn emitter_mut(&mut self, stream_id: StreamId) -> Option<&mut BodyEmitter> {
        self.emitters.get_mut(&stream_id)
    }

    fn fail_emitters(&mut self, err: CoreError) {
        for emitter in self.emitters.values_mut() {
            if !emitter.is_completed() {
                emitter.fail(match &err {
                    CoreError::ClientDisconnect => CoreError::ClientDisconnect,
                    other => CoreError::Application {
                        filter_key: None,
                        message: other.to_string(),
                    },
                });
            }
        }
    }

    pub fn begin_response(&mut self) {
        self.in_flight_responses += 1;
        self.remaining_requests = self.remaining_requests.saturating_sub(1);
    }

    /// Queues response bytes for the writable path, matching the backpressure
    /// contract: callers should stop producing once `is_over_soft_cap` is
    /// true and resume once it clears.
    pub fn queue_response_bytes(&mut self, bytes: &[u8]) {
        self.write_buf.extend_from_slice(bytes);
        if self.write_buf.len() > self.soft_cap {
            self.write_suspended = true;
        }
    }

    pub fn is_over_soft_cap(&self) -> bool {
        self.write_buf.len() > self.soft_cap
    }

    pub fn is_over_hard_cap(&self) -> bool {
        self.write_buf.len() > self.hard_cap
    }

    pub fn is_write_suspended(&self) -> bool {
        self.write_suspended
    }

    /// Marks the connection to close once `write_buf` fully drains, rather
    /// than dropping the response that's about to be queued. The pipeline
    /// calls this for a forced-close response (503, last keep-alive request,
    /// an unrecoverable parse error) instead of calling `close` directly.
    pub fn mark_close_after_flush(&mut self) {
        self.close_after_flush = true;
    }

    /// Marks a response as fully handed to the driver. Decrements
    /// `in_flight_responses`; callers close the connection themselves if
    /// this returns `true` and the read side is already closed, or if the
    /// connection was otherwise marked to close.
    pub fn end_response(&mut self) -> bool {
        self.in_flight_responses = self.in_flight_responses.saturating_sub(1);
        self.in_flight_responses == 0 && self.read_closed
    }

    fn event_set(&self) -> Interest {
        if self.write_buf.is_empty() {
            Interest::READABLE
        } else {
            Interest::READABLE | Interest::WRITABLE
        }
    }

    /// Attempts a non-blocking write of the whole buffer. Partial writes
    /// retain the remainder; a zero-byte or error result on an
    /// already-read-closed connection finishes the close, otherwise only the
    /// write side is marked shut.
    pub fn write(&mut self) -> CoreResult<()> {
        if self.write_buf.is_empty() {
            return Ok(());
        }
        match self.stream.write(&self.write_buf) {
            Ok(0) => {
                self.write_closed = true;
                Ok(())
            }
            Ok(n) => {
                self.write_buf.drain(..n);
                if self.write_buf.len() <= self.soft_cap {
                    self.write_suspended = false;
                }
                if self.write_buf.is_empty() && self.close_after_flush {
                    self.read_closed = true;
                    self.write_closed = true;
                }
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(()),
            Err(e) => {
                self.write_closed = true;
                if self.read_closed {
                    self.read_closed = true;
                }
                Err(CoreError::Accept(e))
            }
        }
    }

    pub fn register(&mut self, registry: &Registry) -> io::Result<()> {
        let interest = self.event_set();
        registry.register(&mut self.stream, self.token, interest)
    }

    pub fn reregister(&mut self, registry: &Registry) -> io::Result<()> {
        let interest = self.event_set();
        registry.reregister(&mut self.stream, self.token, interest)
    }

    pub fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        registry.deregister(&mut self.stream)
    }

    /// Forces both half-closes, releasing this connection's claim on the
    /// socket. Admission-counter bookkeeping is the listener's
    /// responsibility (it knows the original peer address/ip-block).
    pub fn close(&mut self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
        self.read_closed = true;
        self.write_closed = true;
        self.fail_emitters(CoreError::ClientDisconnect);
    }

    /// Marks this connection exported: dead to the HTTP core, socket handed
    /// to an external upgrader. The server removes it from its own
    /// bookkeeping without touching the socket.
    pub fn mark_exported(&mut self) {
        self.exported = true;
        self.read_closed = true;
        self.write_closed = true;
    }

    pub fn into_stream(self) -> S {
        self.stream
    }
}

type CoreResult<T> = Result<T, CoreError>;

/// Picks a stream id for a given event under HTTP/1.1's one-request-at-a-time
/// model: always `0`. A multiplexed driver would carry its own stream ids in
/// the event itself; kept as a free function so the pipeline doesn't need to
/// know the difference.
pub fn h1_stream_id(_head: &RequestHead) -> StreamId {
    0
}
