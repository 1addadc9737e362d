//! The HTTP driver contract (C7).
//!
//! A driver is an opaque, pluggable protocol implementation: it consumes
//! bytes read off the wire and produces [`ParserEvent`]s, and it accepts
//! structured response parts and turns them into bytes for the write
//! buffer. The core never inspects wire format itself — everything it
//! knows about HTTP/1.1 or HTTP/2 framing comes through this seam. This
//! crate ships one reference implementation, [`crate::parser::h1::H1Driver`],
//! against HTTP/1.1; a full HTTP/2 frame driver is out of scope (see
//! `src/parser/h2.rs`) and is represented only by its ALPN detection point
//! in the TLS negotiator and connection import path.

use crate::parser::h1::ParseError;
use crate::parser::{HttpMethod, HttpVersion};

/// A single parsed header, borrowing from the connection's read buffer for
/// the lifetime of one `feed` call's returned events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: Vec<u8>,
}

/// The request line plus headers, once fully received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: HttpMethod,
    pub target: String,
    pub version: HttpVersion,
    pub headers: Vec<Header>,
}

impl RequestHead {
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_slice())
    }

    /// Cookie headers are combined then split on `;`, matching the
    /// "concatenate parsed Cookie headers" rule in the pipeline's
    /// pre-dispatch bookkeeping.
    pub fn cookies(&self) -> Vec<(String, String)> {
        let combined: Vec<u8> = self
            .headers
            .iter()
            .filter(|h| h.name.eq_ignore_ascii_case("cookie"))
            .flat_map(|h| h.value.iter().copied().chain(std::iter::once(b';')))
            .collect();
        String::from_utf8_lossy(&combined)
            .split(';')
            .filter_map(|pair| {
                let pair = pair.trim();
                if pair.is_empty() {
                    return None;
                }
                let (k, v) = pair.split_once('=')?;
                Some((k.trim().to_string(), v.trim().to_string()))
            })
            .collect()
    }
}

/// Events surfaced by a driver as it consumes wire bytes. Named to match the
/// design doc's request pipeline dispatch table exactly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParserEvent {
    /// A complete request with no entity body.
    HeadersOnly(RequestHead),
    /// A request head arrived; an entity body follows in further events.
    EntityHeaders(RequestHead),
    /// A chunk of the entity body for the most recently opened stream.
    EntityPart(Vec<u8>),
    /// The entity body has been fully delivered.
    EntityComplete,
    /// The entity body crossed the soft size cap; the current emitter should
    /// be failed and replaced per the SIZE_WARNING policy.
    SizeWarning,
    /// An unrecoverable parse failure.
    ParseError { status: u16, message: String, source: ParseError },
}

/// The byte-consumer half of the driver contract: a resumable parser that
/// may be fed wire bytes incrementally and yields zero or more events per
/// call. Implementations own all buffering needed to span short reads.
pub trait Driver {
    /// Feeds newly read bytes into the parser, returning any events that
    /// became ready as a result. May be called with an empty slice to drain
    /// state after a previous partial parse (never needed by the H1 driver,
    /// but kept in the contract for drivers with internal timers/flushes).
    fn feed(&mut self, bytes: &[u8]) -> Vec<ParserEvent>;

    /// The maximum entity body size this driver will buffer before raising
    /// `SizeWarning`, as configured by the connection that owns it.
    fn set_soft_stream_cap(&mut self, cap: usize);
}
