//! HTTP/2 framing.
//!
//! The connection core only needs to *detect* HTTP/2 (via the connection
//! preface on plaintext sockets, or ALPN on TLS sockets) and import the
//! connection accordingly; the frame state machine itself is an opaque
//! driver per the design doc and is not implemented here.

/// An HTTP/2 frame header, kept for documentation of the wire shape the
/// preface detector guards against; no frame parsing is implemented.
#[derive(Debug)]
pub struct Frame {
    /// 24 bits only - default max is 2^14.
    length: u32,
    frame_type: u8,
    flags: u8,
    /// 31 bits only.
    stream_id: u32,
}

/// The 24-octet HTTP/2 connection preface (RFC 9113 section 3.4).
pub const PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";
