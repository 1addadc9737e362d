//! The response object and its encode-to-wire step (C9).
//!
//! Loosely grounded on the teacher's skeletal
//! `examples/ryanseipp-rask-old/src/parser/h1/response.rs` (version/status/
//! headers/body, no filters or streaming) but substantially expanded per
//! the design doc's section 4.6: a filter chain sits between the
//! application's `push`/`end` calls and the bytes handed to the driver.

use crate::clock::Clock;
use crate::error::CoreError;
use crate::filter::FilterChain;
use crate::parser::status::Status;
use crate::parser::HttpVersion;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseState {
    NotStarted,
    Started,
    Ended,
}

/// A response under construction. Applications interact with this through
/// `set_status`/`set_header`/`push`/`end`; the pipeline owns turning the
/// accumulated parts into wire bytes via [`Response::encode_h1`].
pub struct Response {
    version: HttpVersion,
    status: u16,
    reason: Option<String>,
    headers: Vec<(String, Vec<u8>)>,
    body: Vec<u8>,
    state: ResponseState,
    filters: FilterChain,
    seeded: bool,
}

impl Response {
    pub fn new(version: HttpVersion, status: Status, filters: FilterChain) -> Self {
        Response {
            version,
            status: status as u16,
            reason: None,
            headers: Vec::new(),
            body: Vec::new(),
            state: ResponseState::NotStarted,
            filters,
            seeded: false,
        }
    }

    pub fn state(&self) -> ResponseState {
        self.state
    }

    pub fn set_status(&mut self, status: u16) -> Result<(), CoreError> {
        self.ensure_not_started()?;
        self.status = status;
        Ok(())
    }

    pub fn set_reason(&mut self, reason: impl Into<String>) -> Result<(), CoreError> {
        self.ensure_not_started()?;
        self.reason = Some(reason.into());
        Ok(())
    }

    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) -> Result<(), CoreError> {
        self.ensure_not_started()?;
        let name = name.into();
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(&name));
        self.headers.push((name, value.into()));
        Ok(())
    }

    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) -> Result<(), CoreError> {
        self.ensure_not_started()?;
        self.headers.push((name.into(), value.into()));
        Ok(())
    }

    fn ensure_not_started(&self) -> Result<(), CoreError> {
        if self.state != ResponseState::NotStarted {
            return Err(CoreError::Application {
                filter_key: None,
                message: "headers cannot change after the response has started".into(),
            });
        }
        Ok(())
    }

    /// Seeds the filter chain on first call. A filter that throws while
    /// seeding leaves the response `NotStarted`, since no bytes have been
    /// produced yet — the pipeline's filter-recovery loop can blacklist it
    /// and retry with a fresh chain.
    fn ensure_seeded(&mut self) -> Result<(), CoreError> {
        if !self.seeded {
            self.filters.begin().map_err(|(key, e)| annotate(key, e))?;
            self.seeded = true;
        }
        Ok(())
    }

    /// Pushes a chunk of body through the filter chain, starting the
    /// response only once the chunk has actually made it through every
    /// filter — a filter that throws on the very first chunk therefore
    /// leaves the response `NotStarted` rather than stranding it `Started`
    /// with nothing written, which would make the filter-recovery loop
    /// unreachable.
    pub fn push(&mut self, chunk: Vec<u8>) -> Result<(), CoreError> {
        if self.state == ResponseState::Ended {
            return Err(CoreError::Application {
                filter_key: None,
                message: "cannot push to an ended response".into(),
            });
        }
        self.ensure_seeded()?;
        let filtered = self
            .filters
            .apply(chunk)
            .map_err(|(key, e)| annotate(key, e))?;
        self.state = ResponseState::Started;
        self.body.extend_from_slice(&filtered);
        Ok(())
    }

    /// Ends the response, optionally pushing a final chunk first, and drains
    /// any trailing bytes the filter chain still owes (e.g. a compressor's
    /// final block).
    pub fn end(&mut self, body: Option<Vec<u8>>) -> Result<(), CoreError> {
        if let Some(body) = body {
            self.push(body)?;
        } else {
            self.ensure_seeded()?;
        }
        self.state = ResponseState::Started;
        for trailing in self.filters.finish().map_err(|(key, e)| annotate(key, e))? {
            self.body.extend_from_slice(&trailing);
        }
        self.state = ResponseState::Ended;
        Ok(())
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    /// The reason phrase that will be written on the wire: whatever
    /// `set_reason` last set, or the status's default phrase.
    pub fn reason(&self) -> String {
        self.reason.clone().unwrap_or_else(|| default_reason(self.status))
    }

    /// Serializes this response as an HTTP/1.1 message. `close` forces
    /// `Connection: close`; `clock` supplies the cached `Date:` header.
    pub fn encode_h1(&self, close: bool, clock: &Clock) -> Vec<u8> {
        let reason = self.reason.clone().unwrap_or_else(|| default_reason(self.status));
        let mut out = format!("{} {} {}\r\n", self.version, self.status, reason).into_bytes();

        out.extend_from_slice(format!("Date: {}\r\n", clock.http_date()).as_bytes());
        if !self.headers.iter().any(|(n, _)| n.eq_ignore_ascii_case("content-length")) {
            out.extend_from_slice(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
        }
        if close && !self.headers.iter().any(|(n, _)| n.eq_ignore_ascii_case("connection")) {
            out.extend_from_slice(b"Connection: close\r\n");
        }
        for (name, value) in &self.headers {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value);
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }
}

fn annotate(key: &'static str, err: CoreError) -> CoreError {
    match err {
        CoreError::Application { message, .. } => CoreError::Application {
            filter_key: Some(key),
            message,
        },
        other => other,
    }
}

fn default_reason(status: u16) -> String {
    match status {
        200 => "OK",
        204 => "No Content",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "",
    }
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::FilterChain;

    fn empty_chain() -> FilterChain {
        FilterChain::compose(vec![], vec![], &[])
    }

    #[test]
    fn set_header_after_start_is_rejected() {
        let mut r = Response::new(HttpVersion::H1_1, Status::r#Ok, empty_chain());
        r.push(b"hi".to_vec()).unwrap();
        assert!(r.set_header("X", "y").is_err());
    }

    #[test]
    fn encode_includes_content_length_and_date() {
        let clock = Clock::new();
        let mut r = Response::new(HttpVersion::H1_1, Status::r#Ok, empty_chain());
        r.end(Some(b"hello".to_vec())).unwrap();
        let bytes = r.encode_h1(false, &clock);
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Length: 5\r\n"));
        assert!(text.ends_with("hello"));
    }

    #[test]
    fn encode_forces_connection_close_when_requested() {
        let clock = Clock::new();
        let mut r = Response::new(HttpVersion::H1_1, Status::ServiceUnavailable, empty_chain());
        r.end(None).unwrap();
        let bytes = r.encode_h1(true, &clock);
        assert!(String::from_utf8_lossy(&bytes).contains("Connection: close\r\n"));
    }

    struct AlwaysFails;
    impl crate::filter::Filter for AlwaysFails {
        fn key(&self) -> &'static str {
            "boom"
        }
        fn apply(&mut self, _: Vec<u8>) -> Result<Vec<u8>, CoreError> {
            Err(CoreError::Application {
                filter_key: Some("boom"),
                message: "nope".into(),
            })
        }
    }

    #[test]
    fn push_failure_on_first_chunk_leaves_response_not_started() {
        let chain = FilterChain::compose(vec![Box::new(AlwaysFails)], vec![], &[]);
        let mut r = Response::new(HttpVersion::H1_1, Status::r#Ok, chain);
        assert!(r.push(b"hi".to_vec()).is_err());
        assert_eq!(r.state(), ResponseState::NotStarted);
    }

    #[test]
    fn set_reason_overrides_default_reason() {
        let mut r = Response::new(HttpVersion::H1_1, Status::BadRequest, empty_chain());
        r.set_reason("Bad Request: Invalid Host").unwrap();
        assert_eq!(r.reason(), "Bad Request: Invalid Host");
    }
}
