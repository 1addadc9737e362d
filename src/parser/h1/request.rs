// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! HTTP/1.1 request parsing and the reference [`H1Driver`].

use core::str::from_utf8_unchecked;

use super::tokens::{is_header_name_token, is_header_value_token, is_request_target_token};
use super::{discard_newline, discard_whitespace, ParseError, ParseResult};
use crate::driver::{Driver, Header as DriverHeader, ParserEvent, RequestHead};
use crate::parser::raw_request::RawRequest;
use crate::parser::{HttpMethod, HttpVersion};

/// A single parsed header, borrowing the name from the head buffer.
#[derive(Debug, PartialEq, Eq)]
pub struct Header<'buf> {
    pub name: &'buf str,
    pub value: Vec<u8>,
}

/// Parsed H1 request line plus headers, borrowing from the buffer handed to
/// [`H1Request::parse`].
/// IETF RFC 9112
#[derive(Debug, Default)]
pub struct H1Request<'buf> {
    pub method: Option<HttpMethod>,
    pub target: Option<&'buf str>,
    pub version: Option<HttpVersion>,
    pub headers: Vec<Header<'buf>>,
}

impl<'b> H1Request<'b> {
    pub fn new() -> Self {
        H1Request {
            method: None,
            target: None,
            version: None,
            headers: Vec::new(),
        }
    }

    /// Parses a request head: method, target, version, and headers, up to
    /// and including the blank line terminating the header section.
    ///
    /// # Example
    /// ```
    /// # use rask_core::parser::{HttpMethod, HttpVersion};
    /// # use rask_core::parser::h1::ParseError;
    /// # use rask_core::parser::h1::request::H1Request;
    /// # fn main() -> Result<(), ParseError> {
    /// let mut req = H1Request::new();
    /// req.parse(b"GET / HTTP/1.1\r\nHost: example.org\r\n\r\n")?;
    /// assert_eq!(Some(HttpMethod::Get), req.method);
    /// assert_eq!(Some("/"), req.target);
    /// assert_eq!(Some(HttpVersion::H1_1), req.version);
    /// # Ok(())
    /// # }
    /// ```
    pub fn parse(&mut self, buf: &'b [u8]) -> ParseResult<()> {
        let mut req = RawRequest::new(buf);
        self.set_method(&mut req)?;
        self.set_target(&mut req)?;
        self.set_version(&mut req)?;
        discard_newline(&mut req)?;
        self.set_headers(&mut req)?;
        Ok(())
    }

    fn set_method(&mut self, buf: &mut RawRequest<'b>) -> ParseResult<()> {
        if buf.any(|&b| !b.is_ascii_uppercase()) {
            if let Ok(slice) = buf.slice_skip(1) {
                let res = match slice {
                    b"GET" => Ok(HttpMethod::Get),
                    b"HEAD" => Ok(HttpMethod::Head),
                    b"POST" => Ok(HttpMethod::Post),
                    b"PUT" => Ok(HttpMethod::Put),
                    b"DELETE" => Ok(HttpMethod::Delete),
                    b"CONNECT" => Ok(HttpMethod::Connect),
                    b"OPTIONS" => Ok(HttpMethod::Options),
                    b"TRACE" => Ok(HttpMethod::Trace),
                    _ => Err(ParseError::Method),
                }?;

                self.method = Some(res);
                return Ok(());
            }
        }

        Err(ParseError::Method)
    }

    fn set_target(&mut self, buf: &mut RawRequest<'b>) -> ParseResult<()> {
        for &b in &mut *buf {
            if b == b' ' {
                if let Ok(slice) = buf.slice_skip(1) {
                    // SAFETY: every byte up to here passed is_request_target_token,
                    // which only admits ASCII, so this is valid UTF-8.
                    self.target = Some(unsafe { from_utf8_unchecked(slice) });
                    return Ok(());
                }
                break;
            } else if !is_request_target_token(b) {
                break;
            }
        }

        Err(ParseError::Target)
    }

    fn set_version(&mut self, buf: &mut RawRequest<'b>) -> ParseResult<()> {
        let result = if !buf.take(5).eq(b"HTTP/".iter()) {
            Err(ParseError::Version)
        } else {
            match buf.next() {
                Some(b'1') => {
                    if buf.next() == Some(&b'.') {
                        match buf.next() {
                            Some(b'0') => Ok(HttpVersion::H1_0),
                            Some(b'1') => Ok(HttpVersion::H1_1),
                            _ => Err(ParseError::Version),
                        }
                    } else {
                        Err(ParseError::Version)
                    }
                }
                Some(b'2') => Ok(HttpVersion::H2),
                Some(b'3') => Ok(HttpVersion::H3),
                _ => Err(ParseError::Version),
            }
        };

        buf.slice();

        match result {
            Ok(version) => {
                self.version = Some(version);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Parses zero or more `name: value` header lines up to the blank line
    /// terminating the section, which this function also consumes.
    fn set_headers(&mut self, buf: &mut RawRequest<'b>) -> ParseResult<()> {
        loop {
            match buf.peek() {
                None => return Err(ParseError::NewLine),
                Some(b'\r') => {
                    discard_newline(buf)?;
                    return Ok(());
                }
                _ => {}
            }

            let name = buf
                .take_until(|b| b == b':')
                .ok_or(ParseError::HeaderName)?;
            if name.is_empty() || !name.iter().all(|&b| is_header_name_token(b)) {
                return Err(ParseError::HeaderName);
            }
            buf.next(); // consume ':'
            buf.slice();
            discard_whitespace(buf);

            let value = buf
                .take_until(|b| b == b'\r')
                .unwrap_or(&[]);
            if !value.iter().all(|&b| is_header_value_token(b)) {
                return Err(ParseError::HeaderValue);
            }
            let trimmed = trim_ows(value);
            discard_newline(buf)?;

            // SAFETY: every byte passed is_header_name_token, a subset of ASCII.
            let name = unsafe { from_utf8_unchecked(name) };
            self.headers.push(Header {
                name,
                value: trimmed.to_vec(),
            });
        }
    }
}

fn trim_ows(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|&b| b != b' ' && b != b'\t').unwrap_or(bytes.len());
    let end = bytes.iter().rposition(|&b| b != b' ' && b != b'\t').map_or(start, |p| p + 1);
    &bytes[start..end]
}

/// Maximum bytes buffered while awaiting a complete request head before the
/// driver gives up with a 431-equivalent parse error.
const MAX_HEAD_SIZE: usize = 64 * 1024;

#[derive(Debug)]
enum DriverState {
    AwaitingHead,
    StreamingBody { remaining: usize, warned: bool },
    Failed,
}

/// The reference HTTP/1.1 [`Driver`](crate::driver::Driver) implementation.
///
/// Buffers bytes until a complete request head is available, then emits
/// [`ParserEvent::HeadersOnly`] for bodyless requests or
/// [`ParserEvent::EntityHeaders`]/[`ParserEvent::EntityPart`]/
/// [`ParserEvent::EntityComplete`] for requests carrying a `Content-Length`
/// body, streaming chunks as they arrive rather than buffering the whole
/// entity. `Transfer-Encoding: chunked` is not supported and surfaces as a
/// `ParseError::Framing` parse error.
#[derive(Debug)]
pub struct H1Driver {
    buf: Vec<u8>,
    state: DriverState,
    soft_stream_cap: usize,
}

impl Default for H1Driver {
    fn default() -> Self {
        Self::new()
    }
}

impl H1Driver {
    pub fn new() -> Self {
        H1Driver {
            buf: Vec::new(),
            state: DriverState::AwaitingHead,
            soft_stream_cap: usize::MAX,
        }
    }

    fn parse_error(&mut self, status: u16, message: &str, source: ParseError) -> ParserEvent {
        self.state = DriverState::Failed;
        ParserEvent::ParseError {
            status,
            message: message.to_string(),
            source,
        }
    }

    fn try_parse_head(&mut self) -> Option<Result<(RequestHead, usize), ParserEvent>> {
        let idx = find_subslice(&self.buf, b"\r\n\r\n")?;
        let head_len = idx + 4;
        let mut parsed = H1Request::new();
        let result = parsed.parse(&self.buf[..head_len]);
        match result {
            Ok(()) => {
                let head = RequestHead {
                    method: parsed.method.expect("parse() sets method on success"),
                    target: parsed.target.expect("parse() sets target on success").to_string(),
                    version: parsed.version.expect("parse() sets version on success"),
                    headers: parsed
                        .headers
                        .iter()
                        .map(|h| DriverHeader {
                            name: h.name.to_string(),
                            value: h.value.clone(),
                        })
                        .collect(),
                };
                Some(Ok((head, head_len)))
            }
            Err(e) => Some(Err(self.parse_error(e.status(), "malformed request", e))),
        }
    }
}

impl Driver for H1Driver {
    fn feed(&mut self, bytes: &[u8]) -> Vec<ParserEvent> {
        self.buf.extend_from_slice(bytes);
        let mut events = Vec::new();

        loop {
            match &mut self.state {
                DriverState::Failed => break,
                DriverState::AwaitingHead => {
                    if self.buf.len() > MAX_HEAD_SIZE && find_subslice(&self.buf, b"\r\n\r\n").is_none() {
                        events.push(self.parse_error(431, "request head too large", ParseError::Framing));
                        break;
                    }
                    match self.try_parse_head() {
                        None => break,
                        Some(Err(e)) => {
                            events.push(e);
                            break;
                        }
                        Some(Ok((head, head_len))) => {
                            self.buf.drain(..head_len);
                            let content_length = head.header("content-length").map(parse_content_length);
                            let chunked = head
                                .header("transfer-encoding")
                                .map(|v| v.eq_ignore_ascii_case(b"chunked"))
                                .unwrap_or(false);

                            match (content_length, chunked) {
                                (Some(None), _) | (Some(Some(_)), true) => {
                                    events.push(self.parse_error(
                                        400,
                                        "invalid message framing",
                                        ParseError::Framing,
                                    ));
                                    break;
                                }
                                (_, true) => {
                                    events.push(self.parse_error(
                                        501,
                                        "chunked transfer-encoding is not supported",
                                        ParseError::Framing,
                                    ));
                                    break;
                                }
                                (Some(Some(0)), false) | (None, false) => {
                                    events.push(ParserEvent::HeadersOnly(head));
                                    self.state = DriverState::AwaitingHead;
                                }
                                (Some(Some(len)), false) => {
                                    events.push(ParserEvent::EntityHeaders(head));
                                    self.state = DriverState::StreamingBody {
                                        remaining: len,
                                        warned: false,
                                    };
                                }
                            }
                        }
                    }
                }
                DriverState::StreamingBody { remaining, warned } => {
                    if self.buf.is_empty() {
                        break;
                    }
                    let take = (*remaining).min(self.buf.len());
                    if take == 0 {
                        events.push(ParserEvent::EntityComplete);
                        self.state = DriverState::AwaitingHead;
                        continue;
                    }
                    let chunk: Vec<u8> = self.buf.drain(..take).collect();
                    *remaining -= take;
                    if !*warned && chunk.len() > self.soft_stream_cap {
                        events.push(ParserEvent::SizeWarning);
                        *warned = true;
                    }
                    events.push(ParserEvent::EntityPart(chunk));
                    if *remaining == 0 {
                        events.push(ParserEvent::EntityComplete);
                        self.state = DriverState::AwaitingHead;
                    }
                }
            }
        }

        events
    }

    fn set_soft_stream_cap(&mut self, cap: usize) {
        self.soft_stream_cap = cap;
    }
}

fn parse_content_length(raw: &[u8]) -> Option<usize> {
    std::str::from_utf8(raw).ok()?.trim().parse().ok()
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_request_line_and_headers() {
        let mut req = H1Request::new();
        req.parse(b"GET /foo?bar HTTP/1.1\r\nHost: example.org\r\nX-Test:  value  \r\n\r\n")
            .unwrap();
        assert_eq!(req.method, Some(HttpMethod::Get));
        assert_eq!(req.target, Some("/foo?bar"));
        assert_eq!(req.version, Some(HttpVersion::H1_1));
        assert_eq!(req.headers.len(), 2);
        assert_eq!(req.headers[0].name, "Host");
        assert_eq!(req.headers[0].value, b"example.org");
        assert_eq!(req.headers[1].value, b"value");
    }

    #[test]
    fn driver_emits_headers_only_for_bodyless_request() {
        let mut driver = H1Driver::new();
        let events = driver.feed(b"GET / HTTP/1.1\r\nHost: a\r\n\r\n");
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], ParserEvent::HeadersOnly(_)));
    }

    #[test]
    fn driver_streams_entity_body_across_short_reads() {
        let mut driver = H1Driver::new();
        let head = b"POST /x HTTP/1.1\r\nHost: a\r\nContent-Length: 5\r\n\r\n";
        let events = driver.feed(head);
        assert!(matches!(events[0], ParserEvent::EntityHeaders(_)));
        assert_eq!(events.len(), 1);

        let events = driver.feed(b"hel");
        assert_eq!(events, vec![ParserEvent::EntityPart(b"hel".to_vec())]);

        let events = driver.feed(b"lo");
        assert_eq!(
            events,
            vec![ParserEvent::EntityPart(b"lo".to_vec()), ParserEvent::EntityComplete]
        );
    }

    #[test]
    fn driver_handles_pipelined_requests() {
        let mut driver = H1Driver::new();
        let events = driver.feed(b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\n");
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], ParserEvent::HeadersOnly(h) if h.target == "/a"));
        assert!(matches!(&events[1], ParserEvent::HeadersOnly(h) if h.target == "/b"));
    }

    #[test]
    fn driver_rejects_chunked_transfer_encoding() {
        let mut driver = H1Driver::new();
        let events = driver.feed(b"POST /x HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n");
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], ParserEvent::ParseError { status: 501, .. }));
    }

    #[test]
    fn cookies_are_concatenated_and_split() {
        let head = RequestHead {
            method: HttpMethod::Get,
            target: "/".to_string(),
            version: HttpVersion::H1_1,
            headers: vec![
                DriverHeader { name: "Cookie".into(), value: b"a=1; b=2".to_vec() },
                DriverHeader { name: "Cookie".into(), value: b"c=3".to_vec() },
            ],
        };
        let mut cookies = head.cookies();
        cookies.sort();
        assert_eq!(
            cookies,
            vec![
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "2".to_string()),
                ("c".to_string(), "3".to_string()),
            ]
        );
    }
}
