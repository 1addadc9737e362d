//! Request pipeline: pre-app dispatch ordering and per-request bookkeeping
//! (C8), plus the response-side orchestration describe in section 4.6 (C9)
//! that ties a dispatched request to a [`Response`].
//!
//! Grounded on `examples/ryanseipp-rask-old/src/multilistener.rs`'s
//! `event()` dispatch point (`// TODO: handle routing for request handlers
//! here`), generalized into the full pre-app ordering table.

use std::time::Duration;

use crate::clock::Clock;
use crate::connection::StreamId;
use crate::driver::{Header, RequestHead};
use crate::error::CoreError;
use crate::filter::FilterChain;
use crate::options::Options;
use crate::parser::status::Status;
use crate::parser::{HttpMethod, HttpVersion};
use crate::response::{Response, ResponseState};
use crate::vhost::VirtualHostRegistry;

/// The immutable envelope handed to application code: everything about one
/// request except the raw body bytes, which the caller streams separately
/// through the connection's body emitter.
pub struct Request {
    pub connection_id: usize,
    pub stream_id: StreamId,
    pub head: RequestHead,
    pub cookies: Vec<(String, String)>,
    pub arrived: Duration,
    pub http_date: String,
    /// The fully received entity body, empty for requests with none. The
    /// pipeline only dispatches once the driver has reported
    /// `EntityComplete`, so applications never see a partial body.
    pub body: Vec<u8>,
}

impl Request {
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.head.header(name)
    }
}

/// Outcome of dispatching one request through the pipeline: the response to
/// write, and whether the connection must close afterward regardless of the
/// response's own `Connection` header (e.g. a 503 during shutdown, or an
/// unrecoverable parse/filter failure).
pub struct Dispatched {
    pub response: Response,
    pub force_close: bool,
}

/// Runs the full pre-app ordering table, falling through to the matched
/// vhost's [`Application`](crate::vhost::Application) when nothing short-
/// circuits. `bad_filter_keys` accumulates across the filter-recovery loop
/// for this one response; callers start with an empty slice.
#[allow(clippy::too_many_arguments)]
pub fn dispatch(
    head: RequestHead,
    body: Vec<u8>,
    connection_id: usize,
    stream_id: StreamId,
    options: &Options,
    hosts: &mut VirtualHostRegistry,
    clock: &Clock,
    shutting_down: bool,
    driver_filters: impl Fn() -> Vec<Box<dyn crate::filter::Filter>>,
) -> Dispatched {
    let method = head.method;

    if shutting_down {
        return pre_app(Status::ServiceUnavailable, &[], true, &driver_filters);
    }

    // `options.normalize_method_case` is a no-op here: `head.method` is
    // already the canonical uppercase `HttpMethod` the H1 driver matched, or
    // the request never reached this point. See `Options::normalize_method_case`.
    if !options.allowed_methods.contains(&method) {
        let allow = join_methods(&options.allowed_methods);
        return pre_app(
            Status::MethodNotAllowed,
            &[("Allow".to_string(), allow.into_bytes())],
            false,
            &driver_filters,
        );
    }

    let host_header = head
        .header("host")
        .map(|v| String::from_utf8_lossy(v).into_owned());
    let host_index = host_header.as_deref().and_then(|h| hosts.select(h));

    let Some(host_index) = host_index else {
        return pre_app_with_reason(
            Status::BadRequest,
            Some("Bad Request: Invalid Host"),
            &[],
            true,
            &driver_filters,
        );
    };

    if method == HttpMethod::Trace {
        return trace_response(&head, &driver_filters);
    }

    if method == HttpMethod::Options && head.target == "*" {
        let allow = join_methods(&options.allowed_methods);
        return pre_app(
            Status::r#Ok,
            &[("Allow".to_string(), allow.into_bytes())],
            false,
            &driver_filters,
        );
    }

    let cookies = head.cookies();
    let arrived = clock.uptime();
    let http_date = clock.http_date().to_string();
    let request = Request {
        connection_id,
        stream_id,
        head,
        cookies,
        arrived,
        http_date,
        body,
    };

    let mut bad_filter_keys: Vec<&'static str> = Vec::new();
    loop {
        let host = hosts.get_mut(host_index).expect("host_index was just resolved");
        let chain = FilterChain::compose(driver_filters(), (host.filter_factory)(), &bad_filter_keys);
        let mut response = Response::new(HttpVersion::H1_1, Status::r#Ok, chain);

        match host.application.handle(&request, &mut response) {
            Ok(()) => {
                match response.state() {
                    ResponseState::NotStarted => {
                        return pre_app(Status::NotFound, &[], false, &driver_filters);
                    }
                    ResponseState::Started => {
                        let _ = response.end(None);
                        return Dispatched {
                            response,
                            force_close: false,
                        };
                    }
                    ResponseState::Ended => {
                        return Dispatched {
                            response,
                            force_close: false,
                        };
                    }
                }
            }
            Err(e) if e.is_client_disconnect() => {
                return Dispatched {
                    response,
                    force_close: true,
                };
            }
            Err(CoreError::Application {
                filter_key: Some(key),
                ..
            }) if response.state() == ResponseState::NotStarted => {
                bad_filter_keys.push(key);
                continue;
            }
            Err(e) => {
                if response.state() != ResponseState::NotStarted {
                    return Dispatched {
                        response,
                        force_close: true,
                    };
                }
                let body = if options.debug {
                    format!("<pre>{}</pre>", html_escape(&e.to_string())).into_bytes()
                } else {
                    Vec::new()
                };
                let mut err_resp = pre_app(Status::InternalServerError, &[], false, &driver_filters);
                let _ = err_resp.response.end(Some(body));
                return err_resp;
            }
        }
    }
}

fn pre_app(
    status: Status,
    extra_headers: &[(String, Vec<u8>)],
    close: bool,
    driver_filters: &impl Fn() -> Vec<Box<dyn crate::filter::Filter>>,
) -> Dispatched {
    pre_app_with_reason(status, None, extra_headers, close, driver_filters)
}

/// Like [`pre_app`], but overrides the status's default reason phrase (e.g.
/// spec section 4.5's "Bad Request: Invalid Host" for a failed host match,
/// distinct from the generic "Bad Request").
fn pre_app_with_reason(
    status: Status,
    reason: Option<&str>,
    extra_headers: &[(String, Vec<u8>)],
    close: bool,
    driver_filters: &impl Fn() -> Vec<Box<dyn crate::filter::Filter>>,
) -> Dispatched {
    let chain = FilterChain::compose(driver_filters(), Vec::new(), &[]);
    let mut response = Response::new(HttpVersion::H1_1, status, chain);
    if let Some(reason) = reason {
        let _ = response.set_reason(reason);
    }
    for (name, value) in extra_headers {
        let _ = response.set_header(name.clone(), value.clone());
    }
    if close {
        let _ = response.set_header("Connection", "close");
    }
    let _ = response.end(None);
    Dispatched {
        response,
        force_close: close,
    }
}

fn trace_response(
    head: &RequestHead,
    driver_filters: &impl Fn() -> Vec<Box<dyn crate::filter::Filter>>,
) -> Dispatched {
    let chain = FilterChain::compose(driver_filters(), Vec::new(), &[]);
    let mut response = Response::new(HttpVersion::H1_1, Status::r#Ok, chain);
    let _ = response.set_header("Content-Type", "message/http");
    let mut body = format!("{} {} {}\r\n", head.method, head.target, head.version).into_bytes();
    for Header { name, value } in &head.headers {
        body.extend_from_slice(name.as_bytes());
        body.extend_from_slice(b": ");
        body.extend_from_slice(value);
        body.extend_from_slice(b"\r\n");
    }
    let _ = response.end(Some(body));
    Dispatched {
        response,
        force_close: false,
    }
}

fn join_methods(methods: &[HttpMethod]) -> String {
    methods
        .iter()
        .map(|m| m.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::Header as DriverHeader;
    use crate::parser::HttpVersion;
    use crate::vhost::{Application, VirtualHost};

    struct Echo;
    impl Application for Echo {
        fn handle(&mut self, _req: &Request, resp: &mut Response) -> Result<(), CoreError> {
            resp.end(Some(b"hi".to_vec()))
        }
    }

    fn head(method: HttpMethod, target: &str, host: Option<&str>) -> RequestHead {
        let mut headers = Vec::new();
        if let Some(h) = host {
            headers.push(DriverHeader {
                name: "Host".to_string(),
                value: h.as_bytes().to_vec(),
            });
        }
        RequestHead {
            method,
            target: target.to_string(),
            version: HttpVersion::H1_1,
            headers,
        }
    }

    fn registry_with_echo() -> VirtualHostRegistry {
        let mut r = VirtualHostRegistry::new();
        r.register(VirtualHost {
            name: "example.org".to_string(),
            application: Box::new(Echo),
            filter_factory: Box::new(Vec::new),
        });
        r
    }

    fn no_filters() -> Vec<Box<dyn crate::filter::Filter>> {
        Vec::new()
    }

    struct AlwaysFailsFilter;
    impl crate::filter::Filter for AlwaysFailsFilter {
        fn key(&self) -> &'static str {
            "boom"
        }
        fn apply(&mut self, _: Vec<u8>) -> Result<Vec<u8>, CoreError> {
            Err(CoreError::Application {
                filter_key: Some("boom"),
                message: "boom".into(),
            })
        }
    }

    #[test]
    fn shutdown_short_circuits_to_503() {
        let opts = Options::new();
        let mut hosts = registry_with_echo();
        let clock = Clock::new();
        let d = dispatch(
            head(HttpMethod::Get, "/", Some("example.org")),
            Vec::new(),
            1,
            0,
            &opts,
            &mut hosts,
            &clock,
            true,
            no_filters,
        );
        assert_eq!(d.response.status(), 503);
        assert!(d.force_close);
    }

    #[test]
    fn invalid_host_yields_400() {
        let opts = Options::new();
        let mut hosts = registry_with_echo();
        let clock = Clock::new();
        let d = dispatch(
            head(HttpMethod::Get, "/", Some("nope.org")),
            Vec::new(),
            1,
            0,
            &opts,
            &mut hosts,
            &clock,
            false,
            no_filters,
        );
        assert_eq!(d.response.status(), 400);
        assert_eq!(d.response.reason(), "Bad Request: Invalid Host");
    }

    #[test]
    fn trace_echoes_request_line() {
        let opts = Options::new();
        let mut hosts = registry_with_echo();
        let clock = Clock::new();
        let d = dispatch(
            head(HttpMethod::Trace, "/x", Some("example.org")),
            Vec::new(),
            1,
            0,
            &opts,
            &mut hosts,
            &clock,
            false,
            no_filters,
        );
        assert_eq!(d.response.status(), 200);
    }

    #[test]
    fn options_star_returns_allow_header() {
        let opts = Options::new();
        let mut hosts = registry_with_echo();
        let clock = Clock::new();
        let d = dispatch(
            head(HttpMethod::Options, "*", Some("example.org")),
            Vec::new(),
            1,
            0,
            &opts,
            &mut hosts,
            &clock,
            false,
            no_filters,
        );
        assert_eq!(d.response.status(), 200);
    }

    #[test]
    fn method_not_allowed_yields_405() {
        let mut opts = Options::new();
        opts.allowed_methods = vec![HttpMethod::Get];
        let mut hosts = registry_with_echo();
        let clock = Clock::new();
        let d = dispatch(
            head(HttpMethod::Delete, "/", Some("example.org")),
            Vec::new(),
            1,
            0,
            &opts,
            &mut hosts,
            &clock,
            false,
            no_filters,
        );
        assert_eq!(d.response.status(), 405);
    }

    #[test]
    fn application_dispatch_succeeds() {
        let opts = Options::new();
        let mut hosts = registry_with_echo();
        let clock = Clock::new();
        let d = dispatch(
            head(HttpMethod::Get, "/", Some("example.org")),
            Vec::new(),
            1,
            0,
            &opts,
            &mut hosts,
            &clock,
            false,
            no_filters,
        );
        assert_eq!(d.response.status(), 200);
    }

    #[test]
    fn filter_recovery_blacklists_and_retries() {
        let opts = Options::new();
        let mut hosts = VirtualHostRegistry::new();
        hosts.register(VirtualHost {
            name: "example.org".to_string(),
            application: Box::new(Echo),
            filter_factory: Box::new(|| vec![Box::new(AlwaysFailsFilter) as Box<dyn crate::filter::Filter>]),
        });
        let clock = Clock::new();
        let d = dispatch(
            head(HttpMethod::Get, "/", Some("example.org")),
            Vec::new(),
            1,
            0,
            &opts,
            &mut hosts,
            &clock,
            false,
            no_filters,
        );
        // The first attempt's chain includes the always-failing filter; since
        // it throws before any byte made it through (response stays
        // `NotStarted`), the retry excludes it and the response completes.
        assert_eq!(d.response.status(), 200);
        assert!(!d.force_close);
    }
}
