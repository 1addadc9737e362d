//! Validated, lockable configuration.
//!
//! Replaces the "dynamic property bag" the spec's design notes call out:
//! every field is typed up front, `freeze()` is called once at STARTING,
//! and any setter invoked after that point fails instead of silently
//! mutating a running server.

use std::time::Duration;

use crate::error::CoreError;
use crate::parser::HttpMethod;

#[derive(Debug, Clone)]
pub struct Options {
    pub max_connections: usize,
    pub connections_per_ip: usize,
    pub max_requests_per_connection: u32,
    pub connection_timeout: Duration,
    pub socket_backlog_size: u32,
    pub io_granularity: usize,
    pub soft_stream_cap: usize,
    pub hard_stream_cap: usize,
    pub allowed_methods: Vec<HttpMethod>,
    /// Spec section 6: "upper-case methods before dispatch". Carried for
    /// protocol compatibility with drivers that surface a raw method token,
    /// but the bundled H1 driver (`parser::h1::request::set_method`) only
    /// ever produces an `HttpMethod` from an exact-case match against the
    /// canonical uppercase token (RFC 9110 section 9 treats method names as
    /// case-sensitive); any other casing fails to parse before a
    /// `RequestHead` exists at all. There is therefore no case left to
    /// normalize by the time `pipeline::dispatch` runs its method check —
    /// see DESIGN.md's open-question log.
    pub normalize_method_case: bool,
    pub shutdown_timeout: Duration,
    pub debug: bool,
    pub user: Option<String>,
    locked: bool,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            max_connections: 1000,
            connections_per_ip: 100,
            max_requests_per_connection: 1000,
            connection_timeout: Duration::from_secs(10),
            socket_backlog_size: 1024,
            io_granularity: 64 * 1024,
            soft_stream_cap: 8 * 1024,
            hard_stream_cap: 128 * 1024,
            allowed_methods: vec![
                HttpMethod::Get,
                HttpMethod::Head,
                HttpMethod::Post,
                HttpMethod::Put,
                HttpMethod::Delete,
                HttpMethod::Options,
                HttpMethod::Trace,
                HttpMethod::Connect,
            ],
            normalize_method_case: false,
            shutdown_timeout: Duration::from_secs(30),
            debug: false,
            user: None,
            locked: false,
        }
    }
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Validates and locks the record against further mutation. Called once,
    /// from `Server::start`, before any sockets are bound.
    pub fn freeze(&mut self) -> Result<(), CoreError> {
        if self.max_connections == 0 {
            return Err(CoreError::Configuration("max_connections must be > 0"));
        }
        if self.hard_stream_cap < self.soft_stream_cap {
            return Err(CoreError::Configuration(
                "hard_stream_cap must be >= soft_stream_cap",
            ));
        }
        if self.allowed_methods.is_empty() {
            return Err(CoreError::Configuration("allowed_methods must not be empty"));
        }
        self.locked = true;
        Ok(())
    }

    fn check_unlocked(&self) -> Result<(), CoreError> {
        if self.locked {
            Err(CoreError::Configuration("options are locked; call before start()"))
        } else {
            Ok(())
        }
    }

    pub fn set_max_connections(&mut self, n: usize) -> Result<(), CoreError> {
        self.check_unlocked()?;
        self.max_connections = n;
        Ok(())
    }

    pub fn set_connections_per_ip(&mut self, n: usize) -> Result<(), CoreError> {
        self.check_unlocked()?;
        self.connections_per_ip = n;
        Ok(())
    }

    pub fn set_connection_timeout(&mut self, d: Duration) -> Result<(), CoreError> {
        self.check_unlocked()?;
        self.connection_timeout = d;
        Ok(())
    }

    pub fn set_allowed_methods(&mut self, methods: Vec<HttpMethod>) -> Result<(), CoreError> {
        self.check_unlocked()?;
        self.allowed_methods = methods;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn freeze_rejects_zero_max_connections() {
        let mut o = Options::new();
        o.max_connections = 0;
        assert!(o.freeze().is_err());
    }

    #[test]
    fn setters_fail_after_freeze() {
        let mut o = Options::new();
        o.freeze().unwrap();
        assert!(o.set_max_connections(5).is_err());
    }
}
