//! Virtual host registration.
//!
//! Host *selection* — matching a `Host:` header or SNI name to a
//! configured vhost — is explicitly out of scope (an external
//! collaborator); what the core needs is a place to register vhosts and a
//! narrow [`Application`] seam so the request pipeline has something to
//! dispatch to once selection has happened.

use crate::error::CoreError;
use crate::filter::Filter;
use crate::pipeline::Request;
use crate::response::Response;

/// An application handler bound to a vhost. Synchronous, per the
/// single-threaded, non-async model (see DESIGN.md's open question on
/// observer futures — the same reasoning applies here: nothing in this loop
/// can block a sibling callback, so there is no async seam to model).
pub trait Application {
    fn handle(&mut self, request: &Request, response: &mut Response) -> Result<(), CoreError>;
}

/// One registered virtual host: its application handler and a factory for
/// its response filters. Filters are stateful per response (a compressor
/// tracks a running checksum, say), so the registry hands out a fresh set
/// on every dispatch rather than storing built instances.
pub struct VirtualHost {
    pub name: String,
    pub application: Box<dyn Application>,
    pub filter_factory: Box<dyn Fn() -> Vec<Box<dyn Filter>>>,
}

/// The set of vhosts a server instance knows about. `select` is a simple
/// exact-match-on-Host lookup; real host matching (wildcards, SNI fallback)
/// lives outside this crate.
#[derive(Default)]
pub struct VirtualHostRegistry {
    hosts: Vec<VirtualHost>,
}

impl VirtualHostRegistry {
    pub fn new() -> Self {
        VirtualHostRegistry { hosts: Vec::new() }
    }

    pub fn register(&mut self, host: VirtualHost) {
        self.hosts.push(host);
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    pub fn select(&self, host_header: &str) -> Option<usize> {
        let name = host_header.split(':').next().unwrap_or(host_header);
        self.hosts.iter().position(|h| h.name.eq_ignore_ascii_case(name))
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut VirtualHost> {
        self.hosts.get_mut(index)
    }

    pub fn names(&self) -> Vec<&str> {
        self.hosts.iter().map(|h| h.name.as_str()).collect()
    }
}
