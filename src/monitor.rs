//! Read-only server snapshot (C13).
//!
//! No teacher equivalent: `multilistener.rs` exposes no introspection at
//! all. Shape follows spec.md section 6 directly — a flat, cheaply cloned
//! record handed to every [`crate::server::Observer`] on each state change
//! or tick, not a live handle back into the server's own state.

use std::net::SocketAddr;

use crate::server::ServerState;

#[derive(Debug, Clone)]
pub struct ServerSnapshot {
    pub state: ServerState,
    pub bindings: Vec<SocketAddr>,
    pub clients: usize,
    pub unique_ip_blocks: usize,
    pub pending_inputs: usize,
    pub hosts: Vec<String>,
    pub uptime: std::time::Duration,
}
