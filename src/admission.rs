//! Global and per-IP-block connection admission counters.
//!
//! IPv4 addresses are tracked whole; IPv6 addresses are aggregated to their
//! first 7 bytes (roughly a /56), matching the design doc's quota policy.
//! Both counters move together: a connection that crosses either cap rolls
//! both increments back rather than leaving the pair inconsistent.

use std::collections::HashMap;
use std::net::IpAddr;

/// Key used for per-IP(-block) admission accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpBlock {
    V4([u8; 4]),
    V6([u8; 7]),
}

impl From<IpAddr> for IpBlock {
    fn from(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(v4) => IpBlock::V4(v4.octets()),
            IpAddr::V6(v6) => {
                let o = v6.octets();
                IpBlock::V6([o[0], o[1], o[2], o[3], o[4], o[5], o[6]])
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct AdmissionCounters {
    global: usize,
    per_block: HashMap<IpBlock, usize>,
    max_connections: usize,
    connections_per_ip: usize,
}

/// Outcome of [`AdmissionCounters::try_admit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    GlobalCapReached,
    PerIpCapReached,
}

impl AdmissionCounters {
    pub fn new(max_connections: usize, connections_per_ip: usize) -> Self {
        AdmissionCounters {
            global: 0,
            per_block: HashMap::new(),
            max_connections,
            connections_per_ip,
        }
    }

    /// Attempts to admit a connection from `addr`. `None` addr (e.g. a Unix
    /// socket) skips per-block accounting entirely, matching the design
    /// doc's "Unix-domain listeners skip IP-block accounting" rule.
    ///
    /// The Nth connection is admitted, the (N+1)th is denied: caps are
    /// inclusive, checked by post-increment comparison, with both counters
    /// rolled back together on denial.
    pub fn try_admit(&mut self, addr: Option<IpAddr>) -> Admission {
        self.global += 1;
        if self.global > self.max_connections {
            self.global -= 1;
            return Admission::GlobalCapReached;
        }

        let Some(addr) = addr else {
            return Admission::Admitted;
        };
        let block = IpBlock::from(addr);
        let count = self.per_block.entry(block).or_insert(0);
        *count += 1;
        if *count > self.connections_per_ip {
            *count -= 1;
            if *count == 0 {
                self.per_block.remove(&block);
            }
            self.global -= 1;
            return Admission::PerIpCapReached;
        }
        Admission::Admitted
    }

    /// Releases a previously admitted connection. `addr` must match what was
    /// passed to the `try_admit` call that admitted it.
    pub fn release(&mut self, addr: Option<IpAddr>) {
        self.global = self.global.saturating_sub(1);
        if let Some(addr) = addr {
            let block = IpBlock::from(addr);
            if let Some(count) = self.per_block.get_mut(&block) {
                *count -= 1;
                if *count == 0 {
                    self.per_block.remove(&block);
                }
            }
        }
    }

    pub fn global_count(&self) -> usize {
        self.global
    }

    pub fn unique_ip_blocks(&self) -> usize {
        self.per_block.len()
    }

    pub fn per_block_count(&self, addr: IpAddr) -> usize {
        self.per_block.get(&IpBlock::from(addr)).copied().unwrap_or(0)
    }
}
