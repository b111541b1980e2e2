//! Locally derivable host facts
//!
//! Everything the derivation needs from the running host is gathered once
//! into [`SystemFacts`], so the derivation itself stays a pure function.

use crate::memory;
use common::Environment;
use std::net::{IpAddr, Ipv4Addr, TcpListener};
use std::path::Path;
use std::thread;
use tracing::{debug, warn};

/// Host facts gathered before placeholder derivation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemFacts {
    pub home_dir: String,
    pub hostname: String,
    pub host_ip: String,
    pub cpu_count: usize,
    pub memory_mb: u64,
    /// Wildcard address for listeners without dual-stack detection
    pub listen_ip: String,
}

impl SystemFacts {
    /// Detect facts from the running host.
    pub fn detect(env: &Environment) -> Self {
        let hostname = dns_lookup::get_hostname().unwrap_or_else(|e| {
            warn!(error = %e, "Could not determine hostname");
            "localhost".to_string()
        });
        let host_ip = resolve_host(&hostname);

        let facts = Self {
            home_dir: env.get_or("HOME", "/home/postgres").to_string(),
            host_ip,
            hostname,
            cpu_count: thread::available_parallelism().map(usize::from).unwrap_or(1),
            memory_mb: memory::usable_memory_mb(Path::new("/")),
            listen_ip: listen_ip(),
        };
        debug!(?facts, "Detected host facts");
        facts
    }
}

/// Whether the instance runs under container orchestration.
pub fn is_orchestrated(env: &Environment) -> bool {
    env.contains("KUBERNETES_SERVICE_HOST")
}

/// First address the hostname resolves to.
fn resolve_host(hostname: &str) -> String {
    match dns_lookup::lookup_host(hostname) {
        Ok(addrs) => addrs
            .first()
            .map(IpAddr::to_string)
            .unwrap_or_else(|| Ipv4Addr::LOCALHOST.to_string()),
        Err(e) => {
            warn!(hostname, error = %e, "Could not resolve own hostname");
            Ipv4Addr::LOCALHOST.to_string()
        }
    }
}

/// `::` when an IPv6 wildcard socket can be bound, `0.0.0.0` otherwise.
fn listen_ip() -> String {
    match TcpListener::bind("[::]:0") {
        Ok(_) => "::".to_string(),
        Err(e) => {
            debug!(error = %e, "IPv6 unavailable, listening on IPv4");
            "0.0.0.0".to_string()
        }
    }
}

#[cfg(test)]
impl SystemFacts {
    /// Fixed facts for derivation tests.
    pub fn fixture() -> Self {
        Self {
            home_dir: "/home/postgres".to_string(),
            hostname: "spilo-0".to_string(),
            host_ip: "10.0.0.5".to_string(),
            cpu_count: 4,
            memory_mb: 9000,
            listen_ip: "0.0.0.0".to_string(),
        }
    }
}
