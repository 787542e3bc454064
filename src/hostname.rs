//! Externally reachable hostname for fixture instances
//!
//! An explicit hostname (per instance, then fixture-wide) always wins. Otherwise
//! the machine hostname is resolved to an IPv4 address so other processes on
//! the network can reach the instance. Resolution is unreliable in sandboxed CI
//! environments, so any failure falls back to loopback.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, ToSocketAddrs};
use tracing::{debug, warn};

/// Address used when the machine hostname cannot be resolved
pub const FALLBACK_HOST: &str = "127.0.0.1";

/// Pick the hostname for an instance from the overrides in priority order
pub fn choose(instance: Option<&str>, fixture: Option<&str>) -> String {
    if let Some(host) = instance.or(fixture) {
        return host.to_string();
    }

    match resolve_machine_address() {
        Some(addr) => addr.to_string(),
        None => {
            warn!(fallback = FALLBACK_HOST, "Could not resolve machine hostname, using loopback");
            FALLBACK_HOST.to_string()
        }
    }
}

/// The machine's hostname as reported by the OS
#[cfg(unix)]
pub fn machine_hostname() -> Option<String> {
    let mut buf = [0u8; 256];
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if rc != 0 {
        return None;
    }
    let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    let name = String::from_utf8_lossy(&buf[..len]).trim().to_string();
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

#[cfg(not(unix))]
pub fn machine_hostname() -> Option<String> {
    std::env::var("COMPUTERNAME").ok().filter(|s| !s.is_empty())
}

/// Resolve the machine hostname to its first IPv4 address
pub fn resolve_machine_address() -> Option<IpAddr> {
    let name = machine_hostname()?;
    let addr = (name.as_str(), 0)
        .to_socket_addrs()
        .ok()?
        .map(|sa| sa.ip())
        .find(|ip| ip.is_ipv4());
    debug!(hostname = %name, ?addr, "Resolved machine hostname");
    addr
}

/// Address to use when connecting to an instance bound on `host`
pub fn connect_host(host: &str) -> String {
    match host.parse::<IpAddr>() {
        Ok(ip) if ip.is_unspecified() => Ipv4Addr::LOCALHOST.to_string(),
        _ => host.to_string(),
    }
}

/// `host:port`, with IPv6 literals bracketed
pub fn authority(host: &str, port: u16) -> String {
    if host.parse::<Ipv6Addr>().is_ok() {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Root URL a client should use for an instance bound on `host`
pub fn http_uri(host: &str, port: u16) -> String {
    format!("http://{}", authority(&connect_host(host), port))
}
