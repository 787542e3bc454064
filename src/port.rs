//! Port allocation for fixture instances
//!
//! Candidates are probed downward from a per-server-type seed. Each OS process
//! starts at a pid-derived offset inside the probe window so parallel test
//! workers rarely contend for the same candidates. A candidate is committed only
//! after a bind-and-release probe succeeds, and stays reserved in the
//! allocator's registry until its [`PortLease`] is dropped, so live instances
//! created through one allocator never share a port.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, TcpListener};
use std::sync::{Arc, OnceLock};
use tracing::debug;

use crate::error::{FixtureError, Result};

/// Lowest port ever handed out
pub const PORT_FLOOR: u16 = 1024;

/// Number of distinct candidates below a seed
const PROBE_WINDOW: u32 = 20_000;

/// Default bound on probe attempts per allocation
pub const DEFAULT_PORT_ATTEMPTS: u32 = 100;

/// Allocates bindable, unshared TCP ports
#[derive(Debug)]
pub struct PortAllocator {
    /// Ports currently leased to live instances
    leased: Arc<Mutex<HashSet<u16>>>,
    /// Probe counter per seed
    cursors: Mutex<HashMap<u16, u32>>,
    /// Address used for the bind probe
    probe_addr: IpAddr,
    /// Pid-derived starting offset inside the probe window
    offset: u32,
    max_attempts: u32,
}

/// A reserved port; releases its reservation on drop
#[derive(Debug)]
pub struct PortLease {
    port: u16,
    leased: Arc<Mutex<HashSet<u16>>>,
}

impl PortLease {
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        self.leased.lock().remove(&self.port);
    }
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new(DEFAULT_PORT_ATTEMPTS)
    }
}

impl PortAllocator {
    pub fn new(max_attempts: u32) -> Self {
        // Knuth multiplicative hash spreads neighbouring pids across the window
        let offset = std::process::id().wrapping_mul(2_654_435_761) % PROBE_WINDOW;
        Self {
            leased: Arc::new(Mutex::new(HashSet::new())),
            cursors: Mutex::new(HashMap::new()),
            probe_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            offset,
            max_attempts,
        }
    }

    /// Process-wide allocator shared by every fixture
    pub fn global() -> &'static PortAllocator {
        static GLOBAL: OnceLock<PortAllocator> = OnceLock::new();
        GLOBAL.get_or_init(PortAllocator::default)
    }

    /// Override the address used for bind probes
    pub fn with_probe_addr(mut self, addr: IpAddr) -> Self {
        self.probe_addr = addr;
        self
    }

    /// Override the starting offset inside the probe window
    pub fn with_offset(mut self, offset: u32) -> Self {
        self.offset = offset % PROBE_WINDOW;
        self
    }

    /// Number of ports currently leased
    pub fn leased_count(&self) -> usize {
        self.leased.lock().len()
    }

    /// Reserve a port that is bindable now and not leased to a live instance
    pub fn allocate(&self, seed: u16) -> Result<PortLease> {
        self.allocate_with(seed, self.max_attempts)
    }

    /// Like [`allocate`](Self::allocate) but giving up after `max_attempts` probes
    pub fn allocate_with(&self, seed: u16, max_attempts: u32) -> Result<PortLease> {
        let window = u32::from(seed.saturating_sub(PORT_FLOOR)).min(PROBE_WINDOW);
        if window == 0 {
            return Err(FixtureError::PortExhausted { seed, attempts: 0 });
        }

        // Held across probing so two allocations in this process cannot commit the same port
        let mut leased = self.leased.lock();

        for attempt in 0..max_attempts {
            let step = {
                let mut cursors = self.cursors.lock();
                let cursor = cursors.entry(seed).or_insert(0);
                let step = self.offset.wrapping_add(*cursor) % window;
                *cursor = cursor.wrapping_add(1);
                step
            };
            // step < window <= seed - PORT_FLOOR, so this stays above the floor
            let candidate = seed - step as u16;

            if leased.contains(&candidate) {
                continue;
            }

            match TcpListener::bind((self.probe_addr, candidate)) {
                Ok(listener) => {
                    drop(listener);
                    leased.insert(candidate);
                    debug!(port = candidate, seed, attempt, "Port allocated");
                    return Ok(PortLease {
                        port: candidate,
                        leased: Arc::clone(&self.leased),
                    });
                }
                Err(e) => {
                    debug!(port = candidate, error = %e, "Port probe failed, advancing");
                }
            }
        }

        Err(FixtureError::PortExhausted {
            seed,
            attempts: max_attempts,
        })
    }
}
