//! Deterministic port allocation.
//!
//! A project name hashes to a starting port in `[10240, 49151]`; probing
//! walks forward (wrapping at the top of the range) until a bindable port
//! is found. The hash-derived start is what keeps a project's port stable
//! across runs and daemon restarts.

use std::net::{Ipv4Addr, TcpListener};

use sha2::{Digest, Sha256};
use thiserror::Error;

pub const MIN_PORT: u16 = 10240;
pub const MAX_PORT: u16 = 49151;
const PORT_RANGE: u32 = (MAX_PORT - MIN_PORT) as u32 + 1;

/// Well-known development ports that are never allocated, so a faa-managed
/// server cannot shadow a framework's default.
const AVOID_PORTS: [u16; 9] = [3000, 4000, 4321, 5000, 5173, 8000, 8080, 8787, 9229];

#[derive(Error, Debug)]
pub enum PortError {
    #[error("no free port found in range {MIN_PORT}-{MAX_PORT}")]
    Exhausted,
}

/// Pick a deterministic free port for `name`, probing with the real bind
/// oracle.
pub fn stable_port(name: &str) -> Result<u16, PortError> {
    stable_port_with(name, is_port_free)
}

/// Pick a deterministic port for `name`, using `is_free` as the occupancy
/// oracle. Starts at the hash-derived port and increments with wrap-around,
/// skipping the avoid-set, until `is_free` accepts one; errors after a full
/// cycle.
pub fn stable_port_with(name: &str, mut is_free: impl FnMut(u16) -> bool) -> Result<u16, PortError> {
    let mut port = initial_port(name);

    for _ in 0..PORT_RANGE {
        if !AVOID_PORTS.contains(&port) && is_free(port) {
            return Ok(port);
        }
        port = if port == MAX_PORT { MIN_PORT } else { port + 1 };
    }

    Err(PortError::Exhausted)
}

/// The hash-derived starting port for `name`: the first four bytes of
/// `SHA-256(name)`, big-endian, mapped onto the port range.
fn initial_port(name: &str) -> u16 {
    let digest = Sha256::digest(name.as_bytes());
    let hash = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    MIN_PORT + (hash % PORT_RANGE) as u16
}

/// Whether a TCP port can currently be bound on all interfaces.
pub fn is_port_free(port: u16) -> bool {
    TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).is_ok()
}
