//! Tunnel route specifications
//!
//! A route maps a rendezvous-side port onto a local service. Two textual
//! forms are accepted:
//!
//! - `R:<remotePort>:<localHost>:<localPort>` (remote forward)
//! - `<localHost>:<localPort>` (remote port assigned by the server)
//!
//! `localhost` is normalised to `127.0.0.1` so that both spellings of the
//! same local service collapse onto one canonical key.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TunnelError;

/// Loopback host used for locally exposed services
pub const LOOPBACK: &str = "127.0.0.1";

/// A single reverse-tunnel route
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RouteSpec {
    /// Port requested on the rendezvous side (0 = server assigned)
    pub remote_port: u16,
    /// Local host the forwarded traffic is delivered to
    pub local_host: String,
    /// Local port the forwarded traffic is delivered to
    pub local_port: u16,
}

impl RouteSpec {
    /// Route to a loopback port with a server-assigned remote port
    pub fn loopback(local_port: u16) -> Self {
        Self {
            remote_port: 0,
            local_host: LOOPBACK.to_string(),
            local_port,
        }
    }

    /// Route with an explicit remote port
    pub fn remote(remote_port: u16, local_host: &str, local_port: u16) -> Self {
        Self {
            remote_port,
            local_host: normalize_host(local_host),
            local_port,
        }
    }

    /// Canonical `host:port` key of the local side
    pub fn key(&self) -> String {
        format!("{}:{}", self.local_host, self.local_port)
    }

    /// Address to dial when a forwarded connection arrives
    pub fn local_addr(&self) -> String {
        self.key()
    }
}

impl fmt::Display for RouteSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "R:{}:{}:{}",
            self.remote_port, self.local_host, self.local_port
        )
    }
}

impl FromStr for RouteSpec {
    type Err = TunnelError;

    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| TunnelError::InvalidRoute {
            spec: spec.to_string(),
            reason: reason.to_string(),
        };

        let parts: Vec<&str> = spec.trim().split(':').collect();
        match parts.as_slice() {
            ["R", remote, host, local] => {
                let remote_port = parse_port(remote).ok_or_else(|| invalid("bad remote port"))?;
                let local_port = parse_port(local)
                    .filter(|p| *p != 0)
                    .ok_or_else(|| invalid("bad local port"))?;
                if host.is_empty() {
                    return Err(invalid("empty local host"));
                }
                Ok(Self::remote(remote_port, host, local_port))
            }
            [host, local] if *host != "R" => {
                let local_port = parse_port(local)
                    .filter(|p| *p != 0)
                    .ok_or_else(|| invalid("bad local port"))?;
                if host.is_empty() {
                    return Err(invalid("empty local host"));
                }
                Ok(Self::remote(0, host, local_port))
            }
            _ => Err(invalid("expected R:<remote>:<host>:<local> or <host>:<local>")),
        }
    }
}

fn parse_port(s: &str) -> Option<u16> {
    s.parse::<u16>().ok()
}

fn normalize_host(host: &str) -> String {
    if host.eq_ignore_ascii_case("localhost") {
        LOOPBACK.to_string()
    } else {
        host.to_string()
    }
}
