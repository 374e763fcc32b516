use anyhow::{Context as _, Result};
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;

use crate::peers::PassivePeer;

/// Reads and resolves the peer file into a fresh roster.
///
/// One host per line; blank lines are tolerated. Only addresses of a family
/// we actually participate in are considered. Transactional: any resolution
/// failure fails the whole load, leaving the caller's current roster in
/// place.
pub fn load_roster(
    path: &Path,
    port: u16,
    v4_enabled: bool,
    v6_enabled: bool,
) -> Result<HashMap<IpAddr, PassivePeer>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read peer file `{}`", path.display()))?;

    let mut roster = HashMap::new();

    for host in contents.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let addrs = resolve_host(host, port).with_context(|| format!("Failed to resolve `{host}`"))?;

        let selected = addrs.into_iter().find(|addr| match addr.ip() {
            IpAddr::V4(_) => v4_enabled,
            IpAddr::V6(_) => v6_enabled,
        });

        let Some(addr) = selected else {
            tracing::warn!(%host, "No address within a configured family; skipping");
            continue;
        };

        roster.insert(
            addr.ip(),
            PassivePeer {
                host: host.to_owned(),
                addr,
            },
        );
    }

    Ok(roster)
}

/// Address-family-agnostic resolution with a numeric service, i.e. plain
/// `getaddrinfo` the way the C library intends it to be used.
fn resolve_host(host: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
    use dns_lookup::AddrInfoHints;

    let service = port.to_string();

    let addrs = dns_lookup::getaddrinfo(
        Some(host),
        Some(&service),
        Some(AddrInfoHints {
            socktype: libc::SOCK_STREAM,
            flags: libc::AI_NUMERICSERV,
            ..Default::default()
        }),
    )
    .map_err(io::Error::from)?
    .collect::<io::Result<Vec<_>>>()?;

    Ok(addrs.into_iter().map(|info| info.sockaddr).collect())
}
