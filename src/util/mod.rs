use local_ip_address::list_afinet_netifas;
use std::net::{IpAddr, SocketAddr};
use str0m::{net::Protocol, Candidate};
use systemstat::{Platform, System};
use tracing::{debug, warn};

/// Pick an IPv4 address that can be shared with a remote ICE peer.
///
/// Iterates over all network interfaces provided by `systemstat`, skipping any
/// loopback, link-local or broadcast addresses. Returns `None` when the host
/// exposes no routable IPv4 interface.
pub fn select_host_address() -> Option<IpAddr> {
    let system = System::new();
    let networks = match system.networks() {
        Ok(networks) => networks,
        Err(e) => {
            warn!("Failed to list network interfaces: {}", e);
            return None;
        }
    };

    for net in networks.values() {
        for n in &net.addrs {
            if let systemstat::IpAddr::V4(v) = n.addr {
                if !v.is_loopback() && !v.is_link_local() && !v.is_broadcast() {
                    return Some(IpAddr::V4(v));
                }
            }
        }
    }

    None
}

/// Host candidates for a UDP socket bound to `local`.
///
/// A socket bound to a concrete address yields exactly that candidate. A
/// wildcard bind is expanded to every non-loopback IPv4 interface.
pub fn host_candidates(local: SocketAddr) -> Vec<Candidate> {
    let addrs: Vec<SocketAddr> = if local.ip().is_unspecified() {
        interface_addrs()
            .into_iter()
            .map(|ip| SocketAddr::new(ip, local.port()))
            .collect()
    } else {
        vec![local]
    };

    let mut candidates = Vec::with_capacity(addrs.len());
    for addr in addrs {
        match Candidate::host(addr, Protocol::Udp) {
            Ok(candidate) => candidates.push(candidate),
            Err(e) => warn!("Skipping host candidate {}: {:?}", addr, e),
        }
    }

    candidates
}

fn interface_addrs() -> Vec<IpAddr> {
    let mut addrs = vec![];
    if let Ok(network_interfaces) = list_afinet_netifas() {
        for (name, ip) in network_interfaces {
            debug!("iface: {} / {:?}", name, ip);
            if let IpAddr::V4(ip4) = ip {
                if !ip4.is_loopback() && !ip4.is_link_local() {
                    addrs.push(ip);
                }
            }
        }
    }
    addrs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concrete_bind_yields_single_candidate() {
        let local: SocketAddr = "10.0.0.5:40000".parse().unwrap();
        let candidates = host_candidates(local);

        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].addr(), local);
    }
}
