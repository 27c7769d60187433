//! Remote-address classification and admission-limit decisions (§4.2).
use std::net::{IpAddr, Ipv6Addr, SocketAddr};

/// A client's remote endpoint, abstracted over transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerAddress {
    Tcp(SocketAddr),
    /// Unix domain sockets have no network identity; always loopback-exempt.
    Unix,
}

/// The packed-bytes key used to bucket clients for the per-network cap.
///
/// IPv4 remotes key on the full 4-byte address (a /32). IPv6 remotes key on
/// the leading 7 bytes (an approximate /56 block) so that a single
/// subscriber's many addresses from one /64-or-wider allocation share a
/// slot. Unix-socket clients get their own sentinel key purely so every
/// client has *some* entry in `clientsPerNet` (invariant §3); they are
/// never subject to the per-net cap because `is_loopback` always returns
/// `true` for them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkKey {
    V4([u8; 4]),
    V6([u8; 7]),
    Unix,
}

/// `true` for 127.0.0.0/8, `::1`, `::ffff:127.0.0.0/104`, and Unix sockets.
pub fn is_loopback(peer: &PeerAddress) -> bool {
    match peer {
        PeerAddress::Unix => true,
        PeerAddress::Tcp(addr) => match addr.ip() {
            IpAddr::V4(v4) => v4.octets()[0] == 127,
            IpAddr::V6(v6) => is_loopback_v6(v6),
        },
    }
}

fn is_loopback_v6(v6: Ipv6Addr) -> bool {
    if v6 == Ipv6Addr::LOCALHOST {
        return true;
    }
    // ::ffff:127.0.0.0/104 — an IPv4-mapped loopback address.
    match v6.to_ipv4_mapped() {
        Some(v4) => v4.octets()[0] == 127,
        None => false,
    }
}

/// Computes the network key used to bucket this peer for per-net accounting.
pub fn network_key(peer: &PeerAddress) -> NetworkKey {
    match peer {
        PeerAddress::Unix => NetworkKey::Unix,
        PeerAddress::Tcp(addr) => match addr.ip() {
            IpAddr::V4(v4) => NetworkKey::V4(v4.octets()),
            IpAddr::V6(v6) => {
                let octets = v6.octets();
                let mut prefix = [0u8; 7];
                prefix.copy_from_slice(&octets[..7]);
                NetworkKey::V6(prefix)
            }
        },
    }
}

/// Why a newly-accepted client was refused admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionDenied {
    /// `clientCount` already equalled `connectionLimit`.
    GlobalLimit,
    /// `clientsPerNet[key]` already equalled `connectionsPerIpLimit` and the
    /// peer is not loopback-exempt.
    PerNetLimit,
}

/// Stateless decision logic over the pre-increment counters held by the
/// orchestrator's bookkeeping. Kept free of the counters themselves so the
/// counters can live next to the rest of the `ClientRegistry` state under a
/// single lock (§4.5).
#[derive(Debug, Clone, Copy)]
pub struct AdmissionController {
    connection_limit: u32,
    connections_per_ip_limit: u32,
}

impl AdmissionController {
    pub fn new(connection_limit: u32, connections_per_ip_limit: u32) -> Self {
        Self {
            connection_limit,
            connections_per_ip_limit,
        }
    }

    /// Checks the global cap against the pre-increment client count.
    pub fn check_global(&self, client_count_before: u32) -> Result<(), AdmissionDenied> {
        if self.connection_limit != 0 && client_count_before >= self.connection_limit {
            Err(AdmissionDenied::GlobalLimit)
        } else {
            Ok(())
        }
    }

    /// Checks the per-network cap against the pre-increment per-net count.
    /// Always admits loopback peers.
    pub fn check_per_net(
        &self,
        peer: &PeerAddress,
        count_before: u32,
    ) -> Result<(), AdmissionDenied> {
        if is_loopback(peer) {
            return Ok(());
        }
        if self.connections_per_ip_limit != 0 && count_before >= self.connections_per_ip_limit {
            Err(AdmissionDenied::PerNetLimit)
        } else {
            Ok(())
        }
    }
}
