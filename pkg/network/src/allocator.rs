//! Stateless first-fit allocation.
//!
//! Nothing is reserved between calls: the current Service list is the only
//! record of what is taken, so two concurrent callers scanning the same list
//! can pick the same value.

use std::net::Ipv4Addr;
use std::ops::RangeInclusive;

use ipnet::Ipv4Net;
use pkg_types::service::Service;
use tracing::debug;

/// Errors that can occur during allocation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AllocationError {
    /// Every usable host address of the CIDR is already a ClusterIP.
    #[error("no cluster IP available in {cidr}")]
    NoClusterIpAvailable {
        /// The CIDR that was scanned.
        cidr: Ipv4Net,
    },
    /// Every port of the NodePort range is already assigned.
    #[error("no node port available in range {start}-{end}")]
    NoNodePortAvailable {
        /// First port of the scanned range.
        start: u16,
        /// Last port of the scanned range.
        end: u16,
    },
    /// The configured CIDR could not be parsed.
    #[error("invalid CIDR: {message}")]
    InvalidCidr {
        /// Description of the error.
        message: String,
    },
}

/// Parse a dotted IPv4 CIDR such as `10.96.0.0/16`.
pub fn parse_cidr(cidr: &str) -> Result<Ipv4Net, AllocationError> {
    cidr.parse::<Ipv4Net>()
        .map_err(|e| AllocationError::InvalidCidr {
            message: format!("{}: {}", cidr, e),
        })
}

/// Return the lowest usable host address of `cidr` that no Service holds as
/// its `clusterIP`. Network and broadcast addresses are never returned.
pub fn next_cluster_ip(cidr: &Ipv4Net, services: &[Service]) -> Result<Ipv4Addr, AllocationError> {
    let taken: Vec<Ipv4Addr> = services
        .iter()
        .filter_map(|s| s.cluster_ip())
        .filter_map(|ip| ip.parse().ok())
        .collect();

    let ip = cidr
        .hosts()
        .find(|candidate| !taken.contains(candidate))
        .ok_or(AllocationError::NoClusterIpAvailable { cidr: *cidr })?;

    debug!("next free cluster IP in {}: {}", cidr, ip);
    Ok(ip)
}

/// Return the lowest port of `range` that no Service port holds as its `nodePort`.
pub fn next_node_port(range: RangeInclusive<u16>, services: &[Service]) -> Result<u16, AllocationError> {
    let taken: Vec<u16> = services
        .iter()
        .flat_map(|s| s.spec.ports.iter())
        .filter_map(|p| p.allocated_node_port())
        .collect();

    let (start, end) = (*range.start(), *range.end());
    let port = range
        .into_iter()
        .find(|candidate| !taken.contains(candidate))
        .ok_or(AllocationError::NoNodePortAvailable { start, end })?;

    debug!("next free node port: {}", port);
    Ok(port)
}
