use ipnet::Ipv4Net;
use pkg_constants::network as net;
use std::ops::RangeInclusive;

/// Runtime settings shared by every reconciliation.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// ClusterIPs are allocated from this network.
    pub service_cidr: Ipv4Net,
    /// Pod network; traffic to a ClusterIP from outside it is masqueraded.
    pub cluster_cidr: Ipv4Net,
    /// When set, only pods scheduled on this node are watched.
    pub node_name: Option<String>,
    pub node_port_range: RangeInclusive<u16>,
    /// Upper bound on reconciliations running at once.
    pub workers: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            service_cidr: net::DEFAULT_SERVICE_CIDR.parse().unwrap_or_default(),
            cluster_cidr: net::DEFAULT_CLUSTER_CIDR.parse().unwrap_or_default(),
            node_name: None,
            node_port_range: net::NODE_PORT_RANGE_START..=net::NODE_PORT_RANGE_END,
            workers: net::DEFAULT_PROXY_WORKERS,
        }
    }
}
