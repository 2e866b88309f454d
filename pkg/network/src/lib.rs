//! First-fit address allocators for ClusterIPs and NodePorts.

pub mod allocator;

pub use allocator::{AllocationError, next_cluster_ip, next_node_port};
