//! Service network programming for a node: watches Services and Pods and
//! maintains the NAT rules that implement ClusterIP and NodePort load
//! balancing across ready pods.

pub mod chain;
pub mod clusterip;
pub mod config;
pub mod dispatch;
pub mod endpoint;
pub mod iptables;
pub mod nodeport;
pub mod reconciler;
pub mod selector;
pub mod service;

#[cfg(test)]
pub(crate) mod testutil;

pub use config::ProxyConfig;
pub use iptables::{MemoryTables, PacketFilter, SystemExecutor};
pub use reconciler::Reconciler;
pub use service::ServiceHandler;
