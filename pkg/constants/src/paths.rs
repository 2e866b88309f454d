//! Filesystem path constants.

/// Default config file path for the proxy.
pub const DEFAULT_PROXY_CONFIG: &str = "/etc/k3rs/proxy-config.yaml";

/// Default location of the iptables binary.
pub const DEFAULT_IPTABLES_PATH: &str = "/usr/sbin/iptables";
