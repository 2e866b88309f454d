//! Deterministic chain naming.
//!
//! A chain name is a prefix plus the first 16 characters of the base32
//! encoded SHA-256 of `namespace + name + portName`. Nothing is persisted: the
//! same inputs always produce the same chain, which is how a restarted proxy
//! finds the chains it created earlier.

use data_encoding::BASE32;
use pkg_constants::iptables as ipt;
use sha2::{Digest, Sha256};

pub fn chain_id(namespace: &str, name: &str, port_name: &str) -> String {
    let digest = Sha256::new()
        .chain_update(namespace.as_bytes())
        .chain_update(name.as_bytes())
        .chain_update(port_name.as_bytes())
        .finalize();
    let mut encoded = BASE32.encode(&digest);
    encoded.truncate(ipt::CHAIN_ID_LEN);
    encoded
}

fn prefixed(prefix: &str, id: String) -> String {
    format!("{}-{}", prefix, id)
}

/// `KUBE-SVC-<id>` for a service port.
pub fn service_chain(namespace: &str, service: &str, port_name: &str) -> String {
    prefixed(
        ipt::SERVICE_CHAIN_PREFIX,
        chain_id(namespace, service, port_name),
    )
}

/// `KUBE-EXT-<id>` for a service port exposed on a node port.
pub fn node_port_chain(namespace: &str, service: &str, port_name: &str) -> String {
    prefixed(
        ipt::NODE_PORT_CHAIN_PREFIX,
        chain_id(namespace, service, port_name),
    )
}

/// `KUBE-SEP-<id>` for one pod serving a port. Keyed by pod, not by service.
pub fn endpoint_chain(namespace: &str, pod: &str, port_name: &str) -> String {
    prefixed(
        ipt::ENDPOINT_CHAIN_PREFIX,
        chain_id(namespace, pod, port_name),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_is_sixteen_base32_chars() {
        let id = chain_id("default", "web", "http");
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_uppercase() || ('2'..='7').contains(&c)));
    }

    #[test]
    fn id_is_deterministic() {
        assert_eq!(chain_id("default", "web", "http"), chain_id("default", "web", "http"));
        assert_ne!(chain_id("default", "web", "http"), chain_id("default", "web", "https"));
        assert_ne!(chain_id("default", "web", "http"), chain_id("prod", "web", "http"));
    }

    #[test]
    fn id_hashes_concatenated_fields() {
        // Only the concatenation is hashed.
        assert_eq!(chain_id("ab", "c", ""), chain_id("a", "bc", ""));
    }

    #[test]
    fn names_fit_kernel_limit() {
        for name in [
            service_chain("a-rather-long-namespace", "a-rather-long-service-name", "metrics"),
            node_port_chain("default", "web", ""),
            endpoint_chain("default", "web-7d9f8c-x2x1", "http"),
        ] {
            assert!(name.len() <= ipt::MAX_CHAIN_NAME_LEN, "{} too long", name);
        }
        assert!(service_chain("default", "web", "http").starts_with("KUBE-SVC-"));
        assert!(node_port_chain("default", "web", "http").starts_with("KUBE-EXT-"));
        assert!(endpoint_chain("default", "web-1", "http").starts_with("KUBE-SEP-"));
    }

    #[test]
    fn service_and_node_port_chains_share_id() {
        let svc = service_chain("default", "web", "http");
        let ext = node_port_chain("default", "web", "http");
        assert_eq!(svc[9..], ext[9..]);
    }
}
