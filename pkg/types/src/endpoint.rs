use serde::{Deserialize, Serialize};

use crate::meta::{ObjectMeta, ObjectReference};
use crate::pod::Pod;
use crate::service::{Service, default_protocol};

/// An address of a backend pod serving a Service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointAddress {
    pub ip: String,
    #[serde(default)]
    pub node_name: Option<String>,
    #[serde(default)]
    pub target_ref: ObjectReference,
}

impl EndpointAddress {
    /// Build the address for a ready pod. Returns `None` when the pod has no IP.
    pub fn for_pod(pod: &Pod) -> Option<Self> {
        let ip = pod.pod_ip()?;
        Some(Self {
            ip: ip.to_string(),
            node_name: pod.spec.node_name.clone(),
            target_ref: ObjectReference {
                kind: pod.kind.clone(),
                name: pod.metadata.name.clone(),
                namespace: pod.metadata.namespace.clone(),
                uid: pod.metadata.uid.clone(),
            },
        })
    }
}

/// A port exposed by a backend pod.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointPort {
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    pub port: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointSubset {
    #[serde(default)]
    pub addresses: Vec<EndpointAddress>,
    #[serde(default)]
    pub ports: Vec<EndpointPort>,
}

impl EndpointSubset {
    pub fn position_of(&self, uid: &str) -> Option<usize> {
        self.addresses.iter().position(|a| a.target_ref.uid == uid)
    }
}

/// Endpoint represents the set of backend addresses for a Service.
/// It shares its name and namespace with the Service it is derived from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub metadata: ObjectMeta,
    #[serde(default = "endpoint_kind")]
    pub kind: String,
    #[serde(default)]
    pub subsets: Vec<EndpointSubset>,
}

fn endpoint_kind() -> String {
    "Endpoint".to_string()
}

impl Endpoint {
    /// An empty Endpoint for `service` with a single subset carrying its ports.
    pub fn for_service(service: &Service) -> Self {
        let ports = service
            .spec
            .ports
            .iter()
            .map(|p| EndpointPort {
                name: p.name.clone(),
                protocol: p.protocol.clone(),
                port: p.backend_port(),
            })
            .collect();

        Self {
            metadata: ObjectMeta::new(&service.metadata.namespace, &service.metadata.name),
            kind: endpoint_kind(),
            subsets: vec![EndpointSubset {
                addresses: Vec::new(),
                ports,
            }],
        }
    }

    /// Locate the address backed by the pod with `uid` as `(subset, address)` indices.
    pub fn find_address(&self, uid: &str) -> Option<(usize, usize)> {
        self.subsets
            .iter()
            .enumerate()
            .find_map(|(s, subset)| subset.position_of(uid).map(|a| (s, a)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pod::PodPhase;
    use crate::service::ServicePort;

    #[test]
    fn for_service_uses_target_ports() {
        let mut svc = Service::default();
        svc.metadata = ObjectMeta::new("default", "web");
        svc.spec.ports.push(ServicePort {
            name: "http".to_string(),
            protocol: "TCP".to_string(),
            port: 80,
            target_port: 8080,
            node_port: None,
        });

        let ep = Endpoint::for_service(&svc);
        assert_eq!(ep.kind, "Endpoint");
        assert_eq!(ep.metadata.key(), "default/web");
        assert_eq!(ep.subsets.len(), 1);
        assert_eq!(ep.subsets[0].ports[0].port, 8080);
        assert!(ep.subsets[0].addresses.is_empty());
    }

    #[test]
    fn find_address_by_pod_uid() {
        let mut pod = Pod::default();
        pod.metadata = ObjectMeta::new("default", "web-1");
        pod.metadata.uid = "uid-1".to_string();
        pod.status.phase = PodPhase::Running;
        pod.status.pod_ip = Some("10.244.0.5".to_string());

        let mut ep = Endpoint::default();
        ep.subsets.push(EndpointSubset::default());
        ep.subsets[0]
            .addresses
            .push(EndpointAddress::for_pod(&pod).unwrap());

        assert_eq!(ep.find_address("uid-1"), Some((0, 0)));
        assert_eq!(ep.find_address("uid-2"), None);
    }
}
