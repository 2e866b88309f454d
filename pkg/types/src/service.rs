use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::meta::ObjectMeta;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceType {
    #[default]
    ClusterIP,
    NodePort,
    /// LoadBalancer, ExternalName and anything else the proxy does not program.
    #[serde(other)]
    Other,
}

impl std::fmt::Display for ServiceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceType::ClusterIP => write!(f, "ClusterIP"),
            ServiceType::NodePort => write!(f, "NodePort"),
            ServiceType::Other => write!(f, "Other"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServicePort {
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    pub port: u16,
    #[serde(default)]
    pub target_port: u16,
    /// Zero and absent both mean "not allocated yet".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_port: Option<u16>,
}

impl ServicePort {
    /// Port the backend pods listen on. Falls back to `port` when unset.
    pub fn backend_port(&self) -> u16 {
        if self.target_port == 0 {
            self.port
        } else {
            self.target_port
        }
    }

    pub fn allocated_node_port(&self) -> Option<u16> {
        self.node_port.filter(|p| *p != 0)
    }
}

pub(crate) fn default_protocol() -> String {
    "TCP".to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSpec {
    #[serde(rename = "type", default)]
    pub service_type: ServiceType,
    #[serde(rename = "clusterIP", default, skip_serializing_if = "Option::is_none")]
    pub cluster_ip: Option<String>,
    /// Only the first entry (in key order) takes part in matching.
    #[serde(default)]
    pub selector: BTreeMap<String, String>,
    #[serde(default)]
    pub ports: Vec<ServicePort>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub metadata: ObjectMeta,
    #[serde(default = "service_kind")]
    pub kind: String,
    #[serde(default)]
    pub spec: ServiceSpec,
}

fn service_kind() -> String {
    "Service".to_string()
}

impl Service {
    /// The allocated virtual IP, treating an empty string as unallocated.
    pub fn cluster_ip(&self) -> Option<&str> {
        self.spec.cluster_ip.as_deref().filter(|ip| !ip.is_empty())
    }

    pub fn is_node_port(&self) -> bool {
        self.spec.service_type == ServiceType::NodePort
    }

    /// Whether the proxy programs rules for this type of service.
    pub fn is_programmable(&self) -> bool {
        self.spec.service_type != ServiceType::Other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_store_json() {
        let json = r#"{
            "metadata": {"name": "web", "namespace": "default", "uid": "u-1"},
            "kind": "Service",
            "spec": {
                "type": "NodePort",
                "clusterIP": "",
                "selector": {"app": "web"},
                "ports": [{"name": "http", "protocol": "TCP", "port": 80, "targetPort": 8080, "nodePort": 0}]
            }
        }"#;
        let svc: Service = serde_json::from_str(json).unwrap();
        assert!(svc.is_node_port());
        assert_eq!(svc.cluster_ip(), None);
        assert_eq!(svc.spec.ports[0].backend_port(), 8080);
        assert_eq!(svc.spec.ports[0].allocated_node_port(), None);
    }

    #[test]
    fn unknown_types_decode_as_other() {
        for kind in ["LoadBalancer", "ExternalName"] {
            let json = format!(
                r#"{{"metadata": {{"name": "lb", "namespace": "default"}}, "spec": {{"type": "{}", "ports": []}}}}"#,
                kind
            );
            let svc: Service = serde_json::from_str(&json).unwrap();
            assert_eq!(svc.spec.service_type, ServiceType::Other);
            assert!(!svc.is_programmable());
        }
    }

    #[test]
    fn backend_port_falls_back_to_port() {
        let port = ServicePort {
            name: "dns".to_string(),
            protocol: default_protocol(),
            port: 53,
            target_port: 0,
            node_port: None,
        };
        assert_eq!(port.backend_port(), 53);
    }

    #[test]
    fn cluster_ip_is_written_back_under_its_wire_name() {
        let mut svc = Service::default();
        svc.spec.cluster_ip = Some("10.96.0.1".to_string());
        let value = serde_json::to_value(&svc).unwrap();
        assert_eq!(value["spec"]["clusterIP"], "10.96.0.1");
        assert_eq!(value["spec"]["type"], "ClusterIP");
    }
}
