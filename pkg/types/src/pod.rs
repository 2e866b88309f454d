use serde::{Deserialize, Serialize};

use crate::meta::ObjectMeta;

// --- Pod phase ---

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum PodPhase {
    #[default]
    Pending,
    Scheduled,
    ContainerCreating,
    Running,
    Succeeded,
    Failed,
    #[serde(other)]
    Unknown,
}

impl std::fmt::Display for PodPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PodPhase::Pending => write!(f, "Pending"),
            PodPhase::Scheduled => write!(f, "Scheduled"),
            PodPhase::ContainerCreating => write!(f, "ContainerCreating"),
            PodPhase::Running => write!(f, "Running"),
            PodPhase::Succeeded => write!(f, "Succeeded"),
            PodPhase::Failed => write!(f, "Failed"),
            PodPhase::Unknown => write!(f, "Unknown"),
        }
    }
}

// --- Pod spec / status ---

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodSpec {
    /// The node this pod is assigned to (set by scheduler)
    #[serde(default)]
    pub node_name: Option<String>,
    #[serde(default)]
    pub host_network: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodStatus {
    #[serde(default)]
    pub phase: PodPhase,
    #[serde(rename = "podIP", default)]
    pub pod_ip: Option<String>,
}

// --- Pod ---

/// The slice of a Pod the proxy reads. Unknown fields are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pod {
    pub metadata: ObjectMeta,
    #[serde(default = "pod_kind")]
    pub kind: String,
    #[serde(default)]
    pub spec: PodSpec,
    #[serde(default)]
    pub status: PodStatus,
}

fn pod_kind() -> String {
    "Pod".to_string()
}

impl Pod {
    pub fn pod_ip(&self) -> Option<&str> {
        self.status.pod_ip.as_deref().filter(|ip| !ip.is_empty())
    }

    pub fn is_running(&self) -> bool {
        self.status.phase == PodPhase::Running
    }

    /// Running with an address: the pod can back a service.
    pub fn is_ready(&self) -> bool {
        self.is_running() && self.pod_ip().is_some()
    }
}
