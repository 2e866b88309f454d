//! Network-related constants.

/// Default API server address (HTTP).
pub const DEFAULT_API_ADDR: &str = "http://127.0.0.1:6443";

/// Default CIDR that ClusterIP virtual addresses are allocated from.
pub const DEFAULT_SERVICE_CIDR: &str = "10.96.0.0/16";

/// Default pod network CIDR. Traffic sourced outside it is masqueraded.
pub const DEFAULT_CLUSTER_CIDR: &str = "10.244.0.0/16";

/// First port of the NodePort range (inclusive).
pub const NODE_PORT_RANGE_START: u16 = 30000;

/// Last port of the NodePort range (inclusive).
pub const NODE_PORT_RANGE_END: u16 = 32767;

/// Default number of reconciliations allowed to run at the same time.
pub const DEFAULT_PROXY_WORKERS: usize = 8;

/// Field path the pod watch is filtered on when a node name is configured.
pub const POD_NODE_NAME_FIELD: &str = "spec.nodeName";

/// Field path prefix used to select pods by label.
pub const POD_LABEL_FIELD_PREFIX: &str = "metadata.labels";
