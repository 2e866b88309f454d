//! Packet-filter table, chain and mark constants.

// ─── Tables and built-in chains ───────────────────────────────────────────

/// The only table the proxy programs.
pub const NAT_TABLE: &str = "nat";

pub const PREROUTING_CHAIN: &str = "PREROUTING";
pub const POSTROUTING_CHAIN: &str = "POSTROUTING";
pub const OUTPUT_CHAIN: &str = "OUTPUT";

// ─── Proxy-owned chains ───────────────────────────────────────────────────

/// Global entry chain, hooked from PREROUTING and OUTPUT.
pub const KUBE_SERVICES_CHAIN: &str = "KUBE-SERVICES";

/// Chain that marks packets for masquerading.
pub const KUBE_MARK_MASQ_CHAIN: &str = "KUBE-MARK-MASQ";

/// Chain hooked from POSTROUTING that masquerades marked packets.
pub const KUBE_POSTROUTING_CHAIN: &str = "KUBE-POSTROUTING";

/// NodePort entry chain, hooked from KUBE-SERVICES for local destinations.
pub const KUBE_NODEPORT_CHAIN: &str = "KUBE-NODEPORT";

/// Prefix of per service-port chains.
pub const SERVICE_CHAIN_PREFIX: &str = "KUBE-SVC";

/// Prefix of per endpoint chains.
pub const ENDPOINT_CHAIN_PREFIX: &str = "KUBE-SEP";

/// Prefix of per service-port NodePort chains.
pub const NODE_PORT_CHAIN_PREFIX: &str = "KUBE-EXT";

// ─── Naming limits ────────────────────────────────────────────────────────

/// Longest chain name the kernel accepts.
pub const MAX_CHAIN_NAME_LEN: usize = 29;

/// Number of base32 characters kept from the chain hash.
pub const CHAIN_ID_LEN: usize = 16;

// ─── Marks and rule positions ─────────────────────────────────────────────

/// Mark/mask pair set on packets that must be masqueraded.
pub const MASQ_MARK: &str = "0x4000/0x4000";

/// Mark/mask pair used to clear the masquerade bit after the decision.
pub const MASQ_MARK_CLEAR: &str = "0x4000/0x0";

/// Position of service jump rules inside KUBE-SERVICES.
pub const SERVICE_JUMP_RULE_INDEX: u32 = 1;

/// Position endpoint rules are inserted at inside a service chain
/// (right after the masquerade rule).
pub const ENDPOINT_RULE_INDEX: u32 = 2;
