//! NodePort programming: a `KUBE-EXT` chain reached from `KUBE-NODEPORT`
//! that masquerades and then reuses the service's ClusterIP chain.

use anyhow::Result;
use pkg_constants::iptables as ipt;
use pkg_state::ResourceStore;
use pkg_types::service::{Service, ServicePort};
use tracing::info;

use crate::chain::{node_port_chain, service_chain};
use crate::config::ProxyConfig;
use crate::iptables::{IptablesError, PacketFilter, Rule};

/// Jump from `KUBE-NODEPORT` into the port's `KUBE-EXT` chain.
pub fn entry_rule(service: &Service, port: &ServicePort, node_port: u16) -> Rule {
    let meta = &service.metadata;
    Rule::new()
        .comment(format!("{}-service:{}", meta.key(), port.name))
        .tcp()
        .dport(node_port)
        .jump(&node_port_chain(&meta.namespace, &meta.name, &port.name))
}

pub async fn is_programmed(
    filter: &PacketFilter,
    service: &Service,
    port: &ServicePort,
) -> Result<bool, IptablesError> {
    let meta = &service.metadata;
    filter
        .chain_exists(&node_port_chain(&meta.namespace, &meta.name, &port.name))
        .await
}

/// Requires the port's service chain to exist already.
pub async fn program(
    filter: &PacketFilter,
    service: &Service,
    port: &ServicePort,
    node_port: u16,
) -> Result<(), IptablesError> {
    let meta = &service.metadata;
    let chain = node_port_chain(&meta.namespace, &meta.name, &port.name);

    filter.new_chain(&chain).await?;
    filter
        .append_rule(
            ipt::KUBE_NODEPORT_CHAIN,
            &entry_rule(service, port, node_port),
        )
        .await?;
    filter
        .append_rule(
            &chain,
            &Rule::new()
                .comment(format!(
                    "masquerade-traffic-for-{}-external-destinations",
                    meta.key()
                ))
                .jump(ipt::KUBE_MARK_MASQ_CHAIN),
        )
        .await?;
    filter
        .append_rule(
            &chain,
            &Rule::new()
                .comment(format!("{}-service:{}", meta.key(), port.name))
                .jump(&service_chain(&meta.namespace, &meta.name, &port.name)),
        )
        .await?;

    info!(
        "Programmed NodePort {} for {}:{} ({})",
        node_port,
        meta.key(),
        port.name,
        chain
    );
    Ok(())
}

/// Must run before the service chain is removed, which this chain references.
pub async fn remove(
    filter: &PacketFilter,
    service: &Service,
    port: &ServicePort,
) -> Result<(), IptablesError> {
    let meta = &service.metadata;
    let chain = node_port_chain(&meta.namespace, &meta.name, &port.name);
    filter.remove_jumps(ipt::KUBE_NODEPORT_CHAIN, &chain).await?;
    if filter.remove_chain(&chain).await? {
        info!("Removed {} for {}:{}", chain, meta.key(), port.name);
    }
    Ok(())
}

/// The port's own node port when set, otherwise the first free one.
///
/// `pending` is the service being reconciled; ports it already claimed in
/// this pass count as taken even though the store has not seen them yet.
pub async fn resolve_node_port(
    store: &dyn ResourceStore,
    config: &ProxyConfig,
    pending: &Service,
    port: &ServicePort,
) -> Result<u16> {
    if let Some(node_port) = port.allocated_node_port() {
        return Ok(node_port);
    }
    let mut services = store.list_services().await?;
    let key = pending.metadata.key();
    services.retain(|s| s.metadata.key() != key);
    services.push(pending.clone());

    let node_port = pkg_network::next_node_port(config.node_port_range.clone(), &services)?;
    info!(
        "Allocated NodePort {} to {}:{}",
        node_port, key, port.name
    );
    Ok(node_port)
}
