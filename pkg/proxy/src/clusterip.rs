//! ClusterIP programming: the per service-port chain and its jump from the
//! global entry chain.

use anyhow::{Context, Result};
use ipnet::Ipv4Net;
use pkg_constants::iptables as ipt;
use pkg_state::ResourceStore;
use pkg_types::service::{Service, ServicePort};
use std::net::Ipv4Addr;
use tracing::info;

use crate::chain::service_chain;
use crate::config::ProxyConfig;
use crate::iptables::{IptablesError, PacketFilter, Rule};

fn comment(service: &Service, port: &ServicePort) -> String {
    format!("{}:{}-clusterIP", service.metadata.key(), port.name)
}

/// Jump from `KUBE-SERVICES` into the service chain for traffic to `vip:port`.
pub fn entry_rule(service: &Service, port: &ServicePort, vip: Ipv4Addr) -> Rule {
    let meta = &service.metadata;
    Rule::new()
        .comment(comment(service, port))
        .destination(&format!("{}/32", vip))
        .tcp()
        .dport(port.port)
        .jump(&service_chain(&meta.namespace, &meta.name, &port.name))
}

/// First rule of every service chain: mark traffic from outside the pod network.
pub fn masquerade_rule(
    cluster_cidr: &Ipv4Net,
    service: &Service,
    port: &ServicePort,
    vip: Ipv4Addr,
) -> Rule {
    Rule::new()
        .comment(comment(service, port))
        .not_source(&cluster_cidr.to_string())
        .destination(&format!("{}/32", vip))
        .tcp()
        .dport(port.port)
        .jump(ipt::KUBE_MARK_MASQ_CHAIN)
}

pub async fn is_programmed(
    filter: &PacketFilter,
    service: &Service,
    port: &ServicePort,
) -> Result<bool, IptablesError> {
    let meta = &service.metadata;
    filter
        .chain_exists(&service_chain(&meta.namespace, &meta.name, &port.name))
        .await
}

/// Create the service chain, insert its jump at the head of `KUBE-SERVICES`
/// and add the masquerade rule.
pub async fn program(
    filter: &PacketFilter,
    config: &ProxyConfig,
    service: &Service,
    port: &ServicePort,
    vip: Ipv4Addr,
) -> Result<(), IptablesError> {
    let meta = &service.metadata;
    let chain = service_chain(&meta.namespace, &meta.name, &port.name);

    filter.new_chain(&chain).await?;
    filter
        .insert_rule(
            ipt::KUBE_SERVICES_CHAIN,
            ipt::SERVICE_JUMP_RULE_INDEX,
            &entry_rule(service, port, vip),
        )
        .await?;
    filter
        .append_rule(
            &chain,
            &masquerade_rule(&config.cluster_cidr, service, port, vip),
        )
        .await?;

    info!(
        "Programmed ClusterIP {}:{} for {} ({})",
        vip,
        port.port,
        meta.key(),
        chain
    );
    Ok(())
}

/// Drop the entry jump and destroy the chain.
///
/// The jump is found by its target rather than rebuilt from `service`, so a
/// DELETE payload that lost its `clusterIP` still cleans up.
pub async fn remove(
    filter: &PacketFilter,
    service: &Service,
    port: &ServicePort,
) -> Result<(), IptablesError> {
    let meta = &service.metadata;
    let chain = service_chain(&meta.namespace, &meta.name, &port.name);
    filter.remove_jumps(ipt::KUBE_SERVICES_CHAIN, &chain).await?;
    if filter.remove_chain(&chain).await? {
        info!("Removed {} for {}:{}", chain, meta.key(), port.name);
    }
    Ok(())
}

/// The service's own address when it already has one, otherwise the first
/// free address of the service network.
pub async fn resolve_cluster_ip(
    store: &dyn ResourceStore,
    config: &ProxyConfig,
    service: &Service,
) -> Result<Ipv4Addr> {
    if let Some(ip) = service.cluster_ip() {
        return ip
            .parse()
            .with_context(|| format!("Invalid clusterIP {} on {}", ip, service.metadata.key()));
    }
    let services = store.list_services().await?;
    let vip = pkg_network::next_cluster_ip(&config.service_cidr, &services)?;
    info!("Allocated ClusterIP {} to {}", vip, service.metadata.key());
    Ok(vip)
}
