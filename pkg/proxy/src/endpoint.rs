//! Endpoint lifecycle: keeps the Endpoint aggregate in the store in step with
//! the ready pods a service selects, and programs one `KUBE-SEP` chain per
//! backend plus its weighted jump in the service chain.
//!
//! Jumps are inserted right after the service chain's masquerade rule, so the
//! newest address is evaluated first. Address `index` of `N` carries
//! probability `(N - index) / N`.

use anyhow::Result;
use pkg_constants::iptables as ipt;
use pkg_state::ResourceStore;
use pkg_types::endpoint::{Endpoint, EndpointAddress, EndpointPort, EndpointSubset};
use pkg_types::meta::ObjectMeta;
use pkg_types::pod::Pod;
use pkg_types::service::Service;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

use crate::chain::{endpoint_chain, service_chain};
use crate::iptables::{IptablesError, PacketFilter, Rule};

/// Selection probability of the address at `index` among `total`.
pub fn probability(total: usize, index: usize) -> f64 {
    if total == 0 || index >= total {
        return 0.0;
    }
    (total - index) as f64 / total as f64
}

fn sep_chain(owner: &ObjectMeta, address: &EndpointAddress, port: &EndpointPort) -> String {
    endpoint_chain(&owner.namespace, &address.target_ref.name, &port.name)
}

/// Weighted jump from the service chain to an endpoint chain.
pub fn service_rule(
    owner: &ObjectMeta,
    address: &EndpointAddress,
    port: &EndpointPort,
    probability: f64,
) -> Rule {
    Rule::new()
        .comment(format!("{}->{}:{}", owner.key(), address.ip, port.port))
        .probability(probability)
        .jump(&sep_chain(owner, address, port))
}

/// Create `KUBE-SEP-<id>`: hairpin masquerade, then DNAT to the pod.
pub async fn create_endpoint_chain(
    filter: &PacketFilter,
    owner: &ObjectMeta,
    address: &EndpointAddress,
    port: &EndpointPort,
) -> Result<(), IptablesError> {
    let chain = sep_chain(owner, address, port);
    let comment = format!("{}:{}-clusterIP", owner.key(), port.name);

    filter.new_chain(&chain).await?;
    filter
        .append_rule(
            &chain,
            &Rule::new()
                .comment(comment.clone())
                .source(&format!("{}/32", address.ip))
                .jump(ipt::KUBE_MARK_MASQ_CHAIN),
        )
        .await?;
    filter
        .append_rule(
            &chain,
            &Rule::new()
                .comment(comment)
                .tcp()
                .jump("DNAT")
                .with([
                    "--to-destination".to_string(),
                    format!("{}:{}", address.ip, port.port),
                ]),
        )
        .await
}

pub async fn add_to_service_chain(
    filter: &PacketFilter,
    owner: &ObjectMeta,
    address: &EndpointAddress,
    port: &EndpointPort,
    probability: f64,
) -> Result<(), IptablesError> {
    filter
        .insert_rule(
            &service_chain(&owner.namespace, &owner.name, &port.name),
            ipt::ENDPOINT_RULE_INDEX,
            &service_rule(owner, address, port, probability),
        )
        .await
}

/// Delete up to `count` endpoint jumps from the head of a service chain.
/// Never touches the masquerade rule.
pub async fn clear_service_chain(
    filter: &PacketFilter,
    chain: &str,
    count: usize,
) -> Result<(), IptablesError> {
    let present = filter.list_rules(chain).await?.len().saturating_sub(1);
    for _ in 0..count.min(present) {
        filter
            .delete_rule_at(chain, ipt::ENDPOINT_RULE_INDEX)
            .await?;
    }
    Ok(())
}

/// Builds and repairs Endpoint objects and their endpoint rules.
#[derive(Clone)]
pub struct EndpointManager {
    store: Arc<dyn ResourceStore>,
    filter: PacketFilter,
}

impl EndpointManager {
    pub fn new(store: Arc<dyn ResourceStore>, filter: PacketFilter) -> Self {
        Self { store, filter }
    }

    /// Endpoint chains a service chain currently jumps to.
    async fn endpoint_jumps(&self, svc_chain: &str) -> Result<Vec<String>, IptablesError> {
        let mut jumps = self.filter.jumps(svc_chain).await?;
        jumps.retain(|target| target.starts_with(ipt::ENDPOINT_CHAIN_PREFIX));
        Ok(jumps)
    }

    /// Create the endpoint chain unless another service already did, then
    /// add the weighted jump.
    async fn program_address(
        &self,
        owner: &ObjectMeta,
        address: &EndpointAddress,
        port: &EndpointPort,
        probability: f64,
    ) -> Result<(), IptablesError> {
        if !self
            .filter
            .chain_exists(&sep_chain(owner, address, port))
            .await?
        {
            create_endpoint_chain(&self.filter, owner, address, port).await?;
        }
        add_to_service_chain(&self.filter, owner, address, port, probability).await?;
        debug!(
            "Added {}:{} to {}:{} with probability {:.6}",
            address.ip,
            port.port,
            owner.key(),
            port.name,
            probability
        );
        Ok(())
    }

    /// Destroy endpoint chain `sep` unless the service chain of another
    /// service in the namespace still jumps to it. Pods selected by several
    /// services under the same port name share one endpoint chain.
    async fn release(&self, owner: &ObjectMeta, port_name: &str, sep: &str) -> Result<bool> {
        if !self.filter.chain_exists(sep).await? {
            return Ok(false);
        }
        for other in self.store.list_endpoints(&owner.namespace).await? {
            if other.metadata.name == owner.name {
                continue;
            }
            let chain = service_chain(&owner.namespace, &other.metadata.name, port_name);
            if self.filter.jumps(&chain).await?.iter().any(|t| t == sep) {
                debug!("{} still used by {}", sep, other.metadata.key());
                return Ok(false);
            }
        }
        self.filter.delete_chain(sep).await?;
        Ok(true)
    }

    async fn save(&self, endpoint: &Endpoint, existing: Option<&Endpoint>) -> Result<()> {
        match existing {
            None => {
                self.store.create_endpoint(endpoint).await?;
                info!("Created endpoint {}", endpoint.metadata.key());
            }
            Some(old) if old != endpoint => {
                self.store.patch_endpoint(endpoint).await?;
                debug!("Updated endpoint {}", endpoint.metadata.key());
            }
            Some(_) => {}
        }
        Ok(())
    }

    /// Rebuild the Endpoint of `service` from `pods` and give every address
    /// that lacks one a jump in each programmed service chain.
    pub async fn sync_service(&self, service: &Service, pods: &[Pod]) -> Result<()> {
        let owner = &service.metadata;
        let existing = self
            .store
            .get_endpoint(&owner.namespace, &owner.name)
            .await?;

        let mut seen = HashSet::new();
        let mut addresses: Vec<EndpointAddress> = existing
            .iter()
            .flat_map(|ep| ep.subsets.iter())
            .flat_map(|subset| subset.addresses.iter())
            .filter(|addr| pods.iter().any(|p| p.metadata.uid == addr.target_ref.uid))
            .filter(|addr| seen.insert(addr.target_ref.uid.clone()))
            .cloned()
            .collect();
        for pod in pods {
            if seen.insert(pod.metadata.uid.clone()) {
                addresses.extend(EndpointAddress::for_pod(pod));
            }
        }

        let mut endpoint = existing
            .clone()
            .unwrap_or_else(|| Endpoint::for_service(service));
        let ports = Endpoint::for_service(service)
            .subsets
            .into_iter()
            .flat_map(|s| s.ports)
            .collect::<Vec<_>>();
        endpoint.subsets = vec![EndpointSubset { addresses, ports }];

        let subset = &endpoint.subsets[0];
        let total = subset.addresses.len();
        for port in &subset.ports {
            let svc_chain = service_chain(&owner.namespace, &owner.name, &port.name);
            if !self.filter.chain_exists(&svc_chain).await? {
                debug!("{} not programmed, skipping {}", svc_chain, port.name);
                continue;
            }
            let jumps = self.endpoint_jumps(&svc_chain).await?;
            for (index, address) in subset.addresses.iter().enumerate() {
                if !jumps.contains(&sep_chain(owner, address, port)) {
                    self.program_address(owner, address, port, probability(total, index))
                        .await?;
                }
            }
        }

        self.save(&endpoint, existing.as_ref()).await
    }

    /// Add one ready pod to the Endpoint of `service`. Repeating the call for
    /// the same pod changes nothing.
    pub async fn add_pod(&self, service: &Service, pod: &Pod) -> Result<()> {
        let Some(address) = EndpointAddress::for_pod(pod) else {
            debug!("Pod {} has no IP yet", pod.metadata.key());
            return Ok(());
        };
        let owner = &service.metadata;
        let existing = self
            .store
            .get_endpoint(&owner.namespace, &owner.name)
            .await?;
        let mut endpoint = existing
            .clone()
            .unwrap_or_else(|| Endpoint::for_service(service));
        if endpoint.subsets.is_empty() {
            endpoint.subsets = Endpoint::for_service(service).subsets;
        }

        let (s, a) = match endpoint.find_address(&pod.metadata.uid) {
            Some(found) => found,
            None => {
                endpoint.subsets[0].addresses.push(address);
                (0, endpoint.subsets[0].addresses.len() - 1)
            }
        };

        let subset = &endpoint.subsets[s];
        let total = subset.addresses.len();
        let address = &subset.addresses[a];
        for port in &subset.ports {
            let svc_chain = service_chain(&owner.namespace, &owner.name, &port.name);
            if !self.filter.chain_exists(&svc_chain).await? {
                debug!("{} not programmed, skipping {}", svc_chain, port.name);
                continue;
            }
            let jumps = self.endpoint_jumps(&svc_chain).await?;
            if jumps.contains(&sep_chain(owner, address, port)) {
                continue;
            }
            self.program_address(owner, address, port, probability(total, a))
                .await?;
        }

        info!(
            "Endpoint {} has {} address(es) after adding pod {}",
            owner.key(),
            total,
            pod.metadata.name
        );
        self.save(&endpoint, existing.as_ref()).await
    }

    /// Remove the address backed by pod `uid` from the Endpoint `namespace/name`,
    /// re-weight the remaining addresses and release its endpoint chains.
    pub async fn remove_pod(&self, namespace: &str, name: &str, uid: &str) -> Result<()> {
        let Some(mut endpoint) = self.store.get_endpoint(namespace, name).await? else {
            return Ok(());
        };
        let Some((s, a)) = endpoint.find_address(uid) else {
            return Ok(());
        };

        let owner = endpoint.metadata.clone();
        let subset = &mut endpoint.subsets[s];
        let previous = subset.addresses.len();
        let removed = subset.addresses.remove(a);
        let total = subset.addresses.len();

        for port in &subset.ports {
            let svc_chain = service_chain(&owner.namespace, &owner.name, &port.name);
            if self.filter.chain_exists(&svc_chain).await? {
                clear_service_chain(&self.filter, &svc_chain, previous).await?;
                for (index, address) in subset.addresses.iter().enumerate() {
                    add_to_service_chain(
                        &self.filter,
                        &owner,
                        address,
                        port,
                        probability(total, index),
                    )
                    .await?;
                }
            }
            self.release(&owner, &port.name, &sep_chain(&owner, &removed, port))
                .await?;
        }

        self.store.patch_endpoint(&endpoint).await?;
        info!(
            "Removed pod {} ({}) from endpoint {}, {} address(es) left",
            removed.target_ref.name,
            removed.ip,
            owner.key(),
            total
        );
        Ok(())
    }

    /// Converge the service chains of `service` on its stored Endpoint.
    ///
    /// Addresses without a jump get one, as on a pod addition. Jumps to
    /// addresses the Endpoint no longer lists are dropped and the remaining
    /// addresses re-weighted, as on a pod removal. This is how addresses
    /// written by proxies on other nodes reach this node's chains.
    pub async fn sync_endpoint(&self, service: &Service) -> Result<()> {
        let owner = &service.metadata;
        let Some(endpoint) = self
            .store
            .get_endpoint(&owner.namespace, &owner.name)
            .await?
        else {
            return Ok(());
        };

        for subset in &endpoint.subsets {
            let total = subset.addresses.len();
            for port in &subset.ports {
                let svc_chain = service_chain(&owner.namespace, &owner.name, &port.name);
                if !self.filter.chain_exists(&svc_chain).await? {
                    continue;
                }
                let jumps = self.endpoint_jumps(&svc_chain).await?;
                let expected: Vec<String> = subset
                    .addresses
                    .iter()
                    .map(|address| sep_chain(owner, address, port))
                    .collect();
                let stale: Vec<&String> =
                    jumps.iter().filter(|j| !expected.contains(j)).collect();

                if stale.is_empty() {
                    for (index, address) in subset.addresses.iter().enumerate() {
                        if !jumps.contains(&expected[index]) {
                            self.program_address(owner, address, port, probability(total, index))
                                .await?;
                        }
                    }
                    continue;
                }

                clear_service_chain(&self.filter, &svc_chain, jumps.len()).await?;
                for (index, address) in subset.addresses.iter().enumerate() {
                    self.program_address(owner, address, port, probability(total, index))
                        .await?;
                }
                for sep in stale {
                    self.release(owner, &port.name, sep).await?;
                }
                info!(
                    "Resynced {}:{} to {} address(es)",
                    owner.key(),
                    port.name,
                    total
                );
            }
        }
        Ok(())
    }

    /// Release the endpoint chains of every address. The service's own chains
    /// must already be gone.
    pub async fn remove_chains(&self, endpoint: &Endpoint) -> Result<()> {
        for subset in &endpoint.subsets {
            for port in &subset.ports {
                for address in &subset.addresses {
                    let sep = sep_chain(&endpoint.metadata, address, port);
                    self.release(&endpoint.metadata, &port.name, &sep).await?;
                }
            }
        }
        Ok(())
    }
}
