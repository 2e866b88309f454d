use anyhow::Result;
use pkg_state::ResourceStore;
use pkg_types::pod::Pod;
use pkg_types::service::Service;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::ProxyConfig;
use crate::endpoint::EndpointManager;
use crate::iptables::PacketFilter;
use crate::{clusterip, nodeport, selector};

/// Applies Service and Pod changes to the packet filter and the store.
///
/// Every method is safe to repeat; callers serialize calls per service.
#[derive(Clone)]
pub struct ServiceHandler {
    store: Arc<dyn ResourceStore>,
    filter: PacketFilter,
    config: Arc<ProxyConfig>,
    endpoints: EndpointManager,
}

impl ServiceHandler {
    pub fn new(store: Arc<dyn ResourceStore>, filter: PacketFilter, config: Arc<ProxyConfig>) -> Self {
        let endpoints = EndpointManager::new(store.clone(), filter.clone());
        Self {
            store,
            filter,
            config,
            endpoints,
        }
    }

    pub fn store(&self) -> &Arc<dyn ResourceStore> {
        &self.store
    }

    /// Ready pods `service` selects.
    async fn selected_pods(&self, service: &Service) -> Result<Vec<Pod>> {
        let Some(field) = selector::pod_field_selector(service) else {
            return Ok(Vec::new());
        };
        let pods = self
            .store
            .list_pods(&service.metadata.namespace, Some(&field))
            .await?;
        Ok(pods
            .into_iter()
            .filter(|p| p.is_ready() && selector::matches(service, p))
            .collect())
    }

    /// Program every port of `service` that is not programmed yet, write the
    /// allocated ClusterIP and node ports back and build its Endpoint.
    ///
    /// Does nothing when all ports are already programmed, which is the case
    /// for the change our own PATCH produces.
    pub async fn apply_service(&self, service: &Service) -> Result<()> {
        let key = service.metadata.key();
        if !service.is_programmable() {
            debug!("Service {} has type {}, ignoring", key, service.spec.service_type);
            return Ok(());
        }
        let mut updated = service.clone();
        let mut vip = None;
        let mut programmed = false;

        for i in 0..updated.spec.ports.len() {
            let port = updated.spec.ports[i].clone();
            let cluster_done = clusterip::is_programmed(&self.filter, &updated, &port).await?;
            let node_done = !updated.is_node_port()
                || nodeport::is_programmed(&self.filter, &updated, &port).await?;
            if cluster_done && node_done {
                continue;
            }

            // Allocate before touching the filter so exhaustion leaves no chain behind.
            let address = match vip {
                Some(address) => address,
                None => {
                    let allocated =
                        clusterip::resolve_cluster_ip(self.store.as_ref(), &self.config, &updated)
                            .await?;
                    updated.spec.cluster_ip = Some(allocated.to_string());
                    vip = Some(allocated);
                    allocated
                }
            };
            let node_port = if node_done {
                None
            } else {
                let allocated =
                    nodeport::resolve_node_port(self.store.as_ref(), &self.config, &updated, &port)
                        .await?;
                updated.spec.ports[i].node_port = Some(allocated);
                Some(allocated)
            };

            if !cluster_done {
                clusterip::program(&self.filter, &self.config, &updated, &port, address).await?;
                programmed = true;
            }
            if let Some(node_port) = node_port {
                nodeport::program(&self.filter, &updated, &port, node_port).await?;
            }
        }

        if !programmed && &updated == service {
            debug!("Service {} already programmed", key);
            return Ok(());
        }

        if &updated != service {
            self.store.patch_service(&updated).await?;
            info!(
                "Updated service {} (clusterIP {})",
                key,
                updated.cluster_ip().unwrap_or("-")
            );
        }

        let pods = self.selected_pods(&updated).await?;
        self.endpoints.sync_service(&updated, &pods).await
    }

    /// Tear down every chain of `service`: entry jumps, NodePort chains,
    /// service chains, then the endpoint chains they pointed at.
    pub async fn delete_service(&self, service: &Service) -> Result<()> {
        let meta = &service.metadata;
        for port in &service.spec.ports {
            nodeport::remove(&self.filter, service, port).await?;
            clusterip::remove(&self.filter, service, port).await?;
        }
        if let Some(endpoint) = self
            .store
            .get_endpoint(&meta.namespace, &meta.name)
            .await?
        {
            self.endpoints.remove_chains(&endpoint).await?;
        }
        info!("Removed service {}", meta.key());
        Ok(())
    }

    /// Bring the chains of `namespace/name` in line with its stored Endpoint.
    pub async fn sync_endpoint(&self, namespace: &str, name: &str) -> Result<()> {
        let Some(service) = self.store.get_service(namespace, name).await? else {
            debug!("Endpoint {}/{} has no service", namespace, name);
            return Ok(());
        };
        if !service.is_programmable() {
            return Ok(());
        }
        self.endpoints.sync_endpoint(&service).await
    }

    pub async fn add_pod(&self, service: &Service, pod: &Pod) -> Result<()> {
        self.endpoints.add_pod(service, pod).await
    }

    pub async fn remove_pod(&self, namespace: &str, service: &str, uid: &str) -> Result<()> {
        self.endpoints.remove_pod(namespace, service, uid).await
    }
}
