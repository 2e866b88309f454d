use anyhow::Result;
use futures_util::StreamExt;
use pkg_state::{Change, FieldSelector};
use pkg_types::endpoint::Endpoint;
use pkg_types::meta::ObjectMeta;
use pkg_types::pod::Pod;
use pkg_types::service::Service;
use std::collections::BTreeSet;
use std::fmt;
use tracing::{debug, error, info, warn};

use crate::config::ProxyConfig;
use crate::dispatch::Dispatcher;
use crate::selector;
use crate::service::ServiceHandler;

/// Serialization key for reconciliation work.
///
/// Everything that touches a service's chains or Endpoint runs under its
/// `Service` key; `Pod` keys only resolve which services a pod event affects.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WorkKey {
    Service { namespace: String, name: String },
    Pod { namespace: String, name: String },
}

impl WorkKey {
    pub fn service(meta: &ObjectMeta) -> Self {
        WorkKey::Service {
            namespace: meta.namespace.clone(),
            name: meta.name.clone(),
        }
    }

    pub fn pod(meta: &ObjectMeta) -> Self {
        WorkKey::Pod {
            namespace: meta.namespace.clone(),
            name: meta.name.clone(),
        }
    }
}

impl fmt::Display for WorkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkKey::Service { namespace, name } => write!(f, "service {}/{}", namespace, name),
            WorkKey::Pod { namespace, name } => write!(f, "pod {}/{}", namespace, name),
        }
    }
}

/// Runs the Service, Pod and Endpoint watch loops and feeds their changes to
/// the dispatcher.
pub struct Reconciler {
    handler: ServiceHandler,
    dispatcher: Dispatcher<WorkKey>,
    node_name: Option<String>,
}

impl Reconciler {
    pub fn new(handler: ServiceHandler, config: &ProxyConfig) -> Self {
        Self {
            handler,
            dispatcher: Dispatcher::new(config.workers),
            node_name: config.node_name.clone(),
        }
    }

    /// Server-side filter for the pod watch.
    pub fn pod_selector(&self) -> Option<FieldSelector> {
        self.node_name.as_deref().map(FieldSelector::node_name)
    }

    /// Start the watch loops. The task ends once every stream has closed.
    pub fn start(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            tokio::join!(
                self.watch_services(),
                self.watch_pods(),
                self.watch_endpoints()
            );
            info!("Reconciler stopped");
        })
    }

    async fn watch_services(&self) {
        let mut feed = match self.handler.store().watch_services().await {
            Ok(feed) => feed,
            Err(e) => {
                error!("Failed to watch services: {:#}", e);
                return;
            }
        };
        info!("Watching services");
        while let Some(change) = feed.next().await {
            self.on_service(change).await;
        }
        warn!("Service watch closed");
    }

    async fn watch_pods(&self) {
        let selector = self.pod_selector();
        let mut feed = match self.handler.store().watch_pods(selector.as_ref()).await {
            Ok(feed) => feed,
            Err(e) => {
                error!("Failed to watch pods: {:#}", e);
                return;
            }
        };
        info!(
            "Watching pods{}",
            selector.map(|s| format!(" ({})", s)).unwrap_or_default()
        );
        while let Some(change) = feed.next().await {
            self.on_pod(change).await;
        }
        warn!("Pod watch closed");
    }

    /// Endpoints carry the addresses of pods on other nodes, which the
    /// node-filtered pod watch never sees.
    async fn watch_endpoints(&self) {
        let mut feed = match self.handler.store().watch_endpoints().await {
            Ok(feed) => feed,
            Err(e) => {
                error!("Failed to watch endpoints: {:#}", e);
                return;
            }
        };
        info!("Watching endpoints");
        while let Some(change) = feed.next().await {
            self.on_endpoint(change).await;
        }
        warn!("Endpoint watch closed");
    }

    pub async fn on_service(&self, change: Change<Service>) {
        let key = WorkKey::service(&change.object().metadata);
        let handler = self.handler.clone();
        debug!("{:?} {}", change.event_type(), key);
        match change {
            Change::Put(svc) => {
                self.dispatcher
                    .submit(key, async move { handler.apply_service(&svc).await })
                    .await
            }
            Change::Delete(svc) => {
                self.dispatcher
                    .submit(key, async move { handler.delete_service(&svc).await })
                    .await
            }
        }
    }

    /// An Endpoint shares its key with its Service, so the resync runs on the
    /// service's lane and always reads the latest stored Endpoint.
    pub async fn on_endpoint(&self, change: Change<Endpoint>) {
        let key = WorkKey::service(&change.object().metadata);
        debug!("{:?} endpoint {}", change.event_type(), key);
        let Change::Put(endpoint) = change else {
            return;
        };
        let handler = self.handler.clone();
        self.dispatcher
            .submit(key, async move {
                let meta = &endpoint.metadata;
                handler.sync_endpoint(&meta.namespace, &meta.name).await
            })
            .await
    }

    pub async fn on_pod(&self, change: Change<Pod>) {
        let key = WorkKey::pod(&change.object().metadata);
        let handler = self.handler.clone();
        let dispatcher = self.dispatcher.clone();
        debug!("{:?} {}", change.event_type(), key);
        match change {
            Change::Put(pod) if pod.is_ready() => {
                self.dispatcher
                    .submit(key, add_to_services(handler, dispatcher, pod))
                    .await
            }
            Change::Put(pod) | Change::Delete(pod) => {
                self.dispatcher
                    .submit(key, remove_from_services(handler, dispatcher, pod))
                    .await
            }
        }
    }
}

/// Queue the pod's addition on every service that selects it.
async fn add_to_services(
    handler: ServiceHandler,
    dispatcher: Dispatcher<WorkKey>,
    pod: Pod,
) -> Result<()> {
    let services = handler.store().list_services().await?;
    for svc in services.into_iter().filter(|s| selector::matches(s, &pod)) {
        let handler = handler.clone();
        let pod = pod.clone();
        dispatcher
            .submit(WorkKey::service(&svc.metadata), async move {
                handler.add_pod(&svc, &pod).await
            })
            .await;
    }
    Ok(())
}

/// Queue the pod's removal on every service that selects it or whose
/// Endpoint still lists it.
async fn remove_from_services(
    handler: ServiceHandler,
    dispatcher: Dispatcher<WorkKey>,
    pod: Pod,
) -> Result<()> {
    let namespace = pod.metadata.namespace.clone();
    let uid = pod.metadata.uid.clone();

    let mut names: BTreeSet<String> = handler
        .store()
        .list_services()
        .await?
        .into_iter()
        .filter(|s| selector::matches(s, &pod))
        .map(|s| s.metadata.name)
        .collect();
    names.extend(
        handler
            .store()
            .list_endpoints(&namespace)
            .await?
            .into_iter()
            .filter(|e| e.find_address(&uid).is_some())
            .map(|e| e.metadata.name),
    );

    for name in names {
        let handler = handler.clone();
        let key = WorkKey::Service {
            namespace: namespace.clone(),
            name: name.clone(),
        };
        let namespace = namespace.clone();
        let uid = uid.clone();
        dispatcher
            .submit(key, async move {
                handler.remove_pod(&namespace, &name, &uid).await
            })
            .await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{endpoint_chain, service_chain};
    use crate::iptables::{MemoryTables, PacketFilter};
    use crate::testutil::{MemoryStore, NODE, pod, service};
    use pkg_types::pod::PodPhase;
    use std::sync::Arc;
    use std::time::Duration;

    async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
        let waited = tokio::time::timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(waited.is_ok(), "timed out waiting for {}", what);
    }

    fn addresses(store: &MemoryStore) -> usize {
        store
            .endpoint("default", "web")
            .map(|e| e.subsets.iter().map(|s| s.addresses.len()).sum())
            .unwrap_or(0)
    }

    #[test]
    fn work_keys_render_kind_and_name() {
        let meta = ObjectMeta::new("default", "web");
        assert_eq!(WorkKey::service(&meta).to_string(), "service default/web");
        assert_eq!(WorkKey::pod(&meta).to_string(), "pod default/web");
        assert_ne!(WorkKey::service(&meta), WorkKey::pod(&meta));
    }

    #[test]
    fn pod_watch_is_filtered_by_node() {
        let store = Arc::new(MemoryStore::default());
        let filter = PacketFilter::new(Arc::new(MemoryTables::new()));
        let config = ProxyConfig {
            node_name: Some(NODE.to_string()),
            ..ProxyConfig::default()
        };
        let handler = ServiceHandler::new(store, filter, Arc::new(config.clone()));
        let reconciler = Reconciler::new(handler, &config);
        assert_eq!(
            reconciler.pod_selector().map(|s| s.to_string()),
            Some("spec.nodeName=node-1".to_string())
        );
    }

    #[tokio::test]
    async fn watch_events_drive_rules_and_endpoints() {
        let tables = Arc::new(MemoryTables::new());
        let store = Arc::new(MemoryStore::default());
        let filter = PacketFilter::new(tables.clone());
        filter.init_services_chain().await.unwrap();
        filter.init_node_port_chain().await.unwrap();
        let config = ProxyConfig {
            node_name: Some(NODE.to_string()),
            ..ProxyConfig::default()
        };
        let handler = ServiceHandler::new(store.clone(), filter, Arc::new(config.clone()));
        let handle = Reconciler::new(handler, &config).start();
        eventually("watches", || store.watching()).await;

        let svc = service("web");
        store.put_service(svc.clone());
        store.emit_service(Change::Put(svc));
        eventually("service patch", || store.service_patches() == 1).await;
        assert!(tables.chain_exists(&service_chain("default", "web", "http")));

        let web1 = pod("web-1", "10.244.0.5");
        store.put_pod(web1.clone());
        store.emit_pod(Change::Put(web1.clone()));
        eventually("pod added", || addresses(&store) == 1).await;
        eventually("endpoint chain", || {
            tables.chain_exists(&endpoint_chain("default", "web-1", "http"))
        })
        .await;

        let mut stopped = web1.clone();
        stopped.status.phase = PodPhase::Failed;
        store.remove_pod(&web1);
        store.emit_pod(Change::Put(stopped));
        eventually("pod removed", || addresses(&store) == 0).await;
        assert!(!tables.chain_exists(&endpoint_chain("default", "web-1", "http")));

        let programmed = store.service("default", "web").unwrap();
        store.emit_service(Change::Delete(programmed));
        eventually("service chain removed", || {
            !tables.chain_exists(&service_chain("default", "web", "http"))
        })
        .await;

        store.close_watches();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("reconciler did not stop at end of stream")
            .unwrap();
    }

    async fn running() -> (Arc<MemoryTables>, Arc<MemoryStore>, tokio::task::JoinHandle<()>) {
        let tables = Arc::new(MemoryTables::new());
        let store = Arc::new(MemoryStore::default());
        let filter = PacketFilter::new(tables.clone());
        filter.init_services_chain().await.unwrap();
        filter.init_node_port_chain().await.unwrap();
        let config = ProxyConfig {
            node_name: Some(NODE.to_string()),
            ..ProxyConfig::default()
        };
        let handler = ServiceHandler::new(store.clone(), filter, Arc::new(config.clone()));
        let handle = Reconciler::new(handler, &config).start();
        eventually("watches", || store.watching()).await;

        let svc = service("web");
        store.put_service(svc.clone());
        store.emit_service(Change::Put(svc));
        eventually("endpoint", || store.endpoint("default", "web").is_some()).await;
        (tables, store, handle)
    }

    #[tokio::test]
    async fn pod_delete_event_removes_endpoint() {
        let (tables, store, handle) = running().await;
        let sep = endpoint_chain("default", "web-1", "http");

        let web1 = pod("web-1", "10.244.0.5");
        store.put_pod(web1.clone());
        store.emit_pod(Change::Put(web1.clone()));
        eventually("pod added", || addresses(&store) == 1).await;
        eventually("endpoint chain", || tables.chain_exists(&sep)).await;

        store.remove_pod(&web1);
        store.emit_pod(Change::Delete(web1));
        eventually("pod removed", || addresses(&store) == 0).await;
        eventually("endpoint chain removed", || !tables.chain_exists(&sep)).await;
        assert_eq!(tables.rules(&service_chain("default", "web", "http")).len(), 1);

        store.close_watches();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn endpoint_written_by_another_node_is_programmed() {
        let (tables, store, handle) = running().await;
        let svc_chain = service_chain("default", "web", "http");
        let sep = endpoint_chain("default", "web-9", "http");

        // Never seen on this node's pod watch.
        let mut remote = pod("web-9", "10.244.1.9");
        remote.spec.node_name = Some("node-2".to_string());
        let mut endpoint = store.endpoint("default", "web").unwrap();
        endpoint.subsets[0]
            .addresses
            .push(pkg_types::endpoint::EndpointAddress::for_pod(&remote).unwrap());
        store.put_endpoint(endpoint.clone());

        eventually("remote endpoint chain", || tables.chain_exists(&sep)).await;
        eventually("remote jump", || tables.rules(&svc_chain).len() == 2).await;
        assert!(tables.rules(&svc_chain)[1].ends_with(&sep));

        endpoint.subsets[0].addresses.clear();
        store.put_endpoint(endpoint);
        eventually("remote endpoint chain removed", || !tables.chain_exists(&sep)).await;
        assert_eq!(tables.rules(&svc_chain).len(), 1);

        store.close_watches();
        handle.await.unwrap();
    }
}
