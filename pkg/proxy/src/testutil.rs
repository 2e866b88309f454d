//! In-memory resource store and fixtures for reconciliation tests.

use anyhow::Result;
use async_trait::async_trait;
use pkg_state::{Change, ChangeFeed, FieldSelector, ResourceStore};
use pkg_types::endpoint::Endpoint;
use pkg_types::meta::ObjectMeta;
use pkg_types::pod::{Pod, PodPhase};
use pkg_types::service::{Service, ServicePort};
use std::collections::BTreeMap;
use std::sync::Mutex;
use tokio::sync::broadcast;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;

pub const NODE: &str = "node-1";

/// Service `default/<name>` selecting `app=<name>` with port `http` 80 -> 8080.
pub fn service(name: &str) -> Service {
    let mut svc = Service::default();
    svc.metadata = ObjectMeta::new("default", name);
    svc.metadata.uid = format!("uid-svc-{}", name);
    svc.spec
        .selector
        .insert("app".to_string(), name.to_string());
    svc.spec.ports.push(ServicePort {
        name: "http".to_string(),
        protocol: "TCP".to_string(),
        port: 80,
        target_port: 8080,
        node_port: None,
    });
    svc
}

/// Running pod `default/<name>` labelled `app=web` on `NODE`. An empty `ip`
/// leaves the pod without an address.
pub fn pod(name: &str, ip: &str) -> Pod {
    let mut pod = Pod::default();
    pod.metadata = ObjectMeta::new("default", name);
    pod.metadata.uid = format!("uid-{}", name);
    pod.metadata
        .labels
        .insert("app".to_string(), "web".to_string());
    pod.spec.node_name = Some(NODE.to_string());
    pod.status.phase = PodPhase::Running;
    pod.status.pod_ip = (!ip.is_empty()).then(|| ip.to_string());
    pod
}

fn selects(selector: Option<&FieldSelector>, pod: &Pod) -> bool {
    let Some(selector) = selector else {
        return true;
    };
    if selector.path == pkg_constants::network::POD_NODE_NAME_FIELD {
        return pod.spec.node_name.as_deref() == Some(selector.value.as_str());
    }
    selector
        .path
        .strip_prefix("metadata.labels.")
        .and_then(|key| pod.metadata.labels.get(key))
        .is_some_and(|v| *v == selector.value)
}

struct Inner {
    services: BTreeMap<String, Service>,
    pods: BTreeMap<String, Pod>,
    endpoints: BTreeMap<String, Endpoint>,
    service_patches: usize,
    service_events: Option<broadcast::Sender<Change<Service>>>,
    pod_events: Option<broadcast::Sender<Change<Pod>>>,
    endpoint_events: Option<broadcast::Sender<Change<Endpoint>>>,
}

impl Inner {
    /// Store a written Endpoint and publish it, as the real store does.
    fn write_endpoint(&mut self, endpoint: &Endpoint) {
        self.endpoints
            .insert(endpoint.metadata.key(), endpoint.clone());
        if let Some(tx) = &self.endpoint_events {
            let _ = tx.send(Change::Put(endpoint.clone()));
        }
    }
}

fn open<T>(tx: &Option<broadcast::Sender<T>>) -> bool {
    tx.as_ref().is_some_and(|tx| tx.receiver_count() > 0)
}

pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner {
                services: BTreeMap::new(),
                pods: BTreeMap::new(),
                endpoints: BTreeMap::new(),
                service_patches: 0,
                service_events: Some(broadcast::channel(64).0),
                pod_events: Some(broadcast::channel(64).0),
                endpoint_events: Some(broadcast::channel(64).0),
            }),
        }
    }
}

impl MemoryStore {
    pub fn put_service(&self, service: Service) {
        let key = service.metadata.key();
        self.inner.lock().unwrap().services.insert(key, service);
    }

    pub fn put_pod(&self, pod: Pod) {
        let key = pod.metadata.key();
        self.inner.lock().unwrap().pods.insert(key, pod);
    }

    pub fn remove_pod(&self, pod: &Pod) {
        self.inner.lock().unwrap().pods.remove(&pod.metadata.key());
    }

    /// Write an Endpoint as another node's proxy would.
    pub fn put_endpoint(&self, endpoint: Endpoint) {
        self.inner.lock().unwrap().write_endpoint(&endpoint);
    }

    pub fn service(&self, namespace: &str, name: &str) -> Option<Service> {
        let key = format!("{}/{}", namespace, name);
        self.inner.lock().unwrap().services.get(&key).cloned()
    }

    pub fn endpoint(&self, namespace: &str, name: &str) -> Option<Endpoint> {
        let key = format!("{}/{}", namespace, name);
        self.inner.lock().unwrap().endpoints.get(&key).cloned()
    }

    pub fn service_patches(&self) -> usize {
        self.inner.lock().unwrap().service_patches
    }

    /// Publish a change to open service watches.
    pub fn emit_service(&self, change: Change<Service>) {
        if let Some(tx) = &self.inner.lock().unwrap().service_events {
            let _ = tx.send(change);
        }
    }

    pub fn emit_pod(&self, change: Change<Pod>) {
        if let Some(tx) = &self.inner.lock().unwrap().pod_events {
            let _ = tx.send(change);
        }
    }

    /// End every open watch, as if the store closed the connections.
    pub fn close_watches(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.service_events = None;
        inner.pod_events = None;
        inner.endpoint_events = None;
    }

    /// Whether a watch of each kind is currently open.
    pub fn watching(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        open(&inner.service_events) && open(&inner.pod_events) && open(&inner.endpoint_events)
    }
}

#[async_trait]
impl ResourceStore for MemoryStore {
    async fn list_services(&self) -> Result<Vec<Service>> {
        Ok(self.inner.lock().unwrap().services.values().cloned().collect())
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>> {
        Ok(self.service(namespace, name))
    }

    async fn patch_service(&self, service: &Service) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .services
            .insert(service.metadata.key(), service.clone());
        inner.service_patches += 1;
        Ok(())
    }

    async fn list_pods(
        &self,
        namespace: &str,
        selector: Option<&FieldSelector>,
    ) -> Result<Vec<Pod>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .pods
            .values()
            .filter(|p| p.metadata.namespace == namespace && selects(selector, p))
            .cloned()
            .collect())
    }

    async fn get_endpoint(&self, namespace: &str, name: &str) -> Result<Option<Endpoint>> {
        Ok(self.endpoint(namespace, name))
    }

    async fn list_endpoints(&self, namespace: &str) -> Result<Vec<Endpoint>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .endpoints
            .values()
            .filter(|e| e.metadata.namespace == namespace)
            .cloned()
            .collect())
    }

    async fn create_endpoint(&self, endpoint: &Endpoint) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let key = endpoint.metadata.key();
        anyhow::ensure!(!inner.endpoints.contains_key(&key), "endpoint {} exists", key);
        inner.write_endpoint(endpoint);
        Ok(())
    }

    async fn patch_endpoint(&self, endpoint: &Endpoint) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let key = endpoint.metadata.key();
        anyhow::ensure!(inner.endpoints.contains_key(&key), "key not found");
        inner.write_endpoint(endpoint);
        Ok(())
    }

    async fn watch_services(&self) -> Result<ChangeFeed<Service>> {
        let rx = self
            .inner
            .lock()
            .unwrap()
            .service_events
            .as_ref()
            .map(|tx| tx.subscribe())
            .ok_or_else(|| anyhow::anyhow!("store closed"))?;
        Ok(Box::pin(BroadcastStream::new(rx).filter_map(|r| r.ok())))
    }

    async fn watch_pods(&self, selector: Option<&FieldSelector>) -> Result<ChangeFeed<Pod>> {
        let rx = self
            .inner
            .lock()
            .unwrap()
            .pod_events
            .as_ref()
            .map(|tx| tx.subscribe())
            .ok_or_else(|| anyhow::anyhow!("store closed"))?;
        let selector = selector.cloned();
        Ok(Box::pin(BroadcastStream::new(rx).filter_map(move |r| {
            r.ok().filter(|change: &Change<Pod>| selects(selector.as_ref(), change.object()))
        })))
    }

    async fn watch_endpoints(&self) -> Result<ChangeFeed<Endpoint>> {
        let rx = self
            .inner
            .lock()
            .unwrap()
            .endpoint_events
            .as_ref()
            .map(|tx| tx.subscribe())
            .ok_or_else(|| anyhow::anyhow!("store closed"))?;
        Ok(Box::pin(BroadcastStream::new(rx).filter_map(|r| r.ok())))
    }
}
