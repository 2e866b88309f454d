use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use pkg_types::endpoint::Endpoint;
use pkg_types::pod::Pod;
use pkg_types::service::Service;
use reqwest::{Client, Response, StatusCode, Url};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::watch::{ChangeFeed, change_feed};

/// Marker the store puts in error bodies for missing keys.
const KEY_NOT_FOUND: &str = "key not found";

/// A `path=value` equality filter evaluated by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSelector {
    pub path: String,
    pub value: String,
}

impl FieldSelector {
    pub fn new(path: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            value: value.into(),
        }
    }

    /// Pods scheduled on `node`.
    pub fn node_name(node: &str) -> Self {
        Self::new(pkg_constants::network::POD_NODE_NAME_FIELD, node)
    }

    /// Objects carrying label `key=value`.
    pub fn label(key: &str, value: &str) -> Self {
        Self::new(
            format!("{}.{}", pkg_constants::network::POD_LABEL_FIELD_PREFIX, key),
            value,
        )
    }
}

impl std::fmt::Display for FieldSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}={}", self.path, self.value)
    }
}

/// Read/write access to the resources the proxy consumes and produces.
///
/// Lookups return `Ok(None)` when the store reports the key as missing.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    async fn list_services(&self) -> Result<Vec<Service>>;
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>>;
    async fn patch_service(&self, service: &Service) -> Result<()>;

    async fn list_pods(
        &self,
        namespace: &str,
        selector: Option<&FieldSelector>,
    ) -> Result<Vec<Pod>>;

    async fn get_endpoint(&self, namespace: &str, name: &str) -> Result<Option<Endpoint>>;
    async fn list_endpoints(&self, namespace: &str) -> Result<Vec<Endpoint>>;
    async fn create_endpoint(&self, endpoint: &Endpoint) -> Result<()>;
    async fn patch_endpoint(&self, endpoint: &Endpoint) -> Result<()>;

    async fn watch_services(&self) -> Result<ChangeFeed<Service>>;
    async fn watch_pods(&self, selector: Option<&FieldSelector>) -> Result<ChangeFeed<Pod>>;
    async fn watch_endpoints(&self) -> Result<ChangeFeed<Endpoint>>;
}

/// `ResourceStore` backed by the cluster store's HTTP API.
#[derive(Clone)]
pub struct HttpStore {
    client: Client,
    base: Url,
}

impl HttpStore {
    pub fn new(base: &str) -> Result<Self> {
        let client = Client::builder()
            .build()
            .context("Failed to build HTTP client")?;
        Self::with_client(client, base)
    }

    pub fn with_client(client: Client, base: &str) -> Result<Self> {
        // Trailing slash so relative joins keep any base path.
        let base = Url::parse(&format!("{}/", base.trim_end_matches('/')))
            .with_context(|| format!("Invalid store address {}", base))?;
        Ok(Self { client, base })
    }

    fn url(&self, path: &str, query: &[(&str, String)]) -> Result<Url> {
        let mut url = self
            .base
            .join(path.trim_start_matches('/'))
            .with_context(|| format!("Invalid store path {}", path))?;
        if !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (k, v) in query {
                pairs.append_pair(k, v);
            }
        }
        Ok(url)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<Option<T>> {
        let url = self.url(path, query)?;
        debug!("GET {}", url);
        let resp = self.client.get(url).send().await?;
        read_json(resp).await
    }

    async fn post_json<B: Serialize + Sync>(&self, path: &str, body: &B) -> Result<()> {
        let url = self.url(path, &[])?;
        debug!("POST {}", url);
        let resp = self.client.post(url).json(body).send().await?;
        expect_success(resp).await
    }

    async fn patch_json<B: Serialize + Sync>(&self, path: &str, body: &B) -> Result<()> {
        let url = self.url(path, &[])?;
        debug!("PATCH {}", url);
        let resp = self.client.patch(url).json(body).send().await?;
        expect_success(resp).await
    }

    async fn open_watch(&self, path: &str, query: Vec<(&str, String)>) -> Result<Response> {
        let mut query = query;
        query.push(("watch", "true".to_string()));
        let url = self.url(path, &query)?;
        debug!("WATCH {}", url);
        let resp = self.client.get(url).send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            bail!("watch {} failed with status {}: {}", path, status, body.trim());
        }
        Ok(resp)
    }
}

fn is_not_found(status: StatusCode, body: &str) -> bool {
    status == StatusCode::NOT_FOUND || body.contains(KEY_NOT_FOUND)
}

async fn read_json<T: DeserializeOwned>(resp: Response) -> Result<Option<T>> {
    let status = resp.status();
    let body = resp.text().await?;
    if status.is_success() {
        let value = serde_json::from_str(&body)
            .with_context(|| format!("Failed to decode store response: {}", body.trim()))?;
        return Ok(Some(value));
    }
    if is_not_found(status, &body) {
        return Ok(None);
    }
    bail!("request failed with status {}: {}", status, body.trim())
}

async fn expect_success(resp: Response) -> Result<()> {
    let status = resp.status();
    if status.is_success() {
        return Ok(());
    }
    let body = resp.text().await.unwrap_or_default();
    bail!("request failed with status {}: {}", status, body.trim())
}

#[async_trait]
impl ResourceStore for HttpStore {
    async fn list_services(&self) -> Result<Vec<Service>> {
        Ok(self.get_json("/services", &[]).await?.unwrap_or_default())
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>> {
        self.get_json(&format!("/namespaces/{}/services/{}", namespace, name), &[])
            .await
    }

    async fn patch_service(&self, service: &Service) -> Result<()> {
        let meta = &service.metadata;
        self.patch_json(
            &format!("/namespaces/{}/services/{}", meta.namespace, meta.name),
            service,
        )
        .await
    }

    async fn list_pods(
        &self,
        namespace: &str,
        selector: Option<&FieldSelector>,
    ) -> Result<Vec<Pod>> {
        let query: Vec<(&str, String)> = selector
            .map(|s| vec![("fieldSelector", s.to_string())])
            .unwrap_or_default();
        Ok(self
            .get_json(&format!("/namespaces/{}/pods", namespace), &query)
            .await?
            .unwrap_or_default())
    }

    async fn get_endpoint(&self, namespace: &str, name: &str) -> Result<Option<Endpoint>> {
        self.get_json(&format!("/namespaces/{}/endpoints/{}", namespace, name), &[])
            .await
    }

    async fn list_endpoints(&self, namespace: &str) -> Result<Vec<Endpoint>> {
        Ok(self
            .get_json(&format!("/namespaces/{}/endpoints", namespace), &[])
            .await?
            .unwrap_or_default())
    }

    async fn create_endpoint(&self, endpoint: &Endpoint) -> Result<()> {
        self.post_json(
            &format!("/namespaces/{}/endpoints", endpoint.metadata.namespace),
            endpoint,
        )
        .await
    }

    async fn patch_endpoint(&self, endpoint: &Endpoint) -> Result<()> {
        let meta = &endpoint.metadata;
        self.patch_json(
            &format!("/namespaces/{}/endpoints/{}", meta.namespace, meta.name),
            endpoint,
        )
        .await
    }

    async fn watch_services(&self) -> Result<ChangeFeed<Service>> {
        let resp = self.open_watch("/services", Vec::new()).await?;
        Ok(change_feed("services", resp.bytes_stream()))
    }

    async fn watch_pods(&self, selector: Option<&FieldSelector>) -> Result<ChangeFeed<Pod>> {
        let query: Vec<(&str, String)> = selector
            .map(|s| vec![("fieldSelector", s.to_string())])
            .unwrap_or_default();
        let resp = self.open_watch("/pods", query).await?;
        Ok(change_feed("pods", resp.bytes_stream()))
    }

    async fn watch_endpoints(&self) -> Result<ChangeFeed<Endpoint>> {
        let resp = self.open_watch("/endpoints", Vec::new()).await?;
        Ok(change_feed("endpoints", resp.bytes_stream()))
    }
}
