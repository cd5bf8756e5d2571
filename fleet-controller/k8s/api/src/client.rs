use crate::object::{DynamicClient, TypedClient};
use anyhow::{bail, Result};
use async_trait::async_trait;
use futures::{prelude::*, stream::BoxStream};
use kube::{
    api::{Api, ApiResource, DynamicObject},
    runtime::watcher,
    Resource,
};
use serde::de::DeserializeOwned;
use std::{fmt, sync::Arc};

pub type WatchStream<K> = BoxStream<'static, watcher::Result<watcher::Event<K>>>;

/// The capabilities a connected cluster offers to the cache and the handle.
#[async_trait]
pub trait ClusterClient: Clone + Send + Sync + 'static {
    /// The API server's base URL.
    fn server(&self) -> String;

    /// Issues a cheap liveness read against the API server.
    async fn ping(&self) -> Result<()>;

    async fn server_version(&self) -> Result<String>;

    /// Whether the API server serves the given kind.
    async fn api_resource_exists(&self, resource: &ApiResource) -> bool;

    fn watch<K>(&self, params: watcher::Config) -> WatchStream<K>
    where
        K: Resource<DynamicType = ()> + Clone + DeserializeOwned + fmt::Debug + Send + 'static;

    fn watch_dynamic(
        &self,
        resource: &ApiResource,
        params: watcher::Config,
    ) -> WatchStream<DynamicObject>;
}

/// A client bundle backed by a real API server.
#[derive(Clone)]
pub struct KubeClient {
    client: kube::Client,
    config: Option<Arc<kube::Config>>,
    server: Arc<str>,
}

// === impl KubeClient ===

impl KubeClient {
    pub fn new(client: kube::Client, config: kube::Config) -> Self {
        let server = config.cluster_url.to_string().into();
        Self {
            client,
            config: Some(Arc::new(config)),
            server,
        }
    }

    /// Wraps a client whose configuration was resolved elsewhere.
    pub fn from_client(client: kube::Client, server: impl Into<String>) -> Self {
        Self {
            client,
            config: None,
            server: server.into().into(),
        }
    }

    pub fn client(&self) -> kube::Client {
        self.client.clone()
    }

    pub fn rest_config(&self) -> Option<&kube::Config> {
        self.config.as_deref()
    }

    pub fn typed(&self) -> TypedClient {
        TypedClient::new(self.client.clone())
    }

    pub fn dynamic(&self, resource: ApiResource) -> DynamicClient {
        DynamicClient::new(self.client.clone(), resource)
    }
}

impl fmt::Debug for KubeClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KubeClient")
            .field("server", &self.server)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ClusterClient for KubeClient {
    fn server(&self) -> String {
        self.server.to_string()
    }

    async fn ping(&self) -> Result<()> {
        let req = http::Request::get("/livez").body(Vec::new())?;
        let body = self.client.request_text(req).await?;
        if body.trim() != "ok" {
            bail!("unexpected /livez response: {}", body.trim());
        }
        Ok(())
    }

    async fn server_version(&self) -> Result<String> {
        let info = self.client.apiserver_version().await?;
        Ok(info.git_version)
    }

    async fn api_resource_exists(&self, resource: &ApiResource) -> bool {
        let resources = if resource.group.is_empty() {
            self.client
                .list_core_api_resources(&resource.version)
                .await
        } else {
            self.client
                .list_api_group_resources(&resource.api_version)
                .await
        };
        match resources {
            Ok(list) => list.resources.iter().any(|r| r.kind == resource.kind),
            Err(error) => {
                tracing::debug!(api_version = %resource.api_version, %error, "API group is not served");
                false
            }
        }
    }

    fn watch<K>(&self, params: watcher::Config) -> WatchStream<K>
    where
        K: Resource<DynamicType = ()> + Clone + DeserializeOwned + fmt::Debug + Send + 'static,
    {
        watcher(Api::<K>::all(self.client.clone()), params).boxed()
    }

    fn watch_dynamic(
        &self,
        resource: &ApiResource,
        params: watcher::Config,
    ) -> WatchStream<DynamicObject> {
        watcher(
            Api::<DynamicObject>::all_with(self.client.clone(), resource),
            params,
        )
        .boxed()
    }
}
