use async_trait::async_trait;
use k8s_openapi::{ClusterResourceScope, NamespaceResourceScope};
use kube::{
    api::{Api, ApiResource, DeleteParams, DynamicObject, Patch, PatchParams, PostParams},
    Resource, ResourceExt,
};
use serde::{de::DeserializeOwned, Serialize};
use std::fmt;

const FIELD_MANAGER: &str = "fleet-controller";

/// Object-centric access to one kind on one API server.
///
/// Every operation addresses the object by the namespace and name in its
/// metadata.
#[async_trait]
pub trait ObjectClient<K>: Send + Sync {
    /// Fetches the live copy of `obj`, if it exists.
    async fn get(&self, obj: &K) -> kube::Result<Option<K>>;

    async fn create(&self, obj: &K) -> kube::Result<K>;

    /// Replaces the object. Fails with a conflict if `obj`'s resourceVersion
    /// is stale.
    async fn replace(&self, obj: &K) -> kube::Result<K>;

    /// Replaces the status subresource, with the same concurrency check as
    /// `replace`.
    async fn replace_status(&self, obj: &K) -> kube::Result<K>;

    /// Applies a JSON merge patch.
    async fn patch(&self, obj: &K, patch: &serde_json::Value) -> kube::Result<K>;

    async fn delete(&self, obj: &K) -> kube::Result<()>;
}

/// Builds an `Api` for a statically typed kind in the object's scope.
pub trait ApiScope: Sized {
    fn api<K>(client: kube::Client, namespace: Option<&str>) -> Api<K>
    where
        K: Resource<Scope = Self, DynamicType = ()>;
}

/// Addresses any statically typed kind.
#[derive(Clone)]
pub struct TypedClient {
    client: kube::Client,
}

/// Addresses one kind, known only at runtime.
#[derive(Clone)]
pub struct DynamicClient {
    client: kube::Client,
    resource: ApiResource,
}

pub fn is_conflict(error: &kube::Error) -> bool {
    matches!(error, kube::Error::Api(response) if response.code == 409)
}

pub fn is_not_found(error: &kube::Error) -> bool {
    matches!(error, kube::Error::Api(response) if response.code == 404)
}

fn post_params() -> PostParams {
    PostParams {
        field_manager: Some(FIELD_MANAGER.to_string()),
        ..PostParams::default()
    }
}

fn patch_params() -> PatchParams {
    PatchParams {
        field_manager: Some(FIELD_MANAGER.to_string()),
        ..PatchParams::default()
    }
}

async fn get_opt<K>(api: Api<K>, obj: &K) -> kube::Result<Option<K>>
where
    K: Resource + Clone + DeserializeOwned + fmt::Debug,
{
    api.get_opt(&obj.name_any()).await
}

async fn create<K>(api: Api<K>, obj: &K) -> kube::Result<K>
where
    K: Resource + Clone + DeserializeOwned + Serialize + fmt::Debug,
{
    api.create(&post_params(), obj).await
}

async fn replace<K>(api: Api<K>, obj: &K) -> kube::Result<K>
where
    K: Resource + Clone + DeserializeOwned + Serialize + fmt::Debug,
{
    api.replace(&obj.name_any(), &post_params(), obj).await
}

async fn replace_status<K>(api: Api<K>, obj: &K) -> kube::Result<K>
where
    K: Resource + Clone + DeserializeOwned + Serialize + fmt::Debug,
{
    let data = serde_json::to_vec(obj).map_err(kube::Error::SerdeError)?;
    api.replace_status(&obj.name_any(), &post_params(), data)
        .await
}

async fn patch<K>(api: Api<K>, obj: &K, patch: &serde_json::Value) -> kube::Result<K>
where
    K: Resource + Clone + DeserializeOwned + fmt::Debug,
{
    api.patch(&obj.name_any(), &patch_params(), &Patch::Merge(patch))
        .await
}

async fn delete<K>(api: Api<K>, obj: &K) -> kube::Result<()>
where
    K: Resource + Clone + DeserializeOwned + fmt::Debug,
{
    api.delete(&obj.name_any(), &DeleteParams::default())
        .await
        .map(|_| ())
}

// === impl ApiScope ===

impl ApiScope for NamespaceResourceScope {
    fn api<K>(client: kube::Client, namespace: Option<&str>) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
    {
        match namespace {
            Some(ns) => Api::namespaced(client, ns),
            None => Api::default_namespaced(client),
        }
    }
}

impl ApiScope for ClusterResourceScope {
    fn api<K>(client: kube::Client, _: Option<&str>) -> Api<K>
    where
        K: Resource<Scope = ClusterResourceScope, DynamicType = ()>,
    {
        Api::all(client)
    }
}

// === impl TypedClient ===

impl TypedClient {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }

    fn api<K>(&self, obj: &K) -> Api<K>
    where
        K: Resource<DynamicType = ()>,
        K::Scope: ApiScope,
    {
        <K::Scope as ApiScope>::api(self.client.clone(), obj.meta().namespace.as_deref())
    }
}

#[async_trait]
impl<K> ObjectClient<K> for TypedClient
where
    K: Resource<DynamicType = ()>
        + Clone
        + DeserializeOwned
        + Serialize
        + fmt::Debug
        + Send
        + Sync
        + 'static,
    K::Scope: ApiScope,
{
    async fn get(&self, obj: &K) -> kube::Result<Option<K>> {
        get_opt(self.api(obj), obj).await
    }

    async fn create(&self, obj: &K) -> kube::Result<K> {
        create(self.api(obj), obj).await
    }

    async fn replace(&self, obj: &K) -> kube::Result<K> {
        replace(self.api(obj), obj).await
    }

    async fn replace_status(&self, obj: &K) -> kube::Result<K> {
        replace_status(self.api(obj), obj).await
    }

    async fn patch(&self, obj: &K, patch: &serde_json::Value) -> kube::Result<K> {
        self::patch(self.api(obj), obj, patch).await
    }

    async fn delete(&self, obj: &K) -> kube::Result<()> {
        delete(self.api(obj), obj).await
    }
}

// === impl DynamicClient ===

impl DynamicClient {
    pub fn new(client: kube::Client, resource: ApiResource) -> Self {
        Self { client, resource }
    }

    pub fn resource(&self) -> &ApiResource {
        &self.resource
    }

    fn api(&self, obj: &DynamicObject) -> Api<DynamicObject> {
        match obj.metadata.namespace.as_deref() {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &self.resource),
            None => Api::all_with(self.client.clone(), &self.resource),
        }
    }
}

#[async_trait]
impl ObjectClient<DynamicObject> for DynamicClient {
    async fn get(&self, obj: &DynamicObject) -> kube::Result<Option<DynamicObject>> {
        get_opt(self.api(obj), obj).await
    }

    async fn create(&self, obj: &DynamicObject) -> kube::Result<DynamicObject> {
        create(self.api(obj), obj).await
    }

    async fn replace(&self, obj: &DynamicObject) -> kube::Result<DynamicObject> {
        replace(self.api(obj), obj).await
    }

    async fn replace_status(&self, obj: &DynamicObject) -> kube::Result<DynamicObject> {
        replace_status(self.api(obj), obj).await
    }

    async fn patch(
        &self,
        obj: &DynamicObject,
        patch: &serde_json::Value,
    ) -> kube::Result<DynamicObject> {
        self::patch(self.api(obj), obj, patch).await
    }

    async fn delete(&self, obj: &DynamicObject) -> kube::Result<()> {
        delete(self.api(obj), obj).await
    }
}
