use crate::backoff::Backoff;
use fleet_controller_core::RetryPolicy;
use fleet_controller_k8s_api::ObjectClient;
use kube::{Resource, ResourceExt};
use tracing::debug;

/// Creates `obj` or replaces the live object with it.
///
/// The live object's resourceVersion is copied onto `obj` before the replace,
/// so `obj` wins over whatever is stored. A conflict between the read and the
/// write restarts from the read, up to the policy's attempt limit.
pub async fn apply_resource<K, C>(client: &C, obj: &mut K, retry: RetryPolicy) -> kube::Result<K>
where
    K: Resource + Send + Sync,
    C: ObjectClient<K> + ?Sized,
{
    let mut backoff = Backoff::new(retry);
    loop {
        let error = match apply_once(client, obj).await {
            Ok(applied) => return Ok(applied),
            Err(error) => error,
        };
        if !backoff.retry(&error).await {
            return Err(error);
        }
        debug!(name = %obj.name_any(), attempt = backoff.attempt(), "Conflict; retrying apply");
    }
}

async fn apply_once<K, C>(client: &C, obj: &mut K) -> kube::Result<K>
where
    K: Resource + Send + Sync,
    C: ObjectClient<K> + ?Sized,
{
    match client.get(obj).await? {
        None => {
            obj.meta_mut().resource_version = None;
            client.create(obj).await
        }
        Some(live) => {
            obj.meta_mut().resource_version = live.meta().resource_version.clone();
            client.replace(obj).await
        }
    }
}
