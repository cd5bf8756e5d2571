use crate::backoff::Backoff;
use fleet_controller_core::RetryPolicy;
use fleet_controller_k8s_api::ObjectClient;
use kube::{Resource, ResourceExt};
use tracing::debug;

/// Writes `obj`'s status subresource.
///
/// On conflict only the resourceVersion is refreshed from the live object;
/// the status carried by `obj` is written again unchanged.
pub async fn update_resource_status<K, C>(
    client: &C,
    obj: &mut K,
    retry: RetryPolicy,
) -> kube::Result<K>
where
    K: Resource + Send + Sync,
    C: ObjectClient<K> + ?Sized,
{
    let mut backoff = Backoff::new(retry);
    loop {
        let error = match client.replace_status(obj).await {
            Ok(updated) => return Ok(updated),
            Err(error) => error,
        };
        if !backoff.retry(&error).await {
            return Err(error);
        }
        debug!(name = %obj.name_any(), attempt = backoff.attempt(), "Conflict; retrying status update");
        match client.get(obj).await? {
            Some(live) => obj.meta_mut().resource_version = live.meta().resource_version.clone(),
            None => return Err(error),
        }
    }
}
