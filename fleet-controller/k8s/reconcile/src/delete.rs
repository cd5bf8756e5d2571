use fleet_controller_k8s_api::{is_not_found, ObjectClient};
use kube::ResourceExt;
use tracing::debug;

/// Deletes `obj`. An object that does not exist counts as deleted.
pub async fn delete_resource<K, C>(client: &C, obj: &K) -> kube::Result<()>
where
    K: kube::Resource + Send + Sync,
    C: ObjectClient<K> + ?Sized,
{
    match client.delete(obj).await {
        Err(error) if is_not_found(&error) => {
            debug!(name = %obj.name_any(), "Already deleted");
            Ok(())
        }
        res => res,
    }
}
