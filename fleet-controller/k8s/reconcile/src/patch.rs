use fleet_controller_k8s_api::ObjectClient;
use serde::Serialize;
use serde_json::{Map, Value};

/// Sends the JSON merge patch that turns `old` into `new`.
///
/// Conflicts are returned to the caller as-is.
pub async fn patch_resource<K, C>(client: &C, old: &K, new: &K) -> kube::Result<K>
where
    K: Serialize + Send + Sync,
    C: ObjectClient<K> + ?Sized,
{
    let old_value = serde_json::to_value(old).map_err(kube::Error::SerdeError)?;
    let new_value = serde_json::to_value(new).map_err(kube::Error::SerdeError)?;
    let patch = merge_patch(&old_value, &new_value);
    client.patch(new, &patch).await
}

/// Computes an RFC 7386 merge patch from `old` to `new`.
///
/// Keys missing from `new` are set to null; arrays and scalars are replaced
/// whole.
pub fn merge_patch(old: &Value, new: &Value) -> Value {
    match (old, new) {
        (Value::Object(old), Value::Object(new)) => {
            let mut patch = Map::new();
            for (key, value) in new {
                match old.get(key) {
                    Some(prior) if prior == value => {}
                    Some(prior) => {
                        patch.insert(key.clone(), merge_patch(prior, value));
                    }
                    None => {
                        patch.insert(key.clone(), value.clone());
                    }
                }
            }
            for key in old.keys() {
                if !new.contains_key(key) {
                    patch.insert(key.clone(), Value::Null);
                }
            }
            Value::Object(patch)
        }
        (_, new) => new.clone(),
    }
}
