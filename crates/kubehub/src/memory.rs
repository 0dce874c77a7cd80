//! In-memory cluster fake.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use keel_core::{ClientError, ClusterClient, ObjectKey};
use rustc_hash::FxHashMap;
use serde_json::Value as Json;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Apply(ObjectKey),
    Delete(ObjectKey),
    Get(ObjectKey),
}

struct Stored {
    obj: Json,
    generation: u64,
}

#[derive(Default)]
struct Inner {
    objects: BTreeMap<ObjectKey, Stored>,
    calls: Vec<Call>,
    /// Number of writes that changed stored state.
    changes: u64,
    failures: FxHashMap<ObjectKey, ClientError>,
}

/// Object store keyed by [`ObjectKey`]. Applying identical desired content
/// is a no-op; server-populated `status` survives re-applies.
#[derive(Default)]
pub struct MemoryCluster {
    inner: Mutex<Inner>,
}

fn without_status(v: &Json) -> Json {
    let mut v = v.clone();
    if let Some(obj) = v.as_object_mut() {
        obj.remove("status");
    }
    v
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn len(&self) -> usize {
        self.lock().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().objects.is_empty()
    }

    pub fn keys(&self) -> Vec<ObjectKey> {
        self.lock().objects.keys().cloned().collect()
    }

    pub fn object(&self, key: &ObjectKey) -> Option<Json> {
        self.lock().objects.get(key).map(|s| s.obj.clone())
    }

    pub fn generation(&self, key: &ObjectKey) -> Option<u64> {
        self.lock().objects.get(key).map(|s| s.generation)
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub fn changes(&self) -> u64 {
        self.lock().changes
    }

    /// The next call touching `key` fails with `err`.
    pub fn fail_next(&self, key: ObjectKey, err: ClientError) {
        self.lock().failures.insert(key, err);
    }

    /// Simulate the platform writing `status` on an existing object.
    pub fn set_status(&self, key: &ObjectKey, status: Json) -> bool {
        match self.lock().objects.get_mut(key) {
            Some(s) => {
                s.obj["status"] = status;
                true
            }
            None => false,
        }
    }
}

#[async_trait::async_trait]
impl ClusterClient for MemoryCluster {
    async fn apply(&self, obj: &Json) -> Result<(), ClientError> {
        let key = ObjectKey::from_object(obj)?;
        let mut guard = self.lock();
        let inner = &mut *guard;
        inner.calls.push(Call::Apply(key.clone()));
        if let Some(err) = inner.failures.remove(&key) {
            return Err(err);
        }
        let desired = without_status(obj);
        let changed = match inner.objects.get_mut(&key) {
            Some(cur) if without_status(&cur.obj) == desired => false,
            Some(cur) => {
                let status = cur.obj.get("status").cloned();
                cur.obj = desired;
                if let Some(s) = status {
                    cur.obj["status"] = s;
                }
                cur.generation += 1;
                true
            }
            None => {
                inner.objects.insert(key, Stored { obj: desired, generation: 1 });
                true
            }
        };
        if changed {
            inner.changes += 1;
        }
        Ok(())
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), ClientError> {
        let mut inner = self.lock();
        inner.calls.push(Call::Delete(key.clone()));
        if let Some(err) = inner.failures.remove(key) {
            return Err(err);
        }
        match inner.objects.remove(key) {
            Some(_) => {
                inner.changes += 1;
                Ok(())
            }
            None => Err(ClientError::NotFound(key.to_string())),
        }
    }

    async fn get(&self, key: &ObjectKey) -> Result<Option<Json>, ClientError> {
        let mut inner = self.lock();
        inner.calls.push(Call::Get(key.clone()));
        if let Some(err) = inner.failures.remove(key) {
            return Err(err);
        }
        Ok(inner.objects.get(key).map(|s| s.obj.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cm(data: &str) -> Json {
        serde_json::json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": { "name": "cfg", "namespace": "storage" },
            "data": { "k": data }
        })
    }

    #[tokio::test]
    async fn reapplying_identical_content_changes_nothing() {
        let c = MemoryCluster::new();
        let key = ObjectKey::from_object(&cm("a")).unwrap();
        c.apply(&cm("a")).await.unwrap();
        c.apply(&cm("a")).await.unwrap();
        assert_eq!(c.changes(), 1);
        assert_eq!(c.generation(&key), Some(1));

        c.apply(&cm("b")).await.unwrap();
        assert_eq!(c.generation(&key), Some(2));
    }

    #[tokio::test]
    async fn status_survives_reapply() {
        let c = MemoryCluster::new();
        let key = ObjectKey::from_object(&cm("a")).unwrap();
        c.apply(&cm("a")).await.unwrap();
        assert!(c.set_status(&key, serde_json::json!({ "ok": true })));
        c.apply(&cm("b")).await.unwrap();
        assert_eq!(c.object(&key).unwrap()["status"]["ok"], true);
    }

    #[tokio::test]
    async fn delete_absent_reports_not_found_and_failures_fire_once() {
        let c = MemoryCluster::new();
        let key = ObjectKey::from_object(&cm("a")).unwrap();
        assert!(c.delete(&key).await.unwrap_err().is_not_found());

        c.fail_next(key.clone(), ClientError::Conflict("busy".into()));
        assert!(matches!(c.apply(&cm("a")).await, Err(ClientError::Conflict(_))));
        c.apply(&cm("a")).await.unwrap();
        assert_eq!(c.len(), 1);
        assert_eq!(c.calls().len(), 3);
    }
}
