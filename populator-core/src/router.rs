use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use kube::Resource;
use kube::runtime::watcher::Event;
use tracing::warn;

use crate::fabric::{NotificationFabric, ObjKind, obj_key};
use crate::queue::WorkQueue;

/// Translates watch events on dependent resources into reconcile-key
/// wakeups through the fabric.
///
/// User-claim events additionally self-enqueue their own reconcile key,
/// except inside the working namespace, so the controller's own prime-claim
/// writes never feed back into it.
pub struct EventRouter {
    fabric: Arc<NotificationFabric>,
    queue: Arc<WorkQueue>,
    working_namespace: String,
    /// objKey -> last routed resourceVersion; unchanged re-deliveries from
    /// relists are dropped.
    seen: Mutex<HashMap<String, String>>,
}

impl EventRouter {
    pub fn new(
        fabric: Arc<NotificationFabric>,
        queue: Arc<WorkQueue>,
        working_namespace: String,
    ) -> Self {
        Self {
            fabric,
            queue,
            working_namespace,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Handles one watch event for a resource of kind `kind`.
    pub fn handle<K: Resource>(&self, kind: ObjKind, event: &Event<K>) {
        match event {
            Event::Apply(obj) | Event::InitApply(obj) => self.route(kind, obj, false),
            Event::Delete(obj) => self.route(kind, obj, true),
            Event::Init | Event::InitDone => {}
        }
    }

    fn route<K: Resource>(&self, kind: ObjKind, obj: &K, deleted: bool) {
        let meta = obj.meta();
        let Some(name) = meta.name.as_deref() else {
            warn!("dropping {kind} event for an object without a name");
            return;
        };
        let namespace = meta.namespace.as_deref();
        let key = obj_key(kind, namespace, name);

        {
            let mut seen = self.seen.lock().unwrap();
            if deleted {
                seen.remove(&key);
            } else if let Some(rv) = meta.resource_version.as_deref() {
                if seen.get(&key).is_some_and(|last| last == rv) {
                    return;
                }
                seen.insert(key.clone(), rv.to_owned());
            }
        }

        self.fabric.wake(&key);

        if kind == ObjKind::Claim && namespace.is_some_and(|ns| ns != self.working_namespace) {
            self.queue.add(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    use super::*;

    const WORKING_NAMESPACE: &str = "populator-system";

    fn router() -> (Arc<EventRouter>, Arc<NotificationFabric>, Arc<WorkQueue>) {
        let queue = WorkQueue::new();
        let fabric = Arc::new(NotificationFabric::new(queue.clone()));
        let router = Arc::new(EventRouter::new(
            fabric.clone(),
            queue.clone(),
            WORKING_NAMESPACE.into(),
        ));
        (router, fabric, queue)
    }

    fn claim(namespace: &str, name: &str, rv: &str) -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some(namespace.into()),
                resource_version: Some(rv.into()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn user_claims_self_enqueue() {
        let (router, _fabric, queue) = router();
        router.handle(ObjKind::Claim, &Event::Apply(claim("default", "data", "1")));
        assert_eq!(queue.next().await.as_deref(), Some("claim/default/data"));
    }

    #[tokio::test]
    async fn working_namespace_claims_only_wake_subscribers() {
        let (router, fabric, queue) = router();
        fabric.subscribe("claim/default/data", "claim/populator-system/prime-uid");
        router.handle(
            ObjKind::Claim,
            &Event::Apply(claim(WORKING_NAMESPACE, "prime-uid", "1")),
        );
        assert_eq!(queue.next().await.as_deref(), Some("claim/default/data"));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn unchanged_resource_version_is_dropped() {
        let (router, _fabric, queue) = router();
        router.handle(ObjKind::Claim, &Event::Apply(claim("default", "data", "7")));
        assert_eq!(queue.len(), 1);
        queue.next().await;

        router.handle(ObjKind::Claim, &Event::InitApply(claim("default", "data", "7")));
        assert!(queue.is_empty());

        router.handle(ObjKind::Claim, &Event::Apply(claim("default", "data", "8")));
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn deletes_wake_and_clear_the_version_table() {
        let (router, fabric, queue) = router();
        fabric.subscribe("claim/default/data", "pod/populator-system/populate-uid");

        let pod = Pod {
            metadata: ObjectMeta {
                name: Some("populate-uid".into()),
                namespace: Some(WORKING_NAMESPACE.into()),
                resource_version: Some("3".into()),
                ..Default::default()
            },
            ..Default::default()
        };
        router.handle(ObjKind::Pod, &Event::Apply(pod.clone()));
        assert_eq!(queue.next().await.as_deref(), Some("claim/default/data"));

        router.handle(ObjKind::Pod, &Event::Delete(pod.clone()));
        assert_eq!(queue.next().await.as_deref(), Some("claim/default/data"));

        // Recreation with the old resource version is routed again.
        router.handle(ObjKind::Pod, &Event::Apply(pod));
        assert_eq!(queue.next().await.as_deref(), Some("claim/default/data"));
    }

    #[tokio::test]
    async fn nameless_objects_are_dropped() {
        let (router, _fabric, queue) = router();
        let pod = Pod::default();
        router.handle(ObjKind::Pod, &Event::Apply(pod));
        assert!(queue.is_empty());
    }
}
