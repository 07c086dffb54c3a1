//! Shared fixtures for the reconciler and component tests: claim/class/pod
//! builders, an in-memory [`ClusterWriter`] and a fully wired context backed
//! by hand-fed reflector stores.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use http::Uri;
use k8s_openapi::api::core::v1::{
    ObjectReference, PersistentVolume, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    PersistentVolumeClaimStatus, PersistentVolumeSpec, Pod, PodStatus, TypedObjectReference,
};
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use kube::runtime::reflector::store::Writer;
use kube::runtime::{reflector, watcher};
use kube::{Client, Config};
use serde_json::Value;

use crate::config::{self, PopulatorConfig, SELECTED_NODE_ANNOTATION};
use crate::context::Context;
use crate::events::ClaimEvents;
use crate::fabric::NotificationFabric;
use crate::grant::{ReferenceGrant, ReferenceGrantEvaluator};
use crate::metrics::PopulationMetrics;
use crate::provider::Backend;
use crate::queue::WorkQueue;
use crate::writer::ClusterWriter;
use crate::Result;

pub(crate) const WORKING_NAMESPACE: &str = "populator-system";
pub(crate) const PREFIX: &str = "volume.populator.test";
pub(crate) const CLAIM_NAMESPACE: &str = "default";
pub(crate) const CLAIM_NAME: &str = "test-claim";
pub(crate) const CLAIM_UID: &str = "test-uid";
pub(crate) const SOURCE_GROUP: &str = "test.api.group";
pub(crate) const SOURCE_KIND: &str = "TestKind";
pub(crate) const SOURCE_NAME: &str = "test-data-source";
pub(crate) const STORAGE_CLASS_NAME: &str = "test-sc";
pub(crate) const VOLUME_NAME: &str = "test-pv";
pub(crate) const NODE_NAME: &str = "test-node";
pub(crate) const PROVISIONER: &str = "test.provisioner";

pub(crate) fn test_client() -> Client {
    let config = Config::new(Uri::from_static("http://localhost"));
    Client::try_from(config).expect("test client")
}

pub(crate) fn source_api() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk(SOURCE_GROUP, "v1alpha1", SOURCE_KIND))
}

pub(crate) fn test_config() -> PopulatorConfig {
    PopulatorConfig {
        working_namespace: WORKING_NAMESPACE.into(),
        prefix: PREFIX.into(),
        image_name: "example.io/populator:test".into(),
        mount_path: "/mnt/target".into(),
        device_path: "/dev/target".into(),
        source_resource: source_api(),
        http_endpoint: "127.0.0.1:8080".parse().expect("endpoint"),
        metrics_path: "/metrics".into(),
    }
}

pub(crate) fn source_ref(
    group: &str,
    kind: &str,
    name: &str,
    namespace: &str,
) -> TypedObjectReference {
    TypedObjectReference {
        api_group: Some(group.into()),
        kind: kind.into(),
        name: name.into(),
        namespace: Some(namespace.into()),
    }
}

/// User or prime claim. An empty `phase` leaves the status phase unset.
pub(crate) fn claim(
    name: &str,
    namespace: &str,
    node_name: &str,
    storage_class: Option<&str>,
    volume_name: &str,
    data_source_ref: Option<TypedObjectReference>,
    phase: &str,
) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(name.into()),
            namespace: Some(namespace.into()),
            uid: Some(CLAIM_UID.into()),
            annotations: Some(
                [(SELECTED_NODE_ANNOTATION.to_owned(), node_name.to_owned())].into(),
            ),
            finalizers: Some(vec!["kubernetes.io/pvc-protection".into()]),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".into()]),
            storage_class_name: storage_class.map(Into::into),
            volume_name: (!volume_name.is_empty()).then(|| volume_name.into()),
            data_source_ref,
            ..Default::default()
        }),
        status: (!phase.is_empty()).then(|| PersistentVolumeClaimStatus {
            phase: Some(phase.into()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub(crate) fn matching_claim(node_name: &str, volume_name: &str) -> PersistentVolumeClaim {
    claim(
        CLAIM_NAME,
        CLAIM_NAMESPACE,
        node_name,
        Some(STORAGE_CLASS_NAME),
        volume_name,
        Some(source_ref(SOURCE_GROUP, SOURCE_KIND, SOURCE_NAME, CLAIM_NAMESPACE)),
        "",
    )
}

pub(crate) fn prime_claim(volume_name: &str, phase: &str) -> PersistentVolumeClaim {
    claim(
        &config::prime_claim_name(CLAIM_UID),
        WORKING_NAMESPACE,
        "",
        Some(STORAGE_CLASS_NAME),
        volume_name,
        None,
        phase,
    )
}

pub(crate) fn claim_with_finalizers(finalizers: Vec<String>) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some("data".into()),
            namespace: Some("default".into()),
            finalizers: Some(finalizers),
            ..Default::default()
        },
        ..Default::default()
    }
}

pub(crate) fn data_source() -> DynamicObject {
    DynamicObject::new(SOURCE_NAME, &source_api()).within(CLAIM_NAMESPACE)
}

pub(crate) fn storage_class(name: &str, binding_mode: &str) -> StorageClass {
    StorageClass {
        metadata: ObjectMeta {
            name: Some(name.into()),
            ..Default::default()
        },
        provisioner: PROVISIONER.into(),
        volume_binding_mode: Some(binding_mode.into()),
        ..Default::default()
    }
}

pub(crate) fn populator_pod(phase: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(config::populator_pod_name(CLAIM_UID)),
            namespace: Some(WORKING_NAMESPACE.into()),
            ..Default::default()
        },
        status: Some(PodStatus {
            phase: Some(phase.into()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub(crate) fn volume(claim_name: &str, claim_namespace: &str, claim_uid: &str) -> PersistentVolume {
    PersistentVolume {
        metadata: ObjectMeta {
            name: Some(VOLUME_NAME.into()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeSpec {
            claim_ref: Some(ObjectReference {
                name: Some(claim_name.into()),
                namespace: Some(claim_namespace.into()),
                uid: Some(claim_uid.into()),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// [`ClusterWriter`] recording every write for assertions.
#[derive(Default)]
pub(crate) struct FakeWriter {
    pub created_claims: Mutex<Vec<PersistentVolumeClaim>>,
    pub created_classes: Mutex<Vec<StorageClass>>,
    pub created_pods: Mutex<Vec<Pod>>,
    pub deleted_claims: Mutex<Vec<String>>,
    pub deleted_pods: Mutex<Vec<String>>,
    /// (namespace, name, patch) triples from JSON claim patches.
    pub claim_patches: Mutex<Vec<(String, String, Value)>>,
    pub volumes: Mutex<HashMap<String, PersistentVolume>>,
    pub volume_patches: Mutex<Vec<(String, Value)>>,
}

impl FakeWriter {
    pub(crate) fn with_volume(volume: PersistentVolume) -> Self {
        let writer = Self::default();
        let name = volume.metadata.name.clone().expect("volume name");
        writer.volumes.lock().unwrap().insert(name, volume);
        writer
    }

    pub(crate) fn write_count(&self) -> usize {
        self.created_claims.lock().unwrap().len()
            + self.created_classes.lock().unwrap().len()
            + self.created_pods.lock().unwrap().len()
            + self.deleted_claims.lock().unwrap().len()
            + self.deleted_pods.lock().unwrap().len()
            + self.claim_patches.lock().unwrap().len()
            + self.volume_patches.lock().unwrap().len()
    }
}

#[async_trait]
impl ClusterWriter for FakeWriter {
    async fn create_claim(
        &self,
        _namespace: &str,
        claim: &PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim> {
        self.created_claims.lock().unwrap().push(claim.clone());
        Ok(claim.clone())
    }

    async fn create_storage_class(&self, class: &StorageClass) -> Result<StorageClass> {
        self.created_classes.lock().unwrap().push(class.clone());
        Ok(class.clone())
    }

    async fn create_pod(&self, _namespace: &str, pod: &Pod) -> Result<Pod> {
        self.created_pods.lock().unwrap().push(pod.clone());
        Ok(pod.clone())
    }

    async fn delete_claim(&self, _namespace: &str, name: &str) -> Result<()> {
        self.deleted_claims.lock().unwrap().push(name.to_owned());
        Ok(())
    }

    async fn delete_pod(&self, _namespace: &str, name: &str) -> Result<()> {
        self.deleted_pods.lock().unwrap().push(name.to_owned());
        Ok(())
    }

    async fn patch_claim_json(
        &self,
        namespace: &str,
        name: &str,
        patch: &json_patch::Patch,
    ) -> Result<()> {
        self.claim_patches.lock().unwrap().push((
            namespace.to_owned(),
            name.to_owned(),
            serde_json::to_value(patch)?,
        ));
        Ok(())
    }

    async fn get_volume(&self, name: &str) -> Result<Option<PersistentVolume>> {
        Ok(self.volumes.lock().unwrap().get(name).cloned())
    }

    async fn patch_volume_merge(&self, name: &str, patch: Value) -> Result<()> {
        self.volume_patches
            .lock()
            .unwrap()
            .push((name.to_owned(), patch));
        Ok(())
    }
}

/// Builds a reconciler context whose caches hold exactly the given objects.
#[derive(Default)]
pub(crate) struct ContextBuilder {
    pub claims: Vec<PersistentVolumeClaim>,
    pub pods: Vec<Pod>,
    pub classes: Vec<StorageClass>,
    pub sources: Vec<DynamicObject>,
    pub grants: Vec<ReferenceGrant>,
    pub backend: Option<Backend>,
    pub writer: Option<FakeWriter>,
}

impl ContextBuilder {
    pub(crate) fn build(self) -> (Context, Arc<FakeWriter>) {
        let queue = WorkQueue::new();
        let fabric = Arc::new(NotificationFabric::new(queue.clone()));

        let (claims, mut claim_writer) = reflector::store();
        for claim in self.claims {
            claim_writer.apply_watcher_event(&watcher::Event::Apply(claim));
        }
        let (pods, mut pod_writer) = reflector::store();
        for pod in self.pods {
            pod_writer.apply_watcher_event(&watcher::Event::Apply(pod));
        }
        let (classes, mut class_writer) = reflector::store();
        for class in self.classes {
            class_writer.apply_watcher_event(&watcher::Event::Apply(class));
        }
        let (grants, mut grant_writer) = reflector::store();
        for grant in self.grants {
            grant_writer.apply_watcher_event(&watcher::Event::Apply(grant));
        }
        let mut source_writer = Writer::new(source_api());
        let sources = source_writer.as_reader();
        for source in self.sources {
            source_writer.apply_watcher_event(&watcher::Event::Apply(source));
        }

        let writer = Arc::new(self.writer.unwrap_or_default());
        let client = test_client();
        let config = test_config();
        let events = ClaimEvents::new(client.clone(), &config.controller_name());
        let backend = self.backend.unwrap_or_else(|| Backend::Pod {
            args: Arc::new(|_, _| Ok(Vec::new())),
        });

        let context = Context {
            config,
            client,
            writer: writer.clone(),
            claims,
            pods,
            classes,
            sources,
            grants,
            fabric,
            queue,
            backend,
            grant_evaluator: Arc::new(ReferenceGrantEvaluator),
            metrics: PopulationMetrics::new("populator-test"),
            events,
        };
        (context, writer)
    }
}
