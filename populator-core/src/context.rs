use std::sync::Arc;

use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use k8s_openapi::api::storage::v1::StorageClass;
use kube::Client;
use kube::core::DynamicObject;
use kube::runtime::reflector::Store;

use crate::config::PopulatorConfig;
use crate::events::ClaimEvents;
use crate::fabric::NotificationFabric;
use crate::grant::{GrantEvaluator, ReferenceGrant};
use crate::metrics::PopulationMetrics;
use crate::provider::Backend;
use crate::queue::WorkQueue;
use crate::writer::ClusterWriter;

/// Everything the reconciler works with: read-only caches, the write seam,
/// the notification fabric and the population back-end.
pub(crate) struct Context {
    pub config: PopulatorConfig,
    pub client: Client,
    pub writer: Arc<dyn ClusterWriter>,
    pub claims: Store<PersistentVolumeClaim>,
    pub pods: Store<Pod>,
    pub classes: Store<StorageClass>,
    pub sources: Store<DynamicObject>,
    pub grants: Store<ReferenceGrant>,
    pub fabric: Arc<NotificationFabric>,
    pub queue: Arc<WorkQueue>,
    pub backend: Backend,
    pub grant_evaluator: Arc<dyn GrantEvaluator>,
    pub metrics: PopulationMetrics,
    pub events: ClaimEvents,
}
