use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use k8s_openapi::api::storage::v1::StorageClass;
use kube::Client;
use kube::core::DynamicObject;

use crate::Result;

/// Everything a population callback may need about the operation in flight.
pub struct PopulatorParams {
    pub client: Client,
    pub storage_class: Option<StorageClass>,
    /// The user's claim.
    pub claim: PersistentVolumeClaim,
    /// The shadow claim the volume is provisioned against.
    pub prime_claim: PersistentVolumeClaim,
    /// The raw data source; its contents are the provider's business.
    pub source: DynamicObject,
}

/// In-process population callbacks, the alternative to the pod back-end.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Starts (or re-drives) the data transfer. Must be idempotent: it is
    /// called on every reconcile pass until [`Provider::populate_complete`]
    /// reports done.
    async fn populate(&self, params: &PopulatorParams) -> Result<()>;

    /// Cheap completion probe; `Ok(false)` keeps the claim waiting.
    async fn populate_complete(&self, params: &PopulatorParams) -> Result<bool>;
}

/// Computes the populator pod's arguments from the volume mode (`true` for
/// raw block) and the data source.
pub type ArgsFn = Arc<dyn Fn(bool, &DynamicObject) -> Result<Vec<String>> + Send + Sync>;

/// The two population back-ends the reconciler can drive.
#[derive(Clone)]
pub enum Backend {
    /// An external data-transfer pod mounting the prime claim.
    Pod { args: ArgsFn },
    /// Caller-supplied in-process callbacks.
    Provider(Arc<dyn Provider>),
}
