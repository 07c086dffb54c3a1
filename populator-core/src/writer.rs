use async_trait::async_trait;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim, Pod};
use k8s_openapi::api::storage::v1::StorageClass;
use kube::Client;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};

use crate::Result;

/// The cluster writes the reconciler performs, plus the one live volume
/// read.
///
/// Everything else is read from informer caches; keeping the writes behind
/// this seam lets reconciliation logic run against an in-memory fake in
/// tests.
#[async_trait]
pub(crate) trait ClusterWriter: Send + Sync {
    async fn create_claim(
        &self,
        namespace: &str,
        claim: &PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim>;

    async fn create_storage_class(&self, class: &StorageClass) -> Result<StorageClass>;

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod>;

    async fn delete_claim(&self, namespace: &str, name: &str) -> Result<()>;

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()>;

    async fn patch_claim_json(
        &self,
        namespace: &str,
        name: &str,
        patch: &json_patch::Patch,
    ) -> Result<()>;

    /// Live read: the volume cache only drives re-entry, never decisions.
    async fn get_volume(&self, name: &str) -> Result<Option<PersistentVolume>>;

    async fn patch_volume_merge(&self, name: &str, patch: serde_json::Value) -> Result<()>;
}

/// [`ClusterWriter`] backed by the real API server.
pub(crate) struct KubeWriter {
    client: Client,
}

impl KubeWriter {
    pub(crate) fn new(client: Client) -> Self {
        Self { client }
    }

    fn claims(&self, namespace: &str) -> Api<PersistentVolumeClaim> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn classes(&self) -> Api<StorageClass> {
        Api::all(self.client.clone())
    }

    fn volumes(&self) -> Api<PersistentVolume> {
        Api::all(self.client.clone())
    }
}

#[async_trait]
impl ClusterWriter for KubeWriter {
    async fn create_claim(
        &self,
        namespace: &str,
        claim: &PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim> {
        Ok(self
            .claims(namespace)
            .create(&PostParams::default(), claim)
            .await?)
    }

    async fn create_storage_class(&self, class: &StorageClass) -> Result<StorageClass> {
        Ok(self.classes().create(&PostParams::default(), class).await?)
    }

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod> {
        Ok(self.pods(namespace).create(&PostParams::default(), pod).await?)
    }

    async fn delete_claim(&self, namespace: &str, name: &str) -> Result<()> {
        self.claims(namespace)
            .delete(name, &DeleteParams::default())
            .await?;
        Ok(())
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        self.pods(namespace)
            .delete(name, &DeleteParams::default())
            .await?;
        Ok(())
    }

    async fn patch_claim_json(
        &self,
        namespace: &str,
        name: &str,
        patch: &json_patch::Patch,
    ) -> Result<()> {
        self.claims(namespace)
            .patch(name, &PatchParams::default(), &Patch::Json::<()>(patch.clone()))
            .await?;
        Ok(())
    }

    async fn get_volume(&self, name: &str) -> Result<Option<PersistentVolume>> {
        match self.volumes().get(name).await {
            Ok(volume) => Ok(Some(volume)),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn patch_volume_merge(&self, name: &str, patch: serde_json::Value) -> Result<()> {
        self.volumes()
            .patch(name, &PatchParams::default(), &Patch::Strategic(patch))
            .await?;
        Ok(())
    }
}
