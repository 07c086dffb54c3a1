use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::ResourceExt;
use serde_json::json;

use crate::Result;
use crate::writer::ClusterWriter;

/// Brings the presence of `finalizer` on `claim` in line with `want`.
///
/// A no-op when the observed list already matches. Otherwise issues a JSON
/// patch whose leading `test` op pins the observed state, so a concurrent
/// writer surfaces as a conflict instead of a lost update. Conflicts
/// propagate; the caller requeues.
pub(crate) async fn ensure_finalizer(
    writer: &dyn ClusterWriter,
    claim: &PersistentVolumeClaim,
    finalizer: &str,
    want: bool,
) -> Result<()> {
    let finalizers = claim.finalizers();
    let found = finalizers.iter().position(|f| f == finalizer);
    if found.is_some() == want {
        return Ok(());
    }

    let patch = match (want, found) {
        (true, _) => json!([
            { "op": "test", "path": "/metadata/finalizers", "value": finalizers },
            { "op": "add", "path": "/metadata/finalizers/-", "value": finalizer },
        ]),
        (false, Some(index)) => {
            let path = format!("/metadata/finalizers/{index}");
            json!([
                { "op": "test", "path": path, "value": finalizer },
                { "op": "remove", "path": path },
            ])
        }
        (false, None) => return Ok(()),
    };

    let patch = serde_json::from_value(patch)?;
    writer
        .patch_claim_json(&claim.namespace().unwrap_or_default(), &claim.name_any(), &patch)
        .await
}
