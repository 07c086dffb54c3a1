use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

const CLAIM_KIND: &str = "PersistentVolumeClaim";

/// Grant permitting cross-namespace object references, as defined by the
/// Gateway API (`gateway.networking.k8s.io/v1beta1`). Grants live in the
/// namespace of the referenced object and name the namespaces and kinds
/// allowed to reference into it.
#[derive(CustomResource, Serialize, Deserialize, Default, PartialEq, Clone, Debug, JsonSchema)]
#[kube(
    group = "gateway.networking.k8s.io",
    version = "v1beta1",
    kind = "ReferenceGrant",
    namespaced,
    derive = "Default",
    derive = "PartialEq"
)]
pub struct ReferenceGrantSpec {
    pub from: Vec<ReferenceGrantFrom>,
    pub to: Vec<ReferenceGrantTo>,
}

#[derive(Serialize, Deserialize, Default, PartialEq, Clone, Debug, JsonSchema)]
pub struct ReferenceGrantFrom {
    pub group: String,
    pub kind: String,
    pub namespace: String,
}

#[derive(Serialize, Deserialize, Default, PartialEq, Clone, Debug, JsonSchema)]
pub struct ReferenceGrantTo {
    pub group: String,
    pub kind: String,
    /// Absent or empty grants every object of the kind.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Decides whether a claim may use a data source in another namespace.
pub trait GrantEvaluator: Send + Sync {
    /// `Ok(true)` permits the reference; denial carries a descriptive error.
    /// Never performs I/O: `grants` is the full list from the data source's
    /// namespace.
    fn is_granted(
        &self,
        claim: &PersistentVolumeClaim,
        grants: &[ReferenceGrant],
    ) -> Result<bool>;
}

/// Standard evaluator: some grant must name the claim's namespace (for the
/// core `PersistentVolumeClaim` kind) as a valid origin and the data-source
/// kind, optionally narrowed to one object, as a valid target.
pub struct ReferenceGrantEvaluator;

impl GrantEvaluator for ReferenceGrantEvaluator {
    fn is_granted(
        &self,
        claim: &PersistentVolumeClaim,
        grants: &[ReferenceGrant],
    ) -> Result<bool> {
        let Some(source) = claim.spec.as_ref().and_then(|s| s.data_source_ref.as_ref()) else {
            return Ok(false);
        };
        let claim_namespace = claim.namespace().unwrap_or_default();
        let source_group = source.api_group.as_deref().unwrap_or_default();

        for grant in grants {
            let from_allowed = grant.spec.from.iter().any(|from| {
                from.group.is_empty()
                    && from.kind == CLAIM_KIND
                    && from.namespace == claim_namespace
            });
            if !from_allowed {
                continue;
            }
            let to_allowed = grant.spec.to.iter().any(|to| {
                to.group == source_group
                    && to.kind == source.kind
                    && to.name.as_deref().is_none_or(|n| n.is_empty() || n == source.name)
            });
            if to_allowed {
                return Ok(true);
            }
        }

        Err(Error::AccessDenied {
            source_namespace: source
                .namespace
                .clone()
                .unwrap_or_else(|| claim_namespace.clone()),
            source_name: source.name.clone(),
            kind: source.kind.clone(),
            claim_namespace,
            claim_name: claim.name_any(),
        })
    }
}
