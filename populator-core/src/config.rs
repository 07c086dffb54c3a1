use std::net::SocketAddr;

use kube::core::ApiResource;

/// Annotation the scheduler writes on claims bound to a node; mirrored onto
/// the prime claim under wait-for-first-consumer.
pub const SELECTED_NODE_ANNOTATION: &str = "volume.kubernetes.io/selected-node";

/// Annotation marking a claim as migrated from an in-tree plugin to CSI.
pub const MIGRATED_TO_ANNOTATION: &str = "pv.kubernetes.io/migrated-to";

pub(crate) const INTREE_PROVISIONER_PREFIX: &str = "kubernetes.io/";

const POPULATED_FROM_SUFFIX: &str = "populated-from";
const FINALIZER_SUFFIX: &str = "populate-target-protection";
const CONTROLLER_NAME_SUFFIX: &str = "populator";
const PRIME_CLAIM_PREFIX: &str = "prime";
const POD_PREFIX: &str = "populate";
const STORAGE_CLASS_PREFIX: &str = "populate";

/// Static configuration of one populator controller instance.
///
/// The population back-end (pod arguments or provider callbacks) is supplied
/// separately as a [`crate::Backend`].
#[derive(Clone, Debug)]
pub struct PopulatorConfig {
    /// Namespace the prime claims, derived storage classes and populator
    /// pods live in. Claims in this namespace are never reconciled.
    pub working_namespace: String,
    /// Annotation and finalizer namespace, e.g. `populators.example.io`.
    pub prefix: String,
    /// Image run by the data-transfer pod back-end.
    pub image_name: String,
    /// Where the pod back-end mounts a filesystem-mode prime claim.
    pub mount_path: String,
    /// Where the pod back-end attaches a block-mode prime claim.
    pub device_path: String,
    /// The custom data-source kind this controller owns.
    pub source_resource: ApiResource,
    /// Metrics listener address.
    pub http_endpoint: SocketAddr,
    /// Metrics route, usually `/metrics`.
    pub metrics_path: String,
}

impl PopulatorConfig {
    /// Annotation recording the data source a volume was populated from.
    pub fn populated_from_annotation(&self) -> String {
        format!("{}/{}", self.prefix, POPULATED_FROM_SUFFIX)
    }

    /// Finalizer held on user claims while their shadow objects exist.
    pub fn claim_finalizer(&self) -> String {
        format!("{}/{}", self.prefix, FINALIZER_SUFFIX)
    }

    pub fn controller_name(&self) -> String {
        format!("{}-{}", self.prefix, CONTROLLER_NAME_SUFFIX)
    }
}

pub(crate) fn prime_claim_name(uid: &str) -> String {
    format!("{PRIME_CLAIM_PREFIX}-{uid}")
}

pub(crate) fn populator_pod_name(uid: &str) -> String {
    format!("{POD_PREFIX}-{uid}")
}

pub(crate) fn prime_storage_class_name(class_name: &str) -> String {
    format!("{STORAGE_CLASS_PREFIX}-{class_name}")
}
