use k8s_openapi::api::core::v1::{
    Container, PersistentVolumeClaimVolumeSource, PodSpec, Volume,
};

pub(crate) const CONTAINER_NAME: &str = "populate";
pub(crate) const VOLUME_NAME: &str = "target";

/// Template for the data-transfer pod: one `populate` container and one
/// `target` volume backed by the prime claim.
///
/// The reconciler fills in the image and arguments afterwards and chooses
/// between a block device and a filesystem mount for the volume.
pub(crate) fn populate_pod_spec(prime_claim_name: &str) -> PodSpec {
    PodSpec {
        containers: vec![Container {
            name: CONTAINER_NAME.into(),
            image_pull_policy: Some("IfNotPresent".into()),
            ..Default::default()
        }],
        restart_policy: Some("Never".into()),
        volumes: Some(vec![Volume {
            name: VOLUME_NAME.into(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: prime_claim_name.into(),
                ..Default::default()
            }),
            ..Default::default()
        }]),
        ..Default::default()
    }
}
