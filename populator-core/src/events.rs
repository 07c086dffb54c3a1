use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource};
use tracing::warn;

pub(crate) const REASON_PVC_CREATION_ERROR: &str = "PopulatorPVCCreationError";
pub(crate) const REASON_POD_CREATION_ERROR: &str = "PopulatorCreationError";
pub(crate) const REASON_POD_CREATED: &str = "PopulatorCreated";
pub(crate) const REASON_POD_FAILED: &str = "PopulatorFailed";
pub(crate) const REASON_FINISHED: &str = "PopulatorFinished";
pub(crate) const REASON_POPULATE_START_ERROR: &str = "PopulateOperationStartError";

/// Emits Kubernetes events on user claims without blocking reconciliation.
///
/// Publication runs on a detached task; a failed publish costs a warning,
/// never a requeue.
#[derive(Clone)]
pub(crate) struct ClaimEvents {
    recorder: Recorder,
}

impl ClaimEvents {
    pub(crate) fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_owned(),
            instance: None,
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }

    pub(crate) fn emit(
        &self,
        claim: &PersistentVolumeClaim,
        type_: EventType,
        reason: &str,
        note: String,
    ) {
        let reference = claim.object_ref(&());
        let recorder = self.recorder.clone();
        let event = Event {
            type_,
            reason: reason.to_owned(),
            note: Some(note),
            action: "Populate".into(),
            secondary: None,
        };
        tokio::spawn(async move {
            if let Err(e) = recorder.publish(&event, &reference).await {
                warn!(%e, "failed to publish event");
            }
        });
    }
}
