use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    PersistentVolumeClaim, PersistentVolumeClaimSpec, Pod, VolumeDevice, VolumeMount,
};
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use kube::runtime::events::EventType;
use kube::runtime::reflector::ObjectRef;
use serde_json::json;
use tracing::{Span, debug, field, info, instrument};

use crate::config::{
    self, INTREE_PROVISIONER_PREFIX, MIGRATED_TO_ANNOTATION, SELECTED_NODE_ANNOTATION,
};
use crate::context::Context;
use crate::events;
use crate::fabric::{ObjKind, obj_key};
use crate::finalizer::ensure_finalizer;
use crate::metrics;
use crate::pod;
use crate::provider::{Backend, PopulatorParams};
use crate::{Error, Result};


const BINDING_WAIT_FOR_FIRST_CONSUMER: &str = "WaitForFirstConsumer";
const BINDING_IMMEDIATE: &str = "Immediate";
const BINDING_MODE_PARAMETER: &str = "volumeBindingMode";
const BLOCK_VOLUME_MODE: &str = "Block";
const CLAIM_LOST: &str = "Lost";
const POD_SUCCEEDED: &str = "Succeeded";
const POD_FAILED: &str = "Failed";

/// Drives one user claim through the population state machine.
///
/// Every early `Ok(())` is a suspension point: a fabric subscription placed
/// beforehand, or a later claim event, re-enters the machine. Errors requeue
/// the key with backoff. The machine is re-entrant from any state, so a
/// crash between two writes only costs a retried pass.
#[instrument(skip(ctx, key), fields(trace_id))]
pub(crate) async fn sync_claim(
    ctx: &Context,
    key: &str,
    namespace: &str,
    name: &str,
) -> Result<()> {
    let trace_id = metrics::get_trace_id();
    if trace_id != opentelemetry::trace::TraceId::INVALID {
        Span::current().record("trace_id", field::display(&trace_id));
    }

    // Never reconcile our own shadow objects.
    if ctx.config.working_namespace == namespace {
        return Ok(());
    }

    let Some(claim) = ctx.claims.get(&ObjectRef::new(name).within(namespace)) else {
        debug!("claim {namespace}/{name} no longer exists");
        return Ok(());
    };
    let claim = (*claim).clone();

    // Only claims populated from our data-source kind are ours to handle.
    let Some(source_ref) = claim.spec.as_ref().and_then(|s| s.data_source_ref.clone()) else {
        return Ok(());
    };
    let source_api = &ctx.config.source_resource;
    let ref_group = source_ref.api_group.as_deref().unwrap_or_default();
    if ref_group != source_api.group
        || source_ref.kind != source_api.kind
        || source_ref.name.is_empty()
    {
        return Ok(());
    }

    debug!("syncing claim {namespace}/{name}");

    // A reference into another namespace needs a grant over there.
    let source_namespace = match source_ref.namespace.as_deref() {
        Some(ns) if ns != namespace => {
            let grants: Vec<_> = ctx
                .grants
                .state()
                .iter()
                .filter(|g| g.namespace().as_deref() == Some(ns))
                .map(|g| (**g).clone())
                .collect();
            if !ctx.grant_evaluator.is_granted(&claim, &grants)? {
                return Ok(());
            }
            ns.to_owned()
        }
        _ => namespace.to_owned(),
    };

    let source = match ctx.sources.get(
        &ObjectRef::new_with(&source_ref.name, source_api.clone()).within(&source_namespace),
    ) {
        Some(source) => (*source).clone(),
        None => {
            ctx.fabric.subscribe(
                key,
                &obj_key(ObjKind::Source, Some(&source_namespace), &source_ref.name),
            );
            // Called again once the data source exists.
            return Ok(());
        }
    };

    let mut wait_for_first_consumer = false;
    let mut node_name = String::new();
    let mut storage_class = None;
    let storage_class_name = claim.spec.as_ref().and_then(|s| s.storage_class_name.clone());
    if let Some(class_name) = storage_class_name.as_deref() {
        let Some(class) = ctx.classes.get(&ObjectRef::new(class_name)) else {
            ctx.fabric
                .subscribe(key, &obj_key(ObjKind::StorageClass, None, class_name));
            // Called again once the storage class exists.
            return Ok(());
        };
        let class = (*class).clone();

        if let Some(reason) = intree_rejection(&claim, &class) {
            debug!("ignoring claim {namespace}/{name}: {reason}");
            return Ok(());
        }

        if class.volume_binding_mode.as_deref() == Some(BINDING_WAIT_FOR_FIRST_CONSUMER) {
            wait_for_first_consumer = true;
            node_name = claim
                .annotations()
                .get(SELECTED_NODE_ANNOTATION)
                .cloned()
                .unwrap_or_default();
            if node_name.is_empty() {
                // Wait for the scheduler to pick a node before continuing.
                return Ok(());
            }
        }
        storage_class = Some(class);
    }

    let uid = claim
        .uid()
        .ok_or_else(|| Error::MissingUid(format!("{namespace}/{name}")))?;

    let pod_name = config::populator_pod_name(&uid);
    let mut populator_pod = None;
    if let Backend::Pod { .. } = &ctx.backend {
        ctx.fabric.subscribe(
            key,
            &obj_key(ObjKind::Pod, Some(&ctx.config.working_namespace), &pod_name),
        );
        populator_pod = ctx
            .pods
            .get(&ObjectRef::new(&pod_name).within(&ctx.config.working_namespace))
            .map(|p| (*p).clone());
    }

    // Under the provider back-end a wait-for-first-consumer class would
    // never provision (no pod ever schedules), so the prime claim gets a
    // derived class with immediate binding.
    let mut prime_class_name = storage_class_name.clone();
    if matches!(ctx.backend, Backend::Provider(_))
        && wait_for_first_consumer
        && let Some(class) = storage_class.as_ref()
        && let Some(class_name) = storage_class_name.as_deref()
    {
        let derived_name = config::prime_storage_class_name(class_name);
        if ctx.classes.get(&ObjectRef::new(&derived_name)).is_none() {
            let derived = derive_immediate_class(class, &derived_name);
            if let Err(e) = ctx.writer.create_storage_class(&derived).await {
                ctx.fabric
                    .subscribe(key, &obj_key(ObjKind::StorageClass, None, &derived_name));
                return Err(e);
            }
            info!("created storage class {derived_name} for claim {namespace}/{name}");
        }
        prime_class_name = Some(derived_name);
    }

    let prime_name = config::prime_claim_name(&uid);
    ctx.fabric.subscribe(
        key,
        &obj_key(
            ObjKind::Claim,
            Some(&ctx.config.working_namespace),
            &prime_name,
        ),
    );
    let mut prime_claim = ctx
        .claims
        .get(&ObjectRef::new(&prime_name).within(&ctx.config.working_namespace))
        .map(|c| (*c).clone());

    let bound_volume = claim
        .spec
        .as_ref()
        .and_then(|s| s.volume_name.clone())
        .unwrap_or_default();

    // First write: an unbound claim without a prime claim gets one.
    if bound_volume.is_empty() && prime_claim.is_none() {
        let mut prime = PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(prime_name.clone()),
                namespace: Some(ctx.config.working_namespace.clone()),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: claim.spec.as_ref().and_then(|s| s.access_modes.clone()),
                resources: claim.spec.as_ref().and_then(|s| s.resources.clone()),
                storage_class_name: prime_class_name.clone(),
                volume_mode: claim.spec.as_ref().and_then(|s| s.volume_mode.clone()),
                ..Default::default()
            }),
            ..Default::default()
        };
        if wait_for_first_consumer {
            prime.metadata.annotations = Some(BTreeMap::from([(
                SELECTED_NODE_ANNOTATION.to_owned(),
                node_name.clone(),
            )]));
        }
        match ctx
            .writer
            .create_claim(&ctx.config.working_namespace, &prime)
            .await
        {
            Ok(created) => {
                info!("created prime claim {prime_name} for claim {namespace}/{name}");
                prime_claim = Some(created);
            }
            Err(e) => {
                ctx.events.emit(
                    &claim,
                    EventType::Warning,
                    events::REASON_PVC_CREATION_ERROR,
                    format!("Failed to create populator PVC: {e}"),
                );
                return Err(e);
            }
        }
    }

    // While the user claim is unbound, drive the population itself.
    if bound_volume.is_empty() {
        // The finalizer keeps the claim around until the shadow objects are
        // cleaned up.
        ensure_finalizer(
            ctx.writer.as_ref(),
            &claim,
            &ctx.config.claim_finalizer(),
            true,
        )
        .await?;

        ctx.metrics.operation_start(&uid);

        let raw_block =
            claim.spec.as_ref().and_then(|s| s.volume_mode.as_deref()) == Some(BLOCK_VOLUME_MODE);

        match &ctx.backend {
            Backend::Pod { args } => match populator_pod.as_ref() {
                None => {
                    let pod_args = args.as_ref()(raw_block, &source)?;
                    let node = wait_for_first_consumer.then_some(node_name.as_str());
                    let pod =
                        build_populator_pod(ctx, &pod_name, &prime_name, pod_args, raw_block, node);
                    if let Err(e) = ctx
                        .writer
                        .create_pod(&ctx.config.working_namespace, &pod)
                        .await
                    {
                        ctx.events.emit(
                            &claim,
                            EventType::Warning,
                            events::REASON_POD_CREATION_ERROR,
                            format!("Failed to create populator pod: {e}"),
                        );
                        return Err(e);
                    }
                    info!("created populator pod {pod_name} for claim {namespace}/{name}");
                    ctx.events.emit(
                        &claim,
                        EventType::Normal,
                        events::REASON_POD_CREATED,
                        "Populator started".into(),
                    );
                    // Called again once the pod reaches the cache.
                    return Ok(());
                }
                Some(pod) => {
                    let phase = pod
                        .status
                        .as_ref()
                        .and_then(|s| s.phase.as_deref())
                        .unwrap_or_default();
                    if phase != POD_SUCCEEDED {
                        if phase == POD_FAILED {
                            let message = pod
                                .status
                                .as_ref()
                                .and_then(|s| s.message.clone())
                                .unwrap_or_default();
                            ctx.events.emit(
                                &claim,
                                EventType::Warning,
                                events::REASON_POD_FAILED,
                                format!("Populator failed: {message}"),
                            );
                            // Delete failed pods so the next pass retries.
                            ctx.writer
                                .delete_pod(&ctx.config.working_namespace, &pod.name_any())
                                .await?;
                        }
                        // Called again when the pod finishes.
                        return Ok(());
                    }
                }
            },
            Backend::Provider(provider) => {
                let prime = prime_claim
                    .as_ref()
                    .ok_or_else(|| Error::MissingPrimeClaim(format!("{namespace}/{name}")))?;
                let prime_bound = prime
                    .spec
                    .as_ref()
                    .and_then(|s| s.volume_name.as_deref())
                    .is_some_and(|v| !v.is_empty());
                if !prime_bound {
                    // Called again once the prime claim is bound.
                    return Ok(());
                }
                let params = PopulatorParams {
                    client: ctx.client.clone(),
                    storage_class: storage_class.clone(),
                    claim: claim.clone(),
                    prime_claim: prime.clone(),
                    source: source.clone(),
                };
                if let Err(e) = provider.populate(&params).await {
                    ctx.events.emit(
                        &claim,
                        EventType::Warning,
                        events::REASON_POPULATE_START_ERROR,
                        format!("Failed to start populate operation: {e}"),
                    );
                    return Err(e);
                }
                if !provider.populate_complete(&params).await? {
                    // Called again until the transfer completes.
                    return Ok(());
                }
            }
        }

        // This would be bad.
        let prime = prime_claim
            .as_ref()
            .ok_or_else(|| Error::MissingPrimeClaim(format!("{namespace}/{name}")))?;

        // The volume provisioned against the prime claim becomes the user's.
        let prime_volume = prime
            .spec
            .as_ref()
            .and_then(|s| s.volume_name.clone())
            .unwrap_or_default();
        ctx.fabric
            .subscribe(key, &obj_key(ObjKind::Volume, None, &prime_volume));
        let Some(volume) = ctx.writer.get_volume(&prime_volume).await? else {
            // Called again once the volume is provisioned.
            return Ok(());
        };

        let claim_ref = volume.spec.as_ref().and_then(|s| s.claim_ref.as_ref());
        let retargeted = claim_ref.is_some_and(|r| {
            r.name.as_deref() == Some(name)
                && r.namespace.as_deref() == Some(namespace)
                && r.uid.as_deref() == Some(uid.as_str())
        });
        if !retargeted {
            let mut annotations = serde_json::Map::new();
            annotations.insert(
                ctx.config.populated_from_annotation(),
                json!(format!("{namespace}/{}", source_ref.name)),
            );
            let patch = json!({
                "metadata": { "annotations": annotations },
                "spec": {
                    "claimRef": {
                        "namespace": namespace,
                        "name": name,
                        "uid": uid.clone(),
                        "resourceVersion": claim.resource_version().unwrap_or_default(),
                    },
                },
            });
            info!(
                "retargeting volume {} to claim {namespace}/{name}",
                volume.name_any()
            );
            ctx.writer.patch_volume_merge(&volume.name_any(), patch).await?;
            // The binder has to acknowledge the switch before cleanup starts.
            return Ok(());
        }
    }

    // Wait for the binder to rebind the volume; the prime claim going Lost
    // is the acknowledgement.
    if let Some(prime) = prime_claim.as_ref()
        && prime.status.as_ref().and_then(|s| s.phase.as_deref()) != Some(CLAIM_LOST)
    {
        return Ok(());
    }

    // Population is done; everything from here on is cleanup.
    ctx.metrics.record_outcome(&uid, "success");
    ctx.events.emit(
        &claim,
        EventType::Normal,
        events::REASON_FINISHED,
        "Populator finished".into(),
    );

    if let Backend::Pod { .. } = &ctx.backend
        && let Some(pod) = populator_pod.as_ref()
    {
        ctx.writer
            .delete_pod(&ctx.config.working_namespace, &pod.name_any())
            .await?;
    }

    if let Some(prime) = prime_claim.as_ref() {
        ctx.writer
            .delete_claim(&ctx.config.working_namespace, &prime.name_any())
            .await?;
    }

    ensure_finalizer(
        ctx.writer.as_ref(),
        &claim,
        &ctx.config.claim_finalizer(),
        false,
    )
    .await?;

    ctx.fabric.forget(key);

    info!("population of claim {namespace}/{name} finished");
    Ok(())
}

/// In-tree plugins cannot run populators unless the claim was migrated to
/// CSI.
fn intree_rejection(claim: &PersistentVolumeClaim, class: &StorageClass) -> Option<String> {
    if !class.provisioner.starts_with(INTREE_PROVISIONER_PREFIX) {
        return None;
    }
    if claim
        .annotations()
        .get(MIGRATED_TO_ANNOTATION)
        .is_some_and(|migrated| !migrated.is_empty())
    {
        return None;
    }
    Some(format!(
        "in-tree volume plugin {:?} cannot use a volume populator",
        class.provisioner
    ))
}

/// Copy of `class` binding immediately, so provisioning proceeds without a
/// consumer pod.
fn derive_immediate_class(class: &StorageClass, name: &str) -> StorageClass {
    let mut parameters = class.parameters.clone();
    if let Some(parameters) = parameters.as_mut()
        && parameters
            .get(BINDING_MODE_PARAMETER)
            .is_some_and(|mode| !mode.is_empty())
    {
        parameters.insert(BINDING_MODE_PARAMETER.into(), BINDING_IMMEDIATE.into());
    }
    StorageClass {
        metadata: ObjectMeta {
            name: Some(name.to_owned()),
            ..Default::default()
        },
        provisioner: class.provisioner.clone(),
        parameters,
        reclaim_policy: class.reclaim_policy.clone(),
        mount_options: class.mount_options.clone(),
        allow_volume_expansion: class.allow_volume_expansion,
        allowed_topologies: class.allowed_topologies.clone(),
        volume_binding_mode: Some(BINDING_IMMEDIATE.into()),
        ..Default::default()
    }
}

fn build_populator_pod(
    ctx: &Context,
    pod_name: &str,
    prime_claim_name: &str,
    args: Vec<String>,
    raw_block: bool,
    node_name: Option<&str>,
) -> Pod {
    let mut spec = pod::populate_pod_spec(prime_claim_name);
    let container = &mut spec.containers[0];
    container.image = Some(ctx.config.image_name.clone());
    container.args = Some(args);
    if raw_block {
        container.volume_devices = Some(vec![VolumeDevice {
            name: pod::VOLUME_NAME.into(),
            device_path: ctx.config.device_path.clone(),
        }]);
    } else {
        container.volume_mounts = Some(vec![VolumeMount {
            name: pod::VOLUME_NAME.into(),
            mount_path: ctx.config.mount_path.clone(),
            ..Default::default()
        }]);
    }
    if let Some(node) = node_name {
        spec.node_name = Some(node.to_owned());
    }
    Pod {
        metadata: ObjectMeta {
            name: Some(pod_name.to_owned()),
            namespace: Some(ctx.config.working_namespace.clone()),
            ..Default::default()
        },
        spec: Some(spec),
        ..Default::default()
    }
}
