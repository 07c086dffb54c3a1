use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim, Pod};
use k8s_openapi::api::storage::v1::StorageClass;
use kube::api::Api;
use kube::core::DynamicObject;
use kube::{Client, Resource};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::PopulatorConfig;
use crate::context::Context;
use crate::events::ClaimEvents;
use crate::fabric::{NotificationFabric, ObjKind};
use crate::grant::{ReferenceGrant, ReferenceGrantEvaluator};
use crate::metrics::PopulationMetrics;
use crate::provider::Backend;
use crate::queue::WorkQueue;
use crate::reconcile::sync_claim;
use crate::router::EventRouter;
use crate::writer::KubeWriter;
use crate::{Error, Result, http};

const CACHE_SYNC_TIMEOUT: Duration = Duration::from_secs(30);

/// Runs the populator controller until interrupted.
///
/// Connects to the cluster with the ambient kubeconfig, then defers to
/// [`run_with_client`]. The first interrupt or termination signal shuts the
/// controller down gracefully; a second one exits the process immediately.
pub async fn run(config: PopulatorConfig, backend: Backend) -> Result<()> {
    let client = Client::try_default().await?;
    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());
    run_with_client(config, backend, client, cancel).await
}

/// Runs the populator controller on an existing client until `cancel` fires.
pub async fn run_with_client(
    config: PopulatorConfig,
    backend: Backend,
    client: Client,
    cancel: CancellationToken,
) -> Result<()> {
    info!(
        "starting populator controller for {}",
        config.source_resource.kind
    );

    let queue = WorkQueue::new();
    let fabric = Arc::new(NotificationFabric::new(queue.clone()));
    let router = Arc::new(EventRouter::new(
        fabric.clone(),
        queue.clone(),
        config.working_namespace.clone(),
    ));

    let (claims, claim_events) =
        populator_k8s_utils::reflect::<PersistentVolumeClaim>(Api::all(client.clone()));
    let (pods, pod_events) = populator_k8s_utils::reflect::<Pod>(Api::all(client.clone()));
    let (classes, class_events) =
        populator_k8s_utils::reflect::<StorageClass>(Api::all(client.clone()));
    let (grants, grant_events) =
        populator_k8s_utils::reflect::<ReferenceGrant>(Api::all(client.clone()));
    let (sources, source_events) = populator_k8s_utils::reflect_with::<DynamicObject>(
        Api::all_with(client.clone(), &config.source_resource),
        config.source_resource.clone(),
    );
    // Volumes are read live; the watch only drives re-entry.
    let volume_events = populator_k8s_utils::watch::<PersistentVolume>(Api::all(client.clone()));

    spawn_routed(claim_events, router.clone(), ObjKind::Claim, cancel.clone());
    spawn_routed(pod_events, router.clone(), ObjKind::Pod, cancel.clone());
    spawn_routed(class_events, router.clone(), ObjKind::StorageClass, cancel.clone());
    spawn_routed(source_events, router.clone(), ObjKind::Source, cancel.clone());
    spawn_routed(volume_events, router, ObjKind::Volume, cancel.clone());
    // Grants are not routed; the stream only keeps the store warm. A denied
    // claim is retried through the workqueue's backoff.
    spawn_drain(grant_events, cancel.clone());

    let metrics_endpoint = config.http_endpoint;
    let metrics_path = config.metrics_path.clone();
    let metrics_cancel = cancel.child_token();
    tokio::spawn(async move {
        if let Err(e) = http::serve(metrics_endpoint, metrics_path, metrics_cancel).await {
            error!("metrics listener failed: {e}");
        }
    });

    timeout(CACHE_SYNC_TIMEOUT, async {
        populator_k8s_utils::wait_ready(&claims).await?;
        populator_k8s_utils::wait_ready(&pods).await?;
        populator_k8s_utils::wait_ready(&classes).await?;
        populator_k8s_utils::wait_ready(&grants).await?;
        populator_k8s_utils::wait_ready(&sources).await?;
        Ok::<(), Error>(())
    })
    .await
    .map_err(|_| Error::Timeout("cache sync".into()))??;

    let metrics = PopulationMetrics::new(&config.controller_name());
    let events = ClaimEvents::new(client.clone(), &config.controller_name());
    let context = Arc::new(Context {
        writer: Arc::new(KubeWriter::new(client.clone())),
        client,
        claims,
        pods,
        classes,
        sources,
        grants,
        fabric,
        queue: queue.clone(),
        backend,
        grant_evaluator: Arc::new(ReferenceGrantEvaluator),
        metrics,
        events,
        config,
    });

    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = run_worker(context) => {}
    }
    queue.shut_down();
    info!("populator controller stopped");
    Ok(())
}

async fn run_worker(ctx: Arc<Context>) {
    while let Some(key) = ctx.queue.next().await {
        match process(&ctx, &key).await {
            Ok(()) => ctx.queue.forget(&key),
            Err(e) => {
                ctx.metrics.count_failure(&e);
                error!("error syncing {key:?}: {e}, requeuing");
                ctx.queue.add_rate_limited(&key);
            }
        }
    }
}

async fn process(ctx: &Context, key: &str) -> Result<()> {
    let mut parts = key.splitn(3, '/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some("claim"), Some(namespace), Some(name)) => {
            sync_claim(ctx, key, namespace, name).await
        }
        _ => {
            warn!("invalid work item {key:?}");
            Ok(())
        }
    }
}

fn spawn_routed<K, S>(
    stream: S,
    router: Arc<EventRouter>,
    kind: ObjKind,
    cancel: CancellationToken,
) where
    K: Resource + Send + 'static,
    S: Stream<Item = kube::runtime::watcher::Event<K>> + Send + 'static,
{
    tokio::spawn(async move {
        let routed = stream.for_each(|event| {
            router.handle(kind, &event);
            futures::future::ready(())
        });
        tokio::select! {
            _ = routed => {}
            _ = cancel.cancelled() => {}
        }
    });
}

fn spawn_drain<S>(stream: S, cancel: CancellationToken)
where
    S: Stream + Send + 'static,
    S::Item: Send,
{
    tokio::spawn(async move {
        let drained = stream.for_each(|_| futures::future::ready(()));
        tokio::select! {
            _ = drained => {}
            _ = cancel.cancelled() => {}
        }
    });
}

fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        interrupt().await;
        info!("shutdown signal received");
        cancel.cancel();
        interrupt().await;
        // Second signal: the operator wants out now.
        std::process::exit(1);
    });
}

async fn interrupt() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };
    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
