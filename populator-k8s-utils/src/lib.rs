use std::fmt::Debug;
use std::hash::Hash;

use futures::{Stream, StreamExt};
use k8s_openapi::serde::de::DeserializeOwned;
use kube::runtime::reflector::store::Writer;
use kube::runtime::reflector::{self, Store};
use kube::runtime::{WatchStreamExt, watcher};
use kube::{Api, Resource};
use thiserror::Error;
use tracing::error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to create store: {0}")]
    StoreCreation(String),

    #[error("kube error: {0}")]
    KubeError(#[from] kube::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Builds a cache-backed view of `api` plus the raw watch-event stream that
/// feeds it.
///
/// The stream must be polled for the store to fill. Watch errors are logged
/// and retried with backoff inside the stream; only clean events surface.
pub fn reflect<K>(api: Api<K>) -> (Store<K>, impl Stream<Item = watcher::Event<K>> + Send)
where
    K: Resource + Send + Sync + Clone + Debug + DeserializeOwned + 'static,
    K::DynamicType: Default + Eq + Hash + Clone,
{
    let (store, writer) = reflector::store();
    let stream = event_stream(api, writer);
    (store, stream)
}

/// Same as [`reflect`] for resources whose shape is only known at runtime.
pub fn reflect_with<K>(
    api: Api<K>,
    dyntype: K::DynamicType,
) -> (Store<K>, impl Stream<Item = watcher::Event<K>> + Send)
where
    K: Resource + Send + Sync + Clone + Debug + DeserializeOwned + 'static,
    K::DynamicType: Eq + Hash + Clone + Send + Sync,
{
    let writer = Writer::new(dyntype);
    let store = writer.as_reader();
    let stream = event_stream(api, writer);
    (store, stream)
}

/// Watch-event stream without a backing store, for resources that are read
/// live and only watched to trigger work.
pub fn watch<K>(api: Api<K>) -> impl Stream<Item = watcher::Event<K>> + Send
where
    K: Resource + Send + Sync + Clone + Debug + DeserializeOwned + 'static,
    K::DynamicType: Eq + Hash + Clone,
{
    watcher(api, watcher::Config::default())
        .default_backoff()
        .filter_map(|res| async move {
            match res {
                Ok(event) => Some(event),
                Err(e) => {
                    error!(%e, "unexpected error with watch stream");
                    None
                }
            }
        })
}

/// Blocks until `store` has seen a complete initial listing.
pub async fn wait_ready<K>(store: &Store<K>) -> Result<()>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Eq + Hash + Clone,
{
    store
        .wait_until_ready()
        .await
        .map_err(|e| Error::StoreCreation(e.to_string()))
}

fn event_stream<K>(
    api: Api<K>,
    writer: Writer<K>,
) -> impl Stream<Item = watcher::Event<K>> + Send
where
    K: Resource + Send + Sync + Clone + Debug + DeserializeOwned + 'static,
    K::DynamicType: Eq + Hash + Clone + Send + Sync,
{
    watcher(api, watcher::Config::default())
        .default_backoff()
        .reflect(writer)
        .filter_map(|res| async move {
            match res {
                Ok(event) => Some(event),
                Err(e) => {
                    error!(%e, "unexpected error with watch stream");
                    None
                }
            }
        })
}
