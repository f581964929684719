use std::fmt::Debug;

use futures::{future, Stream, TryStreamExt};
use kube_client::Api;
use kube_core::Resource;
use kube_runtime::{watcher, WatchStreamExt};
use serde::de::DeserializeOwned;

use super::Event;
use crate::resource::QualifiedName;

/// Every change to an object of type `K`, deletions included.
///
/// Objects without a namespace or name are skipped.
pub fn objects<K>(
    api: Api<K>,
    watcher_config: watcher::Config,
) -> impl Stream<Item = Result<Event<K>, watcher::Error>> + Send
where
    K: Resource + 'static + Debug + Clone + DeserializeOwned + Send,
{
    watcher(api, watcher_config)
        .default_backoff()
        .touched_objects()
        .try_filter_map(|resource| {
            future::ready(Ok(QualifiedName::from_resource(&resource).map(|key| Event {
                key,
                entry: resource,
            })))
        })
}
