//! Device twin synchronization.
//!
//! The twin keeps a local replica of the service-side property document:
//! `desired` (pushed by the service) and `reported` (pushed by the device).
//!
//! Patches are applied with delete-on-null semantics: a `null` anywhere in a
//! patch removes the key instead of storing `null`. Objects merge
//! recursively; scalars and arrays replace.
//!
//! Desired-property changes are published per path. Merging the patch
//! `{"x": {"y": 1}}` raises one event on each of
//!
//! ```text
//! properties.desired       -> {"x": {"y": 1}}
//! properties.desired.x     -> {"y": 1}
//! properties.desired.x.y   -> 1
//! ```
//!
//! # Examples
//!
//! ```ignore
//! let twin = client.get_twin().await?;
//! let mut interval = twin.on_desired("properties.desired.telemetry.interval")?;
//!
//! twin.reported().update(json!({"firmware": "1.4.2"})).await?;
//!
//! while let Some(value) = interval.recv().await {
//!     apply_interval(value);
//! }
//! ```

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{
    client::ClientEvent,
    context::ClientContext,
    error::ClientError,
    state::Feature,
    subscription::ListenerSet,
};

/// Event name prefix of every desired-property event.
pub const DESIRED_PATH: &str = "properties.desired";

/// Snapshot of both property trees.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TwinProperties {
    pub desired: Map<String, Value>,
    pub reported: Map<String, Value>,
}

impl TwinProperties {
    pub fn clear(&mut self) {
        self.desired.clear();
        self.reported.clear();
    }
}

/// Lifecycle of the local replica.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TwinState {
    /// No successful `get()` yet, or the last one failed.
    #[default]
    Uninitialized,
    /// A `get()` is in flight; the trees are empty.
    Fetching,
    Synced,
}

impl TwinState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TwinState::Uninitialized => "Uninitialized",
            TwinState::Fetching => "Fetching",
            TwinState::Synced => "Synced",
        }
    }
}

impl fmt::Display for TwinState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Merges `patch` into `target`, deleting keys whose patch value is `null`.
pub fn merge_patch(target: &mut Map<String, Value>, patch: &Map<String, Value>) {
    for (key, value) in patch {
        match value {
            Value::Null => {
                target.remove(key);
            }
            Value::Object(child) => {
                let slot = target
                    .entry(key.clone())
                    .or_insert_with(|| Value::Object(Map::new()));
                if !slot.is_object() {
                    *slot = Value::Object(Map::new());
                }
                if let Value::Object(dest) = slot {
                    merge_patch(dest, child);
                }
            }
            other => {
                target.insert(key.clone(), other.clone());
            }
        }
    }
}

/// Lists every `(event name, payload)` pair raised by merging `patch`, root first.
pub fn change_events(patch: &Map<String, Value>) -> Vec<(String, Value)> {
    let mut events = vec![(DESIRED_PATH.to_string(), Value::Object(patch.clone()))];
    collect_events(DESIRED_PATH, patch, &mut events);
    events
}

fn collect_events(prefix: &str, object: &Map<String, Value>, events: &mut Vec<(String, Value)>) {
    for (key, value) in object {
        let path = format!("{prefix}.{key}");
        events.push((path.clone(), value.clone()));
        if let Value::Object(child) = value {
            collect_events(&path, child, events);
        }
    }
}

/// Splits a desired-property event name into its segments below the prefix.
///
/// Returns `None` for names outside `properties.desired` or with empty segments.
pub fn desired_segments(path: &str) -> Option<Vec<&str>> {
    let rest = path.strip_prefix(DESIRED_PATH)?;
    if rest.is_empty() {
        return Some(Vec::new());
    }
    let rest = rest.strip_prefix('.')?;
    let segments: Vec<&str> = rest.split('.').collect();
    if segments.iter().any(|s| s.is_empty()) {
        return None;
    }
    Some(segments)
}

fn value_at(root: &Map<String, Value>, segments: &[&str]) -> Option<Value> {
    let Some((first, rest)) = segments.split_first() else {
        return (!root.is_empty()).then(|| Value::Object(root.clone()));
    };
    let mut current = root.get(*first)?;
    for segment in rest {
        current = current.as_object()?.get(*segment)?;
    }
    Some(current.clone())
}

#[derive(Default)]
struct TwinStore {
    properties: TwinProperties,
    state: TwinState,
    listeners: HashMap<String, ListenerSet<Value>>,
}

impl TwinStore {
    fn publish(&mut self, events: Vec<(String, Value)>) {
        for (path, value) in events {
            if let Some(listeners) = self.listeners.get_mut(&path) {
                listeners.send(&value);
            }
        }
        self.listeners.retain(|_, set| !set.is_empty());
    }

    fn listener_count(&self) -> usize {
        self.listeners.values().map(ListenerSet::len).sum()
    }
}

struct TwinInner {
    ctx: Arc<ClientContext>,
    store: Mutex<TwinStore>,
    // one get() at a time per twin
    fetch: tokio::sync::Mutex<()>,
}

impl TwinInner {
    fn store(&self) -> MutexGuard<'_, TwinStore> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Removes a listener. Returns true when no desired listener remains.
    fn remove_listener(&self, path: &str, id: u64) -> bool {
        let mut store = self.store();
        let removed = store
            .listeners
            .get_mut(path)
            .is_some_and(|set| set.remove(id));
        store.listeners.retain(|_, set| !set.is_empty());
        let remaining = store.listener_count();
        self.ctx.set_desired_listener_count(remaining);
        removed && remaining == 0
    }
}

/// Local replica of the device twin.
///
/// Cloning is cheap; clones share the same replica.
#[derive(Clone)]
pub struct Twin {
    inner: Arc<TwinInner>,
}

impl Twin {
    pub(crate) fn new(ctx: Arc<ClientContext>) -> Self {
        Self {
            inner: Arc::new(TwinInner {
                ctx,
                store: Mutex::new(TwinStore::default()),
                fetch: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Fetches the full twin and replaces both local trees.
    ///
    /// The trees are cleared before the request, so a failed fetch leaves them
    /// empty rather than stale. On success, events fire for every path of the
    /// desired tree. Concurrent calls are serialized.
    pub async fn get(&self) -> Result<&Self, ClientError> {
        let _serial = self.inner.fetch.lock().await;
        {
            let mut store = self.inner.store();
            store.properties.clear();
            store.state = TwinState::Fetching;
        }

        let transport = &self.inner.ctx.transport;
        let fetched = self
            .inner
            .ctx
            .operation("get_twin")
            .retry(move || transport.get_twin())
            .await;

        let mut store = self.inner.store();
        match fetched {
            Ok(twin) => {
                merge_patch(&mut store.properties.desired, &twin.desired);
                merge_patch(&mut store.properties.reported, &twin.reported);
                store.state = TwinState::Synced;
                let events = change_events(&store.properties.desired);
                store.publish(events);
                self.inner.ctx.set_desired_listener_count(store.listener_count());
                debug!(
                    desired_keys = store.properties.desired.len(),
                    reported_keys = store.properties.reported.len(),
                    "Twin synchronized"
                );
                Ok(self)
            }
            Err(e) => {
                store.state = TwinState::Uninitialized;
                warn!(error = %e, "Twin fetch failed");
                Err(e)
            }
        }
    }

    /// Snapshot of both trees.
    pub fn properties(&self) -> TwinProperties {
        self.inner.store().properties.clone()
    }

    pub fn state(&self) -> TwinState {
        self.inner.store().state
    }

    /// Service handle for the reported tree.
    pub fn reported(&self) -> ReportedProperties<'_> {
        ReportedProperties { twin: self }
    }

    async fn update_reported(&self, patch: Value) -> Result<(), ClientError> {
        if !patch.is_object() {
            return Err(ClientError::Argument(
                "reported properties patch must be a JSON object".into(),
            ));
        }

        let transport = &self.inner.ctx.transport;
        let body = &patch;
        self.inner
            .ctx
            .operation("update_twin_reported_properties")
            .retry(move || transport.update_twin_reported_properties(body))
            .await?;

        if let Value::Object(fields) = &patch {
            merge_patch(&mut self.inner.store().properties.reported, fields);
        }
        debug!("Reported properties updated");
        Ok(())
    }

    /// Enables desired-property update notifications on the transport.
    pub async fn enable_desired_properties_updates(&self) -> Result<(), ClientError> {
        self.inner
            .ctx
            .enable_feature(Feature::TwinDesiredProperties)
            .await
    }

    pub async fn disable_desired_properties_updates(&self) -> Result<(), ClientError> {
        self.inner
            .ctx
            .disable_feature(Feature::TwinDesiredProperties)
            .await
    }

    pub fn desired_properties_updates_enabled(&self) -> bool {
        self.inner
            .ctx
            .features
            .state(Feature::TwinDesiredProperties)
            .is_enabled()
    }

    /// Subscribes to changes of one desired-property path.
    ///
    /// `path` is an event name such as `properties.desired` or
    /// `properties.desired.telemetry.interval`. When the path already holds a
    /// value it is queued to the new subscription right away. Subscribing also
    /// enables desired-property updates on the transport when they are off.
    pub fn on_desired(&self, path: &str) -> Result<DesiredPropertySubscription, ClientError> {
        let segments = desired_segments(path).ok_or_else(|| {
            ClientError::Argument(format!(
                "'{path}' is not a desired-property path (expected '{DESIRED_PATH}[.key]*')"
            ))
        })?;

        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut store = self.inner.store();
            if let Some(current) = value_at(&store.properties.desired, &segments) {
                let _ = tx.send(current);
            }
            let id = store.listeners.entry(path.to_string()).or_default().add(tx);
            self.inner.ctx.set_desired_listener_count(store.listener_count());
            id
        };

        // no-op when already enabled; queued behind an in-flight disable otherwise
        self.inner.ctx.spawn_enable(Feature::TwinDesiredProperties);

        Ok(DesiredPropertySubscription {
            path: path.to_string(),
            id,
            rx,
            twin: Arc::clone(&self.inner),
            released: false,
        })
    }

    /// Applies a patch pushed by the service and raises events for its paths.
    pub(crate) fn apply_desired_patch(&self, patch: Value) {
        let Value::Object(fields) = patch else {
            warn!("Ignoring desired-properties patch that is not a JSON object");
            self.inner.ctx.emit(ClientEvent::Error(ClientError::Serialization(
                "desired-properties patch is not a JSON object".into(),
            )));
            return;
        };

        let mut store = self.inner.store();
        merge_patch(&mut store.properties.desired, &fields);
        store.publish(change_events(&fields));
        self.inner.ctx.set_desired_listener_count(store.listener_count());
        info!(keys = fields.len(), "Desired properties patch applied");
    }

    /// Ends every desired-property stream.
    pub(crate) fn clear_listeners(&self) {
        self.inner.store().listeners.clear();
        self.inner.ctx.set_desired_listener_count(0);
    }
}

impl fmt::Debug for Twin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let store = self.inner.store();
        f.debug_struct("Twin")
            .field("state", &store.state)
            .field("properties", &store.properties)
            .finish_non_exhaustive()
    }
}

/// Service object for the reported tree.
#[derive(Debug, Clone, Copy)]
pub struct ReportedProperties<'a> {
    twin: &'a Twin,
}

impl ReportedProperties<'_> {
    /// Sends `patch` to the service and merges it locally once accepted.
    ///
    /// `null` values delete the corresponding keys.
    pub async fn update(&self, patch: Value) -> Result<(), ClientError> {
        self.twin.update_reported(patch).await
    }

    /// Current local reported tree.
    pub fn get(&self) -> Map<String, Value> {
        self.twin.inner.store().properties.reported.clone()
    }
}

/// Stream of values for one desired-property path.
///
/// Releasing the last desired-property subscription disables desired-property
/// updates on the transport.
pub struct DesiredPropertySubscription {
    path: String,
    id: u64,
    rx: mpsc::UnboundedReceiver<Value>,
    twin: Arc<TwinInner>,
    released: bool,
}

impl DesiredPropertySubscription {
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Waits for the next value. Returns `None` once the client is closed.
    pub async fn recv(&mut self) -> Option<Value> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Value> {
        self.rx.try_recv().ok()
    }

    pub async fn unsubscribe(mut self) -> Result<(), ClientError> {
        self.released = true;
        if self.twin.remove_listener(&self.path, self.id) {
            return self
                .twin
                .ctx
                .release_feature(Feature::TwinDesiredProperties)
                .await;
        }
        Ok(())
    }
}

impl Drop for DesiredPropertySubscription {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if self.twin.remove_listener(&self.path, self.id)
            && !self.twin.ctx.spawn_release(Feature::TwinDesiredProperties)
        {
            warn!("No runtime available to disable desired-property updates");
        }
    }
}

impl fmt::Debug for DesiredPropertySubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DesiredPropertySubscription")
            .field("path", &self.path)
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}
