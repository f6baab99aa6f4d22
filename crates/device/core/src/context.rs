//! State shared by the client, its twin and the background supervisor.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, RwLock,
    },
    time::Duration,
};

use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    backoff::RetryPolicy,
    blob::BlobUploader,
    client::{ClientEvent, MethodHandler},
    error::{ClientError, TransportError},
    message::Message,
    results::SharedAccessSignatureUpdated,
    retry::RetryOperation,
    state::{Feature, FeatureState, FeatureSwitches},
    subscription::ListenerSet,
    transport::Transport,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone)]
struct RetrySettings {
    policy: Arc<dyn RetryPolicy>,
    max_timeout: Duration,
}

pub(crate) struct ClientContext {
    pub transport: Arc<dyn Transport>,
    pub blob: Option<Arc<dyn BlobUploader>>,
    retry: RwLock<RetrySettings>,
    pub features: FeatureSwitches,
    session: Mutex<CancellationToken>,
    closed: AtomicBool,
    events: broadcast::Sender<ClientEvent>,
    messages: Mutex<ListenerSet<Message>>,
    // mirrored by the twin whenever its listener map changes
    desired_listeners: AtomicUsize,
    methods: Mutex<HashMap<String, Arc<dyn MethodHandler>>>,
}

impl ClientContext {
    pub fn new(
        transport: Arc<dyn Transport>,
        blob: Option<Arc<dyn BlobUploader>>,
        policy: Arc<dyn RetryPolicy>,
        max_timeout: Duration,
        event_capacity: usize,
    ) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Self {
            transport,
            blob,
            retry: RwLock::new(RetrySettings {
                policy,
                max_timeout,
            }),
            features: FeatureSwitches::new(),
            session: Mutex::new(CancellationToken::new()),
            closed: AtomicBool::new(false),
            events,
            messages: Mutex::new(ListenerSet::default()),
            desired_listeners: AtomicUsize::new(0),
            methods: Mutex::new(HashMap::new()),
        }
    }

    fn settings(&self) -> RetrySettings {
        self.retry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn retry_policy(&self) -> Arc<dyn RetryPolicy> {
        self.settings().policy
    }

    pub fn max_operation_timeout(&self) -> Duration {
        self.settings().max_timeout
    }

    pub fn set_retry_policy(&self, policy: Arc<dyn RetryPolicy>) {
        self.retry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .policy = policy;
    }

    pub fn set_max_operation_timeout(&self, max_timeout: Duration) {
        self.retry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .max_timeout = max_timeout;
    }

    /// Builds a retry operation bound to the current policy, deadline and session.
    pub fn operation(&self, name: &'static str) -> RetryOperation {
        let settings = self.settings();
        RetryOperation::new(name, settings.policy, settings.max_timeout)
            .with_cancellation(lock(&self.session).clone())
    }

    /// Pushes a renewed signature to the blob uploader and the transport.
    pub async fn update_shared_access_signature(
        &self,
        sas: &str,
    ) -> Result<SharedAccessSignatureUpdated, ClientError> {
        if sas.trim().is_empty() {
            return Err(ClientError::Argument(
                "shared access signature cannot be empty".into(),
            ));
        }
        if let Some(blob) = &self.blob {
            blob.update_shared_access_signature(sas);
        }

        let transport = &self.transport;
        let updated = self
            .operation("update_shared_access_signature")
            .retry(move || transport.update_shared_access_signature(sas))
            .await?;
        info!(
            needs_reconnect = updated.needs_reconnect,
            "Shared access signature updated"
        );
        Ok(updated)
    }

    // ---------------------------------------------------------------------
    // Session lifecycle
    // ---------------------------------------------------------------------

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn mark_open(&self) {
        self.closed.store(false, Ordering::SeqCst);
    }

    /// Cancels every pending retry wait, resets features and drops listeners.
    pub fn shutdown_session(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let previous = std::mem::replace(&mut *lock(&self.session), CancellationToken::new());
        previous.cancel();
        self.features.reset();
        lock(&self.messages).clear();
        lock(&self.methods).clear();
    }

    // ---------------------------------------------------------------------
    // Application events
    // ---------------------------------------------------------------------

    pub fn emit(&self, event: ClientEvent) {
        if self.events.send(event).is_err() {
            debug!("No application listener for client event");
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    // ---------------------------------------------------------------------
    // Message listeners
    // ---------------------------------------------------------------------

    /// Registers a message listener. Returns its id and whether it is the first.
    pub fn add_message_listener(&self, sender: mpsc::UnboundedSender<Message>) -> (u64, bool) {
        let mut listeners = lock(&self.messages);
        let id = listeners.add(sender);
        (id, listeners.len() == 1)
    }

    /// Removes a message listener. Returns true when no listener remains.
    pub fn remove_message_listener(&self, id: u64) -> bool {
        let mut listeners = lock(&self.messages);
        listeners.remove(id) && listeners.is_empty()
    }

    /// Returns the number of listeners that received the message.
    pub fn dispatch_message(&self, message: &Message) -> usize {
        lock(&self.messages).send(message)
    }

    pub fn set_desired_listener_count(&self, count: usize) {
        self.desired_listeners.store(count, Ordering::SeqCst);
    }

    /// Whether anything still consumes what `feature` delivers.
    pub fn has_listeners(&self, feature: Feature) -> bool {
        match feature {
            Feature::C2d => !lock(&self.messages).is_empty(),
            Feature::Methods => !lock(&self.methods).is_empty(),
            Feature::TwinDesiredProperties => self.desired_listeners.load(Ordering::SeqCst) > 0,
        }
    }

    // ---------------------------------------------------------------------
    // Method handlers
    // ---------------------------------------------------------------------

    /// Registers `handler` for `name`. Returns whether it is the first handler.
    pub fn register_method(
        &self,
        name: &str,
        handler: Arc<dyn MethodHandler>,
    ) -> Result<bool, ClientError> {
        let mut methods = lock(&self.methods);
        if methods.contains_key(name) {
            return Err(ClientError::Argument(format!(
                "a handler for method '{name}' is already registered"
            )));
        }
        methods.insert(name.to_string(), handler);
        Ok(methods.len() == 1)
    }

    pub fn method_handler(&self, name: &str) -> Option<Arc<dyn MethodHandler>> {
        lock(&self.methods).get(name).cloned()
    }

    // ---------------------------------------------------------------------
    // Feature transitions
    // ---------------------------------------------------------------------

    /// Enables `feature` on the transport through a retry operation.
    ///
    /// Returns immediately when the feature is already enabled. On terminal
    /// failure the feature is left `Disabled` so a later attempt starts clean.
    pub async fn enable_feature(&self, feature: Feature) -> Result<(), ClientError> {
        let _gate = self.features.gate(feature).await;
        let Some(transition) =
            self.features
                .begin(feature, FeatureState::Disabled, FeatureState::Enabling)
        else {
            return Ok(());
        };

        info!(%feature, "Enabling feature");
        let transport = &self.transport;
        let result = self
            .operation(enable_operation(feature))
            .retry(move || toggle(transport.as_ref(), feature, true))
            .await;

        match result {
            Ok(()) => {
                if self.features.finish(transition, FeatureState::Enabled) {
                    info!(%feature, "Feature enabled");
                }
                Ok(())
            }
            Err(e) => {
                self.features.finish(transition, FeatureState::Disabled);
                warn!(%feature, error = %e, "Failed to enable feature");
                Err(e)
            }
        }
    }

    /// Disables `feature`. On failure the feature stays `Enabled`.
    pub async fn disable_feature(&self, feature: Feature) -> Result<(), ClientError> {
        let _gate = self.features.gate(feature).await;
        self.disable_gated(feature).await
    }

    /// Disables `feature` after its last listener went away.
    ///
    /// The listener check runs under the transition gate, so a listener added
    /// between the release and this call keeps the feature enabled.
    pub async fn release_feature(&self, feature: Feature) -> Result<(), ClientError> {
        let _gate = self.features.gate(feature).await;
        if self.has_listeners(feature) {
            debug!(%feature, "Listener re-added, keeping feature enabled");
            return Ok(());
        }
        self.disable_gated(feature).await
    }

    async fn disable_gated(&self, feature: Feature) -> Result<(), ClientError> {
        let Some(transition) =
            self.features
                .begin(feature, FeatureState::Enabled, FeatureState::Disabling)
        else {
            return Ok(());
        };

        info!(%feature, "Disabling feature");
        let transport = &self.transport;
        let result = self
            .operation(disable_operation(feature))
            .retry(move || toggle(transport.as_ref(), feature, false))
            .await;

        match result {
            Ok(()) => {
                self.features.finish(transition, FeatureState::Disabled);
                info!(%feature, "Feature disabled");
                Ok(())
            }
            Err(e) => {
                self.features.finish(transition, FeatureState::Enabled);
                warn!(%feature, error = %e, "Failed to disable feature");
                Err(e)
            }
        }
    }

    /// Enables `feature` in the background, surfacing failure as an `error` event.
    pub fn spawn_enable(self: &Arc<Self>, feature: Feature) -> bool {
        let ctx = Arc::clone(self);
        self.spawn(async move {
            match ctx.enable_feature(feature).await {
                Ok(()) => {}
                Err(ClientError::Cancelled(reason)) => debug!(%feature, %reason, "Enable abandoned"),
                Err(e) => ctx.emit(ClientEvent::Error(e)),
            }
        })
    }

    /// Releases `feature` in the background, surfacing failure as an `error` event.
    pub fn spawn_release(self: &Arc<Self>, feature: Feature) -> bool {
        let ctx = Arc::clone(self);
        self.spawn(async move {
            match ctx.release_feature(feature).await {
                Ok(()) => {}
                Err(ClientError::Cancelled(reason)) => debug!(%feature, %reason, "Disable abandoned"),
                Err(e) => ctx.emit(ClientEvent::Error(e)),
            }
        })
    }

    fn spawn<F>(&self, task: F) -> bool
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(task);
                true
            }
            Err(_) => false,
        }
    }
}

async fn toggle(
    transport: &dyn Transport,
    feature: Feature,
    enable: bool,
) -> Result<(), TransportError> {
    match (feature, enable) {
        (Feature::C2d, true) => transport.enable_c2d().await,
        (Feature::C2d, false) => transport.disable_c2d().await,
        (Feature::Methods, true) => transport.enable_methods().await,
        (Feature::Methods, false) => transport.disable_methods().await,
        (Feature::TwinDesiredProperties, true) => {
            transport.enable_twin_desired_properties_updates().await
        }
        (Feature::TwinDesiredProperties, false) => {
            transport.disable_twin_desired_properties_updates().await
        }
    }
}

fn enable_operation(feature: Feature) -> &'static str {
    match feature {
        Feature::C2d => "enable_c2d",
        Feature::Methods => "enable_methods",
        Feature::TwinDesiredProperties => "enable_twin_desired_properties_updates",
    }
}

fn disable_operation(feature: Feature) -> &'static str {
    match feature {
        Feature::C2d => "disable_c2d",
        Feature::Methods => "disable_methods",
        Feature::TwinDesiredProperties => "disable_twin_desired_properties_updates",
    }
}

impl fmt::Debug for ClientContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientContext")
            .field("features", &self.features)
            .field("closed", &self.is_closed())
            .field("retry", &self.settings())
            .finish_non_exhaustive()
    }
}
