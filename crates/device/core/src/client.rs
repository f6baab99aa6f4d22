//! The device client: public operation surface and event fan-out.
//!
//! Every operation that reaches the transport runs inside a
//! [`RetryOperation`](crate::retry::RetryOperation) built from the client's
//! current policy and deadline. `close()` is the exception: it never retries
//! and tears the session down even while other operations are mid-retry.
//!
//! Argument errors (empty names, empty batches, duplicate method handlers) are
//! returned before any transport interaction.

use std::{
    fmt,
    future::Future,
    sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use validator::Validate;

use super::{
    backoff::RetryPolicy,
    blob::BlobUploader,
    config::ClientConfig,
    context::ClientContext,
    credentials::CredentialsProvider,
    diagnostics::DiagnosticSampler,
    error::ClientError,
    message::{Message, MethodRequest, MethodResponse},
    results::{
        Connected, Disconnected, MessageAbandoned, MessageCompleted, MessageEnqueued,
        MessageRejected, SharedAccessSignatureUpdated, TransportConfigured,
    },
    state::{Feature, FeatureState},
    subscription::MessageSubscription,
    supervisor::Supervisor,
    transport::{Transport, TransportOptions},
    twin::Twin,
};

/// Application-level notification.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Non-fatal error: an informational transport error, a failed background
    /// feature toggle or a failed token renewal.
    Error(ClientError),
    /// The client lost its connection, or could not restore a subscription
    /// after a transient drop.
    Disconnect(Disconnected),
}

/// Handler for one direct method.
///
/// Closures of the form
/// `|request: MethodRequest, response: MethodResponse| async move { ... }`
/// implement this trait.
#[async_trait]
pub trait MethodHandler: Send + Sync + 'static {
    async fn handle(&self, request: MethodRequest, response: MethodResponse);
}

#[async_trait]
impl<F, Fut> MethodHandler for F
where
    F: Fn(MethodRequest, MethodResponse) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn handle(&self, request: MethodRequest, response: MethodResponse) {
        self(request, response).await
    }
}

/// Builder for [`Client`].
///
/// # Examples
///
/// ```ignore
/// let client = ClientBuilder::new(transport)
///     .config(config.client.clone())
///     .credentials_provider(provider)
///     .build()?;
/// client.open().await?;
/// ```
pub struct ClientBuilder {
    transport: Arc<dyn Transport>,
    config: ClientConfig,
    retry_policy: Option<Arc<dyn RetryPolicy>>,
    blob: Option<Arc<dyn BlobUploader>>,
    credentials: Option<Arc<dyn CredentialsProvider>>,
}

impl ClientBuilder {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            config: ClientConfig::default(),
            retry_policy: None,
            blob: None,
            credentials: None,
        }
    }

    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Overrides the policy described by the configuration.
    pub fn retry_policy(mut self, policy: Arc<dyn RetryPolicy>) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn blob_uploader(mut self, uploader: Arc<dyn BlobUploader>) -> Self {
        self.blob = Some(uploader);
        self
    }

    /// Attaches a provider whose renewed tokens are pushed to the transport.
    pub fn credentials_provider(mut self, provider: Arc<dyn CredentialsProvider>) -> Self {
        self.credentials = Some(provider);
        self
    }

    /// Validates the configuration and starts the background supervisor.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn build(self) -> Result<Client, ClientError> {
        self.config.validate()?;

        let policy = match self.retry_policy {
            Some(policy) => policy,
            None => self.config.retry.build_policy()?,
        };
        let sampler = self.config.diagnostics.build_sampler()?;

        let ctx = Arc::new(ClientContext::new(
            self.transport,
            self.blob,
            policy,
            self.config.max_operation_timeout(),
            self.config.event_channel_capacity,
        ));
        let twin = Arc::new(OnceLock::new());
        let shutdown = CancellationToken::new();

        Supervisor::new(
            Arc::clone(&ctx),
            Arc::clone(&twin),
            self.credentials,
            shutdown.clone(),
        )
        .monitor();

        debug!(
            max_operation_timeout_ms = self.config.max_operation_timeout_ms,
            "Client created"
        );
        Ok(Client {
            ctx,
            twin,
            sampler: Mutex::new(sampler),
            shutdown,
        })
    }
}

/// A device or module client bound to one transport.
pub struct Client {
    ctx: Arc<ClientContext>,
    twin: Arc<OnceLock<Twin>>,
    sampler: Mutex<DiagnosticSampler>,
    shutdown: CancellationToken,
}

impl Client {
    /// Creates a client with the default configuration.
    pub fn new(transport: Arc<dyn Transport>) -> Result<Self, ClientError> {
        ClientBuilder::new(transport).build()
    }

    /// Starts a [`ClientBuilder`] for configuration, a blob uploader or a
    /// credentials provider.
    pub fn builder(transport: Arc<dyn Transport>) -> ClientBuilder {
        ClientBuilder::new(transport)
    }

    fn sampler(&self) -> MutexGuard<'_, DiagnosticSampler> {
        self.sampler.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ---------------------------------------------------------------------
    // Connection
    // ---------------------------------------------------------------------

    /// Connects the transport under the current retry policy.
    ///
    /// Also starts a new session after [`close`](Self::close): disconnect
    /// notifications are acted on again from here on.
    ///
    /// # Errors
    ///
    /// Returns the last transport error once the policy gives up or the
    /// operation deadline passes.
    pub async fn open(&self) -> Result<Connected, ClientError> {
        self.ctx.mark_open();
        let transport = &self.ctx.transport;
        let connected = self
            .ctx
            .operation("connect")
            .retry(move || transport.connect())
            .await?;
        info!("Client connected");
        Ok(connected)
    }

    /// Disconnects without retrying.
    ///
    /// Pending retry waits end with [`ClientError::Cancelled`], every feature
    /// returns to `Disabled` and every subscription stream ends. Method
    /// handlers are dropped. The client can be opened again afterwards.
    pub async fn close(&self) -> Result<Disconnected, ClientError> {
        self.ctx.shutdown_session();
        if let Some(twin) = self.twin.get() {
            twin.clear_listeners();
        }
        let disconnected = self.ctx.transport.disconnect().await?;
        info!("Client closed");
        Ok(disconnected)
    }

    // ---------------------------------------------------------------------
    // Telemetry
    // ---------------------------------------------------------------------

    /// Sends one device-to-cloud message, sampling it for diagnostics.
    pub async fn send_event(&self, mut message: Message) -> Result<MessageEnqueued, ClientError> {
        self.sampler().decorate(&mut message);
        let transport = &self.ctx.transport;
        let message = &message;
        self.ctx
            .operation("send_event")
            .retry(move || transport.send_event(message.clone()))
            .await
    }

    /// Sends several messages.
    ///
    /// Transports without batch support receive the messages one by one, each
    /// under its own retry operation; the first terminal failure stops the batch.
    pub async fn send_event_batch(
        &self,
        mut messages: Vec<Message>,
    ) -> Result<MessageEnqueued, ClientError> {
        if messages.is_empty() {
            return Err(ClientError::Argument("message batch cannot be empty".into()));
        }

        if !self.ctx.transport.capabilities().batch_send {
            debug!(count = messages.len(), "Transport has no batch support, sending sequentially");
            for message in messages {
                self.send_event(message).await?;
            }
            return Ok(MessageEnqueued);
        }

        {
            let mut sampler = self.sampler();
            for message in &mut messages {
                sampler.decorate(message);
            }
        }
        let transport = &self.ctx.transport;
        let messages = &messages;
        self.ctx
            .operation("send_event_batch")
            .retry(move || transport.send_event_batch(messages.clone()))
            .await
    }

    // ---------------------------------------------------------------------
    // Settlement
    // ---------------------------------------------------------------------

    /// Settles a received C2D message as processed. The service removes it
    /// from the device queue.
    pub async fn complete(&self, message: &Message) -> Result<MessageCompleted, ClientError> {
        let transport = &self.ctx.transport;
        self.ctx
            .operation("complete")
            .retry(move || transport.complete(message))
            .await
    }

    /// Settles a received C2D message as undeliverable; it is not redelivered.
    pub async fn reject(&self, message: &Message) -> Result<MessageRejected, ClientError> {
        let transport = &self.ctx.transport;
        self.ctx
            .operation("reject")
            .retry(move || transport.reject(message))
            .await
    }

    /// Returns a received C2D message to the device queue for redelivery.
    pub async fn abandon(&self, message: &Message) -> Result<MessageAbandoned, ClientError> {
        let transport = &self.ctx.transport;
        self.ctx
            .operation("abandon")
            .retry(move || transport.abandon(message))
            .await
    }

    // ---------------------------------------------------------------------
    // Configuration
    // ---------------------------------------------------------------------

    /// Pushes a new shared access signature to the blob uploader and the transport.
    pub async fn update_shared_access_signature(
        &self,
        sas: &str,
    ) -> Result<SharedAccessSignatureUpdated, ClientError> {
        self.ctx.update_shared_access_signature(sas).await
    }

    /// Applies transport-specific options.
    ///
    /// # Errors
    ///
    /// - [`ClientError::Argument`] for an empty option set.
    /// - [`ClientError::NotSupported`] when the transport does not declare the
    ///   `set_options` capability. No transport call is made in either case.
    pub async fn set_options(
        &self,
        options: &TransportOptions,
    ) -> Result<TransportConfigured, ClientError> {
        if options.is_empty() {
            return Err(ClientError::Argument("transport options cannot be empty".into()));
        }
        if !self.ctx.transport.capabilities().set_options {
            return Err(ClientError::NotSupported(
                "transport does not accept options".into(),
            ));
        }
        let transport = &self.ctx.transport;
        self.ctx
            .operation("set_options")
            .retry(move || transport.set_options(options))
            .await
    }

    /// Swaps the retry policy. Operations already running keep their policy.
    pub fn set_retry_policy(&self, policy: Arc<dyn RetryPolicy>) {
        debug!(?policy, "Retry policy replaced");
        self.ctx.set_retry_policy(policy);
    }

    /// Policy the next operation will capture.
    pub fn retry_policy(&self) -> Arc<dyn RetryPolicy> {
        self.ctx.retry_policy()
    }

    /// Overall deadline for operations started from now on.
    pub fn set_max_operation_timeout(&self, timeout: Duration) {
        self.ctx.set_max_operation_timeout(timeout);
    }

    /// Enables diagnostics sampling at `percentage` (0 to 100).
    pub fn set_diagnostic_sampling_percentage(&self, percentage: u32) -> Result<(), ClientError> {
        self.sampler().set_percentage(percentage)
    }

    /// Stops attaching diagnostic context to outgoing messages.
    pub fn disable_diagnostics(&self) {
        self.sampler().disable();
    }

    // ---------------------------------------------------------------------
    // Blob upload
    // ---------------------------------------------------------------------

    /// Uploads `data` as `blob_name` through the configured blob uploader.
    ///
    /// Fails with [`ClientError::NotSupported`] when the client was built
    /// without one.
    pub async fn upload_to_blob(&self, blob_name: &str, data: Bytes) -> Result<(), ClientError> {
        if blob_name.trim().is_empty() {
            return Err(ClientError::Argument("blob name cannot be empty".into()));
        }
        let Some(blob) = &self.ctx.blob else {
            return Err(ClientError::NotSupported(
                "no blob uploader configured".into(),
            ));
        };
        let data = &data;
        self.ctx
            .operation("upload_to_blob")
            .retry(move || blob.upload_to_blob(blob_name, data.clone()))
            .await?;
        info!(blob_name, "Blob uploaded");
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Twin
    // ---------------------------------------------------------------------

    /// Returns the twin, fetching it from the service.
    ///
    /// The twin is created on first use and shared afterwards; every call
    /// refreshes it with a full `get()`.
    pub async fn get_twin(&self) -> Result<Twin, ClientError> {
        let twin = self
            .twin
            .get_or_init(|| Twin::new(Arc::clone(&self.ctx)))
            .clone();
        twin.get().await?;
        Ok(twin)
    }

    // ---------------------------------------------------------------------
    // Direct methods
    // ---------------------------------------------------------------------

    /// Registers the handler for `name`.
    ///
    /// Fails on an empty name or when `name` already has a handler. Enables
    /// methods on the transport in the background when they are off.
    pub fn on_device_method<H>(&self, name: &str, handler: H) -> Result<(), ClientError>
    where
        H: MethodHandler,
    {
        if name.trim().is_empty() {
            return Err(ClientError::Argument("method name cannot be empty".into()));
        }
        let first = self.ctx.register_method(name, Arc::new(handler))?;
        debug!(method = name, first, "Method handler registered");
        if self.ctx.features.state(Feature::Methods) == FeatureState::Disabled {
            self.ctx.spawn_enable(Feature::Methods);
        }
        Ok(())
    }

    /// Subscribes to direct method requests now instead of waiting for the
    /// first handler.
    pub async fn enable_methods(&self) -> Result<(), ClientError> {
        self.ctx.enable_feature(Feature::Methods).await
    }

    // ---------------------------------------------------------------------
    // Cloud-to-device messages
    // ---------------------------------------------------------------------

    /// Opens a stream of C2D messages. The first subscription enables C2D.
    pub fn messages(&self) -> MessageSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let (id, first) = self.ctx.add_message_listener(tx);
        debug!(first, "Message subscription added");
        // no-op when already enabled; queued behind an in-flight disable otherwise
        self.ctx.spawn_enable(Feature::C2d);
        MessageSubscription::new(id, rx, Arc::clone(&self.ctx))
    }

    /// Subscribes to C2D messages on the transport.
    ///
    /// Returns immediately when C2D is already enabled. Messages arriving with
    /// no open [`messages`](Self::messages) stream are dropped.
    pub async fn enable_messages(&self) -> Result<(), ClientError> {
        self.ctx.enable_feature(Feature::C2d).await
    }

    /// Unsubscribes from C2D messages, even while streams are open. On failure
    /// C2D stays enabled.
    pub async fn disable_messages(&self) -> Result<(), ClientError> {
        self.ctx.disable_feature(Feature::C2d).await
    }

    // ---------------------------------------------------------------------
    // Observability
    // ---------------------------------------------------------------------

    /// Subscribes to `error` and `disconnect` notifications.
    ///
    /// Events raised while no receiver exists are discarded; a receiver that
    /// falls behind the configured channel capacity skips the oldest ones.
    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.ctx.subscribe_events()
    }

    /// Current transition state of `feature`.
    pub fn feature_state(&self, feature: Feature) -> FeatureState {
        self.ctx.features.state(feature)
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if !self.ctx.is_closed() {
            warn!("Client dropped without close()");
        }
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("ctx", &self.ctx)
            .field("twin", &self.twin.get())
            .finish_non_exhaustive()
    }
}
