//! Background pump for transport notifications.
//!
//! The `Supervisor` is spawned once per client. It routes what the transport
//! pushes (C2D messages, method requests, desired-property patches) to the
//! matching application listeners, forwards informational errors, and runs
//! disconnect recovery:
//!
//! - a disconnect whose error the retry policy deems retryable re-enables every
//!   feature that was enabled when the connection dropped;
//! - any other disconnect is reported to the application immediately.
//!
//! When a credentials provider is attached, the supervisor also pushes every
//! renewed token to the transport.

use std::sync::{Arc, OnceLock};

use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    client::ClientEvent,
    context::ClientContext,
    credentials::{CredentialsProvider, DeviceCredentials},
    error::{ClientError, TransportError},
    message::{MethodRequest, MethodResponse},
    results::Disconnected,
    transport::TransportEvent,
    twin::Twin,
};

#[derive(Clone)]
pub(crate) struct Supervisor {
    ctx: Arc<ClientContext>,
    twin: Arc<OnceLock<Twin>>,
    credentials: Option<Arc<dyn CredentialsProvider>>,
    cancel_token: CancellationToken,
}

impl Supervisor {
    pub fn new(
        ctx: Arc<ClientContext>,
        twin: Arc<OnceLock<Twin>>,
        credentials: Option<Arc<dyn CredentialsProvider>>,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            ctx,
            twin,
            credentials,
            cancel_token,
        }
    }

    /// Starts the background loops and returns immediately.
    ///
    /// Receivers are subscribed before spawning so that nothing the transport
    /// pushes after this call is lost.
    pub fn monitor(&self) {
        let events = self.ctx.transport.subscribe();
        tokio::spawn({
            let supervisor = self.clone();
            async move { supervisor.run_monitor_loop(events).await }
        });

        if let Some(provider) = &self.credentials {
            let tokens = provider.subscribe_new_tokens();
            tokio::spawn({
                let supervisor = self.clone();
                async move { supervisor.run_renewal_loop(tokens).await }
            });
        }
    }

    async fn run_monitor_loop(&self, mut events: broadcast::Receiver<TransportEvent>) {
        debug!("Supervisor monitoring started");

        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => {
                    debug!("Supervisor shutting down due to cancellation");
                    break;
                }

                received = events.recv() => match received {
                    Ok(event) => self.on_event(event),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Supervisor lagged behind transport events");
                    }
                    Err(RecvError::Closed) => {
                        warn!("Transport event channel closed, supervisor exiting");
                        break;
                    }
                }
            }
        }

        debug!("Supervisor monitoring stopped");
    }

    async fn run_renewal_loop(&self, mut tokens: broadcast::Receiver<DeviceCredentials>) {
        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => break,

                received = tokens.recv() => match received {
                    Ok(credentials) => self.on_new_token(credentials).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Missed renewed tokens, waiting for the next one");
                    }
                    Err(RecvError::Closed) => {
                        debug!("Credentials provider closed its token channel");
                        break;
                    }
                }
            }
        }
    }

    fn on_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Message(message) => {
                if self.ctx.dispatch_message(&message) == 0 {
                    warn!(
                        message_id = message.message_id.as_deref().unwrap_or("-"),
                        "Dropping C2D message with no subscriber"
                    );
                }
            }
            TransportEvent::MethodRequest(request) => self.on_method_request(request),
            TransportEvent::TwinDesiredPropertiesUpdate(patch) => match self.twin.get() {
                Some(twin) => twin.apply_desired_patch(patch),
                None => debug!("Desired-properties patch received before the twin was created"),
            },
            TransportEvent::Error(error) => {
                debug!(%error, "Forwarding transport error");
                self.ctx.emit(ClientEvent::Error(error.into()));
            }
            TransportEvent::Disconnect(reason) => self.on_disconnect(reason),
        }
    }

    fn on_method_request(&self, request: MethodRequest) {
        let Some(handler) = self.ctx.method_handler(&request.method_name) else {
            warn!(method = %request.method_name, "No handler registered for direct method");
            self.ctx.emit(ClientEvent::Error(ClientError::NotSupported(format!(
                "no handler registered for method '{}'",
                request.method_name
            ))));
            return;
        };

        debug!(
            method = %request.method_name,
            request_id = %request.request_id,
            "Dispatching direct method"
        );
        let response = MethodResponse::new(
            request.request_id.clone(),
            Arc::clone(&self.ctx.transport),
        );
        tokio::spawn(async move { handler.handle(request, response).await });
    }

    fn on_disconnect(&self, reason: Option<TransportError>) {
        if self.ctx.is_closed() {
            debug!("Ignoring disconnect while closed");
            return;
        }

        let error = match reason {
            Some(error) if self.ctx.retry_policy().should_retry(&error) => error,
            other => {
                warn!(reason = ?other, "Disconnected, not recoverable");
                self.ctx.emit(ClientEvent::Disconnect(Disconnected::new(other)));
                return;
            }
        };

        let features = self.ctx.features.take_enabled();
        if features.is_empty() {
            info!(%error, "Disconnected with no active feature to restore");
            return;
        }

        info!(%error, ?features, "Disconnected, restoring features");
        let listened: Vec<bool> = features
            .iter()
            .map(|feature| self.ctx.has_listeners(*feature))
            .collect();
        let ctx = Arc::clone(&self.ctx);
        tokio::spawn(async move {
            let mut failed = false;
            for (feature, listened) in features.into_iter().zip(listened) {
                match ctx.enable_feature(feature).await {
                    // every listener went away while the feature was down
                    Ok(()) if listened && !ctx.has_listeners(feature) => {
                        if let Err(e) = ctx.release_feature(feature).await {
                            warn!(%feature, error = %e, "Failed to release restored feature");
                        }
                    }
                    Ok(()) => {}
                    Err(ClientError::Cancelled(reason)) => {
                        debug!(%feature, %reason, "Feature restore abandoned");
                        return;
                    }
                    Err(e) => {
                        warn!(%feature, error = %e, "Failed to restore feature");
                        failed = true;
                    }
                }
            }
            if failed {
                ctx.emit(ClientEvent::Disconnect(Disconnected::new(Some(error))));
            }
        });
    }

    async fn on_new_token(&self, credentials: DeviceCredentials) {
        let Some(sas) = credentials.shared_access_signature else {
            warn!(device_id = %credentials.device_id, "Renewed credentials carry no signature");
            self.ctx.emit(ClientEvent::Error(ClientError::Argument(
                "renewed credentials carry no shared access signature".into(),
            )));
            return;
        };

        match self.ctx.update_shared_access_signature(&sas).await {
            Ok(updated) => debug!(
                needs_reconnect = updated.needs_reconnect,
                "Renewed token applied"
            ),
            Err(ClientError::Cancelled(reason)) => debug!(%reason, "Token renewal abandoned"),
            Err(e) => {
                warn!(error = %e, "Failed to apply renewed token");
                self.ctx.emit(ClientEvent::Error(e));
            }
        }
    }
}
