//! In-memory collaborators for unit tests.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::{
    backoff::ExponentialBackoffWithJitter,
    blob::BlobUploader,
    context::ClientContext,
    credentials::{CredentialsProvider, DeviceCredentials},
    error::TransportError,
    message::{Message, MethodResponsePayload},
    results::{
        Connected, Disconnected, MessageAbandoned, MessageCompleted, MessageEnqueued,
        MessageRejected, SharedAccessSignatureUpdated, TransportConfigured,
    },
    transport::{Transport, TransportCapabilities, TransportEvent, TransportOptions},
    twin::TwinProperties,
};

/// Lets every spawned task run until it blocks, then advances paused time.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

pub fn test_context(transport: Arc<MockTransport>) -> Arc<ClientContext> {
    Arc::new(ClientContext::new(
        transport,
        None,
        Arc::new(ExponentialBackoffWithJitter::default()),
        Duration::from_secs(240),
        16,
    ))
}

#[derive(Default)]
struct Script {
    next: VecDeque<TransportError>,
    always: Option<TransportError>,
}

#[derive(Default)]
struct Recorded {
    calls: HashMap<&'static str, usize>,
    in_flight: HashMap<&'static str, usize>,
    max_in_flight: HashMap<&'static str, usize>,
    scripts: HashMap<&'static str, Script>,
    latency: HashMap<&'static str, Duration>,
    twin: TwinProperties,
    sent: Vec<Message>,
    reported: Vec<Value>,
    responses: Vec<MethodResponsePayload>,
    signature: Option<String>,
}

/// Scriptable transport that records every call.
pub struct MockTransport {
    state: Mutex<Recorded>,
    events: broadcast::Sender<TransportEvent>,
    capabilities: TransportCapabilities,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Self::with_capabilities(TransportCapabilities::default())
    }

    pub fn with_capabilities(capabilities: TransportCapabilities) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            state: Mutex::new(Recorded::default()),
            events,
            capabilities,
        })
    }

    fn state(&self) -> MutexGuard<'_, Recorded> {
        self.state.lock().unwrap()
    }

    pub fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    pub fn calls(&self, op: &str) -> usize {
        self.state().calls.get(op).copied().unwrap_or(0)
    }

    pub fn max_concurrency(&self, op: &str) -> usize {
        self.state().max_in_flight.get(op).copied().unwrap_or(0)
    }

    /// The next `times` calls of `op` fail with `error`.
    pub fn fail_next(&self, op: &'static str, error: TransportError, times: usize) {
        let mut state = self.state();
        let script = state.scripts.entry(op).or_default();
        script.next.extend(std::iter::repeat(error).take(times));
    }

    pub fn fail_always(&self, op: &'static str, error: TransportError) {
        self.state().scripts.entry(op).or_default().always = Some(error);
    }

    pub fn set_latency(&self, op: &'static str, latency: Duration) {
        self.state().latency.insert(op, latency);
    }

    pub fn set_twin(&self, twin: Value) {
        self.state().twin = serde_json::from_value(twin).unwrap();
    }

    pub fn sent(&self) -> Vec<Message> {
        self.state().sent.clone()
    }

    pub fn reported_patches(&self) -> Vec<Value> {
        self.state().reported.clone()
    }

    pub fn method_responses(&self) -> Vec<MethodResponsePayload> {
        self.state().responses.clone()
    }

    pub fn signature(&self) -> Option<String> {
        self.state().signature.clone()
    }

    async fn invoke(&self, op: &'static str) -> Result<(), TransportError> {
        let latency = {
            let mut state = self.state();
            *state.calls.entry(op).or_default() += 1;
            let in_flight = state.in_flight.entry(op).or_default();
            *in_flight += 1;
            let current = *in_flight;
            let max = state.max_in_flight.entry(op).or_default();
            *max = (*max).max(current);
            state.latency.get(op).copied()
        };

        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state();
        if let Some(in_flight) = state.in_flight.get_mut(op) {
            *in_flight -= 1;
        }
        match state.scripts.get_mut(op) {
            Some(script) => match script.next.pop_front() {
                Some(error) => Err(error),
                None => script.always.clone().map_or(Ok(()), Err),
            },
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self) -> Result<Connected, TransportError> {
        self.invoke("connect").await.map(|_| Connected)
    }

    async fn disconnect(&self) -> Result<Disconnected, TransportError> {
        self.invoke("disconnect")
            .await
            .map(|_| Disconnected::new(None))
    }

    async fn send_event(&self, message: Message) -> Result<MessageEnqueued, TransportError> {
        self.invoke("send_event").await?;
        self.state().sent.push(message);
        Ok(MessageEnqueued)
    }

    async fn send_event_batch(
        &self,
        messages: Vec<Message>,
    ) -> Result<MessageEnqueued, TransportError> {
        self.invoke("send_event_batch").await?;
        self.state().sent.extend(messages);
        Ok(MessageEnqueued)
    }

    async fn complete(&self, _message: &Message) -> Result<MessageCompleted, TransportError> {
        self.invoke("complete").await.map(|_| MessageCompleted)
    }

    async fn reject(&self, _message: &Message) -> Result<MessageRejected, TransportError> {
        self.invoke("reject").await.map(|_| MessageRejected)
    }

    async fn abandon(&self, _message: &Message) -> Result<MessageAbandoned, TransportError> {
        self.invoke("abandon").await.map(|_| MessageAbandoned)
    }

    async fn enable_c2d(&self) -> Result<(), TransportError> {
        self.invoke("enable_c2d").await
    }

    async fn disable_c2d(&self) -> Result<(), TransportError> {
        self.invoke("disable_c2d").await
    }

    async fn enable_methods(&self) -> Result<(), TransportError> {
        self.invoke("enable_methods").await
    }

    async fn disable_methods(&self) -> Result<(), TransportError> {
        self.invoke("disable_methods").await
    }

    async fn send_method_response(
        &self,
        response: MethodResponsePayload,
    ) -> Result<(), TransportError> {
        self.invoke("send_method_response").await?;
        self.state().responses.push(response);
        Ok(())
    }

    async fn get_twin(&self) -> Result<TwinProperties, TransportError> {
        self.invoke("get_twin").await?;
        Ok(self.state().twin.clone())
    }

    async fn update_twin_reported_properties(&self, patch: &Value) -> Result<(), TransportError> {
        self.invoke("update_twin_reported_properties").await?;
        self.state().reported.push(patch.clone());
        Ok(())
    }

    async fn enable_twin_desired_properties_updates(&self) -> Result<(), TransportError> {
        self.invoke("enable_twin_desired_properties_updates").await
    }

    async fn disable_twin_desired_properties_updates(&self) -> Result<(), TransportError> {
        self.invoke("disable_twin_desired_properties_updates").await
    }

    async fn update_shared_access_signature(
        &self,
        sas: &str,
    ) -> Result<SharedAccessSignatureUpdated, TransportError> {
        self.invoke("update_shared_access_signature").await?;
        self.state().signature = Some(sas.to_string());
        Ok(SharedAccessSignatureUpdated::default())
    }

    async fn set_options(
        &self,
        _options: &TransportOptions,
    ) -> Result<TransportConfigured, TransportError> {
        self.invoke("set_options").await.map(|_| TransportConfigured)
    }

    fn capabilities(&self) -> TransportCapabilities {
        self.capabilities
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}

#[derive(Default)]
struct UploaderState {
    attempts: usize,
    failures: usize,
    uploads: Vec<String>,
    signature: Option<String>,
}

pub struct MockBlobUploader {
    state: Mutex<UploaderState>,
}

impl MockBlobUploader {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(UploaderState::default()),
        })
    }

    pub fn fail_next(&self, times: usize) {
        self.state.lock().unwrap().failures += times;
    }

    pub fn attempts(&self) -> usize {
        self.state.lock().unwrap().attempts
    }

    pub fn uploads(&self) -> Vec<String> {
        self.state.lock().unwrap().uploads.clone()
    }

    pub fn signature(&self) -> Option<String> {
        self.state.lock().unwrap().signature.clone()
    }
}

#[async_trait]
impl BlobUploader for MockBlobUploader {
    async fn upload_to_blob(&self, blob_name: &str, _data: Bytes) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        state.attempts += 1;
        if state.failures > 0 {
            state.failures -= 1;
            return Err(TransportError::timeout("storage did not answer"));
        }
        state.uploads.push(blob_name.to_string());
        Ok(())
    }

    fn update_shared_access_signature(&self, sas: &str) {
        self.state.lock().unwrap().signature = Some(sas.to_string());
    }
}

pub struct MockCredentials {
    tokens: broadcast::Sender<DeviceCredentials>,
}

impl MockCredentials {
    pub fn new() -> Arc<Self> {
        let (tokens, _) = broadcast::channel(8);
        Arc::new(Self { tokens })
    }

    fn credentials(sas: Option<String>) -> DeviceCredentials {
        DeviceCredentials {
            host: "hub.example.net".into(),
            device_id: "sensor-01".into(),
            module_id: None,
            gateway_host: None,
            shared_access_signature: sas,
        }
    }

    pub fn renew(&self, sas: &str) {
        let _ = self.tokens.send(Self::credentials(Some(sas.to_string())));
    }
}

#[async_trait]
impl CredentialsProvider for MockCredentials {
    async fn get_device_credentials(&self) -> Result<DeviceCredentials, TransportError> {
        Ok(Self::credentials(Some("SharedAccessSignature sr=initial".into())))
    }

    fn subscribe_new_tokens(&self) -> broadcast::Receiver<DeviceCredentials> {
        self.tokens.subscribe()
    }
}
