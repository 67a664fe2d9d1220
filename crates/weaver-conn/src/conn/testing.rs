//! Test doubles shared by the connection tests.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio_util::sync::CancellationToken;

use crate::error::{ConnError, HandlerError, TransportError};
use crate::protos::*;
use crate::transport::Transport;

pub(crate) fn test_weavelet_info() -> WeaveletInfo {
    WeaveletInfo {
        dial_addr: "tcp://127.0.0.1:12345".into(),
        pid: 4242,
        version: SemVer {
            major: 0,
            minor: 24,
            patch: 0,
        },
    }
}

/// Envelope-side transport driven by the test.
///
/// Inbound messages are fed through the sender returned by `new`. Every
/// `send` and every `cleanup` call is recorded.
pub(crate) struct FakeTransport {
    inbound: AsyncMutex<mpsc::UnboundedReceiver<WeaveletMsg>>,
    sent: Mutex<Vec<EnvelopeMsg>>,
    cleanups: Mutex<Vec<String>>,
    rpc_error: Mutex<Option<ConnError>>,
    closed: CancellationToken,
}

impl FakeTransport {
    pub(crate) fn new() -> (Arc<Self>, mpsc::UnboundedSender<WeaveletMsg>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let fake = Arc::new(Self {
            inbound: AsyncMutex::new(rx),
            sent: Mutex::new(Vec::new()),
            cleanups: Mutex::new(Vec::new()),
            rpc_error: Mutex::new(None),
            closed: CancellationToken::new(),
        });
        (fake, tx)
    }

    /// Makes every later `do_blocking_rpc` fail with `err`.
    pub(crate) fn fail_rpcs_with(&self, err: ConnError) {
        *self.rpc_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(err);
    }

    pub(crate) fn sent(&self) -> Vec<EnvelopeMsg> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn cleanups(&self) -> Vec<String> {
        self.cleanups
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    type Out = EnvelopeMsg;
    type In = WeaveletMsg;

    async fn send(&self, msg: EnvelopeMsg) -> Result<(), ConnError> {
        if self.is_closed() {
            return Err(TransportError::Closed.into());
        }
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(msg);
        Ok(())
    }

    async fn recv(&self) -> Result<WeaveletMsg, ConnError> {
        let mut inbound = self.inbound.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => Err(ConnError::Transport(TransportError::Closed)),
            msg = inbound.recv() => msg.ok_or(ConnError::Transport(TransportError::Closed)),
        }
    }

    async fn do_blocking_rpc(&self, req: EnvelopeMsg) -> Result<WeaveletMsg, ConnError> {
        let scripted = self
            .rpc_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(err) = scripted {
            return Err(err);
        }
        self.send(req).await?;
        // nobody ever answers
        self.closed.cancelled().await;
        Err(TransportError::Closed.into())
    }

    fn cleanup(&self, err: ConnError) {
        self.cleanups
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(err.to_string());
        self.closed.cancel();
    }
}

/// Envelope handler that reports log entries and spans on a channel.
pub(crate) struct RecordingEnvelopeHandler {
    events: mpsc::UnboundedSender<String>,
    activation_error: Option<String>,
    panic_on_log: bool,
}

impl RecordingEnvelopeHandler {
    pub(crate) fn new(events: mpsc::UnboundedSender<String>) -> Self {
        Self {
            events,
            activation_error: None,
            panic_on_log: false,
        }
    }

    pub(crate) fn failing_activation(mut self, message: &str) -> Self {
        self.activation_error = Some(message.to_string());
        self
    }

    pub(crate) fn panicking_on_logs(mut self) -> Self {
        self.panic_on_log = true;
        self
    }
}

#[async_trait]
impl crate::conn::EnvelopeHandler for RecordingEnvelopeHandler {
    async fn activate_component(
        &self,
        _cx: &CancellationToken,
        req: ActivateComponentRequest,
    ) -> Result<ActivateComponentReply, HandlerError> {
        match &self.activation_error {
            Some(message) => Err(HandlerError::new(message.clone())),
            None => {
                let _ = self.events.send(format!("activate {}", req.component));
                Ok(ActivateComponentReply {})
            }
        }
    }

    async fn get_listener_address(
        &self,
        _cx: &CancellationToken,
        req: GetListenerAddressRequest,
    ) -> Result<GetListenerAddressReply, HandlerError> {
        Ok(GetListenerAddressReply {
            network: "tcp".into(),
            address: format!("127.0.0.1:0#{}", req.name),
        })
    }

    async fn export_listener(
        &self,
        _cx: &CancellationToken,
        req: ExportListenerRequest,
    ) -> Result<ExportListenerReply, HandlerError> {
        Ok(ExportListenerReply {
            proxy_address: req.address,
            error: String::new(),
        })
    }

    async fn handle_log_entry(
        &self,
        _cx: &CancellationToken,
        entry: LogEntry,
    ) -> Result<(), HandlerError> {
        if self.panic_on_log {
            panic!("log handler blew up on {:?}", entry.msg);
        }
        let _ = self.events.send(entry.msg);
        Ok(())
    }

    async fn handle_trace_spans(
        &self,
        _cx: &CancellationToken,
        spans: &[Span],
    ) -> Result<(), HandlerError> {
        for span in spans {
            let _ = self.events.send(span.name.clone());
        }
        Ok(())
    }
}

/// Weavelet handler with canned answers.
pub(crate) struct RecordingWeaveletHandler {
    health: HealthStatus,
    components: Mutex<Vec<String>>,
}

impl RecordingWeaveletHandler {
    pub(crate) fn new(health: HealthStatus) -> Self {
        Self {
            health,
            components: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl crate::conn::WeaveletHandler for RecordingWeaveletHandler {
    async fn get_metrics(
        &self,
        _cx: &CancellationToken,
        _req: GetMetricsRequest,
    ) -> Result<GetMetricsReply, HandlerError> {
        Ok(GetMetricsReply::default())
    }

    async fn get_health(
        &self,
        _cx: &CancellationToken,
        _req: GetHealthRequest,
    ) -> Result<GetHealthReply, HandlerError> {
        Ok(GetHealthReply {
            status: self.health,
        })
    }

    async fn get_load(
        &self,
        _cx: &CancellationToken,
        _req: GetLoadRequest,
    ) -> Result<GetLoadReply, HandlerError> {
        let components = self
            .components
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let mut load = LoadReport::default();
        for component in components {
            load.loads.insert(
                component,
                ComponentLoad {
                    version: 1,
                    load: 0.0,
                },
            );
        }
        Ok(GetLoadReply { load })
    }

    async fn get_profile(
        &self,
        _cx: &CancellationToken,
        req: GetProfileRequest,
    ) -> Result<GetProfileReply, HandlerError> {
        match req.profile_type {
            ProfileType::Heap => Ok(GetProfileReply {
                data: b"heap".to_vec(),
            }),
            ProfileType::Cpu => Err("cpu profiling unsupported".into()),
        }
    }

    async fn update_components(
        &self,
        _cx: &CancellationToken,
        req: UpdateComponentsRequest,
    ) -> Result<UpdateComponentsReply, HandlerError> {
        *self
            .components
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = req.components;
        Ok(UpdateComponentsReply {})
    }

    async fn update_routing_info(
        &self,
        _cx: &CancellationToken,
        req: UpdateRoutingInfoRequest,
    ) -> Result<UpdateRoutingInfoReply, HandlerError> {
        if req.routing_info.component.is_empty() {
            return Err("routing info without component".into());
        }
        Ok(UpdateRoutingInfoReply {})
    }
}
