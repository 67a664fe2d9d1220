//! Weavelet side of the envelope/weavelet connection.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::lifecycle::{self, Dispatch, Shared, expect_reply};
use crate::config::ConnOptions;
use crate::error::{ConnError, HandlerError, TransportError};
use crate::protos::*;
use crate::transport::{StreamTransport, Transport};

/// Handles requests the envelope sends to the weavelet.
#[async_trait]
pub trait WeaveletHandler: Send + Sync {
    async fn get_metrics(
        &self,
        cx: &CancellationToken,
        req: GetMetricsRequest,
    ) -> Result<GetMetricsReply, HandlerError>;

    async fn get_health(
        &self,
        cx: &CancellationToken,
        req: GetHealthRequest,
    ) -> Result<GetHealthReply, HandlerError>;

    async fn get_load(
        &self,
        cx: &CancellationToken,
        req: GetLoadRequest,
    ) -> Result<GetLoadReply, HandlerError>;

    async fn get_profile(
        &self,
        cx: &CancellationToken,
        req: GetProfileRequest,
    ) -> Result<GetProfileReply, HandlerError>;

    async fn update_components(
        &self,
        cx: &CancellationToken,
        req: UpdateComponentsRequest,
    ) -> Result<UpdateComponentsReply, HandlerError>;

    async fn update_routing_info(
        &self,
        cx: &CancellationToken,
        req: UpdateRoutingInfoRequest,
    ) -> Result<UpdateRoutingInfoReply, HandlerError>;
}

#[async_trait]
impl<H: WeaveletHandler + ?Sized> WeaveletHandler for Arc<H> {
    async fn get_metrics(
        &self,
        cx: &CancellationToken,
        req: GetMetricsRequest,
    ) -> Result<GetMetricsReply, HandlerError> {
        (**self).get_metrics(cx, req).await
    }

    async fn get_health(
        &self,
        cx: &CancellationToken,
        req: GetHealthRequest,
    ) -> Result<GetHealthReply, HandlerError> {
        (**self).get_health(cx, req).await
    }

    async fn get_load(
        &self,
        cx: &CancellationToken,
        req: GetLoadRequest,
    ) -> Result<GetLoadReply, HandlerError> {
        (**self).get_load(cx, req).await
    }

    async fn get_profile(
        &self,
        cx: &CancellationToken,
        req: GetProfileRequest,
    ) -> Result<GetProfileReply, HandlerError> {
        (**self).get_profile(cx, req).await
    }

    async fn update_components(
        &self,
        cx: &CancellationToken,
        req: UpdateComponentsRequest,
    ) -> Result<UpdateComponentsReply, HandlerError> {
        (**self).update_components(cx, req).await
    }

    async fn update_routing_info(
        &self,
        cx: &CancellationToken,
        req: UpdateRoutingInfoRequest,
    ) -> Result<UpdateRoutingInfoReply, HandlerError> {
        (**self).update_routing_info(cx, req).await
    }
}

/// The weavelet end of the connection to its envelope.
///
/// Same lifecycle as [`super::EnvelopeConn`], with the handshake reversed:
/// the weavelet waits for [`EnvelopeInfo`] and answers with its own info.
pub struct WeaveletConn<T = StreamTransport<WeaveletMsg, EnvelopeMsg>>
where
    T: Transport<Out = WeaveletMsg, In = EnvelopeMsg>,
{
    shared: Arc<Shared<T>>,
    running: Mutex<Option<JoinSet<()>>>,
    envelope: EnvelopeInfo,
}

impl WeaveletConn {
    pub async fn new<R, W>(
        token: &CancellationToken,
        reader: R,
        writer: W,
        info: WeaveletInfo,
    ) -> Result<Self, ConnError>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::new_with_options(token, reader, writer, info, &ConnOptions::default()).await
    }

    pub async fn new_with_options<R, W>(
        token: &CancellationToken,
        reader: R,
        writer: W,
        info: WeaveletInfo,
        options: &ConnOptions,
    ) -> Result<Self, ConnError>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let transport = StreamTransport::new("weavelet", reader, writer, options);
        Self::with_transport(token, transport, info).await
    }
}

impl<T> WeaveletConn<T>
where
    T: Transport<Out = WeaveletMsg, In = EnvelopeMsg>,
{
    pub async fn with_transport(
        token: &CancellationToken,
        transport: T,
        info: WeaveletInfo,
    ) -> Result<Self, ConnError> {
        let token = token.child_token();
        let envelope = match handshake(&token, &transport, info).await {
            Ok(envelope) => envelope,
            Err(err) => {
                transport.cleanup(err.clone());
                return Err(err);
            }
        };
        tracing::info!(
            conn = "weavelet",
            app = %envelope.app,
            deployment_id = %envelope.deployment_id,
            "connected to envelope"
        );

        let shared = Arc::new(Shared::new("weavelet", "envelope", token, transport));
        let running = lifecycle::start(&shared);
        Ok(Self {
            shared,
            running: Mutex::new(Some(running)),
            envelope,
        })
    }

    /// Handles requests from the envelope until the connection stops.
    pub async fn serve<H: WeaveletHandler + 'static>(&self, handler: H) -> ConnError {
        lifecycle::serve(&self.shared, &self.running, WeaveletDispatch(handler)).await
    }

    /// Information the envelope sent during the handshake.
    pub fn envelope_info(&self) -> &EnvelopeInfo {
        &self.envelope
    }

    pub async fn activate_component(&self, req: ActivateComponentRequest) -> Result<(), ConnError> {
        let reply = self
            .shared
            .rpc(WeaveletMsg::new(WeaveletPayload::ActivateComponentRequest(
                req,
            )))
            .await?;
        expect_reply(reply, "ActivateComponentReply", |p| match p {
            EnvelopePayload::ActivateComponentReply(r) => Some(r),
            _ => None,
        })?;
        Ok(())
    }

    pub async fn get_listener_address(
        &self,
        name: impl Into<String>,
    ) -> Result<GetListenerAddressReply, ConnError> {
        let req = GetListenerAddressRequest { name: name.into() };
        let reply = self
            .shared
            .rpc(WeaveletMsg::new(WeaveletPayload::GetListenerAddressRequest(
                req,
            )))
            .await?;
        expect_reply(reply, "GetListenerAddressReply", |p| match p {
            EnvelopePayload::GetListenerAddressReply(r) => Some(r),
            _ => None,
        })
    }

    pub async fn export_listener(
        &self,
        req: ExportListenerRequest,
    ) -> Result<ExportListenerReply, ConnError> {
        let reply = self
            .shared
            .rpc(WeaveletMsg::new(WeaveletPayload::ExportListenerRequest(req)))
            .await?;
        expect_reply(reply, "ExportListenerReply", |p| match p {
            EnvelopePayload::ExportListenerReply(r) => Some(r),
            _ => None,
        })
    }

    /// Sends a log entry. No reply is expected.
    pub async fn send_log_entry(&self, entry: LogEntry) -> Result<(), ConnError> {
        self.shared
            .notify(WeaveletMsg::new(WeaveletPayload::LogEntry(entry)))
            .await
    }

    /// Sends a batch of finished spans. No reply is expected.
    pub async fn send_trace_spans(&self, spans: Vec<Span>) -> Result<(), ConnError> {
        self.shared
            .notify(WeaveletMsg::new(WeaveletPayload::TraceSpans(TraceSpans {
                spans,
            })))
            .await
    }
}

impl<T> Drop for WeaveletConn<T>
where
    T: Transport<Out = WeaveletMsg, In = EnvelopeMsg>,
{
    fn drop(&mut self) {
        self.shared.stop(TransportError::Closed.into());
    }
}

async fn handshake<T>(
    token: &CancellationToken,
    transport: &T,
    info: WeaveletInfo,
) -> Result<EnvelopeInfo, ConnError>
where
    T: Transport<Out = WeaveletMsg, In = EnvelopeMsg>,
{
    let first = lifecycle::recv_first(token, transport)
        .await
        .map_err(|err| ConnError::Handshake(err.to_string()))?;
    let envelope = match first.payload {
        Some(EnvelopePayload::EnvelopeInfo(info)) => info,
        other => {
            return Err(ConnError::Handshake(format!(
                "the first message from the envelope must contain envelope info, got {}",
                other.as_ref().map_or("<empty>", EnvelopePayload::kind)
            )));
        }
    };
    transport
        .send(WeaveletMsg::new(WeaveletPayload::WeaveletInfo(info)))
        .await
        .map_err(|err| ConnError::Handshake(err.to_string()))?;
    Ok(envelope)
}

struct WeaveletDispatch<H>(H);

#[async_trait]
impl<T, H> Dispatch<T> for WeaveletDispatch<H>
where
    T: Transport<Out = WeaveletMsg, In = EnvelopeMsg>,
    H: WeaveletHandler + 'static,
{
    async fn dispatch(&self, shared: &Shared<T>, msg: EnvelopeMsg) -> Result<(), ConnError> {
        handle_message(shared, &self.0, msg).await
    }
}

async fn handle_message<T, H>(
    shared: &Shared<T>,
    handler: &H,
    msg: EnvelopeMsg,
) -> Result<(), ConnError>
where
    T: Transport<Out = WeaveletMsg, In = EnvelopeMsg>,
    H: WeaveletHandler + ?Sized,
{
    let cx = &shared.token;
    let id = msg.id;
    let reply = match msg.payload {
        Some(EnvelopePayload::GetMetricsRequest(req)) => {
            let res = handler.get_metrics(cx, req).await;
            WeaveletMsg::reply(
                id,
                error_string(&res),
                res.ok().map(WeaveletPayload::GetMetricsReply),
            )
        }
        Some(EnvelopePayload::GetHealthRequest(req)) => {
            let res = handler.get_health(cx, req).await;
            WeaveletMsg::reply(
                id,
                error_string(&res),
                res.ok().map(WeaveletPayload::GetHealthReply),
            )
        }
        Some(EnvelopePayload::GetLoadRequest(req)) => {
            let res = handler.get_load(cx, req).await;
            WeaveletMsg::reply(
                id,
                error_string(&res),
                res.ok().map(WeaveletPayload::GetLoadReply),
            )
        }
        Some(EnvelopePayload::GetProfileRequest(req)) => {
            let res = handler.get_profile(cx, req).await;
            WeaveletMsg::reply(
                id,
                error_string(&res),
                res.ok().map(WeaveletPayload::GetProfileReply),
            )
        }
        Some(EnvelopePayload::UpdateComponentsRequest(req)) => {
            let res = handler.update_components(cx, req).await;
            WeaveletMsg::reply(
                id,
                error_string(&res),
                res.ok().map(WeaveletPayload::UpdateComponentsReply),
            )
        }
        Some(EnvelopePayload::UpdateRoutingInfoRequest(req)) => {
            let res = handler.update_routing_info(cx, req).await;
            WeaveletMsg::reply(
                id,
                error_string(&res),
                res.ok().map(WeaveletPayload::UpdateRoutingInfoReply),
            )
        }
        other => {
            let err = ConnError::Protocol(format!(
                "weavelet: unexpected message id={id} kind={}",
                other.as_ref().map_or("<empty>", EnvelopePayload::kind)
            ));
            shared.transport.cleanup(err.clone());
            return Err(err);
        }
    };
    shared.transport.send(reply).await
}
