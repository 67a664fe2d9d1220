//! Envelope side of the envelope/weavelet connection.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::lifecycle::{self, Dispatch, Shared, expect_reply};
use crate::config::ConnOptions;
use crate::error::{ConnError, HandlerError, TransportError};
use crate::metrics::{MetricSnapshot, MetricsImporter};
use crate::protos::*;
use crate::transport::{StreamTransport, Transport};

/// Handles requests and notifications the weavelet sends to the envelope.
///
/// Calls are made one at a time, in the order the weavelet sent them. `cx`
/// is the connection's lifetime token; it is cancelled when the connection
/// stops.
#[async_trait]
pub trait EnvelopeHandler: Send + Sync {
    async fn activate_component(
        &self,
        cx: &CancellationToken,
        req: ActivateComponentRequest,
    ) -> Result<ActivateComponentReply, HandlerError>;

    async fn get_listener_address(
        &self,
        cx: &CancellationToken,
        req: GetListenerAddressRequest,
    ) -> Result<GetListenerAddressReply, HandlerError>;

    async fn export_listener(
        &self,
        cx: &CancellationToken,
        req: ExportListenerRequest,
    ) -> Result<ExportListenerReply, HandlerError>;

    /// An error here stops the connection: there is no reply to carry it.
    async fn handle_log_entry(
        &self,
        cx: &CancellationToken,
        entry: LogEntry,
    ) -> Result<(), HandlerError>;

    /// An error here stops the connection: there is no reply to carry it.
    async fn handle_trace_spans(
        &self,
        cx: &CancellationToken,
        spans: &[Span],
    ) -> Result<(), HandlerError>;
}

#[async_trait]
impl<H: EnvelopeHandler + ?Sized> EnvelopeHandler for Arc<H> {
    async fn activate_component(
        &self,
        cx: &CancellationToken,
        req: ActivateComponentRequest,
    ) -> Result<ActivateComponentReply, HandlerError> {
        (**self).activate_component(cx, req).await
    }

    async fn get_listener_address(
        &self,
        cx: &CancellationToken,
        req: GetListenerAddressRequest,
    ) -> Result<GetListenerAddressReply, HandlerError> {
        (**self).get_listener_address(cx, req).await
    }

    async fn export_listener(
        &self,
        cx: &CancellationToken,
        req: ExportListenerRequest,
    ) -> Result<ExportListenerReply, HandlerError> {
        (**self).export_listener(cx, req).await
    }

    async fn handle_log_entry(
        &self,
        cx: &CancellationToken,
        entry: LogEntry,
    ) -> Result<(), HandlerError> {
        (**self).handle_log_entry(cx, entry).await
    }

    async fn handle_trace_spans(
        &self,
        cx: &CancellationToken,
        spans: &[Span],
    ) -> Result<(), HandlerError> {
        (**self).handle_trace_spans(cx, spans).await
    }
}

/// The envelope end of a connection to an already started weavelet.
///
/// RPCs *to* the weavelet can be issued as soon as construction returns.
/// Messages *from* the weavelet are queued until [`EnvelopeConn::serve`] is
/// called. The connection stops on the first error or when the token passed
/// to the constructor is cancelled.
pub struct EnvelopeConn<T = StreamTransport<EnvelopeMsg, WeaveletMsg>>
where
    T: Transport<Out = EnvelopeMsg, In = WeaveletMsg>,
{
    shared: Arc<Shared<T>>,
    running: Mutex<Option<JoinSet<()>>>,
    weavelet: WeaveletInfo,
    metrics: Mutex<MetricsImporter>,
}

impl EnvelopeConn {
    /// Connects over `reader`/`writer` and performs the handshake, sending
    /// `info` and waiting for the weavelet's [`WeaveletInfo`].
    pub async fn new<R, W>(
        token: &CancellationToken,
        reader: R,
        writer: W,
        info: EnvelopeInfo,
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
        info: EnvelopeInfo,
        options: &ConnOptions,
    ) -> Result<Self, ConnError>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let transport = StreamTransport::new("envelope", reader, writer, options);
        Self::with_transport(token, transport, info).await
    }
}

impl<T> EnvelopeConn<T>
where
    T: Transport<Out = EnvelopeMsg, In = WeaveletMsg>,
{
    /// Like [`EnvelopeConn::new`], over an arbitrary transport.
    pub async fn with_transport(
        token: &CancellationToken,
        transport: T,
        info: EnvelopeInfo,
    ) -> Result<Self, ConnError> {
        let token = token.child_token();
        let weavelet = match handshake(&token, &transport, info).await {
            Ok(weavelet) => weavelet,
            Err(err) => {
                transport.cleanup(err.clone());
                return Err(err);
            }
        };
        tracing::info!(
            conn = "envelope",
            pid = weavelet.pid,
            dial_addr = %weavelet.dial_addr,
            "weavelet connected"
        );

        let shared = Arc::new(Shared::new("envelope", "weavelet", token, transport));
        let running = lifecycle::start(&shared);
        Ok(Self {
            shared,
            running: Mutex::new(Some(running)),
            weavelet,
            metrics: Mutex::new(MetricsImporter::new()),
        })
    }

    /// Handles messages from the weavelet, one at a time in arrival order,
    /// until the connection stops. Returns the error that stopped it;
    /// cancellation is reported as [`ConnError::Cancelled`].
    pub async fn serve<H: EnvelopeHandler + 'static>(&self, handler: H) -> ConnError {
        lifecycle::serve(&self.shared, &self.running, EnvelopeDispatch(handler)).await
    }

    /// Information the weavelet reported during the handshake.
    pub fn weavelet_info(&self) -> &WeaveletInfo {
        &self.weavelet
    }

    /// Fetches the weavelet's metrics.
    ///
    /// Only one `get_metrics` call may be outstanding at a time.
    pub async fn get_metrics(&self) -> Result<Vec<MetricSnapshot>, ConnError> {
        let reply = self
            .shared
            .rpc(EnvelopeMsg::new(EnvelopePayload::GetMetricsRequest(
                GetMetricsRequest {},
            )))
            .await?;
        let reply = expect_reply(reply, "GetMetricsReply", |p| match p {
            WeaveletPayload::GetMetricsReply(r) => Some(r),
            _ => None,
        })?;
        let snapshots = self
            .metrics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .import(reply.update)?;
        Ok(snapshots)
    }

    pub async fn get_health(&self) -> Result<HealthStatus, ConnError> {
        let reply = self
            .shared
            .rpc(EnvelopeMsg::new(EnvelopePayload::GetHealthRequest(
                GetHealthRequest {},
            )))
            .await?;
        let reply = expect_reply(reply, "GetHealthReply", |p| match p {
            WeaveletPayload::GetHealthReply(r) => Some(r),
            _ => None,
        })?;
        Ok(reply.status)
    }

    pub async fn get_load(&self) -> Result<LoadReport, ConnError> {
        let reply = self
            .shared
            .rpc(EnvelopeMsg::new(EnvelopePayload::GetLoadRequest(
                GetLoadRequest {},
            )))
            .await?;
        let reply = expect_reply(reply, "GetLoadReply", |p| match p {
            WeaveletPayload::GetLoadReply(r) => Some(r),
            _ => None,
        })?;
        Ok(reply.load)
    }

    /// Collects a profile from the weavelet.
    ///
    /// Only one `get_profile` call may be outstanding at a time.
    pub async fn get_profile(&self, req: GetProfileRequest) -> Result<Vec<u8>, ConnError> {
        let reply = self
            .shared
            .rpc(EnvelopeMsg::new(EnvelopePayload::GetProfileRequest(req)))
            .await?;
        let reply = expect_reply(reply, "GetProfileReply", |p| match p {
            WeaveletPayload::GetProfileReply(r) => Some(r),
            _ => None,
        })?;
        Ok(reply.data)
    }

    /// Tells the weavelet the full set of components it should run.
    pub async fn update_components(&self, components: Vec<String>) -> Result<(), ConnError> {
        let reply = self
            .shared
            .rpc(EnvelopeMsg::new(EnvelopePayload::UpdateComponentsRequest(
                UpdateComponentsRequest { components },
            )))
            .await?;
        expect_reply(reply, "UpdateComponentsReply", |p| match p {
            WeaveletPayload::UpdateComponentsReply(r) => Some(r),
            _ => None,
        })?;
        Ok(())
    }

    /// Sends the weavelet a component's latest routing info.
    pub async fn update_routing_info(&self, routing_info: RoutingInfo) -> Result<(), ConnError> {
        let reply = self
            .shared
            .rpc(EnvelopeMsg::new(EnvelopePayload::UpdateRoutingInfoRequest(
                UpdateRoutingInfoRequest { routing_info },
            )))
            .await?;
        expect_reply(reply, "UpdateRoutingInfoReply", |p| match p {
            WeaveletPayload::UpdateRoutingInfoReply(r) => Some(r),
            _ => None,
        })?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn stop(&self, err: ConnError) {
        self.shared.stop(err);
    }

    #[cfg(test)]
    pub(crate) async fn handle_message<H: EnvelopeHandler>(
        &self,
        msg: WeaveletMsg,
        handler: &H,
    ) -> Result<(), ConnError> {
        handle_message(&self.shared, handler, msg).await
    }
}

impl<T> Drop for EnvelopeConn<T>
where
    T: Transport<Out = EnvelopeMsg, In = WeaveletMsg>,
{
    fn drop(&mut self) {
        self.shared.stop(TransportError::Closed.into());
    }
}

async fn handshake<T>(
    token: &CancellationToken,
    transport: &T,
    info: EnvelopeInfo,
) -> Result<WeaveletInfo, ConnError>
where
    T: Transport<Out = EnvelopeMsg, In = WeaveletMsg>,
{
    transport
        .send(EnvelopeMsg::new(EnvelopePayload::EnvelopeInfo(info)))
        .await
        .map_err(|err| ConnError::Handshake(err.to_string()))?;
    let reply = lifecycle::recv_first(token, transport)
        .await
        .map_err(|err| ConnError::Handshake(err.to_string()))?;
    match reply.payload {
        Some(WeaveletPayload::WeaveletInfo(info)) => Ok(info),
        other => Err(ConnError::Handshake(format!(
            "the first message from the weavelet must contain weavelet info, got {}",
            other.as_ref().map_or("<empty>", WeaveletPayload::kind)
        ))),
    }
}

struct EnvelopeDispatch<H>(H);

#[async_trait]
impl<T, H> Dispatch<T> for EnvelopeDispatch<H>
where
    T: Transport<Out = EnvelopeMsg, In = WeaveletMsg>,
    H: EnvelopeHandler + 'static,
{
    async fn dispatch(&self, shared: &Shared<T>, msg: WeaveletMsg) -> Result<(), ConnError> {
        handle_message(shared, &self.0, msg).await
    }
}

/// Handles one weavelet-initiated message. Replies are never seen here;
/// the transport routes them to their callers.
async fn handle_message<T, H>(
    shared: &Shared<T>,
    handler: &H,
    msg: WeaveletMsg,
) -> Result<(), ConnError>
where
    T: Transport<Out = EnvelopeMsg, In = WeaveletMsg>,
    H: EnvelopeHandler + ?Sized,
{
    let cx = &shared.token;
    let id = msg.id;
    let reply = match msg.payload {
        Some(WeaveletPayload::ActivateComponentRequest(req)) => {
            let res = handler.activate_component(cx, req).await;
            EnvelopeMsg::reply(
                id,
                error_string(&res),
                res.ok().map(EnvelopePayload::ActivateComponentReply),
            )
        }
        Some(WeaveletPayload::GetListenerAddressRequest(req)) => {
            let res = handler.get_listener_address(cx, req).await;
            EnvelopeMsg::reply(
                id,
                error_string(&res),
                res.ok().map(EnvelopePayload::GetListenerAddressReply),
            )
        }
        Some(WeaveletPayload::ExportListenerRequest(req)) => {
            let res = handler.export_listener(cx, req).await;
            EnvelopeMsg::reply(
                id,
                error_string(&res),
                res.ok().map(EnvelopePayload::ExportListenerReply),
            )
        }
        Some(WeaveletPayload::LogEntry(entry)) => {
            return handler
                .handle_log_entry(cx, entry)
                .await
                .map_err(|err| ConnError::Handler(err.to_string()));
        }
        Some(WeaveletPayload::TraceSpans(spans)) => {
            return handler
                .handle_trace_spans(cx, &spans.spans)
                .await
                .map_err(|err| ConnError::Handler(err.to_string()));
        }
        other => {
            let err = ConnError::Protocol(format!(
                "envelope: unexpected message id={id} kind={}",
                other.as_ref().map_or("<empty>", WeaveletPayload::kind)
            ));
            shared.transport.cleanup(err.clone());
            return Err(err);
        }
    };
    shared.transport.send(reply).await
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rstest::rstest;
    use tokio::io::{AsyncWriteExt, DuplexStream, WriteHalf};
    use tokio::sync::mpsc;

    use super::*;
    use crate::conn::testing::{FakeTransport, RecordingEnvelopeHandler, test_weavelet_info};

    type PeerSide = StreamTransport<WeaveletMsg, EnvelopeMsg>;

    /// Connects an envelope to a raw weavelet-side transport driven by the test.
    async fn connect() -> (EnvelopeConn, Arc<PeerSide>, CancellationToken) {
        let (a, b) = tokio::io::duplex(1 << 16);
        let (ar, aw) = tokio::io::split(a);
        let (br, bw) = tokio::io::split(b);
        let peer: Arc<PeerSide> = Arc::new(StreamTransport::new(
            "weavelet",
            br,
            bw,
            &ConnOptions::default(),
        ));

        // the duplex buffer holds the weavelet's hello until the envelope reads it
        peer.send(WeaveletMsg::new(WeaveletPayload::WeaveletInfo(
            test_weavelet_info(),
        )))
        .await
        .unwrap();

        let token = CancellationToken::new();
        let conn = EnvelopeConn::new(&token, ar, aw, EnvelopeInfo::new("app", "dep"))
            .await
            .unwrap();

        let hello = peer.recv().await.unwrap();
        assert!(matches!(
            hello.payload,
            Some(EnvelopePayload::EnvelopeInfo(_))
        ));
        (conn, peer, token)
    }

    fn log_entry(msg: &str) -> WeaveletMsg {
        WeaveletMsg::new(WeaveletPayload::LogEntry(LogEntry {
            msg: msg.into(),
            ..Default::default()
        }))
    }

    #[tokio::test]
    async fn handshake_exposes_weavelet_info() {
        let (conn, _peer, _token) = connect().await;
        assert_eq!(conn.weavelet_info(), &test_weavelet_info());
    }

    #[tokio::test]
    async fn handshake_rejects_first_frame_without_info() {
        let (a, b) = tokio::io::duplex(1 << 16);
        let (ar, aw) = tokio::io::split(a);
        let (br, bw) = tokio::io::split(b);
        let peer: PeerSide = StreamTransport::new("weavelet", br, bw, &ConnOptions::default());
        peer.send(log_entry("too early")).await.unwrap();

        let token = CancellationToken::new();
        let err = EnvelopeConn::new(&token, ar, aw, EnvelopeInfo::new("app", "dep"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ConnError::Handshake(_)));
        assert!(err.to_string().contains("weavelet info"));

        // the envelope's hello arrives, then the stream is closed
        peer.recv().await.unwrap();
        assert!(peer.recv().await.is_err());
    }

    #[tokio::test]
    async fn handshake_failure_cleans_up_transport() {
        let (fake, inbound) = FakeTransport::new();
        drop(inbound);

        let token = CancellationToken::new();
        let err = EnvelopeConn::with_transport(&token, Arc::clone(&fake), EnvelopeInfo::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ConnError::Handshake(_)));
        assert_eq!(fake.cleanups().len(), 1);
    }

    #[tokio::test]
    async fn requests_queued_before_serve_are_dispatched_in_order() {
        let (conn, peer, token) = connect().await;
        let names: Vec<String> = (0..20).map(|i| format!("entry-{i}")).collect();
        for name in &names {
            peer.send(log_entry(name)).await.unwrap();
        }

        let (events, mut rx) = mpsc::unbounded_channel();
        let handler = RecordingEnvelopeHandler::new(events);
        let serving = tokio::spawn(async move { conn.serve(handler).await });

        let mut seen = Vec::new();
        while seen.len() < names.len() {
            seen.push(rx.recv().await.unwrap());
        }
        assert_eq!(seen, names);

        token.cancel();
        let err = serving.await.unwrap();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn concurrent_rpcs_resolve_to_their_own_replies() {
        let (conn, peer, _token) = connect().await;
        let conn = Arc::new(conn);

        let health = tokio::spawn({
            let conn = Arc::clone(&conn);
            async move { conn.get_health().await }
        });
        let a = peer.recv().await.unwrap();
        let load = tokio::spawn({
            let conn = Arc::clone(&conn);
            async move { conn.get_load().await }
        });
        let b = peer.recv().await.unwrap();

        // answer the second call first
        let mut report = LoadReport::default();
        report.loads.insert(
            "c".into(),
            ComponentLoad {
                version: 3,
                load: 1.5,
            },
        );
        peer.send(WeaveletMsg::reply(
            b.id,
            String::new(),
            Some(WeaveletPayload::GetLoadReply(GetLoadReply {
                load: report.clone(),
            })),
        ))
        .await
        .unwrap();
        peer.send(WeaveletMsg::reply(
            a.id,
            String::new(),
            Some(WeaveletPayload::GetHealthReply(GetHealthReply {
                status: HealthStatus::Healthy,
            })),
        ))
        .await
        .unwrap();

        assert_eq!(health.await.unwrap().unwrap(), HealthStatus::Healthy);
        assert_eq!(load.await.unwrap().unwrap(), report);
    }

    #[tokio::test]
    async fn first_stop_error_wins() {
        let (conn, _peer, _token) = connect().await;
        conn.stop(ConnError::Protocol("first".into()));
        conn.stop(ConnError::Protocol("second".into()));
        conn.stop(ConnError::Cancelled);

        let (events, _rx) = mpsc::unbounded_channel();
        let err = conn.serve(RecordingEnvelopeHandler::new(events)).await;
        assert_eq!(err.to_string(), "protocol violation: first");
    }

    #[tokio::test]
    async fn stop_always_cleans_up_transport() {
        let (fake, inbound) = FakeTransport::new();
        inbound
            .send(WeaveletMsg::new(WeaveletPayload::WeaveletInfo(
                test_weavelet_info(),
            )))
            .unwrap();
        let token = CancellationToken::new();
        let conn = EnvelopeConn::with_transport(&token, Arc::clone(&fake), EnvelopeInfo::default())
            .await
            .unwrap();

        conn.stop(ConnError::Protocol("first".into()));
        conn.stop(ConnError::Protocol("second".into()));

        let cleanups = fake.cleanups();
        assert!(cleanups.len() >= 2);
        assert_eq!(cleanups[0], "protocol violation: first");
        assert!(cleanups.contains(&"protocol violation: second".to_string()));
        assert!(fake.is_closed());
    }

    #[tokio::test]
    async fn cancel_without_serve_releases_blocked_rpc() {
        let (conn, peer, token) = connect().await;
        let conn = Arc::new(conn);

        let call = tokio::spawn({
            let conn = Arc::clone(&conn);
            async move { conn.get_health().await }
        });
        // the weavelet reads the request but never answers
        peer.recv().await.unwrap();
        token.cancel();

        let err = tokio::time::timeout(Duration::from_secs(1), call)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert!(err.is_cancelled());
        assert!(matches!(err, ConnError::Broken { peer: "weavelet", .. }));

        // the envelope closed its end of the pipes
        assert!(peer.recv().await.is_err());
    }

    #[tokio::test]
    async fn empty_message_is_a_protocol_violation() {
        let (conn, peer, _token) = connect().await;
        peer.send(WeaveletMsg {
            id: 5,
            ..Default::default()
        })
        .await
        .unwrap();

        let (events, _rx) = mpsc::unbounded_channel();
        let err = conn.serve(RecordingEnvelopeHandler::new(events)).await;
        assert!(matches!(err, ConnError::Protocol(_)));
        assert!(err.to_string().contains("<empty>"));
    }

    #[tokio::test]
    async fn handle_message_tears_down_on_unknown_shape() {
        let (fake, inbound) = FakeTransport::new();
        inbound
            .send(WeaveletMsg::new(WeaveletPayload::WeaveletInfo(
                test_weavelet_info(),
            )))
            .unwrap();
        let token = CancellationToken::new();
        let conn = EnvelopeConn::with_transport(&token, Arc::clone(&fake), EnvelopeInfo::default())
            .await
            .unwrap();

        let (events, _rx) = mpsc::unbounded_channel();
        let handler = RecordingEnvelopeHandler::new(events);
        let err = conn
            .handle_message(WeaveletMsg::default(), &handler)
            .await
            .unwrap_err();
        assert!(matches!(err, ConnError::Protocol(_)));
        assert!(fake.is_closed());
    }

    #[tokio::test]
    async fn handler_results_are_sent_as_replies() {
        let (fake, inbound) = FakeTransport::new();
        inbound
            .send(WeaveletMsg::new(WeaveletPayload::WeaveletInfo(
                test_weavelet_info(),
            )))
            .unwrap();
        let token = CancellationToken::new();
        let conn = EnvelopeConn::with_transport(&token, Arc::clone(&fake), EnvelopeInfo::default())
            .await
            .unwrap();

        let (events, _rx) = mpsc::unbounded_channel();
        let handler = RecordingEnvelopeHandler::new(events).failing_activation("no such component");

        let mut req = WeaveletMsg::new(WeaveletPayload::ActivateComponentRequest(
            ActivateComponentRequest {
                component: "missing".into(),
                routed: false,
            },
        ));
        req.id = 9;
        conn.handle_message(req, &handler).await.unwrap();

        let mut req = WeaveletMsg::new(WeaveletPayload::GetListenerAddressRequest(
            GetListenerAddressRequest { name: "lis".into() },
        ));
        req.id = 10;
        conn.handle_message(req, &handler).await.unwrap();

        let sent = fake.sent();
        // sent[0] is the handshake
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[1].id, -9);
        assert_eq!(sent[1].error, "no such component");
        assert_eq!(sent[1].payload, None);
        assert_eq!(sent[2].id, -10);
        assert!(sent[2].error.is_empty());
        assert!(matches!(
            sent[2].payload,
            Some(EnvelopePayload::GetListenerAddressReply(_))
        ));
    }

    #[rstest]
    #[case::matching_reply(
        WeaveletPayload::UpdateComponentsReply(UpdateComponentsReply {}),
        None
    )]
    #[case::wrong_kind(
        WeaveletPayload::GetHealthReply(GetHealthReply::default()),
        Some("malformed reply: expected UpdateComponentsReply, got GetHealthReply")
    )]
    #[tokio::test]
    async fn update_components_validates_reply(
        #[case] payload: WeaveletPayload,
        #[case] expected_err: Option<&str>,
    ) {
        let (conn, peer, _token) = connect().await;
        let conn = Arc::new(conn);

        let call = tokio::spawn({
            let conn = Arc::clone(&conn);
            async move { conn.update_components(vec!["a".into(), "b".into()]).await }
        });
        let req = peer.recv().await.unwrap();
        assert_eq!(
            req.payload,
            Some(EnvelopePayload::UpdateComponentsRequest(
                UpdateComponentsRequest {
                    components: vec!["a".into(), "b".into()],
                }
            ))
        );
        peer.send(WeaveletMsg::reply(req.id, String::new(), Some(payload)))
            .await
            .unwrap();

        let res = call.await.unwrap();
        match expected_err {
            None => res.unwrap(),
            Some(text) => {
                let err = res.unwrap_err();
                assert!(err.is_malformed_reply());
                assert_eq!(err.to_string(), text);
            }
        }

        // the connection is still usable either way
        let call = tokio::spawn({
            let conn = Arc::clone(&conn);
            async move { conn.get_health().await }
        });
        let req = peer.recv().await.unwrap();
        peer.send(WeaveletMsg::reply(
            req.id,
            String::new(),
            Some(WeaveletPayload::GetHealthReply(GetHealthReply {
                status: HealthStatus::Healthy,
            })),
        ))
        .await
        .unwrap();
        assert_eq!(call.await.unwrap().unwrap(), HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn missing_payload_and_peer_error_are_distinguished() {
        let (conn, peer, _token) = connect().await;
        let conn = Arc::new(conn);

        let call = tokio::spawn({
            let conn = Arc::clone(&conn);
            async move { conn.get_profile(GetProfileRequest::default()).await }
        });
        let req = peer.recv().await.unwrap();
        peer.send(WeaveletMsg::reply(req.id, String::new(), None))
            .await
            .unwrap();
        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            ConnError::MissingReply {
                expected: "GetProfileReply"
            }
        ));

        let call = tokio::spawn({
            let conn = Arc::clone(&conn);
            async move { conn.get_profile(GetProfileRequest::default()).await }
        });
        let req = peer.recv().await.unwrap();
        peer.send(WeaveletMsg::reply(req.id, "profiling disabled".into(), None))
            .await
            .unwrap();
        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, ConnError::Application(_)));
        assert_eq!(err.to_string(), "profiling disabled");
    }

    #[tokio::test]
    async fn get_metrics_imports_update() {
        let (conn, peer, _token) = connect().await;
        let conn = Arc::new(conn);

        let call = tokio::spawn({
            let conn = Arc::clone(&conn);
            async move { conn.get_metrics().await }
        });
        let req = peer.recv().await.unwrap();
        let update = MetricsUpdate {
            defs: vec![MetricDef {
                id: 1,
                name: "requests".into(),
                ..Default::default()
            }],
            values: vec![MetricValue {
                id: 1,
                value: 12.0,
                counts: vec![],
            }],
        };
        peer.send(WeaveletMsg::reply(
            req.id,
            String::new(),
            Some(WeaveletPayload::GetMetricsReply(GetMetricsReply { update })),
        ))
        .await
        .unwrap();

        let snapshots = call.await.unwrap().unwrap();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].name, "requests");
        assert_eq!(snapshots[0].value, 12.0);
    }

    #[tokio::test]
    async fn rpc_transport_failure_stops_connection() {
        let (fake, inbound) = FakeTransport::new();
        inbound
            .send(WeaveletMsg::new(WeaveletPayload::WeaveletInfo(
                test_weavelet_info(),
            )))
            .unwrap();
        fake.fail_rpcs_with(ConnError::Transport(TransportError::Closed));
        let token = CancellationToken::new();
        let conn = EnvelopeConn::with_transport(&token, Arc::clone(&fake), EnvelopeInfo::default())
            .await
            .unwrap();

        let err = conn.get_health().await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "connection to weavelet broken: transport closed"
        );

        let (events, _rx) = mpsc::unbounded_channel();
        let served = conn.serve(RecordingEnvelopeHandler::new(events)).await;
        assert_eq!(served.to_string(), err.to_string());
    }

    #[tokio::test]
    async fn serve_twice_is_rejected() {
        let (conn, _peer, token) = connect().await;
        let conn = Arc::new(conn);
        let (events, _rx) = mpsc::unbounded_channel();
        let first = tokio::spawn({
            let conn = Arc::clone(&conn);
            let handler = RecordingEnvelopeHandler::new(events.clone());
            async move { conn.serve(handler).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let second = conn.serve(RecordingEnvelopeHandler::new(events)).await;
        assert!(matches!(second, ConnError::AlreadyServing));

        token.cancel();
        assert!(first.await.unwrap().is_cancelled());
    }

    #[tokio::test]
    async fn dropping_the_serve_future_keeps_the_connection_running() {
        let (conn, peer, token) = connect().await;
        let conn = Arc::new(conn);

        let (events, mut rx) = mpsc::unbounded_channel();
        let timed_out = tokio::time::timeout(
            Duration::from_millis(20),
            conn.serve(RecordingEnvelopeHandler::new(events)),
        )
        .await;
        assert!(timed_out.is_err());

        // the dispatcher keeps handing messages to the handler
        peer.send(log_entry("after timeout")).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), "after timeout");

        // and the reader keeps routing replies
        let call = tokio::spawn({
            let conn = Arc::clone(&conn);
            async move { conn.get_health().await }
        });
        let req = peer.recv().await.unwrap();
        peer.send(WeaveletMsg::reply(
            req.id,
            String::new(),
            Some(WeaveletPayload::GetHealthReply(GetHealthReply {
                status: HealthStatus::Healthy,
            })),
        ))
        .await
        .unwrap();
        let status = tokio::time::timeout(Duration::from_secs(1), call)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(status, HealthStatus::Healthy);

        let (events, _rx) = mpsc::unbounded_channel();
        let again = conn.serve(RecordingEnvelopeHandler::new(events)).await;
        assert!(matches!(again, ConnError::AlreadyServing));

        token.cancel();
        assert!(peer.recv().await.is_err());
    }

    async fn write_raw_frame(w: &mut WriteHalf<DuplexStream>, body: &[u8]) {
        w.write_all(&(body.len() as u32).to_le_bytes()).await.unwrap();
        w.write_all(body).await.unwrap();
        w.flush().await.unwrap();
    }

    #[tokio::test]
    async fn unknown_payload_kind_is_a_protocol_violation() {
        let (a, b) = tokio::io::duplex(1 << 16);
        let (ar, aw) = tokio::io::split(a);
        let (_br, mut bw) = tokio::io::split(b);

        let hello = serde_json::to_vec(&WeaveletMsg::new(WeaveletPayload::WeaveletInfo(
            test_weavelet_info(),
        )))
        .unwrap();
        write_raw_frame(&mut bw, &hello).await;
        let token = CancellationToken::new();
        let conn = EnvelopeConn::new(&token, ar, aw, EnvelopeInfo::new("app", "dep"))
            .await
            .unwrap();

        // a request kind added by a newer weavelet
        write_raw_frame(&mut bw, br#"{"id":4,"payload":{"future_request":{}}}"#).await;

        let (events, _rx) = mpsc::unbounded_channel();
        let err = tokio::time::timeout(
            Duration::from_secs(2),
            conn.serve(RecordingEnvelopeHandler::new(events)),
        )
        .await
        .unwrap();
        assert!(matches!(err, ConnError::Protocol(_)), "{err}");
        assert!(err.to_string().contains("id=4"));
    }

    #[tokio::test]
    async fn panicking_handler_stops_the_connection() {
        let (conn, peer, _token) = connect().await;
        peer.send(log_entry("boom")).await.unwrap();

        let (events, _rx) = mpsc::unbounded_channel();
        let handler = RecordingEnvelopeHandler::new(events).panicking_on_logs();
        let err = tokio::time::timeout(Duration::from_secs(2), conn.serve(handler))
            .await
            .unwrap();
        assert!(matches!(err, ConnError::TaskPanicked(_)), "{err}");
        assert!(!err.is_cancelled());

        // the envelope closed its end of the pipes
        assert!(peer.recv().await.is_err());
    }
}
