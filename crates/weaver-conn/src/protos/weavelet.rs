use serde::{Deserialize, Serialize};

use super::{Message, Payload};
use super::types::*;

/// A message sent by the weavelet to the envelope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WeaveletMsg {
    #[serde(default)]
    pub id: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "super::payload_or_unknown"
    )]
    pub payload: Option<WeaveletPayload>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeaveletPayload {
    // handshake
    WeaveletInfo(WeaveletInfo),

    // weavelet-initiated requests
    ActivateComponentRequest(ActivateComponentRequest),
    GetListenerAddressRequest(GetListenerAddressRequest),
    ExportListenerRequest(ExportListenerRequest),

    // notifications
    LogEntry(LogEntry),
    TraceSpans(TraceSpans),

    // replies to envelope-initiated requests
    GetMetricsReply(GetMetricsReply),
    GetHealthReply(GetHealthReply),
    GetLoadReply(GetLoadReply),
    GetProfileReply(GetProfileReply),
    UpdateComponentsReply(UpdateComponentsReply),
    UpdateRoutingInfoReply(UpdateRoutingInfoReply),
}

impl WeaveletPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            WeaveletPayload::WeaveletInfo(_) => "WeaveletInfo",
            WeaveletPayload::ActivateComponentRequest(_) => "ActivateComponentRequest",
            WeaveletPayload::GetListenerAddressRequest(_) => "GetListenerAddressRequest",
            WeaveletPayload::ExportListenerRequest(_) => "ExportListenerRequest",
            WeaveletPayload::LogEntry(_) => "LogEntry",
            WeaveletPayload::TraceSpans(_) => "TraceSpans",
            WeaveletPayload::GetMetricsReply(_) => "GetMetricsReply",
            WeaveletPayload::GetHealthReply(_) => "GetHealthReply",
            WeaveletPayload::GetLoadReply(_) => "GetLoadReply",
            WeaveletPayload::GetProfileReply(_) => "GetProfileReply",
            WeaveletPayload::UpdateComponentsReply(_) => "UpdateComponentsReply",
            WeaveletPayload::UpdateRoutingInfoReply(_) => "UpdateRoutingInfoReply",
        }
    }
}

impl Payload for WeaveletPayload {
    const TAGS: &'static [&'static str] = &[
        "weavelet_info",
        "activate_component_request",
        "get_listener_address_request",
        "export_listener_request",
        "log_entry",
        "trace_spans",
        "get_metrics_reply",
        "get_health_reply",
        "get_load_reply",
        "get_profile_reply",
        "update_components_reply",
        "update_routing_info_reply",
    ];
}

impl WeaveletMsg {
    pub fn new(payload: WeaveletPayload) -> Self {
        Self {
            payload: Some(payload),
            ..Default::default()
        }
    }

    /// Builds the reply to an envelope request with id `request_id`.
    pub fn reply(request_id: i64, error: String, payload: Option<WeaveletPayload>) -> Self {
        Self {
            id: -request_id,
            error,
            payload,
        }
    }
}

impl Message for WeaveletMsg {
    type Payload = WeaveletPayload;

    fn id(&self) -> i64 {
        self.id
    }

    fn set_id(&mut self, id: i64) {
        self.id = id;
    }

    fn error(&self) -> &str {
        &self.error
    }

    fn kind(&self) -> &'static str {
        self.payload.as_ref().map_or("<empty>", WeaveletPayload::kind)
    }

    fn into_payload(self) -> Option<WeaveletPayload> {
        self.payload
    }
}
