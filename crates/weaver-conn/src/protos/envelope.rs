use serde::{Deserialize, Serialize};

use super::{Message, Payload};
use super::types::*;

/// A message sent by the envelope to the weavelet.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeMsg {
    #[serde(default)]
    pub id: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    /// `None` is a legal encoding but never a valid message.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "super::payload_or_unknown"
    )]
    pub payload: Option<EnvelopePayload>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopePayload {
    // handshake
    EnvelopeInfo(EnvelopeInfo),

    // replies to weavelet-initiated requests
    ActivateComponentReply(ActivateComponentReply),
    GetListenerAddressReply(GetListenerAddressReply),
    ExportListenerReply(ExportListenerReply),

    // envelope-initiated requests
    GetMetricsRequest(GetMetricsRequest),
    GetHealthRequest(GetHealthRequest),
    GetLoadRequest(GetLoadRequest),
    GetProfileRequest(GetProfileRequest),
    UpdateComponentsRequest(UpdateComponentsRequest),
    UpdateRoutingInfoRequest(UpdateRoutingInfoRequest),
}

impl EnvelopePayload {
    pub fn kind(&self) -> &'static str {
        match self {
            EnvelopePayload::EnvelopeInfo(_) => "EnvelopeInfo",
            EnvelopePayload::ActivateComponentReply(_) => "ActivateComponentReply",
            EnvelopePayload::GetListenerAddressReply(_) => "GetListenerAddressReply",
            EnvelopePayload::ExportListenerReply(_) => "ExportListenerReply",
            EnvelopePayload::GetMetricsRequest(_) => "GetMetricsRequest",
            EnvelopePayload::GetHealthRequest(_) => "GetHealthRequest",
            EnvelopePayload::GetLoadRequest(_) => "GetLoadRequest",
            EnvelopePayload::GetProfileRequest(_) => "GetProfileRequest",
            EnvelopePayload::UpdateComponentsRequest(_) => "UpdateComponentsRequest",
            EnvelopePayload::UpdateRoutingInfoRequest(_) => "UpdateRoutingInfoRequest",
        }
    }
}

impl Payload for EnvelopePayload {
    const TAGS: &'static [&'static str] = &[
        "envelope_info",
        "activate_component_reply",
        "get_listener_address_reply",
        "export_listener_reply",
        "get_metrics_request",
        "get_health_request",
        "get_load_request",
        "get_profile_request",
        "update_components_request",
        "update_routing_info_request",
    ];
}

impl EnvelopeMsg {
    pub fn new(payload: EnvelopePayload) -> Self {
        Self {
            payload: Some(payload),
            ..Default::default()
        }
    }

    /// Builds the reply to a weavelet request with id `request_id`.
    pub fn reply(request_id: i64, error: String, payload: Option<EnvelopePayload>) -> Self {
        Self {
            id: -request_id,
            error,
            payload,
        }
    }
}

impl Message for EnvelopeMsg {
    type Payload = EnvelopePayload;

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
        self.payload.as_ref().map_or("<empty>", EnvelopePayload::kind)
    }

    fn into_payload(self) -> Option<EnvelopePayload> {
        self.payload
    }
}
