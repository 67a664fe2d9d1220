//! Payload structs carried inside [`super::EnvelopeMsg`] and [`super::WeaveletMsg`].

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

// ── handshake ───────────────────────────────────────────────────────────────

/// Identity and configuration the envelope hands to a weavelet.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeInfo {
    pub app: String,
    pub deployment_id: String,
    /// Unique id of the weavelet this envelope supervises.
    pub id: String,
    /// Application config sections, keyed by section name.
    #[serde(default)]
    pub sections: BTreeMap<String, String>,
    #[serde(default)]
    pub single_process: bool,
    #[serde(default)]
    pub single_machine: bool,
    #[serde(default)]
    pub run_main: bool,
}

impl EnvelopeInfo {
    /// Builds info for a new weavelet with a freshly generated id.
    pub fn new(app: impl Into<String>, deployment_id: impl Into<String>) -> Self {
        Self {
            app: app.into(),
            deployment_id: deployment_id.into(),
            id: Ulid::new().to_string(),
            ..Default::default()
        }
    }
}

/// Identity the weavelet reports back during the handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeaveletInfo {
    /// Address other weavelets dial to reach this one.
    pub dial_addr: String,
    pub pid: i64,
    pub version: SemVer,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SemVer {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

// ── weavelet → envelope requests ────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivateComponentRequest {
    pub component: String,
    #[serde(default)]
    pub routed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivateComponentReply {}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetListenerAddressRequest {
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetListenerAddressReply {
    pub network: String,
    pub address: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportListenerRequest {
    pub listener: String,
    pub address: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportListenerReply {
    /// Address of the proxy fronting the listener, if any.
    #[serde(default)]
    pub proxy_address: String,
    /// Non-fatal export failure reported back to the weavelet.
    #[serde(default)]
    pub error: String,
}

// ── weavelet → envelope notifications ───────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub app: String,
    pub version: String,
    pub component: String,
    pub node: String,
    pub time_micros: i64,
    pub level: String,
    pub file: String,
    pub line: i32,
    pub msg: String,
    /// Flattened key/value pairs.
    #[serde(default)]
    pub attrs: Vec<String>,
}

impl LogEntry {
    /// Entry time, or `None` if `time_micros` is out of range.
    pub fn time(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_micros(self.time_micros)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TraceSpans {
    pub spans: Vec<Span>,
}

/// A finished trace span. Handlers receive these read-only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Span {
    pub name: String,
    pub trace_id: String,
    pub span_id: String,
    #[serde(default)]
    pub parent_span_id: String,
    #[serde(default)]
    pub kind: SpanKind,
    pub start_micros: i64,
    pub end_micros: i64,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub status: SpanStatus,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanKind {
    #[default]
    Internal,
    Server,
    Client,
    Producer,
    Consumer,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpanStatus {
    #[serde(default)]
    pub error: bool,
    #[serde(default)]
    pub description: String,
}

// ── envelope → weavelet requests ────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetMetricsRequest {}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GetMetricsReply {
    pub update: MetricsUpdate,
}

/// Delta of metric definitions and values since the previous update.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsUpdate {
    /// Definitions of metrics not reported before.
    #[serde(default)]
    pub defs: Vec<MetricDef>,
    #[serde(default)]
    pub values: Vec<MetricValue>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricDef {
    pub id: u64,
    pub name: String,
    pub typ: MetricType,
    #[serde(default)]
    pub help: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Histogram bucket bounds.
    #[serde(default)]
    pub bounds: Vec<f64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    #[default]
    Counter,
    Gauge,
    Histogram,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricValue {
    pub id: u64,
    pub value: f64,
    /// Histogram bucket counts.
    #[serde(default)]
    pub counts: Vec<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetHealthRequest {}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetHealthReply {
    pub status: HealthStatus,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
    Terminated,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetLoadRequest {}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GetLoadReply {
    pub load: LoadReport,
}

/// Per-component load observed by a weavelet.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadReport {
    #[serde(default)]
    pub loads: BTreeMap<String, ComponentLoad>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComponentLoad {
    /// Routing info version the load was measured against.
    pub version: u64,
    /// Requests per second.
    pub load: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetProfileRequest {
    pub profile_type: ProfileType,
    /// CPU profile duration; ignored for heap profiles.
    #[serde(default)]
    pub cpu_duration_ns: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileType {
    #[default]
    Heap,
    Cpu,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetProfileReply {
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateComponentsRequest {
    pub components: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateComponentsReply {}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateRoutingInfoRequest {
    pub routing_info: RoutingInfo,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateRoutingInfoReply {}

/// Where the replicas of a component live.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingInfo {
    pub component: String,
    /// Component runs in the same process as its caller.
    #[serde(default)]
    pub local: bool,
    #[serde(default)]
    pub replicas: Vec<String>,
}
