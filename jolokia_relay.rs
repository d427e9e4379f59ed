//! # Jolokia Relay
//!
//! Periodically bulk-reads JMX attributes from a Jolokia agent, reshapes every
//! value into an InfluxDB line-protocol record and forwards the whole batch to
//! a line-protocol write endpoint.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                             JOLOKIA RELAY                                │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │  SCHEDULER tick → COLLECTOR (bulk read) → TAGS + VALUES → LINE ENCODER   │
//! │                                                   → SINK (single POST)   │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every tick dispatches an independent cycle. Cycles are fire-and-forget: a
//! slow cycle never delays the next tick, failed batches are logged and lost.

// ============================================================================
// SECTION 1: IMPORTS & DEPENDENCIES
// ============================================================================

#![allow(dead_code)]
#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]

// ----------------------------------------------------------------------------
// Standard Library Imports
// ----------------------------------------------------------------------------
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::env;
use std::fmt::{self, Debug, Display, Formatter};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

// ----------------------------------------------------------------------------
// Async Runtime - Tokio
// ----------------------------------------------------------------------------
use tokio::signal;
use tokio::time::{interval_at, timeout, Instant as TokioInstant, MissedTickBehavior};

// ----------------------------------------------------------------------------
// Serialization
// ----------------------------------------------------------------------------
use serde::{Deserialize, Serialize};
use serde_json::{Number as JsonNumber, Value as JsonValue};

// ----------------------------------------------------------------------------
// String & Memory Optimization
// ----------------------------------------------------------------------------
use compact_str::CompactString;
use smallvec::SmallVec;

// ----------------------------------------------------------------------------
// Error Handling
// ----------------------------------------------------------------------------
use anyhow::{Context as AnyhowContext, Result as AnyhowResult};
use thiserror::Error;

// ----------------------------------------------------------------------------
// Logging & Tracing
// ----------------------------------------------------------------------------
use tracing::level_filters::LevelFilter;
use tracing::{debug, error, info, trace, warn};
use tracing_subscriber::{fmt as fmt_layer, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

// ----------------------------------------------------------------------------
// Time & Timestamps
// ----------------------------------------------------------------------------
use chrono::{DateTime, Utc};

// ----------------------------------------------------------------------------
// Networking
// ----------------------------------------------------------------------------
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client as HttpClient, Url};

// ----------------------------------------------------------------------------
// Async Traits
// ----------------------------------------------------------------------------
use async_trait::async_trait;

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------
use figment::{
    providers::{Env, Format, Json},
    Figment,
};

// ----------------------------------------------------------------------------
// CLI
// ----------------------------------------------------------------------------
use clap::{Parser, Subcommand};

// ============================================================================
// SECTION 2: CONSTANTS & VERSION INFORMATION
// ============================================================================

/// Relay version - follows semantic versioning
pub const RELAY_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const RELAY_NAME: &str = "jolokia-relay";

// ----------------------------------------------------------------------------
// Timing & Intervals
// ----------------------------------------------------------------------------

/// Default tick interval between collection cycles
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(10);

/// Minimum allowed tick interval
pub const MIN_INTERVAL: Duration = Duration::from_millis(100);

/// Default timeout applied by the HTTP client to every request
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

// ----------------------------------------------------------------------------
// Process Surface
// ----------------------------------------------------------------------------

/// Default configuration file path
pub const DEFAULT_CONFIG_PATH: &str = "config.json";

/// Prefix for environment overrides of configuration keys
pub const CONFIG_ENV_PREFIX: &str = "JOLOKIA_RELAY_";

/// Environment variable that switches on verbose diagnostics
pub const DEBUG_ENV_VAR: &str = "DEBUG";

/// The only value of [`DEBUG_ENV_VAR`] that counts as "on"
pub const DEBUG_ENV_ON: &str = "y";

// ----------------------------------------------------------------------------
// Wire Format
// ----------------------------------------------------------------------------

/// Jolokia status code of a successful read
pub const STATUS_OK: i32 = 200;

/// Separator between the domain and the key properties of an MBean name
pub const IDENTIFIER_SEPARATOR: char = ':';

/// Tag that carries the MBean domain
pub const DOMAIN_TAG: &str = "name";

/// Field name used for scalar values
pub const SCALAR_FIELD: &str = "value";

/// Content type of the line-protocol write body
pub const LINE_PROTOCOL_CONTENT_TYPE: &str = "text/plain; charset=utf-8";

/// Upper bound on response body bytes kept for diagnostics
pub const MAX_DIAGNOSTIC_BODY_BYTES: usize = 1024;

// ============================================================================
// SECTION 3: CORE TYPE SYSTEM
// ============================================================================
// MetricSpec comes from configuration and never changes. ReadRequest,
// ReadResult and the encoded batch live for exactly one cycle.
// ============================================================================

// ----------------------------------------------------------------------------
// 3.1 Metric Specifications
// ----------------------------------------------------------------------------

/// One MBean to poll: which attributes to read and which derived tags to drop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricSpec {
    /// MBean object name, e.g. `java.lang:type=Memory`
    #[serde(rename = "name")]
    pub identifier: String,

    /// Attributes read from the MBean, in configuration order
    #[serde(default)]
    pub attributes: Vec<String>,

    /// Tag keys suppressed from every record of this MBean
    #[serde(default, rename = "droptags")]
    pub drop_tags: BTreeSet<String>,
}

impl MetricSpec {
    pub fn new<I, A>(identifier: impl Into<String>, attributes: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<String>,
    {
        Self {
            identifier: identifier.into(),
            attributes: attributes.into_iter().map(Into::into).collect(),
            drop_tags: BTreeSet::new(),
        }
    }

    pub fn with_drop_tags<I, T>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.drop_tags.extend(tags.into_iter().map(Into::into));
        self
    }

    /// Read requests for this MBean, one per attribute.
    pub fn read_requests(&self) -> impl Iterator<Item = ReadRequest> + '_ {
        self.attributes
            .iter()
            .map(move |attribute| ReadRequest::new(self.identifier.as_str(), attribute.as_str()))
    }
}

/// Flattens specs × attributes into the cycle's request batch, in configuration order.
pub fn build_read_requests(specs: &[MetricSpec]) -> Vec<ReadRequest> {
    specs.iter().flat_map(MetricSpec::read_requests).collect()
}

// ----------------------------------------------------------------------------
// 3.2 Read Requests & Results
// ----------------------------------------------------------------------------

/// Jolokia operation type. The relay only ever reads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestKind {
    #[default]
    Read,
}

/// A single entry of a Jolokia bulk request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReadRequest {
    #[serde(rename = "type", default)]
    pub kind: RequestKind,

    #[serde(rename = "mbean")]
    pub identifier: String,

    pub attribute: String,
}

impl ReadRequest {
    pub fn new(identifier: impl Into<String>, attribute: impl Into<String>) -> Self {
        Self {
            kind: RequestKind::Read,
            identifier: identifier.into(),
            attribute: attribute.into(),
        }
    }
}

impl Display for ReadRequest {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.identifier, self.attribute)
    }
}

/// A single entry of a Jolokia bulk response.
///
/// Failed reads carry no `value` or `timestamp`; both fall back to defaults so
/// one bad attribute never spoils decoding of the batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadResult {
    /// The request as echoed back by the agent
    pub request: ReadRequest,

    #[serde(default)]
    pub value: MetricValue,

    #[serde(default, rename = "timestamp")]
    pub timestamp_millis: i64,

    #[serde(rename = "status")]
    pub status_code: i32,

    /// Agent-side error message for failed reads
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ReadResult {
    #[inline]
    pub fn is_ok(&self) -> bool {
        self.status_code == STATUS_OK
    }
}

// ----------------------------------------------------------------------------
// 3.3 Value Model
// ----------------------------------------------------------------------------

/// A single scalar reading.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Text(String),
    /// JSON numbers that are exact 64-bit integers
    Integer(i64),
    /// Exact integers above `i64::MAX`
    Unsigned(u64),
    Number(f64),
}

impl Scalar {
    /// Classifies a JSON value as a scalar, if it is one.
    pub fn from_json(value: &JsonValue) -> Option<Self> {
        match value {
            JsonValue::String(text) => Some(Scalar::Text(text.clone())),
            JsonValue::Number(number) => number
                .as_i64()
                .map(Scalar::Integer)
                .or_else(|| number.as_u64().map(Scalar::Unsigned))
                .or_else(|| number.as_f64().map(Scalar::Number)),
            _ => None,
        }
    }

    fn to_json(&self) -> JsonValue {
        match self {
            Scalar::Text(text) => JsonValue::String(text.clone()),
            Scalar::Integer(value) => JsonValue::from(*value),
            Scalar::Unsigned(value) => JsonValue::from(*value),
            Scalar::Number(value) => JsonNumber::from_f64(*value)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
        }
    }
}

impl From<&str> for Scalar {
    fn from(text: &str) -> Self {
        Scalar::Text(text.to_owned())
    }
}

impl From<i64> for Scalar {
    fn from(value: i64) -> Self {
        Scalar::Integer(value)
    }
}

impl From<f64> for Scalar {
    fn from(value: f64) -> Self {
        Scalar::Number(value)
    }
}

/// An attribute value, classified once at decode time.
///
/// `Composite` keeps its members sorted by key so that encoding is
/// deterministic. Anything outside scalar/composite-of-scalars is kept verbatim
/// in `Unsupported` and rejected by the value encoder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "JsonValue", into = "JsonValue")]
pub enum MetricValue {
    Scalar(Scalar),
    Composite(BTreeMap<String, Scalar>),
    Unsupported(JsonValue),
}

impl Default for MetricValue {
    fn default() -> Self {
        MetricValue::Unsupported(JsonValue::Null)
    }
}

impl From<JsonValue> for MetricValue {
    fn from(value: JsonValue) -> Self {
        if let Some(scalar) = Scalar::from_json(&value) {
            return MetricValue::Scalar(scalar);
        }
        if let JsonValue::Object(members) = &value {
            if !members.is_empty() {
                let fields: Option<BTreeMap<String, Scalar>> = members
                    .iter()
                    .map(|(key, member)| Scalar::from_json(member).map(|s| (key.clone(), s)))
                    .collect();
                if let Some(fields) = fields {
                    return MetricValue::Composite(fields);
                }
            }
        }
        MetricValue::Unsupported(value)
    }
}

impl From<MetricValue> for JsonValue {
    fn from(value: MetricValue) -> Self {
        match value {
            MetricValue::Scalar(scalar) => scalar.to_json(),
            MetricValue::Composite(fields) => JsonValue::Object(
                fields
                    .into_iter()
                    .map(|(key, scalar)| (key, scalar.to_json()))
                    .collect(),
            ),
            MetricValue::Unsupported(raw) => raw,
        }
    }
}

impl From<Scalar> for MetricValue {
    fn from(scalar: Scalar) -> Self {
        MetricValue::Scalar(scalar)
    }
}

/// Short name of a JSON value's shape, for diagnostics.
fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(members) if members.is_empty() => "empty object",
        JsonValue::Object(_) => "object with non-scalar members",
    }
}

// ----------------------------------------------------------------------------
// 3.4 Tags
// ----------------------------------------------------------------------------

/// A key/value pair attached to a record for grouping.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Tag {
    pub key: CompactString,
    pub value: CompactString,
}

impl Tag {
    #[inline]
    pub fn new<K, V>(key: K, value: V) -> Self
    where
        K: Into<CompactString>,
        V: Into<CompactString>,
    {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

impl Display for Tag {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

impl<K, V> From<(K, V)> for Tag
where
    K: Into<CompactString>,
    V: Into<CompactString>,
{
    fn from((key, value): (K, V)) -> Self {
        Self::new(key, value)
    }
}

/// Ordered tags of one record. MBean names rarely carry more than a handful
/// of key properties, so small sets stay on the stack.
pub type TagSet = SmallVec<[Tag; 8]>;

// ----------------------------------------------------------------------------
// 3.5 Cycle Outcomes
// ----------------------------------------------------------------------------

/// What the sink did with a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The backend accepted the batch
    Written { status: u16, bytes: usize, records: usize },
    /// Nothing to send; no request was made
    Skipped,
}

impl Display for WriteOutcome {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            WriteOutcome::Written { status, bytes, records } => {
                write!(f, "written(status={}, records={}, bytes={})", status, records, bytes)
            }
            WriteOutcome::Skipped => write!(f, "skipped(empty batch)"),
        }
    }
}

/// Summary of one completed cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    /// Scheduler tick that started the cycle
    pub tick: DateTime<Utc>,
    /// Read requests issued
    pub requested: usize,
    /// Read results returned by the agent
    pub received: usize,
    /// Records in the write payload
    pub encoded: usize,
    /// Results dropped for a non-200 status
    pub non_ok: usize,
    /// Results dropped for a per-result fault
    pub skipped: usize,
    pub outcome: WriteOutcome,
}

impl Display for CycleReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "tick={} requested={} received={} encoded={} non_ok={} skipped={} outcome={}",
            self.tick.to_rfc3339(),
            self.requested,
            self.received,
            self.encoded,
            self.non_ok,
            self.skipped,
            self.outcome
        )
    }
}

// ============================================================================
// SECTION 4: ERROR HANDLING FRAMEWORK
// ============================================================================
// Per-result faults (malformed identifier, unsupported value) skip one record.
// Per-cycle faults (collection, write, deadline) abort one cycle. Only
// configuration faults are fatal.
// ============================================================================

// ----------------------------------------------------------------------------
// 4.1 Top-Level Error
// ----------------------------------------------------------------------------

/// The main error type for the relay.
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Cycle error: {0}")]
    Cycle(#[from] CycleError),

    #[error("Record error: {0}")]
    Record(#[from] RecordError),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelayError {
    /// Check if the relay keeps running after this error
    pub fn is_recoverable(&self) -> bool {
        match self {
            RelayError::Config(_) => false,
            RelayError::Cycle(_) => true,
            RelayError::Record(_) => true,
            RelayError::Http(_) => false,
            RelayError::Internal(_) => false,
        }
    }

    /// Get the error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            RelayError::Config(_) => "config",
            RelayError::Cycle(e) => e.category(),
            RelayError::Record(e) => e.category(),
            RelayError::Http(_) => "http_client",
            RelayError::Internal(_) => "internal",
        }
    }
}

pub type RelayResult<T> = Result<T, RelayError>;

// ----------------------------------------------------------------------------
// 4.2 Configuration Errors
// ----------------------------------------------------------------------------

/// Errors related to configuration loading and validation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    Parse { message: String },

    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// 4.3 Per-Result Errors
// ----------------------------------------------------------------------------

/// An MBean name that does not have the `domain:key=value,...` shape.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("malformed metric identifier '{identifier}': {reason}")]
pub struct MalformedIdentifierError {
    pub identifier: String,
    pub reason: &'static str,
}

impl MalformedIdentifierError {
    fn new(identifier: &str, reason: &'static str) -> Self {
        Self {
            identifier: identifier.to_owned(),
            reason,
        }
    }
}

/// A value outside {string, number, object of strings/numbers}.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unsupported value type: {kind}")]
pub struct UnsupportedValueTypeError {
    pub kind: &'static str,
}

/// A fault that drops exactly one result from the batch.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error(transparent)]
    MalformedIdentifier(#[from] MalformedIdentifierError),

    #[error(transparent)]
    UnsupportedValue(#[from] UnsupportedValueTypeError),
}

impl RecordError {
    pub fn category(&self) -> &'static str {
        match self {
            RecordError::MalformedIdentifier(_) => "malformed_identifier",
            RecordError::UnsupportedValue(_) => "unsupported_value",
        }
    }
}

// ----------------------------------------------------------------------------
// 4.4 Per-Cycle Errors
// ----------------------------------------------------------------------------

/// The bulk read failed; the cycle writes nothing.
#[derive(Error, Debug)]
pub enum CollectionError {
    #[error("read request to '{endpoint}' failed: {source}")]
    Transport {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("read endpoint '{endpoint}' returned HTTP {status}: {body}")]
    Status { endpoint: String, status: u16, body: String },

    #[error("failed to decode read response from '{endpoint}': {source}")]
    Decode {
        endpoint: String,
        #[source]
        source: serde_json::Error,
    },
}

/// The batch could not be delivered and is dropped.
#[derive(Error, Debug)]
pub enum WriteError {
    #[error("write to '{endpoint}' failed: {source}")]
    Transport {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("write endpoint '{endpoint}' rejected batch with HTTP {status}: {body}")]
    Rejected { endpoint: String, status: u16, body: String },
}

/// A fault that aborts one cycle.
#[derive(Error, Debug)]
pub enum CycleError {
    #[error(transparent)]
    Collection(#[from] CollectionError),

    #[error(transparent)]
    Write(#[from] WriteError),

    #[error("cycle exceeded its deadline of {}", format_limit(.0))]
    TimedOut(Duration),
}

impl CycleError {
    pub fn category(&self) -> &'static str {
        match self {
            CycleError::Collection(_) => "collection",
            CycleError::Write(_) => "write",
            CycleError::TimedOut(_) => "timeout",
        }
    }
}

fn format_limit(limit: &Duration) -> humantime::FormattedDuration {
    humantime::format_duration(*limit)
}

/// Trims a response body for log output without splitting a UTF-8 character.
fn diagnostic_body(body: &str) -> String {
    if body.len() <= MAX_DIAGNOSTIC_BODY_BYTES {
        return body.trim_end().to_owned();
    }
    let mut end = MAX_DIAGNOSTIC_BODY_BYTES;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &body[..end])
}

// ============================================================================
// SECTION 5: CONFIGURATION SYSTEM
// ============================================================================
// JSON file + JOLOKIA_RELAY_* environment overrides, validated once at startup.
// The resulting value is immutable and handed to the relay and the scheduler.
// ============================================================================

// ----------------------------------------------------------------------------
// 5.1 Main Configuration Structure
// ----------------------------------------------------------------------------

/// Root configuration for the relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayConfig {
    /// MBeans to poll
    #[serde(default)]
    pub mbeans: Vec<MetricSpec>,

    /// Jolokia bulk read endpoint
    pub jolokia: String,

    /// InfluxDB line-protocol write endpoint
    pub influxdb: String,

    /// Time between collection cycles
    #[serde(default = "default_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Timeout applied to every HTTP request
    #[serde(default = "default_http_timeout", with = "humantime_serde")]
    pub http_timeout: Duration,

    /// Skip a tick while the previous cycle is still running
    #[serde(default)]
    pub skip_if_busy: bool,

    /// Deadline for a whole cycle (read + write)
    #[serde(default, with = "humantime_serde::option")]
    pub cycle_timeout: Option<Duration>,

    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_interval() -> Duration {
    DEFAULT_INTERVAL
}

fn default_http_timeout() -> Duration {
    DEFAULT_HTTP_TIMEOUT
}

impl RelayConfig {
    /// Load configuration from file with environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        let figment = Figment::new()
            .merge(Json::file(path))
            .merge(Env::prefixed(CONFIG_ENV_PREFIX).split("__"));

        let config: Self = figment.extract().map_err(|e| ConfigError::Parse {
            message: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Load from string (for testing)
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json).map_err(|e| ConfigError::Parse {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_endpoint("jolokia", &self.jolokia)?;
        validate_endpoint("influxdb", &self.influxdb)?;

        if self.interval < MIN_INTERVAL {
            return Err(ConfigError::invalid_value(
                "interval",
                format!(
                    "interval must be at least {}",
                    humantime::format_duration(MIN_INTERVAL)
                ),
            ));
        }

        if self.http_timeout.is_zero() {
            return Err(ConfigError::invalid_value("http_timeout", "timeout must be non-zero"));
        }

        if let Some(limit) = self.cycle_timeout {
            if limit.is_zero() {
                return Err(ConfigError::invalid_value("cycle_timeout", "timeout must be non-zero"));
            }
        }

        for (index, spec) in self.mbeans.iter().enumerate() {
            if spec.identifier.trim().is_empty() {
                return Err(ConfigError::invalid_value(
                    format!("mbeans[{}].name", index),
                    "MBean name must not be empty",
                ));
            }
        }

        Ok(())
    }

    /// The request batch every cycle issues
    pub fn read_requests(&self) -> Vec<ReadRequest> {
        build_read_requests(&self.mbeans)
    }

    /// MBeans that are configured but poll nothing
    pub fn idle_mbeans(&self) -> impl Iterator<Item = &MetricSpec> {
        self.mbeans.iter().filter(|spec| spec.attributes.is_empty())
    }
}

fn validate_endpoint(field: &str, value: &str) -> Result<(), ConfigError> {
    let url = Url::parse(value)
        .map_err(|e| ConfigError::invalid_value(field, format!("'{}' is not a valid URL: {}", value, e)))?;
    match url.scheme() {
        "http" | "https" => Ok(()),
        scheme => Err(ConfigError::invalid_value(
            field,
            format!("unsupported URL scheme '{}', expected http or https", scheme),
        )),
    }
}

// ----------------------------------------------------------------------------
// 5.2 Logging Configuration
// ----------------------------------------------------------------------------

/// Output format of the log subscriber
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

impl Display for LogFormat {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            LogFormat::Pretty => write!(f, "pretty"),
            LogFormat::Compact => write!(f, "compact"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,

    /// ANSI colors for the pretty/compact formats
    #[serde(default = "default_true")]
    pub colors: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            colors: true,
        }
    }
}

fn default_true() -> bool {
    true
}

// ============================================================================
// SECTION 6: LOGGING & TRACING INFRASTRUCTURE
// ============================================================================

/// Whether a `DEBUG` environment value switches verbose logging on.
pub fn is_debug_toggle(value: Option<&str>) -> bool {
    value == Some(DEBUG_ENV_ON)
}

/// Reads the verbose toggle from the process environment.
pub fn debug_env_enabled() -> bool {
    is_debug_toggle(env::var(DEBUG_ENV_VAR).ok().as_deref())
}

/// Initialize the logging system.
///
/// Verbose mode lowers the default level to `debug`, which is where request
/// batches, decoded responses and write payloads are logged. `RUST_LOG`
/// still takes precedence when set.
pub fn init_logging(config: &LoggingConfig, verbose: bool) -> RelayResult<()> {
    let level_filter = if verbose { LevelFilter::DEBUG } else { LevelFilter::INFO };

    let env_filter = EnvFilter::builder()
        .with_default_directive(level_filter.into())
        .from_env_lossy();

    let registry = tracing_subscriber::registry().with(env_filter);

    let installed = match config.format {
        LogFormat::Json => registry
            .with(
                fmt_layer::layer()
                    .json()
                    .with_target(true)
                    .with_thread_names(true),
            )
            .try_init(),
        LogFormat::Compact => registry
            .with(
                fmt_layer::layer()
                    .compact()
                    .with_ansi(config.colors)
                    .with_target(true),
            )
            .try_init(),
        LogFormat::Pretty => registry
            .with(
                fmt_layer::layer()
                    .pretty()
                    .with_ansi(config.colors)
                    .with_target(true)
                    .with_thread_names(true),
            )
            .try_init(),
    };

    installed.map_err(|e| RelayError::Internal(format!("Failed to set logger: {}", e)))?;

    info!(
        target: "jolokia_relay::init",
        format = %config.format,
        verbose,
        "Logging initialized"
    );

    Ok(())
}

// ============================================================================
// SECTION 7: TAG EXTRACTOR
// ============================================================================

/// Derives the tag set of an MBean name.
///
/// `java.lang:type=GarbageCollector,name=G1` yields
/// `name=java.lang, type=GarbageCollector, name=G1` in that order, minus any key
/// listed in `drop_tags`. The name is split on the first `:` only, so property
/// values may contain colons.
pub fn extract_tags(
    identifier: &str,
    drop_tags: &BTreeSet<String>,
) -> Result<TagSet, MalformedIdentifierError> {
    let (domain, properties) = identifier
        .split_once(IDENTIFIER_SEPARATOR)
        .ok_or_else(|| MalformedIdentifierError::new(identifier, "missing ':' between domain and properties"))?;

    if domain.is_empty() {
        return Err(MalformedIdentifierError::new(identifier, "empty domain"));
    }

    let mut tags = TagSet::new();
    tags.push(Tag::new(DOMAIN_TAG, domain));

    for property in properties.split(',').filter(|p| !p.is_empty()) {
        let (key, value) = property
            .split_once('=')
            .ok_or_else(|| MalformedIdentifierError::new(identifier, "key property without '='"))?;
        tags.push(Tag::new(key, value));
    }

    tags.retain(|tag| !drop_tags.contains(tag.key.as_str()));
    Ok(tags)
}

// ============================================================================
// SECTION 8: VALUE ENCODER
// ============================================================================

/// Renders a value as line-protocol field text.
///
/// Scalars become a single `value=<v>` field; composites become one
/// `<key>=<v>` field per member in key order. Strings are emitted raw.
pub fn encode_value(value: &MetricValue) -> Result<String, UnsupportedValueTypeError> {
    let mut out = String::new();
    write_value(value, &mut out)?;
    Ok(out)
}

fn write_value(value: &MetricValue, out: &mut String) -> Result<(), UnsupportedValueTypeError> {
    match value {
        MetricValue::Scalar(scalar) => {
            out.push_str(SCALAR_FIELD);
            out.push('=');
            write_scalar(scalar, out);
        }
        MetricValue::Composite(fields) if fields.is_empty() => {
            return Err(UnsupportedValueTypeError { kind: "empty object" });
        }
        MetricValue::Composite(fields) => {
            for (index, (key, scalar)) in fields.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                out.push_str(key);
                out.push('=');
                write_scalar(scalar, out);
            }
        }
        MetricValue::Unsupported(raw) => {
            return Err(UnsupportedValueTypeError { kind: json_kind(raw) });
        }
    }
    Ok(())
}

/// Text is copied verbatim. A string value containing a newline therefore
/// splits its record across two payload lines; record counts come from the
/// encoder, never from the payload.
fn write_scalar(scalar: &Scalar, out: &mut String) {
    match scalar {
        Scalar::Text(text) => out.push_str(text),
        Scalar::Integer(value) => out.push_str(&value.to_string()),
        Scalar::Unsigned(value) => out.push_str(&value.to_string()),
        Scalar::Number(value) => out.push_str(&format_number(*value)),
    }
}

/// Shortest decimal text that parses back to the same `f64`.
///
/// `Display` for `f64` never switches to exponent notation and drops a
/// trailing `.0`, so `98765.0` renders as `98765`.
pub fn format_number(value: f64) -> String {
    value.to_string()
}

// ============================================================================
// SECTION 9: LINE ENCODER
// ============================================================================

/// Composes one line-protocol record:
/// `<attribute>[,<tag>=<value>...] <fields> <timestamp>\n`.
pub fn encode_record(result: &ReadResult, tags: &TagSet, field_text: &str) -> String {
    let attribute = &result.request.attribute;
    let tag_len: usize = tags.iter().map(|t| t.key.len() + t.value.len() + 2).sum();
    let mut line = String::with_capacity(attribute.len() + tag_len + field_text.len() + 24);

    line.push_str(attribute);
    for tag in tags {
        line.push(',');
        line.push_str(&tag.key);
        line.push('=');
        line.push_str(&tag.value);
    }
    line.push(' ');
    line.push_str(field_text);
    line.push(' ');
    line.push_str(&result.timestamp_millis.to_string());
    line.push('\n');
    line
}

/// Tags, fields and line for a single result.
pub fn encode_result(result: &ReadResult, drop_tags: &BTreeSet<String>) -> Result<String, RecordError> {
    let tags = extract_tags(&result.request.identifier, drop_tags)?;
    let fields = encode_value(&result.value)?;
    Ok(encode_record(result, &tags, &fields))
}

/// A result that was dropped from the batch, and why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedRecord {
    pub request: ReadRequest,
    pub error: RecordError,
}

/// The write payload of one cycle plus per-result bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncodedBatch {
    pub payload: String,
    pub records: usize,
    pub non_ok: usize,
    pub skipped: Vec<SkippedRecord>,
}

impl EncodedBatch {
    pub fn is_empty(&self) -> bool {
        self.records == 0
    }
}

static NO_DROP_TAGS: BTreeSet<String> = BTreeSet::new();

/// Drop-tag sets keyed by MBean name. Specs naming the same MBean twice
/// contribute the union of their sets.
#[derive(Debug)]
struct DropTagIndex<'a> {
    by_identifier: HashMap<&'a str, BTreeSet<String>>,
}

impl<'a> DropTagIndex<'a> {
    fn new(specs: &'a [MetricSpec]) -> Self {
        let mut by_identifier: HashMap<&'a str, BTreeSet<String>> = HashMap::new();
        for spec in specs {
            by_identifier
                .entry(spec.identifier.as_str())
                .or_default()
                .extend(spec.drop_tags.iter().cloned());
        }
        Self { by_identifier }
    }

    fn get(&self, identifier: &str) -> &BTreeSet<String> {
        self.by_identifier.get(identifier).unwrap_or(&NO_DROP_TAGS)
    }
}

/// Encodes a cycle's results, in the order given, into one write payload.
///
/// Non-200 results are counted and left out. Per-result faults are collected in
/// `skipped` and never stop the rest of the batch.
pub fn encode_batch(results: &[ReadResult], specs: &[MetricSpec]) -> EncodedBatch {
    let drop_tags = DropTagIndex::new(specs);
    let mut batch = EncodedBatch::default();

    for result in results {
        if !result.is_ok() {
            batch.non_ok += 1;
            debug!(
                target: "jolokia_relay::cycle",
                request = %result.request,
                status = result.status_code,
                error = result.error.as_deref().unwrap_or(""),
                "Read failed on agent, result dropped"
            );
            continue;
        }

        match encode_result(result, drop_tags.get(&result.request.identifier)) {
            Ok(line) => {
                batch.payload.push_str(&line);
                batch.records += 1;
            }
            Err(error) => batch.skipped.push(SkippedRecord {
                request: result.request.clone(),
                error,
            }),
        }
    }

    batch
}

// ============================================================================
// SECTION 10: COLLECTOR CLIENT
// ============================================================================

/// Source of read results for one cycle.
#[async_trait]
pub trait MetricSource: Debug + Send + Sync {
    /// Returns the name of this source.
    fn name(&self) -> &str;

    /// Reads every (spec, attribute) pair and returns the results in request order.
    async fn collect(&self, specs: &[MetricSpec]) -> Result<Vec<ReadResult>, CollectionError>;
}

/// Builds the HTTP client shared by the collector and the sink.
pub fn build_http_client(request_timeout: Duration) -> RelayResult<HttpClient> {
    let client = HttpClient::builder()
        .timeout(request_timeout)
        .pool_max_idle_per_host(2)
        .user_agent(concat!("jolokia-relay/", env!("CARGO_PKG_VERSION")))
        .build()?;
    Ok(client)
}

/// Reorders results to match the request batch.
///
/// The agent's echoed request is matched against the issued requests; duplicates
/// are assigned in order. Results that echo a request never issued keep their
/// response order after all matched results.
pub fn order_by_requests(requests: &[ReadRequest], results: Vec<ReadResult>) -> Vec<ReadResult> {
    let mut slots: HashMap<&ReadRequest, VecDeque<usize>> = HashMap::with_capacity(requests.len());
    for (position, request) in requests.iter().enumerate() {
        slots.entry(request).or_default().push_back(position);
    }

    let mut ranked: Vec<(usize, ReadResult)> = results
        .into_iter()
        .enumerate()
        .map(|(arrival, result)| {
            let rank = slots
                .get_mut(&result.request)
                .and_then(VecDeque::pop_front)
                .unwrap_or(requests.len() + arrival);
            (rank, result)
        })
        .collect();

    ranked.sort_by_key(|(rank, _)| *rank);
    ranked.into_iter().map(|(_, result)| result).collect()
}

/// Bulk reader for a Jolokia agent.
#[derive(Debug, Clone)]
pub struct JolokiaClient {
    endpoint: String,
    client: HttpClient,
}

impl JolokiaClient {
    pub fn new(endpoint: impl Into<String>, client: HttpClient) -> Self {
        Self {
            endpoint: endpoint.into(),
            client,
        }
    }

}

#[async_trait]
impl MetricSource for JolokiaClient {
    fn name(&self) -> &str {
        "jolokia"
    }

    async fn collect(&self, specs: &[MetricSpec]) -> Result<Vec<ReadResult>, CollectionError> {
        let requests = build_read_requests(specs);
        if requests.is_empty() {
            trace!(target: "jolokia_relay::collector", "No attributes configured, nothing to read");
            return Ok(Vec::new());
        }

        debug!(
            target: "jolokia_relay::collector",
            endpoint = %self.endpoint,
            requests = requests.len(),
            batch = ?requests,
            "Sending bulk read"
        );

        let transport = |source| CollectionError::Transport {
            endpoint: self.endpoint.clone(),
            source,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .json(&requests)
            .send()
            .await
            .map_err(transport)?;

        let status = response.status();
        let body = response.text().await.map_err(transport)?;

        if !status.is_success() {
            return Err(CollectionError::Status {
                endpoint: self.endpoint.clone(),
                status: status.as_u16(),
                body: diagnostic_body(&body),
            });
        }

        let results: Vec<ReadResult> = serde_json::from_str(&body).map_err(|source| CollectionError::Decode {
            endpoint: self.endpoint.clone(),
            source,
        })?;

        debug!(
            target: "jolokia_relay::collector",
            results = results.len(),
            response = %body,
            "Bulk read decoded"
        );

        Ok(order_by_requests(&requests, results))
    }
}

// ============================================================================
// SECTION 11: SINK WRITER
// ============================================================================

/// Destination of a cycle's line-protocol payload.
///
/// A failed write is final: the relay keeps no buffer and never retries.
/// Implementations that want durability wrap this seam.
#[async_trait]
pub trait MetricSink: Debug + Send + Sync {
    /// Returns the name of this sink.
    fn name(&self) -> &str;

    /// Writes the full batch in one request.
    async fn write(&self, batch: &EncodedBatch) -> Result<WriteOutcome, WriteError>;
}

/// Line-protocol writer for an InfluxDB write endpoint.
#[derive(Debug, Clone)]
pub struct InfluxWriter {
    endpoint: String,
    client: HttpClient,
}

impl InfluxWriter {
    pub fn new(endpoint: impl Into<String>, client: HttpClient) -> Self {
        Self {
            endpoint: endpoint.into(),
            client,
        }
    }

}

#[async_trait]
impl MetricSink for InfluxWriter {
    fn name(&self) -> &str {
        "influxdb"
    }

    async fn write(&self, batch: &EncodedBatch) -> Result<WriteOutcome, WriteError> {
        if batch.payload.is_empty() {
            debug!(target: "jolokia_relay::sink", "Empty batch, write skipped");
            return Ok(WriteOutcome::Skipped);
        }

        let records = batch.records;

        let response = self
            .client
            .post(&self.endpoint)
            .header(CONTENT_TYPE, LINE_PROTOCOL_CONTENT_TYPE)
            .body(batch.payload.clone())
            .send()
            .await
            .map_err(|source| WriteError::Transport {
                endpoint: self.endpoint.clone(),
                source,
            })?;

        let status = response.status();
        if status.is_success() {
            trace!(
                target: "jolokia_relay::sink",
                status = status.as_u16(),
                records,
                "Batch accepted"
            );
            return Ok(WriteOutcome::Written {
                status: status.as_u16(),
                bytes: batch.payload.len(),
                records,
            });
        }

        // The body is diagnostics only; a failure to read it must not mask the status.
        let body = response.text().await.unwrap_or_default();
        Err(WriteError::Rejected {
            endpoint: self.endpoint.clone(),
            status: status.as_u16(),
            body: diagnostic_body(&body),
        })
    }
}

// ============================================================================
// SECTION 12: CYCLE PIPELINE
// ============================================================================

// ----------------------------------------------------------------------------
// 12.1 Relay Statistics
// ----------------------------------------------------------------------------

/// Process-lifetime counters, shared by all concurrently running cycles.
#[derive(Debug, Default)]
pub struct RelayStats {
    cycles_started: AtomicU64,
    cycles_succeeded: AtomicU64,
    cycles_failed: AtomicU64,
    records_written: AtomicU64,
    results_skipped: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub cycles_started: u64,
    pub cycles_succeeded: u64,
    pub cycles_failed: u64,
    pub records_written: u64,
    pub results_skipped: u64,
}

impl RelayStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn record_start(&self) {
        self.cycles_started.fetch_add(1, AtomicOrdering::Relaxed);
    }

    fn record_success(&self, report: &CycleReport) {
        self.cycles_succeeded.fetch_add(1, AtomicOrdering::Relaxed);
        if let WriteOutcome::Written { records, .. } = report.outcome {
            self.records_written.fetch_add(records as u64, AtomicOrdering::Relaxed);
        }
        self.results_skipped
            .fetch_add(report.skipped as u64, AtomicOrdering::Relaxed);
    }

    fn record_failure(&self) {
        self.cycles_failed.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            cycles_started: self.cycles_started.load(AtomicOrdering::Relaxed),
            cycles_succeeded: self.cycles_succeeded.load(AtomicOrdering::Relaxed),
            cycles_failed: self.cycles_failed.load(AtomicOrdering::Relaxed),
            records_written: self.records_written.load(AtomicOrdering::Relaxed),
            results_skipped: self.results_skipped.load(AtomicOrdering::Relaxed),
        }
    }
}

// ----------------------------------------------------------------------------
// 12.2 Relay
// ----------------------------------------------------------------------------

/// Collect → encode → write, once per call to [`Relay::run_cycle`].
#[derive(Debug)]
pub struct Relay {
    source: Arc<dyn MetricSource>,
    sink: Arc<dyn MetricSink>,
    specs: Arc<[MetricSpec]>,
    stats: RelayStats,
    cycle_timeout: Option<Duration>,
}

impl Relay {
    pub fn new(source: Arc<dyn MetricSource>, sink: Arc<dyn MetricSink>, specs: Vec<MetricSpec>) -> Self {
        Self {
            source,
            sink,
            specs: specs.into(),
            stats: RelayStats::new(),
            cycle_timeout: None,
        }
    }

    /// Wires a Jolokia client and an InfluxDB writer from configuration.
    pub fn from_config(config: &RelayConfig) -> RelayResult<Self> {
        let client = build_http_client(config.http_timeout)?;
        let source = Arc::new(JolokiaClient::new(config.jolokia.as_str(), client.clone()));
        let sink = Arc::new(InfluxWriter::new(config.influxdb.as_str(), client));
        Ok(Self::new(source, sink, config.mbeans.clone()).with_cycle_timeout(config.cycle_timeout))
    }

    pub fn with_cycle_timeout(mut self, cycle_timeout: Option<Duration>) -> Self {
        self.cycle_timeout = cycle_timeout;
        self
    }

    pub fn stats(&self) -> &RelayStats {
        &self.stats
    }

    /// Runs one full cycle and logs its outcome.
    pub async fn run_cycle(&self, tick: DateTime<Utc>) -> Result<CycleReport, CycleError> {
        info!(
            target: "jolokia_relay::cycle",
            tick = %tick,
            source = self.source.name(),
            sink = self.sink.name(),
            "Collection cycle started"
        );
        self.stats.record_start();
        let started = Instant::now();

        let result = match self.cycle_timeout {
            Some(limit) => timeout(limit, self.execute(tick))
                .await
                .unwrap_or_else(|_| Err(CycleError::TimedOut(limit))),
            None => self.execute(tick).await,
        };

        match &result {
            Ok(report) => {
                self.stats.record_success(report);
                debug!(
                    target: "jolokia_relay::cycle",
                    report = %report,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Collection cycle complete"
                );
            }
            Err(e) => {
                self.stats.record_failure();
                error!(
                    target: "jolokia_relay::cycle",
                    tick = %tick,
                    category = e.category(),
                    error = %e,
                    "Collection cycle aborted"
                );
            }
        }

        debug!(target: "jolokia_relay::cycle", stats = ?self.stats.snapshot(), "Relay statistics");
        result
    }

    async fn execute(&self, tick: DateTime<Utc>) -> Result<CycleReport, CycleError> {
        let requested: usize = self.specs.iter().map(|spec| spec.attributes.len()).sum();
        let results = self.source.collect(&self.specs).await?;

        let batch = encode_batch(&results, &self.specs);
        for skipped in &batch.skipped {
            warn!(
                target: "jolokia_relay::cycle",
                mbean = %skipped.request.identifier,
                attribute = %skipped.request.attribute,
                category = skipped.error.category(),
                error = %skipped.error,
                "Result skipped"
            );
        }

        debug!(
            target: "jolokia_relay::cycle",
            records = batch.records,
            payload = %batch.payload,
            "Writing batch"
        );

        let outcome = self.sink.write(&batch).await?;

        Ok(CycleReport {
            tick,
            requested,
            received: results.len(),
            encoded: batch.records,
            non_ok: batch.non_ok,
            skipped: batch.skipped.len(),
            outcome,
        })
    }
}

// ============================================================================
// SECTION 13: SCHEDULER
// ============================================================================

/// Fires a cycle every `interval`, without waiting for earlier cycles.
///
/// Ticks the timer could not deliver on time are dropped, not queued. With
/// `skip_if_busy` a tick that finds the previous cycle still running is
/// dropped as well, which bounds the relay to one cycle in flight.
#[derive(Debug, Clone)]
pub struct Scheduler {
    interval: Duration,
    skip_if_busy: bool,
}

impl Scheduler {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            skip_if_busy: false,
        }
    }

    pub fn from_config(config: &RelayConfig) -> Self {
        Self::new(config.interval).skip_if_busy(config.skip_if_busy)
    }

    pub fn skip_if_busy(mut self, skip_if_busy: bool) -> Self {
        self.skip_if_busy = skip_if_busy;
        self
    }

    /// Dispatches `cycle` on every tick until `shutdown` resolves.
    ///
    /// Each cycle runs as its own task. Returns the number of cycles dispatched.
    /// In-flight cycles are not awaited.
    pub async fn run_until<F, Fut, S>(&self, mut cycle: F, shutdown: S) -> u64
    where
        F: FnMut(DateTime<Utc>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
        S: Future<Output = ()>,
    {
        let busy = Arc::new(AtomicBool::new(false));
        let mut ticker = interval_at(TokioInstant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        info!(
            target: "jolokia_relay::scheduler",
            interval = %humantime::format_duration(self.interval),
            skip_if_busy = self.skip_if_busy,
            "Scheduler started"
        );

        let mut dispatched = 0u64;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.skip_if_busy && busy.swap(true, AtomicOrdering::AcqRel) {
                        warn!(target: "jolokia_relay::scheduler", "Previous cycle still running, tick skipped");
                        continue;
                    }

                    let guard = self.skip_if_busy.then(|| BusyGuard(busy.clone()));
                    let task = cycle(Utc::now());
                    tokio::spawn(async move {
                        let _guard = guard;
                        task.await;
                    });
                    dispatched += 1;
                }
                _ = &mut shutdown => {
                    info!(target: "jolokia_relay::scheduler", dispatched, "Scheduler stopped");
                    break;
                }
            }
        }

        dispatched
    }
}

/// Clears the busy flag when a cycle task finishes, even if it panicked.
#[derive(Debug)]
struct BusyGuard(Arc<AtomicBool>);

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.store(false, AtomicOrdering::Release);
    }
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(target: "jolokia_relay::scheduler", error = %e, "Cannot install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = signal::ctrl_c() => info!(target: "jolokia_relay::scheduler", "Received SIGINT"),
        _ = terminate => info!(target: "jolokia_relay::scheduler", "Received SIGTERM"),
    }
}

// ============================================================================
// SECTION 14: CLI & COMMAND LINE INTERFACE
// ============================================================================

/// Jolokia Relay CLI
#[derive(Parser, Debug)]
#[command(
    name = "jolokia-relay",
    author = "AIOps Team",
    version,
    about = "Relays JMX attributes from a Jolokia agent to an InfluxDB write endpoint"
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH, env = "JOLOKIA_RELAY_CONFIG")]
    pub config: PathBuf,

    /// Verbose diagnostics (same as DEBUG=y)
    #[arg(short, long)]
    pub debug: bool,

    /// Override the configured tick interval (e.g. "5s")
    #[arg(short, long, value_parser = humantime::parse_duration)]
    pub interval: Option<Duration>,

    /// Subcommand to run
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands
#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Commands {
    /// Poll on every tick until interrupted (default)
    Run,
    /// Run a single cycle and print its report
    Once,
    /// Validate the configuration file and show the request batch
    Validate,
}

/// Handle the validate subcommand
fn handle_validate(config_path: &Path, config: &RelayConfig) {
    println!("✅ Configuration is valid: {}", config_path.display());
    println!();
    println!("  • Jolokia endpoint:  {}", config.jolokia);
    println!("  • InfluxDB endpoint: {}", config.influxdb);
    println!("  • Interval:          {}", humantime::format_duration(config.interval));
    println!("  • HTTP timeout:      {}", humantime::format_duration(config.http_timeout));
    match config.cycle_timeout {
        Some(limit) => println!("  • Cycle timeout:     {}", humantime::format_duration(limit)),
        None => println!("  • Cycle timeout:     none"),
    }
    println!("  • Skip if busy:      {}", config.skip_if_busy);
    println!("  • MBeans:            {}", config.mbeans.len());

    let requests = config.read_requests();
    println!();
    println!("Read batch ({} requests):", requests.len());
    for request in &requests {
        println!("  - {}", request);
    }
    for spec in config.idle_mbeans() {
        println!("  ! {} has no attributes", spec.identifier);
    }
}

// ============================================================================
// SECTION 15: MAIN ENTRY POINT
// ============================================================================

/// Main entry point for the relay
#[tokio::main]
async fn main() -> AnyhowResult<()> {
    let cli = Cli::parse();

    let mut config = RelayConfig::load(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;
    if let Some(interval) = cli.interval {
        config.interval = interval;
        config.validate()?;
    }

    let command = cli.command.unwrap_or(Commands::Run);
    if command == Commands::Validate {
        handle_validate(&cli.config, &config);
        return Ok(());
    }

    init_logging(&config.logging, cli.debug || debug_env_enabled())?;

    info!(
        target: "jolokia_relay::init",
        version = RELAY_VERSION,
        jolokia = %config.jolokia,
        influxdb = %config.influxdb,
        mbeans = config.mbeans.len(),
        "Starting {}",
        RELAY_NAME
    );
    for spec in config.idle_mbeans() {
        warn!(target: "jolokia_relay::config", mbean = %spec.identifier, "MBean has no attributes to read");
    }

    let relay = Relay::from_config(&config)?;

    match command {
        Commands::Once => {
            let report = relay.run_cycle(Utc::now()).await?;
            println!("{}", report);
        }
        _ => {
            let relay = Arc::new(relay);
            let scheduler = Scheduler::from_config(&config);
            scheduler
                .run_until(
                    move |tick| {
                        let relay = Arc::clone(&relay);
                        async move {
                            // Outcome is already logged by the cycle itself.
                            let _ = relay.run_cycle(tick).await;
                        }
                    },
                    shutdown_signal(),
                )
                .await;
        }
    }

    Ok(())
}

// ============================================================================
// SECTION 16: TESTS
// ============================================================================



#[cfg(test)]
mod encoder_tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use rstest::rstest;
    use serde_json::json;

    fn drop_set(keys: &[&str]) -> BTreeSet<String> {
        keys.iter().map(|k| k.to_string()).collect()
    }

    fn ok_result(identifier: &str, attribute: &str, value: JsonValue, timestamp: i64) -> ReadResult {
        ReadResult {
            request: ReadRequest::new(identifier, attribute),
            value: MetricValue::from(value),
            timestamp_millis: timestamp,
            status_code: STATUS_OK,
            error: None,
        }
    }

    // ------------------------------------------------------------------------
    // Tag extraction
    // ------------------------------------------------------------------------

    #[rstest]
    #[case("java.lang:type=Memory", &[], &[("name", "java.lang"), ("type", "Memory")])]
    #[case(
        "java.lang:type=GarbageCollector,name=G1 Young Generation",
        &[],
        &[("name", "java.lang"), ("type", "GarbageCollector"), ("name", "G1 Young Generation")]
    )]
    #[case(
        "kafka.server:type=BrokerTopicMetrics,name=MessagesInPerSec,topic=orders",
        &["topic"],
        &[("name", "kafka.server"), ("type", "BrokerTopicMetrics"), ("name", "MessagesInPerSec")]
    )]
    #[case("java.lang:type=Memory", &["name"], &[("type", "Memory")])]
    #[case("java.lang:type=Memory", &["unrelated"], &[("name", "java.lang"), ("type", "Memory")])]
    #[case("jboss.as:address=http://host:8080", &[], &[("name", "jboss.as"), ("address", "http://host:8080")])]
    #[case("Catalina:", &[], &[("name", "Catalina")])]
    fn test_extract_tags(#[case] identifier: &str, #[case] drop: &[&str], #[case] expected: &[(&str, &str)]) {
        let tags = extract_tags(identifier, &drop_set(drop)).unwrap();
        let actual: Vec<(&str, &str)> = tags.iter().map(|t| (t.key.as_str(), t.value.as_str())).collect();
        assert_eq!(actual, expected.to_vec());
    }

    #[rstest]
    #[case("bad-identifier-no-colon")]
    #[case(":type=Memory")]
    #[case("java.lang:type")]
    #[case("java.lang:type=Memory,oops")]
    fn test_extract_tags_malformed(#[case] identifier: &str) {
        let err = extract_tags(identifier, &BTreeSet::new()).unwrap_err();
        assert_eq!(err.identifier, identifier);
    }

    // ------------------------------------------------------------------------
    // Value encoding
    // ------------------------------------------------------------------------

    #[test]
    fn test_encode_scalars() {
        assert_eq!(encode_value(&MetricValue::from(json!(98765.0))).unwrap(), "value=98765");
        assert_eq!(encode_value(&MetricValue::from(json!(0.125))).unwrap(), "value=0.125");
        assert_eq!(encode_value(&MetricValue::from(json!(-17))).unwrap(), "value=-17");
        assert_eq!(encode_value(&MetricValue::from(json!(1e21))).unwrap(), "value=1000000000000000000000");
        assert_eq!(encode_value(&MetricValue::from(json!(1.5e-7))).unwrap(), "value=0.00000015");
        assert_eq!(encode_value(&MetricValue::from(json!("RUNNABLE"))).unwrap(), "value=RUNNABLE");
    }

    #[test]
    fn test_encode_composite_sorted_by_key() {
        let value = MetricValue::from(json!({"used": 123, "max": 456, "committed": 200, "init": 8.5}));
        assert_eq!(encode_value(&value).unwrap(), "committed=200,init=8.5,max=456,used=123");
    }

    #[test]
    fn test_encode_unsupported() {
        let err = encode_value(&MetricValue::from(json!([1, 2]))).unwrap_err();
        assert_eq!(err.kind, "array");

        let err = encode_value(&MetricValue::from(json!(false))).unwrap_err();
        assert_eq!(err.kind, "boolean");

        let err = encode_value(&MetricValue::Composite(BTreeMap::new())).unwrap_err();
        assert_eq!(err.kind, "empty object");
    }

    // ------------------------------------------------------------------------
    // Line encoding
    // ------------------------------------------------------------------------

    #[test]
    fn test_heap_memory_record() {
        let result = ok_result(
            "java.lang:type=Memory",
            "HeapMemoryUsage",
            json!({"used": 123, "max": 456}),
            1610000000000,
        );
        assert_eq!(
            encode_result(&result, &BTreeSet::new()).unwrap(),
            "HeapMemoryUsage,name=java.lang,type=Memory max=456,used=123 1610000000000\n"
        );
    }

    #[test]
    fn test_uptime_record() {
        let result = ok_result("java.lang:type=Runtime", "Uptime", json!(98765.0), 1610000001000);
        assert_eq!(
            encode_result(&result, &BTreeSet::new()).unwrap(),
            "Uptime,name=java.lang,type=Runtime value=98765 1610000001000\n"
        );
    }

    #[test]
    fn test_record_without_tags() {
        let result = ok_result("a:b=c", "Count", json!(1), 5);
        assert_eq!(encode_record(&result, &TagSet::new(), "value=1"), "Count value=1 5\n");
    }

    #[test]
    fn test_record_with_drop_tags() {
        let result = ok_result("java.lang:type=Runtime", "Uptime", json!(1), 7);
        assert_eq!(
            encode_result(&result, &drop_set(&["type"])).unwrap(),
            "Uptime,name=java.lang value=1 7\n"
        );
    }

    // ------------------------------------------------------------------------
    // Batch encoding
    // ------------------------------------------------------------------------

    #[test]
    fn test_batch_isolates_faults() {
        let specs = vec![MetricSpec::new("java.lang:type=Memory", ["HeapMemoryUsage"]).with_drop_tags(["name"])];
        let results = vec![
            ok_result("java.lang:type=Memory", "HeapMemoryUsage", json!({"used": 1}), 10),
            ok_result("bad-identifier-no-colon", "Count", json!(3), 11),
            ReadResult {
                status_code: 500,
                error: Some("boom".into()),
                ..ok_result("java.lang:type=Threading", "ThreadCount", json!(12), 12)
            },
            ok_result("java.lang:type=Runtime", "VmVendor", json!(null), 13),
            ok_result("java.lang:type=Runtime", "Uptime", json!(99.5), 14),
        ];

        let batch = encode_batch(&results, &specs);

        assert_eq!(
            batch.payload,
            "HeapMemoryUsage,type=Memory used=1 10\nUptime,name=java.lang,type=Runtime value=99.5 14\n"
        );
        assert_eq!(batch.records, 2);
        assert_eq!(batch.non_ok, 1);
        assert_eq!(batch.skipped.len(), 2);
        assert!(matches!(batch.skipped[0].error, RecordError::MalformedIdentifier(_)));
        assert_eq!(batch.skipped[0].request.identifier, "bad-identifier-no-colon");
        assert!(matches!(batch.skipped[1].error, RecordError::UnsupportedValue(_)));
    }

    #[test]
    fn test_batch_merges_drop_tags_of_duplicate_specs() {
        let specs = vec![
            MetricSpec::new("a:x=1,y=2", ["P"]).with_drop_tags(["x"]),
            MetricSpec::new("a:x=1,y=2", ["Q"]).with_drop_tags(["y"]),
        ];
        let results = vec![ok_result("a:x=1,y=2", "P", json!(1), 1)];
        assert_eq!(encode_batch(&results, &specs).payload, "P,name=a value=1 1\n");
    }

    #[test]
    fn test_empty_batch() {
        let batch = encode_batch(&[], &[]);
        assert!(batch.is_empty());
        assert_eq!(batch.payload, "");
    }

    // ------------------------------------------------------------------------
    // Result correlation
    // ------------------------------------------------------------------------

    #[test]
    fn test_order_by_requests_restores_request_order() {
        let requests = vec![
            ReadRequest::new("a:t=1", "A"),
            ReadRequest::new("a:t=1", "B"),
            ReadRequest::new("b:t=2", "A"),
        ];
        let results = vec![
            ok_result("b:t=2", "A", json!(3), 3),
            ok_result("a:t=1", "A", json!(1), 1),
            ok_result("a:t=1", "B", json!(2), 2),
        ];

        let ordered = order_by_requests(&requests, results);
        let stamps: Vec<i64> = ordered.iter().map(|r| r.timestamp_millis).collect();
        assert_eq!(stamps, vec![1, 2, 3]);
    }

    #[test]
    fn test_order_by_requests_keeps_unknown_and_duplicates() {
        let requests = vec![ReadRequest::new("a:t=1", "A"), ReadRequest::new("a:t=1", "A")];
        let results = vec![
            ok_result("z:t=9", "Z", json!(0), 100),
            ok_result("a:t=1", "A", json!(1), 1),
            ok_result("a:t=1", "A", json!(2), 2),
            ok_result("y:t=8", "Y", json!(0), 200),
        ];

        let ordered = order_by_requests(&requests, results);
        let stamps: Vec<i64> = ordered.iter().map(|r| r.timestamp_millis).collect();
        assert_eq!(stamps, vec![1, 2, 100, 200]);
    }

    // ------------------------------------------------------------------------
    // Properties
    // ------------------------------------------------------------------------

    proptest! {
        #[test]
        fn prop_number_text_reparses_exactly(v in any::<f64>().prop_filter("finite", |v| v.is_finite())) {
            let text = encode_value(&MetricValue::Scalar(Scalar::Number(v))).unwrap();
            let digits = text.strip_prefix("value=").unwrap();
            prop_assert!(!digits.contains('e') && !digits.contains('E'));
            prop_assert_eq!(digits.parse::<f64>().unwrap(), v);
        }

        #[test]
        fn prop_composite_keys_appear_once(
            fields in proptest::collection::btree_map("[a-z][a-zA-Z0-9_]{0,8}", -1.0e9f64..1.0e9, 1..12)
        ) {
            let value = MetricValue::Composite(
                fields.iter().map(|(k, v)| (k.clone(), Scalar::Number(*v))).collect(),
            );
            let text = encode_value(&value).unwrap();

            prop_assert_eq!(text.matches('=').count(), fields.len());
            let keys: Vec<&str> = text.split(',').map(|f| f.split('=').next().unwrap()).collect();
            prop_assert_eq!(keys.len(), fields.len());
            for key in fields.keys() {
                prop_assert_eq!(keys.iter().filter(|k| **k == key.as_str()).count(), 1);
            }
        }

        #[test]
        fn prop_non_ok_results_never_encoded(
            statuses in proptest::collection::vec((100i32..600).prop_filter("not ok", |s| *s != STATUS_OK), 0..16)
        ) {
            let results: Vec<ReadResult> = statuses
                .iter()
                .map(|status| ReadResult { status_code: *status, ..ok_result("a:b=c", "Attr", json!(1), 1) })
                .collect();
            let batch = encode_batch(&results, &[]);
            prop_assert_eq!(batch.payload, "");
            prop_assert_eq!(batch.non_ok, statuses.len());
        }

        #[test]
        fn prop_batch_has_one_line_per_result_in_order(
            attributes in proptest::collection::vec("[A-Z][a-zA-Z]{0,10}", 0..24)
        ) {
            let results: Vec<ReadResult> = attributes
                .iter()
                .enumerate()
                .map(|(i, attr)| ok_result("java.lang:type=Runtime", attr, json!(i), i as i64))
                .collect();
            let batch = encode_batch(&results, &[]);

            prop_assert_eq!(batch.records, attributes.len());
            prop_assert_eq!(batch.payload.matches('\n').count(), attributes.len());
            prop_assert!(batch.payload.is_empty() || batch.payload.ends_with('\n'));
            for (i, (line, attr)) in batch.payload.lines().zip(&attributes).enumerate() {
                let prefix = format!("{},", attr);
                let suffix = format!(" {}", i);
                prop_assert!(line.starts_with(&prefix));
                prop_assert!(line.ends_with(&suffix));
            }
        }
    }
}
