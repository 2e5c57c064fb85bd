//! Configuration management for Tollgate.

use axum::response::IntoResponse;
use http::header::CONTENT_TYPE;
use http::request::Parts;
use http::StatusCode;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Result, TollgateError};
use crate::ratelimit::{AdmissionGate, Predicate, RefillPolicy, TokenBucket};

/// Prefix for environment variable overrides, e.g. `TOLLGATE__LIMITER__CAPACITY=50`.
const ENV_PREFIX: &str = "TOLLGATE";

/// Main configuration for the Tollgate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Admission gate configuration
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Token bucket and gate configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Maximum number of tokens (burst size)
    #[serde(default = "default_capacity")]
    pub capacity: u64,

    /// How tokens come back
    #[serde(default)]
    pub policy: PolicyConfig,

    /// Requests are limited only when all of these match
    #[serde(default)]
    pub filters: Vec<MatchRule>,

    /// Requests matching any of these are never limited
    #[serde(default)]
    pub exceptions: Vec<MatchRule>,

    /// Custom deny response; the builtin 429 is used when absent
    #[serde(default)]
    pub deny_response: Option<DenyResponse>,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            policy: PolicyConfig::default(),
            filters: Vec::new(),
            exceptions: Vec::new(),
            deny_response: None,
        }
    }
}

fn default_capacity() -> u64 {
    100
}

/// Refill policy as written in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PolicyConfig {
    /// Continuous refill
    Rate {
        /// Tokens per second
        per_second: f64,
    },
    /// Periodic refill
    Window {
        /// Window length in milliseconds
        window_ms: u64,
        /// Tokens per window; defaults to the capacity (full reset)
        #[serde(default)]
        amount: Option<u64>,
    },
}

impl Default for PolicyConfig {
    fn default() -> Self {
        PolicyConfig::Rate { per_second: 10.0 }
    }
}

impl PolicyConfig {
    /// Resolve into a bucket refill policy for a bucket of `capacity` tokens.
    pub fn to_policy(&self, capacity: u64) -> RefillPolicy {
        match *self {
            PolicyConfig::Rate { per_second } => RefillPolicy::Rate { per_second },
            PolicyConfig::Window { window_ms, amount } => RefillPolicy::Window {
                window: Duration::from_millis(window_ms),
                amount: amount.unwrap_or(capacity),
            },
        }
    }
}

/// A declarative request predicate, usable as a filter or an exception.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "match", rename_all = "snake_case")]
pub enum MatchRule {
    /// Header present, or equal to `value` when one is given
    Header {
        /// Header name (case-insensitive)
        name: String,
        /// Expected value
        #[serde(default)]
        value: Option<String>,
    },
    /// Request path starts with `prefix`
    PathPrefix {
        /// Path prefix
        prefix: String,
    },
    /// Request method equals `method` (case-insensitive)
    Method {
        /// HTTP method
        method: String,
    },
}

impl Predicate for MatchRule {
    fn matches(&self, request: &Parts) -> bool {
        match self {
            MatchRule::Header { name, value } => match request.headers.get(name.as_str()) {
                Some(actual) => value
                    .as_ref()
                    .map_or(true, |expected| actual.as_bytes() == expected.as_bytes()),
                None => false,
            },
            MatchRule::PathPrefix { prefix } => request.uri.path().starts_with(prefix.as_str()),
            MatchRule::Method { method } => request.method.as_str().eq_ignore_ascii_case(method),
        }
    }
}

/// Custom response for denied requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DenyResponse {
    /// HTTP status code
    #[serde(default = "default_deny_status")]
    pub status: u16,
    /// Plain-text body
    #[serde(default = "default_deny_body")]
    pub body: String,
}

fn default_deny_status() -> u16 {
    429
}

fn default_deny_body() -> String {
    "Too Many Requests".to_string()
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Text,
    /// One JSON object per line
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Output format
    #[serde(default)]
    pub format: LogFormat,
}

impl LimiterConfig {
    /// Build an admission gate from this configuration.
    pub fn build_gate(&self) -> Result<AdmissionGate> {
        let bucket = TokenBucket::new(self.policy.to_policy(self.capacity), self.capacity)?;
        let mut gate = AdmissionGate::new(bucket);

        for filter in &self.filters {
            gate.add_filter(filter.clone());
        }
        for exception in &self.exceptions {
            gate.add_exception(exception.clone());
        }

        if let Some(deny) = &self.deny_response {
            let status = StatusCode::from_u16(deny.status).map_err(|_| {
                TollgateError::InvalidConfig(format!("invalid deny status code {}", deny.status))
            })?;
            let body = deny.body.clone();
            gate.set_responder(Arc::new(move |_request: &Parts| {
                (
                    status,
                    [(CONTENT_TYPE, "text/plain; charset=utf-8")],
                    body.clone(),
                )
                    .into_response()
            }));
        }

        Ok(gate)
    }
}

impl TollgateConfig {
    /// Load configuration from an optional file plus `TOLLGATE__*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_from(path, None)
    }

    /// Load with an explicit environment map in place of the process environment.
    fn load_from(path: Option<&Path>, env: Option<::config::Map<String, String>>) -> Result<Self> {
        let mut builder = ::config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path));
        }

        let settings = builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true)
                    .source(env),
            )
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| TollgateError::Config(format!("Failed to parse configuration: {}", e)))
    }
}
