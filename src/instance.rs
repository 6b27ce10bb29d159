//! Service instance and health data model

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Transport protocol a service instance speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Plain HTTP
    #[default]
    Http,
    /// HTTP over TLS
    Https,
    /// gRPC
    Grpc,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Http => write!(f, "http"),
            Self::Https => write!(f, "https"),
            Self::Grpc => write!(f, "grpc"),
        }
    }
}

/// Error returned when parsing an unknown protocol name.
#[derive(Debug, Error)]
#[error("unknown protocol: {0}")]
pub struct UnknownProtocol(pub String);

impl std::str::FromStr for Protocol {
    type Err = UnknownProtocol;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http" => Ok(Self::Http),
            "https" => Ok(Self::Https),
            "grpc" => Ok(Self::Grpc),
            other => Err(UnknownProtocol(other.to_string())),
        }
    }
}

/// Overall health state of a service instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    /// Instance is serving traffic normally
    #[default]
    Healthy,
    /// Instance is serving but at least one check warned
    Warning,
    /// At least one check failed
    Unhealthy,
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Warning => write!(f, "warning"),
            Self::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Outcome of a single health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckOutcome {
    /// Check passed
    Pass,
    /// Check passed but crossed a quality threshold
    Warn,
    /// Check failed
    Fail,
}

/// Result of one health check against an instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheck {
    /// Name of the check (e.g. "connectivity")
    pub name: String,
    /// Outcome of the check
    pub status: CheckOutcome,
    /// Optional human-readable output
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    /// Time taken to run the check, in milliseconds
    pub duration_ms: u64,
}

impl HealthCheck {
    /// Creates a passing check result.
    pub fn pass(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckOutcome::Pass,
            output: None,
            duration_ms: 0,
        }
    }

    /// Creates a warning check result.
    pub fn warn(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckOutcome::Warn,
            output: None,
            duration_ms: 0,
        }
    }

    /// Creates a failing check result.
    pub fn fail(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckOutcome::Fail,
            output: None,
            duration_ms: 0,
        }
    }

    /// Attaches check output.
    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = Some(output.into());
        self
    }

    /// Sets the check duration.
    pub fn with_duration(mut self, duration: std::time::Duration) -> Self {
        self.duration_ms = duration.as_millis() as u64;
        self
    }
}

/// Health of a service instance: the derived overall state plus the
/// ordered check results it was derived from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    /// Overall state, derived from the check results
    pub status: HealthState,
    /// Unix timestamp (seconds) of the most recent check cycle
    pub last_check: u64,
    /// Ordered check results from the most recent cycle
    pub checks: Vec<HealthCheck>,
}

impl HealthStatus {
    /// Health of a freshly registered instance: healthy, no checks yet.
    pub fn healthy() -> Self {
        Self {
            status: HealthState::Healthy,
            last_check: current_timestamp(),
            checks: Vec::new(),
        }
    }

    /// Derives the overall state from an ordered list of check results.
    ///
    /// Any `fail` makes the instance unhealthy; otherwise any `warn` makes it
    /// warning; otherwise it is healthy.
    pub fn from_checks(checks: Vec<HealthCheck>) -> Self {
        let has_fail = checks.iter().any(|c| c.status == CheckOutcome::Fail);
        let has_warn = checks.iter().any(|c| c.status == CheckOutcome::Warn);

        let status = if has_fail {
            HealthState::Unhealthy
        } else if has_warn {
            HealthState::Warning
        } else {
            HealthState::Healthy
        };

        Self {
            status,
            last_check: current_timestamp(),
            checks,
        }
    }

    /// Returns true if the instance is eligible to serve traffic.
    pub fn is_healthy(&self) -> bool {
        self.status == HealthState::Healthy
    }
}

impl Default for HealthStatus {
    fn default() -> Self {
        Self::healthy()
    }
}

fn default_weight() -> u32 {
    1
}

/// One running deployment of a named service.
///
/// Identity is `id`; `name` groups instances into a logical service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceInstance {
    /// Unique instance id
    pub id: String,

    /// Logical service name
    pub name: String,

    /// Deployed version
    pub version: String,

    /// Host/IP address
    pub address: String,

    /// Port number
    pub port: u16,

    /// Transport protocol
    #[serde(default)]
    pub protocol: Protocol,

    /// Free-form metadata
    #[serde(default)]
    pub metadata: HashMap<String, String>,

    /// Service tags
    #[serde(default)]
    pub tags: Vec<String>,

    /// Relative weight for weighted selection
    #[serde(default = "default_weight")]
    pub weight: u32,

    /// Current health
    #[serde(default)]
    pub health: HealthStatus,

    /// Advertised endpoint paths (e.g. "/health", "/metrics")
    #[serde(default)]
    pub endpoints: Vec<String>,
}

impl ServiceInstance {
    /// Creates a new service instance.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        version: impl Into<String>,
        address: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            version: version.into(),
            address: address.into(),
            port,
            protocol: Protocol::Http,
            metadata: HashMap::new(),
            tags: Vec::new(),
            weight: 1,
            health: HealthStatus::healthy(),
            endpoints: Vec::new(),
        }
    }

    /// Sets the transport protocol.
    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    /// Adds a tag.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Adds a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Sets the selection weight.
    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    /// Advertises an endpoint path.
    pub fn with_endpoint(mut self, path: impl Into<String>) -> Self {
        self.endpoints.push(path.into());
        self
    }

    /// Get the base URL for this instance.
    pub fn url(&self) -> String {
        format!("{}://{}:{}", self.protocol, self.address, self.port)
    }

    /// The advertised health endpoint path, if any.
    pub fn health_endpoint(&self) -> Option<&str> {
        self.endpoints
            .iter()
            .find(|e| e.contains("/health"))
            .map(String::as_str)
    }
}

/// Returns the current Unix timestamp in seconds.
pub(crate) fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
