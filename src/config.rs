use std::collections::BTreeMap;

use serde::Deserialize;

use crate::{BackendError, CachedRepresentation, Result, SetOptions};

/// Opaque client tuning options, handed to the client factory untouched.
pub type Behaviors = BTreeMap<String, serde_json::Value>;

/// Ordered list of remote store addresses. A single address converts into a
/// one-element list.
///
/// An address is either a URL (`memcache://host:port`) or `host[:port]`. IPv6
/// hosts must be bracketed, as in `[::1]` or `[::1]:11211`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints(Vec<String>);

impl Endpoints {
    #[must_use]
    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    #[must_use]
    pub fn to_vec(&self) -> Vec<String> {
        self.0.clone()
    }

    fn validate(&self) -> Result<()> {
        if self.0.is_empty() {
            return Err(BackendError::configuration(
                "at least one endpoint is required",
            ));
        }
        if self.0.iter().any(|e| e.trim().is_empty()) {
            return Err(BackendError::configuration("endpoint must not be blank"));
        }
        if let Some(endpoint) = self.0.iter().find(|e| is_unbracketed_ipv6(e)) {
            return Err(BackendError::configuration(format!(
                "IPv6 endpoint {endpoint:?} must be written as [address] or [address]:port"
            )));
        }
        Ok(())
    }
}

// `host:port` has one colon; anything with more is an IPv6 address that
// cannot be told apart from its port.
fn is_unbracketed_ipv6(endpoint: &str) -> bool {
    !endpoint.contains("://") && !endpoint.starts_with('[') && endpoint.matches(':').count() > 1
}

impl From<&str> for Endpoints {
    fn from(value: &str) -> Self {
        Self(vec![value.to_string()])
    }
}

impl From<String> for Endpoints {
    fn from(value: String) -> Self {
        Self(vec![value])
    }
}

impl From<Vec<String>> for Endpoints {
    fn from(value: Vec<String>) -> Self {
        Self(value)
    }
}

impl From<Vec<&str>> for Endpoints {
    fn from(value: Vec<&str>) -> Self {
        Self(value.into_iter().map(str::to_string).collect())
    }
}

impl From<&[&str]> for Endpoints {
    fn from(value: &[&str]) -> Self {
        Self(value.iter().map(|s| (*s).to_string()).collect())
    }
}

impl<'de> Deserialize<'de> for Endpoints {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum OneOrMany {
            One(String),
            Many(Vec<String>),
        }

        Ok(match OneOrMany::deserialize(deserializer)? {
            OneOrMany::One(endpoint) => Endpoints::from(endpoint),
            OneOrMany::Many(endpoints) => Endpoints::from(endpoints),
        })
    }
}

/// The subset of the configuration a client factory needs to open a handle.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionSettings {
    pub endpoints: Endpoints,
    pub binary_protocol: bool,
    pub behaviors: Behaviors,
}

/// Backend configuration, immutable once built.
///
/// `remote_ttl_seconds` is the store-side expiry. It is independent of any
/// freshness window the caller applies; callers that keep serving stale
/// values during regeneration should make it longer than that window plus the
/// time a regeneration takes. Nothing here enforces that.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "RawArguments")]
pub struct BackendConfig {
    connection: ConnectionSettings,
    distributed_lock: bool,
    remote_ttl_seconds: Option<u32>,
    compression_threshold: Option<usize>,
    representation: CachedRepresentation,
}

#[bon::bon]
impl BackendConfig {
    #[builder]
    pub fn new(
        #[builder(into)] endpoints: Endpoints,
        #[builder(default)] binary_protocol: bool,
        #[builder(default)] behaviors: Behaviors,
        #[builder(default)] distributed_lock: bool,
        remote_ttl_seconds: Option<u32>,
        compression_threshold: Option<usize>,
        #[builder(default)] representation: CachedRepresentation,
    ) -> Result<Self> {
        endpoints.validate()?;

        if remote_ttl_seconds == Some(0) {
            return Err(BackendError::configuration(
                "remote_ttl_seconds must be positive",
            ));
        }
        if compression_threshold == Some(0) {
            return Err(BackendError::configuration(
                "compression_threshold must be positive",
            ));
        }

        Ok(Self {
            connection: ConnectionSettings {
                endpoints,
                binary_protocol,
                behaviors,
            },
            distributed_lock,
            remote_ttl_seconds,
            compression_threshold,
            representation,
        })
    }
}

impl BackendConfig {
    /// Parses a loosely typed arguments map, e.g. one read from an
    /// application config file.
    pub fn from_arguments(arguments: serde_json::Value) -> Result<Self> {
        serde_json::from_value(arguments).map_err(|e| BackendError::configuration(e.to_string()))
    }

    #[must_use]
    pub fn endpoints(&self) -> &Endpoints {
        &self.connection.endpoints
    }

    #[must_use]
    pub fn binary_protocol(&self) -> bool {
        self.connection.binary_protocol
    }

    #[must_use]
    pub fn behaviors(&self) -> &Behaviors {
        &self.connection.behaviors
    }

    #[must_use]
    pub fn distributed_lock(&self) -> bool {
        self.distributed_lock
    }

    #[must_use]
    pub fn remote_ttl_seconds(&self) -> Option<u32> {
        self.remote_ttl_seconds
    }

    #[must_use]
    pub fn compression_threshold(&self) -> Option<usize> {
        self.compression_threshold
    }

    #[must_use]
    pub fn representation(&self) -> CachedRepresentation {
        self.representation
    }

    #[must_use]
    pub fn connection_settings(&self) -> &ConnectionSettings {
        &self.connection
    }

    pub(crate) fn set_options(&self) -> SetOptions {
        SetOptions {
            ttl_seconds: self.remote_ttl_seconds,
            compress_threshold: self.compression_threshold,
        }
    }
}

#[derive(Deserialize)]
struct RawArguments {
    #[serde(alias = "url")]
    endpoints: Endpoints,
    #[serde(default, alias = "binary")]
    binary_protocol: bool,
    #[serde(default)]
    behaviors: Behaviors,
    #[serde(default)]
    distributed_lock: bool,
    #[serde(default, alias = "memcached_expire_time")]
    remote_ttl_seconds: Option<u32>,
    #[serde(default, alias = "min_compress_len")]
    compression_threshold: Option<usize>,
    #[serde(default)]
    representation: CachedRepresentation,
}

impl TryFrom<RawArguments> for BackendConfig {
    type Error = BackendError;

    fn try_from(raw: RawArguments) -> Result<Self> {
        BackendConfig::builder()
            .endpoints(raw.endpoints)
            .binary_protocol(raw.binary_protocol)
            .behaviors(raw.behaviors)
            .distributed_lock(raw.distributed_lock)
            .maybe_remote_ttl_seconds(raw.remote_ttl_seconds)
            .maybe_compression_threshold(raw.compression_threshold)
            .representation(raw.representation)
            .build()
    }
}
