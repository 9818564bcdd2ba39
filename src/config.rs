//! Host-supplied configuration.
//!
//! Nothing in the crate reads globals: secrets, tuning constants and timings
//! are passed in through these structs at service start.

use std::fmt;
use std::time::Duration;

use derive_builder::Builder;
use serde::{Deserialize, Deserializer};

use crate::challenge::Algorithm;
use crate::error::Error;
use crate::sketch::{FrequencySketch, MAX_CELLS};

/// HMAC key material. `Debug` never prints the bytes.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct ServerSecret(Vec<u8>);

impl ServerSecret {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn from_hex(encoded: &str) -> Result<Self, Error> {
        hex::decode(encoded.trim())
            .map(Self)
            .map_err(|e| Error::InvalidConfig(format!("secret is not valid hex: {e}")))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub(crate) fn ensure_present(&self) -> Result<(), Error> {
        if self.0.is_empty() {
            return Err(Error::Internal("hmac secret is empty".into()));
        }
        Ok(())
    }
}

impl fmt::Debug for ServerSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ServerSecret(<{} bytes>)", self.0.len())
    }
}

impl From<&[u8]> for ServerSecret {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl From<Vec<u8>> for ServerSecret {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl<'de> Deserialize<'de> for ServerSecret {
    /// Secrets are written as hex strings in configuration files.
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Self::from_hex(&raw).map_err(serde::de::Error::custom)
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

/// Tuning for the adaptive difficulty tracker.
#[derive(Builder, Debug, Clone, PartialEq, Deserialize)]
#[builder(pattern = "owned", default)]
#[serde(default)]
pub struct TrackerConfig {
    /// Sketch error bound relative to the total count per window.
    pub epsilon: f64,
    /// Probability the error bound is exceeded.
    pub delta: f64,
    /// Length of one decay window.
    #[serde(rename = "window_secs", deserialize_with = "duration_secs::deserialize")]
    pub window: Duration,
    /// Requests per window a client may make without accumulating difficulty.
    pub decay: u32,
    /// Base of the exponential bump applied to requests above `decay`.
    pub growth: f64,
    /// How much one challenge issuance counts towards the window.
    pub observation_weight: u32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        // Good for about 20k distinct clients per window.
        Self {
            epsilon: 0.00007,
            delta: 0.001,
            window: Duration::from_secs(10),
            decay: 2,
            growth: 1.01,
            observation_weight: 2,
        }
    }
}

impl TrackerConfig {
    /// Longest accepted decay window.
    pub const MAX_WINDOW: Duration = Duration::from_secs(60 * 60 * 24);

    pub fn validate(&self) -> Result<(), Error> {
        let (width, depth) = FrequencySketch::dimensions(self.epsilon, self.delta)?;
        if width.saturating_mul(depth) > MAX_CELLS {
            return Err(Error::InvalidConfig(format!(
                "epsilon {} and delta {} need a {width}x{depth} sketch, over {MAX_CELLS} cells",
                self.epsilon, self.delta
            )));
        }
        if self.window.is_zero() {
            return Err(Error::InvalidConfig("window must be non-zero".into()));
        }
        if self.window > Self::MAX_WINDOW {
            return Err(Error::InvalidConfig(format!(
                "window must be at most {} seconds",
                Self::MAX_WINDOW.as_secs()
            )));
        }
        if !(self.growth.is_finite() && self.growth > 1.0) {
            return Err(Error::InvalidConfig("growth must be finite and > 1".into()));
        }
        Ok(())
    }
}

impl TrackerConfigBuilder {
    pub fn build_validated(self) -> Result<TrackerConfig, Error> {
        let cfg = self
            .build()
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }
}

/// How the resource bound into a challenge is compared with the request path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceMatch {
    /// Byte-for-byte equality of the path.
    #[default]
    Exact,
    /// Equality after stripping one trailing `/` from non-root paths.
    IgnoreTrailingSlash,
}

impl ResourceMatch {
    pub fn matches(self, bound: &str, requested: &str) -> bool {
        match self {
            Self::Exact => bound == requested,
            Self::IgnoreTrailingSlash => trim_slash(bound) == trim_slash(requested),
        }
    }
}

fn trim_slash(path: &str) -> &str {
    if path.len() > 1 {
        path.strip_suffix('/').unwrap_or(path)
    } else {
        path
    }
}

/// Settings for the challenge middleware.
#[derive(Builder, Debug, Clone, PartialEq, Deserialize)]
#[builder(pattern = "owned", default)]
#[serde(default)]
pub struct GateConfig {
    #[builder(setter(into))]
    pub secret: ServerSecret,
    pub algorithm: Algorithm,
    /// Added to the client's difficulty score to form `maxNumber`.
    pub base_difficulty: u64,
    /// Random salt length in bytes (hex encoded on the wire).
    pub salt_len: usize,
    /// Lifetime of an issued challenge.
    #[serde(rename = "expiry_secs", deserialize_with = "duration_secs::deserialize")]
    pub expiry: Duration,
    /// Request header carrying the base64 solution.
    #[builder(setter(into))]
    pub header: String,
    pub resource_match: ResourceMatch,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            secret: ServerSecret::default(),
            algorithm: Algorithm::Sha256,
            base_difficulty: 200_000,
            salt_len: 12,
            expiry: Duration::from_secs(10),
            header: "X-Pow-Challenge".to_owned(),
            resource_match: ResourceMatch::Exact,
        }
    }
}

impl GateConfig {
    /// Longest accepted challenge lifetime.
    pub const MAX_EXPIRY: Duration = Duration::from_secs(60 * 60 * 24);

    pub fn validate(&self) -> Result<(), Error> {
        if self.secret.is_empty() {
            return Err(Error::InvalidConfig("secret must not be empty".into()));
        }
        if self.salt_len == 0 {
            return Err(Error::InvalidConfig("salt_len must be >= 1".into()));
        }
        if self.expiry < Duration::from_secs(1) {
            return Err(Error::InvalidConfig(
                "expiry must be at least 1 second".into(),
            ));
        }
        if self.expiry > Self::MAX_EXPIRY {
            return Err(Error::InvalidConfig(format!(
                "expiry must be at most {} seconds",
                Self::MAX_EXPIRY.as_secs()
            )));
        }
        if http::HeaderName::from_bytes(self.header.as_bytes()).is_err() {
            return Err(Error::InvalidConfig(format!(
                "invalid header name {:?}",
                self.header
            )));
        }
        Ok(())
    }
}

impl GateConfigBuilder {
    pub fn build_validated(self) -> Result<GateConfig, Error> {
        let cfg = self
            .build()
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }
}

/// Settings for the signed session cookie.
#[derive(Builder, Debug, Clone, PartialEq, Deserialize)]
#[builder(pattern = "owned", default)]
#[serde(default)]
pub struct SessionConfig {
    #[builder(setter(into))]
    pub secret: ServerSecret,
    #[serde(rename = "expiry_secs", deserialize_with = "duration_secs::deserialize")]
    pub expiry: Duration,
    #[builder(setter(into))]
    pub cookie_name: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            secret: ServerSecret::default(),
            expiry: Duration::from_secs(60 * 60 * 24),
            cookie_name: "session".to_owned(),
        }
    }
}

impl SessionConfig {
    /// Longest accepted session lifetime (ten years).
    pub const MAX_EXPIRY: Duration = Duration::from_secs(60 * 60 * 24 * 3650);

    pub fn validate(&self) -> Result<(), Error> {
        if self.secret.is_empty() {
            return Err(Error::InvalidConfig("secret must not be empty".into()));
        }
        if self.expiry.as_secs() == 0 {
            return Err(Error::InvalidConfig(
                "expiry must be at least 1 second".into(),
            ));
        }
        if self.expiry > Self::MAX_EXPIRY {
            return Err(Error::InvalidConfig(format!(
                "expiry must be at most {} seconds",
                Self::MAX_EXPIRY.as_secs()
            )));
        }
        if self.cookie_name.is_empty() {
            return Err(Error::InvalidConfig("cookie_name must not be empty".into()));
        }
        Ok(())
    }
}

impl SessionConfigBuilder {
    pub fn build_validated(self) -> Result<SessionConfig, Error> {
        let cfg = self
            .build()
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }
}
