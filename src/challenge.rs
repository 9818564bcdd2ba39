//! Stateless proof-of-work challenges.
//!
//! The server commits to a secret number by publishing `H(salt || number)`
//! together with an HMAC over that hash. The client brute-forces the number
//! in `0..=maxNumber` and sends it back; verification recomputes both values
//! from the submitted salt and number, so nothing is stored between the two
//! legs of the handshake.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use derive_builder::Builder;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::{Rng, RngCore};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};
use subtle::ConstantTimeEq;
use url::form_urlencoded;

use crate::error::{Error, VerifyError};
use crate::time::{SystemTimeProvider, TimeProvider};

/// Salt parameter holding the unix expiry of a challenge.
pub const PARAM_EXPIRES: &str = "expires";
/// Salt parameter holding the path a challenge was issued for.
pub const PARAM_RESOURCE: &str = "resource";

/// Digest used for both the challenge hash and its HMAC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Algorithm {
    Sha1,
    #[default]
    Sha256,
    Sha512,
}

impl Algorithm {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sha1 => "SHA-1",
            Self::Sha256 => "SHA-256",
            Self::Sha512 => "SHA-512",
        }
    }

    /// Hash the concatenation of `parts`.
    pub fn digest(self, parts: &[&[u8]]) -> Vec<u8> {
        match self {
            Self::Sha1 => digest_with::<Sha1>(parts),
            Self::Sha256 => digest_with::<Sha256>(parts),
            Self::Sha512 => digest_with::<Sha512>(parts),
        }
    }

    /// HMAC of `data` under `key`.
    pub fn mac(self, key: &[u8], data: &[u8]) -> Result<Vec<u8>, Error> {
        match self {
            Self::Sha1 => mac_with::<Hmac<Sha1>>(key, data),
            Self::Sha256 => mac_with::<Hmac<Sha256>>(key, data),
            Self::Sha512 => mac_with::<Hmac<Sha512>>(key, data),
        }
    }
}

fn digest_with<D: Digest>(parts: &[&[u8]]) -> Vec<u8> {
    let mut hasher = D::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().to_vec()
}

fn mac_with<M: Mac + hmac::digest::KeyInit>(key: &[u8], data: &[u8]) -> Result<Vec<u8>, Error> {
    let mut mac = <M as Mac>::new_from_slice(key)
        .map_err(|e| Error::Internal(format!("invalid hmac key: {e}")))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Algorithm {
    type Err = VerifyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SHA-1" => Ok(Self::Sha1),
            "SHA-256" => Ok(Self::Sha256),
            "SHA-512" => Ok(Self::Sha512),
            other => Err(VerifyError::UnsupportedAlgorithm(other.to_owned())),
        }
    }
}

impl Serialize for Algorithm {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Algorithm {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// What the server sends to a client that has not solved anything yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Challenge {
    pub algorithm: Algorithm,
    /// Hex `H(salt || number)`.
    pub challenge: String,
    pub max_number: u64,
    pub salt: String,
    /// Hex HMAC of `challenge`.
    pub signature: String,
}

/// A client's answer to a [`Challenge`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Payload {
    pub algorithm: Algorithm,
    pub challenge: String,
    pub number: u64,
    pub salt: String,
    pub signature: String,
    /// Milliseconds the client spent solving.
    pub took: u64,
}

#[derive(Deserialize)]
struct RawPayload {
    algorithm: String,
    challenge: String,
    number: u64,
    salt: String,
    signature: String,
    #[serde(default)]
    took: u64,
}

impl Payload {
    /// Answer `challenge` with `number`.
    pub fn for_challenge(challenge: &Challenge, number: u64, took: Duration) -> Self {
        Self {
            algorithm: challenge.algorithm,
            challenge: challenge.challenge.clone(),
            number,
            salt: challenge.salt.clone(),
            signature: challenge.signature.clone(),
            took: u64::try_from(took.as_millis()).unwrap_or(u64::MAX),
        }
    }

    pub fn took(&self) -> Duration {
        Duration::from_millis(self.took)
    }

    /// Parse JSON, reporting unknown digests separately from bad JSON.
    pub fn from_json(raw: &[u8]) -> Result<Self, VerifyError> {
        let raw: RawPayload = serde_json::from_slice(raw)
            .map_err(|e| VerifyError::MalformedInput(format!("payload json: {e}")))?;
        Ok(Self {
            algorithm: raw.algorithm.parse()?,
            challenge: raw.challenge,
            number: raw.number,
            salt: raw.salt,
            signature: raw.signature,
            took: raw.took,
        })
    }

    /// Decode the base64-encoded JSON carried in the challenge header.
    pub fn from_header(value: &str) -> Result<Self, VerifyError> {
        let raw = BASE64
            .decode(value.trim())
            .map_err(|e| VerifyError::MalformedInput(format!("payload base64: {e}")))?;
        Self::from_json(&raw)
    }

    pub fn to_header(&self) -> Result<String, Error> {
        let json = serde_json::to_vec(self)
            .map_err(|e| Error::Internal(format!("payload json: {e}")))?;
        Ok(BASE64.encode(json))
    }

    /// Parameters carried after the `?` of the salt.
    pub fn params(&self) -> BTreeMap<String, String> {
        extract_params(&self.salt)
    }
}

/// Inputs to [`create_challenge`].
#[derive(Builder, Debug, Clone)]
#[builder(pattern = "owned")]
pub struct ChallengeOptions {
    #[builder(default)]
    pub algorithm: Algorithm,
    #[builder(default = "1_000_000")]
    pub max_number: u64,
    /// Length in bytes of a generated salt.
    #[builder(default = "12")]
    pub salt_len: usize,
    #[builder(setter(into))]
    pub secret: Vec<u8>,
    /// Use this salt instead of generating one. Must not contain `?`.
    #[builder(default, setter(into, strip_option))]
    pub salt: Option<String>,
    /// Commit to this number instead of drawing one.
    #[builder(default, setter(strip_option))]
    pub number: Option<u64>,
    /// Unix timestamp after which the challenge is refused.
    #[builder(default, setter(strip_option))]
    pub expires: Option<u64>,
    #[builder(default)]
    pub params: BTreeMap<String, String>,
}

impl ChallengeOptionsBuilder {
    /// Add a salt parameter.
    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value.into());
        self
    }

    pub fn build_validated(self) -> Result<ChallengeOptions, Error> {
        self.build().map_err(|e| Error::InvalidConfig(e.to_string()))
    }
}

/// Mint a fresh challenge. The committed number is not part of the result.
pub fn create_challenge(options: ChallengeOptions) -> Result<Challenge, Error> {
    if options.secret.is_empty() {
        return Err(Error::Internal("hmac secret is empty".into()));
    }

    let mut params = options.params;
    if let Some(expires) = options.expires {
        params.insert(PARAM_EXPIRES.to_owned(), expires.to_string());
    }

    let mut salt = match options.salt {
        // `?` starts the parameter section, so it cannot appear in the salt.
        Some(salt) if salt.contains('?') => {
            return Err(Error::InvalidConfig(format!(
                "salt {salt:?} must not contain '?'"
            )));
        }
        Some(salt) if !salt.is_empty() => salt,
        _ => {
            if options.salt_len == 0 {
                return Err(Error::InvalidConfig("salt_len must be >= 1".into()));
            }
            let mut bytes = vec![0u8; options.salt_len];
            OsRng.fill_bytes(&mut bytes);
            hex::encode(bytes)
        }
    };
    if !params.is_empty() {
        salt.push('?');
        salt.push_str(&encode_params(&params));
    }

    let number = match options.number {
        Some(number) => number,
        None => OsRng.gen_range(0..=options.max_number),
    };

    let (challenge, signature) = commit(options.algorithm, &options.secret, &salt, number)?;

    Ok(Challenge {
        algorithm: options.algorithm,
        challenge,
        max_number: options.max_number,
        salt,
        signature,
    })
}

/// Hex hash and hex signature for `(salt, number)`.
pub(crate) fn commit(
    algorithm: Algorithm,
    secret: &[u8],
    salt: &str,
    number: u64,
) -> Result<(String, String), Error> {
    let challenge = hex::encode(algorithm.digest(&[salt.as_bytes(), number.to_string().as_bytes()]));
    let signature = hex::encode(algorithm.mac(secret, challenge.as_bytes())?);
    Ok((challenge, signature))
}

/// Verify a solution against the wall clock.
pub fn verify_solution(
    payload: &Payload,
    secret: &[u8],
    check_expiry: bool,
) -> Result<(), VerifyError> {
    verify_solution_with(payload, secret, check_expiry, &SystemTimeProvider)
}

/// Verify a solution against an injected clock.
///
/// A missing or unparsable `expires` parameter is treated as a wrong solution
/// when expiry is checked, since the salt came from this server.
pub fn verify_solution_with(
    payload: &Payload,
    secret: &[u8],
    check_expiry: bool,
    clock: &dyn TimeProvider,
) -> Result<(), VerifyError> {
    if secret.is_empty() {
        return Err(VerifyError::Internal("hmac secret is empty".into()));
    }

    if check_expiry {
        let expires = payload
            .params()
            .get(PARAM_EXPIRES)
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or(VerifyError::WrongSolution)?;
        let now = clock.now_seconds();
        if now > expires {
            return Err(VerifyError::Expired {
                overshoot_secs: now - expires,
            });
        }
    }

    let (challenge, signature) = commit(payload.algorithm, secret, &payload.salt, payload.number)
        .map_err(|e| VerifyError::Internal(e.to_string()))?;

    let challenge_ok = challenge.as_bytes().ct_eq(payload.challenge.as_bytes());
    let signature_ok = signature.as_bytes().ct_eq(payload.signature.as_bytes());
    if bool::from(challenge_ok & signature_ok) {
        Ok(())
    } else {
        Err(VerifyError::WrongSolution)
    }
}

/// Query parameters embedded after the first `?` of a salt.
pub fn extract_params(salt: &str) -> BTreeMap<String, String> {
    match salt.split_once('?') {
        Some((_, query)) => form_urlencoded::parse(query.as_bytes())
            .into_owned()
            .collect(),
        None => BTreeMap::new(),
    }
}

fn encode_params(params: &BTreeMap<String, String>) -> String {
    form_urlencoded::Serializer::new(String::new())
        .extend_pairs(params.iter())
        .finish()
}
