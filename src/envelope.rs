//! HMAC-signed binary tokens: `base64url(data) "." base64url(hmac(data))`.
//!
//! Opening a token is split in two phases. [`verify`] authenticates the bytes
//! and only hands back a [`Verified`] on success; deserialisation is only
//! reachable through [`Verified::decode`], so untrusted bytes never reach the
//! decoder.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use hmac::{Hmac, Mac};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::Sha256;

use crate::error::EnvelopeError;

type HmacSha256 = Hmac<Sha256>;

/// Serialise `payload` and sign it.
pub fn seal<T: Serialize>(payload: &T, secret: &[u8]) -> Result<String, EnvelopeError> {
    let data = bincode::serialize(payload).map_err(|e| EnvelopeError::Encode(e.to_string()))?;
    seal_bytes(&data, secret)
}

/// Sign already-encoded bytes.
pub fn seal_bytes(data: &[u8], secret: &[u8]) -> Result<String, EnvelopeError> {
    if secret.is_empty() {
        return Err(EnvelopeError::Encode("hmac secret is empty".into()));
    }
    let mut mac =
        HmacSha256::new_from_slice(secret).map_err(|e| EnvelopeError::Encode(e.to_string()))?;
    mac.update(data);
    let signature = mac.finalize().into_bytes();

    let mut token = URL_SAFE_NO_PAD.encode(data);
    token.push('.');
    token.push_str(&URL_SAFE_NO_PAD.encode(signature));
    Ok(token)
}

/// Bytes whose signature has been checked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verified {
    data: Vec<u8>,
}

impl Verified {
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, EnvelopeError> {
        bincode::deserialize(&self.data).map_err(|e| EnvelopeError::Decode(e.to_string()))
    }
}

/// Authenticate a token without interpreting its payload.
pub fn verify(token: &str, secret: &[u8]) -> Result<Verified, EnvelopeError> {
    if secret.is_empty() {
        return Err(EnvelopeError::Invalid);
    }
    let (data, signature) = token.split_once('.').ok_or(EnvelopeError::Invalid)?;
    let data = URL_SAFE_NO_PAD
        .decode(data)
        .map_err(|_| EnvelopeError::Invalid)?;
    let signature = URL_SAFE_NO_PAD
        .decode(signature)
        .map_err(|_| EnvelopeError::Invalid)?;

    let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| EnvelopeError::Invalid)?;
    mac.update(&data);
    mac.verify_slice(&signature)
        .map_err(|_| EnvelopeError::Invalid)?;

    Ok(Verified { data })
}

/// Authenticate then decode.
pub fn open<T: DeserializeOwned>(token: &str, secret: &[u8]) -> Result<T, EnvelopeError> {
    verify(token, secret)?.decode()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde::Deserialize;

    const SECRET: &[u8] = b"envelope-secret";

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Sample {
        id: [u8; 16],
        expires_at: u64,
        note: String,
        tags: Vec<u32>,
        parent: Option<u64>,
    }

    fn sample() -> Sample {
        Sample {
            id: [7; 16],
            expires_at: 1_700_000_000,
            note: "hello".into(),
            tags: vec![1, 2, 3],
            parent: None,
        }
    }

    #[test]
    fn round_trip() {
        let token = seal(&sample(), SECRET).unwrap();
        let out: Sample = open(&token, SECRET).unwrap();
        assert_eq!(out, sample());
    }

    #[test]
    fn token_shape_is_two_url_safe_parts() {
        let token = seal(&sample(), SECRET).unwrap();
        let (data, sig) = token.split_once('.').unwrap();
        assert!(!sig.contains('.'));
        assert_eq!(URL_SAFE_NO_PAD.decode(sig).unwrap().len(), 32);
        assert!(!data.contains('=') && !data.contains('+') && !data.contains('/'));
    }

    #[test]
    fn other_secret_fails() {
        let token = seal(&sample(), SECRET).unwrap();
        assert_eq!(
            open::<Sample>(&token, b"other").unwrap_err(),
            EnvelopeError::Invalid
        );
    }

    #[test]
    fn every_truncation_fails_without_panic() {
        let token = seal(&sample(), SECRET).unwrap();
        for end in 0..token.len() {
            assert!(verify(&token[..end], SECRET).is_err(), "prefix {end} accepted");
        }
    }

    #[test]
    fn every_byte_mutation_fails() {
        let token = seal(&sample(), SECRET).unwrap();
        for i in 0..token.len() {
            let mut bytes = token.clone().into_bytes();
            bytes[i] = if bytes[i] == b'A' { b'B' } else { b'A' };
            let Ok(mutated) = String::from_utf8(bytes) else {
                continue;
            };
            if mutated == token {
                continue;
            }
            assert!(verify(&mutated, SECRET).is_err(), "mutation at {i} accepted");
        }
    }

    #[test]
    fn missing_separator_and_empty_secret_fail() {
        assert_eq!(verify("abc", SECRET).unwrap_err(), EnvelopeError::Invalid);
        let token = seal(&sample(), SECRET).unwrap();
        assert_eq!(verify(&token, b"").unwrap_err(), EnvelopeError::Invalid);
        assert!(matches!(seal(&sample(), b""), Err(EnvelopeError::Encode(_))));
    }

    #[test]
    fn authenticated_but_wrong_shape_is_decode_error() {
        let token = seal_bytes(&[1, 2], SECRET).unwrap();
        let verified = verify(&token, SECRET).unwrap();
        assert_eq!(verified.as_bytes(), &[1, 2]);
        assert!(matches!(
            verified.decode::<Sample>(),
            Err(EnvelopeError::Decode(_))
        ));
    }

    proptest! {
        #[test]
        fn arbitrary_payloads_round_trip(
            id in any::<[u8; 16]>(),
            expires_at in any::<u64>(),
            note in ".*",
            tags in proptest::collection::vec(any::<u32>(), 0..16),
            parent in any::<Option<u64>>(),
        ) {
            let value = Sample { id, expires_at, note, tags, parent };
            let token = seal(&value, SECRET).unwrap();
            prop_assert_eq!(open::<Sample>(&token, SECRET).unwrap(), value);
        }
    }
}
