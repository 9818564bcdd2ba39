//! Signed session cookies and the client-visible generator state they carry.
//!
//! The server keeps no session table: everything it needs to recognise a
//! returning client, including the generator mask and key that drive the
//! client's boards, travels in a [`crate::envelope`] token.

use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use base64::{
    engine::general_purpose::{STANDARD as BASE64, URL_SAFE_NO_PAD},
    Engine as _,
};
use hmac::{Hmac, Mac};
use http::header::COOKIE;
use http::HeaderMap;
use rand::rngs::OsRng;
use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::debug;
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::envelope;
use crate::error::{EnvelopeError, Error};
use crate::prng::{counter_of, KeyPool, Source};
use crate::time::{SystemTimeProvider, TimeProvider};

type HmacSha256 = Hmac<Sha256>;

/// 9999-12-31T23:59:59Z, the last instant an HTTP date can express.
const MAX_COOKIE_DATE: u64 = 253_402_300_799;

/// Generator state exposed to the client as `{"mask": .., "key": [hi, lo]}`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionRand {
    pub mask: u32,
    pub key: [u32; 2],
}

impl SessionRand {
    /// Random mask, key drawn from `pool`.
    pub fn new<R: Rng + ?Sized>(pool: &KeyPool, rng: &mut R) -> Self {
        let key = pool.choose(rng);
        Self {
            mask: rng.next_u32(),
            key: [(key >> 32) as u32, key as u32],
        }
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }

    pub fn key_u64(&self) -> u64 {
        (u64::from(self.key[0]) << 32) | u64::from(self.key[1])
    }

    /// Generator positioned at `offset` within this state's mask.
    pub fn source(&self, offset: u32) -> Source {
        Source::new(counter_of(self.mask, offset), self.key_u64())
    }

    fn mac(&self, secret: &[u8]) -> Result<Vec<u8>, Error> {
        if secret.is_empty() {
            return Err(Error::Internal("hmac secret is empty".into()));
        }
        let mut mac = HmacSha256::new_from_slice(secret)
            .map_err(|e| Error::Internal(format!("invalid hmac key: {e}")))?;
        mac.update(&self.mask.to_le_bytes());
        mac.update(&self.key[0].to_le_bytes());
        mac.update(&self.key[1].to_le_bytes());
        Ok(mac.finalize().into_bytes().to_vec())
    }

    /// Standard base64 HMAC-SHA256 over the little-endian mask and key words.
    pub fn signature(&self, secret: &[u8]) -> Result<String, Error> {
        Ok(BASE64.encode(self.mac(secret)?))
    }

    /// Whether `signature` was produced by [`signature`](Self::signature) under `secret`.
    pub fn matches(&self, signature: &str, secret: &[u8]) -> bool {
        let Ok(submitted) = BASE64.decode(signature) else {
            return false;
        };
        let Ok(expected) = self.mac(secret) else {
            return false;
        };
        bool::from(submitted.ct_eq(&expected))
    }
}

/// Contents of the session cookie.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionPayload {
    pub id: Uuid,
    /// Unix seconds.
    pub expires_at: u64,
    pub rand: SessionRand,
}

impl SessionPayload {
    /// Compact form of the id for log correlation.
    pub fn short_id(&self) -> String {
        URL_SAFE_NO_PAD
            .encode(self.id.as_bytes())
            .replace(['-', '_'], "")
    }
}

/// A session read back from a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub payload: SessionPayload,
    pub expired: bool,
}

pub struct SessionManager {
    config: SessionConfig,
    pool: KeyPool,
    clock: Arc<dyn TimeProvider>,
}

impl SessionManager {
    pub fn new(config: SessionConfig) -> Result<Self, Error> {
        Self::with_parts(config, KeyPool::default(), Arc::new(SystemTimeProvider))
    }

    pub fn with_parts(
        config: SessionConfig,
        pool: KeyPool,
        clock: Arc<dyn TimeProvider>,
    ) -> Result<Self, Error> {
        config.validate()?;
        Ok(Self {
            config,
            pool,
            clock,
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Renew `existing`, or start a new session if there is none or it expired.
    ///
    /// A live session keeps its id and generator state; the expiry always
    /// moves to `now + expiry`.
    pub fn issue(&self, existing: Option<&Session>) -> SessionPayload {
        let expires_at = self
            .clock
            .now_seconds()
            .saturating_add(self.config.expiry.as_secs());
        match existing {
            Some(session) if !session.expired => SessionPayload {
                expires_at,
                ..session.payload.clone()
            },
            _ => SessionPayload {
                id: Uuid::new_v4(),
                expires_at,
                rand: SessionRand::new(&self.pool, &mut OsRng),
            },
        }
    }

    /// Read the session cookie from `headers`.
    ///
    /// `Ok(None)` when no cookie is present. A cookie that fails
    /// authentication or decoding is an error; one that is merely past its
    /// expiry comes back with `expired` set.
    pub fn retrieve(&self, headers: &HeaderMap) -> Result<Option<Session>, EnvelopeError> {
        let Some(token) = find_cookie(headers, &self.config.cookie_name) else {
            return Ok(None);
        };
        let payload: SessionPayload = envelope::open(token, self.config.secret.as_bytes())?;
        let expired = payload.expires_at < self.clock.now_seconds();
        Ok(Some(Session { payload, expired }))
    }

    /// The live session on this request, if any.
    pub fn current(&self, headers: &HeaderMap) -> Option<SessionPayload> {
        match self.retrieve(headers) {
            Ok(Some(session)) if !session.expired => Some(session.payload),
            Ok(_) => None,
            Err(err) => {
                debug!(error = %err, "ignoring session cookie");
                None
            }
        }
    }

    /// Request label: `sess/<id>` (suffixed `+exp` once expired) for
    /// requests carrying a session, `anon/<random>` otherwise.
    pub fn request_label(&self, headers: &HeaderMap) -> String {
        match self.retrieve(headers) {
            Ok(Some(session)) => {
                let mut label = format!("sess/{}", session.payload.short_id());
                if session.expired {
                    label.push_str("+exp");
                }
                label
            }
            _ => {
                let mut id = [0u8; 8];
                OsRng.fill_bytes(&mut id);
                format!("anon/{}", URL_SAFE_NO_PAD.encode(id).replace(['-', '_'], ""))
            }
        }
    }

    /// `Set-Cookie` value carrying `payload`.
    pub fn cookie(&self, payload: &SessionPayload) -> Result<String, Error> {
        let expires = UNIX_EPOCH
            .checked_add(Duration::from_secs(payload.expires_at))
            .filter(|_| payload.expires_at <= MAX_COOKIE_DATE)
            .map(httpdate::fmt_http_date)
            .ok_or_else(|| {
                Error::Internal(format!(
                    "session expiry {} is past the last cookie date",
                    payload.expires_at
                ))
            })?;
        let token = envelope::seal(payload, self.config.secret.as_bytes())?;
        Ok(format!(
            "{}={token}; Expires={expires}; Secure; HttpOnly; SameSite=Strict",
            self.config.cookie_name
        ))
    }
}

fn find_cookie<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(k, _)| *k == name)
        .map(|(_, v)| v.trim_matches('"'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfigBuilder;
    use crate::time::ManualClock;
    use http::HeaderValue;

    const SECRET: &[u8] = b"session-secret";
    const NOW: u64 = 1_700_000_000;

    fn manager(clock: Arc<ManualClock>) -> SessionManager {
        let config = SessionConfigBuilder::default()
            .secret(SECRET)
            .expiry(Duration::from_secs(60))
            .build_validated()
            .unwrap();
        SessionManager::with_parts(config, KeyPool::default(), clock).unwrap()
    }

    fn headers_for(set_cookie: &str) -> HeaderMap {
        let pair = set_cookie.split(';').next().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(
            COOKIE,
            HeaderValue::from_str(&format!("theme=dark; {pair}; other=1")).unwrap(),
        );
        headers
    }

    #[test]
    fn rand_signature_is_stable_and_checked() {
        let rand = SessionRand {
            mask: 7,
            key: [0x4ed7_a2f3, 0xde96_273b],
        };
        let sig = rand.signature(SECRET).unwrap();
        assert_eq!(sig, rand.signature(SECRET).unwrap());
        assert!(rand.matches(&sig, SECRET));
        assert!(!rand.matches(&sig, b"other"));
        assert!(!rand.matches("not base64!", SECRET));

        let moved = SessionRand { mask: 8, ..rand };
        assert!(!moved.matches(&sig, SECRET));
        assert!(rand.signature(b"").is_err());
    }

    #[test]
    fn rand_json_shape() {
        let rand = SessionRand {
            mask: 3,
            key: [1, 2],
        };
        assert_eq!(
            serde_json::to_string(&rand).unwrap(),
            r#"{"mask":3,"key":[1,2]}"#
        );
    }

    #[test]
    fn rand_source_positions_counter() {
        let rand = SessionRand {
            mask: 0xdead_beef,
            key: [0x4ed7_a2f3, 0xde96_273b],
        };
        let src = rand.source(12);
        assert_eq!(src.counter, 0xdead_beef_0000_000c);
        assert_eq!(src.key, 0x4ed7_a2f3_de96_273b);
    }

    #[test]
    fn new_rand_uses_pool_key() {
        let pool = KeyPool::default();
        let rand = SessionRand::new(&pool, &mut OsRng);
        assert!((0..pool.len()).any(|i| pool.get(i) == Some(rand.key_u64())));
    }

    #[test]
    fn issue_then_retrieve() {
        let clock = Arc::new(ManualClock::new(NOW));
        let sessions = manager(clock.clone());

        let payload = sessions.issue(None);
        assert_eq!(payload.expires_at, NOW + 60);
        assert!(!payload.rand.is_zero());

        let cookie = sessions.cookie(&payload).unwrap();
        assert!(cookie.starts_with("session="));
        assert!(cookie.contains("; Secure; HttpOnly; SameSite=Strict"));
        assert!(cookie.contains("Expires=Tue, 14 Nov 2023 22:14:20 GMT"));

        let headers = headers_for(&cookie);
        let session = sessions.retrieve(&headers).unwrap().unwrap();
        assert_eq!(session.payload, payload);
        assert!(!session.expired);
        assert_eq!(sessions.current(&headers), Some(payload.clone()));
        assert_eq!(
            sessions.request_label(&headers),
            format!("sess/{}", payload.short_id())
        );

        clock.advance(61);
        let session = sessions.retrieve(&headers).unwrap().unwrap();
        assert!(session.expired);
        assert_eq!(sessions.current(&headers), None);
        assert!(sessions.request_label(&headers).ends_with("+exp"));
    }

    #[test]
    fn cookie_refuses_dates_past_year_9999() {
        let sessions = manager(Arc::new(ManualClock::new(NOW)));
        let mut payload = sessions.issue(None);

        payload.expires_at = MAX_COOKIE_DATE;
        let cookie = sessions.cookie(&payload).unwrap();
        assert!(cookie.contains("Expires=Fri, 31 Dec 9999 23:59:59 GMT"));

        payload.expires_at = NOW + 400_000_000_000;
        assert!(matches!(sessions.cookie(&payload), Err(Error::Internal(_))));
        payload.expires_at = u64::MAX;
        assert!(matches!(sessions.cookie(&payload), Err(Error::Internal(_))));
    }

    #[test]
    fn renewal_keeps_live_identity_only() {
        let clock = Arc::new(ManualClock::new(NOW));
        let sessions = manager(clock.clone());
        let first = sessions.issue(None);

        clock.advance(30);
        let live = Session {
            payload: first.clone(),
            expired: false,
        };
        let renewed = sessions.issue(Some(&live));
        assert_eq!(renewed.id, first.id);
        assert_eq!(renewed.rand, first.rand);
        assert_eq!(renewed.expires_at, NOW + 90);

        let stale = Session {
            payload: first.clone(),
            expired: true,
        };
        assert_ne!(sessions.issue(Some(&stale)).id, first.id);
    }

    #[test]
    fn missing_and_forged_cookies() {
        let sessions = manager(Arc::new(ManualClock::new(NOW)));
        assert_eq!(sessions.retrieve(&HeaderMap::new()).unwrap(), None);
        assert!(sessions
            .request_label(&HeaderMap::new())
            .starts_with("anon/"));

        let forged = envelope::seal(&sessions.issue(None), b"attacker").unwrap();
        let headers = headers_for(&format!("session={forged}"));
        assert_eq!(
            sessions.retrieve(&headers).unwrap_err(),
            EnvelopeError::Invalid
        );
        assert_eq!(sessions.current(&headers), None);
    }
}
