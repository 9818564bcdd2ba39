//! Request gate that demands a solved challenge before calling the wrapped handler.
//!
//! A request without the challenge header gets a fresh [`Challenge`] sized to
//! the caller's difficulty score. A request carrying a solution is verified
//! statelessly and, on success, handed to the downstream handler.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use http::header::{HeaderName, CONTENT_TYPE};
use http::request::Parts;
use http::{HeaderValue, Request, Response, StatusCode};
use serde_json::json;
use tracing::{debug, info, warn};

#[cfg(feature = "replay-cache")]
use crate::challenge::PARAM_EXPIRES;
use crate::challenge::{
    create_challenge, verify_solution_with, Challenge, ChallengeOptionsBuilder, Payload,
    PARAM_RESOURCE,
};
use crate::config::GateConfig;
use crate::difficulty::DifficultyTracker;
use crate::error::{Error, GateError, VerifyError};
#[cfg(feature = "replay-cache")]
use crate::replay::ReplayCache;
use crate::session::SessionManager;
use crate::time::{SystemTimeProvider, TimeProvider};

/// Derives the byte string a request is rate-scored under.
pub trait ClientIdentity: Send + Sync {
    fn identify(&self, parts: &Parts) -> Result<Vec<u8>, Error>;
}

impl<F> ClientIdentity for F
where
    F: Fn(&Parts) -> Result<Vec<u8>, Error> + Send + Sync,
{
    fn identify(&self, parts: &Parts) -> Result<Vec<u8>, Error> {
        self(parts)
    }
}

/// Lets some requests through without a challenge.
pub trait Exemption: Send + Sync {
    fn is_exempt(&self, parts: &Parts) -> bool;
}

impl<F> Exemption for F
where
    F: Fn(&Parts) -> bool + Send + Sync,
{
    fn is_exempt(&self, parts: &Parts) -> bool {
        self(parts)
    }
}

/// Nobody is exempt.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoExemption;

impl Exemption for NoExemption {
    fn is_exempt(&self, _parts: &Parts) -> bool {
        false
    }
}

/// Identity from the rightmost non-private address in `X-Forwarded-For`.
///
/// Only sound behind a proxy that appends the peer address to the header.
/// The identity is the raw address octets (4 or 16 bytes).
#[derive(Debug, Clone, Copy, Default)]
pub struct ForwardedFor;

impl ClientIdentity for ForwardedFor {
    fn identify(&self, parts: &Parts) -> Result<Vec<u8>, Error> {
        rightmost_public_ip(parts)
            .map(|ip| match ip {
                IpAddr::V4(v4) => v4.octets().to_vec(),
                IpAddr::V6(v6) => v6.octets().to_vec(),
            })
            .ok_or_else(|| Error::Internal("no client address in x-forwarded-for".into()))
    }
}

fn rightmost_public_ip(parts: &Parts) -> Option<IpAddr> {
    let values: Vec<&str> = parts
        .headers
        .get_all("x-forwarded-for")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .collect();
    values
        .into_iter()
        .rev()
        .filter_map(parse_forwarded_ip)
        .find(|ip| !is_private(ip))
}

fn parse_forwarded_ip(raw: &str) -> Option<IpAddr> {
    let raw = raw.trim();
    raw.parse::<IpAddr>()
        .ok()
        .or_else(|| raw.parse::<SocketAddr>().ok().map(|s| s.ip()))
        .or_else(|| {
            raw.strip_prefix('[')
                .and_then(|r| r.strip_suffix(']'))
                .and_then(|r| r.parse().ok())
        })
}

fn is_private(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let [a, b, ..] = v4.octets();
            v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_unspecified()
                || (a == 100 && (b & 0xc0) == 64)
        }
        IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return is_private(&IpAddr::V4(mapped));
            }
            let first = v6.segments()[0];
            v6.is_loopback()
                || v6.is_unspecified()
                || (first & 0xfe00) == 0xfc00
                || (first & 0xffc0) == 0xfe80
        }
    }
}

/// Exempts requests carrying a live session cookie.
pub struct SessionExempt(pub Arc<SessionManager>);

impl Exemption for SessionExempt {
    fn is_exempt(&self, parts: &Parts) -> bool {
        self.0.current(&parts.headers).is_some()
    }
}

/// What the gate decided for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Call the downstream handler.
    Pass,
    /// Answer with this challenge instead.
    Challenge(Challenge),
}

pub struct ChallengeGate {
    config: GateConfig,
    header: HeaderName,
    tracker: Arc<DifficultyTracker>,
    identity: Box<dyn ClientIdentity>,
    exempt: Box<dyn Exemption>,
    clock: Arc<dyn TimeProvider>,
    #[cfg(feature = "replay-cache")]
    replay: Option<Arc<dyn ReplayCache>>,
}

impl ChallengeGate {
    /// Gate scoring clients by [`ForwardedFor`] with no exemptions.
    pub fn new(config: GateConfig, tracker: Arc<DifficultyTracker>) -> Result<Self, Error> {
        config.validate()?;
        let header = HeaderName::from_bytes(config.header.as_bytes())
            .map_err(|e| Error::InvalidConfig(format!("header: {e}")))?;
        Ok(Self {
            config,
            header,
            tracker,
            identity: Box::new(ForwardedFor),
            exempt: Box::new(NoExemption),
            clock: Arc::new(SystemTimeProvider),
            #[cfg(feature = "replay-cache")]
            replay: None,
        })
    }

    pub fn identity(mut self, identity: impl ClientIdentity + 'static) -> Self {
        self.identity = Box::new(identity);
        self
    }

    pub fn exempt(mut self, exempt: impl Exemption + 'static) -> Self {
        self.exempt = Box::new(exempt);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn TimeProvider>) -> Self {
        self.clock = clock;
        self
    }

    /// Refuse a second use of the same solved challenge.
    #[cfg(feature = "replay-cache")]
    pub fn replay_cache(mut self, cache: Arc<dyn ReplayCache>) -> Self {
        self.replay = Some(cache);
        self
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    pub fn tracker(&self) -> &Arc<DifficultyTracker> {
        &self.tracker
    }

    /// Mint a challenge for `client` bound to `resource`.
    ///
    /// Each call counts as one observation of `client`, and `maxNumber` is
    /// the base difficulty plus the client's current score.
    pub fn issue(&self, client: &[u8], resource: &str) -> Result<Challenge, Error> {
        self.config.secret.ensure_present()?;
        let score = self.tracker.observe(client);
        let max_number = self.config.base_difficulty.saturating_add(u64::from(score));
        let expires = self
            .clock
            .now_seconds()
            .saturating_add(self.config.expiry.as_secs());

        let options = ChallengeOptionsBuilder::default()
            .algorithm(self.config.algorithm)
            .max_number(max_number)
            .salt_len(self.config.salt_len)
            .secret(self.config.secret.as_bytes())
            .expires(expires)
            .param(PARAM_RESOURCE, resource)
            .build_validated()?;
        let challenge = create_challenge(options)?;

        debug!(score, max_number, resource, "challenge issued");
        Ok(challenge)
    }

    /// Check a submitted solution for `resource`.
    pub fn verify(&self, payload: &Payload, resource: &str) -> Result<(), VerifyError> {
        let params = payload.params();
        let bound = params.get(PARAM_RESOURCE).map(String::as_str).unwrap_or("");
        if !self.config.resource_match.matches(bound, resource) {
            return Err(VerifyError::WrongSolution);
        }

        verify_solution_with(payload, self.config.secret.as_bytes(), true, &*self.clock)?;

        #[cfg(feature = "replay-cache")]
        if let Some(replay) = &self.replay {
            let expires = params
                .get(PARAM_EXPIRES)
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(0);
            if !replay.insert_if_absent(&payload.signature, expires, self.clock.now_seconds()) {
                return Err(VerifyError::WrongSolution);
            }
        }
        Ok(())
    }

    /// Decide what to do with a request.
    pub fn evaluate(&self, parts: &Parts) -> Result<Decision, GateError> {
        if self.exempt.is_exempt(parts) {
            return Ok(Decision::Pass);
        }
        let resource = parts.uri.path();

        // An empty header is the same as no header.
        let submitted = parts
            .headers
            .get(&self.header)
            .filter(|v| !v.as_bytes().iter().all(u8::is_ascii_whitespace));
        let Some(encoded) = submitted else {
            let client = self.identity.identify(parts)?;
            return Ok(Decision::Challenge(self.issue(&client, resource)?));
        };

        let encoded = encoded
            .to_str()
            .map_err(|e| VerifyError::MalformedInput(format!("header: {e}")))?;
        let payload = Payload::from_header(encoded)?;
        self.verify(&payload, resource)?;
        Ok(Decision::Pass)
    }

    /// Wrap `next` so it only runs for exempt requests or verified solutions.
    ///
    /// Challenges go out as `application/json`; failures as
    /// `application/problem+json` with the status from [`GateError::status_code`].
    pub fn with_challenge<B, F>(self: Arc<Self>, next: F) -> impl Fn(Request<B>) -> Response<String>
    where
        F: Fn(Request<B>) -> Response<String>,
    {
        move |req: Request<B>| {
            let (parts, body) = req.into_parts();
            match self.evaluate(&parts) {
                Ok(Decision::Pass) => next(Request::from_parts(parts, body)),
                Ok(Decision::Challenge(challenge)) => match serde_json::to_string(&challenge) {
                    Ok(body) => respond(StatusCode::OK, "application/json", body),
                    Err(e) => problem(&GateError::Internal(Error::Internal(e.to_string()))),
                },
                Err(err) => {
                    if err.status_code().is_server_error() {
                        warn!(error = %err, path = parts.uri.path(), "challenge gate failure");
                    } else {
                        info!(error = %err, path = parts.uri.path(), "challenge rejected");
                    }
                    problem(&err)
                }
            }
        }
    }
}

fn respond(status: StatusCode, content_type: &'static str, body: String) -> Response<String> {
    let mut res = Response::new(body);
    *res.status_mut() = status;
    res.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    res
}

/// RFC 9457 problem document; internal details stay in the logs.
fn problem(err: &GateError) -> Response<String> {
    let status = err.status_code();
    let body = json!({
        "type": "about:blank",
        "title": status.canonical_reason().unwrap_or("Error"),
        "status": status.as_u16(),
        "detail": err.public_detail(),
    });
    respond(status, "application/problem+json", body.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GateConfigBuilder, ResourceMatch, TrackerConfigBuilder};
    use crate::solver::solve;
    use crate::time::ManualClock;

    const SECRET: &[u8] = b"gate-secret";
    const NOW: u64 = 1_700_000_000;

    fn tracker() -> Arc<DifficultyTracker> {
        Arc::new(
            DifficultyTracker::new(
                TrackerConfigBuilder::default()
                    .epsilon(0.01)
                    .delta(0.01)
                    .build_validated()
                    .unwrap(),
            )
            .unwrap(),
        )
    }

    fn gate_with(matching: ResourceMatch) -> (ChallengeGate, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(NOW));
        let config = GateConfigBuilder::default()
            .secret(SECRET)
            .base_difficulty(500)
            .resource_match(matching)
            .build_validated()
            .unwrap();
        let gate = ChallengeGate::new(config, tracker())
            .unwrap()
            .clock(clock.clone());
        (gate, clock)
    }

    fn parts(path: &str, headers: &[(&str, &str)]) -> Parts {
        let mut builder = Request::builder().uri(path);
        for (k, v) in headers {
            builder = builder.header(*k, *v);
        }
        builder.body(()).unwrap().into_parts().0
    }

    fn challenge_for(gate: &ChallengeGate, path: &str) -> Challenge {
        match gate
            .evaluate(&parts(path, &[("x-forwarded-for", "203.0.113.7")]))
            .unwrap()
        {
            Decision::Challenge(c) => c,
            Decision::Pass => panic!("expected a challenge"),
        }
    }

    #[test]
    fn forwarded_for_takes_rightmost_public_address() {
        let id = ForwardedFor
            .identify(&parts(
                "/",
                &[("x-forwarded-for", "198.51.100.1, 203.0.113.9, 10.0.0.3, 127.0.0.1")],
            ))
            .unwrap();
        assert_eq!(id, vec![203, 0, 113, 9]);

        let id = ForwardedFor
            .identify(&parts(
                "/",
                &[
                    ("x-forwarded-for", "2001:db8::1"),
                    ("x-forwarded-for", "[fd00::1]:443, 192.168.1.1:8080"),
                ],
            ))
            .unwrap();
        assert_eq!(id.len(), 16);

        assert!(ForwardedFor
            .identify(&parts("/", &[("x-forwarded-for", "10.1.1.1, 100.64.0.1")]))
            .is_err());
        assert!(ForwardedFor.identify(&parts("/", &[])).is_err());
    }

    #[test]
    fn challenge_is_bound_to_path_and_expiry() {
        let (gate, _) = gate_with(ResourceMatch::Exact);
        let ch = challenge_for(&gate, "/session");
        assert_eq!(ch.max_number, 500);
        assert!(ch.salt.contains("expires=1700000010"));
        assert!(ch.salt.ends_with("resource=%2Fsession"));
    }

    #[test]
    fn empty_solution_header_gets_a_challenge() {
        let (gate, _) = gate_with(ResourceMatch::Exact);
        for empty in ["", "  "] {
            let decision = gate
                .evaluate(&parts(
                    "/session",
                    &[("x-forwarded-for", "203.0.113.7"), ("x-pow-challenge", empty)],
                ))
                .unwrap();
            assert!(matches!(decision, Decision::Challenge(_)));
        }
    }

    #[test]
    fn difficulty_grows_with_traffic() {
        let (gate, _) = gate_with(ResourceMatch::Exact);
        for _ in 0..200 {
            challenge_for(&gate, "/session");
        }
        gate.tracker().decay();
        let ch = challenge_for(&gate, "/session");
        assert!(ch.max_number > 500);
    }

    #[test]
    fn solved_challenge_passes_once_per_path() {
        let (gate, clock) = gate_with(ResourceMatch::Exact);
        let ch = challenge_for(&gate, "/session");
        let payload = solve(&ch).unwrap();
        let header = payload.to_header().unwrap();

        let ok = gate.evaluate(&parts("/session", &[("x-pow-challenge", header.as_str())]));
        assert_eq!(ok.unwrap(), Decision::Pass);

        let elsewhere = gate
            .evaluate(&parts("/share", &[("x-pow-challenge", header.as_str())]))
            .unwrap_err();
        assert_eq!(elsewhere, GateError::Verify(VerifyError::WrongSolution));
        assert_eq!(elsewhere.status_code(), StatusCode::UNAUTHORIZED);

        clock.advance(11);
        let late = gate
            .evaluate(&parts("/session", &[("x-pow-challenge", header.as_str())]))
            .unwrap_err();
        assert_eq!(
            late,
            GateError::Verify(VerifyError::Expired { overshoot_secs: 1 })
        );
    }

    #[test]
    fn trailing_slash_policy() {
        let (gate, _) = gate_with(ResourceMatch::IgnoreTrailingSlash);
        let ch = challenge_for(&gate, "/session/");
        let header = solve(&ch).unwrap().to_header().unwrap();
        assert_eq!(
            gate.evaluate(&parts("/session", &[("x-pow-challenge", header.as_str())]))
                .unwrap(),
            Decision::Pass
        );
    }

    #[test]
    fn malformed_header_is_bad_request() {
        let (gate, _) = gate_with(ResourceMatch::Exact);
        let err = gate
            .evaluate(&parts("/session", &[("x-pow-challenge", "%%%")]))
            .unwrap_err();
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn exempt_requests_skip_everything() {
        let (gate, _) = gate_with(ResourceMatch::Exact);
        let gate = gate.exempt(|p: &Parts| p.headers.contains_key("x-trusted"));
        let decision = gate
            .evaluate(&parts("/session", &[("x-trusted", "1"), ("x-pow-challenge", "junk")]))
            .unwrap();
        assert_eq!(decision, Decision::Pass);
    }

    #[test]
    fn middleware_writes_json_and_problems() {
        let (gate, _) = gate_with(ResourceMatch::Exact);
        let handler = Arc::new(gate).with_challenge(|_req: Request<()>| Response::new("hello".to_owned()));

        let req = |headers: &[(&str, &str)]| {
            let mut b = Request::builder().uri("/session");
            for (k, v) in headers {
                b = b.header(*k, *v);
            }
            b.body(()).unwrap()
        };

        let res = handler(req(&[("x-forwarded-for", "203.0.113.7")]));
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.headers()[CONTENT_TYPE], "application/json");
        let ch: Challenge = serde_json::from_str(res.body()).unwrap();

        let header = solve(&ch).unwrap().to_header().unwrap();
        let res = handler(req(&[("x-pow-challenge", header.as_str())]));
        assert_eq!(res.body(), "hello");

        let res = handler(req(&[]));
        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body: serde_json::Value = serde_json::from_str(res.body()).unwrap();
        assert_eq!(body["detail"], "internal server error");

        let mut wrong = solve(&ch).unwrap();
        wrong.number += 1;
        let res = handler(req(&[("x-pow-challenge", wrong.to_header().unwrap().as_str())]));
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(res.headers()[CONTENT_TYPE], "application/problem+json");
        let body: serde_json::Value = serde_json::from_str(res.body()).unwrap();
        assert_eq!(body["status"], 401);
        assert_eq!(body["detail"], "incorrect challenge response");
    }

    #[cfg(feature = "replay-cache")]
    #[test]
    fn replay_cache_makes_solutions_single_use() {
        use crate::replay::MokaReplayCache;

        let (gate, _) = gate_with(ResourceMatch::Exact);
        let gate = gate.replay_cache(Arc::new(MokaReplayCache::new(64)));
        let header = solve(&challenge_for(&gate, "/session"))
            .unwrap()
            .to_header()
            .unwrap();
        let p = parts("/session", &[("x-pow-challenge", header.as_str())]);
        assert_eq!(gate.evaluate(&p).unwrap(), Decision::Pass);
        assert_eq!(
            gate.evaluate(&p).unwrap_err(),
            GateError::Verify(VerifyError::WrongSolution)
        );
    }
}
