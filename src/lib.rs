//! Adaptive proof-of-work gating.
//!
//! - [`sketch`] and [`difficulty`] turn per-client request counts into a
//!   slowly decaying difficulty score.
//! - [`challenge`] mints and verifies stateless hash challenges; [`gate`]
//!   wraps a request handler with the full issue/verify handshake.
//! - [`envelope`] signs arbitrary serialisable payloads; [`session`] uses it
//!   for cookies carrying the client's generator state.
//! - [`prng`] is a keyed, seekable counter-based generator and [`search`]
//!   scans its counter space in parallel.

pub mod challenge;
pub mod config;
pub mod difficulty;
pub mod envelope;
pub mod error;
pub mod gate;
#[cfg(feature = "replay-cache")]
pub mod replay;
pub mod prng;
pub mod search;
pub mod session;
pub mod sketch;
pub mod solver;
pub mod time;
pub mod work;

pub use challenge::{
    create_challenge, verify_solution, verify_solution_with, Algorithm, Challenge,
    ChallengeOptions, ChallengeOptionsBuilder, Payload,
};
pub use config::{
    GateConfig, GateConfigBuilder, ResourceMatch, ServerSecret, SessionConfig,
    SessionConfigBuilder, TrackerConfig, TrackerConfigBuilder,
};
pub use difficulty::{DecayStats, DifficultyTracker};
pub use error::{EnvelopeError, Error, GateError, VerifyError};
pub use gate::{ChallengeGate, ClientIdentity, Decision, Exemption, ForwardedFor, SessionExempt};
pub use prng::{KeyPool, Source};
#[cfg(feature = "replay-cache")]
pub use replay::{MokaReplayCache, ReplayCache};
pub use search::{DomainSearch, GleichProbe, Matches, Probe, WindowProbe};
pub use session::{Session, SessionManager, SessionPayload, SessionRand};
pub use sketch::FrequencySketch;
pub use time::{ManualClock, SystemTimeProvider, TimeProvider};
