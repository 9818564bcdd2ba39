//! Per-client difficulty scores derived from request frequency.
//!
//! Two sketches of identical geometry live behind one mutex: `requests`
//! counts challenge issuances in the current window, `difficulty` holds the
//! long-lived score. Once per window the decay cycle folds the first into the
//! second cell by cell and clears `requests`.

use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::TrackerConfig;
use crate::error::Error;
use crate::sketch::FrequencySketch;

#[derive(Debug)]
struct Sketches {
    requests: FrequencySketch,
    difficulty: FrequencySketch,
}

/// Outcome of one decay cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecayStats {
    /// Cells whose request count exceeded the free allowance.
    pub raised: usize,
    /// Cells whose score went down.
    pub lowered: usize,
}

#[derive(Debug)]
pub struct DifficultyTracker {
    config: TrackerConfig,
    state: Mutex<Sketches>,
}

impl DifficultyTracker {
    pub fn new(config: TrackerConfig) -> Result<Self, Error> {
        config.validate()?;
        let requests = FrequencySketch::new(config.epsilon, config.delta)?;
        let difficulty = requests.clone();
        Ok(Self {
            config,
            state: Mutex::new(Sketches {
                requests,
                difficulty,
            }),
        })
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    // Sketch contents are valid after any partial update, so a poisoned lock
    // is still usable.
    fn lock(&self) -> MutexGuard<'_, Sketches> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record one observation for `client` and return its current score.
    pub fn observe(&self, client: &[u8]) -> u32 {
        let mut state = self.lock();
        state.requests.add(client, self.config.observation_weight);
        state.difficulty.count(client)
    }

    /// Current score without recording anything.
    pub fn score(&self, client: &[u8]) -> u32 {
        self.lock().difficulty.count(client)
    }

    /// Run one decay cycle.
    ///
    /// For each cell with `r` requests and score `d`:
    /// - `r <= decay`: `d = (d + r) - decay`, saturating both ways
    /// - otherwise: `d = d + min(growth^(r - decay), u32::MAX)`, saturating
    pub fn decay(&self) -> DecayStats {
        let allowance = self.config.decay;
        let growth = self.config.growth;
        let mut stats = DecayStats::default();

        let mut guard = self.lock();
        let state = &mut *guard;
        for (row, col) in state.requests.cells() {
            let reqs = state.requests.at(row, col);
            let score = state.difficulty.at(row, col);
            let next = fold(allowance, growth, score, reqs);
            if next > score {
                stats.raised += 1;
            } else if next < score {
                stats.lowered += 1;
            }
            state.difficulty.set_at(row, col, next);
        }
        state.requests.reset();
        drop(guard);

        debug!(raised = stats.raised, lowered = stats.lowered, "difficulty decay cycle");
        stats
    }

    /// Run [`decay`](Self::decay) once per window until `shutdown` resolves.
    ///
    /// The host keeps this running for the lifetime of the service.
    pub async fn run_decay_loop<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let window = self.config.window;
        let Some(first_tick) = Instant::now().checked_add(window) else {
            warn!(window_secs = window.as_secs(), "decay window out of range, loop not started");
            return;
        };
        let mut ticker = interval_at(first_tick, window);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        info!(window_secs = window.as_secs_f64(), "difficulty decay loop started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.decay();
                }
                _ = &mut shutdown => break,
            }
        }
        info!("difficulty decay loop stopped");
    }
}

fn fold(allowance: u32, growth: f64, score: u32, reqs: u32) -> u32 {
    if reqs <= allowance {
        score.saturating_add(reqs).saturating_sub(allowance)
    } else {
        score.saturating_add(bump(growth, reqs - allowance))
    }
}

fn bump(growth: f64, excess: u32) -> u32 {
    let v = growth.powf(f64::from(excess));
    if v.is_finite() && v < f64::from(u32::MAX) {
        v as u32
    } else {
        u32::MAX
    }
}
