//! Client-side brute force for [`Challenge`]s.
//!
//! Servers never call this on the request path; it exists for clients written
//! in Rust, demos and tests.

use std::sync::Arc;
use std::thread;
use std::time::Instant;

use flume::{Receiver, Sender};
use tracing::debug;

use crate::challenge::{Challenge, Payload};
use crate::error::Error;
use crate::work::{NonceSource, StopFlag};

fn target_digest(challenge: &Challenge) -> Option<Vec<u8>> {
    hex::decode(&challenge.challenge).ok()
}

#[inline]
fn is_answer(challenge: &Challenge, target: &[u8], number: u64) -> bool {
    challenge
        .algorithm
        .digest(&[challenge.salt.as_bytes(), number.to_string().as_bytes()])
        == target
}

/// Scan `0..=maxNumber` on the calling thread.
///
/// Returns `None` when no number in range hashes to the challenge.
pub fn solve(challenge: &Challenge) -> Option<Payload> {
    let started = Instant::now();
    let target = target_digest(challenge)?;
    (0..=challenge.max_number)
        .find(|n| is_answer(challenge, &target, *n))
        .map(|n| Payload::for_challenge(challenge, n, started.elapsed()))
}

/// Scan `0..=maxNumber` with `threads` workers pulling numbers from a shared counter.
pub fn solve_parallel(challenge: &Challenge, threads: usize) -> Result<Option<Payload>, Error> {
    if threads == 0 {
        return Err(Error::InvalidConfig("threads must be >= 1".into()));
    }
    let started = Instant::now();
    let Some(target) = target_digest(challenge) else {
        return Ok(None);
    };

    let shared = Arc::new((challenge.clone(), target));
    let numbers = Arc::new(NonceSource::new(0));
    let stop = Arc::new(StopFlag::new());
    let (tx, rx): (Sender<u64>, Receiver<u64>) = flume::bounded(threads);
    let mut joins = Vec::with_capacity(threads);

    for _ in 0..threads {
        let shared = shared.clone();
        let numbers = numbers.clone();
        let stop = stop.clone();
        let tx = tx.clone();
        joins.push(thread::spawn(move || {
            let (challenge, target) = &*shared;
            while !stop.should_stop() {
                let n = numbers.fetch();
                if n > challenge.max_number {
                    break;
                }
                if is_answer(challenge, target, n) {
                    stop.force_stop();
                    let _ = tx.send(n);
                    break;
                }
            }
        }));
    }
    drop(tx);

    let found = rx.recv().ok();
    stop.force_stop();
    for join in joins {
        join.join()
            .map_err(|_| Error::Internal("solver worker panicked".into()))?;
    }

    debug!(found = found.is_some(), threads, "parallel solve finished");
    Ok(found.map(|n| Payload::for_challenge(challenge, n, started.elapsed())))
}
