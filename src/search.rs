//! Exhaustive search over the 32-bit index space of one generator mask.
//!
//! Offline tooling uses this to enumerate the counters at which a
//! deterministic board satisfies some property ([`WindowProbe`] for
//! stateless per-counter tests, [`GleichProbe`] for runs that carry state
//! from draw to draw). The inclusive index range
//! `[index(start), limit]` is split into one contiguous partition per worker;
//! each worker drives its own [`Probe`] over its partition and forwards
//! matches through a bounded channel. Dropping the iterator raises a shared
//! stop flag and disconnects the channel, so workers exit on their next chunk
//! boundary or send attempt.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use flume::{Receiver, Sender};
use tracing::debug;

use crate::prng::{counter_of, Source};
use crate::work::StopFlag;

/// Candidates a worker scans between stop-flag checks.
const CHUNK: u32 = 4096;

/// Incremental scanner over a partition.
///
/// `next_match` consumes candidates starting at `src.counter` and returns
/// the next match whose starting index is `<= limit`. It returns `None` once
/// every candidate up to `limit` has been consumed, leaving `src.counter` at
/// the first unexamined candidate; a later call with a larger `limit` must
/// resume from there.
pub trait Probe: Send {
    type Item: Send;

    fn next_match(&mut self, src: &mut Source, limit: u32) -> Option<Self::Item>;
}

/// Tests the board that starts at each counter.
///
/// A board reads `window` consecutive draws; candidates whose board would
/// run past the end of the mask are skipped. Yields the starting counter.
#[derive(Debug, Clone)]
pub struct WindowProbe<F> {
    window: u32,
    mask: Option<u32>,
    predicate: F,
}

impl<F> WindowProbe<F>
where
    F: FnMut(&mut Source) -> bool + Send,
{
    pub fn new(window: u32, predicate: F) -> Self {
        Self {
            window: window.max(1),
            mask: None,
            predicate,
        }
    }
}

impl<F> Probe for WindowProbe<F>
where
    F: FnMut(&mut Source) -> bool + Send,
{
    type Item = u64;

    fn next_match(&mut self, src: &mut Source, limit: u32) -> Option<u64> {
        let last_start = u32::MAX - (self.window - 1);
        let limit = limit.min(last_start);
        let mask = *self.mask.get_or_insert(src.mask());
        loop {
            let start = src.counter;
            if src.mask() != mask || src.index() > limit {
                return None;
            }
            let hit = (self.predicate)(src);
            // The predicate may consume any number of draws; the next
            // candidate is always the following counter.
            src.seek(start.wrapping_add(1));
            if hit {
                return Some(start);
            }
        }
    }
}

/// Squares on a board.
pub const SQUARES: u32 = 48;
/// Colours a square can take.
pub const COLORS: u32 = 5;

/// Finds Gleich boards: [`SQUARES`] consecutive draws painted with at most
/// `max_colors` colour runs, where each draw is `next_below(COLORS)` and a
/// new run starts whenever the colour differs from the previous draw.
///
/// State carries over from one draw to the next, so the current run survives
/// across calls and chunk boundaries. When a draw would exceed `max_colors`,
/// the candidate board restarts at that draw. Each board is reported once,
/// as `(first counter, colour runs)`, when it reaches [`SQUARES`] draws.
#[derive(Debug, Clone)]
pub struct GleichProbe {
    max_colors: u32,
    mask: Option<u32>,
    run: Option<ColourRun>,
}

#[derive(Debug, Clone, Copy)]
struct ColourRun {
    start: u64,
    colors: u32,
    last: u32,
}

impl GleichProbe {
    pub fn new(max_colors: u32) -> Self {
        Self {
            max_colors: max_colors.max(1),
            mask: None,
            run: None,
        }
    }
}

impl Probe for GleichProbe {
    type Item = (u64, u32);

    fn next_match(&mut self, src: &mut Source, limit: u32) -> Option<(u64, u32)> {
        let mask = *self.mask.get_or_insert(src.mask());
        while src.mask() == mask && src.index() <= limit {
            let counter = src.counter;
            let color = src.next_below(COLORS);
            let run = match self.run {
                Some(run) if run.last == color => run,
                Some(run) if run.colors < self.max_colors => ColourRun {
                    colors: run.colors + 1,
                    last: color,
                    ..run
                },
                _ => ColourRun {
                    start: counter,
                    colors: 1,
                    last: color,
                },
            };
            self.run = Some(run);
            if counter - run.start + 1 == u64::from(SQUARES) {
                return Some((run.start, run.colors));
            }
        }
        None
    }
}

/// Split the inclusive index range `[first, last]` into at most `parts`
/// contiguous inclusive sub-ranges of near-equal size.
pub fn partitions(first: u32, last: u32, parts: usize) -> Vec<(u32, u32)> {
    if first > last || parts == 0 {
        return Vec::new();
    }
    let domain = u64::from(last) - u64::from(first) + 1;
    let parts = parts as u64;
    let workload = domain / parts;
    let rest = domain % parts;

    (0..parts)
        .filter_map(|i| {
            let len = workload + u64::from(i < rest);
            if len == 0 {
                return None;
            }
            let start = u64::from(first) + i * workload + i.min(rest);
            Some((start as u32, (start + len - 1) as u32))
        })
        .collect()
}

/// A restartable, lazily evaluated search.
///
/// Every call to [`iter`](Self::iter) starts from the configured source.
pub struct DomainSearch<F> {
    source: Source,
    limit: u32,
    workers: usize,
    factory: Arc<F>,
}

impl<F, P> DomainSearch<F>
where
    F: Fn() -> P + Send + Sync + 'static,
    P: Probe + 'static,
{
    /// Search from `source.counter` to the end of its mask with one worker per
    /// available core. `factory` builds a fresh probe per partition.
    pub fn new(source: Source, factory: F) -> Self {
        let workers = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            source,
            limit: u32::MAX,
            workers,
            factory: Arc::new(factory),
        }
    }

    /// Stop at this inclusive index instead of `0xFFFFFFFF`.
    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = limit;
        self
    }

    /// Override the number of workers (at least one).
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn source(&self) -> Source {
        self.source
    }

    pub fn iter(&self) -> Matches<P> {
        if self.workers == 1 {
            return Matches::Sequential {
                probe: (self.factory)(),
                src: self.source,
                limit: self.limit,
                done: self.source.index() > self.limit,
            };
        }

        let mask = self.source.mask();
        let ranges = partitions(self.source.index(), self.limit, self.workers);
        let stop = Arc::new(StopFlag::new());
        let (tx, rx): (Sender<P::Item>, Receiver<P::Item>) = flume::bounded(ranges.len().max(1));
        let mut joins = Vec::with_capacity(ranges.len());

        for (first, last) in ranges {
            let factory = self.factory.clone();
            let stop = stop.clone();
            let tx = tx.clone();
            let key = self.source.key;
            joins.push(thread::spawn(move || {
                let mut probe = factory();
                let mut src = Source::new(counter_of(mask, first), key);
                scan_partition(&mut probe, &mut src, first, last, &stop, &tx);
            }));
        }
        drop(tx);

        Matches::Parallel {
            rx: Some(rx),
            stop,
            joins,
        }
    }
}

impl<'a, F, P> IntoIterator for &'a DomainSearch<F>
where
    F: Fn() -> P + Send + Sync + 'static,
    P: Probe + 'static,
{
    type Item = P::Item;
    type IntoIter = Matches<P>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

fn scan_partition<P: Probe>(
    probe: &mut P,
    src: &mut Source,
    first: u32,
    last: u32,
    stop: &StopFlag,
    tx: &Sender<P::Item>,
) {
    debug!(first, last, "search worker started");
    let mut chunk_end = first.saturating_add(CHUNK - 1).min(last);
    loop {
        if stop.should_stop() {
            break;
        }
        match probe.next_match(src, chunk_end) {
            Some(item) => {
                if tx.send(item).is_err() {
                    break;
                }
            }
            None if chunk_end == last => break,
            None => chunk_end = chunk_end.saturating_add(CHUNK).min(last),
        }
    }
    debug!(first, last, stopped = stop.should_stop(), "search worker finished");
}

/// Iterator over search results.
///
/// Results from one partition arrive in ascending counter order; results
/// from different partitions interleave arbitrarily.
pub enum Matches<P: Probe> {
    Sequential {
        probe: P,
        src: Source,
        limit: u32,
        done: bool,
    },
    Parallel {
        rx: Option<Receiver<P::Item>>,
        stop: Arc<StopFlag>,
        joins: Vec<JoinHandle<()>>,
    },
}

impl<P: Probe> Iterator for Matches<P> {
    type Item = P::Item;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            Self::Sequential {
                probe,
                src,
                limit,
                done,
            } => {
                if *done {
                    return None;
                }
                let item = probe.next_match(src, *limit);
                if item.is_none() {
                    *done = true;
                }
                item
            }
            Self::Parallel { rx, .. } => rx.as_ref()?.recv().ok(),
        }
    }
}

impl<P: Probe> Drop for Matches<P> {
    fn drop(&mut self) {
        if let Self::Parallel { rx, stop, joins } = self {
            stop.force_stop();
            drop(rx.take());
            for join in joins.drain(..) {
                let _ = join.join();
            }
        }
    }
}
