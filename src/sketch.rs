//! Count-min sketch whose cells can also be read and written by coordinate.
//!
//! The difficulty tracker keeps two sketches with identical geometry and folds
//! one into the other cell by cell, so besides the hashed `add`/`count` pair
//! the sketch exposes `cells`, `at` and `set_at`.

use crate::error::Error;

/// Largest grid the sketch will allocate (64 MiB of cells).
pub const MAX_CELLS: usize = 1 << 24;

/// Approximate multiset counter with `u32` saturating cells.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrequencySketch {
    counters: Vec<u32>,
    width: usize,
    depth: usize,
}

impl FrequencySketch {
    /// Size the grid for an additive error of `epsilon` (relative to the total
    /// count) holding with probability `1 - delta`.
    ///
    /// `width = ceil(e / epsilon)`, `depth = ceil(ln(1 / delta))`.
    pub fn new(epsilon: f64, delta: f64) -> Result<Self, Error> {
        let (width, depth) = Self::dimensions(epsilon, delta)?;
        Self::with_dimensions(width, depth)
    }

    /// `(width, depth)` for the given error bounds, without allocating.
    pub fn dimensions(epsilon: f64, delta: f64) -> Result<(usize, usize), Error> {
        if !(epsilon > 0.0 && epsilon < 1.0) {
            return Err(Error::InvalidConfig("epsilon must be in (0, 1)".into()));
        }
        if !(delta > 0.0 && delta < 1.0) {
            return Err(Error::InvalidConfig("delta must be in (0, 1)".into()));
        }
        let width = (std::f64::consts::E / epsilon).ceil() as usize;
        let depth = (1.0 / delta).ln().ceil() as usize;
        Ok((width, depth))
    }

    /// Build a sketch with an explicit geometry.
    pub fn with_dimensions(width: usize, depth: usize) -> Result<Self, Error> {
        if width == 0 || depth == 0 {
            return Err(Error::InvalidConfig(
                "sketch width and depth must be >= 1".into(),
            ));
        }
        if width > u32::MAX as usize {
            return Err(Error::InvalidConfig("sketch width exceeds u32".into()));
        }
        let len = width
            .checked_mul(depth)
            .filter(|&len| len <= MAX_CELLS)
            .ok_or_else(|| {
                Error::InvalidConfig(format!(
                    "sketch of {width}x{depth} exceeds {MAX_CELLS} cells"
                ))
            })?;
        Ok(Self {
            counters: vec![0; len],
            width,
            depth,
        })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Add `delta` to every cell `key` maps to, saturating at `u32::MAX`.
    pub fn add(&mut self, key: &[u8], delta: u32) {
        let (h1, h2) = hash_pair(key);
        for row in 0..self.depth {
            let col = self.column(h1, h2, row);
            let idx = row * self.width + col;
            self.counters[idx] = self.counters[idx].saturating_add(delta);
        }
    }

    /// Upper-bound estimate of the total added for `key`.
    pub fn count(&self, key: &[u8]) -> u32 {
        let (h1, h2) = hash_pair(key);
        (0..self.depth)
            .map(|row| self.counters[row * self.width + self.column(h1, h2, row)])
            .min()
            .unwrap_or(0)
    }

    pub fn reset(&mut self) {
        self.counters.fill(0);
    }

    /// Every `(row, column)` coordinate, row-major.
    pub fn cells(&self) -> impl Iterator<Item = (usize, usize)> {
        let width = self.width;
        (0..self.depth).flat_map(move |row| (0..width).map(move |col| (row, col)))
    }

    /// Value at a coordinate; out-of-range coordinates read as zero.
    pub fn at(&self, row: usize, col: usize) -> u32 {
        if col >= self.width {
            return 0;
        }
        self.counters
            .get(row * self.width + col)
            .copied()
            .unwrap_or(0)
    }

    /// Overwrite a cell; out-of-range coordinates are ignored.
    pub fn set_at(&mut self, row: usize, col: usize, value: u32) {
        if col >= self.width {
            return;
        }
        if let Some(cell) = self.counters.get_mut(row * self.width + col) {
            *cell = value;
        }
    }

    /// Whether `other` can be combined cell by cell with this sketch.
    pub fn same_geometry(&self, other: &Self) -> bool {
        self.width == other.width && self.depth == other.depth
    }

    #[inline]
    fn column(&self, h1: u32, h2: u32, row: usize) -> usize {
        (h1.wrapping_add((row as u32).wrapping_mul(h2)) % self.width as u32) as usize
    }
}

/// FNV-1a and Jenkins one-at-a-time, combined by double hashing.
fn hash_pair(key: &[u8]) -> (u32, u32) {
    let mut h1: u32 = 0x811c_9dc5;
    for &b in key {
        h1 ^= u32::from(b);
        h1 = h1.wrapping_mul(0x0100_0193);
    }

    let mut h2: u32 = 0;
    for &b in key {
        h2 = h2.wrapping_add(u32::from(b));
        h2 = h2.wrapping_add(h2 << 10);
        h2 ^= h2 >> 6;
    }
    h2 = h2.wrapping_add(h2 << 3);
    h2 ^= h2 >> 11;
    h2 = h2.wrapping_add(h2 << 15);

    (h1, h2)
}
