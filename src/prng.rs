//! Keyed counter-based generator in the style of Widynski's "Squares".
//!
//! The output at any counter is a pure function of `(counter, key)`, so a
//! generator can be resumed from a stored `(key, counter)` pair or seeked to
//! an arbitrary position in O(1). The high 32 bits of the counter select an
//! independent stream (the "mask"), the low 32 bits index into it.

use rand::{Rng, RngCore};

use crate::error::Error;

/// Four squaring rounds over `counter * key`.
#[inline]
pub const fn mix(counter: u64, key: u64) -> u64 {
    let y = counter.wrapping_mul(key);
    let z = y.wrapping_add(key);

    let mut x = y.wrapping_mul(y).wrapping_add(y).rotate_right(32);
    x = x.wrapping_mul(x).wrapping_add(z).rotate_right(32);
    x = x.wrapping_mul(x).wrapping_add(y).rotate_right(32);
    let t = x.wrapping_mul(x).wrapping_add(z);
    x = t.rotate_right(32);

    t ^ (x.wrapping_mul(x).wrapping_add(y) >> 32)
}

/// Uniform float in `[0, 1)` from the low 53 bits of [`mix`].
#[inline]
pub fn float64(counter: u64, key: u64) -> f64 {
    const MANTISSA: u64 = (1 << 53) - 1;
    (mix(counter, key) & MANTISSA) as f64 / (1u64 << 53) as f64
}

/// Compose a counter from its stream mask and index.
#[inline]
pub const fn counter_of(mask: u32, index: u32) -> u64 {
    ((mask as u64) << 32) | index as u64
}

/// Sequential view over [`mix`]: every draw reads the counter, then bumps it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Source {
    pub counter: u64,
    pub key: u64,
}

impl Source {
    pub const fn new(counter: u64, key: u64) -> Self {
        Self { counter, key }
    }

    pub fn next_u64(&mut self) -> u64 {
        let v = mix(self.counter, self.key);
        self.counter = self.counter.wrapping_add(1);
        v
    }

    pub fn next_f64(&mut self) -> f64 {
        let v = float64(self.counter, self.key);
        self.counter = self.counter.wrapping_add(1);
        v
    }

    /// `floor(next_f64() * n)`, the board-building draw.
    pub fn next_below(&mut self, n: u32) -> u32 {
        (self.next_f64() * f64::from(n)) as u32
    }

    pub fn seek(&mut self, counter: u64) {
        self.counter = counter;
    }

    pub const fn mask(&self) -> u32 {
        (self.counter >> 32) as u32
    }

    pub const fn index(&self) -> u32 {
        self.counter as u32
    }

    /// Whether the draw `ahead` positions from now still has an index
    /// `<= limit` inside the current mask.
    pub fn in_range(&self, ahead: u64, limit: u32) -> bool {
        let ceiling = (self.counter & !u64::from(u32::MAX)) | u64::from(limit);
        self.counter
            .checked_add(ahead)
            .is_some_and(|c| c <= ceiling)
    }
}

impl RngCore for Source {
    fn next_u32(&mut self) -> u32 {
        (Source::next_u64(self) >> 32) as u32
    }

    fn next_u64(&mut self) -> u64 {
        Source::next_u64(self)
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        for chunk in dest.chunks_mut(8) {
            let bytes = Source::next_u64(self).to_le_bytes();
            chunk.copy_from_slice(&bytes[..chunk.len()]);
        }
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}

#[inline]
fn nibble(key: u64, i: u32) -> u64 {
    (key >> (4 * i)) & 0xf
}

/// Whether `key` has the digit spread [`mix`] needs.
///
/// Every hex digit is non-zero, the upper and lower eight digits are each
/// pairwise distinct, the lowest digit is odd and the two digits around the
/// 32-bit boundary differ.
pub fn is_valid_key(key: u64) -> bool {
    if nibble(key, 0) % 2 == 0 {
        return false;
    }
    let mut upper = 0u16;
    let mut lower = 0u16;
    for i in 0..16 {
        let d = nibble(key, i);
        if d == 0 {
            return false;
        }
        let seen = if i < 8 { &mut lower } else { &mut upper };
        if *seen & (1 << d) != 0 {
            return false;
        }
        *seen |= 1 << d;
    }
    nibble(key, 7) != nibble(key, 8)
}

/// Draw a fresh key satisfying [`is_valid_key`].
pub fn generate_key<R: Rng + ?Sized>(rng: &mut R) -> u64 {
    let first: u64 = rng.gen_range(0..8u64) * 2 + 1;
    let seen_first = 1u16 << first;
    let mut key = first;
    let mut seen = 0u16;
    let mut pos = 60u32;

    'fill: while pos > 0 {
        let n = rng.next_u64();
        for i in (0..64).step_by(4) {
            let d = (n >> i) & 0xf;
            if d == 0 || seen & (1 << d) != 0 {
                continue;
            }
            seen |= 1 << d;
            key |= d << pos;
            pos -= 4;
            if pos == 24 || pos == 28 {
                seen = (1 << d) | seen_first;
            }
            if pos == 0 {
                break 'fill;
            }
        }
    }

    key
}

/// Fixed, curated set of generator keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPool {
    keys: Vec<u64>,
}

const CURATED_KEYS: [u64; 8] = [
    0x4ed7_a2f3_de96_273b,
    0x3f2b_814d_b29f_8ec1,
    0x49d5_2e8f_e478_c561,
    0xa576_3fb9_45db_6f83,
    0xec61_d82a_4dac_6b13,
    0xd51c_82f9_5629_8b73,
    0xfc4d_b395_fa6e_5941,
    0xb7dc_e391_8ebc_6947,
];

impl Default for KeyPool {
    fn default() -> Self {
        Self {
            keys: CURATED_KEYS.to_vec(),
        }
    }
}

impl KeyPool {
    pub fn new(keys: Vec<u64>) -> Result<Self, Error> {
        if keys.is_empty() {
            return Err(Error::InvalidConfig("key pool must not be empty".into()));
        }
        if let Some(bad) = keys.iter().find(|k| !is_valid_key(**k)) {
            return Err(Error::InvalidConfig(format!(
                "key {bad:#018x} lacks digit diversity"
            )));
        }
        Ok(Self { keys })
    }

    /// Build a pool of `n` freshly generated keys.
    pub fn generate<R: Rng + ?Sized>(n: usize, rng: &mut R) -> Result<Self, Error> {
        Self::new((0..n).map(|_| generate_key(rng)).collect())
    }

    /// Decode little-endian `u64`s, the format keys are shipped in.
    pub fn from_le_bytes(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() % 8 != 0 {
            return Err(Error::InvalidConfig(
                "key data length must be a multiple of 8".into(),
            ));
        }
        let keys = bytes
            .chunks_exact(8)
            .map(|c| u64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
            .collect();
        Self::new(keys)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<u64> {
        self.keys.get(index).copied()
    }

    pub fn choose<R: Rng + ?Sized>(&self, rng: &mut R) -> u64 {
        self.keys[rng.gen_range(0..self.keys.len())]
    }
}
