use std::cmp::Ordering;
use std::f64;
use std::hash::{BuildHasher, BuildHasherDefault, Hash, Hasher};
use std::marker::PhantomData;
use std::mem;

use num_traits::{CheckedAdd, One, Zero};
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaChaRng;
use twox_hash::XxHash64;

use crate::CountMinError;

// A large 32-bit prime stored in a u64.
const MOD: u64 = 2147483647;

// Fixed global seed for the hash family. Row seeds are derived from it and
// the row index alone, so an identical family can be rebuilt for any sketch
// of the same depth.
const SEED_BASE: u64 = 0x27d4_eb2f_1656_67c5;
const ROW_SEED_MIX: u64 = 0x9e37_79b9_7f4a_7c15;

/// A Count-Min sketch over keys of type `K` with counters of type `C`.
///
/// The counter table is guarded by a single lock held for the whole of each
/// operation, so concurrent callers never observe a half-applied insert,
/// merge or clear. Estimates returned by [`count`](Self::count) are upper
/// bounds on the true frequency.
///
/// `S` supplies the base hash for keys and defaults to a deterministic
/// hasher. Two sketches of equal dimensions that use the default hasher
/// share the same hash family and can be merged meaningfully.
#[derive(Debug)]
pub struct CountMinSketch<K, C = u32, S = BuildHasherDefault<XxHash64>>
where
    K: Hash + ?Sized,
    C: Copy + Zero + One + PartialOrd,
    S: BuildHasher,
{
    table:   Mutex<Table<C>>,
    builder: S,
    phantom: PhantomData<K>,
}

#[derive(Debug, Clone)]
struct Table<C> {
    width:   usize,
    depth:   usize,
    hashers: Vec<(u64, u64)>,
    counts:  Vec<C>,
}

impl<C> Default for Table<C> {
    // The empty sentinel left behind by `CountMinSketch::take`.
    fn default() -> Self {
        Table {
            width:   0,
            depth:   0,
            hashers: Vec::new(),
            counts:  Vec::new(),
        }
    }
}

impl<C> Table<C>
where
    C: Copy + Zero + One + PartialOrd,
{
    fn with_dimensions(width: usize, depth: usize) -> Self {
        Table {
            width,
            depth,
            hashers: build_hashers(depth),
            counts: vec![C::zero(); width * depth],
        }
    }

    fn add(&mut self, x: u64, diff: C) {
        for (i, &(a, b)) in self.hashers.iter().enumerate() {
            let index = i * self.width + column(a, b, x) % self.width;

            self.counts[index] = self.counts[index] + diff;
        }
    }

    fn add_checked(&mut self, x: u64, diff: C) -> Result<(), CountMinError>
    where
        C: CheckedAdd,
    {
        for (i, &(a, b)) in self.hashers.iter().enumerate() {
            let index = i * self.width + column(a, b, x) % self.width;

            self.counts[index] = self.counts[index]
                .checked_add(&diff)
                .ok_or(CountMinError::CounterOverflow)?;
        }

        Ok(())
    }

    // Minimum counter across rows. Best effort on a structurally
    // inconsistent table: falls back to the first counter or zero instead
    // of failing. Column reduction keeps every index within the row.
    fn estimate(&self, x: u64) -> C {
        if self.width == 0 || self.depth == 0 {
            return C::zero();
        }

        if self.counts.len() != self.width * self.depth
            || self.hashers.len() != self.depth
        {
            return self.counts.first().copied().unwrap_or_else(C::zero);
        }

        let mut min: Option<C> = None;

        for (i, &(a, b)) in self.hashers.iter().enumerate() {
            let col = column(a, b, x) % self.width;

            let count = self.counts[i * self.width + col];

            match min {
                Some(m) if m < count => {},
                _ => min = Some(count),
            }
        }

        min.unwrap_or_else(C::zero)
    }
}

#[inline]
fn column(a: u64, b: u64, x: u64) -> usize {
    // Here a, b and x fit in u32 integers but are stored as u64.
    // This calculation should not overflow.
    let index = (a * x) + b;

    (((index >> 31) + index) & MOD) as usize
}

fn build_hashers(depth: usize) -> Vec<(u64, u64)> {
    (0..depth)
        .map(|row| {
            let seed = SEED_BASE ^ (row as u64).wrapping_mul(ROW_SEED_MIX);

            let mut rng = ChaChaRng::seed_from_u64(seed);

            (rng.gen::<u64>() & MOD, rng.gen::<u64>() & MOD)
        })
        .collect()
}

impl<K, C, S> CountMinSketch<K, C, S>
where
    K: Hash + ?Sized,
    C: Copy + Zero + One + PartialOrd,
    S: BuildHasher,
{
    /// Creates a sketch with `depth` rows of `width` counters each.
    ///
    /// Fails with [`CountMinError::InvalidDimension`] if either dimension
    /// is zero, or if `width` exceeds the modulus of the hash family.
    pub fn new(width: usize, depth: usize) -> Result<Self, CountMinError>
    where
        S: Default,
    {
        Self::with_hasher(width, depth, S::default())
    }

    /// Creates a sketch sized for a relative error of `epsilon` with
    /// probability `1 - delta`.
    pub fn from_error_bounds(
        epsilon: f64,
        delta: f64,
    ) -> Result<Self, CountMinError>
    where
        S: Default,
    {
        Self::new(
            (f64::consts::E / epsilon).ceil() as usize,
            (1.0 / delta).ln().ceil() as usize,
        )
    }

    /// Like [`new`](Self::new), with an explicit base hasher.
    ///
    /// The base hasher must be deterministic and shared if sketches are to
    /// be merged: the per-row hash family is always rebuilt from fixed
    /// seeds, but the base digest of a key comes from `builder`.
    pub fn with_hasher(
        width: usize,
        depth: usize,
        builder: S,
    ) -> Result<Self, CountMinError> {
        if width as u64 > MOD || width < 1 || depth < 1 {
            return Err(CountMinError::InvalidDimension);
        }

        Ok(CountMinSketch {
            table:   Mutex::new(Table::with_dimensions(width, depth)),
            builder,
            phantom: PhantomData,
        })
    }

    /// Records one observation of `item`, incrementing one counter per row.
    pub fn insert(&self, item: &K) {
        let x = self.digest(item);

        self.table.lock().add(x, C::one());
    }

    /// Records `diff` observations of `item` at once.
    pub fn update(&self, item: &K, diff: C) {
        let x = self.digest(item);

        self.table.lock().add(x, diff);
    }

    /// Overflow-checked [`update`](Self::update).
    ///
    /// On [`CountMinError::CounterOverflow`] rows before the failing one
    /// have already been incremented.
    pub fn update_checked(
        &self,
        item: &K,
        diff: C,
    ) -> Result<(), CountMinError>
    where
        C: CheckedAdd,
    {
        let x = self.digest(item);

        self.table.lock().add_checked(x, diff)
    }

    /// Returns the estimated frequency of `item`.
    ///
    /// The estimate never undercounts the true frequency; collisions can
    /// make it overcount. Never fails: an empty sentinel estimates zero,
    /// and a structurally inconsistent table degrades to a best-effort
    /// value instead of panicking.
    pub fn count(&self, item: &K) -> C {
        let x = self.digest(item);

        self.table.lock().estimate(x)
    }

    /// Folds `other`'s observations into this sketch by elementwise sum.
    ///
    /// Fails with [`CountMinError::DimensionMismatch`] if the dimensions
    /// differ, in which case this sketch is left untouched. Error bounds of
    /// the two streams compound in the merged estimates.
    pub fn merge(&self, other: &Self) -> Result<(), CountMinError> {
        let (width, depth, snapshot) = other.snapshot();

        let mut table = self.table.lock();

        if table.width != width || table.depth != depth {
            return Err(CountMinError::DimensionMismatch);
        }

        table
            .counts
            .iter_mut()
            .zip(snapshot.iter())
            .for_each(|(x, y)| *x = *x + *y);

        Ok(())
    }

    /// Overflow-checked [`merge`](Self::merge).
    ///
    /// On [`CountMinError::CounterOverflow`] counters before the failing
    /// one have already been summed.
    pub fn merge_checked(&self, other: &Self) -> Result<(), CountMinError>
    where
        C: CheckedAdd,
    {
        let (width, depth, snapshot) = other.snapshot();

        let mut table = self.table.lock();

        if table.width != width || table.depth != depth {
            return Err(CountMinError::DimensionMismatch);
        }

        for (x, y) in table.counts.iter_mut().zip(snapshot.iter()) {
            *x = x.checked_add(y).ok_or(CountMinError::CounterOverflow)?;
        }

        Ok(())
    }

    /// Resets every counter to zero, keeping dimensions and hash family,
    /// so the sketch can be reused for a new observation window.
    pub fn clear(&self) {
        self.table
            .lock()
            .counts
            .iter_mut()
            .for_each(|x| *x = C::zero());
    }

    /// Transfers the sketch's state into a new instance, leaving this one
    /// as an inert empty sentinel (`width == depth == 0`).
    ///
    /// The counter table is moved and re-validated against the dimensions
    /// (zero-padded or truncated if a prior invariant violation left it
    /// short or long), and the hash family is rebuilt from its fixed seeds
    /// rather than carried over. On the sentinel, `count` estimates zero,
    /// `insert` and `clear` are no-ops, and `merge` against any non-empty
    /// sketch fails with [`CountMinError::DimensionMismatch`].
    pub fn take(&mut self) -> Self
    where
        S: Default,
    {
        let mut table = mem::take(self.table.get_mut());

        table.counts.resize(table.width * table.depth, C::zero());
        table.hashers = build_hashers(table.depth);

        CountMinSketch {
            table:   Mutex::new(table),
            builder: mem::take(&mut self.builder),
            phantom: PhantomData,
        }
    }

    /// Number of counters per row.
    pub fn width(&self) -> usize {
        self.table.lock().width
    }

    /// Number of rows, one per hash function.
    pub fn depth(&self) -> usize {
        self.table.lock().depth
    }

    /// `false` once the state has been [`take`](Self::take)n away.
    pub fn is_active(&self) -> bool {
        let table = self.table.lock();

        table.width > 0 && table.depth > 0
    }

    /// Whether every counter is zero.
    pub fn is_empty(&self) -> bool {
        self.table.lock().counts.iter().all(|c| c.is_zero())
    }

    fn digest(&self, item: &K) -> u64 {
        let mut hasher = self.builder.build_hasher();

        item.hash(&mut hasher);

        hasher.finish() % MOD
    }

    fn snapshot(&self) -> (usize, usize, Vec<C>) {
        let table = self.table.lock();

        (table.width, table.depth, table.counts.clone())
    }
}

impl<K, C, S> CountMinSketch<K, C, S>
where
    K: Hash + Clone,
    C: Copy + Zero + One + PartialOrd,
    S: BuildHasher,
{
    /// Ranks `candidates` by estimated frequency, descending, and returns
    /// the first `k` of them as `(key, estimate)` pairs.
    ///
    /// The sketch keeps no record of which keys were inserted, so the
    /// candidate set is the caller's. All estimates are computed under one
    /// lock and so reflect a single logical point in time. Ties are broken
    /// by candidate input order (the sort is stable).
    pub fn top_k(&self, k: usize, candidates: &[K]) -> Vec<(K, C)> {
        if k == 0 {
            return Vec::new();
        }

        let digests: Vec<u64> =
            candidates.iter().map(|item| self.digest(item)).collect();

        let table = self.table.lock();

        let mut ranked: Vec<(K, C)> = candidates
            .iter()
            .zip(digests.iter())
            .map(|(item, &x)| (item.clone(), table.estimate(x)))
            .collect();

        drop(table);

        ranked.sort_by(|a, b| {
            b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal)
        });

        ranked.truncate(k);

        ranked
    }
}

impl<K, C, S> Default for CountMinSketch<K, C, S>
where
    K: Hash + ?Sized,
    C: Copy + Zero + One + PartialOrd,
    S: BuildHasher + Default,
{
    /// The empty sentinel: no rows, no counters, estimates zero.
    fn default() -> Self {
        CountMinSketch {
            table:   Mutex::new(Table::default()),
            builder: S::default(),
            phantom: PhantomData,
        }
    }
}

impl<K, C, S> Clone for CountMinSketch<K, C, S>
where
    K: Hash + ?Sized,
    C: Copy + Zero + One + PartialOrd,
    S: BuildHasher + Clone,
{
    fn clone(&self) -> Self {
        CountMinSketch {
            table:   Mutex::new(self.table.lock().clone()),
            builder: self.builder.clone(),
            phantom: PhantomData,
        }
    }
}
