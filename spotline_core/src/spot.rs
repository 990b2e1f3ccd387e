//! Spot data containers - per-frame point entities and their collections.
//!
//! A `Spot` is a detected point-like entity carrying a feature map. Identity
//! is allocated once from a process-wide counter and never changes; equality
//! and hashing go through the identity only, so a spot stays "the same spot"
//! when its features are rewritten or it moves to another frame.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU32, Ordering};

/// Frame indices partition spots along the time axis.
pub type FrameIndex = u32;

// ============================================================================
// WELL-KNOWN FEATURE KEYS
// ============================================================================

/// Detection quality score, the usual filtering target.
pub const FEATURE_QUALITY: &str = "QUALITY";
/// Spatial position components, in physical units.
pub const FEATURE_POSITION_X: &str = "POSITION_X";
pub const FEATURE_POSITION_Y: &str = "POSITION_Y";
pub const FEATURE_POSITION_Z: &str = "POSITION_Z";
/// Estimated object radius.
pub const FEATURE_RADIUS: &str = "RADIUS";
/// Frame of residence, mirrored into the feature map for analyzers.
pub const FEATURE_FRAME: &str = "FRAME";

// ============================================================================
// SPOT IDENTITY
// ============================================================================

/// Stable integer identity of a spot.
///
/// Allocated from a process-wide atomic counter at `Spot::new` time, so ids
/// are unique across every collection and model instance in the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SpotId(pub u32);

impl std::fmt::Display for SpotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "S{}", self.0)
    }
}

static NEXT_SPOT_ID: AtomicU32 = AtomicU32::new(0);

impl SpotId {
    fn allocate() -> Self {
        SpotId(NEXT_SPOT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

// ============================================================================
// SPOT
// ============================================================================

/// A point entity with a feature map.
///
/// Position is stored as ordinary features (`FEATURE_POSITION_*`) rather than
/// dedicated fields, so analyzers read and write everything through one map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Spot {
    id: SpotId,
    features: HashMap<String, f64>,
}

impl Spot {
    /// Create a spot with a fresh identity and an empty feature map.
    pub fn new() -> Self {
        Self {
            id: SpotId::allocate(),
            features: HashMap::new(),
        }
    }

    /// Create a spot at a position, with radius and quality pre-filled.
    pub fn at(x: f64, y: f64, z: f64, radius: f64, quality: f64) -> Self {
        let mut spot = Self::new();
        spot.put_feature(FEATURE_POSITION_X, x);
        spot.put_feature(FEATURE_POSITION_Y, y);
        spot.put_feature(FEATURE_POSITION_Z, z);
        spot.put_feature(FEATURE_RADIUS, radius);
        spot.put_feature(FEATURE_QUALITY, quality);
        spot
    }

    #[inline]
    pub fn id(&self) -> SpotId {
        self.id
    }

    /// Read a feature value. `None` means "never computed", not zero.
    pub fn feature(&self, key: &str) -> Option<f64> {
        self.features.get(key).copied()
    }

    /// Write a feature value, overwriting any previous one.
    pub fn put_feature(&mut self, key: impl Into<String>, value: f64) {
        self.features.insert(key.into(), value);
    }

    /// All feature entries.
    pub fn features(&self) -> &HashMap<String, f64> {
        &self.features
    }

    /// Position as `[x, y, z]`, if all three components are present.
    pub fn position(&self) -> Option<[f64; 3]> {
        Some([
            self.feature(FEATURE_POSITION_X)?,
            self.feature(FEATURE_POSITION_Y)?,
            self.feature(FEATURE_POSITION_Z)?,
        ])
    }

    /// Squared Euclidean distance to another spot, when both have positions.
    pub fn squared_distance_to(&self, other: &Spot) -> Option<f64> {
        let a = self.position()?;
        let b = other.position()?;
        Some(
            a.iter()
                .zip(b.iter())
                .map(|(p, q)| (p - q) * (p - q))
                .sum(),
        )
    }
}

impl Default for Spot {
    fn default() -> Self {
        Self::new()
    }
}

// Identity-based equality: two spots are equal iff they are the same spot.
impl PartialEq for Spot {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Spot {}

impl Hash for Spot {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

// ============================================================================
// SPOT COLLECTION
// ============================================================================

/// Frame-partitioned spot membership.
///
/// Holds identities only; spot payloads live in the model's arena so the
/// unfiltered and filtered collections resolve to the same `Spot` values.
/// Frames iterate in ascending order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpotCollection {
    frames: BTreeMap<FrameIndex, HashSet<SpotId>>,
    frame_lookup: HashMap<SpotId, FrameIndex>,
}

impl SpotCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a spot at a frame. Returns `false` if the spot is already a
    /// member (at any frame); the collection is left unchanged in that case.
    pub fn add(&mut self, id: SpotId, frame: FrameIndex) -> bool {
        if self.frame_lookup.contains_key(&id) {
            return false;
        }
        self.frames.entry(frame).or_default().insert(id);
        self.frame_lookup.insert(id, frame);
        true
    }

    /// Remove a spot from a frame. Returns `false` if the spot was not a
    /// member of exactly that frame (idempotent no-op).
    pub fn remove(&mut self, id: SpotId, frame: FrameIndex) -> bool {
        if let Some(set) = self.frames.get_mut(&frame) {
            if set.remove(&id) {
                if set.is_empty() {
                    self.frames.remove(&frame);
                }
                self.frame_lookup.remove(&id);
                return true;
            }
        }
        false
    }

    /// The frame a spot currently resides in.
    pub fn frame_of(&self, id: SpotId) -> Option<FrameIndex> {
        self.frame_lookup.get(&id).copied()
    }

    pub fn contains(&self, id: SpotId) -> bool {
        self.frame_lookup.contains_key(&id)
    }

    /// Spots residing in one frame.
    pub fn spots_in_frame(&self, frame: FrameIndex) -> impl Iterator<Item = SpotId> + '_ {
        self.frames
            .get(&frame)
            .into_iter()
            .flat_map(|set| set.iter().copied())
    }

    /// Occupied frames, ascending.
    pub fn frames(&self) -> impl Iterator<Item = FrameIndex> + '_ {
        self.frames.keys().copied()
    }

    /// All `(spot, frame)` memberships, frames ascending.
    pub fn iter(&self) -> impl Iterator<Item = (SpotId, FrameIndex)> + '_ {
        self.frames
            .iter()
            .flat_map(|(&frame, set)| set.iter().map(move |&id| (id, frame)))
    }

    /// All member identities.
    pub fn spot_ids(&self) -> impl Iterator<Item = SpotId> + '_ {
        self.frame_lookup.keys().copied()
    }

    pub fn n_spots(&self) -> usize {
        self.frame_lookup.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frame_lookup.is_empty()
    }

    pub fn clear(&mut self) {
        self.frames.clear();
        self.frame_lookup.clear();
    }
}

// ============================================================================
// FEATURE FILTER
// ============================================================================

/// A threshold on one spot feature.
///
/// With `above` set the filter rejects values strictly below `value`,
/// otherwise values strictly above it. A spot lacking the feature passes:
/// missing data is not evidence against the spot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureFilter {
    pub feature: String,
    pub value: f64,
    pub above: bool,
}

impl FeatureFilter {
    pub fn new(feature: impl Into<String>, value: f64, above: bool) -> Self {
        Self {
            feature: feature.into(),
            value,
            above,
        }
    }

    /// Whether a spot passes this single filter.
    pub fn passes(&self, spot: &Spot) -> bool {
        match spot.feature(&self.feature) {
            Some(v) if self.above => v >= self.value,
            Some(v) => v <= self.value,
            None => true,
        }
    }
}

/// Whether a spot passes every filter in a set.
pub fn passes_all(spot: &Spot, filters: &[FeatureFilter]) -> bool {
    filters.iter().all(|f| f.passes(spot))
}

// ============================================================================
// TESTS
// ============================================================================
