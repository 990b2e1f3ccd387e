//! The "TRACKS" Engine - Weighted Graph & Connected-Component Decomposition
//!
//! Maintains the undirected weighted graph whose vertex set is the filtered
//! spots, decomposes it into tracks (connected components, singletons
//! included), and keeps per-transaction net diffs of edge edits for the
//! model's flush.
//!
//! Design points:
//! - Edges live in an arena indexed by `EdgeId`; removed edges keep their
//!   slot as a tombstone so the flush can still resolve the track an edge
//!   belonged to before its removal.
//! - Track IDs are reused across recomputes only when a component's spot set
//!   is exactly unchanged; splits and merges always get fresh IDs.
//! - The added/removed/modified diff sets are mutually exclusive and reflect
//!   net state: an edge added and removed inside one transaction vanishes
//!   from both.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::collections::{HashMap, HashSet, VecDeque};

use crate::spot::SpotId;
use crate::spotline_model::ModelError;

// ============================================================================
// HANDLES
// ============================================================================

/// Stable arena index of an edge. Valid for lookups even after removal,
/// until the next track recomputation prunes the mapping tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EdgeId(pub u32);

impl std::fmt::Display for EdgeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "E{}", self.0)
    }
}

/// Stable integer identity of a track (one connected component).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TrackId(pub u32);

impl std::fmt::Display for TrackId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "T{}", self.0)
    }
}

// ============================================================================
// EDGE DIFF
// ============================================================================

/// Net edge edits accumulated since the last flush.
///
/// The three sets are disjoint at all times. Consumed exactly once per
/// transaction via [`TrackGraph::take_diff`].
#[derive(Debug, Clone, Default)]
pub struct EdgeDiff {
    pub added: HashSet<EdgeId>,
    pub removed: HashSet<EdgeId>,
    pub modified: HashSet<EdgeId>,
}

impl EdgeDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty()
    }
}

// ============================================================================
// EDGE ARENA
// ============================================================================

/// One arena slot. Dead slots are tombstones kept for post-removal lookups.
#[derive(Debug, Clone)]
struct EdgeSlot {
    source: SpotId,
    target: SpotId,
    weight: f64,
    alive: bool,
}

impl EdgeSlot {
    fn touches(&self, spot: SpotId) -> bool {
        self.source == spot || self.target == spot
    }
}

// ============================================================================
// TRACK GRAPH
// ============================================================================

/// The weighted undirected graph over filtered spots, plus the derived
/// track decomposition and the visibility set.
#[derive(Debug, Default)]
pub struct TrackGraph {
    // === Graph Store ===
    /// Edge arena; `EdgeId` is the slot index.
    edges: Vec<EdgeSlot>,

    /// Per-vertex incident alive edges. Tracking chains rarely branch, so
    /// most spots carry one or two links.
    adjacency: HashMap<SpotId, SmallVec<[EdgeId; 4]>>,

    // === Track Decomposition ===
    spot_tracks: HashMap<SpotId, TrackId>,
    edge_tracks: HashMap<EdgeId, TrackId>,
    track_spots: HashMap<TrackId, HashSet<SpotId>>,
    track_edges: HashMap<TrackId, HashSet<EdgeId>>,
    next_track_id: u32,

    // === Visibility ===
    visible: HashSet<TrackId>,

    // === Transaction Diff ===
    diff: EdgeDiff,
}

impl TrackGraph {
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================================================
    // VERTEX OPERATIONS
    // ========================================================================

    /// Register a spot as a graph vertex. A new vertex immediately forms a
    /// visible singleton track, so every filtered spot belongs to exactly
    /// one track in every quiescent state. Returns `false` if already
    /// present.
    pub fn add_vertex(&mut self, spot: SpotId) -> bool {
        if self.adjacency.contains_key(&spot) {
            return false;
        }
        self.adjacency.insert(spot, SmallVec::new());
        let track = self.fresh_track_id();
        self.spot_tracks.insert(spot, track);
        self.track_spots.insert(track, HashSet::from([spot]));
        self.track_edges.insert(track, HashSet::new());
        self.visible.insert(track);
        true
    }

    /// Remove a spot from the vertex set, cascading removal of its incident
    /// edges (each recorded in the diff as a regular edge removal). Returns
    /// `false` if the spot was not a vertex.
    pub fn remove_vertex(&mut self, spot: SpotId) -> bool {
        let Some(incident) = self.adjacency.get(&spot) else {
            return false;
        };
        for edge in incident.clone() {
            self.remove_edge_by_id(edge);
        }
        self.adjacency.remove(&spot);

        if let Some(track) = self.spot_tracks.remove(&spot) {
            if let Some(members) = self.track_spots.get_mut(&track) {
                members.remove(&spot);
                if members.is_empty() {
                    self.track_spots.remove(&track);
                    self.track_edges.remove(&track);
                    self.visible.remove(&track);
                }
            }
        }
        true
    }

    pub fn has_vertex(&self, spot: SpotId) -> bool {
        self.adjacency.contains_key(&spot)
    }

    pub fn vertices(&self) -> impl Iterator<Item = SpotId> + '_ {
        self.adjacency.keys().copied()
    }

    pub fn n_vertices(&self) -> usize {
        self.adjacency.len()
    }

    // ========================================================================
    // EDGE OPERATIONS
    // ========================================================================

    /// Link two vertices. Rejects unknown endpoints, self-links and
    /// duplicate pairs; the graph is simple.
    pub fn add_edge(
        &mut self,
        source: SpotId,
        target: SpotId,
        weight: f64,
    ) -> Result<EdgeId, ModelError> {
        if !self.adjacency.contains_key(&source) {
            return Err(ModelError::UnknownSpot(source));
        }
        if !self.adjacency.contains_key(&target) {
            return Err(ModelError::UnknownSpot(target));
        }
        if source == target {
            return Err(ModelError::SelfLink(source));
        }
        if self.edge_between(source, target).is_some() {
            return Err(ModelError::DuplicateEdge(source, target));
        }

        let id = EdgeId(self.edges.len() as u32);
        self.edges.push(EdgeSlot {
            source,
            target,
            weight,
            alive: true,
        });
        self.adjacency.get_mut(&source).unwrap().push(id);
        self.adjacency.get_mut(&target).unwrap().push(id);
        self.diff.added.insert(id);
        Ok(id)
    }

    /// Remove the edge between two vertices, if any. Idempotent.
    pub fn remove_edge(&mut self, source: SpotId, target: SpotId) -> Option<EdgeId> {
        let id = self.edge_between(source, target)?;
        self.remove_edge_by_id(id);
        Some(id)
    }

    /// Remove an edge by handle. Returns `false` if the handle is dead or
    /// out of range. An edge added within the current transaction cancels
    /// out of the diff entirely instead of entering the removed set.
    pub fn remove_edge_by_id(&mut self, id: EdgeId) -> bool {
        let Some(slot) = self.edges.get_mut(id.0 as usize) else {
            return false;
        };
        if !slot.alive {
            return false;
        }
        slot.alive = false;
        let (source, target) = (slot.source, slot.target);

        for endpoint in [source, target] {
            if let Some(incident) = self.adjacency.get_mut(&endpoint) {
                incident.retain(|&mut e| e != id);
            }
        }

        self.diff.modified.remove(&id);
        if !self.diff.added.remove(&id) {
            self.diff.removed.insert(id);
        }
        true
    }

    /// Change an edge's weight, recording it as modified.
    pub fn set_edge_weight(&mut self, id: EdgeId, weight: f64) -> Result<(), ModelError> {
        match self.edges.get_mut(id.0 as usize) {
            Some(slot) if slot.alive => {
                slot.weight = weight;
                self.mark_edge_modified(id);
                Ok(())
            }
            _ => Err(ModelError::UnknownEdge(id)),
        }
    }

    /// Record an edge as modified without touching its weight (used when a
    /// spot move or in-place update invalidates edge-derived features).
    /// Edges pending addition stay in the added set only.
    pub fn mark_edge_modified(&mut self, id: EdgeId) {
        if !self.diff.added.contains(&id) && !self.diff.removed.contains(&id) {
            self.diff.modified.insert(id);
        }
    }

    /// Mark every alive edge incident to a spot as modified.
    pub fn mark_edges_of_spot_modified(&mut self, spot: SpotId) {
        if let Some(incident) = self.adjacency.get(&spot) {
            for id in incident.clone() {
                self.mark_edge_modified(id);
            }
        }
    }

    /// The alive edge between two vertices, if any.
    pub fn edge_between(&self, a: SpotId, b: SpotId) -> Option<EdgeId> {
        let incident = self.adjacency.get(&a)?;
        incident
            .iter()
            .copied()
            .find(|&id| self.edges[id.0 as usize].touches(b))
    }

    /// Endpoints of an edge. Resolves tombstoned edges too.
    pub fn edge_endpoints(&self, id: EdgeId) -> Option<(SpotId, SpotId)> {
        self.edges
            .get(id.0 as usize)
            .map(|slot| (slot.source, slot.target))
    }

    /// Weight of an alive edge.
    pub fn edge_weight(&self, id: EdgeId) -> Option<f64> {
        self.edges
            .get(id.0 as usize)
            .filter(|slot| slot.alive)
            .map(|slot| slot.weight)
    }

    pub fn is_edge_alive(&self, id: EdgeId) -> bool {
        self.edges
            .get(id.0 as usize)
            .map(|slot| slot.alive)
            .unwrap_or(false)
    }

    /// Alive edges incident to a spot.
    pub fn edges_of(&self, spot: SpotId) -> impl Iterator<Item = EdgeId> + '_ {
        self.adjacency
            .get(&spot)
            .into_iter()
            .flat_map(|incident| incident.iter().copied())
    }

    pub fn n_edges(&self) -> usize {
        self.edges.iter().filter(|slot| slot.alive).count()
    }

    // ========================================================================
    // TRACK DECOMPOSITION
    // ========================================================================

    /// Recompute connected components from scratch.
    ///
    /// ID reuse policy: a component keeps a previous `TrackId` iff its spot
    /// set is exactly the previous track's spot set; any split or merge
    /// yields fresh IDs. Visibility: a reused ID keeps its flag; a fresh
    /// component is visible iff any member came from a visible track, or no
    /// member was tracked at all (all-new spots default to visible).
    pub fn compute_tracks_from_graph(&mut self) {
        let old_spot_tracks = std::mem::take(&mut self.spot_tracks);
        let old_track_spots = std::mem::take(&mut self.track_spots);
        let old_visible = std::mem::take(&mut self.visible);
        self.edge_tracks.clear();
        self.track_edges.clear();

        // Deterministic seeding order so identical graphs decompose
        // identically.
        let mut seeds: Vec<SpotId> = self.adjacency.keys().copied().collect();
        seeds.sort_unstable();

        let mut assigned: HashSet<SpotId> = HashSet::with_capacity(seeds.len());
        for seed in seeds {
            if assigned.contains(&seed) {
                continue;
            }

            // BFS over alive edges.
            let mut spots = HashSet::new();
            let mut edges = HashSet::new();
            let mut queue = VecDeque::from([seed]);
            spots.insert(seed);
            while let Some(spot) = queue.pop_front() {
                for edge in self.adjacency[&spot].iter().copied() {
                    let slot = &self.edges[edge.0 as usize];
                    debug_assert!(slot.alive, "adjacency lists only alive edges");
                    debug_assert!(
                        self.adjacency.contains_key(&slot.source)
                            && self.adjacency.contains_key(&slot.target),
                        "edge endpoint missing from vertex set"
                    );
                    edges.insert(edge);
                    let other = if slot.source == spot {
                        slot.target
                    } else {
                        slot.source
                    };
                    if spots.insert(other) {
                        queue.push_back(other);
                    }
                }
            }
            assigned.extend(spots.iter().copied());

            // Reuse the old ID only for an exactly unchanged component.
            let previous = old_spot_tracks.get(&seed).copied();
            let unchanged = previous
                .and_then(|t| old_track_spots.get(&t))
                .map(|old| *old == spots)
                .unwrap_or(false);
            let track = if unchanged {
                previous.unwrap()
            } else {
                self.fresh_track_id()
            };

            let visible = if unchanged {
                old_visible.contains(&track)
            } else {
                let mut any_tracked = false;
                let mut any_visible = false;
                for spot in &spots {
                    if let Some(t) = old_spot_tracks.get(spot) {
                        any_tracked = true;
                        any_visible |= old_visible.contains(t);
                    }
                }
                any_visible || !any_tracked
            };

            for &spot in &spots {
                self.spot_tracks.insert(spot, track);
            }
            for &edge in &edges {
                self.edge_tracks.insert(edge, track);
            }
            self.track_spots.insert(track, spots);
            self.track_edges.insert(track, edges);
            if visible {
                self.visible.insert(track);
            }
        }
    }

    fn fresh_track_id(&mut self) -> TrackId {
        let id = TrackId(self.next_track_id);
        self.next_track_id += 1;
        id
    }

    // ========================================================================
    // TRACK LOOKUPS
    // ========================================================================

    pub fn track_id_of_spot(&self, spot: SpotId) -> Option<TrackId> {
        self.spot_tracks.get(&spot).copied()
    }

    /// The track an edge belongs to. Tombstoned edges resolve to their
    /// pre-removal track until the next recomputation.
    pub fn track_id_of_edge(&self, edge: EdgeId) -> Option<TrackId> {
        self.edge_tracks.get(&edge).copied()
    }

    pub fn track_spots(&self, track: TrackId) -> Option<&HashSet<SpotId>> {
        self.track_spots.get(&track)
    }

    pub fn track_edges(&self, track: TrackId) -> Option<&HashSet<EdgeId>> {
        self.track_edges.get(&track)
    }

    pub fn track_ids(&self) -> impl Iterator<Item = TrackId> + '_ {
        self.track_spots.keys().copied()
    }

    pub fn has_track(&self, track: TrackId) -> bool {
        self.track_spots.contains_key(&track)
    }

    pub fn n_tracks(&self) -> usize {
        self.track_spots.len()
    }

    // ========================================================================
    // VISIBILITY
    // ========================================================================

    pub fn visible_track_ids(&self) -> &HashSet<TrackId> {
        &self.visible
    }

    pub fn is_track_visible(&self, track: TrackId) -> bool {
        self.visible.contains(&track)
    }

    /// Flag a track visible or hidden. Returns `false` for unknown tracks.
    pub fn set_track_visible(&mut self, track: TrackId, visible: bool) -> bool {
        if !self.track_spots.contains_key(&track) {
            return false;
        }
        if visible {
            self.visible.insert(track);
        } else {
            self.visible.remove(&track);
        }
        true
    }

    /// Replace the whole visibility set. Unknown IDs are dropped.
    pub fn set_visible_track_ids(&mut self, tracks: HashSet<TrackId>) {
        self.visible = tracks
            .into_iter()
            .filter(|t| self.track_spots.contains_key(t))
            .collect();
    }

    // ========================================================================
    // TRANSACTION HANDOFF & WHOLESALE RESET
    // ========================================================================

    /// Hand the accumulated net diff to the flush, leaving fresh empty sets.
    pub fn take_diff(&mut self) -> EdgeDiff {
        std::mem::take(&mut self.diff)
    }

    /// Peek at the pending diff (tests and diagnostics).
    pub fn pending_diff(&self) -> &EdgeDiff {
        &self.diff
    }

    /// Rebuild the vertex set wholesale: vertices not in `keep` are dropped
    /// with their edges, missing ones are added, tracks are recomputed and
    /// the pending diff is discarded (wholesale resets bypass the diff
    /// engine).
    pub fn set_vertices(&mut self, keep: &HashSet<SpotId>) {
        let stale: Vec<SpotId> = self
            .adjacency
            .keys()
            .copied()
            .filter(|v| !keep.contains(v))
            .collect();
        for spot in stale {
            self.remove_vertex(spot);
        }
        for &spot in keep {
            self.add_vertex(spot);
        }
        self.diff = EdgeDiff::default();
        self.compute_tracks_from_graph();
    }

    /// Drop everything: vertices, edges, tracks, visibility, pending diff.
    pub fn clear(&mut self) {
        self.edges.clear();
        self.adjacency.clear();
        self.spot_tracks.clear();
        self.edge_tracks.clear();
        self.track_spots.clear();
        self.track_edges.clear();
        self.visible.clear();
        self.diff = EdgeDiff::default();
    }
}

// ============================================================================
// TESTS
// ============================================================================
