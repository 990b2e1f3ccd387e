//! Change events and listener plumbing.
//!
//! One flush produces at most one consolidated [`ModelEvent::ModelModified`]
//! carrying per-entity flags, followed by any simple events queued during
//! the transaction. Listener dispatch snapshots the listener list before
//! iterating, so a callback registering or dropping listeners cannot
//! invalidate the iteration.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::spot::SpotId;
use crate::spotline_graph::{EdgeId, TrackId};

// ============================================================================
// FLAGS
// ============================================================================

/// How a spot was touched within one transaction. When a spot is touched in
/// several ways, the precedence Added > Removed > FrameChanged > Modified
/// decides the single reported flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpotFlag {
    Added,
    Removed,
    FrameChanged,
    Modified,
}

/// How an edge was touched. The graph's diff sets are mutually exclusive,
/// so no precedence question arises for edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EdgeFlag {
    Added,
    Removed,
    Modified,
}

// ============================================================================
// CONSOLIDATED CHANGE
// ============================================================================

/// The consolidated payload of one flush: every touched spot and edge with
/// its flag, plus the set of tracks whose derived state was refreshed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelChange {
    spots: HashMap<SpotId, SpotFlag>,
    edges: HashMap<EdgeId, EdgeFlag>,
    tracks_updated: HashSet<TrackId>,
}

impl ModelChange {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a spot flag. Later writes win, so the flush inserts flags in
    /// reverse precedence order.
    pub fn put_spot_flag(&mut self, spot: SpotId, flag: SpotFlag) {
        self.spots.insert(spot, flag);
    }

    pub fn put_edge_flag(&mut self, edge: EdgeId, flag: EdgeFlag) {
        self.edges.insert(edge, flag);
    }

    pub fn set_tracks_updated(&mut self, tracks: HashSet<TrackId>) {
        self.tracks_updated = tracks;
    }

    pub fn spot_flag(&self, spot: SpotId) -> Option<SpotFlag> {
        self.spots.get(&spot).copied()
    }

    pub fn edge_flag(&self, edge: EdgeId) -> Option<EdgeFlag> {
        self.edges.get(&edge).copied()
    }

    pub fn spots(&self) -> impl Iterator<Item = (SpotId, SpotFlag)> + '_ {
        self.spots.iter().map(|(&id, &flag)| (id, flag))
    }

    pub fn edges(&self) -> impl Iterator<Item = (EdgeId, EdgeFlag)> + '_ {
        self.edges.iter().map(|(&id, &flag)| (id, flag))
    }

    pub fn tracks_updated(&self) -> &HashSet<TrackId> {
        &self.tracks_updated
    }

    pub fn n_spots(&self) -> usize {
        self.spots.len()
    }

    pub fn n_edges(&self) -> usize {
        self.edges.len()
    }

    /// No spot and no edge was touched; such a change is never emitted.
    pub fn is_empty(&self) -> bool {
        self.spots.is_empty() && self.edges.is_empty()
    }
}

// ============================================================================
// EVENTS
// ============================================================================

/// Everything a listener can receive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ModelEvent {
    /// The spot collections were replaced wholesale (detection rerun).
    SpotsComputed,
    /// The filtered sub-collection was re-derived.
    SpotsFiltered,
    /// The visible-track set was edited.
    TrackVisibilityChanged,
    /// The consolidated per-transaction diff.
    ModelModified(ModelChange),
}

// ============================================================================
// LISTENERS
// ============================================================================

/// Observer of model changes. Delivery is synchronous, in registration
/// order, and completes before the triggering `end_update` returns.
/// Listeners must not mutate the model from the callback; they only receive
/// the event, and the model stays exclusively borrowed for the whole flush.
pub trait ModelChangeListener: Send {
    fn model_changed(&self, event: &ModelEvent);
}

impl<F: Fn(&ModelEvent) + Send> ModelChangeListener for F {
    fn model_changed(&self, event: &ModelEvent) {
        self(event)
    }
}

/// Snapshot-then-iterate dispatch.
pub(crate) fn dispatch(listeners: &[Arc<dyn ModelChangeListener>], event: &ModelEvent) {
    let snapshot: Vec<Arc<dyn ModelChangeListener>> = listeners.to_vec();
    for listener in snapshot {
        listener.model_changed(event);
    }
}

// ============================================================================
// TESTS
// ============================================================================
