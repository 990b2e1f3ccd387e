//! Selection state for manual-editing stages.
//!
//! Selection changes are not transactional: every mutation fires its own
//! event synchronously (original behavior). The model cascades deselection
//! when a selected spot or edge is removed.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

use crate::spot::SpotId;
use crate::spotline_graph::EdgeId;

// ============================================================================
// EVENT & LISTENER
// ============================================================================

/// The delta of one selection mutation. Only non-empty deltas are fired.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SelectionChangeEvent {
    pub added_spots: HashSet<SpotId>,
    pub removed_spots: HashSet<SpotId>,
    pub added_edges: HashSet<EdgeId>,
    pub removed_edges: HashSet<EdgeId>,
}

impl SelectionChangeEvent {
    fn is_empty(&self) -> bool {
        self.added_spots.is_empty()
            && self.removed_spots.is_empty()
            && self.added_edges.is_empty()
            && self.removed_edges.is_empty()
    }
}

pub trait SelectionChangeListener: Send {
    fn selection_changed(&self, event: &SelectionChangeEvent);
}

impl<F: Fn(&SelectionChangeEvent) + Send> SelectionChangeListener for F {
    fn selection_changed(&self, event: &SelectionChangeEvent) {
        self(event)
    }
}

// ============================================================================
// SELECTION MODEL
// ============================================================================

/// The currently selected spots and edges.
#[derive(Default)]
pub struct SelectionModel {
    spots: HashSet<SpotId>,
    edges: HashSet<EdgeId>,
    listeners: Vec<Arc<dyn SelectionChangeListener>>,
}

impl SelectionModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(&mut self, listener: Arc<dyn SelectionChangeListener>) {
        self.listeners.push(listener);
    }

    pub fn remove_listener(&mut self, listener: &Arc<dyn SelectionChangeListener>) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|l| !Arc::ptr_eq(l, listener));
        before != self.listeners.len()
    }

    fn fire(&self, event: SelectionChangeEvent) {
        if event.is_empty() {
            return;
        }
        let snapshot: Vec<Arc<dyn SelectionChangeListener>> = self.listeners.to_vec();
        for listener in snapshot {
            listener.selection_changed(&event);
        }
    }

    // ========================================================================
    // SPOT SELECTION
    // ========================================================================

    pub fn add_spot(&mut self, spot: SpotId) {
        self.add_spots([spot]);
    }

    pub fn remove_spot(&mut self, spot: SpotId) {
        self.remove_spots([spot]);
    }

    pub fn add_spots(&mut self, spots: impl IntoIterator<Item = SpotId>) {
        let added: HashSet<SpotId> = spots
            .into_iter()
            .filter(|&s| self.spots.insert(s))
            .collect();
        self.fire(SelectionChangeEvent {
            added_spots: added,
            ..Default::default()
        });
    }

    pub fn remove_spots(&mut self, spots: impl IntoIterator<Item = SpotId>) {
        let removed: HashSet<SpotId> = spots
            .into_iter()
            .filter(|s| self.spots.remove(s))
            .collect();
        self.fire(SelectionChangeEvent {
            removed_spots: removed,
            ..Default::default()
        });
    }

    // ========================================================================
    // EDGE SELECTION
    // ========================================================================

    pub fn add_edge(&mut self, edge: EdgeId) {
        self.add_edges([edge]);
    }

    pub fn remove_edge(&mut self, edge: EdgeId) {
        self.remove_edges([edge]);
    }

    pub fn add_edges(&mut self, edges: impl IntoIterator<Item = EdgeId>) {
        let added: HashSet<EdgeId> = edges
            .into_iter()
            .filter(|&e| self.edges.insert(e))
            .collect();
        self.fire(SelectionChangeEvent {
            added_edges: added,
            ..Default::default()
        });
    }

    pub fn remove_edges(&mut self, edges: impl IntoIterator<Item = EdgeId>) {
        let removed: HashSet<EdgeId> = edges
            .into_iter()
            .filter(|e| self.edges.remove(e))
            .collect();
        self.fire(SelectionChangeEvent {
            removed_edges: removed,
            ..Default::default()
        });
    }

    // ========================================================================
    // CLEARS & ACCESSORS
    // ========================================================================

    pub fn clear_spot_selection(&mut self) {
        let removed = std::mem::take(&mut self.spots);
        self.fire(SelectionChangeEvent {
            removed_spots: removed,
            ..Default::default()
        });
    }

    pub fn clear_edge_selection(&mut self) {
        let removed = std::mem::take(&mut self.edges);
        self.fire(SelectionChangeEvent {
            removed_edges: removed,
            ..Default::default()
        });
    }

    pub fn clear_selection(&mut self) {
        let event = SelectionChangeEvent {
            removed_spots: std::mem::take(&mut self.spots),
            removed_edges: std::mem::take(&mut self.edges),
            ..Default::default()
        };
        self.fire(event);
    }

    pub fn selected_spots(&self) -> &HashSet<SpotId> {
        &self.spots
    }

    pub fn selected_edges(&self) -> &HashSet<EdgeId> {
        &self.edges
    }

    pub fn is_spot_selected(&self, spot: SpotId) -> bool {
        self.spots.contains(&spot)
    }

    pub fn is_edge_selected(&self, edge: EdgeId) -> bool {
        self.edges.contains(&edge)
    }
}

// ============================================================================
// TESTS
// ============================================================================
