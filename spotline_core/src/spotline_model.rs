//! The "MODEL" Engine - Transactional Mutation & Incremental Recomputation
//!
//! All mutations funnel through this orchestrator. Edits made while a
//! transaction is open are buffered into per-kind diff sets; when the
//! outermost `end_update` closes, one flush recomputes exactly the affected
//! tracks and feature values, builds one consolidated change event and
//! dispatches it to listeners before handing back a [`FlushReport`].
//!
//! Every mutation called outside an open transaction runs in an implicit
//! one-shot transaction: it is buffered, flushed and notified synchronously
//! by the same call. The nesting counter only controls when several
//! mutations coalesce into a single notification.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;

use crate::events::{self, ModelChange, ModelChangeListener, ModelEvent, EdgeFlag, SpotFlag};
use crate::selection::SelectionModel;
use crate::spot::{
    passes_all, FeatureFilter, FrameIndex, Spot, SpotCollection, SpotId, FEATURE_FRAME,
};
use crate::spotline_features::{AnalyzerFailure, FeatureModel};
use crate::spotline_graph::{EdgeId, TrackGraph, TrackId};

// ============================================================================
// ERRORS
// ============================================================================

/// Usage errors. Operations returning these leave every diff buffer intact.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelError {
    #[error("end_update called without a matching begin_update")]
    UnbalancedTransaction,

    #[error("spot {0} is not a graph vertex")]
    UnknownSpot(SpotId),

    #[error("edge {0} does not exist")]
    UnknownEdge(EdgeId),

    #[error("an edge between {0} and {1} already exists")]
    DuplicateEdge(SpotId, SpotId),

    #[error("spot {0} cannot link to itself")]
    SelfLink(SpotId),
}

// ============================================================================
// FLUSH REPORT
// ============================================================================

/// What one flush did. Lets callers tell "no-op, nothing to do" (no event,
/// no failures) from "transient analyzer failure" (failures present) apart
/// from the usage errors returned as [`ModelError`].
#[derive(Debug, Default)]
pub struct FlushReport {
    /// Whether a consolidated event was dispatched.
    pub event_fired: bool,
    /// Number of tracks whose derived state was refreshed.
    pub tracks_updated: usize,
    /// Analyzer failures, reported and swallowed; the affected feature
    /// values remain stale.
    pub analyzer_failures: Vec<AnalyzerFailure>,
}

// ============================================================================
// MODEL
// ============================================================================

/// The shared model: spots per frame, the track graph over the filtered
/// spots, feature stores, selection, and the transaction machinery.
///
/// Single-writer: mutation and flush run on one logical thread, and
/// listeners cannot reach back into the model from their callback (they
/// receive the event only, while the model stays exclusively borrowed).
#[derive(Default)]
pub struct Model {
    // === Spot Store ===
    /// Single payload arena; both collections resolve through it, so the
    /// filtered sub-collection holds the very same spot values.
    spot_arena: HashMap<SpotId, Spot>,
    spots: SpotCollection,
    filtered_spots: SpotCollection,

    // === Derived State ===
    graph: TrackGraph,
    features: FeatureModel,
    selection: SelectionModel,

    // === Listeners ===
    listeners: Vec<Arc<dyn ModelChangeListener>>,

    // === Transaction State ===
    update_depth: u32,
    spots_added: HashSet<SpotId>,
    spots_removed: HashSet<SpotId>,
    spots_moved: HashSet<SpotId>,
    spots_updated: HashSet<SpotId>,
    /// Simple events queued during the transaction, deduplicated, emitted
    /// after the consolidated event in queue order.
    event_cache: Vec<ModelEvent>,
}

impl Model {
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================================================
    // LISTENERS
    // ========================================================================

    pub fn add_listener(&mut self, listener: Arc<dyn ModelChangeListener>) {
        self.listeners.push(listener);
    }

    pub fn remove_listener(&mut self, listener: &Arc<dyn ModelChangeListener>) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|l| !Arc::ptr_eq(l, listener));
        before != self.listeners.len()
    }

    // ========================================================================
    // TRANSACTIONS
    // ========================================================================

    /// Open a (possibly nested) transaction.
    pub fn begin_update(&mut self) {
        self.update_depth += 1;
        tracing::trace!(depth = self.update_depth, "begin_update");
    }

    /// Close one transaction level. Closing the outermost level flushes:
    /// tracks and features are recomputed for exactly the touched entities
    /// and listeners are notified before this returns.
    pub fn end_update(&mut self) -> Result<FlushReport, ModelError> {
        if self.update_depth == 0 {
            return Err(ModelError::UnbalancedTransaction);
        }
        self.update_depth -= 1;
        tracing::trace!(depth = self.update_depth, "end_update");
        if self.update_depth == 0 {
            Ok(self.flush())
        } else {
            Ok(FlushReport::default())
        }
    }

    /// Run a mutation inside the current transaction if one is open, or in
    /// an implicit one-shot transaction otherwise. The explicit code path
    /// for the "every mutation flushes unless batched" rule.
    fn one_shot<R>(&mut self, op: impl FnOnce(&mut Self) -> R) -> R {
        if self.update_depth > 0 {
            return op(self);
        }
        self.update_depth += 1;
        let out = op(self);
        self.update_depth -= 1;
        self.flush();
        out
    }

    // ========================================================================
    // SPOT MUTATIONS
    // ========================================================================

    /// Insert a spot at a frame. First insertion records it in the added
    /// set; re-adding an existing spot only re-establishes filtered
    /// membership and vertex presence.
    pub fn add_spot(&mut self, spot: Spot, frame: FrameIndex) -> SpotId {
        self.one_shot(|m| {
            let id = spot.id();
            if m.spots.add(id, frame) {
                m.spots_added.insert(id);
            }
            let resident = m.spots.frame_of(id).unwrap_or(frame);
            let mut spot = spot;
            spot.put_feature(FEATURE_FRAME, resident as f64);
            m.spot_arena.insert(id, spot);
            if !m.filtered_spots.contains(id) {
                m.filtered_spots.add(id, resident);
            }
            m.graph.add_vertex(id);
            id
        })
    }

    /// Move a spot between frames. A spot absent from `from` is a silent
    /// no-op apart from the incident-edge marking (edge-derived features
    /// may depend on spot position either way). Returns the id for
    /// chaining.
    pub fn move_spot(&mut self, id: SpotId, from: FrameIndex, to: FrameIndex) -> SpotId {
        self.one_shot(|m| {
            m.graph.mark_edges_of_spot_modified(id);
            if m.spots.remove(id, from) {
                m.spots.add(id, to);
                if m.filtered_spots.remove(id, from) {
                    m.filtered_spots.add(id, to);
                }
                if let Some(spot) = m.spot_arena.get_mut(&id) {
                    spot.put_feature(FEATURE_FRAME, to as f64);
                }
                m.spots_moved.insert(id);
            }
            id
        })
    }

    /// Remove a spot, resolving its frame by lookup when not supplied.
    /// Cascades: filtered membership, selection (the spot and its incident
    /// edges), and the graph vertex with its incident edges. Returns the
    /// owned payload, or `None` for the idempotent no-op.
    pub fn remove_spot(&mut self, id: SpotId, from: Option<FrameIndex>) -> Option<Spot> {
        self.one_shot(|m| {
            let frame = from.or_else(|| m.spots.frame_of(id))?;
            if !m.spots.remove(id, frame) {
                return None;
            }

            // Diff minimality: a spot added in this same transaction
            // cancels out instead of being reported removed.
            if !m.spots_added.remove(&id) {
                m.spots_removed.insert(id);
            }
            m.spots_moved.remove(&id);
            m.spots_updated.remove(&id);

            let incident: Vec<EdgeId> = m.graph.edges_of(id).collect();
            m.selection.remove_spot(id);
            m.selection.remove_edges(incident);

            if let Some(filtered_frame) = m.filtered_spots.frame_of(id) {
                m.filtered_spots.remove(id, filtered_frame);
            }
            m.graph.remove_vertex(id);
            m.spot_arena.remove(&id)
        })
    }

    /// Record that a spot's attributes were recomputed in place, so its
    /// features and those of its incident edges are refreshed at flush.
    /// Unknown ids are an idempotent no-op; the consolidated event never
    /// names nonexistent entities.
    pub fn mark_for_feature_update(&mut self, id: SpotId) {
        self.one_shot(|m| {
            if !m.spot_arena.contains_key(&id) {
                return;
            }
            m.spots_updated.insert(id);
            m.graph.mark_edges_of_spot_modified(id);
        })
    }

    // ========================================================================
    // EDGE MUTATIONS
    // ========================================================================

    /// Link two filtered spots with a weighted edge.
    pub fn add_edge(
        &mut self,
        source: SpotId,
        target: SpotId,
        weight: f64,
    ) -> Result<EdgeId, ModelError> {
        self.one_shot(|m| m.graph.add_edge(source, target, weight))
    }

    /// Remove the edge between two spots, if any, deselecting it.
    pub fn remove_edge(&mut self, source: SpotId, target: SpotId) -> Option<EdgeId> {
        self.one_shot(|m| {
            let edge = m.graph.remove_edge(source, target)?;
            m.selection.remove_edge(edge);
            Some(edge)
        })
    }

    /// Remove an edge by handle, deselecting it. Idempotent.
    pub fn remove_edge_by_id(&mut self, edge: EdgeId) -> bool {
        self.one_shot(|m| {
            let removed = m.graph.remove_edge_by_id(edge);
            if removed {
                m.selection.remove_edge(edge);
            }
            removed
        })
    }

    /// Change an edge's weight, recording it as modified.
    pub fn set_edge_weight(&mut self, edge: EdgeId, weight: f64) -> Result<(), ModelError> {
        self.one_shot(|m| m.graph.set_edge_weight(edge, weight))
    }

    // ========================================================================
    // WHOLESALE SETTERS & FILTERING
    // ========================================================================

    /// Replace the spot content wholesale (a detection rerun). Derived
    /// state cannot survive: the filtered collection, graph, selection and
    /// pending diffs are reset. Signals only `SpotsComputed` when asked.
    pub fn set_spots(
        &mut self,
        spots: impl IntoIterator<Item = (Spot, FrameIndex)>,
        do_notify: bool,
    ) {
        self.one_shot(|m| {
            m.spot_arena.clear();
            m.spots.clear();
            m.filtered_spots.clear();
            m.graph.clear();
            // Clearing the graph recycles edge ids from slot 0, so stored
            // edge and track values must go with it or a future edge would
            // read a dead edge's value as its own.
            m.features.prune(&m.graph);
            m.selection.clear_selection();
            m.spots_added.clear();
            m.spots_removed.clear();
            m.spots_moved.clear();
            m.spots_updated.clear();
            for (mut spot, frame) in spots {
                let id = spot.id();
                if m.spots.add(id, frame) {
                    spot.put_feature(FEATURE_FRAME, frame as f64);
                    m.spot_arena.insert(id, spot);
                }
            }
            if do_notify {
                m.queue_event(ModelEvent::SpotsComputed);
            }
        })
    }

    /// Replace the filtered sub-collection wholesale. Ids not present in
    /// the unfiltered collection are dropped, keeping `filtered ⊆ spots`
    /// enforced rather than assumed. The graph vertex set follows, edges
    /// with lost endpoints disappear and tracks are recomputed directly.
    pub fn set_filtered_spots(&mut self, ids: HashSet<SpotId>, do_notify: bool) {
        self.one_shot(|m| {
            let kept: HashSet<SpotId> = ids
                .into_iter()
                .filter(|&id| m.spots.contains(id))
                .collect();
            m.filtered_spots.clear();
            for &id in &kept {
                let frame = m.spots.frame_of(id).unwrap();
                m.filtered_spots.add(id, frame);
            }
            m.graph.set_vertices(&kept);
            m.features.prune(&m.graph);
            if do_notify {
                m.queue_event(ModelEvent::SpotsFiltered);
            }
        })
    }

    /// Re-derive the filtered sub-collection from the given filters.
    pub fn filter_spots(&mut self, filters: &[FeatureFilter], do_notify: bool) {
        let passing: HashSet<SpotId> = self
            .spots
            .spot_ids()
            .filter(|id| {
                self.spot_arena
                    .get(id)
                    .map(|spot| passes_all(spot, filters))
                    .unwrap_or(false)
            })
            .collect();
        self.set_filtered_spots(passing, do_notify);
    }

    // ========================================================================
    // VISIBILITY
    // ========================================================================

    /// Flag one track visible or hidden. Returns `false` for unknown
    /// tracks.
    pub fn set_track_visibility(
        &mut self,
        track: TrackId,
        visible: bool,
        do_notify: bool,
    ) -> bool {
        self.one_shot(|m| {
            let changed = m.graph.is_track_visible(track) != visible;
            let known = m.graph.set_track_visible(track, visible);
            if known && changed && do_notify {
                m.queue_event(ModelEvent::TrackVisibilityChanged);
            }
            known
        })
    }

    /// Replace the visible-track set wholesale.
    pub fn set_visible_track_ids(&mut self, tracks: HashSet<TrackId>, do_notify: bool) {
        self.one_shot(|m| {
            m.graph.set_visible_track_ids(tracks);
            if do_notify {
                m.queue_event(ModelEvent::TrackVisibilityChanged);
            }
        })
    }

    fn queue_event(&mut self, event: ModelEvent) {
        if !self.event_cache.contains(&event) {
            self.event_cache.push(event);
        }
    }

    // ========================================================================
    // ACCESSORS
    // ========================================================================

    pub fn spot(&self, id: SpotId) -> Option<&Spot> {
        self.spot_arena.get(&id)
    }

    /// In-place payload access for external recomputation; pair with
    /// [`Model::mark_for_feature_update`] so the change is signaled.
    pub fn spot_mut(&mut self, id: SpotId) -> Option<&mut Spot> {
        self.spot_arena.get_mut(&id)
    }

    pub fn spots(&self) -> &SpotCollection {
        &self.spots
    }

    pub fn filtered_spots(&self) -> &SpotCollection {
        &self.filtered_spots
    }

    pub fn graph(&self) -> &TrackGraph {
        &self.graph
    }

    pub fn features(&self) -> &FeatureModel {
        &self.features
    }

    pub fn features_mut(&mut self) -> &mut FeatureModel {
        &mut self.features
    }

    pub fn selection(&self) -> &SelectionModel {
        &self.selection
    }

    pub fn selection_mut(&mut self) -> &mut SelectionModel {
        &mut self.selection
    }

    pub fn n_spots(&self) -> usize {
        self.spots.n_spots()
    }

    pub fn n_filtered_spots(&self) -> usize {
        self.filtered_spots.n_spots()
    }

    // ========================================================================
    // FLUSH
    // ========================================================================

    /// The invariant-preserving routine run once per outermost transaction
    /// close. Buffer consumption happens first via `mem::take`, so the next
    /// transaction starts from empty state no matter what the analyzers or
    /// listeners do.
    fn flush(&mut self) -> FlushReport {
        // 1. Consume every diff buffer and capture pre-recompute state.
        let added = std::mem::take(&mut self.spots_added);
        let removed = std::mem::take(&mut self.spots_removed);
        let moved = std::mem::take(&mut self.spots_moved);
        let updated = std::mem::take(&mut self.spots_updated);
        let edge_diff = self.graph.take_diff();
        let cached = std::mem::take(&mut self.event_cache);

        let structural = !edge_diff.is_empty();
        let pre_tracks: HashSet<TrackId> = self.graph.track_ids().collect();
        // Removed edges lose their track mapping at recompute; capture now.
        let removed_origins: Vec<TrackId> = edge_diff
            .removed
            .iter()
            .filter_map(|&e| self.graph.track_id_of_edge(e))
            .collect();

        // 2. Selective track re-derivation.
        if structural {
            self.graph.compute_tracks_from_graph();
        }

        // 3. Tracks to refresh: newly formed components, tracks of modified
        // edges, and tracks that lost an edge without splitting.
        let mut tracks_to_update: HashSet<TrackId> = self
            .graph
            .track_ids()
            .filter(|t| !pre_tracks.contains(t))
            .collect();
        for &edge in &edge_diff.modified {
            if let Some(track) = self.graph.track_id_of_edge(edge) {
                tracks_to_update.insert(track);
            }
        }
        for track in removed_origins {
            if self.graph.has_track(track) {
                tracks_to_update.insert(track);
            }
        }

        let mut failures = Vec::new();

        // 4. Spot features, restricted to spots still filtered (a spot
        // removed within the same transaction is excluded even if also
        // marked updated).
        let spot_targets: HashSet<SpotId> = added
            .iter()
            .chain(moved.iter())
            .chain(updated.iter())
            .copied()
            .filter(|&id| self.filtered_spots.contains(id))
            .collect();
        if !spot_targets.is_empty() {
            failures.extend(self.features.process_spots(&spot_targets, &mut self.spot_arena));
        }

        // 5. Edge features before track features, so track analyzers read
        // fresh edge values.
        let edge_targets: HashSet<EdgeId> = edge_diff
            .added
            .union(&edge_diff.modified)
            .copied()
            .collect();
        if !edge_targets.is_empty() {
            failures.extend(self.features.process_edges(&edge_targets, &self.graph, &self.spot_arena));
        }

        // 6. Track features over the refresh set.
        if structural {
            self.features.prune(&self.graph);
            if !tracks_to_update.is_empty() {
                failures.extend(self.features.process_tracks(
                    &tracks_to_update,
                    &self.graph,
                    &self.spot_arena,
                ));
            }
        }

        // 7. Consolidated event. Spot flags are inserted in reverse
        // precedence order so the last write realizes
        // Added > Removed > FrameChanged > Modified.
        let mut change = ModelChange::new();
        for &id in &updated {
            change.put_spot_flag(id, SpotFlag::Modified);
        }
        for &id in &moved {
            change.put_spot_flag(id, SpotFlag::FrameChanged);
        }
        for &id in &removed {
            change.put_spot_flag(id, SpotFlag::Removed);
        }
        for &id in &added {
            change.put_spot_flag(id, SpotFlag::Added);
        }
        for &edge in &edge_diff.modified {
            change.put_edge_flag(edge, EdgeFlag::Modified);
        }
        for &edge in &edge_diff.removed {
            change.put_edge_flag(edge, EdgeFlag::Removed);
        }
        for &edge in &edge_diff.added {
            change.put_edge_flag(edge, EdgeFlag::Added);
        }
        change.set_tracks_updated(tracks_to_update.clone());

        let event_fired = !change.is_empty();
        let tracks_updated = tracks_to_update.len();
        if event_fired {
            tracing::debug!(
                spots = change.n_spots(),
                edges = change.n_edges(),
                tracks = tracks_updated,
                "flush: firing consolidated model event"
            );
            events::dispatch(&self.listeners, &ModelEvent::ModelModified(change));
        }

        // 8. Cached simple events, after the consolidated one.
        for event in &cached {
            events::dispatch(&self.listeners, event);
        }

        // 9. Buffers were cleared up front; failures are reported, never
        // propagated, so later transactions stay unaffected.
        for failure in &failures {
            tracing::warn!(
                key = %failure.key,
                error = %failure.error,
                "analyzer failed during flush; affected feature values remain stale"
            );
        }

        FlushReport {
            event_fired,
            tracks_updated,
            analyzer_failures: failures,
        }
    }
}

impl std::fmt::Display for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Model: {} spots ({} filtered), {} tracks ({} visible)",
            self.n_spots(),
            self.n_filtered_spots(),
            self.graph.n_tracks(),
            self.graph.visible_track_ids().len()
        )
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spot::FEATURE_QUALITY;
    use crate::spotline_features::{AnalyzerError, AnalyzerScope, SpotAnalyzer, TrackAnalyzer};
    use crate::spotline_features::TrackFeatureValues;
    use rand::prelude::*;
    use rand_chacha::ChaCha8Rng;
    use std::sync::Mutex;

    fn recording_listener() -> (Arc<Mutex<Vec<ModelEvent>>>, Arc<dyn ModelChangeListener>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let listener: Arc<dyn ModelChangeListener> =
            Arc::new(move |e: &ModelEvent| sink.lock().unwrap().push(e.clone()));
        (events, listener)
    }

    fn quality_spot(q: f64) -> Spot {
        Spot::at(0.0, 0.0, 0.0, 1.0, q)
    }

    /// One linked pair: S1 at frame 0, S2 at frame 1, edge between them.
    fn linked_pair(model: &mut Model) -> (SpotId, SpotId, EdgeId) {
        model.begin_update();
        let s1 = model.add_spot(quality_spot(1.0), 0);
        let s2 = model.add_spot(quality_spot(1.0), 1);
        let edge = model.add_edge(s1, s2, 1.0).unwrap();
        model.end_update().unwrap();
        (s1, s2, edge)
    }

    fn only_modified(events: &[ModelEvent]) -> Vec<ModelChange> {
        events
            .iter()
            .filter_map(|e| match e {
                ModelEvent::ModelModified(c) => Some(c.clone()),
                _ => None,
            })
            .collect()
    }

    struct FailingSpotAnalyzer;

    impl SpotAnalyzer for FailingSpotAnalyzer {
        fn process(
            &mut self,
            _targets: &HashSet<SpotId>,
            _spots: &mut HashMap<SpotId, Spot>,
        ) -> Result<(), AnalyzerError> {
            Err(AnalyzerError("deliberate".into()))
        }
    }

    struct RecordingSpotAnalyzer {
        calls: Arc<Mutex<Vec<HashSet<SpotId>>>>,
    }

    impl SpotAnalyzer for RecordingSpotAnalyzer {
        fn process(
            &mut self,
            targets: &HashSet<SpotId>,
            _spots: &mut HashMap<SpotId, Spot>,
        ) -> Result<(), AnalyzerError> {
            self.calls.lock().unwrap().push(targets.clone());
            Ok(())
        }
    }

    struct CountingTrackAnalyzer {
        calls: Arc<Mutex<Vec<HashSet<TrackId>>>>,
    }

    impl TrackAnalyzer for CountingTrackAnalyzer {
        fn process(
            &mut self,
            targets: &HashSet<TrackId>,
            _graph: &TrackGraph,
            _spots: &HashMap<SpotId, Spot>,
            _values: &mut TrackFeatureValues,
        ) -> Result<(), AnalyzerError> {
            self.calls.lock().unwrap().push(targets.clone());
            Ok(())
        }
    }

    #[test]
    fn test_scenario_a_linked_pair_forms_one_track() {
        let mut model = Model::new();
        let (events, listener) = recording_listener();
        model.add_listener(listener);

        let (s1, s2, edge) = linked_pair(&mut model);

        assert_eq!(model.graph().n_tracks(), 1);
        assert_eq!(model.graph().n_edges(), 1);
        let track = model.graph().track_id_of_spot(s1).unwrap();
        assert_eq!(model.graph().track_spots(track).unwrap().len(), 2);

        let changes = only_modified(&events.lock().unwrap());
        assert_eq!(changes.len(), 1);
        let change = &changes[0];
        assert_eq!(change.spot_flag(s1), Some(SpotFlag::Added));
        assert_eq!(change.spot_flag(s2), Some(SpotFlag::Added));
        assert_eq!(change.edge_flag(edge), Some(EdgeFlag::Added));
        assert!(change.tracks_updated().contains(&track));
    }

    #[test]
    fn test_scenario_b_move_there_and_back_nets_one_move() {
        let mut model = Model::new();
        let (s1, _, edge) = linked_pair(&mut model);
        let (events, listener) = recording_listener();
        model.add_listener(listener);

        model.begin_update();
        model.move_spot(s1, 0, 2);
        model.move_spot(s1, 2, 0);
        model.end_update().unwrap();

        let changes = only_modified(&events.lock().unwrap());
        assert_eq!(changes.len(), 1);
        let change = &changes[0];
        assert_eq!(change.spot_flag(s1), Some(SpotFlag::FrameChanged));
        assert_eq!(change.n_spots(), 1);
        // Incident edge marked modified exactly once regardless of move count
        assert_eq!(change.edge_flag(edge), Some(EdgeFlag::Modified));
        assert_eq!(change.n_edges(), 1);
        assert_eq!(model.spots().frame_of(s1), Some(0));
    }

    #[test]
    fn test_scenario_c_remove_spot_cascades() {
        let mut model = Model::new();
        let (s1, s2, edge) = linked_pair(&mut model);
        model.selection_mut().add_spot(s2);
        model.selection_mut().add_edge(edge);
        let (events, listener) = recording_listener();
        model.add_listener(listener);

        let payload = model.remove_spot(s2, None);
        assert!(payload.is_some());

        assert_eq!(model.n_spots(), 1);
        assert_eq!(model.graph().n_edges(), 0);
        assert_eq!(model.graph().n_tracks(), 1);
        assert!(model.graph().track_id_of_spot(s1).is_some());
        assert!(!model.selection().is_spot_selected(s2));
        assert!(!model.selection().is_edge_selected(edge));

        let changes = only_modified(&events.lock().unwrap());
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].spot_flag(s2), Some(SpotFlag::Removed));
        assert_eq!(changes[0].edge_flag(edge), Some(EdgeFlag::Removed));
    }

    #[test]
    fn test_remove_spot_twice_is_idempotent() {
        let mut model = Model::new();
        let (_, s2, _) = linked_pair(&mut model);
        assert!(model.remove_spot(s2, None).is_some());
        assert!(model.remove_spot(s2, None).is_none());
        assert!(model.remove_spot(s2, Some(1)).is_none());
    }

    #[test]
    fn test_nested_transactions_fire_exactly_one_event() {
        let mut model = Model::new();
        let (events, listener) = recording_listener();
        model.add_listener(listener);

        model.begin_update();
        let s1 = model.add_spot(quality_spot(1.0), 0);
        model.begin_update();
        let s2 = model.add_spot(quality_spot(1.0), 1);
        assert!(!model.end_update().unwrap().event_fired);
        model.add_edge(s1, s2, 1.0).unwrap();
        let report = model.end_update().unwrap();

        assert!(report.event_fired);
        assert_eq!(events.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_unbalanced_end_update_is_rejected() {
        let mut model = Model::new();
        assert!(matches!(
            model.end_update(),
            Err(ModelError::UnbalancedTransaction)
        ));

        // The rejection corrupts nothing: a proper transaction still works.
        model.begin_update();
        model.add_spot(quality_spot(1.0), 0);
        assert!(model.end_update().unwrap().event_fired);
    }

    #[test]
    fn test_one_shot_mutation_flushes_synchronously() {
        let mut model = Model::new();
        let (events, listener) = recording_listener();
        model.add_listener(listener);

        model.add_spot(quality_spot(1.0), 0);
        assert_eq!(
            only_modified(&events.lock().unwrap()).len(),
            1,
            "mutation outside a transaction must notify immediately"
        );
    }

    #[test]
    fn test_add_then_remove_in_one_transaction_is_silent() {
        let mut model = Model::new();
        let calls = Arc::new(Mutex::new(Vec::new()));
        model.features_mut().register_spot_analyzer(
            "recorder",
            Box::new(RecordingSpotAnalyzer { calls: calls.clone() }),
        );
        let (events, listener) = recording_listener();
        model.add_listener(listener);

        model.begin_update();
        let id = model.add_spot(quality_spot(1.0), 0);
        model.remove_spot(id, Some(0));
        let report = model.end_update().unwrap();

        assert!(!report.event_fired);
        assert!(events.lock().unwrap().is_empty());
        assert!(
            calls.lock().unwrap().is_empty(),
            "no feature recomputation for a cancelled spot"
        );
    }

    #[test]
    fn test_flag_precedence_added_beats_modified() {
        let mut model = Model::new();
        let (events, listener) = recording_listener();
        model.add_listener(listener);

        model.begin_update();
        let id = model.add_spot(quality_spot(1.0), 0);
        model.mark_for_feature_update(id);
        model.end_update().unwrap();

        let changes = only_modified(&events.lock().unwrap());
        assert_eq!(changes[0].spot_flag(id), Some(SpotFlag::Added));
    }

    #[test]
    fn test_move_from_wrong_frame_marks_edges_only() {
        let mut model = Model::new();
        let (s1, _, edge) = linked_pair(&mut model);
        let (events, listener) = recording_listener();
        model.add_listener(listener);

        model.move_spot(s1, 5, 7);

        let changes = only_modified(&events.lock().unwrap());
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].spot_flag(s1), None);
        assert_eq!(changes[0].edge_flag(edge), Some(EdgeFlag::Modified));
        assert_eq!(model.spots().frame_of(s1), Some(0));
    }

    #[test]
    fn test_mark_unknown_spot_is_silent() {
        let mut model = Model::new();
        linked_pair(&mut model);
        let (events, listener) = recording_listener();
        model.add_listener(listener);

        model.mark_for_feature_update(SpotId(u32::MAX));

        assert!(
            events.lock().unwrap().is_empty(),
            "no event may name a nonexistent spot"
        );
    }

    #[test]
    fn test_track_ids_stable_when_components_unchanged() {
        let mut model = Model::new();
        let (s1, _, _) = linked_pair(&mut model);
        let track = model.graph().track_id_of_spot(s1).unwrap();

        // Marking a spot updated touches its edges, forcing a recompute,
        // but the component is unchanged so the ID must survive.
        model.mark_for_feature_update(s1);
        assert_eq!(model.graph().track_id_of_spot(s1), Some(track));
    }

    #[test]
    fn test_split_and_merge_report_fresh_ids() {
        let mut model = Model::new();
        model.begin_update();
        let ids: Vec<SpotId> = (0..4)
            .map(|f| model.add_spot(quality_spot(1.0), f))
            .collect();
        model.add_edge(ids[0], ids[1], 1.0).unwrap();
        model.add_edge(ids[1], ids[2], 1.0).unwrap();
        model.add_edge(ids[2], ids[3], 1.0).unwrap();
        model.end_update().unwrap();
        let original = model.graph().track_id_of_spot(ids[0]).unwrap();

        let (events, listener) = recording_listener();
        model.add_listener(listener);

        // Split.
        model.remove_edge(ids[1], ids[2]).unwrap();
        let left = model.graph().track_id_of_spot(ids[0]).unwrap();
        let right = model.graph().track_id_of_spot(ids[3]).unwrap();
        assert_ne!(left, right);
        assert_ne!(left, original);
        let changes = only_modified(&events.lock().unwrap());
        assert_eq!(changes[0].tracks_updated(), &HashSet::from([left, right]));

        // Merge.
        model.add_edge(ids[1], ids[2], 1.0).unwrap();
        let merged = model.graph().track_id_of_spot(ids[0]).unwrap();
        assert_ne!(merged, left);
        assert_ne!(merged, right);
        assert!(!model.graph().has_track(left));
        assert!(!model.graph().has_track(right));
        let changes = only_modified(&events.lock().unwrap());
        assert_eq!(changes[1].tracks_updated(), &HashSet::from([merged]));
    }

    #[test]
    fn test_analyzer_failure_is_reported_and_buffers_still_clear() {
        let mut model = Model::new();
        model
            .features_mut()
            .register_spot_analyzer("bad", Box::new(FailingSpotAnalyzer));
        let (events, listener) = recording_listener();
        model.add_listener(listener);

        model.begin_update();
        let first = model.add_spot(quality_spot(1.0), 0);
        let report = model.end_update().unwrap();
        assert!(report.event_fired);
        assert_eq!(report.analyzer_failures.len(), 1);
        assert_eq!(report.analyzer_failures[0].key, "bad");

        // The next transaction starts from empty buffers: its event must
        // not mention the first spot again.
        model.begin_update();
        let second = model.add_spot(quality_spot(1.0), 1);
        let report = model.end_update().unwrap();
        assert!(report.event_fired);

        let changes = only_modified(&events.lock().unwrap());
        assert_eq!(changes[1].spot_flag(first), None);
        assert_eq!(changes[1].spot_flag(second), Some(SpotFlag::Added));
    }

    #[test]
    fn test_cached_events_follow_the_consolidated_event() {
        let mut model = Model::new();
        let (s1, _, _) = linked_pair(&mut model);
        let track = model.graph().track_id_of_spot(s1).unwrap();
        let (events, listener) = recording_listener();
        model.add_listener(listener);

        model.begin_update();
        model.add_spot(quality_spot(1.0), 3);
        model.set_track_visibility(track, false, true);
        model.set_track_visibility(track, true, true);
        model.end_update().unwrap();

        let log = events.lock().unwrap();
        assert_eq!(log.len(), 2, "visibility event is deduplicated");
        assert!(matches!(log[0], ModelEvent::ModelModified(_)));
        assert_eq!(log[1], ModelEvent::TrackVisibilityChanged);
    }

    #[test]
    fn test_filter_spots_derives_subset_and_resets_graph() {
        let mut model = Model::new();
        model.begin_update();
        let good = model.add_spot(quality_spot(0.9), 0);
        let bad = model.add_spot(quality_spot(0.2), 1);
        model.add_edge(good, bad, 1.0).unwrap();
        model.end_update().unwrap();
        let (events, listener) = recording_listener();
        model.add_listener(listener);

        model.filter_spots(&[FeatureFilter::new(FEATURE_QUALITY, 0.5, true)], true);

        assert_eq!(model.n_spots(), 2);
        assert_eq!(model.n_filtered_spots(), 1);
        assert!(model.filtered_spots().contains(good));
        assert!(!model.filtered_spots().contains(bad));
        assert_eq!(model.graph().n_vertices(), 1);
        assert_eq!(model.graph().n_edges(), 0, "edge lost its endpoint");
        assert_eq!(model.graph().n_tracks(), 1);
        assert_eq!(*events.lock().unwrap(), vec![ModelEvent::SpotsFiltered]);
    }

    #[test]
    fn test_set_spots_resets_derived_state() {
        let mut model = Model::new();
        linked_pair(&mut model);
        let (events, listener) = recording_listener();
        model.add_listener(listener);

        let fresh: Vec<(Spot, FrameIndex)> =
            (0..3).map(|f| (quality_spot(1.0), f)).collect();
        model.set_spots(fresh, true);

        assert_eq!(model.n_spots(), 3);
        assert_eq!(model.n_filtered_spots(), 0);
        assert_eq!(model.graph().n_tracks(), 0);
        assert_eq!(*events.lock().unwrap(), vec![ModelEvent::SpotsComputed]);
    }

    #[test]
    fn test_set_spots_drops_stored_feature_values() {
        let mut model = Model::new();
        let (s1, _, edge) = linked_pair(&mut model);
        let track = model.graph().track_id_of_spot(s1).unwrap();
        model.features_mut().put_edge_feature(edge, "cost", 42.0);
        model.features_mut().put_track_feature(track, "n_spots", 2.0);

        model.set_spots(Vec::new(), false);

        // The reset recycles edge ids from slot 0; a recreated edge must
        // start with no feature values, not inherit the dead edge's.
        model.begin_update();
        let a = model.add_spot(quality_spot(1.0), 0);
        let b = model.add_spot(quality_spot(1.0), 1);
        let fresh = model.add_edge(a, b, 1.0).unwrap();
        model.end_update().unwrap();

        assert_eq!(fresh, edge, "arena restarts from slot zero");
        assert_eq!(model.features().edge_feature(fresh, "cost"), None);
        assert_eq!(model.features().track_feature(track, "n_spots"), None);
    }

    #[test]
    fn test_track_analyzer_runs_only_on_structural_change() {
        let mut model = Model::new();
        let calls = Arc::new(Mutex::new(Vec::new()));
        model.features_mut().register_track_analyzer(
            "duration",
            AnalyzerScope::Local,
            Box::new(CountingTrackAnalyzer { calls: calls.clone() }),
        );

        // Spot-only transaction: no structural edge change, no dispatch.
        model.add_spot(quality_spot(1.0), 9);
        assert!(calls.lock().unwrap().is_empty());

        let (s1, _, _) = linked_pair(&mut model);
        let track = model.graph().track_id_of_spot(s1).unwrap();
        let recorded = calls.lock().unwrap().clone();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0], HashSet::from([track]));
    }

    #[test]
    fn test_randomized_mutations_preserve_invariants() {
        fn assert_invariants(model: &Model) {
            let filtered: HashSet<SpotId> = model.filtered_spots().spot_ids().collect();
            for &id in &filtered {
                assert!(model.spots().contains(id), "filtered must be subset of spots");
                assert_eq!(
                    model.spots().frame_of(id),
                    model.filtered_spots().frame_of(id)
                );
            }
            let vertices: HashSet<SpotId> = model.graph().vertices().collect();
            assert_eq!(vertices, filtered, "graph vertices must mirror filtered spots");

            let mut seen = HashSet::new();
            for track in model.graph().track_ids() {
                for &spot in model.graph().track_spots(track).unwrap() {
                    assert!(seen.insert(spot), "spot assigned to two tracks");
                }
            }
            assert_eq!(seen, vertices, "tracks must partition the vertex set");
        }

        let mut rng = ChaCha8Rng::seed_from_u64(0x5107);
        let mut model = Model::new();
        let mut known: Vec<SpotId> = Vec::new();

        for _ in 0..200 {
            let batched = rng.gen_bool(0.3);
            if batched {
                model.begin_update();
            }
            for _ in 0..rng.gen_range(1..4) {
                match rng.gen_range(0..5) {
                    0 => {
                        let frame = rng.gen_range(0..6);
                        known.push(model.add_spot(quality_spot(1.0), frame));
                    }
                    1 if !known.is_empty() => {
                        let id = known.swap_remove(rng.gen_range(0..known.len()));
                        model.remove_spot(id, None);
                    }
                    2 if known.len() >= 2 => {
                        let a = known[rng.gen_range(0..known.len())];
                        let b = known[rng.gen_range(0..known.len())];
                        let _ = model.add_edge(a, b, rng.gen_range(0.1..2.0));
                    }
                    3 if !known.is_empty() => {
                        let id = known[rng.gen_range(0..known.len())];
                        if let Some(from) = model.spots().frame_of(id) {
                            model.move_spot(id, from, rng.gen_range(0..6));
                        }
                    }
                    4 if known.len() >= 2 => {
                        let a = known[rng.gen_range(0..known.len())];
                        let b = known[rng.gen_range(0..known.len())];
                        let _ = model.remove_edge(a, b);
                    }
                    _ => {}
                }
            }
            if batched {
                model.end_update().unwrap();
            }
            assert_invariants(&model);
        }
    }
}
