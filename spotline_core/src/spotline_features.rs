//! The "FEATURES" Engine - Analyzer Registries & Value Stores
//!
//! Analyzers are registered externally with a scope tag fixed at
//! registration time:
//! - `Local` analyzers see exactly the entities touched by a transaction.
//! - `Global` edge analyzers see every edge of every track touched by a
//!   modified or added edge; global track analyzers see the full visible
//!   track set.
//!
//! An empty registry is a legal no-op. Analyzer failures are transient:
//! collected and reported at the flush boundary, never allowed to abort it.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

use crate::spot::{Spot, SpotId};
use crate::spotline_graph::{EdgeId, TrackGraph, TrackId};

// ============================================================================
// SCOPE & ERRORS
// ============================================================================

/// Whether an analyzer's value for an entity depends on the entity alone or
/// on its whole track. Resolved statically at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnalyzerScope {
    Local,
    Global,
}

/// Failure raised by an analyzer. Treated as transient at the flush
/// boundary; affected feature values stay stale.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct AnalyzerError(pub String);

/// Which registry an analyzer belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnalyzerKind {
    Spot,
    Edge,
    Track,
}

/// One collected analyzer failure, reported through the flush report.
#[derive(Debug, Clone)]
pub struct AnalyzerFailure {
    pub key: String,
    pub kind: AnalyzerKind,
    pub error: AnalyzerError,
}

// ============================================================================
// ANALYZER TRAITS
// ============================================================================

/// Computes spot features, writing into the spot payloads themselves.
/// Spot analyzers have no local/global split; they receive exactly the
/// requested set.
pub trait SpotAnalyzer: Send {
    fn process(
        &mut self,
        targets: &HashSet<SpotId>,
        spots: &mut HashMap<SpotId, Spot>,
    ) -> Result<(), AnalyzerError>;
}

/// Computes edge features into the edge value store.
pub trait EdgeAnalyzer: Send {
    fn process(
        &mut self,
        targets: &HashSet<EdgeId>,
        graph: &TrackGraph,
        spots: &HashMap<SpotId, Spot>,
        values: &mut EdgeFeatureValues,
    ) -> Result<(), AnalyzerError>;
}

/// Computes track features into the track value store.
pub trait TrackAnalyzer: Send {
    fn process(
        &mut self,
        targets: &HashSet<TrackId>,
        graph: &TrackGraph,
        spots: &HashMap<SpotId, Spot>,
        values: &mut TrackFeatureValues,
    ) -> Result<(), AnalyzerError>;
}

// ============================================================================
// VALUE STORES
// ============================================================================

/// (edge, feature-name) -> value. Absent entries mean "not yet computed".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EdgeFeatureValues {
    values: HashMap<EdgeId, HashMap<String, f64>>,
}

impl EdgeFeatureValues {
    pub fn put(&mut self, edge: EdgeId, key: impl Into<String>, value: f64) {
        self.values.entry(edge).or_default().insert(key.into(), value);
    }

    pub fn get(&self, edge: EdgeId, key: &str) -> Option<f64> {
        self.values.get(&edge)?.get(key).copied()
    }

    fn retain_edges(&mut self, keep: impl Fn(EdgeId) -> bool) {
        self.values.retain(|&edge, _| keep(edge));
    }
}

/// (track, feature-name) -> value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrackFeatureValues {
    values: HashMap<TrackId, HashMap<String, f64>>,
}

impl TrackFeatureValues {
    pub fn put(&mut self, track: TrackId, key: impl Into<String>, value: f64) {
        self.values.entry(track).or_default().insert(key.into(), value);
    }

    pub fn get(&self, track: TrackId, key: &str) -> Option<f64> {
        self.values.get(&track)?.get(key).copied()
    }

    fn retain_tracks(&mut self, keep: impl Fn(TrackId) -> bool) {
        self.values.retain(|&track, _| keep(track));
    }
}

// ============================================================================
// FEATURE MODEL
// ============================================================================

/// The analyzer registries (registration order preserved) plus the edge and
/// track value stores. Spot feature values live on the `Spot` payloads.
#[derive(Default)]
pub struct FeatureModel {
    spot_analyzers: Vec<(String, Box<dyn SpotAnalyzer>)>,
    edge_analyzers: Vec<(String, AnalyzerScope, Box<dyn EdgeAnalyzer>)>,
    track_analyzers: Vec<(String, AnalyzerScope, Box<dyn TrackAnalyzer>)>,
    edge_values: EdgeFeatureValues,
    track_values: TrackFeatureValues,
}

impl FeatureModel {
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================================================
    // REGISTRATION
    // ========================================================================

    pub fn register_spot_analyzer(
        &mut self,
        key: impl Into<String>,
        analyzer: Box<dyn SpotAnalyzer>,
    ) {
        self.spot_analyzers.push((key.into(), analyzer));
    }

    pub fn register_edge_analyzer(
        &mut self,
        key: impl Into<String>,
        scope: AnalyzerScope,
        analyzer: Box<dyn EdgeAnalyzer>,
    ) {
        self.edge_analyzers.push((key.into(), scope, analyzer));
    }

    pub fn register_track_analyzer(
        &mut self,
        key: impl Into<String>,
        scope: AnalyzerScope,
        analyzer: Box<dyn TrackAnalyzer>,
    ) {
        self.track_analyzers.push((key.into(), scope, analyzer));
    }

    // ========================================================================
    // VALUE ACCESS
    // ========================================================================

    pub fn edge_feature(&self, edge: EdgeId, key: &str) -> Option<f64> {
        self.edge_values.get(edge, key)
    }

    pub fn put_edge_feature(&mut self, edge: EdgeId, key: impl Into<String>, value: f64) {
        self.edge_values.put(edge, key, value);
    }

    pub fn track_feature(&self, track: TrackId, key: &str) -> Option<f64> {
        self.track_values.get(track, key)
    }

    pub fn put_track_feature(&mut self, track: TrackId, key: impl Into<String>, value: f64) {
        self.track_values.put(track, key, value);
    }

    // ========================================================================
    // DISPATCH
    // ========================================================================

    /// Run every spot analyzer over exactly `targets`.
    pub fn process_spots(
        &mut self,
        targets: &HashSet<SpotId>,
        spots: &mut HashMap<SpotId, Spot>,
    ) -> Vec<AnalyzerFailure> {
        let mut failures = Vec::new();
        for (key, analyzer) in &mut self.spot_analyzers {
            if let Err(error) = analyzer.process(targets, spots) {
                failures.push(AnalyzerFailure {
                    key: key.clone(),
                    kind: AnalyzerKind::Spot,
                    error,
                });
            }
        }
        failures
    }

    /// Run every edge analyzer. Local analyzers receive `targets`; global
    /// analyzers receive every edge of every track touched by `targets`,
    /// expanded lazily once and deduplicated.
    pub fn process_edges(
        &mut self,
        targets: &HashSet<EdgeId>,
        graph: &TrackGraph,
        spots: &HashMap<SpotId, Spot>,
    ) -> Vec<AnalyzerFailure> {
        let mut failures = Vec::new();
        let mut global_targets: Option<HashSet<EdgeId>> = None;
        for (key, scope, analyzer) in &mut self.edge_analyzers {
            let input: &HashSet<EdgeId> = match scope {
                AnalyzerScope::Local => targets,
                AnalyzerScope::Global => &*global_targets.get_or_insert_with(|| {
                    let tracks: HashSet<TrackId> = targets
                        .iter()
                        .filter_map(|&e| graph.track_id_of_edge(e))
                        .collect();
                    tracks
                        .iter()
                        .filter_map(|&t| graph.track_edges(t))
                        .flat_map(|edges| edges.iter().copied())
                        .collect()
                }),
            };
            if let Err(error) = analyzer.process(input, graph, spots, &mut self.edge_values) {
                failures.push(AnalyzerFailure {
                    key: key.clone(),
                    kind: AnalyzerKind::Edge,
                    error,
                });
            }
        }
        failures
    }

    /// Run every track analyzer. Local analyzers receive `targets`; global
    /// analyzers receive the full currently-visible track set.
    pub fn process_tracks(
        &mut self,
        targets: &HashSet<TrackId>,
        graph: &TrackGraph,
        spots: &HashMap<SpotId, Spot>,
    ) -> Vec<AnalyzerFailure> {
        let mut failures = Vec::new();
        for (key, scope, analyzer) in &mut self.track_analyzers {
            let input = match scope {
                AnalyzerScope::Local => targets,
                AnalyzerScope::Global => graph.visible_track_ids(),
            };
            if let Err(error) = analyzer.process(input, graph, spots, &mut self.track_values) {
                failures.push(AnalyzerFailure {
                    key: key.clone(),
                    kind: AnalyzerKind::Track,
                    error,
                });
            }
        }
        failures
    }

    /// Drop stored values for edges and tracks no longer in the graph.
    pub fn prune(&mut self, graph: &TrackGraph) {
        self.edge_values.retain_edges(|edge| graph.is_edge_alive(edge));
        self.track_values.retain_tracks(|track| graph.has_track(track));
    }
}

// ============================================================================
// TESTS
// ============================================================================
