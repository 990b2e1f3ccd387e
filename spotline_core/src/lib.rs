//! Spotline Core - Transactional Spot/Track Model for Tracking Pipelines
//!
//! The shared data model of a spatio-temporal object-tracking pipeline:
//! spots per time frame, a sparse weighted graph of links between them, and
//! tracks derived as connected components of that graph. Detection,
//! filtering, tracking and manual-editing stages mutate this state through
//! the transactional orchestrator, which keeps three things consistent:
//! 1. **Track decomposition**: recomputed selectively, with stable IDs for
//!    unchanged components and fresh IDs after splits and merges
//! 2. **Feature values**: spot, edge and track features re-derived in
//!    dependency order for exactly the touched entities
//! 3. **Notifications**: one consolidated change event per transaction,
//!    delivered synchronously to listeners in registration order

pub mod events;
pub mod selection;
pub mod spot;
pub mod spotline_features;
pub mod spotline_graph;
pub mod spotline_model;

// Re-export key types for convenience
pub use events::{EdgeFlag, ModelChange, ModelChangeListener, ModelEvent, SpotFlag};
pub use selection::{SelectionChangeEvent, SelectionChangeListener, SelectionModel};
pub use spot::{FeatureFilter, FrameIndex, Spot, SpotCollection, SpotId};
pub use spotline_features::{
    AnalyzerError, AnalyzerFailure, AnalyzerScope, EdgeAnalyzer, FeatureModel, SpotAnalyzer,
    TrackAnalyzer,
};
pub use spotline_graph::{EdgeDiff, EdgeId, TrackGraph, TrackId};
pub use spotline_model::{FlushReport, Model, ModelError};
