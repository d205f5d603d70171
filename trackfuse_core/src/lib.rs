//! TrackFuse Core - Lineage Merge Engine for Cell Tracking Projects
//!
//! This library reconciles two independently curated cell-lineage
//! datasets into one merged lineage, solving three problems:
//! 1. **Correspondence**: which spots depict the same cell, via
//!    R*-tree candidate search gated by Mahalanobis distance
//! 2. **Ambiguity**: which correspondences are trustworthy, via ratio
//!    pruning and mutual-best-match classification
//! 3. **Reconciliation**: folding both datasets into one forest while
//!    tagging every structural, tag, and label disagreement

pub mod dataset;
pub mod ellipsoid;
pub mod interpolate;
pub mod matching;
pub mod merge;
pub mod model;
pub mod spatial;
pub mod storage;
pub mod tags;

// Re-export key types for convenience
pub use dataset::Dataset;
pub use interpolate::fill_gaps;
pub use matching::{ConflictHandling, MatchingError, MatchingGraph};
pub use merge::{
    merge_datasets, merge_datasets_with, MergeError, MergeParams, MergeSummary, MergedModel,
};
pub use model::{LineageModel, Link, LinkId, ModelError, Spot, SpotId};
pub use storage::{load_dataset, load_project, save_project, StorageError};
pub use tags::{TagData, TagStructure};
