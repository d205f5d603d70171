//! Per-timepoint spatial index over spot centers.
//!
//! Thin wrapper around an R*-tree keyed by spot handle. The matcher
//! walks candidates in increasing Euclidean distance and stops at the
//! distance cutoff, so the incremental nearest-neighbor iterator is
//! the whole point of this module.

use nalgebra::Vector3;
use rstar::primitives::GeomWithData;
use rstar::RTree;

use crate::model::SpotId;

type IndexedSpot = GeomWithData<[f64; 3], SpotId>;

/// R*-tree over the spot centers of a single timepoint.
#[derive(Debug, Clone)]
pub struct SpatialIndex {
    tree: RTree<IndexedSpot>,
}

impl SpatialIndex {
    /// Bulk-load an index from spot centers.
    pub fn build(entries: impl IntoIterator<Item = (SpotId, Vector3<f64>)>) -> Self {
        let entries: Vec<IndexedSpot> = entries
            .into_iter()
            .map(|(id, p)| GeomWithData::new([p.x, p.y, p.z], id))
            .collect();
        Self {
            tree: RTree::bulk_load(entries),
        }
    }

    /// Number of indexed spots.
    pub fn len(&self) -> usize {
        self.tree.size()
    }

    /// True if no spots are indexed.
    pub fn is_empty(&self) -> bool {
        self.tree.size() == 0
    }

    /// Walk spots in increasing Euclidean distance from `query`.
    ///
    /// Yields `(spot, squared distance)` pairs; the squared distances
    /// are non-decreasing, so callers can break at a squared cutoff.
    pub fn nearest_in_order(
        &self,
        query: &Vector3<f64>,
    ) -> impl Iterator<Item = (SpotId, f64)> + '_ {
        self.tree
            .nearest_neighbor_iter_with_distance_2(&[query.x, query.y, query.z])
            .map(|(entry, d2)| (entry.data, d2))
    }
}

// ============================================================================
// TESTS
// ============================================================================
