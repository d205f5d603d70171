//! A validated input dataset, grouped by timepoint and spatially indexed.
//!
//! `Dataset` is the read-only form the matcher consumes: the forest
//! invariants have been checked once up front, spots are bucketed per
//! timepoint, and each timepoint carries an R*-tree over its centers.

use crate::model::{LineageModel, ModelError, SpotId};
use crate::spatial::SpatialIndex;
use crate::tags::TagData;

/// One input to the merge: model, tags, and per-timepoint indexes.
#[derive(Debug, Clone)]
pub struct Dataset {
    model: LineageModel,
    tags: TagData,

    /// Spot handles bucketed by timepoint, indexed 0..=max
    spots_by_timepoint: Vec<Vec<SpotId>>,

    /// Spatial index per timepoint, parallel to the buckets
    indexes: Vec<SpatialIndex>,

    /// Largest timepoint holding at least one spot
    max_timepoint: Option<u32>,
}

impl Dataset {
    /// Validate a model and index it for matching.
    ///
    /// Fails if the model violates the lineage forest invariants
    /// (single parent, at most two children, time-forward links).
    pub fn new(model: LineageModel, tags: TagData) -> Result<Self, ModelError> {
        model.validate_forest()?;

        let max_timepoint = model.max_timepoint();
        let buckets = max_timepoint.map_or(0, |t| t as usize + 1);

        let mut spots_by_timepoint = vec![Vec::new(); buckets];
        for (id, spot) in model.spots() {
            spots_by_timepoint[spot.timepoint as usize].push(id);
        }

        let indexes = spots_by_timepoint
            .iter()
            .map(|ids| {
                SpatialIndex::build(ids.iter().map(|&id| (id, model.spot(id).position)))
            })
            .collect();

        Ok(Self {
            model,
            tags,
            spots_by_timepoint,
            indexes,
            max_timepoint,
        })
    }

    /// Dataset with no spots, links, or tags.
    pub fn empty() -> Self {
        Self {
            model: LineageModel::new(),
            tags: TagData::empty(),
            spots_by_timepoint: Vec::new(),
            indexes: Vec::new(),
            max_timepoint: None,
        }
    }

    pub fn model(&self) -> &LineageModel {
        &self.model
    }

    pub fn tags(&self) -> &TagData {
        &self.tags
    }

    /// Largest timepoint holding at least one spot, `None` when empty.
    pub fn max_non_empty_timepoint(&self) -> Option<u32> {
        self.max_timepoint
    }

    /// Spot handles at the given timepoint, empty when out of range.
    pub fn spots_at(&self, timepoint: u32) -> &[SpotId] {
        match self.spots_by_timepoint.get(timepoint as usize) {
            Some(ids) => ids,
            None => &[],
        }
    }

    /// Spatial index for the given timepoint, `None` when out of range.
    pub fn spatial_index(&self, timepoint: u32) -> Option<&SpatialIndex> {
        self.indexes.get(timepoint as usize)
    }
}

// ============================================================================
// TESTS
// ============================================================================
