//! The "LINEAGE" Engine - Arena-Backed Spot/Link Storage
//!
//! Stores one tracked dataset as a pair of append-only pools:
//! - Spots: ellipsoid detections pinned to integer timepoints
//! - Links: directed edges that always point forward in time
//!
//! Handles (`SpotId`, `LinkId`) are dense indices into the pools, so
//! lookups are plain array accesses and iteration order is creation
//! order. Nothing is ever removed; merge outputs are built fresh.

use nalgebra::{Matrix3, Vector3};
use std::fmt;

// ============================================================================
// HANDLES
// ============================================================================

/// Dense handle into the spot pool of a [`LineageModel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SpotId(pub u32);

impl SpotId {
    /// Pool index of this handle.
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for SpotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Dense handle into the link pool of a [`LineageModel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(pub u32);

impl LinkId {
    /// Pool index of this handle.
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// SPOT & LINK
// ============================================================================

/// One detected cell at one timepoint, modelled as an ellipsoid.
#[derive(Debug, Clone, PartialEq)]
pub struct Spot {
    /// Integer frame index this spot belongs to
    pub timepoint: u32,

    /// Ellipsoid center in world coordinates
    pub position: Vector3<f64>,

    /// Symmetric positive-definite 3x3 shape matrix of the ellipsoid
    pub covariance: Matrix3<f64>,

    /// Free-form user label, if the curator named this spot
    pub label: Option<String>,
}

/// A directed edge between two spots, always forward in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Link {
    /// Earlier spot (the parent side)
    pub source: SpotId,

    /// Later spot (the child side)
    pub target: SpotId,
}

// ============================================================================
// LINEAGE MODEL (The Arena)
// ============================================================================

/// Append-only spot/link graph with adjacency lists on both ends.
///
/// The graph is expected to be a forest over time: every spot has at
/// most one parent and at most two children. Construction does not
/// enforce this; call [`LineageModel::validate_forest`] after loading
/// untrusted data.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LineageModel {
    /// Spot pool, indexed by `SpotId`
    spots: Vec<Spot>,

    /// Link pool, indexed by `LinkId`
    links: Vec<Link>,

    /// Per-spot outgoing links (this spot is the source)
    outgoing: Vec<Vec<LinkId>>,

    /// Per-spot incoming links (this spot is the target)
    incoming: Vec<Vec<LinkId>>,
}

impl LineageModel {
    /// Create an empty model.
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================================================
    // CONSTRUCTION
    // ========================================================================

    /// Append a spot to the pool and return its handle.
    pub fn add_spot(&mut self, spot: Spot) -> SpotId {
        let id = SpotId(self.spots.len() as u32);
        self.spots.push(spot);
        self.outgoing.push(Vec::new());
        self.incoming.push(Vec::new());
        id
    }

    /// Append a link to the pool and wire up both adjacency lists.
    ///
    /// # Panics
    ///
    /// Panics if either spot handle is out of range.
    pub fn add_link(&mut self, source: SpotId, target: SpotId) -> LinkId {
        let id = LinkId(self.links.len() as u32);
        self.outgoing[source.index()].push(id);
        self.incoming[target.index()].push(id);
        self.links.push(Link { source, target });
        id
    }

    /// Re-point an existing link at new endpoints, keeping its handle.
    ///
    /// Used by gap interpolation to splice intermediate spots into a
    /// link that skips timepoints without disturbing tags attached to
    /// the original link.
    ///
    /// # Panics
    ///
    /// Panics if the link or either spot handle is out of range.
    pub fn rewire_link(&mut self, link: LinkId, source: SpotId, target: SpotId) {
        let old = self.links[link.index()];
        self.outgoing[old.source.index()].retain(|&l| l != link);
        self.incoming[old.target.index()].retain(|&l| l != link);
        self.outgoing[source.index()].push(link);
        self.incoming[target.index()].push(link);
        self.links[link.index()] = Link { source, target };
    }

    /// Replace the label of an existing spot.
    pub fn set_label(&mut self, spot: SpotId, label: Option<String>) {
        self.spots[spot.index()].label = label;
    }

    // ========================================================================
    // ACCESSORS
    // ========================================================================

    /// Get a spot by handle.
    #[inline]
    pub fn spot(&self, id: SpotId) -> &Spot {
        &self.spots[id.index()]
    }

    /// Get a link by handle.
    #[inline]
    pub fn link(&self, id: LinkId) -> &Link {
        &self.links[id.index()]
    }

    /// Number of spots in the pool.
    pub fn spot_count(&self) -> usize {
        self.spots.len()
    }

    /// Number of links in the pool.
    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    /// Iterate spot handles in creation order.
    pub fn spot_ids(&self) -> impl Iterator<Item = SpotId> {
        (0..self.spots.len() as u32).map(SpotId)
    }

    /// Iterate link handles in creation order.
    pub fn link_ids(&self) -> impl Iterator<Item = LinkId> {
        (0..self.links.len() as u32).map(LinkId)
    }

    /// Iterate spots with their handles, in creation order.
    pub fn spots(&self) -> impl Iterator<Item = (SpotId, &Spot)> {
        self.spots
            .iter()
            .enumerate()
            .map(|(i, s)| (SpotId(i as u32), s))
    }

    /// Iterate links with their handles, in creation order.
    pub fn links(&self) -> impl Iterator<Item = (LinkId, &Link)> {
        self.links
            .iter()
            .enumerate()
            .map(|(i, l)| (LinkId(i as u32), l))
    }

    /// Links leaving the given spot (spot is the source).
    pub fn outgoing(&self, spot: SpotId) -> &[LinkId] {
        &self.outgoing[spot.index()]
    }

    /// Links entering the given spot (spot is the target).
    pub fn incoming(&self, spot: SpotId) -> &[LinkId] {
        &self.incoming[spot.index()]
    }

    /// Parent of the given spot, if any.
    ///
    /// In a valid forest a spot has at most one incoming link; when the
    /// forest invariant is violated this returns the first one recorded.
    pub fn parent(&self, spot: SpotId) -> Option<SpotId> {
        self.incoming[spot.index()]
            .first()
            .map(|&l| self.links[l.index()].source)
    }

    /// Children of the given spot, in link creation order.
    pub fn children(&self, spot: SpotId) -> impl Iterator<Item = SpotId> + '_ {
        self.outgoing[spot.index()]
            .iter()
            .map(|&l| self.links[l.index()].target)
    }

    /// Find an existing link between two spots, if one is recorded.
    pub fn link_between(&self, source: SpotId, target: SpotId) -> Option<LinkId> {
        self.outgoing[source.index()]
            .iter()
            .copied()
            .find(|&l| self.links[l.index()].target == target)
    }

    /// Largest timepoint that holds at least one spot.
    pub fn max_timepoint(&self) -> Option<u32> {
        self.spots.iter().map(|s| s.timepoint).max()
    }

    // ========================================================================
    // VALIDATION
    // ========================================================================

    /// Check the lineage forest invariants, returning the first violation.
    ///
    /// A valid model satisfies, for every spot:
    /// - at most one incoming link (single parent)
    /// - at most two outgoing links (binary division)
    ///
    /// and for every link: the source timepoint is strictly smaller than
    /// the target timepoint.
    pub fn validate_forest(&self) -> Result<(), ModelError> {
        for id in self.spot_ids() {
            let parents = self.incoming[id.index()].len();
            if parents > 1 {
                return Err(ModelError::MultipleParents { spot: id, count: parents });
            }
            let children = self.outgoing[id.index()].len();
            if children > 2 {
                return Err(ModelError::TooManyChildren { spot: id, count: children });
            }
        }
        for (id, link) in self.links() {
            let source_timepoint = self.spot(link.source).timepoint;
            let target_timepoint = self.spot(link.target).timepoint;
            if source_timepoint >= target_timepoint {
                return Err(ModelError::LinkNotForward {
                    link: id,
                    source_timepoint,
                    target_timepoint,
                });
            }
        }
        Ok(())
    }
}

// ============================================================================
// ERRORS
// ============================================================================

/// Violations of the lineage forest invariants.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ModelError {
    #[error("Spot {spot} has {count} parents; a spot may have at most one")]
    MultipleParents { spot: SpotId, count: usize },

    #[error("Spot {spot} has {count} children; a spot may divide into at most two")]
    TooManyChildren { spot: SpotId, count: usize },

    #[error("Link {link} does not point forward in time ({source_timepoint} -> {target_timepoint})")]
    LinkNotForward {
        link: LinkId,
        source_timepoint: u32,
        target_timepoint: u32,
    },
}

// ============================================================================
// TESTS
// ============================================================================
