//! The "MATCHING" Engine - Bidirectional Candidate Correspondence Graph
//!
//! Decides which spots of two datasets depict the same cell, via a
//! 4-stage pipeline run once per timepoint in both directions:
//! 1. Spatial Pruning (R*-tree walk, squared Euclidean cutoff)
//! 2. Geometric Gating (squared Mahalanobis cutoff)
//! 3. Ratio Pruning (drop decisively worse alternatives)
//! 4. Classification (unmatched / perfect / ambiguous)
//!
//! Every spot of both inputs owns a vertex. A directed edge X -> Y
//! claims "Y plausibly depicts X's cell" and carries Y's center
//! measured against X's ellipsoid, so the two directions of a pair
//! generally disagree and a perfect match requires mutual agreement.

use std::collections::HashMap;
use std::fmt;

use petgraph::unionfind::UnionFind;
use tracing::{debug, warn};

use crate::dataset::Dataset;
use crate::ellipsoid::squared_mahalanobis;
use crate::merge::MergeParams;
use crate::model::SpotId;

// ============================================================================
// SIDES & HANDLES
// ============================================================================

/// Which input dataset a vertex belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GraphSide {
    A,
    B,
}

impl GraphSide {
    #[inline]
    pub fn index(self) -> usize {
        match self {
            GraphSide::A => 0,
            GraphSide::B => 1,
        }
    }

    /// The opposite side.
    #[inline]
    pub fn other(self) -> Self {
        match self {
            GraphSide::A => GraphSide::B,
            GraphSide::B => GraphSide::A,
        }
    }
}

impl fmt::Display for GraphSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GraphSide::A => write!(f, "A"),
            GraphSide::B => write!(f, "B"),
        }
    }
}

/// Dense handle into the vertex pool of a [`MatchingGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VertexId(pub u32);

impl VertexId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Dense handle into the edge pool of a [`MatchingGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EdgeId(pub u32);

impl EdgeId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

// ============================================================================
// VERTICES & EDGES
// ============================================================================

/// One spot of one input, as seen by the matcher.
#[derive(Debug, Clone)]
pub struct MatchingVertex {
    /// Which input the spot belongs to
    pub side: GraphSide,

    /// The spot in that input's model
    pub spot: SpotId,

    /// Candidate edges claimed by this vertex
    outgoing: Vec<EdgeId>,

    /// Candidate edges claiming this vertex
    incoming: Vec<EdgeId>,
}

/// A directed candidate claim between opposite sides.
#[derive(Debug, Clone)]
pub struct MatchingEdge {
    pub source: VertexId,
    pub target: VertexId,

    /// Squared Euclidean distance between the two centers
    pub squared_distance: f64,

    /// Target center against the source spot's ellipsoid
    pub squared_mahalanobis: f64,
}

/// How one vertex relates to the other dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchClass {
    /// No candidate edges in either direction
    Unmatched,

    /// Mutual best match with the given vertex
    Perfect(VertexId),

    /// Has candidates but no mutual agreement
    Ambiguous,
}

/// What to do when ambiguous candidates survive pruning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictHandling {
    /// Refuse to merge
    Fail,

    /// Log and let the merge tag the conflicts
    WarnOnly,
}

// ============================================================================
// MATCHING GRAPH (The Arena)
// ============================================================================

/// Bipartite candidate graph over the spots of two datasets.
///
/// Vertices and edges live in append-only pools; a per-side lookup
/// table maps spot handles back to vertices. [`prune`] builds a new
/// graph with identical vertex handles, so classifications before and
/// after pruning refer to the same vertices.
///
/// [`prune`]: MatchingGraph::prune
#[derive(Debug, Clone)]
pub struct MatchingGraph {
    vertices: Vec<MatchingVertex>,
    edges: Vec<MatchingEdge>,

    /// Per side: spot index -> vertex, sized to the input models
    lookup: [Vec<Option<VertexId>>; 2],
}

impl MatchingGraph {
    /// Empty graph prepared for the given input sizes.
    pub fn new(spots_a: usize, spots_b: usize) -> Self {
        Self {
            vertices: Vec::new(),
            edges: Vec::new(),
            lookup: [vec![None; spots_a], vec![None; spots_b]],
        }
    }

    /// Vertex for the given spot, creating it on first use.
    pub fn get_or_add_vertex(&mut self, side: GraphSide, spot: SpotId) -> VertexId {
        if let Some(v) = self.lookup[side.index()][spot.index()] {
            return v;
        }
        let v = VertexId(self.vertices.len() as u32);
        self.vertices.push(MatchingVertex {
            side,
            spot,
            outgoing: Vec::new(),
            incoming: Vec::new(),
        });
        self.lookup[side.index()][spot.index()] = Some(v);
        v
    }

    /// Vertex for the given spot, if one was created.
    pub fn vertex_of(&self, side: GraphSide, spot: SpotId) -> Option<VertexId> {
        self.lookup[side.index()][spot.index()]
    }

    /// Record a candidate claim. Sides of the endpoints must differ.
    pub fn add_edge(
        &mut self,
        source: VertexId,
        target: VertexId,
        squared_distance: f64,
        squared_mahalanobis: f64,
    ) -> EdgeId {
        debug_assert_ne!(
            self.vertices[source.index()].side,
            self.vertices[target.index()].side
        );
        let e = EdgeId(self.edges.len() as u32);
        self.vertices[source.index()].outgoing.push(e);
        self.vertices[target.index()].incoming.push(e);
        self.edges.push(MatchingEdge {
            source,
            target,
            squared_distance,
            squared_mahalanobis,
        });
        e
    }

    #[inline]
    pub fn vertex(&self, v: VertexId) -> &MatchingVertex {
        &self.vertices[v.index()]
    }

    #[inline]
    pub fn edge(&self, e: EdgeId) -> &MatchingEdge {
        &self.edges[e.index()]
    }

    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Iterate vertex handles in creation order.
    pub fn vertex_ids(&self) -> impl Iterator<Item = VertexId> {
        (0..self.vertices.len() as u32).map(VertexId)
    }

    /// Candidate claims made by this vertex.
    pub fn outgoing(&self, v: VertexId) -> &[EdgeId] {
        &self.vertices[v.index()].outgoing
    }

    /// Candidate claims made against this vertex.
    pub fn incoming(&self, v: VertexId) -> &[EdgeId] {
        &self.vertices[v.index()].incoming
    }

    /// The claim with the smallest Mahalanobis distance, first wins ties.
    pub fn best_outgoing(&self, v: VertexId) -> Option<EdgeId> {
        let mut best: Option<EdgeId> = None;
        for &e in self.outgoing(v) {
            match best {
                None => best = Some(e),
                Some(b)
                    if self.edges[e.index()].squared_mahalanobis
                        < self.edges[b.index()].squared_mahalanobis =>
                {
                    best = Some(e)
                }
                _ => {}
            }
        }
        best
    }

    // ========================================================================
    // STAGE 3: RATIO PRUNING
    // ========================================================================

    /// Drop candidate claims that are decisively worse than the claim
    /// before them.
    ///
    /// Per vertex, out-edges are sorted by Mahalanobis distance and the
    /// run is cut at the first consecutive pair whose ratio exceeds
    /// `squared_ratio`. The best claim always survives. The result is a
    /// fresh graph with identical vertex handles.
    pub fn prune(&self, squared_ratio: f64) -> MatchingGraph {
        let mut pruned = MatchingGraph {
            vertices: self
                .vertices
                .iter()
                .map(|v| MatchingVertex {
                    side: v.side,
                    spot: v.spot,
                    outgoing: Vec::new(),
                    incoming: Vec::new(),
                })
                .collect(),
            edges: Vec::new(),
            lookup: self.lookup.clone(),
        };

        let mut order: Vec<EdgeId> = Vec::new();
        for v in self.vertex_ids() {
            order.clear();
            order.extend_from_slice(self.outgoing(v));
            order.sort_by(|&x, &y| {
                self.edges[x.index()]
                    .squared_mahalanobis
                    .partial_cmp(&self.edges[y.index()].squared_mahalanobis)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });

            let mut prev = f64::NAN;
            for (i, &e) in order.iter().enumerate() {
                let m2 = self.edges[e.index()].squared_mahalanobis;
                // 0/0 is NaN, which never exceeds the ratio, so exact
                // ties at zero all survive; positive-after-zero is +inf
                // and ends the run.
                if i > 0 && m2 / prev > squared_ratio {
                    break;
                }
                let edge = &self.edges[e.index()];
                pruned.add_edge(edge.source, edge.target, edge.squared_distance, m2);
                prev = m2;
            }
        }

        debug!(
            "ratio pruning kept {} of {} candidate edges",
            pruned.edge_count(),
            self.edge_count()
        );
        pruned
    }

    // ========================================================================
    // STAGE 4: CLASSIFICATION
    // ========================================================================

    /// Classify a vertex against the other side.
    ///
    /// - No incident edges at all: [`MatchClass::Unmatched`]
    /// - This vertex's best claim points at a vertex whose own best
    ///   claim points back: [`MatchClass::Perfect`]
    /// - Anything else, including incoming-only vertices:
    ///   [`MatchClass::Ambiguous`]
    pub fn classify(&self, v: VertexId) -> MatchClass {
        let vertex = &self.vertices[v.index()];
        if vertex.outgoing.is_empty() && vertex.incoming.is_empty() {
            return MatchClass::Unmatched;
        }
        let Some(best) = self.best_outgoing(v) else {
            return MatchClass::Ambiguous;
        };
        let partner = self.edges[best.index()].target;
        match self.best_outgoing(partner) {
            Some(back) if self.edges[back.index()].target == v => MatchClass::Perfect(partner),
            _ => MatchClass::Ambiguous,
        }
    }

    /// Count ambiguous vertices, failing or warning per `mode`.
    pub fn check_for_conflicts(&self, mode: ConflictHandling) -> Result<usize, MatchingError> {
        let ambiguous = self
            .vertex_ids()
            .filter(|&v| self.classify(v) == MatchClass::Ambiguous)
            .count();
        if ambiguous > 0 {
            match mode {
                ConflictHandling::Fail => {
                    return Err(MatchingError::AmbiguousMatches { vertices: ambiguous })
                }
                ConflictHandling::WarnOnly => {
                    warn!(
                        "{} spots have ambiguous correspondence candidates; conflicts will be tagged",
                        ambiguous
                    );
                }
            }
        }
        Ok(ambiguous)
    }

    /// Group vertices into weakly-connected components.
    ///
    /// Edge direction is ignored; two vertices share a component when
    /// any chain of candidate claims connects them. Vertices without
    /// edges form singleton components.
    pub fn conflict_components(&self) -> ConflictComponents {
        let mut uf = UnionFind::<usize>::new(self.vertices.len());
        for edge in &self.edges {
            uf.union(edge.source.index(), edge.target.index());
        }

        let mut root_of = vec![0usize; self.vertices.len()];
        let mut members: HashMap<usize, Vec<VertexId>> = HashMap::new();
        for i in 0..self.vertices.len() {
            let root = uf.find_mut(i);
            root_of[i] = root;
            members.entry(root).or_default().push(VertexId(i as u32));
        }

        ConflictComponents { root_of, members }
    }
}

/// Weakly-connected components of a [`MatchingGraph`].
#[derive(Debug, Clone)]
pub struct ConflictComponents {
    root_of: Vec<usize>,
    members: HashMap<usize, Vec<VertexId>>,
}

impl ConflictComponents {
    /// All vertices sharing a component with `v`, including `v` itself.
    pub fn members_of(&self, v: VertexId) -> &[VertexId] {
        &self.members[&self.root_of[v.index()]]
    }
}

// ============================================================================
// STAGES 1 & 2: CANDIDATE COLLECTION
// ============================================================================

/// Build the full bidirectional candidate graph for two datasets.
///
/// For every timepoint up to the later dataset's last non-empty one,
/// each spot walks the other side's spatial index in increasing
/// Euclidean distance and claims candidates until a cutoff trips.
/// Spots that never took part in a claim still receive vertices.
pub fn build_candidate_graph(a: &Dataset, b: &Dataset, params: &MergeParams) -> MatchingGraph {
    let mut graph = MatchingGraph::new(a.model().spot_count(), b.model().spot_count());

    let last = match (a.max_non_empty_timepoint(), b.max_non_empty_timepoint()) {
        (Some(ta), Some(tb)) => Some(ta.max(tb)),
        (Some(t), None) | (None, Some(t)) => Some(t),
        (None, None) => None,
    };

    if let Some(last) = last {
        let d2_cutoff = params.squared_distance_cutoff();
        let m2_cutoff = params.squared_mahalanobis_cutoff();
        for timepoint in 0..=last {
            collect_candidates(&mut graph, a, GraphSide::A, b, timepoint, d2_cutoff, m2_cutoff);
            collect_candidates(&mut graph, b, GraphSide::B, a, timepoint, d2_cutoff, m2_cutoff);
        }
    }

    for id in a.model().spot_ids() {
        graph.get_or_add_vertex(GraphSide::A, id);
    }
    for id in b.model().spot_ids() {
        graph.get_or_add_vertex(GraphSide::B, id);
    }

    debug!(
        "candidate graph: {} vertices, {} edges",
        graph.vertex_count(),
        graph.edge_count()
    );
    graph
}

/// One direction of candidate collection at one timepoint.
fn collect_candidates(
    graph: &mut MatchingGraph,
    from: &Dataset,
    from_side: GraphSide,
    to: &Dataset,
    timepoint: u32,
    d2_cutoff: f64,
    m2_cutoff: f64,
) {
    let Some(index) = to.spatial_index(timepoint) else {
        return;
    };

    for &spot_id in from.spots_at(timepoint) {
        let spot = from.model().spot(spot_id);
        for (candidate_id, d2) in index.nearest_in_order(&spot.position) {
            if d2 > d2_cutoff {
                break;
            }
            let candidate = to.model().spot(candidate_id);
            let m2 = squared_mahalanobis(&spot.position, &spot.covariance, &candidate.position);
            // Candidates arrive in Euclidean order, so this break can
            // also drop a farther candidate whose Mahalanobis distance
            // would have passed the gate. Intentional: the walk stops
            // at the first gate failure instead of scanning the whole
            // cutoff ball.
            if m2 > m2_cutoff {
                break;
            }
            let source = graph.get_or_add_vertex(from_side, spot_id);
            let target = graph.get_or_add_vertex(from_side.other(), candidate_id);
            graph.add_edge(source, target, d2, m2);
        }
    }
}

// ============================================================================
// ERRORS
// ============================================================================

/// Errors raised while matching two datasets.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MatchingError {
    #[error("{vertices} spots have ambiguous correspondence candidates")]
    AmbiguousMatches { vertices: usize },
}

// ============================================================================
// TESTS
// ============================================================================
