//! The "MERGE" Engine - Dataset Folding with Conflict Tagging
//!
//! Folds two matched datasets into one reconciled lineage:
//! 1. Seed: copy all of A into the output
//! 2. Fold: walk B timepoint-ascending, fold perfect matches onto
//!    their A image (merging labels), copy everything else
//! 3. Link copy: map B's links through the fold, deduplicated
//! 4. Tag replay: prefixed and unified copies of both tag structures
//!
//! A wins every tie: matched pairs keep A's geometry and label order,
//! and a unified tag replay that collides keeps the value A put there
//! while flagging the object. Nothing is dropped silently; every
//! output object carries its provenance in the bookkeeping tag sets.

use serde::Serialize;
use tracing::debug;

use crate::dataset::Dataset;
use crate::matching::{
    build_candidate_graph, ConflictComponents, ConflictHandling, GraphSide, MatchClass,
    MatchingError, MatchingGraph, VertexId,
};
use crate::model::{LineageModel, LinkId, SpotId};
use crate::tags::{
    self, merge_tag_structures, MergeTags, TagAssignments, TagData, TagMergePlan, TagReplayMap,
};

// ============================================================================
// PARAMETERS
// ============================================================================

/// Thresholds steering candidate matching.
///
/// All three are compared as squared values internally, so they are
/// given here in plain (unsquared) units.
#[derive(Debug, Clone)]
pub struct MergeParams {
    /// Absolute distance cutoff; spots farther apart are never
    /// candidates (default: 1000)
    pub distance_cutoff: f64,

    /// Mahalanobis cutoff in ellipsoid radii of the claiming spot
    /// (default: 1, the ellipsoid surface)
    pub mahalanobis_cutoff: f64,

    /// A candidate this many times worse than its predecessor ends the
    /// candidate list (default: 2, must be > 1)
    pub ratio_threshold: f64,
}

impl Default for MergeParams {
    fn default() -> Self {
        Self {
            distance_cutoff: 1000.0,
            mahalanobis_cutoff: 1.0,
            ratio_threshold: 2.0,
        }
    }
}

impl MergeParams {
    /// Reject non-positive cutoffs and ratios that cannot prune.
    pub fn validate(&self) -> Result<(), MergeError> {
        if !(self.distance_cutoff > 0.0) {
            return Err(MergeError::InvalidParameter {
                name: "distance_cutoff",
                requirement: "> 0",
                value: self.distance_cutoff,
            });
        }
        if !(self.mahalanobis_cutoff > 0.0) {
            return Err(MergeError::InvalidParameter {
                name: "mahalanobis_cutoff",
                requirement: "> 0",
                value: self.mahalanobis_cutoff,
            });
        }
        if !(self.ratio_threshold > 1.0) {
            return Err(MergeError::InvalidParameter {
                name: "ratio_threshold",
                requirement: "> 1",
                value: self.ratio_threshold,
            });
        }
        Ok(())
    }

    pub(crate) fn squared_distance_cutoff(&self) -> f64 {
        self.distance_cutoff * self.distance_cutoff
    }

    pub(crate) fn squared_mahalanobis_cutoff(&self) -> f64 {
        self.mahalanobis_cutoff * self.mahalanobis_cutoff
    }

    pub(crate) fn squared_ratio(&self) -> f64 {
        self.ratio_threshold * self.ratio_threshold
    }
}

// ============================================================================
// OUTPUT
// ============================================================================

/// The reconciled output: one model plus its merged tag data.
#[derive(Debug, Clone, PartialEq)]
pub struct MergedModel {
    pub model: LineageModel,
    pub tags: TagData,
}

impl MergedModel {
    /// Persist to the same project format [`crate::storage::load_dataset`]
    /// reads.
    pub fn save(&self, path: impl AsRef<std::path::Path>) -> Result<(), crate::storage::StorageError> {
        crate::storage::save_project(path, &self.model, &self.tags)
    }

    /// Derive headline counts from the bookkeeping tags.
    pub fn summary(&self) -> MergeSummary {
        MergeSummary {
            spots: self.model.spot_count(),
            links: self.model.link_count(),
            spots_from_a: self.count_spots(tags::SET_SOURCE_A, tags::TAG_SOURCE_A),
            spots_from_b: self.count_spots(tags::SET_SOURCE_B, tags::TAG_SOURCE_B),
            matched_pairs: self.count_spots(tags::SET_STATUS, tags::TAG_MATCH_AB),
            singletons_a: self.count_spots(tags::SET_STATUS, tags::TAG_SINGLETON_A),
            singletons_b: self.count_spots(tags::SET_STATUS, tags::TAG_SINGLETON_B),
            conflict_spots: self.count_spots(tags::SET_STATUS, tags::TAG_CONFLICT),
            tag_conflicts: self.count_spots(tags::SET_TAG_CONFLICTS, tags::TAG_TAG_CONFLICT)
                + self.count_links(tags::SET_TAG_CONFLICTS, tags::TAG_TAG_CONFLICT),
            label_conflicts: self.count_spots(tags::SET_LABEL_CONFLICTS, tags::TAG_LABEL_CONFLICT),
        }
    }

    fn count_spots(&self, set_name: &str, tag_name: &str) -> usize {
        let Some(set) = self.tags.structure.find_set(set_name) else {
            return 0;
        };
        let Some(tag) = self.tags.structure.find_tag(set, tag_name) else {
            return 0;
        };
        self.tags.assignments.count_spots_with(set, tag)
    }

    fn count_links(&self, set_name: &str, tag_name: &str) -> usize {
        let Some(set) = self.tags.structure.find_set(set_name) else {
            return 0;
        };
        let Some(tag) = self.tags.structure.find_tag(set, tag_name) else {
            return 0;
        };
        self.tags.assignments.count_links_with(set, tag)
    }
}

/// Headline counts of one merge, derived from the bookkeeping tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MergeSummary {
    pub spots: usize,
    pub links: usize,
    pub spots_from_a: usize,
    pub spots_from_b: usize,
    pub matched_pairs: usize,
    pub singletons_a: usize,
    pub singletons_b: usize,
    pub conflict_spots: usize,
    pub tag_conflicts: usize,
    pub label_conflicts: usize,
}

// ============================================================================
// ENTRY POINTS
// ============================================================================

/// Merge two datasets, tagging rather than failing on ambiguity.
pub fn merge_datasets(
    a: &Dataset,
    b: &Dataset,
    params: &MergeParams,
) -> Result<MergedModel, MergeError> {
    merge_datasets_with(a, b, params, ConflictHandling::WarnOnly)
}

/// Merge two datasets with explicit ambiguity handling.
///
/// With [`ConflictHandling::Fail`] the merge refuses to produce output
/// when any matching vertex stays ambiguous after pruning; with
/// [`ConflictHandling::WarnOnly`] ambiguity is logged and the affected
/// conflict components are tagged in the output.
pub fn merge_datasets_with(
    a: &Dataset,
    b: &Dataset,
    params: &MergeParams,
    on_ambiguity: ConflictHandling,
) -> Result<MergedModel, MergeError> {
    params.validate()?;

    debug!(
        "matching {} spots against {}",
        a.model().spot_count(),
        b.model().spot_count()
    );
    let candidates = build_candidate_graph(a, b, params);
    let matching = candidates.prune(params.squared_ratio());
    matching.check_for_conflicts(on_ambiguity)?;

    let merged = MergeEngine::new(a, b, &matching).run();
    debug!(
        "merged into {} spots and {} links",
        merged.model.spot_count(),
        merged.model.link_count()
    );
    Ok(merged)
}

// ============================================================================
// MERGE ENGINE
// ============================================================================

struct MergeEngine<'a> {
    a: &'a Dataset,
    b: &'a Dataset,
    matching: &'a MatchingGraph,
    components: ConflictComponents,
    plan: TagMergePlan,

    out: LineageModel,
    tags: TagAssignments,

    /// A spot index -> output spot (total after seeding)
    a_spot_map: Vec<SpotId>,

    /// B spot index -> output spot (total after folding)
    b_spot_map: Vec<Option<SpotId>>,

    /// A link index -> output link
    a_link_map: Vec<LinkId>,

    /// B link index -> output link (possibly shared with an A link)
    b_link_map: Vec<LinkId>,
}

impl<'a> MergeEngine<'a> {
    fn new(a: &'a Dataset, b: &'a Dataset, matching: &'a MatchingGraph) -> Self {
        let plan = merge_tag_structures(&a.tags().structure, &b.tags().structure);
        let tags = TagAssignments::for_structure(&plan.structure);
        Self {
            a,
            b,
            matching,
            components: matching.conflict_components(),
            plan,
            out: LineageModel::new(),
            tags,
            a_spot_map: Vec::with_capacity(a.model().spot_count()),
            b_spot_map: vec![None; b.model().spot_count()],
            a_link_map: Vec::with_capacity(a.model().link_count()),
            b_link_map: Vec::with_capacity(b.model().link_count()),
        }
    }

    fn run(mut self) -> MergedModel {
        self.seed_from_a();
        self.fold_in_b();
        self.copy_b_links();
        self.replay_tags();
        MergedModel {
            model: self.out,
            tags: TagData {
                structure: self.plan.structure,
                assignments: self.tags,
            },
        }
    }

    // ========================================================================
    // PASS 1: SEED FROM A
    // ========================================================================

    fn seed_from_a(&mut self) {
        let a = self.a;
        let tags = self.plan.tags;
        for (_, spot) in a.model().spots() {
            let out_id = self.out.add_spot(spot.clone());
            self.a_spot_map.push(out_id);
            self.tags.tag_spot(tags.source_a_set, out_id, tags.source_a);
            self.tags.tag_spot(tags.status_set, out_id, tags.singleton_a);
        }
        for (_, link) in a.model().links() {
            let out_id = self.out.add_link(
                self.a_spot_map[link.source.index()],
                self.a_spot_map[link.target.index()],
            );
            self.a_link_map.push(out_id);
            self.tags.tag_link(tags.source_a_set, out_id, tags.source_a);
        }
    }

    // ========================================================================
    // PASS 2: FOLD IN B
    // ========================================================================

    /// Walk B's spots in ascending timepoint order so that every spot's
    /// parent is already mapped when the parent-image check runs.
    fn fold_in_b(&mut self) {
        let b = self.b;
        let Some(last) = b.max_non_empty_timepoint() else {
            return;
        };
        for timepoint in 0..=last {
            for &b_id in b.spots_at(timepoint) {
                self.fold_spot(b_id);
            }
        }
    }

    fn fold_spot(&mut self, b_id: SpotId) {
        let matching = self.matching;
        let v = matching
            .vertex_of(GraphSide::B, b_id)
            .expect("matching graph covers every spot");
        let tags = self.plan.tags;

        match matching.classify(v) {
            MatchClass::Unmatched => {
                let out_id = self.copy_b_spot(b_id);
                self.tags.tag_spot(tags.status_set, out_id, tags.singleton_b);
            }
            MatchClass::Perfect(partner) => {
                let a_id = matching.vertex(partner).spot;
                let a_out = self.a_spot_map[a_id.index()];
                if self.parents_disagree(a_id, b_id) {
                    // Geometry agrees but the lineages do not; keep
                    // both spots and mark the disagreement.
                    let out_id = self.copy_b_spot(b_id);
                    self.tags.tag_spot(tags.status_set, out_id, tags.conflict);
                    self.tags.tag_spot(tags.status_set, a_out, tags.conflict);
                } else {
                    self.b_spot_map[b_id.index()] = Some(a_out);
                    self.tags.tag_spot(tags.source_b_set, a_out, tags.source_b);
                    self.tags.tag_spot(tags.status_set, a_out, tags.match_ab);
                    self.merge_labels(a_out, b_id);
                }
            }
            MatchClass::Ambiguous => {
                self.copy_b_spot(b_id);
                // Everything reachable through candidate claims shares
                // the ambiguity; tag whatever already has an output
                // image, this spot's fresh copy included.
                for &member in self.components.members_of(v) {
                    if let Some(out_id) = self.out_spot_of(member) {
                        self.tags.tag_spot(tags.status_set, out_id, tags.conflict);
                    }
                }
            }
        }
    }

    /// Copy a B spot verbatim into the output and record its image.
    fn copy_b_spot(&mut self, b_id: SpotId) -> SpotId {
        let tags = self.plan.tags;
        let out_id = self.out.add_spot(self.b.model().spot(b_id).clone());
        self.b_spot_map[b_id.index()] = Some(out_id);
        self.tags.tag_spot(tags.source_b_set, out_id, tags.source_b);
        out_id
    }

    /// True when both spots have parents whose output images differ.
    ///
    /// A missing parent on either side never disagrees; folding a root
    /// onto a non-root is allowed.
    fn parents_disagree(&self, a_id: SpotId, b_id: SpotId) -> bool {
        let (Some(pa), Some(pb)) = (self.a.model().parent(a_id), self.b.model().parent(b_id))
        else {
            return false;
        };
        let pa_out = self.a_spot_map[pa.index()];
        let pb_out = self.b_spot_map[pb.index()].expect("parents fold before their children");
        pa_out != pb_out
    }

    /// Output image of a matching vertex, if it has been created yet.
    fn out_spot_of(&self, v: VertexId) -> Option<SpotId> {
        let vertex = self.matching.vertex(v);
        match vertex.side {
            GraphSide::A => Some(self.a_spot_map[vertex.spot.index()]),
            GraphSide::B => self.b_spot_map[vertex.spot.index()],
        }
    }

    /// Fold B's label into an output spot that already carries A's.
    fn merge_labels(&mut self, out_id: SpotId, b_id: SpotId) {
        let Some(b_label) = self.b.model().spot(b_id).label.clone() else {
            return;
        };
        let tags = self.plan.tags;
        match self.out.spot(out_id).label.clone() {
            None => self.out.set_label(out_id, Some(b_label)),
            Some(a_label) if a_label == b_label => {}
            Some(a_label) => {
                self.out
                    .set_label(out_id, Some(format!("{a_label} / {b_label}")));
                self.tags
                    .tag_spot(tags.label_conflict_set, out_id, tags.label_conflict);
            }
        }
    }

    // ========================================================================
    // PASS 3: COPY B LINKS
    // ========================================================================

    fn copy_b_links(&mut self) {
        let b = self.b;
        let tags = self.plan.tags;
        for (_, link) in b.model().links() {
            let source = self.b_spot_map[link.source.index()].expect("all B spots are mapped");
            let target = self.b_spot_map[link.target.index()].expect("all B spots are mapped");
            let out_id = match self.out.link_between(source, target) {
                Some(existing) => existing,
                None => self.out.add_link(source, target),
            };
            self.tags.tag_link(tags.source_b_set, out_id, tags.source_b);
            self.b_link_map.push(out_id);
        }
    }

    // ========================================================================
    // PASS 4: TAG REPLAY
    // ========================================================================

    fn replay_tags(&mut self) {
        let resolved_b: Vec<SpotId> = self
            .b_spot_map
            .iter()
            .map(|m| m.expect("all B spots are mapped"))
            .collect();
        replay_side(
            &mut self.tags,
            &self.plan.tags,
            self.a.tags(),
            &self.plan.replay_a,
            &self.a_spot_map,
            &self.a_link_map,
        );
        replay_side(
            &mut self.tags,
            &self.plan.tags,
            self.b.tags(),
            &self.plan.replay_b,
            &resolved_b,
            &self.b_link_map,
        );
    }
}

/// Replay one input's tag assignments into the output.
///
/// Prefixed copies are written unconditionally. Unified copies keep
/// whatever was written first; a disagreeing second write leaves the
/// existing value in place and flags the object in the Tag Conflicts
/// set instead.
fn replay_side(
    tags: &mut TagAssignments,
    merge_tags: &MergeTags,
    input: &TagData,
    replay: &TagReplayMap,
    spot_map: &[SpotId],
    link_map: &[LinkId],
) {
    for (set_id, _) in input.structure.sets() {
        let (prefixed_set, prefixed_tags) = &replay.prefixed[set_id.index()];
        let (unified_set, unified_tags) = &replay.unified[set_id.index()];

        for (spot, tag) in input.assignments.spot_assignments(set_id) {
            let out_spot = spot_map[spot.index()];
            tags.tag_spot(*prefixed_set, out_spot, prefixed_tags[tag.index()]);

            let unified = unified_tags[tag.index()];
            match tags.spot_tag(*unified_set, out_spot) {
                None => tags.tag_spot(*unified_set, out_spot, unified),
                Some(existing) if existing == unified => {}
                Some(_) => tags.tag_spot(
                    merge_tags.tag_conflict_set,
                    out_spot,
                    merge_tags.tag_conflict,
                ),
            }
        }

        for (link, tag) in input.assignments.link_assignments(set_id) {
            let out_link = link_map[link.index()];
            tags.tag_link(*prefixed_set, out_link, prefixed_tags[tag.index()]);

            let unified = unified_tags[tag.index()];
            match tags.link_tag(*unified_set, out_link) {
                None => tags.tag_link(*unified_set, out_link, unified),
                Some(existing) if existing == unified => {}
                Some(_) => tags.tag_link(
                    merge_tags.tag_conflict_set,
                    out_link,
                    merge_tags.tag_conflict,
                ),
            }
        }
    }
}

// ============================================================================
// ERRORS
// ============================================================================

/// Errors raised by the merge pipeline.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MergeError {
    #[error("Merge parameter {name} must be {requirement} (got {value})")]
    InvalidParameter {
        name: &'static str,
        requirement: &'static str,
        value: f64,
    },

    #[error(transparent)]
    Matching(#[from] MatchingError),
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Spot;
    use crate::tags::TagStructureBuilder;
    use nalgebra::{Matrix3, Vector3};

    fn round_spot(timepoint: u32, x: f64) -> Spot {
        Spot {
            timepoint,
            position: Vector3::new(x, 0.0, 0.0),
            covariance: Matrix3::identity(),
            label: None,
        }
    }

    fn labeled_spot(timepoint: u32, x: f64, label: Option<&str>) -> Spot {
        Spot {
            label: label.map(str::to_owned),
            ..round_spot(timepoint, x)
        }
    }

    fn dataset_of(spots: Vec<Spot>) -> Dataset {
        let mut model = LineageModel::new();
        for spot in spots {
            model.add_spot(spot);
        }
        Dataset::new(model, TagData::empty()).unwrap()
    }

    /// A single branch: one spot per timepoint, linked in sequence.
    fn chain_dataset(positions: &[f64]) -> Dataset {
        let mut model = LineageModel::new();
        let mut previous: Option<SpotId> = None;
        for (t, &x) in positions.iter().enumerate() {
            let id = model.add_spot(round_spot(t as u32, x));
            if let Some(prev) = previous {
                model.add_link(prev, id);
            }
            previous = Some(id);
        }
        Dataset::new(model, TagData::empty()).unwrap()
    }

    fn status_of(merged: &MergedModel, spot: SpotId) -> Option<String> {
        let set = merged.tags.structure.find_set(tags::SET_STATUS)?;
        let tag = merged.tags.assignments.spot_tag(set, spot)?;
        Some(merged.tags.structure.tag(set, tag).label.clone())
    }

    #[test]
    fn test_identical_branches_fold_completely() {
        let a = chain_dataset(&[0.0, 1.0, 2.0]);
        let b = chain_dataset(&[0.0, 1.0, 2.0]);

        let merged = merge_datasets(&a, &b, &MergeParams::default()).unwrap();
        let summary = merged.summary();

        assert_eq!(summary.spots, 3);
        assert_eq!(summary.links, 2);
        assert_eq!(summary.spots_from_a, 3);
        assert_eq!(summary.spots_from_b, 3);
        assert_eq!(summary.matched_pairs, 3);
        assert_eq!(summary.singletons_a, 0);
        assert_eq!(summary.singletons_b, 0);
        assert_eq!(summary.conflict_spots, 0);
    }

    #[test]
    fn test_distant_branches_stay_separate() {
        let a = chain_dataset(&[0.0, 1.0, 2.0]);
        let b = chain_dataset(&[1000.0, 1001.0, 1002.0]);

        let params = MergeParams {
            distance_cutoff: 10.0,
            ..Default::default()
        };
        let merged = merge_datasets(&a, &b, &params).unwrap();
        let summary = merged.summary();

        assert_eq!(summary.spots, 6);
        assert_eq!(summary.links, 4);
        assert_eq!(summary.matched_pairs, 0);
        assert_eq!(summary.singletons_a, 3);
        assert_eq!(summary.singletons_b, 3);
        assert_eq!(summary.conflict_spots, 0);
    }

    #[test]
    fn test_merge_with_empty_b_replays_a() {
        let mut model = LineageModel::new();
        let s0 = model.add_spot(labeled_spot(0, 0.0, Some("root")));
        let s1 = model.add_spot(round_spot(1, 1.0));
        let s2 = model.add_spot(round_spot(2, 2.0));
        let l0 = model.add_link(s0, s1);
        model.add_link(s1, s2);

        let mut builder = TagStructureBuilder::new();
        let phase = builder.add_set("Phase");
        let g1 = builder.add_tag(phase, "G1", 7);
        let mut tag_data = TagData::new(builder.build());
        tag_data.assignments.tag_spot(phase, s0, g1);
        tag_data.assignments.tag_link(phase, l0, g1);

        let a = Dataset::new(model, tag_data).unwrap();
        let merged = merge_datasets(&a, &Dataset::empty(), &MergeParams::default()).unwrap();

        // Topology and labels survive unchanged.
        assert_eq!(merged.model.spot_count(), 3);
        assert_eq!(merged.model.link_count(), 2);
        assert_eq!(merged.model.spot(SpotId(0)).label.as_deref(), Some("root"));
        assert!(merged.model.link_between(SpotId(0), SpotId(1)).is_some());
        assert!(merged.model.link_between(SpotId(1), SpotId(2)).is_some());

        let summary = merged.summary();
        assert_eq!(summary.singletons_a, 3);
        assert_eq!(summary.spots_from_b, 0);
        assert_eq!(summary.matched_pairs, 0);

        // The Phase set replays both prefixed and unified.
        let s = &merged.tags.structure;
        let prefixed = s.find_set("((A)) Phase").unwrap();
        let unified = s.find_set("Phase").unwrap();
        let pg1 = s.find_tag(prefixed, "G1").unwrap();
        let ug1 = s.find_tag(unified, "G1").unwrap();
        assert_eq!(merged.tags.assignments.spot_tag(prefixed, SpotId(0)), Some(pg1));
        assert_eq!(merged.tags.assignments.spot_tag(unified, SpotId(0)), Some(ug1));
        assert_eq!(merged.tags.assignments.link_tag(prefixed, LinkId(0)), Some(pg1));
        assert_eq!(merged.tags.assignments.link_tag(unified, LinkId(0)), Some(ug1));
    }

    #[test]
    fn test_merge_of_two_empty_datasets() {
        let merged =
            merge_datasets(&Dataset::empty(), &Dataset::empty(), &MergeParams::default()).unwrap();
        let summary = merged.summary();
        assert_eq!(summary.spots, 0);
        assert_eq!(summary.links, 0);
        assert!(merged.tags.structure.find_set(tags::SET_STATUS).is_some());
    }

    #[test]
    fn test_parent_disagreement_keeps_both_spots() {
        // The tp1 spots coincide, but their parents are 500 apart and
        // do not match each other.
        let mut model_a = LineageModel::new();
        let pa = model_a.add_spot(round_spot(0, 0.0));
        let ca = model_a.add_spot(round_spot(1, 0.0));
        model_a.add_link(pa, ca);
        let a = Dataset::new(model_a, TagData::empty()).unwrap();

        let mut model_b = LineageModel::new();
        let pb = model_b.add_spot(round_spot(0, 500.0));
        let cb = model_b.add_spot(round_spot(1, 0.0));
        model_b.add_link(pb, cb);
        let b = Dataset::new(model_b, TagData::empty()).unwrap();

        let merged = merge_datasets(&a, &b, &MergeParams::default()).unwrap();
        let summary = merged.summary();

        assert_eq!(summary.spots, 4);
        assert_eq!(summary.links, 2);
        assert_eq!(summary.matched_pairs, 0);
        assert_eq!(summary.conflict_spots, 2);
        assert_eq!(summary.singletons_a, 1);
        assert_eq!(summary.singletons_b, 1);

        // A's child image and B's child copy both carry the conflict.
        assert_eq!(status_of(&merged, SpotId(1)).as_deref(), Some(tags::TAG_CONFLICT));
        assert_eq!(status_of(&merged, SpotId(3)).as_deref(), Some(tags::TAG_CONFLICT));
    }

    #[test]
    fn test_ambiguous_component_is_tagged_conflict() {
        // b2 sits exactly on a1; b trails half a radius away. The b
        // claim on a1 survives pruning in its own list, so b stays
        // ambiguous and drags the whole component into conflict.
        let a = dataset_of(vec![round_spot(0, 0.0)]);
        let b = dataset_of(vec![round_spot(0, 0.0), round_spot(0, 0.5)]);

        let merged = merge_datasets(&a, &b, &MergeParams::default()).unwrap();
        let summary = merged.summary();

        assert_eq!(summary.spots, 2);
        assert_eq!(summary.matched_pairs, 0);
        assert_eq!(summary.conflict_spots, 2);
        assert_eq!(summary.singletons_a, 0);
        assert_eq!(summary.singletons_b, 0);

        // The folded spot keeps A's geometry; the ambiguous copy keeps B's.
        assert_eq!(merged.model.spot(SpotId(0)).position.x, 0.0);
        assert_eq!(merged.model.spot(SpotId(1)).position.x, 0.5);
    }

    #[test]
    fn test_strict_mode_fails_on_ambiguity() {
        let a = dataset_of(vec![round_spot(0, 0.0)]);
        let b = dataset_of(vec![round_spot(0, 0.0), round_spot(0, 0.5)]);

        let result =
            merge_datasets_with(&a, &b, &MergeParams::default(), ConflictHandling::Fail);
        assert_eq!(
            result.unwrap_err(),
            MergeError::Matching(MatchingError::AmbiguousMatches { vertices: 1 })
        );
    }

    #[test]
    fn test_label_merge_rules() {
        let a = dataset_of(vec![
            labeled_spot(0, 0.0, Some("left")),
            labeled_spot(0, 100.0, Some("same")),
            labeled_spot(0, 200.0, None),
        ]);
        let b = dataset_of(vec![
            labeled_spot(0, 0.0, Some("right")),
            labeled_spot(0, 100.0, Some("same")),
            labeled_spot(0, 200.0, Some("only")),
        ]);

        let merged = merge_datasets(&a, &b, &MergeParams::default()).unwrap();

        assert_eq!(merged.summary().matched_pairs, 3);
        assert_eq!(merged.model.spot(SpotId(0)).label.as_deref(), Some("left / right"));
        assert_eq!(merged.model.spot(SpotId(1)).label.as_deref(), Some("same"));
        assert_eq!(merged.model.spot(SpotId(2)).label.as_deref(), Some("only"));
        assert_eq!(merged.summary().label_conflicts, 1);

        let set = merged.tags.structure.find_set(tags::SET_LABEL_CONFLICTS).unwrap();
        let tag = merged.tags.structure.find_tag(set, tags::TAG_LABEL_CONFLICT).unwrap();
        assert_eq!(merged.tags.assignments.spot_tag(set, SpotId(0)), Some(tag));
        assert_eq!(merged.tags.assignments.spot_tag(set, SpotId(1)), None);
    }

    fn phase_tagged(spots: Vec<Spot>, tag_label: &str, palette: &[&str]) -> Dataset {
        let mut model = LineageModel::new();
        let mut ids = Vec::new();
        for spot in spots {
            ids.push(model.add_spot(spot));
        }
        let mut builder = TagStructureBuilder::new();
        let phase = builder.add_set("Phase");
        let mut tag_of = None;
        for (i, label) in palette.iter().enumerate() {
            let t = builder.add_tag(phase, *label, i as u32);
            if *label == tag_label {
                tag_of = Some(t);
            }
        }
        let mut tag_data = TagData::new(builder.build());
        tag_data
            .assignments
            .tag_spot(phase, ids[0], tag_of.unwrap());
        Dataset::new(model, tag_data).unwrap()
    }

    #[test]
    fn test_unified_tag_disagreement_is_flagged_not_overwritten() {
        let a = phase_tagged(vec![round_spot(0, 0.0)], "G1", &["G1", "G2"]);
        let b = phase_tagged(vec![round_spot(0, 0.0)], "G2", &["G2", "M"]);

        let merged = merge_datasets(&a, &b, &MergeParams::default()).unwrap();
        let s = &merged.tags.structure;

        // Both prefixed copies are present and carry their own value.
        let pa = s.find_set("((A)) Phase").unwrap();
        let pb = s.find_set("((B)) Phase").unwrap();
        assert_eq!(
            merged.tags.assignments.spot_tag(pa, SpotId(0)),
            s.find_tag(pa, "G1")
        );
        assert_eq!(
            merged.tags.assignments.spot_tag(pb, SpotId(0)),
            s.find_tag(pb, "G2")
        );

        // The unified copy keeps A's value; the spot is flagged.
        let unified = s.find_set("Phase").unwrap();
        assert_eq!(
            merged.tags.assignments.spot_tag(unified, SpotId(0)),
            s.find_tag(unified, "G1")
        );
        assert_eq!(merged.summary().tag_conflicts, 1);
    }

    #[test]
    fn test_unified_tag_agreement_is_not_flagged() {
        let a = phase_tagged(vec![round_spot(0, 0.0)], "G2", &["G1", "G2"]);
        let b = phase_tagged(vec![round_spot(0, 0.0)], "G2", &["G2", "M"]);

        let merged = merge_datasets(&a, &b, &MergeParams::default()).unwrap();
        assert_eq!(merged.summary().tag_conflicts, 0);

        let unified = merged.tags.structure.find_set("Phase").unwrap();
        assert_eq!(
            merged.tags.assignments.spot_tag(unified, SpotId(0)),
            merged.tags.structure.find_tag(unified, "G2")
        );
    }

    #[test]
    fn test_shared_links_are_deduplicated() {
        let a = chain_dataset(&[0.0, 1.0]);
        let b = chain_dataset(&[0.0, 1.0]);

        let merged = merge_datasets(&a, &b, &MergeParams::default()).unwrap();
        assert_eq!(merged.model.link_count(), 1);

        // The shared link carries both source marks.
        let s = &merged.tags.structure;
        let src_a = s.find_set(tags::SET_SOURCE_A).unwrap();
        let src_b = s.find_set(tags::SET_SOURCE_B).unwrap();
        assert!(merged.tags.assignments.link_tag(src_a, LinkId(0)).is_some());
        assert!(merged.tags.assignments.link_tag(src_b, LinkId(0)).is_some());
    }

    #[test]
    fn test_merge_is_deterministic() {
        let a = dataset_of(vec![
            labeled_spot(0, 0.0, Some("x")),
            round_spot(0, 3.0),
            round_spot(1, 1.0),
        ]);
        let b = dataset_of(vec![
            labeled_spot(0, 0.2, Some("y")),
            round_spot(1, 1.1),
            round_spot(2, 9.0),
        ]);

        let params = MergeParams {
            distance_cutoff: 50.0,
            mahalanobis_cutoff: 2.0,
            ratio_threshold: 3.0,
        };
        let first = merge_datasets(&a, &b, &params).unwrap();
        let second = merge_datasets(&a, &b, &params).unwrap();

        assert_eq!(first.model, second.model);
        assert_eq!(first.tags, second.tags);
    }

    #[test]
    fn test_params_validation() {
        assert!(MergeParams::default().validate().is_ok());

        let zero_distance = MergeParams {
            distance_cutoff: 0.0,
            ..Default::default()
        };
        assert!(matches!(
            zero_distance.validate(),
            Err(MergeError::InvalidParameter { name: "distance_cutoff", .. })
        ));

        let negative_mahalanobis = MergeParams {
            mahalanobis_cutoff: -1.0,
            ..Default::default()
        };
        assert!(matches!(
            negative_mahalanobis.validate(),
            Err(MergeError::InvalidParameter { name: "mahalanobis_cutoff", .. })
        ));

        let unit_ratio = MergeParams {
            ratio_threshold: 1.0,
            ..Default::default()
        };
        assert!(matches!(
            unit_ratio.validate(),
            Err(MergeError::InvalidParameter { name: "ratio_threshold", .. })
        ));

        let nan_cutoff = MergeParams {
            distance_cutoff: f64::NAN,
            ..Default::default()
        };
        assert!(nan_cutoff.validate().is_err());
    }

    // ------------------------------------------------------------------
    // Properties
    // ------------------------------------------------------------------

    mod properties {
        use super::*;
        use crate::matching::build_candidate_graph;
        use proptest::prelude::*;

        fn arb_spots(max: usize) -> impl Strategy<Value = Vec<Spot>> {
            prop::collection::vec(
                (
                    0u32..3,
                    prop::array::uniform3(-50.0f64..50.0),
                    0.25f64..4.0,
                ),
                0..max,
            )
            .prop_map(|entries| {
                entries
                    .into_iter()
                    .map(|(timepoint, p, variance)| Spot {
                        timepoint,
                        position: Vector3::new(p[0], p[1], p[2]),
                        covariance: Matrix3::from_diagonal(&Vector3::new(
                            variance, variance, variance,
                        )),
                        label: None,
                    })
                    .collect()
            })
        }

        /// Paired spots on a coarse grid: within a cell the two sides
        /// sit less than one unit apart, across cells at least nine
        /// units, so every spot has at most one candidate under the
        /// cutoffs the properties sweep.
        fn grid_pairs() -> impl Strategy<Value = Vec<(Vector3<f64>, Vector3<f64>)>> {
            prop::collection::hash_map(
                (0i32..6, 0i32..6, 0i32..6),
                (
                    prop::array::uniform3(-0.4f64..0.4),
                    prop::array::uniform3(-0.4f64..0.4),
                ),
                0..12,
            )
            .prop_map(|cells| {
                cells
                    .into_iter()
                    .map(|((i, j, k), (ja, jb))| {
                        let base =
                            Vector3::new(i as f64 * 10.0, j as f64 * 10.0, k as f64 * 10.0);
                        (
                            base + Vector3::new(ja[0], ja[1], ja[2]),
                            base + Vector3::new(jb[0], jb[1], jb[2]),
                        )
                    })
                    .collect()
            })
        }

        fn grid_datasets(pairs: &[(Vector3<f64>, Vector3<f64>)]) -> (Dataset, Dataset) {
            let spot = |position: Vector3<f64>| Spot {
                timepoint: 0,
                position,
                covariance: Matrix3::identity(),
                label: None,
            };
            let a = dataset_of(pairs.iter().map(|(pa, _)| spot(*pa)).collect());
            let b = dataset_of(pairs.iter().map(|(_, pb)| spot(*pb)).collect());
            (a, b)
        }

        proptest! {
            #[test]
            fn prop_perfect_matches_are_mutual(a in arb_spots(12), b in arb_spots(12)) {
                let a = dataset_of(a);
                let b = dataset_of(b);
                let params = MergeParams::default();
                let graph =
                    build_candidate_graph(&a, &b, &params).prune(params.squared_ratio());

                for v in graph.vertex_ids() {
                    if let MatchClass::Perfect(w) = graph.classify(v) {
                        prop_assert_eq!(graph.classify(w), MatchClass::Perfect(v));
                        prop_assert_ne!(graph.vertex(v).side, graph.vertex(w).side);
                    }
                }
            }

            #[test]
            fn prop_every_input_spot_reaches_the_output(a in arb_spots(12), b in arb_spots(12)) {
                let (na, nb) = (a.len(), b.len());
                let merged =
                    merge_datasets(&dataset_of(a), &dataset_of(b), &MergeParams::default())
                        .unwrap();
                let summary = merged.summary();

                prop_assert_eq!(summary.spots_from_a, na);
                prop_assert_eq!(summary.spots_from_b, nb);
                prop_assert!(summary.spots <= na + nb);
                prop_assert!(summary.spots >= na.max(nb));
            }

            #[test]
            fn prop_wider_distance_cutoff_never_loses_matches(pairs in grid_pairs()) {
                let (a, b) = grid_datasets(&pairs);
                let mut previous = usize::MAX;
                for cutoff in [4.0, 1.2, 0.9, 0.5] {
                    let params = MergeParams {
                        distance_cutoff: cutoff,
                        mahalanobis_cutoff: 10.0,
                        ratio_threshold: 2.0,
                    };
                    let matched =
                        merge_datasets(&a, &b, &params).unwrap().summary().matched_pairs;
                    let expected = pairs
                        .iter()
                        .filter(|(pa, pb)| (pb - pa).norm_squared() <= cutoff * cutoff)
                        .count();
                    prop_assert_eq!(matched, expected);
                    prop_assert!(matched <= previous);
                    previous = matched;
                }
            }

            #[test]
            fn prop_wider_mahalanobis_cutoff_never_loses_matches(pairs in grid_pairs()) {
                let (a, b) = grid_datasets(&pairs);
                let mut previous = usize::MAX;
                for cutoff in [4.0, 1.2, 0.9, 0.5] {
                    let params = MergeParams {
                        distance_cutoff: 4.0,
                        mahalanobis_cutoff: cutoff,
                        ratio_threshold: 2.0,
                    };
                    let matched =
                        merge_datasets(&a, &b, &params).unwrap().summary().matched_pairs;
                    prop_assert!(matched <= previous);
                    previous = matched;
                }
            }
        }
    }
}
