//! Tag sets and tag assignments.
//!
//! A tag structure is a list of named tag sets, each holding named,
//! colored tags. Assignments attach at most one tag per set to each
//! spot or link, so a tag set behaves like a single-choice attribute.
//!
//! The merge engine builds its output vocabulary here: bookkeeping
//! sets recording where every object came from and how it was matched,
//! prefixed `((A))`/`((B))` copies of the input sets, and name-unified
//! copies that both inputs replay into.

use std::collections::HashMap;

use crate::model::{LinkId, SpotId};

// ============================================================================
// MERGE VOCABULARY
// ============================================================================

/// Tag set marking every object that came from the first input.
pub const SET_SOURCE_A: &str = "Merge Source A";
/// Tag set marking every object that came from the second input.
pub const SET_SOURCE_B: &str = "Merge Source B";
/// Tag set recording how each spot was matched.
pub const SET_STATUS: &str = "Merge Status";
/// Tag set flagging objects whose replayed tags disagreed.
pub const SET_TAG_CONFLICTS: &str = "Tag Conflicts";
/// Tag set flagging spots whose labels disagreed.
pub const SET_LABEL_CONFLICTS: &str = "Label Conflicts";

pub const TAG_SOURCE_A: &str = "Source A";
pub const TAG_SOURCE_B: &str = "Source B";
pub const TAG_SINGLETON_A: &str = "Singleton A";
pub const TAG_SINGLETON_B: &str = "Singleton B";
pub const TAG_MATCH_AB: &str = "MatchAB";
pub const TAG_CONFLICT: &str = "Conflict";
pub const TAG_TAG_CONFLICT: &str = "Tag Conflict";
pub const TAG_LABEL_CONFLICT: &str = "Label Conflict";

const COLOR_SOURCE_A: u32 = 0xFF3D87F5;
const COLOR_SOURCE_B: u32 = 0xFFF5A33D;
const COLOR_SINGLETON_A: u32 = 0xFFB3CEF7;
const COLOR_SINGLETON_B: u32 = 0xFFF7D9B3;
const COLOR_MATCH_AB: u32 = 0xFF4CAF50;
const COLOR_CONFLICT: u32 = 0xFFE53935;
const COLOR_TAG_CONFLICT: u32 = 0xFFAB47BC;
const COLOR_LABEL_CONFLICT: u32 = 0xFFFFB300;

// ============================================================================
// HANDLES
// ============================================================================

/// Dense handle to a tag set within a [`TagStructure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TagSetId(pub u32);

impl TagSetId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Dense handle to a tag within one tag set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TagId(pub u32);

impl TagId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

// ============================================================================
// STRUCTURE
// ============================================================================

/// One named, colored tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub label: String,

    /// Display color, packed 0xAARRGGBB
    pub color: u32,
}

/// A named single-choice attribute with its value palette.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagSet {
    pub name: String,
    pub tags: Vec<Tag>,
}

/// Immutable list of tag sets; build one with [`TagStructureBuilder`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagStructure {
    sets: Vec<TagSet>,
}

impl TagStructure {
    /// Structure with no tag sets.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn set_count(&self) -> usize {
        self.sets.len()
    }

    /// Get a tag set by handle.
    #[inline]
    pub fn set(&self, id: TagSetId) -> &TagSet {
        &self.sets[id.index()]
    }

    /// Get a tag by set and tag handle.
    #[inline]
    pub fn tag(&self, set: TagSetId, tag: TagId) -> &Tag {
        &self.sets[set.index()].tags[tag.index()]
    }

    /// Iterate tag sets with their handles.
    pub fn sets(&self) -> impl Iterator<Item = (TagSetId, &TagSet)> {
        self.sets
            .iter()
            .enumerate()
            .map(|(i, s)| (TagSetId(i as u32), s))
    }

    /// Look up a tag set by name.
    pub fn find_set(&self, name: &str) -> Option<TagSetId> {
        self.sets
            .iter()
            .position(|s| s.name == name)
            .map(|i| TagSetId(i as u32))
    }

    /// Look up a tag by label within a set.
    pub fn find_tag(&self, set: TagSetId, label: &str) -> Option<TagId> {
        self.sets[set.index()]
            .tags
            .iter()
            .position(|t| t.label == label)
            .map(|i| TagId(i as u32))
    }
}

/// Incremental builder for a [`TagStructure`].
#[derive(Debug, Clone, Default)]
pub struct TagStructureBuilder {
    sets: Vec<TagSet>,
}

impl TagStructureBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a new, empty tag set.
    pub fn add_set(&mut self, name: impl Into<String>) -> TagSetId {
        let id = TagSetId(self.sets.len() as u32);
        self.sets.push(TagSet {
            name: name.into(),
            tags: Vec::new(),
        });
        id
    }

    /// Append a new tag to an existing set.
    pub fn add_tag(&mut self, set: TagSetId, label: impl Into<String>, color: u32) -> TagId {
        let tags = &mut self.sets[set.index()].tags;
        let id = TagId(tags.len() as u32);
        tags.push(Tag {
            label: label.into(),
            color,
        });
        id
    }

    /// Get the set with the given name, appending it if absent.
    pub fn find_or_add_set(&mut self, name: &str) -> TagSetId {
        match self.sets.iter().position(|s| s.name == name) {
            Some(i) => TagSetId(i as u32),
            None => self.add_set(name),
        }
    }

    /// Get the tag with the given label, appending it if absent.
    ///
    /// An existing tag keeps its original color.
    pub fn find_or_add_tag(&mut self, set: TagSetId, label: &str, color: u32) -> TagId {
        let tags = &self.sets[set.index()].tags;
        match tags.iter().position(|t| t.label == label) {
            Some(i) => TagId(i as u32),
            None => self.add_tag(set, label, color),
        }
    }

    pub fn build(self) -> TagStructure {
        TagStructure { sets: self.sets }
    }
}

// ============================================================================
// ASSIGNMENTS
// ============================================================================

/// Tag assignments for one model, at most one tag per set per object.
///
/// Tagging an object that already holds a tag in the same set replaces
/// the previous tag.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TagAssignments {
    /// Per tag set: spot -> tag
    spot_tags: Vec<HashMap<SpotId, TagId>>,

    /// Per tag set: link -> tag
    link_tags: Vec<HashMap<LinkId, TagId>>,
}

impl TagAssignments {
    /// Empty assignments sized for the given structure.
    pub fn for_structure(structure: &TagStructure) -> Self {
        Self {
            spot_tags: vec![HashMap::new(); structure.set_count()],
            link_tags: vec![HashMap::new(); structure.set_count()],
        }
    }

    /// Assign a tag to a spot, replacing any previous tag from the set.
    pub fn tag_spot(&mut self, set: TagSetId, spot: SpotId, tag: TagId) {
        self.spot_tags[set.index()].insert(spot, tag);
    }

    /// Assign a tag to a link, replacing any previous tag from the set.
    pub fn tag_link(&mut self, set: TagSetId, link: LinkId, tag: TagId) {
        self.link_tags[set.index()].insert(link, tag);
    }

    /// Tag held by a spot in the given set, if any.
    pub fn spot_tag(&self, set: TagSetId, spot: SpotId) -> Option<TagId> {
        self.spot_tags[set.index()].get(&spot).copied()
    }

    /// Tag held by a link in the given set, if any.
    pub fn link_tag(&self, set: TagSetId, link: LinkId) -> Option<TagId> {
        self.link_tags[set.index()].get(&link).copied()
    }

    /// Iterate all spot assignments of one set, in no particular order.
    pub fn spot_assignments(&self, set: TagSetId) -> impl Iterator<Item = (SpotId, TagId)> + '_ {
        self.spot_tags[set.index()].iter().map(|(&s, &t)| (s, t))
    }

    /// Iterate all link assignments of one set, in no particular order.
    pub fn link_assignments(&self, set: TagSetId) -> impl Iterator<Item = (LinkId, TagId)> + '_ {
        self.link_tags[set.index()].iter().map(|(&l, &t)| (l, t))
    }

    /// Number of spots holding the given tag.
    pub fn count_spots_with(&self, set: TagSetId, tag: TagId) -> usize {
        self.spot_tags[set.index()]
            .values()
            .filter(|&&t| t == tag)
            .count()
    }

    /// Number of links holding the given tag.
    pub fn count_links_with(&self, set: TagSetId, tag: TagId) -> usize {
        self.link_tags[set.index()]
            .values()
            .filter(|&&t| t == tag)
            .count()
    }
}

/// A tag structure together with the assignments made against it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TagData {
    pub structure: TagStructure,
    pub assignments: TagAssignments,
}

impl TagData {
    /// No tag sets, no assignments.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Empty assignments over the given structure.
    pub fn new(structure: TagStructure) -> Self {
        let assignments = TagAssignments::for_structure(&structure);
        Self {
            structure,
            assignments,
        }
    }
}

// ============================================================================
// MERGE VOCABULARY PLAN
// ============================================================================

/// Resolved handles for the merge bookkeeping tags.
#[derive(Debug, Clone, Copy)]
pub struct MergeTags {
    pub source_a_set: TagSetId,
    pub source_a: TagId,
    pub source_b_set: TagSetId,
    pub source_b: TagId,
    pub status_set: TagSetId,
    pub singleton_a: TagId,
    pub singleton_b: TagId,
    pub match_ab: TagId,
    pub conflict: TagId,
    pub tag_conflict_set: TagSetId,
    pub tag_conflict: TagId,
    pub label_conflict_set: TagSetId,
    pub label_conflict: TagId,
}

/// Where each tag of one input lands in the merged structure.
///
/// Indexed positionally: entry `i` describes input set `i`, and its
/// inner vector maps input tag `j` to the output tag handle.
#[derive(Debug, Clone)]
pub struct TagReplayMap {
    /// Input set i -> (prefixed copy, tag translation)
    pub prefixed: Vec<(TagSetId, Vec<TagId>)>,

    /// Input set i -> (name-unified copy, tag translation)
    pub unified: Vec<(TagSetId, Vec<TagId>)>,
}

/// Merged tag structure plus everything needed to replay assignments.
#[derive(Debug, Clone)]
pub struct TagMergePlan {
    pub structure: TagStructure,
    pub tags: MergeTags,
    pub replay_a: TagReplayMap,
    pub replay_b: TagReplayMap,
}

/// Build the merged tag structure for two inputs.
///
/// The output starts with the five bookkeeping sets, then for each
/// input set both a prefixed copy (`((A)) name` / `((B)) name`) and a
/// name-unified copy. Unified sets are shared by name across inputs,
/// and a tag that already exists in a unified set keeps its first
/// color.
pub fn merge_tag_structures(a: &TagStructure, b: &TagStructure) -> TagMergePlan {
    let mut builder = TagStructureBuilder::new();

    let source_a_set = builder.add_set(SET_SOURCE_A);
    let source_a = builder.add_tag(source_a_set, TAG_SOURCE_A, COLOR_SOURCE_A);
    let source_b_set = builder.add_set(SET_SOURCE_B);
    let source_b = builder.add_tag(source_b_set, TAG_SOURCE_B, COLOR_SOURCE_B);

    let status_set = builder.add_set(SET_STATUS);
    let singleton_a = builder.add_tag(status_set, TAG_SINGLETON_A, COLOR_SINGLETON_A);
    let singleton_b = builder.add_tag(status_set, TAG_SINGLETON_B, COLOR_SINGLETON_B);
    let match_ab = builder.add_tag(status_set, TAG_MATCH_AB, COLOR_MATCH_AB);
    let conflict = builder.add_tag(status_set, TAG_CONFLICT, COLOR_CONFLICT);

    let tag_conflict_set = builder.add_set(SET_TAG_CONFLICTS);
    let tag_conflict = builder.add_tag(tag_conflict_set, TAG_TAG_CONFLICT, COLOR_TAG_CONFLICT);
    let label_conflict_set = builder.add_set(SET_LABEL_CONFLICTS);
    let label_conflict =
        builder.add_tag(label_conflict_set, TAG_LABEL_CONFLICT, COLOR_LABEL_CONFLICT);

    let replay_a = plan_replay(&mut builder, a, "((A))");
    let replay_b = plan_replay(&mut builder, b, "((B))");

    TagMergePlan {
        structure: builder.build(),
        tags: MergeTags {
            source_a_set,
            source_a,
            source_b_set,
            source_b,
            status_set,
            singleton_a,
            singleton_b,
            match_ab,
            conflict,
            tag_conflict_set,
            tag_conflict,
            label_conflict_set,
            label_conflict,
        },
        replay_a,
        replay_b,
    }
}

fn plan_replay(
    builder: &mut TagStructureBuilder,
    input: &TagStructure,
    prefix: &str,
) -> TagReplayMap {
    let mut prefixed = Vec::with_capacity(input.set_count());
    let mut unified = Vec::with_capacity(input.set_count());

    for (_, set) in input.sets() {
        let pset = builder.add_set(format!("{prefix} {}", set.name));
        let ptags = set
            .tags
            .iter()
            .map(|t| builder.add_tag(pset, t.label.clone(), t.color))
            .collect();
        prefixed.push((pset, ptags));

        let uset = builder.find_or_add_set(&set.name);
        let utags = set
            .tags
            .iter()
            .map(|t| builder.find_or_add_tag(uset, &t.label, t.color))
            .collect();
        unified.push((uset, utags));
    }

    TagReplayMap { prefixed, unified }
}

// ============================================================================
// TESTS
// ============================================================================
