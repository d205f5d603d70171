//! The project format - versioned JSON on disk.
//!
//! One file holds one dataset: spots, links, tag sets, and tag
//! assignments. Geometry travels as plain arrays (`[f64; 3]` centers,
//! `[[f64; 3]; 3]` covariances) and is converted to nalgebra types at
//! the boundary; all cross-references are dense pool indexes, checked
//! against the pools on load.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};

use crate::dataset::Dataset;
use crate::model::{LineageModel, LinkId, ModelError, Spot, SpotId};
use crate::tags::{TagAssignments, TagData, TagId, TagSetId, TagStructureBuilder};

/// Schema version this build reads and writes.
pub const FORMAT_VERSION: u32 = 1;

// ============================================================================
// WIRE TYPES
// ============================================================================

/// A complete project file.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ProjectFile {
    version: u32,
    spots: Vec<SpotRecord>,
    links: Vec<LinkRecord>,
    tag_sets: Vec<TagSetRecord>,
    spot_tags: Vec<AssignmentRecord>,
    link_tags: Vec<AssignmentRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SpotRecord {
    timepoint: u32,
    position: [f64; 3],
    covariance: [[f64; 3]; 3],
    #[serde(skip_serializing_if = "Option::is_none")]
    label: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LinkRecord {
    source: u32,
    target: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TagSetRecord {
    name: String,
    tags: Vec<TagRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TagRecord {
    label: String,
    color: u32,
}

/// One tag assignment: object `object` holds tag `tag` of set `set`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct AssignmentRecord {
    set: u32,
    object: u32,
    tag: u32,
}

// ============================================================================
// SAVE
// ============================================================================

/// Write a model and its tag data to a project file.
pub fn save_project(
    path: impl AsRef<Path>,
    model: &LineageModel,
    tags: &TagData,
) -> Result<(), StorageError> {
    let file = to_wire(model, tags);
    let writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(writer, &file)?;
    Ok(())
}

fn to_wire(model: &LineageModel, tags: &TagData) -> ProjectFile {
    let spots = model
        .spots()
        .map(|(_, s)| SpotRecord {
            timepoint: s.timepoint,
            position: [s.position.x, s.position.y, s.position.z],
            covariance: [
                [s.covariance[(0, 0)], s.covariance[(0, 1)], s.covariance[(0, 2)]],
                [s.covariance[(1, 0)], s.covariance[(1, 1)], s.covariance[(1, 2)]],
                [s.covariance[(2, 0)], s.covariance[(2, 1)], s.covariance[(2, 2)]],
            ],
            label: s.label.clone(),
        })
        .collect();

    let links = model
        .links()
        .map(|(_, l)| LinkRecord {
            source: l.source.0,
            target: l.target.0,
        })
        .collect();

    let tag_sets = tags
        .structure
        .sets()
        .map(|(_, set)| TagSetRecord {
            name: set.name.clone(),
            tags: set
                .tags
                .iter()
                .map(|t| TagRecord {
                    label: t.label.clone(),
                    color: t.color,
                })
                .collect(),
        })
        .collect();

    let mut spot_tags = Vec::new();
    let mut link_tags = Vec::new();
    for (set_id, _) in tags.structure.sets() {
        for (spot, tag) in tags.assignments.spot_assignments(set_id) {
            spot_tags.push(AssignmentRecord {
                set: set_id.0,
                object: spot.0,
                tag: tag.0,
            });
        }
        for (link, tag) in tags.assignments.link_assignments(set_id) {
            link_tags.push(AssignmentRecord {
                set: set_id.0,
                object: link.0,
                tag: tag.0,
            });
        }
    }
    // Assignment maps iterate in hash order; sort for stable files.
    spot_tags.sort_by_key(|r| (r.set, r.object));
    link_tags.sort_by_key(|r| (r.set, r.object));

    ProjectFile {
        version: FORMAT_VERSION,
        spots,
        links,
        tag_sets,
        spot_tags,
        link_tags,
    }
}

// ============================================================================
// LOAD
// ============================================================================

/// Read a project file into a model and its tag data.
///
/// Cross-references are checked but the forest invariants are not;
/// use [`load_dataset`] for validated merge input.
pub fn load_project(path: impl AsRef<Path>) -> Result<(LineageModel, TagData), StorageError> {
    let reader = BufReader::new(File::open(path)?);
    let file: ProjectFile = serde_json::from_reader(reader)?;
    from_wire(file)
}

/// Read a project file into a validated, indexed [`Dataset`].
pub fn load_dataset(path: impl AsRef<Path>) -> Result<Dataset, StorageError> {
    let (model, tags) = load_project(path)?;
    Ok(Dataset::new(model, tags)?)
}

fn from_wire(file: ProjectFile) -> Result<(LineageModel, TagData), StorageError> {
    if file.version != FORMAT_VERSION {
        return Err(StorageError::UnsupportedVersion {
            found: file.version,
            supported: FORMAT_VERSION,
        });
    }

    let mut model = LineageModel::new();
    for record in file.spots {
        let c = record.covariance;
        model.add_spot(Spot {
            timepoint: record.timepoint,
            position: Vector3::new(record.position[0], record.position[1], record.position[2]),
            covariance: Matrix3::new(
                c[0][0], c[0][1], c[0][2], c[1][0], c[1][1], c[1][2], c[2][0], c[2][1], c[2][2],
            ),
            label: record.label,
        });
    }

    let spot_count = model.spot_count() as u32;
    for record in &file.links {
        let endpoint = record.source.max(record.target);
        if endpoint >= spot_count {
            return Err(StorageError::InvalidHandle {
                kind: "spot",
                index: endpoint,
            });
        }
        model.add_link(SpotId(record.source), SpotId(record.target));
    }
    let link_count = model.link_count() as u32;

    let mut builder = TagStructureBuilder::new();
    let mut tags_per_set = Vec::with_capacity(file.tag_sets.len());
    for set in file.tag_sets {
        let set_id = builder.add_set(set.name);
        tags_per_set.push(set.tags.len() as u32);
        for tag in set.tags {
            builder.add_tag(set_id, tag.label, tag.color);
        }
    }
    let structure = builder.build();

    let mut assignments = TagAssignments::for_structure(&structure);
    for record in file.spot_tags {
        check_assignment(&record, &tags_per_set, spot_count, "spot")?;
        assignments.tag_spot(TagSetId(record.set), SpotId(record.object), TagId(record.tag));
    }
    for record in file.link_tags {
        check_assignment(&record, &tags_per_set, link_count, "link")?;
        assignments.tag_link(TagSetId(record.set), LinkId(record.object), TagId(record.tag));
    }

    Ok((
        model,
        TagData {
            structure,
            assignments,
        },
    ))
}

fn check_assignment(
    record: &AssignmentRecord,
    tags_per_set: &[u32],
    object_count: u32,
    kind: &'static str,
) -> Result<(), StorageError> {
    let Some(&tag_count) = tags_per_set.get(record.set as usize) else {
        return Err(StorageError::InvalidHandle {
            kind: "tag set",
            index: record.set,
        });
    };
    if record.tag >= tag_count {
        return Err(StorageError::InvalidHandle {
            kind: "tag",
            index: record.tag,
        });
    }
    if record.object >= object_count {
        return Err(StorageError::InvalidHandle {
            kind,
            index: record.object,
        });
    }
    Ok(())
}

// ============================================================================
// ERRORS
// ============================================================================

/// Errors raised while reading or writing project files.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed project file: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Project file version {found} is not supported (this build reads version {supported})")]
    UnsupportedVersion { found: u32, supported: u32 },

    #[error("Project file references {kind} {index}, which does not exist")]
    InvalidHandle { kind: &'static str, index: u32 },

    #[error(transparent)]
    Model(#[from] ModelError),
}

// ============================================================================
// TESTS
// ============================================================================
