//! Gap interpolation pre-pass.
//!
//! The merge engine assumes temporally contiguous links: a link spans
//! exactly one timepoint. Curated data sometimes skips frames where a
//! cell was not detected, so this pass rewrites every gap link into a
//! unit-step chain through linearly interpolated spots.
//!
//! The original gap link keeps its handle and becomes the first
//! segment of the chain, so tags attached to it survive the rewrite.

use tracing::debug;

use crate::model::{LineageModel, LinkId, Spot};

/// Replace every link spanning more than one timepoint with a chain of
/// unit-step links through interpolated spots.
///
/// Interpolated spots carry linearly blended positions and covariances
/// and no label. Returns the number of spots inserted.
pub fn fill_gaps(model: &mut LineageModel) -> usize {
    let gaps: Vec<LinkId> = model
        .link_ids()
        .filter(|&l| {
            let link = model.link(l);
            model.spot(link.target).timepoint > model.spot(link.source).timepoint + 1
        })
        .collect();

    let mut inserted = 0;
    for link_id in &gaps {
        let link = *model.link(*link_id);
        let from = model.spot(link.source).clone();
        let to = model.spot(link.target).clone();
        let span = (to.timepoint - from.timepoint) as f64;

        let mut prev = link.source;
        for timepoint in from.timepoint + 1..to.timepoint {
            let f = (timepoint - from.timepoint) as f64 / span;
            let mid = model.add_spot(Spot {
                timepoint,
                position: from.position.lerp(&to.position, f),
                covariance: from.covariance * (1.0 - f) + to.covariance * f,
                label: None,
            });
            if prev == link.source {
                // The gap link is re-pointed at the first interpolated
                // spot so its handle (and any tags on it) survives.
                model.rewire_link(*link_id, prev, mid);
            } else {
                model.add_link(prev, mid);
            }
            prev = mid;
            inserted += 1;
        }
        model.add_link(prev, link.target);
    }

    if inserted > 0 {
        debug!(
            "gap interpolation inserted {} spots across {} links",
            inserted,
            gaps.len()
        );
    }
    inserted
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::{Matrix3, Vector3};

    fn spot_at(timepoint: u32, x: f64) -> Spot {
        Spot {
            timepoint,
            position: Vector3::new(x, 0.0, 0.0),
            covariance: Matrix3::identity(),
            label: None,
        }
    }

    #[test]
    fn test_contiguous_links_are_untouched() {
        let mut model = LineageModel::new();
        let a = model.add_spot(spot_at(0, 0.0));
        let b = model.add_spot(spot_at(1, 1.0));
        model.add_link(a, b);
        let before = model.clone();

        assert_eq!(fill_gaps(&mut model), 0);
        assert_eq!(model, before);
    }

    #[test]
    fn test_two_frame_gap_inserts_one_spot() {
        let mut model = LineageModel::new();
        let a = model.add_spot(spot_at(0, 0.0));
        let b = model.add_spot(spot_at(2, 4.0));
        let l = model.add_link(a, b);

        assert_eq!(fill_gaps(&mut model), 1);
        assert_eq!(model.spot_count(), 3);
        assert_eq!(model.link_count(), 2);

        // The gap link now ends at the interpolated midpoint.
        let mid = model.link(l).target;
        let spot = model.spot(mid);
        assert_eq!(spot.timepoint, 1);
        assert_relative_eq!(spot.position.x, 2.0);
        assert!(spot.label.is_none());
        assert_eq!(model.parent(b), Some(mid));

        assert!(model.validate_forest().is_ok());
    }

    #[test]
    fn test_three_frame_gap_interpolates_in_thirds() {
        let mut model = LineageModel::new();
        let a = model.add_spot(spot_at(0, 0.0));
        let b = model.add_spot(spot_at(3, 3.0));
        model.add_link(a, b);

        assert_eq!(fill_gaps(&mut model), 2);
        assert_eq!(model.spot_count(), 4);
        assert_eq!(model.link_count(), 3);

        // Walk the chain a -> m1 -> m2 -> b.
        let m1 = model.children(a).next().unwrap();
        let m2 = model.children(m1).next().unwrap();
        assert_relative_eq!(model.spot(m1).position.x, 1.0);
        assert_relative_eq!(model.spot(m2).position.x, 2.0);
        assert_eq!(model.children(m2).next(), Some(b));
        assert!(model.validate_forest().is_ok());
    }

    #[test]
    fn test_covariance_is_blended() {
        let mut model = LineageModel::new();
        let a = model.add_spot(Spot {
            covariance: Matrix3::from_diagonal(&Vector3::new(1.0, 1.0, 1.0)),
            ..spot_at(0, 0.0)
        });
        let b = model.add_spot(Spot {
            covariance: Matrix3::from_diagonal(&Vector3::new(3.0, 5.0, 7.0)),
            ..spot_at(2, 0.0)
        });
        model.add_link(a, b);

        fill_gaps(&mut model);

        let mid = model.children(a).next().unwrap();
        let cov = model.spot(mid).covariance;
        assert_relative_eq!(cov[(0, 0)], 2.0);
        assert_relative_eq!(cov[(1, 1)], 3.0);
        assert_relative_eq!(cov[(2, 2)], 4.0);
    }

    #[test]
    fn test_gap_behind_a_division() {
        // One child is contiguous, the other skips a frame.
        let mut model = LineageModel::new();
        let root = model.add_spot(spot_at(0, 0.0));
        let near = model.add_spot(spot_at(1, -1.0));
        let far = model.add_spot(spot_at(2, 2.0));
        model.add_link(root, near);
        model.add_link(root, far);

        assert_eq!(fill_gaps(&mut model), 1);
        assert_eq!(model.outgoing(root).len(), 2);
        assert!(model.validate_forest().is_ok());

        let mid = model.parent(far).unwrap();
        assert_eq!(model.spot(mid).timepoint, 1);
        assert_eq!(model.parent(mid), Some(root));
    }
}
