//!
//! Matching detected markers against a reference board
//!

use nalgebra::{Point2, Point3};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::board::ReferenceBoard;

/// A marker found by the detector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedMarker {
    pub id: u32,
    /// Image corners, in the same order as the board's corners
    pub corners: [Point2<f64>; 4],
}

/// All markers detected in one frame
#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MarkerObservation {
    pub markers: Vec<DetectedMarker>,
}
impl MarkerObservation {
    pub fn new(markers: Vec<DetectedMarker>) -> Self {
        Self { markers }
    }
}
impl From<Vec<DetectedMarker>> for MarkerObservation {
    fn from(markers: Vec<DetectedMarker>) -> Self {
        Self::new(markers)
    }
}

/// One image point and the board point it shows
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Correspondence {
    pub image: Point2<f64>,
    pub board: Point3<f64>,
}

/// The 2D/3D pairs of one accepted frame
#[derive(Default, Debug, Clone, PartialEq)]
pub struct ViewCorrespondences {
    pub pairs: Vec<Correspondence>,
    /// Number of distinct board markers the pairs come from
    pub markers: usize,
}
impl ViewCorrespondences {
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

/// Resolve a frame's detections to board correspondences
///
/// Markers the board does not know are skipped. A marker reported twice in the same frame
/// only contributes its first detection.
pub fn resolve(observation: &MarkerObservation, board: &ReferenceBoard) -> ViewCorrespondences {
    let mut seen = HashSet::with_capacity(observation.markers.len());
    let mut view = ViewCorrespondences {
        pairs: Vec::with_capacity(observation.markers.len() * 4),
        markers: 0,
    };

    for detected in &observation.markers {
        let Some(reference) = board.lookup(detected.id) else {
            continue;
        };
        if !seen.insert(detected.id) {
            continue;
        }

        view.pairs.extend(
            detected
                .corners
                .iter()
                .zip(reference.corners.iter())
                .map(|(&image, &board)| Correspondence { image, board }),
        );
        view.markers += 1;
    }

    view
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detection(id: u32, offset: f64) -> DetectedMarker {
        DetectedMarker {
            id,
            corners: [
                Point2::new(offset, 0.0),
                Point2::new(offset + 10.0, 0.0),
                Point2::new(offset + 10.0, 10.0),
                Point2::new(offset, 10.0),
            ],
        }
    }

    #[test]
    fn known_markers_are_paired_in_order() {
        let board = ReferenceBoard::decode_default();
        let obs = MarkerObservation::new(vec![detection(161, 0.0), detection(227, 20.0)]);

        let view = resolve(&obs, &board);
        assert_eq!(view.markers, 2);
        assert_eq!(view.len(), 8);

        let reference = board.lookup(227).unwrap();
        for (i, pair) in view.pairs[4..].iter().enumerate() {
            assert_eq!(pair.image, obs.markers[1].corners[i]);
            assert_eq!(pair.board, reference.corners[i]);
        }
    }

    #[test]
    fn unknown_and_repeated_markers_are_skipped() {
        let board = ReferenceBoard::decode_default();
        let obs = MarkerObservation::new(vec![
            detection(1, 0.0),
            detection(161, 0.0),
            detection(161, 50.0),
            detection(9999, 0.0),
        ]);

        let view = resolve(&obs, &board);
        assert_eq!(view.markers, 1);
        assert_eq!(view.len(), 4);
        assert_eq!(view.pairs[0].image, Point2::new(0.0, 0.0));

        let none = resolve(&MarkerObservation::new(vec![detection(2, 0.0)]), &board);
        assert!(none.is_empty());
        assert_eq!(none.markers, 0);
    }

    #[test]
    fn observations_deserialize_from_json() {
        let json = r#"[{"id": 161, "corners": [[0, 0], [10, 0], [10, 10], [0, 10]]}]"#;
        let obs: MarkerObservation = serde_json::from_str(json).unwrap();
        assert_eq!(obs, MarkerObservation::new(vec![detection(161, 0.0)]));
    }
}
