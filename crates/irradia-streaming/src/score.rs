//! Cell priority scoring.
//!
//! Lower orders first: a cell with a smaller score is more urgent. The two
//! sentinel variants replace the original magic float values so they cannot
//! collide with a real distance.

use std::cmp::Ordering;

use glam::Vec3;

/// Priority of a cell for streaming or blending decisions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Score {
    /// Must be handled regardless of distance.
    Prioritize,
    /// Resident data is out of date and must be uploaded again.
    ForceReupload,
    /// Normal distance/visibility derived score; lower is more urgent.
    Scheduled(f32),
}

impl Score {
    /// Score of a cell whose data is current; orders after everything.
    pub const UP_TO_DATE: Self = Self::Scheduled(f32::MAX);

    #[must_use]
    pub fn is_up_to_date(self) -> bool {
        matches!(self, Self::Scheduled(v) if v == f32::MAX)
    }

    fn rank(self) -> u8 {
        match self {
            Self::Prioritize => 0,
            Self::ForceReupload => 1,
            Self::Scheduled(_) => 2,
        }
    }
}

impl Eq for Score {}

impl PartialOrd for Score {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Score {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Scheduled(a), Self::Scheduled(b)) => a.total_cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

/// Distance/visibility score of a cell, in cell-space units.
///
/// Cells in front of the camera weigh less (load sooner) than cells at the
/// same distance behind it.
#[must_use]
pub fn streaming_score(cell_position: Vec3, camera_position: Vec3, camera_direction: Vec3) -> f32 {
    let camera_to_cell = (cell_position - camera_position).normalize_or_zero();
    let distance = cell_position.distance(camera_position);
    distance * (2.0 - camera_to_cell.dot(camera_direction))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn scheduled_orders_by_value() {
        assert!(Score::Scheduled(1.0) < Score::Scheduled(2.0));
        assert!(Score::Scheduled(-5.0) < Score::Scheduled(0.0));
    }

    #[test]
    fn sentinels_order_before_scheduled() {
        assert!(Score::Prioritize < Score::ForceReupload);
        assert!(Score::ForceReupload < Score::Scheduled(f32::MIN));
        assert!(Score::Prioritize < Score::Scheduled(0.0));
    }

    #[test]
    fn up_to_date_orders_last() {
        assert!(Score::Scheduled(1.0e30) < Score::UP_TO_DATE);
        assert!(Score::UP_TO_DATE.is_up_to_date());
        assert!(!Score::Scheduled(3.0).is_up_to_date());
    }

    #[test]
    fn cells_in_front_score_lower() {
        let camera = Vec3::ZERO;
        let forward = Vec3::Z;
        let in_front = streaming_score(Vec3::new(0.0, 0.0, 10.0), camera, forward);
        let behind = streaming_score(Vec3::new(0.0, 0.0, -10.0), camera, forward);

        assert_relative_eq!(in_front, 10.0);
        assert_relative_eq!(behind, 30.0);
        assert!(in_front < behind);
    }

    #[test]
    fn score_grows_with_distance() {
        let camera = Vec3::ZERO;
        let forward = Vec3::Z;
        let near = streaming_score(Vec3::new(5.0, 0.0, 0.0), camera, forward);
        let far = streaming_score(Vec3::new(50.0, 0.0, 0.0), camera, forward);
        assert!(near < far);
    }
}
