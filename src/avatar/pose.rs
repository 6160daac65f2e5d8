//! Idle head motion

use serde::Serialize;

/// Head rotation in radians
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct HeadPose {
    pub yaw: f32,
    pub pitch: f32,
}

/// Slow sway so the head never looks frozen
#[must_use]
pub fn idle_pose(elapsed_secs: f32) -> HeadPose {
    HeadPose {
        yaw: (elapsed_secs * 0.5).sin() * 0.03,
        pitch: (elapsed_secs * 0.3).sin() * 0.02,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rest_at_zero() {
        assert_eq!(idle_pose(0.0), HeadPose::default());
    }

    #[test]
    fn test_sway_is_bounded() {
        for i in 0..1000 {
            let pose = idle_pose(i as f32 * 0.1);
            assert!(pose.yaw.abs() <= 0.03 + f32::EPSILON);
            assert!(pose.pitch.abs() <= 0.02 + f32::EPSILON);
        }
    }
}
