use crate::types::Vec3;
use nalgebra::Vector3;

/// Raw integer sensor reading, already sign-corrected.
pub type RawVec3 = Vector3<i32>;

/// Affine `(raw - bias) * gain` transform from raw counts to m/s² and rad/s.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImuPrefilter {
    pub accel_gain: Vec3,
    pub accel_bias: Vec3,
    pub gyro_gain: Vec3,
    pub gyro_bias: Vec3,
}

impl ImuPrefilter {
    pub fn identity() -> Self {
        Self {
            accel_gain: Vec3::repeat(1.0),
            accel_bias: Vec3::zeros(),
            gyro_gain: Vec3::repeat(1.0),
            gyro_bias: Vec3::zeros(),
        }
    }

    pub fn accel(&self, raw: &RawVec3) -> Vec3 {
        (raw.cast::<f32>() - self.accel_bias).component_mul(&self.accel_gain)
    }

    pub fn gyro(&self, raw: &RawVec3) -> Vec3 {
        (raw.cast::<f32>() - self.gyro_bias).component_mul(&self.gyro_gain)
    }
}

impl Default for ImuPrefilter {
    fn default() -> Self {
        Self::identity()
    }
}
