//! IMU processing: raw-to-physical pre-filter, 3-DoF orientation fusion
//! and the small helpers the camera drivers share for IMU streams.

pub mod clock;
pub mod fifo;
pub mod fusion;
pub mod merge;
pub mod prefilter;

pub use clock::ClockOffset;
pub use fifo::FilterFifo3;
pub use fusion::{GravityWindow, Imu3Dof};
pub use merge::{MotionSensor, PartialImuSample};
pub use prefilter::ImuPrefilter;

/// Standard gravity in m/s².
pub const GRAVITY_M_S2: f32 = 9.80665;
