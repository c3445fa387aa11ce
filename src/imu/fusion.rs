//! Orientation-only (3-DoF) fusion: gyro integration with a slow
//! gravity-based tilt correction from the accelerometer.

use super::fifo::FilterFifo3;
use crate::time::{NS_PER_MS, NS_PER_SEC};
use crate::types::{Quat, Vec3};
use log::LevelFilter;
use nalgebra::Unit;
use std::f32::consts::PI;

const FIFO_SIZE: usize = 1000;
const GRAVITY_TOLERANCE: f32 = 0.9;
const GYRO_TOLERANCE: f32 = 0.1;
const MIN_TILT_ERROR: f32 = 0.05;
const MAX_TILT_ERROR: f32 = 0.01;
const LEVEL_GRAVITY: f32 = 9.82;

/// How long the device must be at rest before its accelerometer is
/// trusted as a gravity reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GravityWindow {
    /// 20 ms, for head-mounted devices.
    Fast,
    /// 300 ms, for hand-held controllers that see sustained
    /// non-gravitational acceleration.
    Slow,
}

impl GravityWindow {
    pub fn duration_ns(self) -> i64 {
        match self {
            GravityWindow::Fast => 20 * NS_PER_MS,
            GravityWindow::Slow => 300 * NS_PER_MS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LastSample {
    pub accel: Vec3,
    pub gyro: Vec3,
    pub timestamp_ns: i64,
    pub delta_ms: f32,
}

#[derive(Debug, Clone, Copy)]
struct GravityState {
    level_timestamp_ns: i64,
    error_axis: Vec3,
    error_angle: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Start,
    Running,
}

#[derive(Debug, Clone)]
pub struct Imu3Dof {
    pub rot: Quat,
    pub last: LastSample,
    window: GravityWindow,
    state: State,
    grav: GravityState,
    world_accel: FilterFifo3,
    gyro: FilterFifo3,
    dropped: u64,
    /// Set once the first dropped sample has been reported.
    warned: bool,
    ll: LevelFilter,
}

impl Imu3Dof {
    pub fn new(window: GravityWindow, ll: LevelFilter) -> Self {
        Self {
            rot: Quat::identity(),
            last: LastSample {
                accel: Vec3::zeros(),
                gyro: Vec3::zeros(),
                timestamp_ns: 0,
                delta_ms: 0.0,
            },
            window,
            state: State::Start,
            grav: GravityState {
                level_timestamp_ns: 0,
                error_axis: Vec3::zeros(),
                error_angle: 0.0,
            },
            world_accel: FilterFifo3::new(FIFO_SIZE),
            gyro: FilterFifo3::new(FIFO_SIZE),
            dropped: 0,
            warned: false,
            ll,
        }
    }

    /// Number of samples rejected for going back in time.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Body-frame angular velocity of the last accepted sample.
    pub fn angular_velocity(&self) -> Vec3 {
        self.last.gyro
    }

    pub fn gyro_history(&self) -> &FilterFifo3 {
        &self.gyro
    }

    /// Feeds one calibrated sample. Returns `false` if the sample was
    /// dropped because its timestamp is not after the last accepted one.
    pub fn update(&mut self, timestamp_ns: i64, accel: &Vec3, gyro: &Vec3) -> bool {
        if self.state == State::Start {
            self.state = State::Running;
            self.last.timestamp_ns = timestamp_ns;
            self.grav.level_timestamp_ns = timestamp_ns;
            return true;
        }

        if timestamp_ns <= self.last.timestamp_ns {
            self.dropped += 1;
            if !self.warned {
                self.warned = true;
                ll_warn!(
                    self.ll,
                    "Dropping IMU samples from the past: new {} <= last {}",
                    timestamp_ns,
                    self.last.timestamp_ns
                );
            } else {
                ll_trace!(self.ll, "Dropped IMU sample at {}", timestamp_ns);
            }
            return false;
        }

        self.last.gyro = *gyro;
        self.last.accel = *accel;

        let world_accel = self.rot * accel;

        let dt = (timestamp_ns - self.last.timestamp_ns) as f64 / NS_PER_SEC as f64;
        self.last.delta_ms = (dt * 1000.0) as f32;
        self.last.timestamp_ns = timestamp_ns;

        self.world_accel.push(world_accel, timestamp_ns);
        self.gyro.push(*gyro, timestamp_ns);

        let gyro_length = gyro.norm();
        if gyro_length > 0.0001 {
            let axis = Unit::new_unchecked(gyro / gyro_length);
            let delta = Quat::from_axis_angle(&axis, gyro_length * dt as f32);
            self.rot *= delta;
        }

        self.gravity_correction(timestamp_ns, accel, dt as f32, gyro_length);

        self.rot.renormalize();
        true
    }

    fn gravity_correction(&mut self, timestamp_ns: i64, accel: &Vec3, dt: f32, gyro_length: f32) {
        let dur_ns = self.window.duration_ns();

        // Any motion restarts the at-rest period.
        let is_accel = (accel.norm() - LEVEL_GRAVITY).abs() >= GRAVITY_TOLERANCE;
        let is_rotating = gyro_length >= GYRO_TOLERANCE;
        if is_accel || is_rotating {
            self.grav.level_timestamp_ns = timestamp_ns;
        }

        if self.grav.level_timestamp_ns + dur_ns < timestamp_ns {
            self.grav.level_timestamp_ns = timestamp_ns;

            if let Some(mean) = self.world_accel.filter(timestamp_ns - dur_ns, timestamp_ns) {
                if (mean.norm() - LEVEL_GRAVITY) < GRAVITY_TOLERANCE && mean.norm() > 0.0 {
                    // up x mean, with up = (0, 1, 0)
                    let tilt = Vec3::new(mean.z, 0.0, -mean.x);
                    let tilt_angle = Vec3::y().angle(&mean);

                    if tilt_angle > MAX_TILT_ERROR && tilt.norm() > 0.0 {
                        self.grav.error_angle = tilt_angle;
                        self.grav.error_axis = tilt.normalize();
                    }
                }
            }
        }

        if self.grav.error_angle > MIN_TILT_ERROR {
            // 180° over 5 s when moving, 180° over 60 s when still.
            let max_radians = PI * dt / 5.0;
            let min_radians = PI * dt / 60.0;

            let correction = (0.5 * gyro_length * max_radians)
                .max(min_radians)
                .min(max_radians)
                .min(self.grav.error_angle);

            self.grav.error_angle -= correction;

            let axis = Unit::new_normalize(self.grav.error_axis);
            let corr = Quat::from_axis_angle(&axis, -correction);
            self.rot = corr * self.rot;
        }
    }
}
