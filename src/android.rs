//! Phone-in-a-viewer HMD driven by the Android sensor event queue.
//!
//! The NDK sensor manager lives on the host side; it is handed to the
//! driver as a [`SensorSource`].

use crate::config::DriverConfig;
use crate::device::{Device, DeviceBase, DeviceCapabilities, HmdParts, PoseTracker};
use crate::distortion::{CardboardArgs, Distortion};
use crate::imu::{GravityWindow, Imu3Dof};
use crate::thread::{lock, RunFlag, ThreadHelper};
use crate::time::monotonic_ns;
use crate::types::{
    DeviceName, DeviceType, Fov, InputName, Pose, RelationFlags, SpaceRelation, TrackingOrigin,
    Vec3,
};
use crate::{Result, XrError};
use log::LevelFilter;
use std::sync::{Arc, Mutex};

/// Sensor event period, 60 Hz.
pub const POLL_PERIOD_US: u32 = 16_667;
const POLL_TIMEOUT_MS: i32 = 100;

const SCREEN_W_PIXELS: u32 = 1280;
const SCREEN_H_PIXELS: u32 = 720;
const SCREEN_W_METERS: f32 = 0.13;
const SCREEN_H_METERS: f32 = 0.07;
const FOV_DEGREES: f32 = 85.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorKind {
    Accelerometer,
    Gyroscope,
}

/// One event from the sensor queue, in the phone's own axes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SensorEvent {
    Accel { timestamp_ns: i64, value: [f32; 3] },
    Gyro { timestamp_ns: i64, value: [f32; 3] },
    /// Anything else the queue delivers.
    Other(i32),
}

/// The host's sensor event queue.
pub trait SensorSource: Send {
    /// Whether the phone has this sensor at all.
    fn has_sensor(&self, kind: SensorKind) -> bool;

    fn enable(&mut self, kind: SensorKind, period_us: u32) -> Result<()>;

    /// Next event, or `None` once `timeout_ms` passes without one.
    fn next_event(&mut self, timeout_ms: i32) -> Result<Option<SensorEvent>>;
}

/// Phone axes to head axes: x right, y up, z towards the user.
pub fn remap_accel(v: [f32; 3]) -> Vec3 {
    Vec3::new(v[1], -v[0], v[2])
}

pub fn remap_gyro(v: [f32; 3]) -> Vec3 {
    Vec3::new(-v[1], v[0], v[2])
}

/// Cardboard viewer parameters for the default screen.
fn cardboard_args() -> CardboardArgs {
    let half = (FOV_DEGREES / 2.0).to_radians();
    CardboardArgs {
        distortion_k: [0.441, 0.156, 0.0, 0.0, 0.0],
        screen_w_pixels: SCREEN_W_PIXELS,
        screen_h_pixels: SCREEN_H_PIXELS,
        screen_w_meters: SCREEN_W_METERS,
        screen_h_meters: SCREEN_H_METERS,
        inter_lens_distance_meters: 0.06,
        lens_y_center_on_screen_meters: SCREEN_H_METERS / 2.0,
        screen_to_lens_distance_meters: 0.042,
        fov: Fov {
            angle_left: -half,
            angle_right: half,
            angle_up: half,
            angle_down: -half,
        },
    }
}

struct AndroidState {
    fusion: Imu3Dof,
    accel: Vec3,
}

pub struct AndroidDevice {
    base: DeviceBase,
    state: Arc<Mutex<AndroidState>>,
    tracker: PoseTracker,
    oth: ThreadHelper,
    destroyed: bool,
    ll: LevelFilter,
}

impl AndroidDevice {
    pub fn create(
        source: Box<dyn SensorSource>,
        origin: Arc<TrackingOrigin>,
        config: &DriverConfig,
    ) -> Result<AndroidDevice> {
        let ll = config.log.android;

        let mut base = DeviceBase::new(
            DeviceName::AndroidSensors,
            DeviceType::Hmd,
            "Android Sensors",
            &[InputName::GenericHeadPose],
            &[],
            origin,
        );
        base.hmd = Some(HmdParts::side_by_side_from_total_fov(
            SCREEN_W_PIXELS,
            SCREEN_H_PIXELS,
            SCREEN_W_METERS,
            SCREEN_H_METERS,
            POLL_PERIOD_US as i64 * 1000,
            FOV_DEGREES.to_radians(),
        )?);
        base.distortion = Distortion::Cardboard(cardboard_args().calculate());
        base.capabilities = DeviceCapabilities::ORIENTATION_TRACKING | DeviceCapabilities::ANGULAR_VELOCITY;

        let state = Arc::new(Mutex::new(AndroidState {
            fusion: Imu3Dof::new(GravityWindow::Fast, ll),
            accel: Vec3::zeros(),
        }));

        let worker = Worker {
            source,
            state: state.clone(),
            ll,
        };
        let mut oth = ThreadHelper::new();
        oth.start("android-sensors", move |flag| worker.run(flag))?;

        ll_debug!(ll, "Created device");

        Ok(AndroidDevice {
            base,
            state,
            tracker: PoseTracker::new(config.allow_finite_diff, ll),
            oth,
            destroyed: false,
            ll,
        })
    }
}

impl Device for AndroidDevice {
    fn base(&self) -> &DeviceBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut DeviceBase {
        &mut self.base
    }

    fn update_inputs(&mut self) -> Result<()> {
        Ok(())
    }

    fn get_tracked_pose(&mut self, name: InputName, _at_timestamp_ns: i64) -> Result<SpaceRelation> {
        if name != InputName::GenericHeadPose {
            ll_error!(self.ll, "Unknown input name {:?}", name);
            return Err(XrError::UnknownInput);
        }

        let (rot, gyro) = {
            let state = lock(&self.state);
            (state.fusion.rot, state.fusion.angular_velocity())
        };
        let flags = RelationFlags::ORIENTATION_VALID | RelationFlags::ORIENTATION_TRACKED;
        let pose = Pose {
            orientation: rot,
            position: Vec3::zeros(),
        };
        Ok(self.tracker.update(monotonic_ns(), pose, flags, Some(rot * gyro)))
    }

    fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        self.oth.stop();
        ll_debug!(self.ll, "Destroyed device");
    }
}

impl Drop for AndroidDevice {
    fn drop(&mut self) {
        self.destroy();
    }
}

struct Worker {
    source: Box<dyn SensorSource>,
    state: Arc<Mutex<AndroidState>>,
    ll: LevelFilter,
}

impl Worker {
    fn run(mut self, flag: RunFlag) {
        for kind in [SensorKind::Accelerometer, SensorKind::Gyroscope] {
            if !self.source.has_sensor(kind) {
                ll_error!(self.ll, "No {:?} on this device", kind);
                return;
            }
            if let Err(e) = self.source.enable(kind, POLL_PERIOD_US) {
                ll_error!(self.ll, "Failed to enable {:?}: {}", kind, e);
                return;
            }
        }

        while flag.is_running() {
            match self.source.next_event(POLL_TIMEOUT_MS) {
                Ok(Some(event)) => self.handle(event),
                Ok(None) => {}
                Err(e) => {
                    ll_error!(self.ll, "Sensor queue failed: {}", e);
                    break;
                }
            }
        }
        ll_debug!(self.ll, "Worker exiting");
    }

    fn handle(&self, event: SensorEvent) {
        match event {
            SensorEvent::Accel { timestamp_ns, value } => {
                let accel = remap_accel(value);
                ll_trace!(self.ll, "accel {} {:.2} {:.2} {:.2}", timestamp_ns, accel.x, accel.y, accel.z);
                lock(&self.state).accel = accel;
            }
            SensorEvent::Gyro { timestamp_ns, value } => {
                let gyro = remap_gyro(value);
                ll_trace!(self.ll, "gyro {} {:.2} {:.2} {:.2}", timestamp_ns, gyro.x, gyro.y, gyro.z);

                let mut state = lock(&self.state);
                let accel = state.accel;
                state.fusion.update(timestamp_ns, &accel, &gyro);
            }
            SensorEvent::Other(ty) => ll_trace!(self.ll, "Unhandled event type {}", ty),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::{Receiver, Sender};
    use std::time::Duration;

    struct ChannelSource {
        rx: Receiver<SensorEvent>,
        enabled: Sender<(SensorKind, u32)>,
    }

    impl SensorSource for ChannelSource {
        fn has_sensor(&self, _kind: SensorKind) -> bool {
            true
        }

        fn enable(&mut self, kind: SensorKind, period_us: u32) -> Result<()> {
            let _ = self.enabled.send((kind, period_us));
            Ok(())
        }

        fn next_event(&mut self, timeout_ms: i32) -> Result<Option<SensorEvent>> {
            Ok(self.rx.recv_timeout(Duration::from_millis(timeout_ms as u64)).ok())
        }
    }

    fn device() -> (AndroidDevice, Sender<SensorEvent>, Receiver<(SensorKind, u32)>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let (etx, erx) = crossbeam_channel::unbounded();
        let origin = Arc::new(TrackingOrigin::new("phone", crate::types::TrackingType::OrientationOnly));
        let dev = AndroidDevice::create(
            Box::new(ChannelSource { rx, enabled: etx }),
            origin,
            &DriverConfig::default(),
        )
        .unwrap();
        (dev, tx, erx)
    }

    #[test]
    fn test_axis_remap() {
        assert_eq!(remap_accel([1.0, 2.0, 3.0]), Vec3::new(2.0, -1.0, 3.0));
        assert_eq!(remap_gyro([1.0, 2.0, 3.0]), Vec3::new(-2.0, 1.0, 3.0));
    }

    #[test]
    fn test_gyro_rotates_head_pose() {
        let (mut dev, tx, enabled) = device();
        assert_eq!(
            enabled.recv_timeout(Duration::from_secs(1)).unwrap(),
            (SensorKind::Accelerometer, POLL_PERIOD_US)
        );

        // Phone y axis up in head space is -x after the remap.
        tx.send(SensorEvent::Accel {
            timestamp_ns: 0,
            value: [-9.81, 0.0, 0.0],
        })
        .unwrap();
        // Yaw at 1 rad/s for 0.1 s, phone x axis is head y.
        for i in 0..=10 {
            tx.send(SensorEvent::Gyro {
                timestamp_ns: 1_000_000_000 + i * 10_000_000,
                value: [1.0, 0.0, 0.0],
            })
            .unwrap();
        }

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        let mut rel = SpaceRelation::zero();
        while std::time::Instant::now() < deadline {
            rel = dev.get_tracked_pose(InputName::GenericHeadPose, 0).unwrap();
            if rel.pose.orientation.angle() > 0.09 {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!((rel.pose.orientation.angle() - 0.1).abs() < 0.01);
        assert!(rel.flags.contains(RelationFlags::ORIENTATION_TRACKED));
        assert!(!rel.flags.contains(RelationFlags::POSITION_VALID));
        dev.destroy();
    }

    #[test]
    fn test_device_geometry_and_inputs() {
        let (mut dev, _tx, _enabled) = device();
        let hmd = dev.hmd().unwrap();
        assert_eq!(hmd.screen_w_pixels, 1280);
        assert_eq!(hmd.views[1].viewport.x_pixels, 640);
        assert!(matches!(dev.base().distortion, Distortion::Cardboard(_)));
        assert!(matches!(
            dev.get_tracked_pose(InputName::PsmvBallTipPose, 0),
            Err(XrError::UnknownInput)
        ));
        dev.destroy();
        dev.destroy();
    }
}
