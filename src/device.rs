//! The device contract every driver implements, and the state and
//! helpers drivers share.

use crate::binding::BindingProfile;
use crate::distortion::{self, Distortion};
use crate::time::ns_to_s;
use crate::types::{
    DeviceName, DeviceType, Fov, Input, InputName, Output, OutputName, OutputValue, Pose,
    RelationFlags, SpaceRelation, TrackingOrigin, UvTriplet, Vec2, Vec3,
};
use crate::{Result, XrError};
use log::LevelFilter;
use std::sync::Arc;

bitflags::bitflags! {
    /// What a device can report or do.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DeviceCapabilities: u32 {
        const ORIENTATION_TRACKING = 1 << 0;
        const POSITION_TRACKING    = 1 << 1;
        const HAND_TRACKING        = 1 << 2;
        /// Angular velocity comes from the hardware, not finite differences.
        const ANGULAR_VELOCITY     = 1 << 3;
        const FORCE_FEEDBACK       = 1 << 4;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlendMode {
    Opaque,
    Additive,
    AlphaBlend,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Viewport {
    pub x_pixels: u32,
    pub y_pixels: u32,
    pub w_pixels: u32,
    pub h_pixels: u32,
}

/// Geometry of one eye.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct HmdView {
    pub display_w_pixels: u32,
    pub display_h_pixels: u32,
    pub display_w_meters: f32,
    pub display_h_meters: f32,
    pub viewport: Viewport,
    /// Lens center on the display, in meters.
    pub lens_center: Vec2,
    pub fov: Fov,
}

/// Display description of a head-mounted device.
#[derive(Debug, Clone, PartialEq)]
pub struct HmdParts {
    pub screen_w_pixels: u32,
    pub screen_h_pixels: u32,
    pub nominal_frame_interval_ns: i64,
    pub views: [HmdView; 2],
    pub blend_modes: Vec<BlendMode>,
}

impl HmdParts {
    /// One panel split down the middle, the right eye seeing `fov` and the
    /// left eye its mirror image.
    pub fn side_by_side(
        w_pixels: u32,
        h_pixels: u32,
        w_meters: f32,
        h_meters: f32,
        nominal_frame_interval_ns: i64,
        fov: Fov,
    ) -> Self {
        let half_px = w_pixels / 2;
        let half_m = w_meters / 2.0;

        let view = |x: u32, fov: Fov| HmdView {
            display_w_pixels: half_px,
            display_h_pixels: h_pixels,
            display_w_meters: half_m,
            display_h_meters: h_meters,
            viewport: Viewport {
                x_pixels: x,
                y_pixels: 0,
                w_pixels: half_px,
                h_pixels,
            },
            lens_center: Vec2::new(half_m / 2.0, h_meters / 2.0),
            fov,
        };

        let left_fov = Fov {
            angle_left: -fov.angle_right,
            angle_right: -fov.angle_left,
            ..fov
        };

        Self {
            screen_w_pixels: w_pixels,
            screen_h_pixels: h_pixels,
            nominal_frame_interval_ns,
            views: [view(0, left_fov), view(half_px, fov)],
            blend_modes: vec![BlendMode::Opaque],
        }
    }

    /// Like [`HmdParts::side_by_side`] with the fov derived from a total
    /// horizontal fov and the lens position on a symmetric panel.
    pub fn side_by_side_from_total_fov(
        w_pixels: u32,
        h_pixels: u32,
        w_meters: f32,
        h_meters: f32,
        nominal_frame_interval_ns: i64,
        horizontal_fov: f32,
    ) -> Result<Self> {
        let half_m = (w_meters / 2.0) as f64;
        let fov = distortion::compute_fovs(
            half_m,
            half_m / 2.0,
            horizontal_fov as f64,
            h_meters as f64,
            h_meters as f64 / 2.0,
            0.0,
        )
        .ok_or_else(|| XrError::InvalidArgument("cannot solve display fov".into()))?;
        Ok(Self::side_by_side(
            w_pixels,
            h_pixels,
            w_meters,
            h_meters,
            nominal_frame_interval_ns,
            fov,
        ))
    }
}

/// Result of [`Device::get_view_poses`].
#[derive(Debug, Clone, PartialEq)]
pub struct ViewPoses {
    pub head: SpaceRelation,
    pub fovs: Vec<Fov>,
    pub poses: Vec<Pose>,
}

/// Pose of one eye relative to the head: half the eye relation, mirrored
/// for view 0 without producing `-0.0`.
pub fn view_pose(eye_relation: &Vec3, view_index: usize) -> Pose {
    let mut position = eye_relation / 2.0;
    if view_index == 0 {
        for c in position.iter_mut() {
            if *c > 0.0 {
                *c = -*c;
            }
        }
    }
    Pose::from_position(position)
}

/// State every driver embeds.
pub struct DeviceBase {
    pub name: DeviceName,
    pub device_type: DeviceType,
    /// Human readable name.
    pub str: String,
    pub serial: String,
    pub inputs: Vec<Input>,
    pub outputs: Vec<Output>,
    pub tracking_origin: Arc<TrackingOrigin>,
    pub hmd: Option<HmdParts>,
    pub distortion: Distortion,
    pub binding_profiles: &'static [BindingProfile],
    pub capabilities: DeviceCapabilities,
}

impl DeviceBase {
    pub fn new(
        name: DeviceName,
        device_type: DeviceType,
        str: impl Into<String>,
        inputs: &[InputName],
        outputs: &[OutputName],
        tracking_origin: Arc<TrackingOrigin>,
    ) -> Self {
        Self {
            name,
            device_type,
            str: str.into(),
            serial: String::new(),
            inputs: inputs.iter().map(|&n| Input::new(n)).collect(),
            outputs: outputs.iter().map(|&n| Output::new(n)).collect(),
            tracking_origin,
            hmd: None,
            distortion: Distortion::None,
            binding_profiles: &[],
            capabilities: DeviceCapabilities::empty(),
        }
    }

    pub fn has_input(&self, name: InputName) -> bool {
        self.inputs.iter().any(|i| i.name == name)
    }

    pub fn input_mut(&mut self, name: InputName) -> Option<&mut Input> {
        self.inputs.iter_mut().find(|i| i.name == name)
    }

    pub fn output_mut(&mut self, name: OutputName) -> Option<&mut Output> {
        self.outputs.iter_mut().find(|o| o.name == name)
    }
}

/// A tracked XR device: HMD, controller or generic tracker.
///
/// Calls come from the runtime and must not block on I/O; drivers read
/// hardware on their own threads.
pub trait Device: Send {
    fn base(&self) -> &DeviceBase;

    fn base_mut(&mut self) -> &mut DeviceBase;

    /// Copies the latest parsed state into the input slots.
    fn update_inputs(&mut self) -> Result<()>;

    fn get_tracked_pose(&mut self, name: InputName, at_timestamp_ns: i64) -> Result<SpaceRelation>;

    fn set_output(&mut self, name: OutputName, value: &OutputValue) -> Result<()> {
        let _ = (name, value);
        Err(XrError::UnknownOutput)
    }

    fn get_view_poses(
        &mut self,
        default_eye_relation: &Vec3,
        at_timestamp_ns: i64,
        view_count: usize,
    ) -> Result<ViewPoses> {
        let views = match &self.base().hmd {
            Some(hmd) => hmd.views,
            None => return Err(XrError::Unsupported("device has no views".into())),
        };
        let head = self.get_tracked_pose(InputName::GenericHeadPose, at_timestamp_ns)?;
        Ok(ViewPoses {
            head,
            fovs: (0..view_count).map(|i| views[i.min(1)].fov).collect(),
            poses: (0..view_count)
                .map(|i| view_pose(default_eye_relation, i))
                .collect(),
        })
    }

    fn compute_distortion(&self, view: usize, u: f32, v: f32) -> UvTriplet {
        self.base().distortion.compute(view, u, v)
    }

    /// Stops the device's threads and releases its resources. Calling it
    /// again does nothing.
    fn destroy(&mut self);

    fn name(&self) -> DeviceName {
        self.base().name
    }

    fn device_type(&self) -> DeviceType {
        self.base().device_type
    }

    fn inputs(&self) -> &[Input] {
        &self.base().inputs
    }

    fn outputs(&self) -> &[Output] {
        &self.base().outputs
    }

    fn tracking_origin(&self) -> &Arc<TrackingOrigin> {
        &self.base().tracking_origin
    }

    fn hmd(&self) -> Option<&HmdParts> {
        self.base().hmd.as_ref()
    }

    fn binding_profiles(&self) -> &'static [BindingProfile] {
        self.base().binding_profiles
    }

    fn capabilities(&self) -> DeviceCapabilities {
        self.base().capabilities
    }
}

/// Turns a stream of orientations into space relations, filling in
/// angular velocity by finite differences when the hardware has none.
#[derive(Debug, Clone)]
pub struct PoseTracker {
    last_relation: SpaceRelation,
    last_update_ns: i64,
    allow_finite_diff: bool,
    ll: LevelFilter,
}

impl PoseTracker {
    pub fn new(allow_finite_diff: bool, ll: LevelFilter) -> Self {
        Self {
            last_relation: SpaceRelation::zero(),
            last_update_ns: 0,
            allow_finite_diff,
            ll,
        }
    }

    pub fn last_relation(&self) -> &SpaceRelation {
        &self.last_relation
    }

    /// Builds the relation for a new pose sampled at `now_ns`.
    ///
    /// An orientation bit-identical to the previous one means no new data
    /// arrived, so the previous relation is returned as is.
    pub fn update(
        &mut self,
        now_ns: i64,
        pose: Pose,
        flags: RelationFlags,
        hw_angular_velocity: Option<Vec3>,
    ) -> SpaceRelation {
        let old = self.last_relation.pose.orientation;
        let same = old
            .coords
            .iter()
            .zip(pose.orientation.coords.iter())
            .all(|(a, b)| a.to_bits() == b.to_bits());
        if same && self.last_update_ns != 0 {
            ll_trace!(self.ll, "No new pose data");
            return self.last_relation;
        }

        let mut rel = SpaceRelation {
            pose,
            linear_velocity: Vec3::zeros(),
            angular_velocity: Vec3::zeros(),
            flags,
        };

        let mut ang_vel = hw_angular_velocity;
        if ang_vel.is_none() && self.allow_finite_diff {
            let dt = ns_to_s(now_ns - self.last_update_ns) as f32;
            if self.last_update_ns == 0 {
                ll_debug!(self.ll, "Will use finite differencing to estimate angular velocity");
            } else if dt > 0.0005 && dt < 1.0 {
                ang_vel = Some((pose.orientation * old.inverse()).scaled_axis() / dt);
            }
        }

        if let Some(w) = ang_vel {
            rel.angular_velocity = w;
            rel.flags |= RelationFlags::ANGULAR_VELOCITY_VALID;
        }

        self.last_update_ns = now_ns;
        self.last_relation = rel;
        rel
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Quat, TrackingType};

    #[test]
    fn test_view_pose_no_negative_zero() {
        let rel = Vec3::new(0.063, 0.0, 0.0);
        let left = view_pose(&rel, 0);
        let right = view_pose(&rel, 1);
        assert_eq!(left.position.x, -0.0315);
        assert_eq!(right.position.x, 0.0315);
        assert!(left.position.y.is_sign_positive());
        assert!(left.position.z.is_sign_positive());
    }

    #[test]
    fn test_side_by_side_mirrors_left_fov() {
        let fov = Fov {
            angle_left: -0.8,
            angle_right: 0.7,
            angle_up: 0.75,
            angle_down: -0.75,
        };
        let parts = HmdParts::side_by_side(1280, 720, 0.13, 0.07, 16_666_667, fov);
        assert_eq!(parts.views[1].fov, fov);
        assert_eq!(parts.views[0].fov.angle_left, -0.7);
        assert_eq!(parts.views[0].fov.angle_right, 0.8);
        assert_eq!(parts.views[1].viewport.x_pixels, 640);
    }

    fn orientation_flags() -> RelationFlags {
        RelationFlags::ORIENTATION_VALID | RelationFlags::ORIENTATION_TRACKED
    }

    #[test]
    fn test_pose_tracker_finite_difference() {
        let mut t = PoseTracker::new(true, LevelFilter::Off);
        let p0 = Pose::identity();
        let r0 = t.update(1_000_000, p0, orientation_flags(), None);
        assert!(!r0.flags.contains(RelationFlags::ANGULAR_VELOCITY_VALID));

        // 0.01 rad about Y over 10 ms is 1 rad/s.
        let p1 = Pose {
            orientation: Quat::from_axis_angle(&Vec3::y_axis(), 0.01),
            position: Vec3::zeros(),
        };
        let r1 = t.update(11_000_000, p1, orientation_flags(), None);
        assert!(r1.flags.contains(RelationFlags::ANGULAR_VELOCITY_VALID));
        assert!((r1.angular_velocity - Vec3::new(0.0, 1.0, 0.0)).norm() < 1e-3);
        assert!(!r1.flags.contains(RelationFlags::POSITION_TRACKED));

        // Same orientation again: previous relation, untouched.
        let r2 = t.update(12_000_000, p1, orientation_flags(), None);
        assert_eq!(r2, r1);
    }

    #[test]
    fn test_pose_tracker_disabled_or_stale() {
        let mut t = PoseTracker::new(false, LevelFilter::Off);
        t.update(1, Pose::identity(), orientation_flags(), None);
        let p = Pose {
            orientation: Quat::from_axis_angle(&Vec3::x_axis(), 0.1),
            position: Vec3::zeros(),
        };
        let r = t.update(10_000_000, p, orientation_flags(), None);
        assert!(!r.flags.contains(RelationFlags::ANGULAR_VELOCITY_VALID));

        let mut t = PoseTracker::new(true, LevelFilter::Off);
        t.update(1, Pose::identity(), orientation_flags(), None);
        // More than a second later.
        let r = t.update(2_000_000_000, p, orientation_flags(), None);
        assert!(!r.flags.contains(RelationFlags::ANGULAR_VELOCITY_VALID));

        // Hardware value wins.
        let hw = Vec3::new(1.0, 2.0, 3.0);
        let p2 = Pose {
            orientation: Quat::from_axis_angle(&Vec3::x_axis(), 0.2),
            position: Vec3::zeros(),
        };
        let r = t.update(2_010_000_000, p2, orientation_flags(), Some(hw));
        assert_eq!(r.angular_velocity, hw);
    }

    struct Dummy {
        base: DeviceBase,
    }

    impl Device for Dummy {
        fn base(&self) -> &DeviceBase {
            &self.base
        }
        fn base_mut(&mut self) -> &mut DeviceBase {
            &mut self.base
        }
        fn update_inputs(&mut self) -> Result<()> {
            Ok(())
        }
        fn get_tracked_pose(&mut self, name: InputName, _at: i64) -> Result<SpaceRelation> {
            if name != InputName::GenericHeadPose {
                return Err(XrError::UnknownInput);
            }
            Ok(SpaceRelation::zero())
        }
        fn destroy(&mut self) {}
    }

    #[test]
    fn test_default_view_poses() {
        let origin = Arc::new(TrackingOrigin::new("test", TrackingType::Other));
        let mut base = DeviceBase::new(
            DeviceName::GenericHmd,
            DeviceType::Hmd,
            "Dummy",
            &[InputName::GenericHeadPose],
            &[],
            origin,
        );
        let fov = Fov {
            angle_left: -0.5,
            angle_right: 0.5,
            angle_up: 0.5,
            angle_down: -0.5,
        };
        base.hmd = Some(HmdParts::side_by_side(100, 100, 0.1, 0.1, 1, fov));
        let mut dev = Dummy { base };

        let vp = dev
            .get_view_poses(&Vec3::new(0.06, 0.0, 0.0), 0, 2)
            .unwrap();
        assert_eq!(vp.fovs.len(), 2);
        assert_eq!(vp.poses[0].position.x, -0.03);
        assert_eq!(vp.poses[1].position.x, 0.03);
        assert!(dev.set_output(OutputName::SimpleVibration, &OutputValue::vibration(1.0)).is_err());
        assert_eq!(
            dev.compute_distortion(0, 0.1, 0.2),
            UvTriplet::splat(Vec2::new(0.1, 0.2))
        );
    }
}
