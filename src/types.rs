use nalgebra::{UnitQuaternion, Vector2, Vector3};

pub type Vec2 = Vector2<f32>;
pub type Vec3 = Vector3<f32>;
pub type Quat = UnitQuaternion<f32>;

/// Rigid transform: orientation followed by translation, in meters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    pub orientation: Quat,
    pub position: Vec3,
}

impl Pose {
    pub fn identity() -> Self {
        Self {
            orientation: Quat::identity(),
            position: Vec3::zeros(),
        }
    }

    pub fn from_position(position: Vec3) -> Self {
        Self {
            orientation: Quat::identity(),
            position,
        }
    }

    /// `self ∘ inner`: applies `inner` in the frame of `self`.
    pub fn transform(&self, inner: &Pose) -> Pose {
        Pose {
            orientation: self.orientation * inner.orientation,
            position: self.position + self.orientation * inner.position,
        }
    }
}

impl Default for Pose {
    fn default() -> Self {
        Self::identity()
    }
}

bitflags::bitflags! {
    /// Which fields of a [`SpaceRelation`] carry data.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    #[repr(C)]
    pub struct RelationFlags: u32 {
        const ORIENTATION_VALID      = 1 << 0;
        const POSITION_VALID         = 1 << 1;
        const LINEAR_VELOCITY_VALID  = 1 << 2;
        const ANGULAR_VELOCITY_VALID = 1 << 3;
        const ORIENTATION_TRACKED    = 1 << 4;
        const POSITION_TRACKED       = 1 << 5;
    }
}

/// Pose plus velocities, with flags telling which parts are usable.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpaceRelation {
    pub pose: Pose,
    pub linear_velocity: Vec3,
    pub angular_velocity: Vec3,
    pub flags: RelationFlags,
}

impl SpaceRelation {
    /// Identity pose with no valid bits, i.e. lost tracking.
    pub fn zero() -> Self {
        Self {
            pose: Pose::identity(),
            linear_velocity: Vec3::zeros(),
            angular_velocity: Vec3::zeros(),
            flags: RelationFlags::empty(),
        }
    }

    pub fn orientation_is_normalized(&self) -> bool {
        let norm = self.pose.orientation.quaternion().norm();
        (norm - 1.0).abs() <= 1e-4
    }
}

impl Default for SpaceRelation {
    fn default() -> Self {
        Self::zero()
    }
}

/// One calibrated IMU reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImuSample {
    pub timestamp_ns: i64,
    pub accel_m_s2: Vector3<f64>,
    pub gyro_rad_secs: Vector3<f64>,
}

/// Per-view field of view, angles in radians.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Fov {
    pub angle_left: f32,
    pub angle_right: f32,
    pub angle_up: f32,
    pub angle_down: f32,
}

/// Distorted texture coordinates for each colour channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UvTriplet {
    pub r: Vec2,
    pub g: Vec2,
    pub b: Vec2,
}

impl UvTriplet {
    pub fn splat(uv: Vec2) -> Self {
        Self { r: uv, g: uv, b: uv }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceType {
    Hmd,
    LeftHandController,
    RightHandController,
    AnyHandController,
    GenericTracker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceName {
    GenericHmd,
    PsMove,
    AndroidSensors,
    RealSense,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackingType {
    None,
    OrientationOnly,
    ExternalSlam,
    Other,
}

/// World anchor shared by all devices of one physical rig.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackingOrigin {
    pub name: String,
    pub origin_type: TrackingType,
    pub offset: Pose,
}

impl TrackingOrigin {
    pub fn new(name: impl Into<String>, origin_type: TrackingType) -> Self {
        Self {
            name: name.into(),
            origin_type,
            offset: Pose::identity(),
        }
    }
}

/// Kind of value an input slot holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputType {
    Boolean,
    Vec1ZeroToOne,
    Vec2MinusOneToOne,
    Pose,
}

/// Semantic input names, both native device inputs and profile inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(C)]
pub enum InputName {
    GenericHeadPose,
    GenericTrackerPose,

    PsmvPsClick,
    PsmvMoveClick,
    PsmvStartClick,
    PsmvSelectClick,
    PsmvSquareClick,
    PsmvCrossClick,
    PsmvCircleClick,
    PsmvTriangleClick,
    PsmvTriggerValue,
    PsmvBodyCenterPose,
    PsmvBallCenterPose,
    PsmvBallTipPose,

    SimpleSelectClick,
    SimpleMenuClick,
    SimpleGripPose,
    SimpleAimPose,

    IndexSystemClick,
    IndexAClick,
    IndexBClick,
    IndexTriggerValue,
    IndexGripPose,
    IndexAimPose,
}

impl InputName {
    pub fn input_type(self) -> InputType {
        use InputName::*;
        match self {
            GenericHeadPose | GenericTrackerPose | PsmvBodyCenterPose | PsmvBallCenterPose
            | PsmvBallTipPose | SimpleGripPose | SimpleAimPose | IndexGripPose | IndexAimPose => {
                InputType::Pose
            }
            PsmvTriggerValue | IndexTriggerValue => InputType::Vec1ZeroToOne,
            _ => InputType::Boolean,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InputValue {
    Boolean(bool),
    Vec1(f32),
    Vec2(Vec2),
    /// Pose inputs carry no value; query them with `get_tracked_pose`.
    Pose,
}

impl InputValue {
    fn default_for(ty: InputType) -> Self {
        match ty {
            InputType::Boolean => InputValue::Boolean(false),
            InputType::Vec1ZeroToOne => InputValue::Vec1(0.0),
            InputType::Vec2MinusOneToOne => InputValue::Vec2(Vec2::zeros()),
            InputType::Pose => InputValue::Pose,
        }
    }
}

/// One input slot on a device.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Input {
    pub name: InputName,
    pub active: bool,
    pub timestamp_ns: i64,
    pub value: InputValue,
}

impl Input {
    pub fn new(name: InputName) -> Self {
        Self {
            name,
            active: true,
            timestamp_ns: 0,
            value: InputValue::default_for(name.input_type()),
        }
    }

    /// Stores a new value. The slot timestamp never moves backwards.
    pub fn set(&mut self, timestamp_ns: i64, value: InputValue) {
        self.timestamp_ns = self.timestamp_ns.max(timestamp_ns);
        self.value = value;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(C)]
pub enum OutputName {
    PsmvRumbleVibration,
    SimpleVibration,
    IndexHaptic,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OutputValue {
    Vibration {
        frequency: f32,
        amplitude: f32,
        duration_ns: i64,
    },
}

impl OutputValue {
    pub fn vibration(amplitude: f32) -> Self {
        OutputValue::Vibration {
            frequency: 0.0,
            amplitude,
            duration_ns: 0,
        }
    }
}

/// One output slot on a device.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Output {
    pub name: OutputName,
    pub value: Option<OutputValue>,
}

impl Output {
    pub fn new(name: OutputName) -> Self {
        Self { name, value: None }
    }
}
