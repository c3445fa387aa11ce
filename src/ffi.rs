//! C ABI for the PS Move driver.
//!
//! Opaque handle-based API; the header is written to
//! `include/xrdrivers.h` by cbindgen.

use crate::config::DriverConfig;
use crate::device::Device;
use crate::error::LastError;
use crate::psmv::PsmvDevice;
use crate::types::{InputName, InputValue, OutputName, OutputValue, SpaceRelation, TrackingOrigin, TrackingType};
use crate::XrError;
use std::ffi::{c_char, c_int};
use std::sync::Arc;

static LAST_ERROR: LastError = LastError::new();

/// Opaque PS Move handle.
pub struct XrdPsmv(PsmvDevice);

/// Pose and velocities in C layout.
#[repr(C)]
pub struct XrdRelation {
    /// Meters.
    pub position: [f32; 3],
    /// Quaternion [x, y, z, w].
    pub orientation: [f32; 4],
    pub linear_velocity: [f32; 3],
    /// Radians per second, world frame.
    pub angular_velocity: [f32; 3],
    /// `RelationFlags` bits.
    pub flags: u32,
}

/// Button and trigger state after `xrd_psmv_update_inputs`.
#[repr(C)]
pub struct XrdPsmvInputs {
    /// One bit per `XRD_PSMV_BUTTON_*`.
    pub buttons: u32,
    /// 0..1.
    pub trigger: f32,
    pub timestamp_ns: i64,
}

pub const XRD_PSMV_BUTTON_PS: u32 = 1 << 0;
pub const XRD_PSMV_BUTTON_MOVE: u32 = 1 << 1;
pub const XRD_PSMV_BUTTON_START: u32 = 1 << 2;
pub const XRD_PSMV_BUTTON_SELECT: u32 = 1 << 3;
pub const XRD_PSMV_BUTTON_SQUARE: u32 = 1 << 4;
pub const XRD_PSMV_BUTTON_CROSS: u32 = 1 << 5;
pub const XRD_PSMV_BUTTON_CIRCLE: u32 = 1 << 6;
pub const XRD_PSMV_BUTTON_TRIANGLE: u32 = 1 << 7;

const BUTTON_BITS: &[(InputName, u32)] = &[
    (InputName::PsmvPsClick, XRD_PSMV_BUTTON_PS),
    (InputName::PsmvMoveClick, XRD_PSMV_BUTTON_MOVE),
    (InputName::PsmvStartClick, XRD_PSMV_BUTTON_START),
    (InputName::PsmvSelectClick, XRD_PSMV_BUTTON_SELECT),
    (InputName::PsmvSquareClick, XRD_PSMV_BUTTON_SQUARE),
    (InputName::PsmvCrossClick, XRD_PSMV_BUTTON_CROSS),
    (InputName::PsmvCircleClick, XRD_PSMV_BUTTON_CIRCLE),
    (InputName::PsmvTriangleClick, XRD_PSMV_BUTTON_TRIANGLE),
];

/// Pose selectors for `xrd_psmv_get_pose`.
pub const XRD_PSMV_POSE_BODY_CENTER: c_int = 0;
pub const XRD_PSMV_POSE_BALL_CENTER: c_int = 1;
pub const XRD_PSMV_POSE_BALL_TIP: c_int = 2;

fn pose_input(which: c_int) -> Option<InputName> {
    match which {
        XRD_PSMV_POSE_BODY_CENTER => Some(InputName::PsmvBodyCenterPose),
        XRD_PSMV_POSE_BALL_CENTER => Some(InputName::PsmvBallCenterPose),
        XRD_PSMV_POSE_BALL_TIP => Some(InputName::PsmvBallTipPose),
        _ => None,
    }
}

fn to_c(rel: &SpaceRelation) -> XrdRelation {
    let q = rel.pose.orientation.quaternion();
    let v = |v: &crate::types::Vec3| [v.x, v.y, v.z];
    XrdRelation {
        position: v(&rel.pose.position),
        orientation: [q.i, q.j, q.k, q.w],
        linear_velocity: v(&rel.linear_velocity),
        angular_velocity: v(&rel.angular_velocity),
        flags: rel.flags.bits(),
    }
}

fn collect_inputs(dev: &PsmvDevice) -> XrdPsmvInputs {
    let mut out = XrdPsmvInputs {
        buttons: 0,
        trigger: 0.0,
        timestamp_ns: 0,
    };
    for input in dev.inputs() {
        out.timestamp_ns = out.timestamp_ns.max(input.timestamp_ns);
        match input.value {
            InputValue::Boolean(true) => {
                if let Some(&(_, bit)) = BUTTON_BITS.iter().find(|(n, _)| *n == input.name) {
                    out.buttons |= bit;
                }
            }
            InputValue::Vec1(v) if input.name == InputName::PsmvTriggerValue => out.trigger = v,
            _ => {}
        }
    }
    out
}

fn fail(e: XrError) -> c_int {
    LAST_ERROR.set(&e);
    -1
}

/// Open the first PS Move paired over Bluetooth, reading configuration and
/// log levels from the environment.
/// Returns NULL on error (check xrd_last_error()).
#[no_mangle]
pub extern "C" fn xrd_psmv_open_first() -> *mut XrdPsmv {
    let config = DriverConfig::from_env();
    let origin = Arc::new(TrackingOrigin::new("PS Move", TrackingType::OrientationOnly));
    match PsmvDevice::open_first(origin, &config) {
        Ok(dev) => {
            LAST_ERROR.clear();
            Box::into_raw(Box::new(XrdPsmv(dev)))
        }
        Err(e) => {
            LAST_ERROR.set(&e);
            std::ptr::null_mut()
        }
    }
}

/// Stop the controller's worker and free it. The LED and rumble are
/// switched off.
///
/// # Safety
/// `dev` must be a pointer returned by `xrd_psmv_open_first`, or null.
#[no_mangle]
pub unsafe extern "C" fn xrd_psmv_destroy(dev: *mut XrdPsmv) {
    if !dev.is_null() {
        let mut dev = Box::from_raw(dev);
        dev.0.destroy();
    }
}

/// Latch the newest buttons and trigger into `out`.
/// Returns 0 on success, -1 on error.
///
/// # Safety
/// `dev` and `out` must be valid pointers, or null.
#[no_mangle]
pub unsafe extern "C" fn xrd_psmv_update_inputs(dev: *mut XrdPsmv, out: *mut XrdPsmvInputs) -> c_int {
    if dev.is_null() || out.is_null() {
        return fail(XrError::InvalidArgument("null pointer".into()));
    }
    let dev = &mut *dev;
    if let Err(e) = dev.0.update_inputs() {
        return fail(e);
    }
    out.write(collect_inputs(&dev.0));
    0
}

/// Pose of one of the `XRD_PSMV_POSE_*` points at `at_timestamp_ns`
/// (monotonic clock). Returns 0 on success, -1 on error.
///
/// # Safety
/// `dev` and `out` must be valid pointers, or null.
#[no_mangle]
pub unsafe extern "C" fn xrd_psmv_get_pose(
    dev: *mut XrdPsmv,
    which: c_int,
    at_timestamp_ns: i64,
    out: *mut XrdRelation,
) -> c_int {
    if dev.is_null() || out.is_null() {
        return fail(XrError::InvalidArgument("null pointer".into()));
    }
    let name = match pose_input(which) {
        Some(n) => n,
        None => return fail(XrError::UnknownInput),
    };
    let dev = &mut *dev;
    match dev.0.get_tracked_pose(name, at_timestamp_ns) {
        Ok(rel) => {
            out.write(to_c(&rel));
            0
        }
        Err(e) => fail(e),
    }
}

/// Rumble strength 0..1; sent by the controller worker.
/// Returns 0 on success, -1 on error.
///
/// # Safety
/// `dev` must be a valid pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn xrd_psmv_set_rumble(dev: *mut XrdPsmv, amplitude: f32) -> c_int {
    if dev.is_null() {
        return fail(XrError::InvalidArgument("null pointer".into()));
    }
    let dev = &mut *dev;
    match dev
        .0
        .set_output(OutputName::PsmvRumbleVibration, &OutputValue::vibration(amplitude))
    {
        Ok(()) => 0,
        Err(e) => fail(e),
    }
}

/// Ball colour; sent by the controller worker.
///
/// # Safety
/// `dev` must be a valid pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn xrd_psmv_set_led(dev: *mut XrdPsmv, r: u8, g: u8, b: u8) -> c_int {
    if dev.is_null() {
        return fail(XrError::InvalidArgument("null pointer".into()));
    }
    (*dev).0.set_led(r, g, b);
    0
}

/// Battery level as reported by the controller, 0..5, or 0xEE/0xEF while
/// charging.
///
/// # Safety
/// `dev` must be a valid pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn xrd_psmv_battery(dev: *const XrdPsmv) -> u8 {
    if dev.is_null() {
        return 0;
    }
    (*dev).0.battery()
}

/// Get the last error message. Returns NULL if no error.
/// The returned pointer is valid until the next failing call.
#[no_mangle]
pub extern "C" fn xrd_last_error() -> *const c_char {
    LAST_ERROR.as_ptr()
}
