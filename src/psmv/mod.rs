//! PlayStation Move controller driver.
//!
//! The controller is only handled over Bluetooth. A worker thread reads
//! input reports, runs them through the factory calibration into 3-DoF
//! fusion, and keeps the LED and rumble motor fed. The runtime side only
//! touches the shared state under its mutex and never does I/O.

pub mod calibration;
pub mod protocol;

use crate::binding::PSMV_BINDINGS;
use crate::config::DriverConfig;
use crate::device::{Device, DeviceBase, DeviceCapabilities, PoseTracker};
use crate::hid::{create_hid_api, HidIo};
use crate::imu::{GravityWindow, Imu3Dof, ImuPrefilter};
use crate::thread::{lock, RunFlag, ThreadHelper};
use crate::time::{monotonic_ns, NS_PER_SEC};
use crate::types::{
    DeviceName, DeviceType, InputName, InputValue, OutputName, OutputValue, Pose, RelationFlags,
    SpaceRelation, TrackingOrigin, Vec3,
};
use crate::{Result, XrError};
use calibration::read_calibration;
use hidapi::{BusType, HidApi};
use log::LevelFilter;
use protocol::{
    clamp_zero_to_one_float_to_u8, led_packet, timestamp_delta, Buttons, LedRumble, LedState,
    ParsedInput, Revision, SeqTracker, VID,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub use calibration::Calibration;

const READ_TIMEOUT_MS: i32 = 1000;
const HUNG_AFTER_NS: i64 = 3 * NS_PER_SEC;
const MAX_CONSECUTIVE_ERRORS: u32 = 10;

/// Ball tip relative to the ball center, controller frame.
const BALL_TIP_OFFSET: Vec3 = Vec3::new(0.0, 0.022, 0.0);
/// Handle center relative to the ball center, controller frame.
const BODY_CENTER_OFFSET: Vec3 = Vec3::new(0.0, -0.09, 0.0);

/// Measurement noise of the two IMU revisions, for external filters.
pub const ACCEL_VARIANCE: [f32; 3] = [4.6343013089e-4, 3.58375519793e-4, 3.58375519793e-4];
pub const GYRO_VARIANCE: [f32; 3] = [7.85920759635965e-5, 7.85920759635965e-5, 5.1253981244e-4];

const INPUTS: &[InputName] = &[
    InputName::PsmvPsClick,
    InputName::PsmvMoveClick,
    InputName::PsmvStartClick,
    InputName::PsmvSelectClick,
    InputName::PsmvSquareClick,
    InputName::PsmvCrossClick,
    InputName::PsmvCircleClick,
    InputName::PsmvTriangleClick,
    InputName::PsmvTriggerValue,
    InputName::PsmvBodyCenterPose,
    InputName::PsmvBallCenterPose,
    InputName::PsmvBallTipPose,
];

const CLICKS: &[(InputName, Buttons)] = &[
    (InputName::PsmvPsClick, Buttons::PS),
    (InputName::PsmvMoveClick, Buttons::MOVE_ANY),
    (InputName::PsmvStartClick, Buttons::START),
    (InputName::PsmvSelectClick, Buttons::SELECT),
    (InputName::PsmvSquareClick, Buttons::SQUARE),
    (InputName::PsmvCrossClick, Buttons::CROSS),
    (InputName::PsmvCircleClick, Buttons::CIRCLE),
    (InputName::PsmvTriangleClick, Buttons::TRIANGLE),
];

/// Red, magenta, blue; handed out in turn so two controllers differ.
const DEFAULT_COLORS: [[u8; 3]; 3] = [[0xff, 0x00, 0x00], [0xff, 0x00, 0xff], [0x00, 0x00, 0xff]];
static NEXT_COLOR: AtomicUsize = AtomicUsize::new(0);

fn next_default_color() -> [u8; 3] {
    let i = NEXT_COLOR.fetch_add(1, Ordering::Relaxed);
    DEFAULT_COLORS[i % DEFAULT_COLORS.len()]
}

/// Whether `info` is a PS Move this driver can open.
pub fn is_psmv(info: &hidapi::DeviceInfo) -> bool {
    info.vendor_id() == VID && Revision::from_pid(info.product_id()).is_some()
}

/// Everything the worker and the runtime share.
#[derive(Debug)]
struct PsmvState {
    last: ParsedInput,
    fusion: Imu3Dof,
    led: LedState,
    seq: SeqTracker,
    /// Cleared when reads fail persistently; poses then report lost tracking.
    running: bool,
}

/// An opened PS Move.
pub struct PsmvDevice {
    base: DeviceBase,
    revision: Revision,
    hid: Arc<Mutex<Box<dyn HidIo>>>,
    state: Arc<Mutex<PsmvState>>,
    tracker: PoseTracker,
    oth: ThreadHelper,
    destroyed: bool,
    ll: LevelFilter,
}

impl PsmvDevice {
    /// Opens the first Bluetooth-attached controller.
    pub fn open_first(origin: Arc<TrackingOrigin>, config: &DriverConfig) -> Result<PsmvDevice> {
        let api = create_hid_api()?;
        let info = api
            .device_list()
            .find(|d| is_psmv(d) && matches!(d.bus_type(), BusType::Bluetooth))
            .ok_or(XrError::DeviceNotFound)?;
        Self::open_info(&api, info, origin, config)
    }

    /// Opens the controller behind `info`. Controllers that are not PS
    /// Moves or are plugged in over USB give [`XrError::NotHandled`].
    pub fn open_info(
        api: &HidApi,
        info: &hidapi::DeviceInfo,
        origin: Arc<TrackingOrigin>,
        config: &DriverConfig,
    ) -> Result<PsmvDevice> {
        let ll = config.log.psmv;

        if info.vendor_id() != VID {
            return Err(XrError::NotHandled);
        }
        let revision = match Revision::from_pid(info.product_id()) {
            Some(r) => r,
            None => {
                ll_debug!(ll, "Unknown PS Move product id {:04x}", info.product_id());
                return Err(XrError::NotHandled);
            }
        };
        if !matches!(info.bus_type(), BusType::Bluetooth) {
            ll_info!(ll, "Ignoring PS Move on {:?}, only Bluetooth is handled", info.bus_type());
            return Err(XrError::NotHandled);
        }

        let device = api.open_path(info.path())?;
        let serial = info.serial_number().unwrap_or("").to_string();
        Self::create(Box::new(device), revision, &serial, origin, config)
    }

    /// Reads the calibration and starts the worker. Any failure before the
    /// worker runs drops the handle and leaks nothing.
    pub fn create(
        hid: Box<dyn HidIo>,
        revision: Revision,
        serial: &str,
        origin: Arc<TrackingOrigin>,
        config: &DriverConfig,
    ) -> Result<PsmvDevice> {
        let ll = config.log.psmv;

        let calibration = read_calibration(&*hid, revision, ll)?;
        let prefilter = calibration.prefilter()?;
        ll_debug!(
            ll,
            "Prefilter: accel gain {:?} bias {:?}, gyro gain {:?} bias {:?}",
            prefilter.accel_gain,
            prefilter.accel_bias,
            prefilter.gyro_gain,
            prefilter.gyro_bias
        );
        ll_debug!(ll, "Variance: accel {:?} gyro {:?}", ACCEL_VARIANCE, GYRO_VARIANCE);

        let [r, g, b] = config.file.psmv.led_color.unwrap_or_else(next_default_color);

        let mut base = DeviceBase::new(
            DeviceName::PsMove,
            DeviceType::AnyHandController,
            "PS Move Controller",
            INPUTS,
            &[OutputName::PsmvRumbleVibration],
            origin,
        );
        base.serial = serial.to_string();
        base.binding_profiles = PSMV_BINDINGS;
        base.capabilities = DeviceCapabilities::ORIENTATION_TRACKING
            | DeviceCapabilities::ANGULAR_VELOCITY
            | DeviceCapabilities::FORCE_FEEDBACK;

        let state = Arc::new(Mutex::new(PsmvState {
            last: ParsedInput::default(),
            fusion: Imu3Dof::new(GravityWindow::Slow, ll),
            led: LedState::new(LedRumble { r, g, b, rumble: 0 }),
            seq: SeqTracker::new(),
            running: true,
        }));
        let hid = Arc::new(Mutex::new(hid));

        let worker = Worker {
            hid: hid.clone(),
            state: state.clone(),
            revision,
            prefilter,
            ll,
        };
        let mut oth = ThreadHelper::new();
        oth.start(&format!("psmv-{}", serial), move |flag| worker.run(flag))?;

        ll_info!(ll, "Opened PS Move {:?} '{}'", revision, serial);

        Ok(PsmvDevice {
            base,
            revision,
            hid,
            state,
            tracker: PoseTracker::new(config.allow_finite_diff, ll),
            oth,
            destroyed: false,
            ll,
        })
    }

    pub fn revision(&self) -> Revision {
        self.revision
    }

    /// Sets the ball colour; the worker sends it on its next iteration.
    pub fn set_led(&self, r: u8, g: u8, b: u8) {
        let mut state = lock(&self.state);
        state.led.wants.r = r;
        state.led.wants.g = g;
        state.led.wants.b = b;
    }

    pub fn missed_packets(&self) -> u64 {
        lock(&self.state).seq.missed()
    }

    /// False once reads have failed persistently.
    pub fn is_running(&self) -> bool {
        lock(&self.state).running
    }

    pub fn battery(&self) -> u8 {
        lock(&self.state).last.battery
    }
}

impl Device for PsmvDevice {
    fn base(&self) -> &DeviceBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut DeviceBase {
        &mut self.base
    }

    fn update_inputs(&mut self) -> Result<()> {
        let now = monotonic_ns();
        let last = lock(&self.state).last.clone();

        for &(name, bits) in CLICKS {
            if let Some(input) = self.base.input_mut(name) {
                input.set(now, InputValue::Boolean(last.pressed(bits)));
            }
        }
        if let Some(input) = self.base.input_mut(InputName::PsmvTriggerValue) {
            input.set(now, InputValue::Vec1(last.trigger as f32 / 255.0));
        }
        Ok(())
    }

    fn get_tracked_pose(&mut self, name: InputName, _at_timestamp_ns: i64) -> Result<SpaceRelation> {
        let offset = match name {
            InputName::PsmvBallCenterPose => Vec3::zeros(),
            InputName::PsmvBallTipPose => BALL_TIP_OFFSET,
            InputName::PsmvBodyCenterPose => BODY_CENTER_OFFSET,
            _ => {
                ll_error!(self.ll, "Unknown input name {:?}", name);
                return Err(XrError::UnknownInput);
            }
        };

        let (running, rot, gyro) = {
            let state = lock(&self.state);
            (state.running, state.fusion.rot, state.fusion.angular_velocity())
        };
        if !running {
            return Ok(SpaceRelation::zero());
        }

        // Only a prediction from "now" is available.
        let flags = RelationFlags::ORIENTATION_VALID | RelationFlags::ORIENTATION_TRACKED;
        let pose = Pose {
            orientation: rot,
            position: Vec3::zeros(),
        };
        let mut rel = self.tracker.update(monotonic_ns(), pose, flags, Some(rot * gyro));
        rel.pose.position = rel.pose.orientation * offset;
        Ok(rel)
    }

    fn set_output(&mut self, name: OutputName, value: &OutputValue) -> Result<()> {
        if name != OutputName::PsmvRumbleVibration {
            ll_error!(self.ll, "Unknown output name {:?}", name);
            return Err(XrError::UnknownOutput);
        }
        let OutputValue::Vibration { amplitude, .. } = *value;

        lock(&self.state).led.wants.rumble = clamp_zero_to_one_float_to_u8(amplitude);
        if let Some(output) = self.base.output_mut(name) {
            output.value = Some(*value);
        }
        Ok(())
    }

    fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;

        // Joins within one read timeout.
        self.oth.stop();

        let hid = lock(&self.hid);
        if let Err(e) = hid.write(&led_packet(0, 0, 0, 0)) {
            ll_warn!(self.ll, "Failed to turn off LED: {}", e);
        }
        ll_debug!(self.ll, "Destroyed PS Move '{}'", self.base.serial);
    }
}

impl Drop for PsmvDevice {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Whether the device has been quiet for too long since its last report.
fn is_hung(last_report_ns: i64, now_ns: i64) -> bool {
    now_ns - last_report_ns > HUNG_AFTER_NS
}

struct Worker {
    hid: Arc<Mutex<Box<dyn HidIo>>>,
    state: Arc<Mutex<PsmvState>>,
    revision: Revision,
    prefilter: ImuPrefilter,
    ll: LevelFilter,
}

impl Worker {
    fn run(self, flag: RunFlag) {
        let hid = lock(&self.hid);
        let mut buf = [0u8; 256];

        // Empty whatever queued up before we started.
        while let Ok(n) = hid.read(&mut buf) {
            if n == 0 {
                break;
            }
        }

        let mut synced = false;
        // Time of the last report, or of starting to listen.
        let mut then_ns = monotonic_ns();
        let mut last_timestamp: Option<u16> = None;
        let mut hung_reported = false;
        let mut errors = 0u32;

        while flag.is_running() {
            let ret = hid.read_timeout(&mut buf, READ_TIMEOUT_MS);
            let now_ns = monotonic_ns();

            match ret {
                Ok(0) => {
                    ll_trace!(self.ll, "Read timeout");
                    if !hung_reported && is_hung(then_ns, now_ns) {
                        ll_error!(self.ll, "No data for over {} s, device hung?", HUNG_AFTER_NS / NS_PER_SEC);
                        hung_reported = true;
                    }
                }
                Ok(n) => {
                    errors = 0;
                    hung_reported = false;

                    if synced {
                        self.handle_packet(&buf[..n], now_ns, now_ns - then_ns, &mut last_timestamp);
                    } else {
                        // The first report only anchors the clock.
                        synced = true;
                    }
                    then_ns = now_ns;
                }
                Err(e) => {
                    errors += 1;
                    ll_error!(self.ll, "Failed to read device: {}", e);
                    if errors >= MAX_CONSECUTIVE_ERRORS {
                        ll_error!(self.ll, "{} read errors in a row, giving up", errors);
                        lock(&self.state).running = false;
                        break;
                    }
                }
            }

            let packet = lock(&self.state).led.update(now_ns);
            if let Some(packet) = packet {
                if let Err(e) = hid.write(&packet) {
                    ll_warn!(self.ll, "Failed to send LED packet: {}", e);
                }
            }
        }

        ll_debug!(self.ll, "Worker exiting");
    }

    fn handle_packet(&self, data: &[u8], now_ns: i64, delta_ns: i64, last_timestamp: &mut Option<u16>) {
        let input = match ParsedInput::parse(self.revision, data) {
            Some(input) => input,
            None => {
                ll_warn!(self.ll, "Short input report: {} bytes", data.len());
                return;
            }
        };

        let diff = last_timestamp.map_or(0, |last| timestamp_delta(input.timestamp, last));
        *last_timestamp = Some(input.timestamp);

        let mut state = lock(&self.state);

        if state.seq.check(input.seq_no) {
            ll_trace!(self.ll, "Missed packet(s) before seq {:x}", input.seq_no);
        }
        ll_trace!(
            self.ll,
            "buttons {:08x} trigger {:02x} timestamp {:04x} diff {} seq {:x}",
            input.buttons.bits(),
            input.trigger,
            input.timestamp,
            diff,
            input.seq_no
        );

        // Sub-samples are spread evenly over the time since the last report.
        let count = input.samples.len() as i64;
        for (i, sample) in input.samples.iter().enumerate() {
            let ts = now_ns - delta_ns * (count - 1 - i as i64) / count;
            let accel = self.prefilter.accel(&sample.accel);
            let gyro = self.prefilter.gyro(&sample.gyro);
            state.fusion.update(ts, &accel, &gyro);
        }

        state.last = input;
    }
}
