//! Per-camera fixups: mode-descriptor rewrites and control wants.

use super::Descriptor;
use crate::frame::StereoFormat;
use crate::frameserver::CaptureType;
use std::io;
use v4l::v4l_sys::{
    V4L2_CID_AUTO_WHITE_BALANCE, V4L2_CID_EXPOSURE_ABSOLUTE, V4L2_CID_EXPOSURE_AUTO, V4L2_CID_GAIN,
    V4L2_CID_WHITE_BALANCE_TEMPERATURE,
};

/// Index into [`Want`] pairs.
fn slot(capture_type: CaptureType) -> usize {
    capture_type as usize
}

/// One wanted control value; inactive wants leave the control alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Want {
    pub active: bool,
    pub value: i32,
}

impl Want {
    pub const fn set(value: i32) -> Self {
        Self {
            active: true,
            value,
        }
    }

    pub const NONE: Want = Want {
        active: false,
        value: 0,
    };
}

/// Control access, split out so the diffing logic runs without a device.
pub trait ControlIo {
    fn get_control(&self, id: u32) -> io::Result<i32>;
    fn set_control(&self, id: u32, value: i32) -> io::Result<()>;
}

/// A control the driver keeps at a wanted value per capture type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlState {
    pub id: u32,
    pub name: &'static str,
    /// Indexed by [`CaptureType`].
    pub want: [Want; 2],
    /// Writes left that happen even if the value already matches.
    pub force: i32,
    /// Last value read back from the device.
    pub value: i32,
}

impl ControlState {
    pub fn new(id: u32, name: &'static str, calibration: Want, tracking: Want) -> Self {
        Self {
            id,
            name,
            want: [calibration, tracking],
            force: 2,
            value: 0,
        }
    }

    /// Brings the control to its wanted value, returns whether it wrote.
    pub fn apply<C: ControlIo + ?Sized>(&mut self, io: &C, capture_type: CaptureType) -> io::Result<bool> {
        let want = self.want[slot(capture_type)];
        if !want.active {
            return Ok(false);
        }

        self.value = io.get_control(self.id)?;
        if self.value == want.value && self.force <= 0 {
            return Ok(false);
        }

        io.set_control(self.id, want.value)?;
        self.value = want.value;
        if self.force > 0 {
            self.force -= 1;
        }
        Ok(true)
    }
}

/// How a known camera differs from a plain UVC device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuirkKind {
    Ps4Camera,
    ThreeDUsbCamera,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quirk {
    pub vid: Option<u16>,
    pub pid: Option<u16>,
    pub card: &'static str,
    pub kind: QuirkKind,
}

pub const QUIRKS: &[Quirk] = &[
    Quirk {
        vid: Some(0x05a9),
        pid: Some(0x058a),
        card: "USB Camera-OV580: USB Camera-OV",
        kind: QuirkKind::Ps4Camera,
    },
    Quirk {
        vid: None,
        pid: None,
        card: "3D USB Camera: 3D USB Camera",
        kind: QuirkKind::ThreeDUsbCamera,
    },
];

/// Matches on the card name; vid/pid must also agree when both the entry
/// and the device know them.
pub fn find(vid_pid: Option<(u16, u16)>, card: &str) -> Option<QuirkKind> {
    QUIRKS
        .iter()
        .find(|q| {
            if q.card != card {
                return false;
            }
            match (q.vid.zip(q.pid), vid_pid) {
                (Some(want), Some(got)) => want == got,
                _ => true,
            }
        })
        .map(|q| q.kind)
}

// The PS4 camera prepends a 96 byte header to every row's image data.
const PS4_ROW_OFFSET: usize = 32 + 64;

impl QuirkKind {
    /// Rewrites a freshly enumerated descriptor for this camera.
    pub fn fixup_descriptor(self, desc: &mut Descriptor) {
        match self {
            QuirkKind::Ps4Camera => {
                let (w, h) = match desc.stream_width {
                    3448 => (1280, 800),
                    1748 => (640, 400),
                    898 => (320, 192),
                    _ => return,
                };
                desc.offset = PS4_ROW_OFFSET;
                desc.mode.width = w * 2;
                desc.mode.height = h;
                desc.mode.stereo_format = StereoFormat::SideBySide;
            }
            QuirkKind::ThreeDUsbCamera => {
                desc.mode.stereo_format = StereoFormat::SideBySide;
            }
        }
    }

    /// Controls to hold for this camera.
    pub fn controls(self, exposure_absolute: i32) -> Vec<ControlState> {
        match self {
            QuirkKind::Ps4Camera => vec![
                ControlState::new(V4L2_CID_GAIN, "gain", Want::set(0), Want::NONE),
                ControlState::new(
                    V4L2_CID_AUTO_WHITE_BALANCE,
                    "auto_white_balance",
                    Want::set(0),
                    Want::set(1),
                ),
                ControlState::new(
                    V4L2_CID_WHITE_BALANCE_TEMPERATURE,
                    "white_balance_temperature",
                    Want::set(3900),
                    Want::NONE,
                ),
                ControlState::new(V4L2_CID_EXPOSURE_AUTO, "exposure_auto", Want::set(2), Want::set(0)),
                ControlState::new(
                    V4L2_CID_EXPOSURE_ABSOLUTE,
                    "exposure_absolute",
                    Want::set(exposure_absolute),
                    Want::NONE,
                ),
            ],
            QuirkKind::ThreeDUsbCamera => vec![
                ControlState::new(
                    V4L2_CID_AUTO_WHITE_BALANCE,
                    "auto_white_balance",
                    Want::set(0),
                    Want::set(1),
                ),
                ControlState::new(
                    V4L2_CID_WHITE_BALANCE_TEMPERATURE,
                    "white_balance_temperature",
                    Want::set(6500),
                    Want::NONE,
                ),
                ControlState::new(V4L2_CID_EXPOSURE_AUTO, "exposure_auto", Want::set(1), Want::set(3)),
                ControlState::new(V4L2_CID_EXPOSURE_ABSOLUTE, "exposure_absolute", Want::set(10), Want::NONE),
            ],
        }
    }
}
