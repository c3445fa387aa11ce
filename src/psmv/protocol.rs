//! PS Move wire format: input reports, button bits and the LED/rumble
//! output report.

use super::calibration::{vec3_i16_wire, vec3_u16_wire};
use crate::imu::prefilter::RawVec3;
use crate::time::NS_PER_SEC;

// -- USB identifiers --
pub const VID: u16 = 0x054c;
pub const PID_ZCM1: u16 = 0x03d5;
pub const PID_ZCM2: u16 = 0x0c5e;

// -- Packet geometry --
pub const INPUT_SIZE: usize = 49;
pub const LED_REPORT_ID: u8 = 0x06;
pub const LED_PACKET_SIZE: usize = 49;

/// Interval at which the LED/rumble state is resent even when unchanged.
pub const RESEND_INTERVAL_NS: i64 = NS_PER_SEC;

/// Hardware revision of the controller, picked from the product id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Revision {
    /// CECH-ZCM1, the original controller.
    Zcm1,
    /// CECH-ZCM2, the 2013 revision with a different IMU.
    Zcm2,
}

impl Revision {
    pub fn from_pid(pid: u16) -> Option<Revision> {
        match pid {
            PID_ZCM1 => Some(Revision::Zcm1),
            PID_ZCM2 => Some(Revision::Zcm2),
            _ => None,
        }
    }

    pub fn pid(self) -> u16 {
        match self {
            Revision::Zcm1 => PID_ZCM1,
            Revision::Zcm2 => PID_ZCM2,
        }
    }
}

bitflags::bitflags! {
    /// Button bits after packing the four wire bytes big-endian.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Buttons: u32 {
        const MOVE_F2    = 1 << 6;
        const TRIGGER_F2 = 1 << 7;
        const PS         = 1 << 8;
        const MOVE_F1    = 1 << 11;
        const TRIGGER_F1 = 1 << 12;
        const TRIANGLE   = 1 << 20;
        const CIRCLE     = 1 << 21;
        const CROSS      = 1 << 22;
        const SQUARE     = 1 << 23;
        const SELECT     = 1 << 24;
        const START      = 1 << 27;

        const MOVE_ANY    = Self::MOVE_F1.bits() | Self::MOVE_F2.bits();
        const TRIGGER_ANY = Self::TRIGGER_F1.bits() | Self::TRIGGER_F2.bits();

        // Bits we don't name but the device sets.
        const _ = !0;
    }
}

/// One raw accelerometer and gyro reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ParsedSample {
    pub accel: RawVec3,
    pub gyro: RawVec3,
}

/// An input report decoded for either revision.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ParsedInput {
    pub buttons: Buttons,
    pub timestamp: u16,
    pub battery: u8,
    /// 4-bit counter, increments by one per report.
    pub seq_no: u8,
    /// Trigger of the latest sample.
    pub trigger: u8,
    /// The earlier ZCM1 half-frame trigger, or the ZCM2 low-pass value.
    pub trigger_aux: u8,
    /// One sample for ZCM2, two for ZCM1 (oldest first).
    pub samples: Vec<ParsedSample>,
}

fn common(data: &[u8]) -> (Buttons, u8) {
    let b = &data[1..5];
    let bits = (b[0] as u32) << 24 | (b[1] as u32) << 16 | (b[2] as u32) << 8 | (b[3] & 0xf0) as u32;
    (Buttons::from_bits_retain(bits), b[3] & 0x0f)
}

impl ParsedInput {
    /// Decodes an input report. Returns `None` for short reports.
    pub fn parse(revision: Revision, data: &[u8]) -> Option<ParsedInput> {
        if data.len() < INPUT_SIZE {
            return None;
        }
        let (buttons, seq_no) = common(data);

        let input = match revision {
            Revision::Zcm1 => ParsedInput {
                buttons,
                timestamp: u16::from_le_bytes([data[43], data[11]]),
                battery: data[12],
                seq_no,
                trigger: data[6],
                trigger_aux: data[5],
                samples: vec![
                    ParsedSample {
                        accel: vec3_u16_wire(data, 13),
                        gyro: vec3_u16_wire(data, 25),
                    },
                    ParsedSample {
                        accel: vec3_u16_wire(data, 19),
                        gyro: vec3_u16_wire(data, 31),
                    },
                ],
            },
            Revision::Zcm2 => ParsedInput {
                buttons,
                timestamp: u16::from_le_bytes([data[39], data[40]]),
                battery: data[12],
                seq_no,
                trigger: data[5],
                trigger_aux: data[6],
                samples: vec![ParsedSample {
                    accel: vec3_i16_wire(data, 13),
                    gyro: vec3_i16_wire(data, 25),
                }],
            },
        };
        Some(input)
    }

    pub fn pressed(&self, bits: Buttons) -> bool {
        self.buttons.intersects(bits)
    }
}

/// Ticks between two 16-bit device timestamps, assuming at most one wrap.
pub fn timestamp_delta(new: u16, last: u16) -> u32 {
    let mut n = new as u32;
    if new < last {
        n += 0x10000;
    }
    n - last as u32
}

/// Tracks the 4-bit report counter and counts gaps.
#[derive(Debug, Clone, Default)]
pub struct SeqTracker {
    last: Option<u8>,
    missed: u64,
}

impl SeqTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `seq_no`; returns true if at least one report was skipped.
    pub fn check(&mut self, seq_no: u8) -> bool {
        let missed = match self.last {
            Some(last) => seq_no != (last + 1) & 0x0f,
            None => false,
        };
        if missed {
            self.missed += 1;
        }
        self.last = Some(seq_no & 0x0f);
        missed
    }

    pub fn missed(&self) -> u64 {
        self.missed
    }
}

/// Maps `[0, 1]` onto `0..=255`, saturating outside that range.
pub fn clamp_zero_to_one_float_to_u8(v: f32) -> u8 {
    let scaled = v * 255.0;
    if scaled >= 255.0 {
        255
    } else if scaled >= 0.0 {
        scaled as u8
    } else {
        0
    }
}

/// `{0x06, 0, r, g, b, 0, rumble, padding}`.
pub fn led_packet(r: u8, g: u8, b: u8, rumble: u8) -> [u8; LED_PACKET_SIZE] {
    let mut msg = [0u8; LED_PACKET_SIZE];
    msg[0] = LED_REPORT_ID;
    msg[2] = r;
    msg[3] = g;
    msg[4] = b;
    msg[6] = rumble;
    msg
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LedRumble {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub rumble: u8,
}

/// What the runtime wants on the LED and motor versus what was last sent.
#[derive(Debug, Clone, Default)]
pub struct LedState {
    pub wants: LedRumble,
    state: LedRumble,
    resend_time_ns: i64,
}

impl LedState {
    pub fn new(wants: LedRumble) -> Self {
        Self {
            wants,
            state: LedRumble::default(),
            resend_time_ns: 0,
        }
    }

    pub fn sent(&self) -> LedRumble {
        self.state
    }

    /// Returns the packet to send at `now_ns`, or `None` when the last one
    /// still matches and the keep-alive has not expired.
    pub fn update(&mut self, now_ns: i64) -> Option<[u8; LED_PACKET_SIZE]> {
        if self.resend_time_ns > now_ns && self.state == self.wants {
            return None;
        }

        self.state = self.wants;
        self.resend_time_ns = now_ns + RESEND_INTERVAL_NS;
        let s = self.state;
        Some(led_packet(s.r, s.g, s.b, s.rumble))
    }
}
