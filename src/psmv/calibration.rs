//! Factory IMU calibration stored on the controller, read back through
//! feature report 0x10 in fixed-size fragments.

use super::protocol::Revision;
use crate::error::CalibrationError;
use crate::hid::HidIo;
use crate::imu::prefilter::{ImuPrefilter, RawVec3};
use crate::imu::GRAVITY_M_S2;
use crate::types::Vec3;
use crate::{Result, XrError};
use log::LevelFilter;
use std::f64::consts::PI;

pub const REPORT_ID: u8 = 0x10;

/// Size of one fragment: `{id, which, data[47]}`.
pub const PART_SIZE: usize = 49;

pub const ZCM1_SIZE: usize = 143;
pub const ZCM2_SIZE: usize = 96;

const ZCM1_RPM: f64 = 80.0;
const ZCM2_RPM: f64 = 90.0;

impl Revision {
    fn fragment_count(self) -> usize {
        match self {
            Revision::Zcm1 => 3,
            Revision::Zcm2 => 2,
        }
    }

    fn block_size(self) -> usize {
        match self {
            Revision::Zcm1 => ZCM1_SIZE,
            Revision::Zcm2 => ZCM2_SIZE,
        }
    }

    /// Where a fragment lands in the block, keyed by its `which` byte.
    fn dst_offset(self, which: u8) -> Option<usize> {
        match (self, which) {
            (_, 0x00) => Some(0),
            (Revision::Zcm1, 0x01) => Some(PART_SIZE),
            (Revision::Zcm1, 0x82) => Some(PART_SIZE * 2 - 2),
            (Revision::Zcm2, 0x81) => Some(PART_SIZE),
            _ => None,
        }
    }
}

/// Reassembles calibration fragments, which may arrive in any order.
#[derive(Debug)]
pub struct BlockAssembler {
    revision: Revision,
    block: Vec<u8>,
    seen: Vec<u8>,
}

impl BlockAssembler {
    pub fn new(revision: Revision) -> Self {
        Self {
            revision,
            block: vec![0; revision.block_size()],
            seen: Vec::with_capacity(revision.fragment_count()),
        }
    }

    pub fn add(&mut self, part: &[u8]) -> std::result::Result<(), CalibrationError> {
        if part.len() != PART_SIZE {
            return Err(CalibrationError::FragmentSize(part.len(), PART_SIZE));
        }

        let which = part[1];
        let dst = self
            .revision
            .dst_offset(which)
            .ok_or(CalibrationError::UnexpectedWhich(which))?;
        if self.seen.contains(&which) {
            return Err(CalibrationError::DuplicateWhich(which));
        }

        // Only the first fragment keeps its id/which header.
        let src = if which == 0x00 { 0 } else { 2 };
        let len = PART_SIZE - src;
        self.block[dst..dst + len].copy_from_slice(&part[src..]);
        self.seen.push(which);
        Ok(())
    }

    pub fn finish(self) -> std::result::Result<Vec<u8>, CalibrationError> {
        let want = self.revision.fragment_count();
        if self.seen.len() != want {
            return Err(CalibrationError::Incomplete {
                got: self.seen.len(),
                want,
            });
        }
        Ok(self.block)
    }
}

/*
 *
 * Wire helpers.
 *
 */

fn u16_wire(b: &[u8], off: usize) -> i32 {
    u16::from_le_bytes([b[off], b[off + 1]]) as i32 - 0x8000
}

fn put_u16_wire(b: &mut [u8], off: usize, v: i32) {
    b[off..off + 2].copy_from_slice(&((v + 0x8000) as u16).to_le_bytes());
}

fn i16_wire(b: &[u8], off: usize) -> i32 {
    i16::from_le_bytes([b[off], b[off + 1]]) as i32
}

fn put_i16_wire(b: &mut [u8], off: usize, v: i32) {
    b[off..off + 2].copy_from_slice(&(v as i16).to_le_bytes());
}

pub(crate) fn vec3_u16_wire(b: &[u8], off: usize) -> RawVec3 {
    RawVec3::new(u16_wire(b, off), u16_wire(b, off + 2), u16_wire(b, off + 4))
}

fn put_vec3_u16_wire(b: &mut [u8], off: usize, v: &RawVec3) {
    for i in 0..3 {
        put_u16_wire(b, off + i * 2, v[i]);
    }
}

pub(crate) fn vec3_i16_wire(b: &[u8], off: usize) -> RawVec3 {
    RawVec3::new(i16_wire(b, off), i16_wire(b, off + 2), i16_wire(b, off + 4))
}

fn put_vec3_i16_wire(b: &mut [u8], off: usize, v: &RawVec3) {
    for i in 0..3 {
        put_i16_wire(b, off + i * 2, v[i]);
    }
}

fn f32_wire(b: &[u8], off: usize) -> f32 {
    f32::from_le_bytes([b[off], b[off + 1], b[off + 2], b[off + 3]])
}

fn put_f32_wire(b: &mut [u8], off: usize, v: f32) {
    b[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

fn vec3_f32_wire(b: &[u8], off: usize) -> Vec3 {
    Vec3::new(f32_wire(b, off), f32_wire(b, off + 4), f32_wire(b, off + 8))
}

fn put_vec3_f32_wire(b: &mut [u8], off: usize, v: &Vec3) {
    for i in 0..3 {
        put_f32_wire(b, off + i * 4, v[i]);
    }
}

fn check_len(block: &[u8], need: usize) -> std::result::Result<(), CalibrationError> {
    if block.len() < need {
        return Err(CalibrationError::TooShort {
            got: block.len(),
            need,
        });
    }
    Ok(())
}

/// Accelerometer readings with the controller resting on each face.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AccelExtremes {
    pub min_x: RawVec3,
    pub max_x: RawVec3,
    pub min_y: RawVec3,
    pub max_y: RawVec3,
    pub min_z: RawVec3,
    pub max_z: RawVec3,
}

impl AccelExtremes {
    /// Gain maps half the min/max span to one g; bias is the mean of all
    /// six readings on each axis.
    fn gain_and_bias(&self) -> std::result::Result<(Vec3, Vec3), CalibrationError> {
        let spans = [
            ('x', self.max_x.x - self.min_x.x),
            ('y', self.max_y.y - self.min_y.y),
            ('z', self.max_z.z - self.min_z.z),
        ];

        let mut gain = Vec3::zeros();
        for (i, (axis, span)) in spans.iter().enumerate() {
            if *span == 0 {
                return Err(CalibrationError::Degenerate(*axis));
            }
            gain[i] = (GRAVITY_M_S2 as f64 * 2.0 / *span as f64) as f32;
        }

        let sum = self.min_x + self.max_x + self.min_y + self.max_y + self.min_z + self.max_z;
        let bias = sum.cast::<f32>() / 6.0;

        Ok((gain, bias))
    }
}

fn gyro_gain(rpm: f64, range: f64, axis: char) -> std::result::Result<f32, CalibrationError> {
    if range == 0.0 {
        return Err(CalibrationError::Degenerate(axis));
    }
    Ok((2.0 * PI * rpm / (60.0 * range)) as f32)
}

/// Calibration block of the original controller.
#[derive(Debug, Clone, PartialEq)]
pub struct Zcm1Calibration {
    pub accel: AccelExtremes,
    pub gyro_bias_0: RawVec3,
    pub gyro_bias_1: RawVec3,
    pub gyro_rot_x: RawVec3,
    pub gyro_rot_y: RawVec3,
    pub gyro_rot_z: RawVec3,
    pub unknown_vec3: Vec3,
    /// Multiplier applied to `gyro_bias_0` before taking the 80 rpm range.
    pub gyro_fact: Vec3,
    pub unknown_float_0: f32,
    pub unknown_float_1: f32,
    /// The block as read; keeps padding for [`Zcm1Calibration::to_bytes`].
    wire: Vec<u8>,
}

mod zcm1 {
    pub const ACCEL_MAX_Z: usize = 4;
    pub const ACCEL_MIN_X: usize = 10;
    pub const ACCEL_MIN_Z: usize = 16;
    pub const ACCEL_MAX_X: usize = 22;
    pub const ACCEL_MAX_Y: usize = 28;
    pub const ACCEL_MIN_Y: usize = 34;
    pub const GYRO_BIAS_0: usize = 42;
    pub const GYRO_BIAS_1: usize = 50;
    pub const GYRO_ROT_X: usize = 70;
    pub const GYRO_ROT_Y: usize = 78;
    pub const GYRO_ROT_Z: usize = 86;
    pub const UNKNOWN_VEC3: usize = 94;
    pub const GYRO_FACT: usize = 106;
    pub const UNKNOWN_FLOAT_0: usize = 118;
    pub const UNKNOWN_FLOAT_1: usize = 122;
}

impl Zcm1Calibration {
    pub fn parse(block: &[u8]) -> std::result::Result<Self, CalibrationError> {
        check_len(block, ZCM1_SIZE)?;
        let b = block;
        Ok(Self {
            accel: AccelExtremes {
                min_x: vec3_u16_wire(b, zcm1::ACCEL_MIN_X),
                max_x: vec3_u16_wire(b, zcm1::ACCEL_MAX_X),
                min_y: vec3_u16_wire(b, zcm1::ACCEL_MIN_Y),
                max_y: vec3_u16_wire(b, zcm1::ACCEL_MAX_Y),
                min_z: vec3_u16_wire(b, zcm1::ACCEL_MIN_Z),
                max_z: vec3_u16_wire(b, zcm1::ACCEL_MAX_Z),
            },
            gyro_bias_0: vec3_u16_wire(b, zcm1::GYRO_BIAS_0),
            gyro_bias_1: vec3_u16_wire(b, zcm1::GYRO_BIAS_1),
            gyro_rot_x: vec3_u16_wire(b, zcm1::GYRO_ROT_X),
            gyro_rot_y: vec3_u16_wire(b, zcm1::GYRO_ROT_Y),
            gyro_rot_z: vec3_u16_wire(b, zcm1::GYRO_ROT_Z),
            unknown_vec3: vec3_f32_wire(b, zcm1::UNKNOWN_VEC3),
            gyro_fact: vec3_f32_wire(b, zcm1::GYRO_FACT),
            unknown_float_0: f32_wire(b, zcm1::UNKNOWN_FLOAT_0),
            unknown_float_1: f32_wire(b, zcm1::UNKNOWN_FLOAT_1),
            wire: b[..ZCM1_SIZE].to_vec(),
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut b = self.wire.clone();
        b.resize(ZCM1_SIZE, 0);
        put_vec3_u16_wire(&mut b, zcm1::ACCEL_MIN_X, &self.accel.min_x);
        put_vec3_u16_wire(&mut b, zcm1::ACCEL_MAX_X, &self.accel.max_x);
        put_vec3_u16_wire(&mut b, zcm1::ACCEL_MIN_Y, &self.accel.min_y);
        put_vec3_u16_wire(&mut b, zcm1::ACCEL_MAX_Y, &self.accel.max_y);
        put_vec3_u16_wire(&mut b, zcm1::ACCEL_MIN_Z, &self.accel.min_z);
        put_vec3_u16_wire(&mut b, zcm1::ACCEL_MAX_Z, &self.accel.max_z);
        put_vec3_u16_wire(&mut b, zcm1::GYRO_BIAS_0, &self.gyro_bias_0);
        put_vec3_u16_wire(&mut b, zcm1::GYRO_BIAS_1, &self.gyro_bias_1);
        put_vec3_u16_wire(&mut b, zcm1::GYRO_ROT_X, &self.gyro_rot_x);
        put_vec3_u16_wire(&mut b, zcm1::GYRO_ROT_Y, &self.gyro_rot_y);
        put_vec3_u16_wire(&mut b, zcm1::GYRO_ROT_Z, &self.gyro_rot_z);
        put_vec3_f32_wire(&mut b, zcm1::UNKNOWN_VEC3, &self.unknown_vec3);
        put_vec3_f32_wire(&mut b, zcm1::GYRO_FACT, &self.gyro_fact);
        put_f32_wire(&mut b, zcm1::UNKNOWN_FLOAT_0, self.unknown_float_0);
        put_f32_wire(&mut b, zcm1::UNKNOWN_FLOAT_1, self.unknown_float_1);
        b
    }

    pub fn prefilter(&self) -> std::result::Result<ImuPrefilter, CalibrationError> {
        let (accel_gain, accel_bias) = self.accel.gain_and_bias()?;

        let range = |rot: &RawVec3, i: usize| rot[i] as f64 - self.gyro_bias_0[i] as f64 * self.gyro_fact[i] as f64;
        let gyro_gain = Vec3::new(
            gyro_gain(ZCM1_RPM, range(&self.gyro_rot_x, 0), 'x')?,
            gyro_gain(ZCM1_RPM, range(&self.gyro_rot_y, 1), 'y')?,
            gyro_gain(ZCM1_RPM, range(&self.gyro_rot_z, 2), 'z')?,
        );

        Ok(ImuPrefilter {
            accel_gain,
            accel_bias,
            gyro_gain,
            gyro_bias: Vec3::zeros(),
        })
    }
}

/// Calibration block of the second controller revision.
#[derive(Debug, Clone, PartialEq)]
pub struct Zcm2Calibration {
    pub accel: AccelExtremes,
    pub gyro_bias: RawVec3,
    pub gyro_pos_x: RawVec3,
    pub gyro_pos_y: RawVec3,
    pub gyro_pos_z: RawVec3,
    pub gyro_neg_x: RawVec3,
    pub gyro_neg_y: RawVec3,
    pub gyro_neg_z: RawVec3,
    wire: Vec<u8>,
}

mod zcm2 {
    pub const ACCEL_MAX_X: usize = 2;
    pub const ACCEL_MIN_X: usize = 8;
    pub const ACCEL_MAX_Y: usize = 14;
    pub const ACCEL_MIN_Y: usize = 20;
    pub const ACCEL_MAX_Z: usize = 26;
    pub const ACCEL_MIN_Z: usize = 32;
    pub const GYRO_BIAS: usize = 38;
    pub const GYRO_POS_X: usize = 48;
    pub const GYRO_POS_Y: usize = 54;
    pub const GYRO_POS_Z: usize = 60;
    pub const GYRO_NEG_X: usize = 66;
    pub const GYRO_NEG_Y: usize = 72;
    pub const GYRO_NEG_Z: usize = 78;
}

impl Zcm2Calibration {
    pub fn parse(block: &[u8]) -> std::result::Result<Self, CalibrationError> {
        check_len(block, ZCM2_SIZE)?;
        let b = block;
        Ok(Self {
            accel: AccelExtremes {
                min_x: vec3_i16_wire(b, zcm2::ACCEL_MIN_X),
                max_x: vec3_i16_wire(b, zcm2::ACCEL_MAX_X),
                min_y: vec3_i16_wire(b, zcm2::ACCEL_MIN_Y),
                max_y: vec3_i16_wire(b, zcm2::ACCEL_MAX_Y),
                min_z: vec3_i16_wire(b, zcm2::ACCEL_MIN_Z),
                max_z: vec3_i16_wire(b, zcm2::ACCEL_MAX_Z),
            },
            gyro_bias: vec3_i16_wire(b, zcm2::GYRO_BIAS),
            gyro_pos_x: vec3_i16_wire(b, zcm2::GYRO_POS_X),
            gyro_pos_y: vec3_i16_wire(b, zcm2::GYRO_POS_Y),
            gyro_pos_z: vec3_i16_wire(b, zcm2::GYRO_POS_Z),
            gyro_neg_x: vec3_i16_wire(b, zcm2::GYRO_NEG_X),
            gyro_neg_y: vec3_i16_wire(b, zcm2::GYRO_NEG_Y),
            gyro_neg_z: vec3_i16_wire(b, zcm2::GYRO_NEG_Z),
            wire: b[..ZCM2_SIZE].to_vec(),
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut b = self.wire.clone();
        b.resize(ZCM2_SIZE, 0);
        put_vec3_i16_wire(&mut b, zcm2::ACCEL_MIN_X, &self.accel.min_x);
        put_vec3_i16_wire(&mut b, zcm2::ACCEL_MAX_X, &self.accel.max_x);
        put_vec3_i16_wire(&mut b, zcm2::ACCEL_MIN_Y, &self.accel.min_y);
        put_vec3_i16_wire(&mut b, zcm2::ACCEL_MAX_Y, &self.accel.max_y);
        put_vec3_i16_wire(&mut b, zcm2::ACCEL_MIN_Z, &self.accel.min_z);
        put_vec3_i16_wire(&mut b, zcm2::ACCEL_MAX_Z, &self.accel.max_z);
        put_vec3_i16_wire(&mut b, zcm2::GYRO_BIAS, &self.gyro_bias);
        put_vec3_i16_wire(&mut b, zcm2::GYRO_POS_X, &self.gyro_pos_x);
        put_vec3_i16_wire(&mut b, zcm2::GYRO_POS_Y, &self.gyro_pos_y);
        put_vec3_i16_wire(&mut b, zcm2::GYRO_POS_Z, &self.gyro_pos_z);
        put_vec3_i16_wire(&mut b, zcm2::GYRO_NEG_X, &self.gyro_neg_x);
        put_vec3_i16_wire(&mut b, zcm2::GYRO_NEG_Y, &self.gyro_neg_y);
        put_vec3_i16_wire(&mut b, zcm2::GYRO_NEG_Z, &self.gyro_neg_z);
        b
    }

    pub fn prefilter(&self) -> std::result::Result<ImuPrefilter, CalibrationError> {
        let (accel_gain, accel_bias) = self.accel.gain_and_bias()?;

        let range = |pos: &RawVec3, neg: &RawVec3, i: usize| (pos[i] - neg[i]) as f64 / 2.0;
        let gyro_gain = Vec3::new(
            gyro_gain(ZCM2_RPM, range(&self.gyro_pos_x, &self.gyro_neg_x, 0), 'x')?,
            gyro_gain(ZCM2_RPM, range(&self.gyro_pos_y, &self.gyro_neg_y, 1), 'y')?,
            gyro_gain(ZCM2_RPM, range(&self.gyro_pos_z, &self.gyro_neg_z, 2), 'z')?,
        );

        Ok(ImuPrefilter {
            accel_gain,
            accel_bias,
            gyro_gain,
            gyro_bias: self.gyro_bias.cast::<f32>(),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Calibration {
    Zcm1(Zcm1Calibration),
    Zcm2(Zcm2Calibration),
}

impl Calibration {
    pub fn parse(revision: Revision, block: &[u8]) -> std::result::Result<Self, CalibrationError> {
        Ok(match revision {
            Revision::Zcm1 => Calibration::Zcm1(Zcm1Calibration::parse(block)?),
            Revision::Zcm2 => Calibration::Zcm2(Zcm2Calibration::parse(block)?),
        })
    }

    pub fn prefilter(&self) -> std::result::Result<ImuPrefilter, CalibrationError> {
        match self {
            Calibration::Zcm1(c) => c.prefilter(),
            Calibration::Zcm2(c) => c.prefilter(),
        }
    }

    pub fn accel(&self) -> &AccelExtremes {
        match self {
            Calibration::Zcm1(c) => &c.accel,
            Calibration::Zcm2(c) => &c.accel,
        }
    }
}

/// Reads all fragments from the device and decodes the block.
pub fn read_calibration(hid: &dyn HidIo, revision: Revision, ll: LevelFilter) -> Result<Calibration> {
    let mut assembler = BlockAssembler::new(revision);

    for _ in 0..revision.fragment_count() {
        let mut part = [0u8; PART_SIZE];
        part[0] = REPORT_ID;
        let n = hid.get_feature_report(&mut part)?;
        if n != PART_SIZE {
            ll_error!(ll, "Calibration fragment size wrong: {} != {}", n, PART_SIZE);
            return Err(XrError::Calibration(CalibrationError::FragmentSize(n, PART_SIZE)));
        }
        assembler.add(&part)?;
    }

    let calibration = Calibration::parse(revision, &assembler.finish()?)?;
    ll_debug!(ll, "Calibration: {:?}", calibration.accel());
    Ok(calibration)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Splits a block into the fragments the device would send.
    pub(crate) fn fragments(revision: Revision, block: &[u8]) -> Vec<Vec<u8>> {
        let whiches: &[u8] = match revision {
            Revision::Zcm1 => &[0x00, 0x01, 0x82],
            Revision::Zcm2 => &[0x00, 0x81],
        };
        whiches
            .iter()
            .map(|&which| {
                let dst = revision.dst_offset(which).unwrap();
                let mut part = vec![0u8; PART_SIZE];
                if which == 0 {
                    part.copy_from_slice(&block[..PART_SIZE]);
                } else {
                    part[0] = REPORT_ID;
                    part[1] = which;
                    part[2..].copy_from_slice(&block[dst..dst + PART_SIZE - 2]);
                }
                part
            })
            .collect()
    }

    /// ZCM1 block with a symmetric ±4096 accelerometer and sane gyro.
    pub(crate) fn zcm1_block() -> Vec<u8> {
        let mut b = vec![0u8; ZCM1_SIZE];
        b[0] = REPORT_ID;
        for (i, byte) in b.iter_mut().enumerate().skip(2) {
            // Recognisable padding.
            *byte = (i * 7) as u8;
        }
        let zero = RawVec3::zeros();
        for off in [
            zcm1::ACCEL_MAX_Z,
            zcm1::ACCEL_MIN_Z,
            zcm1::ACCEL_MAX_Y,
            zcm1::ACCEL_MIN_Y,
            zcm1::GYRO_BIAS_0,
            zcm1::GYRO_BIAS_1,
        ] {
            put_vec3_u16_wire(&mut b, off, &zero);
        }
        put_vec3_u16_wire(&mut b, zcm1::ACCEL_MIN_X, &RawVec3::new(-4096, 0, 0));
        put_vec3_u16_wire(&mut b, zcm1::ACCEL_MAX_X, &RawVec3::new(4096, 0, 0));
        put_vec3_u16_wire(&mut b, zcm1::ACCEL_MIN_Y, &RawVec3::new(0, -4000, 0));
        put_vec3_u16_wire(&mut b, zcm1::ACCEL_MAX_Y, &RawVec3::new(0, 4000, 0));
        put_vec3_u16_wire(&mut b, zcm1::ACCEL_MIN_Z, &RawVec3::new(0, 0, -4100));
        put_vec3_u16_wire(&mut b, zcm1::ACCEL_MAX_Z, &RawVec3::new(0, 0, 4100));
        put_vec3_u16_wire(&mut b, zcm1::GYRO_ROT_X, &RawVec3::new(5000, 1, 2));
        put_vec3_u16_wire(&mut b, zcm1::GYRO_ROT_Y, &RawVec3::new(3, 5000, 4));
        put_vec3_u16_wire(&mut b, zcm1::GYRO_ROT_Z, &RawVec3::new(5, 6, 5000));
        put_vec3_f32_wire(&mut b, zcm1::GYRO_FACT, &Vec3::new(1.0, 1.0, 1.0));
        put_vec3_f32_wire(&mut b, zcm1::UNKNOWN_VEC3, &Vec3::new(0.5, -0.25, 3.0));
        put_f32_wire(&mut b, zcm1::UNKNOWN_FLOAT_0, 1.5);
        put_f32_wire(&mut b, zcm1::UNKNOWN_FLOAT_1, f32::from_bits(0x7fc0_1234));
        b
    }

    #[test]
    fn test_zcm1_accel_gain_and_bias() {
        let cal = Zcm1Calibration::parse(&zcm1_block()).unwrap();
        let pf = cal.prefilter().unwrap();
        assert!((pf.accel_gain.x - 9.80665 / 4096.0).abs() < 1e-7);
        assert_eq!(pf.accel_bias.x, 0.0);
        assert_eq!(pf.gyro_bias, Vec3::zeros());
        let expected = (2.0 * PI * 80.0 / (60.0 * 5000.0)) as f32;
        assert!((pf.gyro_gain.x - expected).abs() < 1e-9);
    }

    #[test]
    fn test_zcm1_round_trip_is_bit_exact() {
        let block = zcm1_block();
        let cal = Zcm1Calibration::parse(&block).unwrap();
        assert_eq!(cal.to_bytes(), block);
        assert_eq!(cal.unknown_float_1.to_bits(), 0x7fc0_1234);
    }

    #[test]
    fn test_reassembly_any_order() {
        let block = zcm1_block();
        let mut parts = fragments(Revision::Zcm1, &block);
        parts.reverse();
        let mut asm = BlockAssembler::new(Revision::Zcm1);
        for p in &parts {
            asm.add(p).unwrap();
        }
        assert_eq!(asm.finish().unwrap(), block);
    }

    #[test]
    fn test_reassembly_errors() {
        let mut asm = BlockAssembler::new(Revision::Zcm1);
        assert_eq!(asm.add(&[0u8; 10]), Err(CalibrationError::FragmentSize(10, 49)));

        let mut bad = vec![0u8; PART_SIZE];
        bad[1] = 0x81;
        assert_eq!(asm.add(&bad), Err(CalibrationError::UnexpectedWhich(0x81)));

        let first = vec![0u8; PART_SIZE];
        asm.add(&first).unwrap();
        assert_eq!(asm.add(&first), Err(CalibrationError::DuplicateWhich(0)));
        assert_eq!(
            asm.finish(),
            Err(CalibrationError::Incomplete { got: 1, want: 3 })
        );
    }

    #[test]
    fn test_zcm2_decode() {
        let mut b = vec![0u8; ZCM2_SIZE];
        put_vec3_i16_wire(&mut b, zcm2::ACCEL_MIN_X, &RawVec3::new(-4000, 10, 20));
        put_vec3_i16_wire(&mut b, zcm2::ACCEL_MAX_X, &RawVec3::new(4200, 10, 20));
        put_vec3_i16_wire(&mut b, zcm2::ACCEL_MIN_Y, &RawVec3::new(100, -4100, 20));
        put_vec3_i16_wire(&mut b, zcm2::ACCEL_MAX_Y, &RawVec3::new(100, 4100, 20));
        put_vec3_i16_wire(&mut b, zcm2::ACCEL_MIN_Z, &RawVec3::new(100, 10, -4100));
        put_vec3_i16_wire(&mut b, zcm2::ACCEL_MAX_Z, &RawVec3::new(100, 10, 4100));
        put_vec3_i16_wire(&mut b, zcm2::GYRO_BIAS, &RawVec3::new(-3, 4, 5));
        put_vec3_i16_wire(&mut b, zcm2::GYRO_POS_X, &RawVec3::new(6000, 0, 0));
        put_vec3_i16_wire(&mut b, zcm2::GYRO_NEG_X, &RawVec3::new(-6000, 0, 0));
        put_vec3_i16_wire(&mut b, zcm2::GYRO_POS_Y, &RawVec3::new(0, 6000, 0));
        put_vec3_i16_wire(&mut b, zcm2::GYRO_NEG_Y, &RawVec3::new(0, -6000, 0));
        put_vec3_i16_wire(&mut b, zcm2::GYRO_POS_Z, &RawVec3::new(0, 0, 6000));
        put_vec3_i16_wire(&mut b, zcm2::GYRO_NEG_Z, &RawVec3::new(0, 0, -6000));

        let cal = Zcm2Calibration::parse(&b).unwrap();
        assert_eq!(cal.gyro_bias, RawVec3::new(-3, 4, 5));
        assert_eq!(cal.to_bytes(), b);

        let pf = cal.prefilter().unwrap();
        assert!((pf.accel_gain.x - (9.80665 * 2.0 / 8200.0) as f32).abs() < 1e-7);
        assert!((pf.accel_bias.x - 100.0).abs() < 1e-3);
        assert_eq!(pf.gyro_bias, Vec3::new(-3.0, 4.0, 5.0));
        let expected = (2.0 * PI * 90.0 / (60.0 * 6000.0)) as f32;
        assert!((pf.gyro_gain.z - expected).abs() < 1e-9);
    }

    #[test]
    fn test_degenerate_axis() {
        let b = vec![0u8; ZCM2_SIZE];
        let cal = Zcm2Calibration::parse(&b).unwrap();
        assert_eq!(cal.prefilter(), Err(CalibrationError::Degenerate('x')));
    }

    #[test]
    fn test_read_calibration_from_device() {
        use crate::hid::mock::ScriptedHid;
        let hid = ScriptedHid::default();
        let block = zcm1_block();
        for p in fragments(Revision::Zcm1, &block) {
            hid.push_feature(p);
        }
        let cal = read_calibration(&hid, Revision::Zcm1, LevelFilter::Off).unwrap();
        match cal {
            Calibration::Zcm1(c) => assert_eq!(c.to_bytes(), block),
            _ => panic!("wrong revision"),
        }
    }

    #[test]
    fn test_read_calibration_unknown_which_is_fatal() {
        use crate::hid::mock::ScriptedHid;
        let hid = ScriptedHid::default();
        let mut part = vec![0u8; PART_SIZE];
        part[1] = 0x07;
        hid.push_feature(part);
        let err = read_calibration(&hid, Revision::Zcm2, LevelFilter::Off).unwrap_err();
        assert!(matches!(
            err,
            XrError::Calibration(CalibrationError::UnexpectedWhich(0x07))
        ));
    }
}
