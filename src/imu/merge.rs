use crate::types::ImuSample;
use nalgebra::Vector3;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotionSensor {
    Accel,
    Gyro,
}

#[derive(Debug, Default)]
struct Latest {
    accel: Vector3<f64>,
    gyro: Vector3<f64>,
}

/// Merges accelerometer and gyroscope values that arrive on separate
/// streams into full IMU samples.
///
/// The latest value of each stream is kept; a sample is produced every
/// time the faster stream delivers, reusing the slower stream's last
/// value (or zero before its first reading).
#[derive(Debug)]
pub struct PartialImuSample {
    latest: Mutex<Latest>,
    gyro_is_faster: bool,
}

impl PartialImuSample {
    pub fn new(gyro_hz: u32, accel_hz: u32) -> Self {
        Self {
            latest: Mutex::new(Latest::default()),
            gyro_is_faster: gyro_hz > accel_hz,
        }
    }

    /// The stream whose timestamps are never emitted.
    pub fn slower(&self) -> MotionSensor {
        if self.gyro_is_faster {
            MotionSensor::Accel
        } else {
            MotionSensor::Gyro
        }
    }

    pub fn push(&self, timestamp_ns: i64, value: Vector3<f64>, sensor: MotionSensor) -> Option<ImuSample> {
        let mut latest = match self.latest.lock() {
            Ok(l) => l,
            Err(poisoned) => poisoned.into_inner(),
        };

        match sensor {
            MotionSensor::Gyro => latest.gyro = value,
            MotionSensor::Accel => latest.accel = value,
        }

        let should_submit = self.gyro_is_faster == (sensor == MotionSensor::Gyro);
        if !should_submit {
            return None;
        }

        Some(ImuSample {
            timestamp_ns,
            accel_m_s2: latest.accel,
            gyro_rad_secs: latest.gyro,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emits_on_faster_stream_only() {
        // Accel at 250 Hz is faster than gyro at 200 Hz.
        let merge = PartialImuSample::new(200, 250);
        assert_eq!(merge.slower(), MotionSensor::Gyro);

        let gyro = Vector3::new(0.1, 0.2, 0.3);
        assert!(merge.push(10, gyro, MotionSensor::Gyro).is_none());

        let accel = Vector3::new(0.0, 9.8, 0.0);
        let s = merge.push(12, accel, MotionSensor::Accel).unwrap();
        assert_eq!(s.timestamp_ns, 12);
        assert_eq!(s.gyro_rad_secs, gyro);
        assert_eq!(s.accel_m_s2, accel);
    }

    #[test]
    fn test_zero_before_first_slow_value() {
        let merge = PartialImuSample::new(400, 100);
        let s = merge
            .push(1, Vector3::new(1.0, 0.0, 0.0), MotionSensor::Gyro)
            .unwrap();
        assert_eq!(s.accel_m_s2, Vector3::zeros());
    }
}
