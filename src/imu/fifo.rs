use crate::types::Vec3;

/// Fixed-size ring of timestamped vec3 samples, newest first.
///
/// Used as the averaging window for gravity correction and as a history
/// buffer for debug sinks.
#[derive(Debug, Clone)]
pub struct FilterFifo3 {
    samples: Vec<Vec3>,
    timestamps_ns: Vec<i64>,
    latest: usize,
    len: usize,
}

impl FilterFifo3 {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: vec![Vec3::zeros(); capacity],
            timestamps_ns: vec![0; capacity],
            latest: 0,
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.samples.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Samples are written backwards so index 0 is always the newest.
    pub fn push(&mut self, sample: Vec3, timestamp_ns: i64) {
        let cap = self.capacity();
        self.latest = if self.latest == 0 { cap - 1 } else { self.latest - 1 };
        self.samples[self.latest] = sample;
        self.timestamps_ns[self.latest] = timestamp_ns;
        self.len = (self.len + 1).min(cap);
    }

    /// Returns the `age`-th newest sample, 0 being the latest.
    pub fn get(&self, age: usize) -> Option<(Vec3, i64)> {
        if age >= self.len {
            return None;
        }
        let pos = (self.latest + age) % self.capacity();
        Some((self.samples[pos], self.timestamps_ns[pos]))
    }

    /// Mean of all samples with `start_ns <= t <= stop_ns`, accumulated in
    /// double precision. `None` if no sample falls inside the range.
    pub fn filter(&self, start_ns: i64, stop_ns: i64) -> Option<Vec3> {
        if start_ns > stop_ns {
            return None;
        }

        let (mut x, mut y, mut z) = (0f64, 0f64, 0f64);
        let mut num = 0usize;
        for age in 0..self.len {
            let pos = (self.latest + age) % self.capacity();
            let ts = self.timestamps_ns[pos];
            if ts > stop_ns {
                continue;
            }
            if ts < start_ns {
                break;
            }
            let s = &self.samples[pos];
            x += s.x as f64;
            y += s.y as f64;
            z += s.z as f64;
            num += 1;
        }

        if num == 0 {
            return None;
        }
        let n = num as f64;
        Some(Vec3::new((x / n) as f32, (y / n) as f32, (z / n) as f32))
    }
}
