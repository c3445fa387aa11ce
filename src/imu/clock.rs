/// Running estimate of the offset between two clocks, e.g. a device's
/// hardware clock and the host monotonic clock.
///
/// Fed from the highest-rate transport, usually the IMU, since it has the
/// least transmission jitter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClockOffset {
    a2b: Option<i64>,
}

impl ClockOffset {
    pub fn new() -> Self {
        Self { a2b: None }
    }

    /// Latest offset estimate, `b - a`.
    pub fn get(&self) -> i64 {
        self.a2b.unwrap_or(0)
    }

    /// Updates the estimate with a simultaneous reading of both clocks and
    /// returns `a` converted into the `b` domain. `freq` is the nominal
    /// sample rate of the stream in Hz.
    pub fn a2b(&mut self, freq: f32, a: i64, b: i64) -> i64 {
        let alpha = 1.0 - 12.5 / freq as f64;
        let got = b - a;
        let new = match self.a2b {
            None => got,
            Some(old) => (old as f64 * alpha + got as f64 * (1.0 - alpha)).round() as i64,
        };
        self.a2b = Some(new);
        a + new
    }
}
