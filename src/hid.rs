use crate::Result;
use hidapi::{HidApi, HidDevice};

/// The HID operations the drivers need.
///
/// Implemented for [`hidapi::HidDevice`]; drivers only see this trait so
/// their worker loops and decoders can run against recorded traffic.
pub trait HidIo: Send {
    /// Reads one input report. Returns 0 when `timeout_ms` expires first.
    fn read_timeout(&self, buf: &mut [u8], timeout_ms: i32) -> Result<usize>;

    /// Non-blocking read, 0 when nothing is queued.
    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.read_timeout(buf, 0)
    }

    fn write(&self, data: &[u8]) -> Result<usize>;

    /// `buf[0]` holds the report id on entry.
    fn get_feature_report(&self, buf: &mut [u8]) -> Result<usize>;

    fn send_feature_report(&self, data: &[u8]) -> Result<()>;
}

impl HidIo for HidDevice {
    fn read_timeout(&self, buf: &mut [u8], timeout_ms: i32) -> Result<usize> {
        Ok(HidDevice::read_timeout(self, buf, timeout_ms)?)
    }

    fn write(&self, data: &[u8]) -> Result<usize> {
        Ok(HidDevice::write(self, data)?)
    }

    fn get_feature_report(&self, buf: &mut [u8]) -> Result<usize> {
        Ok(HidDevice::get_feature_report(self, buf)?)
    }

    fn send_feature_report(&self, data: &[u8]) -> Result<()> {
        Ok(HidDevice::send_feature_report(self, data)?)
    }
}

pub fn create_hid_api() -> Result<HidApi> {
    let api = HidApi::new()?;
    #[cfg(target_os = "macos")]
    {
        // Keep HID opens shared on macOS to avoid seizing the interface.
        api.set_open_exclusive(false);
    }
    Ok(api)
}
