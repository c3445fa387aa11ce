use std::fmt;

/// Reasons a calibration block could not be reassembled or decoded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CalibrationError {
    #[error("calibration fragment has size {0}, expected {1}")]
    FragmentSize(usize, usize),

    #[error("unexpected calibration fragment id 0x{0:02x}")]
    UnexpectedWhich(u8),

    #[error("calibration fragment 0x{0:02x} received twice")]
    DuplicateWhich(u8),

    #[error("calibration incomplete: got {got} of {want} fragments")]
    Incomplete { got: usize, want: usize },

    #[error("calibration block too short: {got} bytes, need {need}")]
    TooShort { got: usize, need: usize },

    #[error("degenerate calibration on axis {0}")]
    Degenerate(char),
}

/// Errors that can occur in any of the drivers.
#[derive(Debug, thiserror::Error)]
pub enum XrError {
    #[error("HID error: {0}")]
    Hid(#[from] hidapi::HidError),

    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("ioctl {request} failed: {source}")]
    Ioctl {
        request: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("calibration error: {0}")]
    Calibration(#[from] CalibrationError),

    #[error("device not handled by this driver")]
    NotHandled,

    #[error("device not found")]
    DeviceNotFound,

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unknown input name")]
    UnknownInput,

    #[error("unknown output name")]
    UnknownOutput,

    #[error("stream stopped")]
    StreamStopped,

    #[error("timeout waiting for data")]
    Timeout,

    #[error("failed to spawn thread: {0}")]
    ThreadSpawn(String),
}

/// Thread-safe last-error storage for the C FFI layer.
pub(crate) struct LastError {
    message: std::sync::Mutex<String>,
}

impl LastError {
    pub const fn new() -> Self {
        Self {
            message: std::sync::Mutex::new(String::new()),
        }
    }

    pub fn set(&self, err: &XrError) {
        if let Ok(mut msg) = self.message.lock() {
            *msg = fmt::format(format_args!("{}\0", err));
        }
    }

    pub fn clear(&self) {
        if let Ok(mut msg) = self.message.lock() {
            msg.clear();
        }
    }

    pub fn as_ptr(&self) -> *const std::ffi::c_char {
        match self.message.lock() {
            Ok(msg) if !msg.is_empty() => msg.as_ptr() as *const std::ffi::c_char,
            _ => std::ptr::null(),
        }
    }
}
