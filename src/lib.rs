//! # xrdrivers - XR device drivers
//!
//! Hardware drivers for an XR runtime. Provides:
//! - The device contract every driver implements (poses, inputs, outputs, HMD views)
//! - PS Move controllers over Bluetooth HID, with ZCM1/ZCM2 calibration
//! - IMU pre-filtering and 3-DoF orientation fusion
//! - Camera frame servers (V4L2, DepthAI, RealSense, WMR) and the sink graph
//!   that carries their frames and IMU samples to trackers
//! - An Android phone-as-HMD driver
//! - C FFI for the PS Move driver
//!
//! ## Quick Start
//! ```no_run
//! use std::sync::Arc;
//! use xrdrivers::config::DriverConfig;
//! use xrdrivers::device::Device;
//! use xrdrivers::psmv::PsmvDevice;
//! use xrdrivers::types::{InputName, TrackingOrigin, TrackingType};
//!
//! let config = DriverConfig::from_env();
//! let origin = Arc::new(TrackingOrigin::new("PS Move", TrackingType::OrientationOnly));
//! let mut psmv = PsmvDevice::open_first(origin, &config).unwrap();
//!
//! psmv.update_inputs().unwrap();
//! let rel = psmv.get_tracked_pose(InputName::PsmvBallTipPose, 0).unwrap();
//! println!("orientation: {:?}", rel.pose.orientation);
//! psmv.destroy();
//! ```

#[macro_use]
mod logging;

pub mod error;
pub mod types;
pub mod time;
pub mod config;
pub mod thread;
pub mod hid;
pub mod imu;
pub mod frame;
pub mod sink;
pub mod frameserver;
pub mod distortion;
pub mod device;
pub mod binding;
pub mod psmv;
pub mod v4l2;
pub mod android;
pub mod depthai;
pub mod realsense;
pub mod wmr;
pub mod ffi;

pub use error::{CalibrationError, XrError};
pub use device::Device;
pub use frameserver::FrameServer;

/// Result type alias for driver operations.
pub type Result<T> = std::result::Result<T, XrError>;
