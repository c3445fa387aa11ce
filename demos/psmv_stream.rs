//! Print the orientation and buttons of the first paired PS Move.
//!
//! Usage: cargo run --example psmv_stream
//! Press Ctrl+C to stop.

use std::sync::Arc;
use std::time::{Duration, Instant};
use xrdrivers::config::DriverConfig;
use xrdrivers::device::Device;
use xrdrivers::psmv::PsmvDevice;
use xrdrivers::types::{InputName, InputValue, TrackingOrigin, TrackingType};

fn main() {
    env_logger::init();

    let config = DriverConfig::from_env();
    let origin = Arc::new(TrackingOrigin::new("PS Move", TrackingType::OrientationOnly));
    let mut psmv = match PsmvDevice::open_first(origin, &config) {
        Ok(d) => d,
        Err(e) => {
            eprintln!("Failed to open PS Move: {}", e);
            std::process::exit(1);
        }
    };

    println!("Revision: {:?}", psmv.revision());
    println!("Battery:  {}", psmv.battery());
    println!();

    let start = Instant::now();
    let mut last_report = Instant::now();

    while psmv.is_running() {
        std::thread::sleep(Duration::from_millis(20));

        if let Err(e) = psmv.update_inputs() {
            eprintln!("Error: {}", e);
            break;
        }
        let rel = match psmv.get_tracked_pose(InputName::PsmvBallTipPose, 0) {
            Ok(r) => r,
            Err(e) => {
                eprintln!("Error: {}", e);
                break;
            }
        };

        let pressed: Vec<String> = psmv
            .inputs()
            .iter()
            .filter(|i| matches!(i.value, InputValue::Boolean(true)))
            .map(|i| format!("{:?}", i.name))
            .collect();

        // Trigger doubles as the LED brightness.
        if let Some(t) = psmv.inputs().iter().find_map(|i| match i.value {
            InputValue::Vec1(v) if i.name == InputName::PsmvTriggerValue => Some(v),
            _ => None,
        }) {
            let level = (t * 255.0) as u8;
            psmv.set_led(level, 0, 255 - level);
        }

        if last_report.elapsed() >= Duration::from_millis(500) {
            let q = rel.pose.orientation;
            println!(
                "t={:<6.1} quat=[{:+.3}, {:+.3}, {:+.3}, {:+.3}]  missed={}  {:?}",
                start.elapsed().as_secs_f64(),
                q.i,
                q.j,
                q.k,
                q.w,
                psmv.missed_packets(),
                pressed,
            );
            last_report = Instant::now();
        }
    }

    psmv.destroy();
}
