//! List the modes of the default V4L2 camera and capture from the first one
//! for a few seconds.
//!
//! Usage: cargo run --example v4l2_capture [mode]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use xrdrivers::config::DriverConfig;
use xrdrivers::frame::Frame;
use xrdrivers::frameserver::{CaptureType, FrameServer};
use xrdrivers::sink::FrameSink;
use xrdrivers::v4l2::V4l2FrameServer;

#[derive(Default)]
struct Counter {
    frames: AtomicU64,
    last_ns: AtomicU64,
}

impl FrameSink for Counter {
    fn push_frame(&self, frame: &Frame) {
        self.frames.fetch_add(1, Ordering::Relaxed);
        self.last_ns.store(frame.timestamp_ns() as u64, Ordering::Relaxed);
    }
}

fn main() {
    env_logger::init();

    let mode: usize = std::env::args().nth(1).and_then(|a| a.parse().ok()).unwrap_or(0);

    let config = DriverConfig::from_env();
    let mut fs = match V4l2FrameServer::open_default(&config) {
        Ok(fs) => fs,
        Err(e) => {
            eprintln!("Failed to open camera: {}", e);
            std::process::exit(1);
        }
    };

    println!("Name:    {}", fs.info().name);
    println!("Product: {}", fs.info().product);
    println!("Quirk:   {:?}", fs.quirk());
    match fs.enumerate_modes() {
        Ok(modes) => {
            for (i, m) in modes.iter().enumerate() {
                println!("  [{}] {}x{} {:?} {:?}", i, m.width, m.height, m.format, m.stereo_format);
            }
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }

    let counter = Arc::new(Counter::default());
    let sink: Arc<dyn FrameSink> = counter.clone();
    if let Err(e) = fs.stream_start(Some(sink), CaptureType::Calibration, mode) {
        eprintln!("Failed to start mode {}: {}", mode, e);
        std::process::exit(1);
    }

    let start = Instant::now();
    while start.elapsed() < Duration::from_secs(5) {
        std::thread::sleep(Duration::from_secs(1));
        let n = counter.frames.load(Ordering::Relaxed);
        println!(
            "--- {} frames in {:.1}s ({:.1} Hz), last ts {} ---",
            n,
            start.elapsed().as_secs_f64(),
            n as f64 / start.elapsed().as_secs_f64(),
            counter.last_ns.load(Ordering::Relaxed)
        );
    }

    if let Err(e) = fs.stream_stop() {
        eprintln!("Error: {}", e);
    }
}
