use std::env;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use v4lcap::session::{Config, Session};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let mut config = Config::default();
    if let Some(path) = env::args().nth(1) {
        config = config.path(path);
    }
    println!("Using device: {}\n", config.path.display());

    // Capture 30 frames by default
    let count = 30;

    let mut session = Session::open(&config)?;
    println!("Capabilities:\n{}", session.capabilities());
    println!("Active format:\n{}", session.format());

    let running = AtomicBool::new(true);
    let mut bytes = 0;
    let mut seen = 0;
    let start = Instant::now();
    let frames = session.capture(&running, |frame| {
        let meta = frame.meta();
        println!("Buffer");
        println!("  index     : {}", meta.index);
        println!("  sequence  : {}", meta.sequence);
        println!("  timestamp : {}", meta.timestamp);
        println!("  flags     : {}", meta.flags);
        println!("  length    : {}", frame.len());

        bytes += frame.len();
        seen += 1;
        if seen == count {
            running.store(false, Ordering::Relaxed);
        }
    })?;
    let elapsed = start.elapsed().as_secs_f64();

    println!();
    println!("FPS: {}", frames as f64 / elapsed);
    println!("MB/s: {}", bytes as f64 / 1_048_576.0 / elapsed);

    session.close()?;
    Ok(())
}
