//!
//! # markercal replay
//!
//! Feeds recorded marker detections through a calibration session and writes out the
//! resulting intrinsics.
//!

#[macro_use]
extern crate tracing;

use markercal::{logger::Logger, CalibrationSession, MarkerObservation, SessionSettings};
use markercal_core::prelude::*;
use mimalloc::MiMalloc;
use std::{
    error::Error,
    fs::{self, File},
    io::{BufRead, BufReader},
    path::{Path, PathBuf},
};

// mimalloc is an excellent general purpose allocator
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// First existing config file, unless one is given on the command line
fn config_path() -> PathBuf {
    if let Some(arg) = std::env::args_os().nth(1) {
        return arg.into();
    }

    let mut path = Path::new("/etc/markercal.toml");
    if !path.exists() {
        path = Path::new("./markercal.toml");
    }
    path.to_owned()
}

fn main() -> Result<(), Box<dyn Error>> {
    let path = config_path();
    // If all else fails, we'll just use a default configuration
    let cfg = Config::load(&path).unwrap_or_default();

    let mut logger = Logger::new();
    if let Some(filter) = &cfg.log_filter {
        logger = logger.with_filter(filter);
    }
    logger.init()?;
    trace!("using config from '{path:?}'");

    let Some(replay) = cfg.replay.clone() else {
        error!("no [replay] section in the config, nothing to do");
        return Ok(());
    };

    let settings = SessionSettings::from_config(&cfg)?;
    let session = CalibrationSession::new(settings)?;

    let reader = BufReader::new(File::open(&replay.detections)?);
    let (mut frames, mut accepted) = (0usize, 0usize);
    for (lineno, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<MarkerObservation>(&line) {
            Ok(obs) => {
                frames += 1;
                if session.submit_view(&obs) {
                    accepted += 1;
                }
            }
            Err(err) => warn!("skipping line {}: {err}", lineno + 1),
        }
    }
    info!("submitted {frames} frames, {accepted} accepted");

    session.wait_idle();
    session.stop();
    info!("{}", session.status());

    let snapshot = session.snapshot();
    if !snapshot.valid {
        warn!("no valid calibration");
    }
    let json = serde_json::to_string_pretty(&snapshot.intrinsics)?;
    match &replay.output {
        Some(out) => {
            fs::write(out, json)?;
            info!("wrote intrinsics to {out}");
        }
        None => println!("{json}"),
    }

    Ok(())
}
