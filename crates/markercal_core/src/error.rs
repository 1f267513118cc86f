use snafu::prelude::*;
use std::path::PathBuf;

/// markercal's configuration-time error type
///
/// Everything here is fatal for the operation that produced it: a session that fails to
/// configure never starts its worker.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("Failed to read config {}: {source}", path.display()))]
    FailedToReadConfig {
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("Invalid config: {source}"))]
    InvalidConfig { source: toml::de::Error },
    #[snafu(display("Failed to serialize config: {source}"))]
    FailedToSerializeConfig { source: toml::ser::Error },
    #[snafu(display("Failed to write {}: {source}", path.display()))]
    FailedToWrite {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Invalid image size: {width}x{height}"))]
    InvalidImageSize { width: u32, height: u32 },
    #[snafu(display("Invalid marker size: {size}"))]
    InvalidMarkerSize { size: f64 },
    #[snafu(display("Invalid threshold: {name} = {value}"))]
    InvalidThreshold { name: &'static str, value: usize },

    #[snafu(display("Failed to read board {}: {source}", path.display()))]
    FailedToReadBoard {
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("Invalid board: {reason}"))]
    InvalidBoard { reason: String },
    #[snafu(display("Duplicate marker in board: {id}"))]
    DuplicateMarker { id: u32 },

    #[snafu(display("Invalid prior calibration: {reason}"))]
    InvalidPrior { reason: String },

    #[snafu(display("Failed to spawn calibration worker: {source}"))]
    FailedToSpawnWorker { source: std::io::Error },
}
