//!
//! # markercal core
//!
//! Common data structures and utilities shared by the calibration engine and its tools:
//! the error type, the on-disk configuration, and a prelude of the locking and logging
//! primitives everything else is written against.
//!

#![forbid(unsafe_code)]

#[macro_use]
pub extern crate tracing;
pub extern crate parking_lot;
pub extern crate toml;

pub mod config;
mod error;

pub use error::Error;

pub mod prelude {
    pub use super::parking_lot::{self, Mutex, MutexGuard, RwLock};
    pub use super::tracing::{self, debug, error, info, instrument, trace, warn, Instrument};

    pub use super::config::{self, Config};
    pub use super::error::*;
}
