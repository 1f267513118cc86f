use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::{fs, path::Path};

use crate::error::*;

macro_rules! def_cfg {
    ($(
        $(#[$smeta:meta])*
        $struct_ident:ident {
            $(
            $(#[$meta:meta])*
            $ident:ident : $ty:ty ,
            )*
        }
    )*) => {
       $(
           #[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
           $(#[$smeta])*
           pub struct $struct_ident {
               $(
                $(#[$meta])*
                pub $ident: $ty,
               )*
           }
       )*
    };
}

def_cfg! {
    Config {
        /// Tracing filter directives, used when `RUST_LOG` is unset
        log_filter: Option<String>,
        #[serde(default)]
        camera: CameraCfg,
        #[serde(default)]
        board: BoardCfg,
        #[serde(default)]
        engine: EngineCfg,
        #[serde(default)]
        solver: SolverCfg,
        replay: Option<ReplayCfg>,
    }
    #[serde(default)]
    CameraCfg {
        width: u32,
        height: u32,
        /// Known calibration as JSON, used as a warm start
        prior: Option<String>,
    }
    #[serde(default)]
    BoardCfg {
        /// Physical edge length of one marker, in meters
        marker_size: f64,
        /// Board file; the built-in board is used when unset
        path: Option<String>,
    }
    #[serde(default)]
    EngineCfg {
        tick_ms: u64,
        min_views: usize,
        min_markers: usize,
    }
    #[serde(default)]
    SolverCfg {
        max_iterations: usize,
        ftol: f64,
        xtol: f64,
        gtol: f64,
    }
    ReplayCfg {
        /// JSON lines file with one marker observation per line
        detections: String,
        output: Option<String>,
    }
}

impl Config {
    /// Load the configuration from the specified path
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let buf = fs::read_to_string(path).context(FailedToReadConfigSnafu { path })?;
        let cfg = toml::from_str(&buf).context(InvalidConfigSnafu)?;
        debug!("loaded config from {}", path.display());

        Ok(cfg)
    }

    /// Save the configuration to the specified path
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        let path = path.as_ref();
        let toml_cfg = toml::to_string_pretty(&self).context(FailedToSerializeConfigSnafu)?;
        fs::write(path, toml_cfg).context(FailedToWriteSnafu { path })?;

        Ok(())
    }
}
impl Default for Config {
    fn default() -> Self {
        Self {
            log_filter: None,
            camera: CameraCfg::default(),
            board: BoardCfg::default(),
            engine: EngineCfg::default(),
            solver: SolverCfg::default(),
            replay: None,
        }
    }
}
impl Default for CameraCfg {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            prior: None,
        }
    }
}
impl Default for BoardCfg {
    fn default() -> Self {
        Self {
            marker_size: 0.04,
            path: None,
        }
    }
}
impl Default for EngineCfg {
    fn default() -> Self {
        Self {
            tick_ms: 100,
            min_views: 4,
            min_markers: 3,
        }
    }
}
impl Default for SolverCfg {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            ftol: 1e-10,
            xtol: 1e-10,
            gtol: 1e-10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_falls_back_to_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            [camera]
            width = 640
            height = 480

            [board]
            marker_size = 0.025
            "#,
        )
        .unwrap();

        assert_eq!(cfg.camera.width, 640);
        assert_eq!(cfg.camera.height, 480);
        assert_eq!(cfg.camera.prior, None);
        assert_eq!(cfg.board.marker_size, 0.025);
        assert_eq!(cfg.engine, EngineCfg::default());
        assert_eq!(cfg.solver, SolverCfg::default());
        assert!(cfg.replay.is_none());
    }

    #[test]
    fn save_then_load() {
        let path = std::env::temp_dir().join(format!("markercal-cfg-{}.toml", std::process::id()));
        let mut cfg = Config::default();
        cfg.log_filter = Some("debug".to_owned());
        cfg.replay = Some(ReplayCfg {
            detections: "frames.jsonl".to_owned(),
            output: None,
        });

        cfg.save(&path).unwrap();
        let loaded = Config::load(&path).unwrap();
        let _ = fs::remove_file(&path);

        assert_eq!(loaded, cfg);
    }

    #[test]
    fn garbage_is_rejected() {
        let err = toml::from_str::<Config>("camera = 3").unwrap_err();
        assert!(!err.to_string().is_empty());
    }
}
