//!
//! Logging setup for markercal's tools
//!

use tracing_subscriber::{
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
    EnvFilter, Layer,
};

/// Used when neither `RUST_LOG` nor a configured filter is present
const DEFAULT_FILTER: &str = "info";

/// Builder for the global [`tracing`] subscriber
#[derive(Default, Debug)]
pub struct Logger {
    filter: Option<String>,
}
impl Logger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configures the [`Logger`] to filter events.
    ///
    /// This uses the [`EnvFilter`] directive syntax. `RUST_LOG` still takes precedence when
    /// it is set.
    #[inline]
    pub fn with_filter(mut self, filter: impl AsRef<str>) -> Self {
        self.filter = Some(filter.as_ref().to_owned());
        self
    }

    fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(self.filter.as_deref().unwrap_or(DEFAULT_FILTER)))
    }

    /// Sets the formatted output as global subscriber.
    pub fn init(self) -> Result<(), TryInitError> {
        let layer = tracing_subscriber::fmt::layer().with_filter(self.env_filter());
        tracing_subscriber::registry().with(layer).try_init()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_fails() {
        let _ = Logger::new().with_filter("debug").init();
        assert!(Logger::new().init().is_err());
    }
}
