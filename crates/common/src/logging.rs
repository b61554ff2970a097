//! Logging setup and configuration
//!
//! The filter sits behind a reload layer so the debug level can be changed
//! while the driver runs.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing_subscriber::{EnvFilter, Registry, fmt, prelude::*, reload};

/// Maps a numeric debug level onto a filter directive
pub fn level_directive(level: u32) -> &'static str {
    match level {
        0 => "off",
        1 => "error",
        2 => "warn",
        3 => "info",
        4 => "debug",
        _ => "trace",
    }
}

/// Handle for changing the active log level at runtime
#[derive(Clone)]
pub struct LogLevelHandle {
    reload: Option<reload::Handle<EnvFilter, Registry>>,
    level: Arc<AtomicU32>,
}

impl LogLevelHandle {
    /// A handle not attached to any subscriber; only records the level
    pub fn detached(level: u32) -> Self {
        Self {
            reload: None,
            level: Arc::new(AtomicU32::new(level)),
        }
    }

    pub fn level(&self) -> u32 {
        self.level.load(Ordering::Relaxed)
    }

    pub fn set_level(&self, level: u32) -> crate::Result<()> {
        if let Some(handle) = &self.reload {
            let filter = EnvFilter::try_new(level_directive(level))
                .map_err(|e| crate::Error::Config(format!("Invalid log filter: {}", e)))?;
            handle
                .reload(filter)
                .map_err(|e| crate::Error::Config(format!("Failed to reload filter: {}", e)))?;
        }
        self.level.store(level, Ordering::Relaxed);
        Ok(())
    }
}

impl std::fmt::Debug for LogLevelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogLevelHandle")
            .field("level", &self.level())
            .field("attached", &self.reload.is_some())
            .finish()
    }
}

/// Setup tracing subscriber for the application
pub fn setup_logging(default_level: &str) -> crate::Result<LogLevelHandle> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .map_err(|e| crate::Error::Config(format!("Invalid log filter: {}", e)))?;

    let (filter, handle) = reload::Layer::new(filter);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init()
        .map_err(|e| crate::Error::Config(format!("Logging already initialised: {}", e)))?;

    Ok(LogLevelHandle {
        reload: Some(handle),
        level: Arc::new(AtomicU32::new(numeric_level(default_level))),
    })
}

fn numeric_level(directive: &str) -> u32 {
    match directive.to_ascii_lowercase().as_str() {
        "off" => 0,
        "error" => 1,
        "warn" => 2,
        "info" => 3,
        "debug" => 4,
        "trace" => 5,
        _ => 3,
    }
}
