//! Runtime configuration
//!
//! Settings come from defaults and the process environment only; there is no
//! configuration file.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use tracing::{debug, warn};

/// Default time a committed buffer may stay busy before it is replaced
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(2);

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Socket name under the runtime directory; `None` uses the default
    /// resolution (`WAYLAND_SOCKET`, `WAYLAND_DISPLAY`, then `wayland-0`)
    pub display: Option<String>,

    /// Directory for shared-memory backing files (`XDG_RUNTIME_DIR`)
    pub runtime_dir: Option<PathBuf>,

    /// Turn SIGINT into a loop break
    pub handle_interrupt: bool,

    /// Stalled-buffer timeout; `None` waits for the release forever
    pub busy_timeout: Option<Duration>,

    /// Top-level title
    pub title: String,

    /// Top-level application id
    pub app_id: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            display: None,
            runtime_dir: None,
            handle_interrupt: true,
            busy_timeout: Some(DEFAULT_BUSY_TIMEOUT),
            title: "waykit".to_string(),
            app_id: "waykit".to_string(),
        }
    }
}

impl Config {
    /// Defaults overridden by the environment
    pub fn from_env() -> Self {
        let mut config = Self {
            runtime_dir: env::var_os("XDG_RUNTIME_DIR").map(PathBuf::from),
            ..Self::default()
        };

        if let Ok(ms) = env::var("WAYKIT_BUSY_TIMEOUT_MS") {
            config.busy_timeout = parse_busy_timeout(&ms).unwrap_or_else(|| {
                warn!("Ignoring invalid WAYKIT_BUSY_TIMEOUT_MS={:?}", ms);
                Some(DEFAULT_BUSY_TIMEOUT)
            });
        }

        debug!("Config: {:?}", config);
        config
    }

    pub fn with_display(mut self, display: impl Into<String>) -> Self {
        self.display = Some(display.into());
        self
    }

    pub fn with_runtime_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.runtime_dir = Some(dir.into());
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn with_app_id(mut self, app_id: impl Into<String>) -> Self {
        self.app_id = app_id.into();
        self
    }
}

/// `0` disables the timeout
fn parse_busy_timeout(value: &str) -> Option<Option<Duration>> {
    let ms: u64 = value.trim().parse().ok()?;
    if ms == 0 {
        Some(None)
    } else {
        Some(Some(Duration::from_millis(ms)))
    }
}
