//! Storage configuration
//!
//! Options come from code (builder), a `file://` URI, a JSON file, and
//! finally `TRACK_STORAGE_*` environment overrides:
//!
//! ```rust
//! use std::time::Duration;
//! use track_store::config::StorageOptions;
//!
//! let options = StorageOptions::from_uri("file://runs/db.json?strict=false&timeout=5")?;
//! assert!(!options.is_strict());
//! assert_eq!(options.get_lock_timeout(), Duration::from_secs(5));
//! # Ok::<(), track_store::Error>(())
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::storage::lock_path_for;
use crate::{Error, Result};

/// URI scheme of the file-backed storage
pub const FILE_SCHEME: &str = "file://";

/// Environment variable overriding strict mode
pub const ENV_STRICT: &str = "TRACK_STORAGE_STRICT";
/// Environment variable overriding eager mode
pub const ENV_EAGER: &str = "TRACK_STORAGE_EAGER";
/// Environment variable overriding the lock timeout (seconds)
pub const ENV_LOCK_TIMEOUT: &str = "TRACK_STORAGE_LOCK_TIMEOUT";

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Construction parameters of a `FileStorage`
#[derive(Debug, Clone, PartialEq)]
pub struct StorageOptions {
    path: PathBuf,
    strict: bool,
    eager: bool,
    lock_timeout: Duration,
    poll_interval: Duration,
    signal_handlers: bool,
}

impl StorageOptions {
    /// Defaults: strict, eager, 30 s lock timeout, 10 ms polling, signal
    /// handlers on.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            strict: true,
            eager: true,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            signal_handlers: true,
        }
    }

    /// Reject orphaned parent references (default `true`)
    #[must_use]
    pub const fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Lock, reload and commit around every call (default `true`)
    #[must_use]
    pub const fn eager(mut self, eager: bool) -> Self {
        self.eager = eager;
        self
    }

    /// Give up acquiring the lock after this long
    #[must_use]
    pub const fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Delay between lock attempts
    #[must_use]
    pub const fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Install SIGINT / SIGTERM handlers on open (default `true`)
    #[must_use]
    pub const fn signal_handlers(mut self, enabled: bool) -> Self {
        self.signal_handlers = enabled;
        self
    }

    /// Database path
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Lock file path (`"{path}.lock"`)
    #[must_use]
    pub fn lock_path(&self) -> PathBuf {
        lock_path_for(&self.path)
    }

    /// Strict mode
    #[must_use]
    pub const fn is_strict(&self) -> bool {
        self.strict
    }

    /// Eager mode
    #[must_use]
    pub const fn is_eager(&self) -> bool {
        self.eager
    }

    /// Configured lock timeout
    #[must_use]
    pub const fn get_lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    /// Configured poll interval
    #[must_use]
    pub const fn get_poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Whether signal handlers are installed on open
    #[must_use]
    pub const fn installs_signal_handlers(&self) -> bool {
        self.signal_handlers
    }

    /// Parse `file://<path>?strict=..&eager=..&timeout=<secs>&poll_ms=..&signals=..`
    ///
    /// # Errors
    ///
    /// `Config` for other schemes, unknown keys or malformed values.
    pub fn from_uri(uri: &str) -> Result<Self> {
        let rest = uri
            .strip_prefix(FILE_SCHEME)
            .ok_or_else(|| Error::Config(format!("unsupported storage uri `{uri}`")))?;
        let (path, params) = rest.split_once('?').unwrap_or((rest, ""));
        if path.is_empty() {
            return Err(Error::Config(format!("storage uri `{uri}` has no path")));
        }

        let mut options = Self::new(path);
        for pair in params.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| Error::Config(format!("expected key=value, got `{pair}`")))?;
            options = match key {
                "strict" => options.strict(parse_bool(key, value)?),
                "eager" => options.eager(parse_bool(key, value)?),
                "timeout" => options.lock_timeout(parse_seconds(key, value)?),
                "poll_ms" => options.poll_interval(Duration::from_millis(parse_u64(key, value)?)),
                "signals" => options.signal_handlers(parse_bool(key, value)?),
                other => return Err(Error::Config(format!("unknown storage option `{other}`"))),
            };
        }
        Ok(options)
    }

    /// Parse a JSON options document.
    ///
    /// ```json
    /// {"path": "db.json", "strict": false, "lock_timeout_secs": 5, "poll_interval_ms": 20}
    /// ```
    ///
    /// # Errors
    ///
    /// `Json` for malformed documents, `Config` for invalid values.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let file: OptionsFile = serde_json::from_str(json)?;
        let mut options = Self::new(file.path)
            .strict(file.strict)
            .eager(file.eager)
            .signal_handlers(file.signal_handlers);
        if let Some(secs) = file.lock_timeout_secs {
            options = options.lock_timeout(seconds(secs).ok_or_else(|| {
                Error::Config(format!("lock_timeout_secs must be a non-negative number, got {secs}"))
            })?);
        }
        if let Some(ms) = file.poll_interval_ms {
            options = options.poll_interval(Duration::from_millis(ms));
        }
        Ok(options)
    }

    /// Read a JSON options file.
    ///
    /// # Errors
    ///
    /// `Io` if the file cannot be read, otherwise see [`from_json_str`](Self::from_json_str).
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_json_str(&std::fs::read_to_string(path)?)
    }

    /// Apply `TRACK_STORAGE_*` environment overrides.
    ///
    /// # Errors
    ///
    /// `Config` when a variable holds an unparsable value.
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup (the environment in
    /// production). Every override found is logged.
    ///
    /// # Errors
    ///
    /// `Config` when a value is unparsable.
    pub fn with_overrides_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(value) = lookup(ENV_STRICT) {
            warn!(key = ENV_STRICT, %value, "storage option overridden by environment");
            self.strict = parse_bool(ENV_STRICT, &value)?;
        }
        if let Some(value) = lookup(ENV_EAGER) {
            warn!(key = ENV_EAGER, %value, "storage option overridden by environment");
            self.eager = parse_bool(ENV_EAGER, &value)?;
        }
        if let Some(value) = lookup(ENV_LOCK_TIMEOUT) {
            warn!(key = ENV_LOCK_TIMEOUT, %value, "storage option overridden by environment");
            self.lock_timeout = parse_seconds(ENV_LOCK_TIMEOUT, &value)?;
        }
        Ok(self)
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct OptionsFile {
    path: PathBuf,
    #[serde(default = "enabled")]
    strict: bool,
    #[serde(default = "enabled")]
    eager: bool,
    #[serde(default = "enabled")]
    signal_handlers: bool,
    #[serde(default)]
    lock_timeout_secs: Option<f64>,
    #[serde(default)]
    poll_interval_ms: Option<u64>,
}

const fn enabled() -> bool {
    true
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::Config(format!("{key}: expected a boolean, got `{value}`"))),
    }
}

fn parse_u64(key: &str, value: &str) -> Result<u64> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("{key}: expected an integer, got `{value}`")))
}

fn parse_seconds(key: &str, value: &str) -> Result<Duration> {
    value
        .trim()
        .parse::<f64>()
        .ok()
        .and_then(seconds)
        .ok_or_else(|| Error::Config(format!("{key}: expected seconds, got `{value}`")))
}

fn seconds(secs: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(secs).ok()
}
