//! Structured logging bootstrap
//!
//! The library only emits `tracing` events. Binaries and demos call
//! [`init_tracing`] once; the filter comes from `TRACK_LOG` (same syntax as
//! `RUST_LOG`), falling back to the given default directive.
//!
//! Several worker processes usually share one terminal, so every line
//! carries the process id next to the timestamp, plus the thread name.

use std::fmt;

use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::EnvFilter;

/// Environment variable holding the log filter
pub const ENV_LOG: &str = "TRACK_LOG";

/// Install a global `fmt` subscriber.
///
/// Returns `false` if a subscriber was already installed (for example by a
/// test harness); the existing one is kept.
pub fn init_tracing(default_directive: &str) -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(filter(std::env::var(ENV_LOG).ok().as_deref(), default_directive))
        .with_timer(PidTimer)
        .with_thread_names(true)
        .with_target(true)
        .try_init()
        .is_ok()
}

/// UTC timestamp followed by `[pid]`
struct PidTimer;

impl FormatTime for PidTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> fmt::Result {
        write!(
            w,
            "{} [{}]",
            chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.6fZ"),
            std::process::id()
        )
    }
}

fn filter(configured: Option<&str>, default_directive: &str) -> EnvFilter {
    configured
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new(default_directive))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_falls_back_on_garbage() {
        let fallback = filter(Some("track_store=loudly"), "warn");
        assert_eq!(fallback.to_string(), "warn");

        let configured = filter(Some("track_store=debug"), "warn");
        assert_eq!(configured.to_string(), "track_store=debug");
    }

    #[test]
    fn test_timer_stamps_pid() {
        let mut line = String::new();
        PidTimer.format_time(&mut Writer::new(&mut line)).unwrap();
        assert!(line.ends_with(&format!("[{}]", std::process::id())));
    }

    #[test]
    fn test_second_init_is_rejected() {
        let _ = init_tracing("info");
        assert!(!init_tracing("info"));
    }
}
