//! SIGINT / SIGTERM handling
//!
//! A killed worker must not leave its lock artifact behind. The handler runs
//! on a dedicated thread driving a current-thread tokio runtime; on the first
//! signal it removes every held lock artifact and exits with `128 + signo`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread;

use tracing::{info, warn};

use super::lock::release_held_locks;
use crate::{Error, Result};

static INSTALLED: AtomicBool = AtomicBool::new(false);

const SIGINT: i32 = 2;
const SIGTERM: i32 = 15;

/// Install the handlers once per process. Later calls are no-ops.
///
/// Returns after the handlers are registered, so a signal delivered after
/// this call is always seen.
///
/// # Errors
///
/// `Io` if the runtime or the handler thread cannot be created.
pub fn install_signal_handlers() -> Result<()> {
    if INSTALLED.swap(true, Ordering::SeqCst) {
        return Ok(());
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .inspect_err(|_| INSTALLED.store(false, Ordering::SeqCst))?;
    let (ready_tx, ready_rx) = mpsc::channel::<std::io::Result<()>>();

    thread::Builder::new()
        .name("track-store-signals".to_string())
        .spawn(move || runtime.block_on(wait_for_signal(ready_tx)))
        .inspect_err(|_| INSTALLED.store(false, Ordering::SeqCst))?;

    match ready_rx.recv() {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => {
            INSTALLED.store(false, Ordering::SeqCst);
            Err(err.into())
        }
        Err(_) => {
            INSTALLED.store(false, Ordering::SeqCst);
            Err(Error::Config("signal handler thread exited early".to_string()))
        }
    }
}

/// True once the handlers are installed
#[must_use]
pub fn signal_handlers_installed() -> bool {
    INSTALLED.load(Ordering::SeqCst)
}

#[cfg(unix)]
async fn wait_for_signal(ready: mpsc::Sender<std::io::Result<()>>) {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut interrupt, mut terminate) = match (
        signal(SignalKind::interrupt()),
        signal(SignalKind::terminate()),
    ) {
        (Ok(interrupt), Ok(terminate)) => (interrupt, terminate),
        (Err(err), _) | (_, Err(err)) => {
            warn!(error = %err, "signal handler registration failed");
            let _ = ready.send(Err(err));
            return;
        }
    };
    let _ = ready.send(Ok(()));

    let signo = tokio::select! {
        _ = interrupt.recv() => SIGINT,
        _ = terminate.recv() => SIGTERM,
    };
    shutdown(signo);
}

#[cfg(not(unix))]
async fn wait_for_signal(ready: mpsc::Sender<std::io::Result<()>>) {
    let _ = ready.send(Ok(()));
    match tokio::signal::ctrl_c().await {
        Ok(()) => shutdown(SIGINT),
        Err(err) => warn!(error = %err, "ctrl-c handler failed"),
    }
}

fn shutdown(signo: i32) -> ! {
    let removed = release_held_locks();
    if removed > 0 {
        warn!(signo, removed, "released database locks on signal");
    } else {
        info!(signo, "terminating on signal");
    }
    std::process::exit(128 + signo)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_install_is_idempotent() {
        install_signal_handlers().unwrap();
        install_signal_handlers().unwrap();
        assert!(signal_handlers_installed());
    }
}
