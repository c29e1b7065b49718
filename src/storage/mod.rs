//! File-backed, multi-process safe storage
//!
//! Layers, bottom-up:
//!
//! - [`LocalStorage`]: process-private entity index, load / commit / merge
//! - [`FileLock`]: advisory lock on `"{path}.lock"` with a bounded wait
//! - [`FileStorage`]: the [`Protocol`] over both, with reload-before /
//!   commit-after discipline per outermost call
//! - [`ProtocolMultiplexer`]: the same calls fanned out over several backends
//!
//! Toyota Way Principles:
//! - Poka-Yoke: atomic rename, a half-written database is never visible
//! - Jidoka: a lock that cannot be acquired stops the line with
//!   `ConcurrencyTimeout` instead of hanging

mod file;
mod local;
mod lock;
mod multiplexer;
mod protocol;
#[cfg(feature = "tokio")]
mod signals;

pub use file::{FileStorage, END_TIME_KEY, START_TIME_KEY};
pub use local::{Entity, LocalStorage, StagedCommit};
pub use lock::{is_held, lock_path_for, release_held_locks, FileLock};
pub use multiplexer::ProtocolMultiplexer;
pub use protocol::{GroupUpdate, Protocol, TrialUpdate};
#[cfg(feature = "tokio")]
pub use signals::{install_signal_handlers, signal_handlers_installed};
