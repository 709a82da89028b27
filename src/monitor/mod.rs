//! Daemon monitoring: one watcher per environment, the registry that owns them
//! and the status board fed by their output.

pub mod notifier;
pub mod registry;
pub mod status;
pub mod watcher;

pub use notifier::DaemonNotifier;
pub use registry::WatcherRegistry;
pub use status::StatusBoard;
pub use watcher::{WatcherSettings, WatcherState};
