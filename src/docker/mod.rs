//! Daemon-facing plumbing: environment descriptors and connections.

pub mod connector;
pub mod environment;
pub mod tunnel;

pub use connector::{BollardConnector, DaemonConnector, DaemonError, DaemonSession, RawEvent};
pub use environment::{Environment, EnvironmentStatus};
