pub mod model;
pub mod translate;

pub use model::{DaemonEvent, NormalizedEvent};
pub use translate::translate;
