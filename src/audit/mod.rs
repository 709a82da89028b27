pub mod sink;
pub mod store;

pub use sink::AuditSink;
pub use store::SledAuditStore;
