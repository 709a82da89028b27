pub mod environment;
pub mod events;
pub mod image;
pub mod public;
