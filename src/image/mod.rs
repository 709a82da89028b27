pub mod pull;

pub use pull::{open_pull, pull_image};
