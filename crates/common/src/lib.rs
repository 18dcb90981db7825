pub mod cameras;
pub mod events;
pub mod gallery;
pub mod jobs;
pub mod validation;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
