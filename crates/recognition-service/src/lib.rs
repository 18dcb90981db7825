pub mod api;
pub mod config;
pub mod hub;
pub mod jobs;
pub mod matching;
pub mod media;
pub mod quality;
pub mod recognizer;
pub mod registry;
pub mod source;
pub mod state;
pub mod store;
pub mod worker;

pub use config::ServiceConfig;
pub use registry::CameraRegistry;
pub use state::AppState;
