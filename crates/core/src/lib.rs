pub mod collaborators;
pub mod config;
pub mod domain;
pub mod taxonomy;

pub use config::AppConfig;
pub use domain::*;
pub use taxonomy::FailReason;
