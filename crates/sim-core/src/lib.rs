pub mod aggregate;
pub mod config;
pub mod launch;
pub mod record;
pub mod types;

pub use config::Config;
pub use launch::LaunchSpec;
pub use types::*;
