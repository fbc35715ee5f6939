pub mod config;

pub use config::{AppConfig, expand_home};
