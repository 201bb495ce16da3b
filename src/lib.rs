pub mod capture;
pub mod cli;
pub mod config;
pub mod error;
pub mod k8s;

pub use error::{Result, SnapError};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
