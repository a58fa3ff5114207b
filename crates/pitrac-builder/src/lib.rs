pub mod artifacts;
pub mod builder;
pub mod cache;
pub mod config;
pub mod dirty;
pub mod error;
pub mod executor;
pub mod fingerprint;
pub mod packages;
pub mod pipeline;
pub mod planner;
pub mod workspace;

pub use error::{Error, Result};
