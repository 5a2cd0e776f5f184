pub mod config;
pub mod error;
pub mod git;
pub mod graph;
pub mod models;
pub mod report;
pub mod store;
pub mod validate;
pub mod workflow;

pub use error::{Error, ErrorKind, Result};
