pub mod config;
pub mod error;
pub mod problem;
pub mod types;
