//! Library half of the `skyreel` maintenance tool

pub mod config;
pub mod service;

pub use config::{Cli, Command, ServiceConfig};
pub use service::{RecoverReport, Service};
