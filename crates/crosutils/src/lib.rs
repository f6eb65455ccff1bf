pub mod config;
pub mod error;
pub mod executor;
pub mod layout;
pub mod log_sanitize;
pub mod modules;

pub use error::{Error, ErrorKind, Result};
