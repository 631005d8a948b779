//! Compose file support
//!
//! Reads compose-style YAML documents and loads them into a
//! [`ServiceRegistry`](crate::service::ServiceRegistry).

pub mod config;
pub mod parser;

pub use config::{ComposeConfig, ServiceConfig};
pub use parser::{parse_duration, ComposeParser, LoadedProject};
