//! Shared data model, configuration, and error types for the Remote Shuffle
//! Service. Every other `rss-*` crate depends on this one.

pub mod config;
pub mod error;
pub mod framing;
pub mod model;

pub use config::RssConfig;
pub use error::{ErrorKind, RssError};
