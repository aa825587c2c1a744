//! toolwire
//!
//! A line-delimited JSON protocol for discovering and invoking tools that live
//! in a separate process, reached over stdio or TCP.

pub mod config;
pub mod error;
pub mod mcp;

pub use config::Config;
pub use error::{Result, ToolwireError};
