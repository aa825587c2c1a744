//! Tool-invocation protocol
//!
//! Line-delimited JSON requests and responses between a tool server and its
//! clients, over a child process's stdio or a TCP socket.

pub mod client;
pub mod framing;
pub mod lifecycle;
pub mod registry;
pub mod schema;
pub mod server;
pub mod tools;
pub mod transport;
pub mod types;
