pub mod config;
pub mod mcp;
pub mod model;
pub mod pool;
pub mod server;
pub mod session;
pub mod transport;
