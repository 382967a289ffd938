pub mod config;
pub mod logger;
pub mod mcp;
pub mod transport;
