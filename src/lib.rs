pub mod cli;
pub mod internal;

// Re-export commonly used types
pub use internal::config::config::AppConfig;
pub use internal::transport::{ServerSpec, TransportError, TransportManager};
