//! Server module
//!
//! Configuration, logging and the HTTP/WebSocket server around the
//! orchestration core.

pub mod config;
mod init;
pub mod loader;
pub mod logging;

pub use config::AppConfig;
pub use init::{build_router, run};
pub use loader::load_config;
pub use logging::init_logging;
