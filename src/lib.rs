pub mod api;
pub mod domain;
pub mod error;
pub mod loader;
pub mod logger;
pub mod server;
