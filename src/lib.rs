pub mod archive;
pub mod config;
pub mod error;
pub mod fetch;
pub mod logging;
pub mod pipeline;
pub mod scheduler;
pub mod server;
pub mod staging;
