pub mod config;
pub mod error;
pub mod package;
pub mod parser;
pub mod pipeline;
pub mod prompt;
pub mod retry;
pub mod shutdown;
pub mod store;
pub mod vision;
