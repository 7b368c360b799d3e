pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod ingest;
pub mod models;
pub mod protocols;
pub mod queue;
pub mod reader;
pub mod reassembly;
pub mod recorder;
pub mod shutdown;
pub mod store;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
