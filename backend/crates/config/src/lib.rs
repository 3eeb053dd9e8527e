pub mod env;
pub mod tracing_init;

pub use env::{AppConfig, BitrixConfig, CompanyMapping, SourceDbConfig, SyncSettings};
pub use tracing_init::init_tracing;
