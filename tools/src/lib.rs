pub mod config;
pub mod experiment;
pub mod logging;

pub use config::ExperimentConfig;
pub use logging::init_tracing;
