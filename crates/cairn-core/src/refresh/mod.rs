//! Initial load, change detection and background refresh.

pub mod background;
pub mod errors;
pub mod orchestrator;

pub use background::spawn_refresh_loop;
pub use errors::ProviderError;
pub use orchestrator::{LoadOptions, RefreshOrchestrator, RefreshPhase, RefreshReport, DEFAULT_STARTUP_TIMEOUT};
