pub mod logger;
pub mod system;

pub use logger::setup_logging;
pub use system::{SystemMonitor, SystemUsage};
