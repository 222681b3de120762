pub mod agent;
pub mod client;
pub mod config;
pub mod exec;
pub mod installer;
pub mod manager;
pub mod metrics;
pub mod monitor;
pub mod monitoring;
pub mod scheduler;
pub mod shutdown;

pub use agent::Agent;
pub use client::MasterClient;
pub use config::Settings;
pub use installer::Installer;
pub use manager::{Instance, InstanceManager, InstanceStatus};
pub use metrics::AgentMetrics;
pub use monitor::TrafficMonitor;
pub use scheduler::Scheduler;
