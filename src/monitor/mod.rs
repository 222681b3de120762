pub mod traffic;

pub use traffic::{
    MonitorError, TrafficBaseline, TrafficMonitor, compute_delta, instance_tag, split_delta,
};
