use super::Job;
use crate::client::{HeartbeatRequest, MasterClient};
use crate::manager::InstanceManager;
use crate::metrics::AgentMetrics;
use crate::monitoring::{SystemMonitor, SystemUsage};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const HEARTBEAT_DEADLINE: Duration = Duration::from_secs(5);

/// 心跳：上报主机负载与运行中的实例数
pub struct HeartbeatJob {
    client: Arc<MasterClient>,
    manager: Arc<InstanceManager>,
    system: SystemMonitor,
    version: String,
    metrics: Option<Arc<AgentMetrics>>,
}

impl HeartbeatJob {
    pub fn new(
        client: Arc<MasterClient>,
        manager: Arc<InstanceManager>,
        system: SystemMonitor,
        version: impl Into<String>,
    ) -> Self {
        Self {
            client,
            manager,
            system,
            version: version.into(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<AgentMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    async fn build_request(&self) -> HeartbeatRequest {
        let usage = match self.system.sample().await {
            Ok(usage) => usage,
            Err(e) => {
                warn!("Failed to sample system usage: {:#}", e);
                SystemUsage::default()
            }
        };
        if let Some(metrics) = &self.metrics {
            metrics.set_system_usage(usage.cpu_percent as f64, usage.memory_percent as f64);
        }

        HeartbeatRequest {
            cpu_usage: usage.cpu_u8(),
            memory_usage: usage.memory_u8(),
            instance_count: self.manager.live_running_count().await,
            version: self.version.clone(),
        }
    }
}

#[async_trait]
impl Job for HeartbeatJob {
    async fn run(&self) {
        let request = self.build_request().await;

        let result =
            match tokio::time::timeout(HEARTBEAT_DEADLINE, self.client.report_heartbeat(&request))
                .await
            {
                Ok(result) => result.map_err(|e| e.to_string()),
                Err(_) => Err(format!("timed out after {:?}", HEARTBEAT_DEADLINE)),
            };

        if let Some(metrics) = &self.metrics {
            metrics.record_report("heartbeat", result.is_ok());
        }
        match result {
            Ok(()) => debug!(
                "Heartbeat sent: cpu={}% mem={}% instances={}",
                request.cpu_usage, request.memory_usage, request.instance_count
            ),
            Err(e) => warn!("Failed to send heartbeat: {}", e),
        }
    }
}
