use super::Job;
use crate::client::MasterClient;
use crate::manager::InstanceManager;
use crate::metrics::AgentMetrics;
use crate::monitor::TrafficMonitor;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const RULE_SYNC_DEADLINE: Duration = Duration::from_secs(10);
const REPORT_DEADLINE: Duration = Duration::from_secs(5);

/// 流量上报：次级定时器对齐计数规则，主定时器计算增量并上报
pub struct TrafficJob {
    client: Arc<MasterClient>,
    manager: Arc<InstanceManager>,
    monitor: Arc<TrafficMonitor>,
    rule_sync_interval: Duration,
    metrics: Option<Arc<AgentMetrics>>,
}

impl TrafficJob {
    pub fn new(
        client: Arc<MasterClient>,
        manager: Arc<InstanceManager>,
        monitor: Arc<TrafficMonitor>,
        rule_sync_interval: Duration,
    ) -> Self {
        Self {
            client,
            manager,
            monitor,
            rule_sync_interval,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<AgentMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    async fn sync_rules(&self) -> Result<(), String> {
        let instances = self.manager.instances().await;
        self.monitor
            .ensure_chain()
            .await
            .map_err(|e| e.to_string())?;
        self.monitor
            .sync_rules(&instances)
            .await
            .map_err(|e| e.to_string())
    }
}

#[async_trait]
impl Job for TrafficJob {
    async fn run(&self) {
        let instances = self.manager.instances().await;
        let traffic = match self.monitor.update_traffic(&instances).await {
            Ok(traffic) => traffic,
            Err(e) => {
                warn!("Failed to read traffic counters: {}", e);
                return;
            }
        };
        if traffic.is_empty() {
            debug!("No traffic to report");
            return;
        }

        let result =
            match tokio::time::timeout(REPORT_DEADLINE, self.client.report_traffic(&traffic)).await
            {
                Ok(result) => result.map_err(|e| e.to_string()),
                Err(_) => Err(format!("timed out after {:?}", REPORT_DEADLINE)),
            };

        if let Some(metrics) = &self.metrics {
            metrics.record_report("traffic", result.is_ok());
        }
        match result {
            Ok(()) => {
                let upload: u64 = traffic.iter().map(|t| t.bytes_upload).sum();
                let download: u64 = traffic.iter().map(|t| t.bytes_download).sum();
                if let Some(metrics) = &self.metrics {
                    metrics.record_traffic(upload, download);
                }
                info!(
                    "Reported traffic for {} instance(s): upload={} download={}",
                    traffic.len(),
                    upload,
                    download
                );
            }
            Err(e) => warn!("Failed to report traffic: {}", e),
        }
    }

    fn secondary_interval(&self) -> Option<Duration> {
        Some(self.rule_sync_interval)
    }

    async fn run_secondary(&self) {
        match tokio::time::timeout(RULE_SYNC_DEADLINE, self.sync_rules()).await {
            Ok(Ok(())) => debug!("Traffic rules in sync"),
            Ok(Err(e)) => warn!("Failed to sync traffic rules: {}", e),
            Err(_) => warn!("Traffic rule sync timed out after {:?}", RULE_SYNC_DEADLINE),
        }
    }
}
