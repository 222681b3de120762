use super::Job;
use crate::client::{InstanceStatusReport, MasterClient};
use crate::manager::InstanceManager;
use crate::metrics::AgentMetrics;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

/// 配置同步：拉取期望状态，对账，再上报实例状态
pub struct SyncJob {
    client: Arc<MasterClient>,
    manager: Arc<InstanceManager>,
    metrics: Option<Arc<AgentMetrics>>,
}

impl SyncJob {
    pub fn new(client: Arc<MasterClient>, manager: Arc<InstanceManager>) -> Self {
        Self {
            client,
            manager,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<AgentMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    async fn report_status(&self) {
        let statuses: Vec<InstanceStatusReport> = self
            .manager
            .statuses()
            .await
            .into_iter()
            .map(|(instance_id, status)| InstanceStatusReport {
                instance_id,
                status: status.code(),
            })
            .collect();

        let result = self.client.report_status(&statuses).await;
        if let Some(metrics) = &self.metrics {
            metrics.record_report("status", result.is_ok());
        }
        match result {
            Ok(()) => debug!("Reported status of {} instance(s)", statuses.len()),
            Err(e) => warn!("Failed to report instance status: {}", e),
        }
    }
}

#[async_trait]
impl Job for SyncJob {
    async fn run(&self) {
        let remote = match self.client.fetch_config().await {
            Ok(remote) => remote,
            Err(e) => {
                warn!("Failed to fetch config from master: {}", e);
                if let Some(metrics) = &self.metrics {
                    metrics.record_sync(false);
                }
                return;
            }
        };

        let report = self.manager.sync(&remote).await;
        debug!("Config sync with {} remote instance(s): {}", remote.len(), report);
        if let Some(metrics) = &self.metrics {
            metrics.record_sync(report.failed == 0);
        }

        self.report_status().await;
    }
}
