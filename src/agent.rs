use crate::client::{ClientConfig, MasterClient};
use crate::config::Settings;
use crate::exec::{CommandRunner, SystemRunner};
use crate::installer::Installer;
use crate::manager::{InstanceManager, build_backend};
use crate::metrics::{self, AgentMetrics};
use crate::monitor::TrafficMonitor;
use crate::monitoring::SystemMonitor;
use crate::scheduler::{
    DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_RULE_SYNC_INTERVAL, DEFAULT_SYNC_INTERVAL,
    DEFAULT_TRAFFIC_INTERVAL, HeartbeatJob, Scheduler, SyncJob, TrafficJob, interval_or_default,
};
use crate::shutdown::{GracefulShutdown, ShutdownSignal};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Agent 组合根：创建各组件并管理启动与关机顺序
pub struct Agent {
    settings: Settings,
    manager: Arc<InstanceManager>,
    installer: Installer,
    metrics: Arc<AgentMetrics>,
    shutdown: GracefulShutdown,
    sync: Scheduler,
    heartbeat: Scheduler,
    traffic: Option<Scheduler>,
}

impl Agent {
    pub fn new(settings: Settings, version: &str) -> Result<Self> {
        Self::with_runner(settings, version, Arc::new(SystemRunner))
    }

    pub fn with_runner(
        settings: Settings,
        version: &str,
        runner: Arc<dyn CommandRunner>,
    ) -> Result<Self> {
        let agent = &settings.agent;
        let monitor_config = &settings.monitor;

        let metrics = Arc::new(AgentMetrics::new().context("Failed to create metrics registry")?);
        let client = Arc::new(
            MasterClient::new(ClientConfig::from_agent(agent))
                .context("Failed to create master client")?,
        );

        let backend = build_backend(agent, runner.clone());
        let manager = Arc::new(
            InstanceManager::new(agent.instance_dir.clone(), backend)
                .with_restart_delay(Duration::from_millis(agent.restart_delay_ms))
                .with_metrics(metrics.clone()),
        );
        let installer = Installer::new(client.clone(), runner.clone(), agent.snell_binary.clone());

        let sync = Scheduler::new(
            "config-sync",
            interval_or_default(agent.config_sync_interval, DEFAULT_SYNC_INTERVAL),
            Arc::new(SyncJob::new(client.clone(), manager.clone()).with_metrics(metrics.clone())),
        );

        let heartbeat = Scheduler::new(
            "heartbeat",
            interval_or_default(agent.heartbeat_interval, DEFAULT_HEARTBEAT_INTERVAL),
            Arc::new(
                HeartbeatJob::new(
                    client.clone(),
                    manager.clone(),
                    SystemMonitor::new(monitor_config.enable_cpu, monitor_config.enable_memory),
                    version,
                )
                .with_metrics(metrics.clone()),
            ),
        );

        let traffic = monitor_config.enable_traffic.then(|| {
            let monitor = Arc::new(TrafficMonitor::new(monitor_config, runner.clone()));
            let rule_sync = interval_or_default(
                monitor_config.rule_sync_interval as i64,
                DEFAULT_RULE_SYNC_INTERVAL,
            );
            Scheduler::new(
                "traffic",
                interval_or_default(agent.traffic_report_interval, DEFAULT_TRAFFIC_INTERVAL),
                Arc::new(
                    TrafficJob::new(client.clone(), manager.clone(), monitor, rule_sync)
                        .with_metrics(metrics.clone()),
                ),
            )
        });

        Ok(Self {
            settings,
            manager,
            installer,
            metrics,
            shutdown: GracefulShutdown::new(),
            sync,
            heartbeat,
            traffic,
        })
    }

    pub fn manager(&self) -> Arc<InstanceManager> {
        self.manager.clone()
    }

    pub fn shutdown_handle(&self) -> GracefulShutdown {
        self.shutdown.clone()
    }

    /// 启动前准备：工作目录、二进制、遗留进程
    pub async fn prepare(&self) -> Result<()> {
        let dir = &self.settings.agent.instance_dir;
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create instance directory: {}", dir.display()))?;

        self.installer
            .ensure_installed()
            .await
            .context("Failed to install snell-server")?;

        match self.manager.recover_orphans().await {
            Ok(0) => {}
            Ok(n) => info!("Terminated {} orphaned instance(s) from a previous run", n),
            Err(e) => warn!("Failed to scan for orphaned instances: {}", e),
        }
        Ok(())
    }

    /// 启动全部调度器
    pub async fn start(&self) -> Result<()> {
        self.sync.start().await?;
        self.heartbeat.start().await?;
        if let Some(traffic) = &self.traffic {
            traffic.start().await?;
        } else {
            info!("Traffic monitoring is disabled");
        }
        Ok(())
    }

    /// 按 traffic -> heartbeat -> sync 顺序停止，最后停止全部实例
    pub async fn stop(&self) {
        if let Some(traffic) = &self.traffic {
            traffic.stop().await;
        }
        self.heartbeat.stop().await;
        self.sync.stop().await;
        self.manager.stop_all().await;
    }

    /// 运行直到收到关机信号
    pub async fn run(&self) -> Result<ShutdownSignal> {
        self.prepare().await?;
        self.shutdown.start_signal_handling()?;

        let metrics_server = {
            let shutdown = self.shutdown.clone();
            metrics::spawn_server(&self.settings.metrics, self.metrics.clone(), async move {
                shutdown.wait_for_shutdown().await;
            })
        };

        if let Err(e) = self.start().await {
            self.stop().await;
            return Err(e);
        }
        info!(
            "Agent '{}' running with {} backend",
            self.settings.agent.node_name,
            self.manager.backend_name()
        );

        let signal = self.shutdown.wait_for_shutdown().await;
        info!("Shutting down on {}", signal);
        self.stop().await;

        if let Some(server) = metrics_server {
            if let Err(e) = server.await {
                warn!("Metrics server task failed: {}", e);
            }
        }
        Ok(signal)
    }
}
