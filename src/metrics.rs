use crate::config::MetricsConfig;
use anyhow::Result;
use prometheus::{Gauge, IntCounterVec, IntGauge, Registry};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};
use warp::Filter;

/// Agent 指标收集器
pub struct AgentMetrics {
    registry: Registry,

    // 实例指标
    pub instances_running: IntGauge,
    pub lifecycle_actions: IntCounterVec,
    pub sync_runs: IntCounterVec,

    // 上报指标
    pub reports_total: IntCounterVec,
    pub traffic_bytes: IntCounterVec,

    // 系统指标
    pub cpu_usage: Gauge,
    pub memory_usage: Gauge,

    start_time: Instant,
}

impl AgentMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let instances_running = IntGauge::new(
            "snell_agent_instances_running",
            "Number of managed instances currently running",
        )?;
        registry.register(Box::new(instances_running.clone()))?;

        let lifecycle_actions = IntCounterVec::new(
            prometheus::Opts::new(
                "snell_agent_lifecycle_actions_total",
                "Instance lifecycle actions by action and result",
            ),
            &["action", "result"],
        )?;
        registry.register(Box::new(lifecycle_actions.clone()))?;

        let sync_runs = IntCounterVec::new(
            prometheus::Opts::new("snell_agent_sync_runs_total", "Config sync runs"),
            &["result"],
        )?;
        registry.register(Box::new(sync_runs.clone()))?;

        let reports_total = IntCounterVec::new(
            prometheus::Opts::new("snell_agent_reports_total", "Reports sent to master"),
            &["kind", "result"],
        )?;
        registry.register(Box::new(reports_total.clone()))?;

        let traffic_bytes = IntCounterVec::new(
            prometheus::Opts::new(
                "snell_agent_traffic_bytes_total",
                "Reported traffic bytes by direction",
            ),
            &["direction"],
        )?;
        registry.register(Box::new(traffic_bytes.clone()))?;

        let cpu_usage = Gauge::new("snell_agent_cpu_usage_percent", "Host CPU usage percentage")?;
        registry.register(Box::new(cpu_usage.clone()))?;

        let memory_usage =
            Gauge::new("snell_agent_memory_usage_percent", "Host memory usage percentage")?;
        registry.register(Box::new(memory_usage.clone()))?;

        Ok(Self {
            registry,
            instances_running,
            lifecycle_actions,
            sync_runs,
            reports_total,
            traffic_bytes,
            cpu_usage,
            memory_usage,
            start_time: Instant::now(),
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// 记录一次生命周期操作
    pub fn record_lifecycle(&self, action: &str, success: bool) {
        self.lifecycle_actions
            .with_label_values(&[action, result_label(success)])
            .inc();
    }

    pub fn record_sync(&self, success: bool) {
        self.sync_runs.with_label_values(&[result_label(success)]).inc();
    }

    pub fn record_report(&self, kind: &str, success: bool) {
        self.reports_total
            .with_label_values(&[kind, result_label(success)])
            .inc();
    }

    pub fn record_traffic(&self, upload: u64, download: u64) {
        self.traffic_bytes.with_label_values(&["upload"]).inc_by(upload);
        self.traffic_bytes
            .with_label_values(&["download"])
            .inc_by(download);
    }

    pub fn set_running(&self, count: usize) {
        self.instances_running.set(count as i64);
    }

    pub fn set_system_usage(&self, cpu: f64, memory: f64) {
        self.cpu_usage.set(cpu);
        self.memory_usage.set(memory);
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// 导出指标为Prometheus格式
    pub fn export_metrics(&self) -> Result<String> {
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        encoder
            .encode_to_string(&metric_families)
            .map_err(|e| anyhow::anyhow!("Failed to encode metrics: {}", e))
    }
}

fn result_label(success: bool) -> &'static str {
    if success { "success" } else { "error" }
}

/// 指标与健康检查路由
pub fn routes(
    metrics: Arc<AgentMetrics>,
) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
    let metrics_route = warp::path("metrics").and(warp::get()).map(move || {
        match metrics.export_metrics() {
            Ok(body) => warp::reply::with_status(body, warp::http::StatusCode::OK),
            Err(e) => warp::reply::with_status(
                e.to_string(),
                warp::http::StatusCode::INTERNAL_SERVER_ERROR,
            ),
        }
    });

    let health_route = warp::path("health")
        .and(warp::get())
        .map(|| warp::reply::with_status("ok".to_string(), warp::http::StatusCode::OK));

    metrics_route.or(health_route)
}

/// 启动指标 HTTP 服务，shutdown 完成后退出
pub fn spawn_server(
    config: &MetricsConfig,
    metrics: Arc<AgentMetrics>,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Option<tokio::task::JoinHandle<()>> {
    if !config.enabled {
        info!("Metrics endpoint is disabled");
        return None;
    }

    let bind = config.bind;
    match warp::serve(routes(metrics)).try_bind_with_graceful_shutdown(bind, shutdown) {
        Ok((addr, server)) => {
            info!("Metrics endpoint listening on http://{}/metrics", addr);
            Some(tokio::spawn(server))
        }
        Err(e) => {
            error!("Failed to bind metrics endpoint on {}: {}", bind, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_export_contains_recorded_values() {
        let metrics = AgentMetrics::new().unwrap();
        metrics.record_lifecycle("start", true);
        metrics.record_lifecycle("start", false);
        metrics.record_traffic(10, 20);
        metrics.set_running(3);

        let output = metrics.export_metrics().unwrap();
        assert!(output.contains("snell_agent_instances_running 3"));
        let failed = r#"snell_agent_lifecycle_actions_total{action="start",result="error"} 1"#;
        assert!(output.contains(failed));
        assert!(output.contains(r#"snell_agent_traffic_bytes_total{direction="download"} 20"#));
    }

    #[tokio::test]
    async fn test_routes() {
        let metrics = Arc::new(AgentMetrics::new().unwrap());
        metrics.record_sync(true);
        let filter = routes(metrics);

        let resp = warp::test::request()
            .method("GET")
            .path("/health")
            .reply(&filter)
            .await;
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.body(), "ok");

        let resp = warp::test::request()
            .method("GET")
            .path("/metrics")
            .reply(&filter)
            .await;
        assert_eq!(resp.status(), 200);
        let body = String::from_utf8(resp.body().to_vec()).unwrap();
        assert!(body.contains("snell_agent_sync_runs_total"));
    }
}
