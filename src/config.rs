use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tracing::info;

/// Agent 全局配置，对应 agent.toml
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub agent: AgentConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub node_name: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub country_code: String,
    pub master_url: String,
    pub api_token: String,
    #[serde(default)]
    pub auth_scheme: AuthScheme,
    #[serde(default = "default_auth_header")]
    pub auth_header: String,
    pub instance_dir: PathBuf,
    pub snell_binary: PathBuf,
    #[serde(default)]
    pub backend: BackendKind,
    #[serde(default = "default_unit_dir")]
    pub unit_dir: PathBuf,
    #[serde(default = "default_restart_delay_ms")]
    pub restart_delay_ms: u64,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: i64, // seconds
    #[serde(default = "default_config_sync_interval")]
    pub config_sync_interval: i64, // seconds
    #[serde(default = "default_traffic_report_interval")]
    pub traffic_report_interval: i64, // seconds
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

/// 鉴权方式：自定义请求头或 Bearer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthScheme {
    #[default]
    Header,
    Bearer,
}

/// 实例生命周期后端
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Process,
    Service,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Process => write!(f, "process"),
            BackendKind::Service => write!(f, "service"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub enable_cpu: bool,
    pub enable_memory: bool,
    pub enable_traffic: bool,
    pub nft_family: String,
    pub nft_table: String,
    pub nft_chain: String,
    pub rule_sync_interval: u64, // seconds
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enable_cpu: true,
            enable_memory: true,
            enable_traffic: true,
            nft_family: "inet".to_string(),
            nft_table: "snell".to_string(),
            nft_chain: "traffic".to_string(),
            rule_sync_interval: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub bind: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: SocketAddr::from(([127, 0, 0, 1], 9464)),
        }
    }
}

fn default_auth_header() -> String {
    "X-API-Token".to_string()
}

fn default_unit_dir() -> PathBuf {
    PathBuf::from("/etc/systemd/system")
}

fn default_restart_delay_ms() -> u64 {
    1000
}

fn default_heartbeat_interval() -> i64 {
    30
}

fn default_config_sync_interval() -> i64 {
    60
}

fn default_traffic_report_interval() -> i64 {
    300
}

fn default_max_retries() -> u32 {
    1
}

fn default_request_timeout() -> u64 {
    10
}

const ENV_OVERRIDES: &[&str] = &[
    "AGENT_NODE_NAME",
    "AGENT_LOCATION",
    "AGENT_COUNTRY_CODE",
    "AGENT_MASTER_URL",
    "AGENT_API_TOKEN",
    "AGENT_INSTANCE_DIR",
    "AGENT_SNELL_BINARY",
    "AGENT_BACKEND",
    "AGENT_HEARTBEAT_INTERVAL",
    "AGENT_CONFIG_SYNC_INTERVAL",
    "AGENT_TRAFFIC_REPORT_INTERVAL",
    "AGENT_LOG_LEVEL",
    "AGENT_LOG_FORMAT",
    "AGENT_LOG_FILE",
    "AGENT_MONITOR_ENABLE_CPU",
    "AGENT_MONITOR_ENABLE_MEMORY",
    "AGENT_MONITOR_ENABLE_TRAFFIC",
];

fn parse_env_secs(key: &str, value: &str) -> Result<i64> {
    value.parse::<i64>().with_context(|| {
        format!(
            "{} must be an integer number of seconds, got '{}'",
            key, value
        )
    })
}

fn parse_env_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_lowercase().as_str() {
        "1" | "t" | "true" | "yes" | "on" => Ok(true),
        "0" | "f" | "false" | "no" | "off" => Ok(false),
        _ => Err(anyhow::anyhow!("{} must be a boolean, got '{}'", key, value)),
    }
}

impl Settings {
    pub async fn load_from_path<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let config_path = config_path.as_ref();
        let content = tokio::fs::read_to_string(config_path)
            .await
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let mut settings = Self::from_toml(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;
        settings.apply_env_overrides(|key| std::env::var(key).ok())?;
        settings.validate()?;

        info!("Configuration loaded from {}", config_path.display());
        Ok(settings)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// 用环境变量覆盖部分配置，lookup 便于测试时注入
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        for key in ENV_OVERRIDES {
            let Some(value) = lookup(key).filter(|v| !v.trim().is_empty()) else {
                continue;
            };
            let value = value.trim().to_string();
            match *key {
                "AGENT_NODE_NAME" => self.agent.node_name = value,
                "AGENT_LOCATION" => self.agent.location = value,
                "AGENT_COUNTRY_CODE" => self.agent.country_code = value,
                "AGENT_MASTER_URL" => self.agent.master_url = value,
                "AGENT_API_TOKEN" => self.agent.api_token = value,
                "AGENT_INSTANCE_DIR" => self.agent.instance_dir = PathBuf::from(value),
                "AGENT_SNELL_BINARY" => self.agent.snell_binary = PathBuf::from(value),
                "AGENT_BACKEND" => {
                    self.agent.backend = match value.to_lowercase().as_str() {
                        "process" => BackendKind::Process,
                        "service" => BackendKind::Service,
                        other => {
                            return Err(anyhow::anyhow!("Unsupported AGENT_BACKEND '{}'", other));
                        }
                    }
                }
                "AGENT_HEARTBEAT_INTERVAL" => {
                    self.agent.heartbeat_interval = parse_env_secs(key, &value)?
                }
                "AGENT_CONFIG_SYNC_INTERVAL" => {
                    self.agent.config_sync_interval = parse_env_secs(key, &value)?
                }
                "AGENT_TRAFFIC_REPORT_INTERVAL" => {
                    self.agent.traffic_report_interval = parse_env_secs(key, &value)?
                }
                "AGENT_LOG_LEVEL" => self.logging.level = value,
                "AGENT_LOG_FORMAT" => self.logging.format = value,
                "AGENT_LOG_FILE" => self.logging.file = Some(PathBuf::from(value)),
                "AGENT_MONITOR_ENABLE_CPU" => {
                    self.monitor.enable_cpu = parse_env_bool(key, &value)?
                }
                "AGENT_MONITOR_ENABLE_MEMORY" => {
                    self.monitor.enable_memory = parse_env_bool(key, &value)?
                }
                "AGENT_MONITOR_ENABLE_TRAFFIC" => {
                    self.monitor.enable_traffic = parse_env_bool(key, &value)?
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let agent = &self.agent;

        let required = [
            ("agent.node_name", agent.node_name.as_str()),
            ("agent.master_url", agent.master_url.as_str()),
            ("agent.api_token", agent.api_token.as_str()),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(anyhow::anyhow!("{} is required", name));
            }
        }
        if agent.instance_dir.as_os_str().is_empty() {
            return Err(anyhow::anyhow!("agent.instance_dir is required"));
        }
        if agent.snell_binary.as_os_str().is_empty() {
            return Err(anyhow::anyhow!("agent.snell_binary is required"));
        }

        let url = agent.master_url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(anyhow::anyhow!(
                "agent.master_url must start with http:// or https://"
            ));
        }

        if agent.heartbeat_interval <= 0 {
            return Err(anyhow::anyhow!("agent.heartbeat_interval must be greater than zero"));
        }
        if agent.config_sync_interval <= 0 {
            return Err(anyhow::anyhow!("agent.config_sync_interval must be greater than zero"));
        }
        if agent.traffic_report_interval <= 0 {
            return Err(anyhow::anyhow!(
                "agent.traffic_report_interval must be greater than zero"
            ));
        }

        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => return Err(anyhow::anyhow!("Unsupported logging.level '{}'", other)),
        }
        match self.logging.format.to_lowercase().as_str() {
            "json" | "pretty" => {}
            other => return Err(anyhow::anyhow!("Unsupported logging.format '{}'", other)),
        }

        Ok(())
    }
}
