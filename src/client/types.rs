use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Master 所有接口统一的响应信封
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope<T> {
    /// 缺省视为 0
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
    pub data: Option<T>,
}

/// Master 下发的实例期望状态
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteInstance {
    pub id: u64,
    #[serde(default)]
    pub user_id: u64,
    #[serde(default)]
    pub username: String,
    pub port: i32,
    pub psk: String,
    #[serde(default)]
    pub version: i32,
    #[serde(default)]
    pub obfs: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigPayload {
    #[serde(default)]
    pub instances: Vec<RemoteInstance>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HeartbeatRequest {
    pub cpu_usage: u8,
    pub memory_usage: u8,
    pub instance_count: usize,
    pub version: String,
}

/// 单个实例一个上报周期内的流量增量
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceTraffic {
    pub instance_id: u64,
    pub bytes_upload: u64,
    pub bytes_download: u64,
}

impl InstanceTraffic {
    pub fn total(&self) -> u64 {
        self.bytes_upload + self.bytes_download
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TrafficReport<'a> {
    pub traffic: &'a [InstanceTraffic],
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceStatusReport {
    pub instance_id: u64,
    pub status: u8,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport<'a> {
    pub statuses: &'a [InstanceStatusReport],
}

/// snell-server 下载配置，download_urls 以架构名为键
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DistributionConfig {
    pub version: String,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub download_urls: HashMap<String, String>,
}
