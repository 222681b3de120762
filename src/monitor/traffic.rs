use crate::client::InstanceTraffic;
use crate::config::MonitorConfig;
use crate::exec::{CommandRunner, ExecError, args};
use crate::manager::Instance;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const NFT: &str = "nft";
const NFT_DEADLINE: Duration = Duration::from_secs(3);
const PROTOCOLS: [&str; 2] = ["tcp", "udp"];

/// 流量监控错误
#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("nft {command} failed: {detail}")]
    Command { command: String, detail: String },

    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error("failed to parse nft output: {0}")]
    Parse(#[from] serde_json::Error),
}

/// 实例上一次观测到的累计字节数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrafficBaseline {
    pub port: i32,
    pub bytes: u64,
    pub observed_at: DateTime<Utc>,
}

/// 规则上的实例标签
pub fn instance_tag(id: u64) -> String {
    format!("snell-instance-{}", id)
}

fn parse_tag(comment: &str) -> Option<u64> {
    comment.strip_prefix("snell-instance-")?.parse().ok()
}

#[derive(Debug, Deserialize)]
struct NftOutput {
    #[serde(default)]
    nftables: Vec<NftObject>,
}

#[derive(Debug, Deserialize)]
struct NftObject {
    rule: Option<NftRule>,
}

#[derive(Debug, Deserialize)]
struct NftRule {
    #[serde(default)]
    chain: String,
    #[serde(default)]
    handle: u64,
    #[serde(default)]
    comment: Option<String>,
    #[serde(default)]
    expr: Vec<Value>,
}

/// 从 nft 规则中解析出的计数信息
#[derive(Debug, Clone, PartialEq, Eq)]
struct CounterRule {
    handle: u64,
    comment: Option<String>,
    protocol: Option<String>,
    port: Option<u16>,
    bytes: u64,
}

impl CounterRule {
    fn from_rule(rule: NftRule) -> Self {
        let mut protocol = None;
        let mut port = None;
        let mut bytes = 0;

        for expr in &rule.expr {
            if let Some(matched) = expr.get("match") {
                if let Some(payload) = matched.pointer("/left/payload") {
                    if payload.get("field").and_then(Value::as_str) == Some("dport") {
                        protocol = payload
                            .get("protocol")
                            .and_then(Value::as_str)
                            .map(str::to_string);
                    }
                }
                port = port.or_else(|| parse_port(matched.get("right")));
            }
            if let Some(counter) = expr.get("counter") {
                bytes = counter.get("bytes").and_then(Value::as_u64).unwrap_or(0);
            }
        }

        Self {
            handle: rule.handle,
            comment: rule.comment,
            protocol,
            port,
            bytes,
        }
    }

    fn instance_id(&self) -> Option<u64> {
        self.comment.as_deref().and_then(parse_tag)
    }
}

fn parse_port(right: Option<&Value>) -> Option<u16> {
    let value = right?;
    let raw = value
        .as_u64()
        .or_else(|| value.pointer("/payload/value").and_then(Value::as_u64))?;
    u16::try_from(raw).ok().filter(|p| *p > 0)
}

/// nftables 流量监控器
pub struct TrafficMonitor {
    runner: Arc<dyn CommandRunner>,
    family: String,
    table: String,
    chain: String,
    baselines: Mutex<HashMap<u64, TrafficBaseline>>,
}

impl TrafficMonitor {
    pub fn new(config: &MonitorConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            family: config.nft_family.clone(),
            table: config.nft_table.clone(),
            chain: config.nft_chain.clone(),
            baselines: Mutex::new(HashMap::new()),
        }
    }

    async fn nft(&self, argv: Vec<String>) -> Result<String, MonitorError> {
        let output = self.runner.run(NFT, &argv, NFT_DEADLINE).await?;
        if output.success {
            Ok(output.output)
        } else {
            Err(MonitorError::Command {
                command: argv.join(" "),
                detail: output.output.trim().to_string(),
            })
        }
    }

    /// 确保统计用的表和链存在
    pub async fn ensure_chain(&self) -> Result<(), MonitorError> {
        let listed = self
            .nft(args(["list", "table", self.family.as_str(), self.table.as_str()]))
            .await;
        if listed.is_ok() {
            return Ok(());
        }

        info!("Creating nftables table {} {}", self.family, self.table);
        self.nft(args(["add", "table", self.family.as_str(), self.table.as_str()]))
            .await?;
        self.nft(args([
            "add",
            "chain",
            self.family.as_str(),
            self.table.as_str(),
            self.chain.as_str(),
            "{ type filter hook input priority 0; }",
        ]))
        .await?;
        Ok(())
    }

    /// 为实例端口添加 tcp/udp 计数规则
    pub async fn add_instance_rules(&self, id: u64, port: u16) -> Result<(), MonitorError> {
        let tag = instance_tag(id);
        let port = port.to_string();
        for proto in PROTOCOLS {
            self.nft(args([
                "add",
                "rule",
                self.family.as_str(),
                self.table.as_str(),
                self.chain.as_str(),
                proto,
                "dport",
                port.as_str(),
                "counter",
                "comment",
                tag.as_str(),
            ]))
            .await?;
        }
        debug!("Added counter rules for instance {} on port {}", id, port);
        Ok(())
    }

    /// 删除带有该实例标签的全部规则，句柄取自同一次列表
    pub async fn remove_instance_rules(&self, id: u64) -> Result<(), MonitorError> {
        let tag = instance_tag(id);
        let handles: Vec<u64> = self
            .list_rules()
            .await?
            .into_iter()
            .filter(|rule| rule.comment.as_deref() == Some(tag.as_str()))
            .map(|rule| rule.handle)
            .collect();
        self.delete_handles(&handles).await
    }

    async fn delete_handles(&self, handles: &[u64]) -> Result<(), MonitorError> {
        let mut failures = Vec::new();
        for handle in handles {
            let handle = handle.to_string();
            if let Err(e) = self
                .nft(args([
                    "delete",
                    "rule",
                    self.family.as_str(),
                    self.table.as_str(),
                    self.chain.as_str(),
                    "handle",
                    handle.as_str(),
                ]))
                .await
            {
                failures.push(e.to_string());
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(MonitorError::Command {
                command: "delete rule".to_string(),
                detail: failures.join("; "),
            })
        }
    }

    /// 让链中的规则与实例集合一致
    pub async fn sync_rules(&self, instances: &[Instance]) -> Result<(), MonitorError> {
        let rules = self.list_rules().await?;
        let wanted: HashMap<u64, u16> = instances
            .iter()
            .filter_map(|inst| u16::try_from(inst.port).ok().map(|port| (inst.id, port)))
            .filter(|(_, port)| *port > 0)
            .collect();

        let mut stale_handles = Vec::new();
        let mut covered: HashMap<u64, HashSet<&str>> = HashMap::new();
        let mut dropped = HashSet::new();

        for rule in &rules {
            match rule.instance_id().and_then(|id| wanted.get(&id).map(|port| (id, *port))) {
                Some((id, port)) if rule.port == Some(port) => {
                    if let Some(proto) = rule.protocol.as_deref() {
                        covered.entry(id).or_default().insert(proto);
                    }
                }
                Some(_) => stale_handles.push(rule.handle),
                None => {
                    if let Some(id) = rule.instance_id() {
                        dropped.insert(id);
                    }
                    stale_handles.push(rule.handle);
                }
            }
        }

        // 端口变化或规则缺失的实例：删掉旧规则再重建
        let mut rebuild = Vec::new();
        for (id, port) in &wanted {
            let complete = covered
                .get(id)
                .is_some_and(|protos| PROTOCOLS.iter().all(|p| protos.contains(p)));
            if !complete {
                stale_handles.extend(
                    rules
                        .iter()
                        .filter(|rule| rule.instance_id() == Some(*id) && rule.port == Some(*port))
                        .map(|rule| rule.handle),
                );
                rebuild.push((*id, *port));
            }
        }
        stale_handles.sort_unstable();
        stale_handles.dedup();

        if !stale_handles.is_empty() {
            debug!("Deleting {} stale counter rule(s)", stale_handles.len());
            self.delete_handles(&stale_handles).await?;
        }
        for id in dropped {
            self.cleanup_instance(id).await;
        }
        self.baselines
            .lock()
            .await
            .retain(|id, _| wanted.contains_key(id));

        rebuild.sort_unstable();
        for (id, port) in rebuild {
            self.add_instance_rules(id, port).await?;
        }
        Ok(())
    }

    /// 读取计数并计算每个实例的流量增量
    pub async fn update_traffic(
        &self,
        instances: &[Instance],
    ) -> Result<Vec<InstanceTraffic>, MonitorError> {
        let rules = self.list_rules().await?;
        let mut port_bytes: HashMap<i32, u64> = HashMap::new();
        for rule in &rules {
            if let Some(port) = rule.port {
                *port_bytes.entry(port as i32).or_default() += rule.bytes;
            }
        }

        let now = Utc::now();
        let mut baselines = self.baselines.lock().await;
        let mut result = Vec::new();

        for instance in instances {
            let Some(&current) = port_bytes.get(&instance.port) else {
                continue;
            };
            let previous = baselines.insert(
                instance.id,
                TrafficBaseline {
                    port: instance.port,
                    bytes: current,
                    observed_at: now,
                },
            );
            // 端口变化后旧基线属于另一个计数器
            let Some(previous) = previous.filter(|prev| prev.port == instance.port) else {
                continue;
            };

            let delta = compute_delta(previous.bytes, current);
            if delta == 0 {
                continue;
            }
            let (upload, download) = split_delta(delta);
            result.push(InstanceTraffic {
                instance_id: instance.id,
                bytes_upload: upload,
                bytes_download: download,
            });
        }

        Ok(result)
    }

    /// 丢弃实例的基线
    pub async fn cleanup_instance(&self, id: u64) {
        self.baselines.lock().await.remove(&id);
    }

    pub async fn baseline(&self, id: u64) -> Option<TrafficBaseline> {
        self.baselines.lock().await.get(&id).cloned()
    }

    async fn list_rules(&self) -> Result<Vec<CounterRule>, MonitorError> {
        let output = self
            .nft(args(["-j", "list", "table", self.family.as_str(), self.table.as_str()]))
            .await?;
        let parsed: NftOutput = serde_json::from_str(&output)?;

        Ok(parsed
            .nftables
            .into_iter()
            .filter_map(|object| object.rule)
            .filter(|rule| rule.chain == self.chain)
            .map(CounterRule::from_rule)
            .collect())
    }
}

/// 计数器回退（重置）时，新值本身就是增量
pub fn compute_delta(last: u64, current: u64) -> u64 {
    if current >= last {
        current - last
    } else {
        warn!("Traffic counter decreased from {} to {}, treating as reset", last, current);
        current
    }
}

/// 计数只有总量，上下行按一半近似拆分
pub fn split_delta(delta: u64) -> (u64, u64) {
    let upload = delta / 2;
    (upload, delta - upload)
}
