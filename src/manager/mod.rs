pub mod config;
pub mod port;
pub mod process;
pub mod service;
pub mod sync;

#[cfg(test)]
pub(crate) mod testing;

use crate::client::RemoteInstance;
use crate::config::{AgentConfig, BackendKind};
use crate::exec::{CommandRunner, ExecError};
use crate::metrics::AgentMetrics;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

pub use process::ProcessBackend;
pub use service::ServiceBackend;
pub use sync::SyncReport;

/// 实例运行状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstanceStatus {
    Stopped,
    Running,
    Error,
}

impl InstanceStatus {
    /// 上报给 Master 的状态码
    pub fn code(self) -> u8 {
        match self {
            InstanceStatus::Stopped => 0,
            InstanceStatus::Running => 1,
            InstanceStatus::Error => 2,
        }
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstanceStatus::Stopped => write!(f, "stopped"),
            InstanceStatus::Running => write!(f, "running"),
            InstanceStatus::Error => write!(f, "error"),
        }
    }
}

/// 运行时句柄：进程 pid 或 systemd 单元名
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceHandle {
    Process { pid: u32 },
    Service { unit: String },
}

/// 实例工作目录下的文件命名规则
#[derive(Debug, Clone)]
pub struct InstancePaths {
    dir: PathBuf,
}

impl InstancePaths {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn config_file(&self, id: u64) -> PathBuf {
        self.dir.join(format!("instance_{}.conf", id))
    }

    pub fn log_file(&self, id: u64) -> PathBuf {
        self.dir.join(format!("instance_{}.log", id))
    }

    pub fn pid_file(&self, id: u64) -> PathBuf {
        self.dir.join(format!("instance_{}.pid", id))
    }
}

/// 本地托管的 snell-server 实例
#[derive(Debug, Clone)]
pub struct Instance {
    pub id: u64,
    pub user_id: u64,
    pub username: String,
    pub port: i32,
    pub psk: String,
    pub obfs: String,
    pub version: i32,
    pub handle: Option<InstanceHandle>,
    pub config_file: PathBuf,
    pub log_file: PathBuf,
    pub pid_file: PathBuf,
    pub status: InstanceStatus,
    pub last_updated: DateTime<Utc>,
}

impl Instance {
    pub fn from_remote(remote: &RemoteInstance, paths: &InstancePaths) -> Self {
        Self {
            id: remote.id,
            user_id: remote.user_id,
            username: remote.username.clone(),
            port: remote.port,
            psk: remote.psk.clone(),
            obfs: remote.obfs.clone(),
            version: remote.version,
            handle: None,
            config_file: paths.config_file(remote.id),
            log_file: paths.log_file(remote.id),
            pid_file: paths.pid_file(remote.id),
            status: InstanceStatus::Stopped,
            last_updated: Utc::now(),
        }
    }

    /// 影响运行配置的字段是否与远端不同
    pub fn differs_from(&self, remote: &RemoteInstance) -> bool {
        self.port != remote.port
            || self.psk != remote.psk
            || self.version != remote.version
            || self.obfs != remote.obfs
    }

    pub fn apply_remote(&mut self, remote: &RemoteInstance) {
        self.user_id = remote.user_id;
        self.username = remote.username.clone();
        self.port = remote.port;
        self.psk = remote.psk.clone();
        self.obfs = remote.obfs.clone();
        self.version = remote.version;
        self.last_updated = Utc::now();
    }

    pub fn pid(&self) -> Option<u32> {
        match &self.handle {
            Some(InstanceHandle::Process { pid }) => Some(*pid),
            _ => None,
        }
    }
}

/// 生命周期管理错误
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("invalid port {0}")]
    InvalidPort(i32),

    #[error("port {port} is already used by instance {owner}")]
    PortInUse { port: u16, owner: u64 },

    #[error("port {0} is not available on this host")]
    PortUnavailable(u16),

    #[error("failed to spawn instance {id}: {source}")]
    Spawn {
        id: u64,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to signal pid {pid}: {errno}")]
    Signal { pid: u32, errno: nix::errno::Errno },

    #[error("command failed for instance {id}: {detail}")]
    Command { id: u64, detail: String },

    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// 生命周期后端 - 直接进程或 systemd 服务
#[async_trait]
pub trait LifecycleBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// 启动实例，配置文件已经写好
    async fn start(&self, instance: &Instance) -> Result<InstanceHandle, ManagerError>;

    /// 停止实例；没有句柄或进程已退出时直接成功
    async fn stop(&self, instance: &Instance) -> Result<(), ManagerError>;

    async fn status(&self, instance: &Instance) -> InstanceStatus;

    /// 端口是否被该实例自己的服务占用
    async fn holds_port(&self, _instance: &Instance) -> bool {
        false
    }

    /// 清理上次运行留下、由后端自己持有的资源
    async fn recover_orphans(&self) -> Result<usize, ManagerError> {
        Ok(0)
    }
}

/// 根据配置选择生命周期后端
pub fn build_backend(
    agent: &AgentConfig,
    runner: Arc<dyn CommandRunner>,
) -> Arc<dyn LifecycleBackend> {
    match agent.backend {
        BackendKind::Process => Arc::new(ProcessBackend::new(agent.snell_binary.clone())),
        BackendKind::Service => Arc::new(ServiceBackend::new(
            agent.snell_binary.clone(),
            agent.unit_dir.clone(),
            runner,
        )),
    }
}

/// 实例管理器 - 维护实例表并驱动生命周期后端
pub struct InstanceManager {
    instances: Arc<RwLock<HashMap<u64, Instance>>>,
    backend: Arc<dyn LifecycleBackend>,
    paths: InstancePaths,
    restart_delay: Duration,
    metrics: Option<Arc<AgentMetrics>>,
}

impl InstanceManager {
    pub fn new(instance_dir: impl Into<PathBuf>, backend: Arc<dyn LifecycleBackend>) -> Self {
        Self {
            instances: Arc::new(RwLock::new(HashMap::new())),
            backend,
            paths: InstancePaths::new(instance_dir),
            restart_delay: Duration::from_secs(1),
            metrics: None,
        }
    }

    pub fn with_restart_delay(mut self, delay: Duration) -> Self {
        self.restart_delay = delay;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<AgentMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn paths(&self) -> &InstancePaths {
        &self.paths
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// 启动实例：校验端口、写配置、交给后端
    pub async fn start(&self, instance: &mut Instance) -> Result<(), ManagerError> {
        let result = self.start_inner(instance).await;
        self.record("start", result.is_ok());
        result
    }

    async fn start_inner(&self, instance: &mut Instance) -> Result<(), ManagerError> {
        let port = port::validate_port(instance.port)?;

        if let Some(owner) = self.port_owner(instance.port, instance.id).await {
            return Err(ManagerError::PortInUse { port, owner });
        }
        if !port::is_port_available(port).await && !self.backend.holds_port(instance).await {
            return Err(ManagerError::PortUnavailable(port));
        }

        config::write_config(instance, port).await?;

        let handle = self.backend.start(instance).await?;
        info!(
            "Instance {} started on port {} via {} backend ({:?})",
            instance.id,
            port,
            self.backend.name(),
            handle
        );
        instance.handle = Some(handle);
        instance.status = InstanceStatus::Running;
        instance.last_updated = Utc::now();
        Ok(())
    }

    /// 停止实例，重复调用安全
    pub async fn stop(&self, instance: &mut Instance) -> Result<(), ManagerError> {
        let result = self.backend.stop(instance).await;
        self.record("stop", result.is_ok());
        result?;

        if instance.handle.take().is_some() {
            info!("Instance {} stopped", instance.id);
        }
        instance.status = InstanceStatus::Stopped;
        instance.last_updated = Utc::now();
        Ok(())
    }

    pub async fn restart(&self, instance: &mut Instance) -> Result<(), ManagerError> {
        if let Err(e) = self.stop(instance).await {
            warn!("Failed to stop instance {} before restart: {}", instance.id, e);
        }
        tokio::time::sleep(self.restart_delay).await;
        self.start(instance).await
    }

    /// 探测实例真实状态
    pub async fn status(&self, instance: &Instance) -> InstanceStatus {
        match instance.handle {
            Some(_) => self.backend.status(instance).await,
            None if instance.status == InstanceStatus::Error => InstanceStatus::Error,
            None => InstanceStatus::Stopped,
        }
    }

    async fn port_owner(&self, port: i32, id: u64) -> Option<u64> {
        let instances = self.instances.read().await;
        instances
            .values()
            .find(|inst| inst.port == port && inst.id != id)
            .map(|inst| inst.id)
    }

    /// 已被托管实例占用的端口
    pub async fn used_ports(&self) -> Vec<i32> {
        let instances = self.instances.read().await;
        let mut ports: Vec<i32> = instances.values().map(|inst| inst.port).collect();
        ports.sort_unstable();
        ports.dedup();
        ports
    }

    pub async fn is_port_used(&self, port: i32) -> bool {
        let instances = self.instances.read().await;
        instances.values().any(|inst| inst.port == port)
    }

    pub async fn is_port_used_by_other(&self, port: i32, id: u64) -> bool {
        self.port_owner(port, id).await.is_some()
    }

    /// 所有实例快照，按 id 排序
    pub async fn instances(&self) -> Vec<Instance> {
        let instances = self.instances.read().await;
        let mut list: Vec<Instance> = instances.values().cloned().collect();
        list.sort_by_key(|inst| inst.id);
        list
    }

    pub async fn get(&self, id: u64) -> Option<Instance> {
        self.instances.read().await.get(&id).cloned()
    }

    pub async fn running_count(&self) -> usize {
        let instances = self.instances.read().await;
        instances
            .values()
            .filter(|inst| inst.status == InstanceStatus::Running)
            .count()
    }

    /// 刷新并返回所有实例状态，观测结果写回实例表
    pub async fn statuses(&self) -> Vec<(u64, InstanceStatus)> {
        let snapshot = self.instances().await;
        let mut observed = Vec::with_capacity(snapshot.len());
        for instance in &snapshot {
            observed.push((instance.id, self.status(instance).await));
        }

        let mut instances = self.instances.write().await;
        for (id, status) in &observed {
            if let Some(entry) = instances.get_mut(id) {
                if entry.status != *status {
                    debug!("Instance {} status {} -> {}", id, entry.status, status);
                    entry.status = *status;
                    entry.last_updated = Utc::now();
                }
            }
        }
        drop(instances);

        self.refresh_running_gauge().await;
        observed
    }

    /// 逐个探测后统计运行中的实例，不依赖缓存状态
    pub async fn live_running_count(&self) -> usize {
        self.statuses()
            .await
            .iter()
            .filter(|(_, status)| *status == InstanceStatus::Running)
            .count()
    }

    /// 停止所有实例，单个失败只记录日志
    pub async fn stop_all(&self) {
        let snapshot = self.instances().await;
        info!("Stopping {} instance(s)", snapshot.len());

        for mut instance in snapshot {
            match self.stop(&mut instance).await {
                Ok(()) => {
                    let mut instances = self.instances.write().await;
                    if let Some(entry) = instances.get_mut(&instance.id) {
                        entry.handle = None;
                        entry.status = InstanceStatus::Stopped;
                        entry.last_updated = instance.last_updated;
                    }
                }
                Err(e) => warn!("Failed to stop instance {}: {}", instance.id, e),
            }
        }
        self.refresh_running_gauge().await;
    }

    /// 清理上次运行遗留的进程、pid 文件与后端资源
    pub async fn recover_orphans(&self) -> Result<usize, ManagerError> {
        let processes = self.recover_pid_files().await?;
        let units = self.backend.recover_orphans().await?;
        Ok(processes + units)
    }

    async fn recover_pid_files(&self) -> Result<usize, ManagerError> {
        let mut entries = match tokio::fs::read_dir(self.paths.dir()).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut recovered = 0;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(id) = name.to_str().and_then(parse_pid_file_name) else {
                continue;
            };
            let path = entry.path();

            let pid = tokio::fs::read_to_string(&path)
                .await
                .ok()
                .and_then(|content| content.trim().parse::<u32>().ok());

            if let Some(pid) = pid {
                let config_file = self.paths.config_file(id);
                if process::is_alive(pid) && process::owns_config(pid, &config_file) {
                    info!("Terminating orphaned instance {} (pid {})", id, pid);
                    if let Err(e) = process::terminate(pid).await {
                        warn!("Failed to terminate orphan pid {}: {}", pid, e);
                        continue;
                    }
                    recovered += 1;
                }
            }

            if let Err(e) = tokio::fs::remove_file(&path).await {
                warn!("Failed to remove stale pid file {}: {}", path.display(), e);
            }
        }

        Ok(recovered)
    }

    async fn refresh_running_gauge(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.set_running(self.running_count().await);
        }
    }

    fn record(&self, action: &str, success: bool) {
        if let Some(metrics) = &self.metrics {
            metrics.record_lifecycle(action, success);
        }
    }
}

/// instance_{id}.pid -> id
fn parse_pid_file_name(name: &str) -> Option<u64> {
    name.strip_prefix("instance_")?
        .strip_suffix(".pid")?
        .parse()
        .ok()
}

/// 删除实例的配置、日志与 pid 文件
pub(crate) async fn remove_artifacts(instance: &Instance) {
    for path in [&instance.config_file, &instance.log_file, &instance.pid_file] {
        match tokio::fs::remove_file(path).await {
            Ok(()) => debug!("Removed {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
        }
    }
}
