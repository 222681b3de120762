use super::{Instance, InstanceHandle, InstanceStatus, LifecycleBackend, ManagerError};
use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill, killpg};
use nix::unistd::Pid;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, info, warn};

const STOP_POLL_INTERVAL: Duration = Duration::from_millis(200);
const STOP_GRACE_PERIOD: Duration = Duration::from_secs(2);
const KILL_REAP_PERIOD: Duration = Duration::from_secs(1);

/// 直接进程后端：snell-server 作为 agent 的子进程运行
pub struct ProcessBackend {
    binary: PathBuf,
}

impl ProcessBackend {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn open_log(path: &Path) -> std::io::Result<std::fs::File> {
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
    }
}

#[async_trait]
impl LifecycleBackend for ProcessBackend {
    fn name(&self) -> &'static str {
        "process"
    }

    async fn start(&self, instance: &Instance) -> Result<InstanceHandle, ManagerError> {
        let stdout = Self::open_log(&instance.log_file)?;
        let stderr = stdout.try_clone()?;

        let mut child = Command::new(&self.binary)
            .arg("-c")
            .arg(&instance.config_file)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .process_group(0)
            .spawn()
            .map_err(|source| ManagerError::Spawn {
                id: instance.id,
                source,
            })?;

        let pid = child.id().ok_or_else(|| ManagerError::Command {
            id: instance.id,
            detail: "process exited before its pid could be read".to_string(),
        })?;

        // 回收子进程，避免僵尸进程被误判为存活
        let id = instance.id;
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => debug!("Instance {} (pid {}) exited: {}", id, pid, status),
                Err(e) => warn!("Failed to wait for instance {} (pid {}): {}", id, pid, e),
            }
        });

        if let Err(e) = tokio::fs::write(&instance.pid_file, pid.to_string()).await {
            warn!(
                "Failed to write pid file {}: {}",
                instance.pid_file.display(),
                e
            );
        }

        Ok(InstanceHandle::Process { pid })
    }

    async fn stop(&self, instance: &Instance) -> Result<(), ManagerError> {
        if let Some(pid) = instance.pid() {
            terminate(pid).await?;
        }

        match tokio::fs::remove_file(&instance.pid_file).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn status(&self, instance: &Instance) -> InstanceStatus {
        match instance.pid() {
            Some(pid) if is_alive(pid) => InstanceStatus::Running,
            _ => InstanceStatus::Stopped,
        }
    }
}

/// signal 0 探测：ESRCH 视为退出，EPERM 视为存在
pub fn is_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// SIGTERM，等待至多 2 秒，仍存活则 SIGKILL
pub async fn terminate(pid: u32) -> Result<(), ManagerError> {
    if !is_alive(pid) {
        return Ok(());
    }

    send_signal(pid, Signal::SIGTERM)?;
    if wait_for_exit(pid, STOP_GRACE_PERIOD).await {
        debug!("pid {} exited after SIGTERM", pid);
        return Ok(());
    }

    info!("pid {} still alive after {:?}, sending SIGKILL", pid, STOP_GRACE_PERIOD);
    send_signal(pid, Signal::SIGKILL)?;
    if !wait_for_exit(pid, KILL_REAP_PERIOD).await {
        warn!("pid {} did not disappear after SIGKILL", pid);
    }
    Ok(())
}

async fn wait_for_exit(pid: u32, within: Duration) -> bool {
    let deadline = Instant::now() + within;
    while Instant::now() < deadline {
        tokio::time::sleep(STOP_POLL_INTERVAL).await;
        if !is_alive(pid) {
            return true;
        }
    }
    false
}

/// 优先向整个进程组发送信号，进程不是组长时退回单个进程
fn send_signal(pid: u32, signal: Signal) -> Result<(), ManagerError> {
    let raw = i32::try_from(pid).map_err(|_| ManagerError::Signal {
        pid,
        errno: Errno::EINVAL,
    })?;
    let target = Pid::from_raw(raw);

    match killpg(target, signal) {
        Ok(()) => Ok(()),
        Err(Errno::ESRCH) => match kill(target, signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(errno) => Err(ManagerError::Signal { pid, errno }),
        },
        Err(errno) => Err(ManagerError::Signal { pid, errno }),
    }
}

/// 通过 /proc 确认 pid 确实是用该配置文件启动的实例
pub fn owns_config(pid: u32, config_file: &Path) -> bool {
    let Ok(cmdline) = std::fs::read(format!("/proc/{}/cmdline", pid)) else {
        return false;
    };
    let needle = config_file.as_os_str().as_encoded_bytes();
    cmdline
        .split(|b| *b == 0)
        .any(|arg| arg == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::testing::{free_port, remote};
    use crate::manager::{InstanceManager, InstancePaths};
    use std::os::unix::fs::PermissionsExt;
    use std::sync::Arc;

    /// 写一个假的 snell-server：忽略参数，持续休眠
    fn fake_binary(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("fake-snell-server");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[tokio::test]
    async fn test_start_status_stop() {
        let dir = tempfile::tempdir().unwrap();
        let binary = fake_binary(dir.path(), "echo started\nsleep 30");
        let backend = ProcessBackend::new(binary);
        let paths = InstancePaths::new(dir.path());
        let mut instance = Instance::from_remote(&remote(1, free_port(), "p1"), &paths);

        let handle = backend.start(&instance).await.unwrap();
        instance.handle = Some(handle);
        let pid = instance.pid().unwrap();

        assert_eq!(backend.status(&instance).await, InstanceStatus::Running);
        let recorded = std::fs::read_to_string(&instance.pid_file).unwrap();
        assert_eq!(recorded.trim(), pid.to_string());

        backend.stop(&instance).await.unwrap();
        assert!(!is_alive(pid));
        assert!(!instance.pid_file.exists());
        assert_eq!(backend.status(&instance).await, InstanceStatus::Stopped);

        // 再次停止不报错
        backend.stop(&instance).await.unwrap();

        let log = std::fs::read_to_string(&instance.log_file).unwrap();
        assert!(log.contains("started"));
    }

    #[tokio::test]
    async fn test_stop_escalates_to_sigkill() {
        let dir = tempfile::tempdir().unwrap();
        let binary = fake_binary(dir.path(), "trap '' TERM\nwhile true; do sleep 1; done");
        let backend = ProcessBackend::new(binary);
        let paths = InstancePaths::new(dir.path());
        let mut instance = Instance::from_remote(&remote(2, free_port(), "p"), &paths);

        instance.handle = Some(backend.start(&instance).await.unwrap());
        let pid = instance.pid().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let started = Instant::now();
        backend.stop(&instance).await.unwrap();
        assert!(started.elapsed() >= STOP_GRACE_PERIOD);
        assert!(!is_alive(pid));
    }

    #[tokio::test]
    async fn test_exited_child_reports_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let binary = fake_binary(dir.path(), "exit 1");
        let backend = ProcessBackend::new(binary);
        let paths = InstancePaths::new(dir.path());
        let mut instance = Instance::from_remote(&remote(3, free_port(), "p"), &paths);

        instance.handle = Some(backend.start(&instance).await.unwrap());
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert_eq!(backend.status(&instance).await, InstanceStatus::Stopped);
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let dir = tempfile::tempdir().unwrap();
        let backend = ProcessBackend::new(dir.path().join("missing-binary"));
        let paths = InstancePaths::new(dir.path());
        let instance = Instance::from_remote(&remote(4, free_port(), "p"), &paths);

        let err = backend.start(&instance).await.unwrap_err();
        assert!(matches!(err, ManagerError::Spawn { id: 4, .. }));
    }

    #[tokio::test]
    async fn test_sync_lifecycle_with_real_processes() {
        let dir = tempfile::tempdir().unwrap();
        let binary = fake_binary(dir.path(), "sleep 30");
        let manager = InstanceManager::new(dir.path(), Arc::new(ProcessBackend::new(binary)))
            .with_restart_delay(Duration::from_millis(50));
        let port = free_port();

        // 创建
        let report = manager.sync(&[remote(1, port, "p1")]).await;
        assert_eq!(report.created, 1);
        let first = manager.get(1).await.unwrap();
        assert_eq!(first.status, InstanceStatus::Running);
        let old_pid = first.pid().unwrap();
        assert!(is_alive(old_pid));

        // psk 变化触发重写配置并重启
        let report = manager.sync(&[remote(1, port, "p2")]).await;
        assert_eq!(report.updated, 1);
        let second = manager.get(1).await.unwrap();
        let new_pid = second.pid().unwrap();
        assert_ne!(old_pid, new_pid);
        assert!(!is_alive(old_pid));
        assert!(is_alive(new_pid));
        let content = std::fs::read_to_string(&second.config_file).unwrap();
        assert!(content.contains("psk = p2"));

        // 远端不再返回：停止并清理文件
        let report = manager.sync(&[]).await;
        assert_eq!(report.removed, 1);
        assert!(manager.get(1).await.is_none());
        assert!(!is_alive(new_pid));
        assert!(!second.config_file.exists());
        assert!(!second.log_file.exists());
        assert!(!second.pid_file.exists());
    }

    #[tokio::test]
    async fn test_recover_orphans_terminates_live_instance() {
        let dir = tempfile::tempdir().unwrap();
        let binary = fake_binary(dir.path(), "sleep 30");
        let backend = ProcessBackend::new(binary);
        let paths = InstancePaths::new(dir.path());
        let mut instance = Instance::from_remote(&remote(9, free_port(), "p"), &paths);
        instance.handle = Some(backend.start(&instance).await.unwrap());
        let pid = instance.pid().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(owns_config(pid, &instance.config_file));

        // 新的管理器实例表为空，只能靠 pid 文件找到遗留进程
        let manager = InstanceManager::new(dir.path(), Arc::new(backend));
        let recovered = manager.recover_orphans().await.unwrap();

        assert_eq!(recovered, 1);
        assert!(!is_alive(pid));
        assert!(!instance.pid_file.exists());
    }
}
