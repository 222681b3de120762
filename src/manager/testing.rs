use super::{Instance, InstanceHandle, InstanceStatus, LifecycleBackend, ManagerError};
use crate::client::RemoteInstance;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

/// 记录调用次数的内存后端
pub struct StubBackend {
    starts: AtomicUsize,
    stops: AtomicUsize,
    next_pid: AtomicU32,
    alive: Mutex<HashSet<u64>>,
    failing_ports: Mutex<HashSet<i32>>,
    holds_port: AtomicBool,
}

impl StubBackend {
    pub fn new() -> Self {
        Self {
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
            next_pid: AtomicU32::new(1000),
            alive: Mutex::new(HashSet::new()),
            failing_ports: Mutex::new(HashSet::new()),
            holds_port: AtomicBool::new(false),
        }
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    /// 之后对该端口的启动都会失败
    pub fn fail_port(&self, port: i32) {
        self.failing_ports.lock().unwrap().insert(port);
    }

    pub fn heal_port(&self, port: i32) {
        self.failing_ports.lock().unwrap().remove(&port);
    }

    /// 模拟实例进程意外退出
    pub fn kill(&self, id: u64) {
        self.alive.lock().unwrap().remove(&id);
    }

    pub fn set_holds_port(&self, holds: bool) {
        self.holds_port.store(holds, Ordering::SeqCst);
    }
}

#[async_trait]
impl LifecycleBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    async fn start(&self, instance: &Instance) -> Result<InstanceHandle, ManagerError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if self.failing_ports.lock().unwrap().contains(&instance.port) {
            return Err(ManagerError::Command {
                id: instance.id,
                detail: "simulated start failure".to_string(),
            });
        }
        self.alive.lock().unwrap().insert(instance.id);
        Ok(InstanceHandle::Process {
            pid: self.next_pid.fetch_add(1, Ordering::SeqCst),
        })
    }

    async fn stop(&self, instance: &Instance) -> Result<(), ManagerError> {
        if instance.handle.is_some() {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
        self.alive.lock().unwrap().remove(&instance.id);
        Ok(())
    }

    async fn status(&self, instance: &Instance) -> InstanceStatus {
        if self.alive.lock().unwrap().contains(&instance.id) {
            InstanceStatus::Running
        } else {
            InstanceStatus::Stopped
        }
    }

    async fn holds_port(&self, _instance: &Instance) -> bool {
        self.holds_port.load(Ordering::SeqCst)
    }
}

pub fn remote(id: u64, port: i32, psk: &str) -> RemoteInstance {
    RemoteInstance {
        id,
        user_id: id * 10,
        username: format!("user{}", id),
        port,
        psk: psk.to_string(),
        version: 4,
        obfs: String::new(),
    }
}

/// 取一个当前空闲的端口
pub fn free_port() -> i32 {
    let listener = std::net::TcpListener::bind("0.0.0.0:0").unwrap();
    listener.local_addr().unwrap().port() as i32
}
