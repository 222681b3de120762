use super::{Instance, InstanceManager, InstanceStatus, remove_artifacts};
use crate::client::RemoteInstance;
use std::collections::{BTreeMap, HashMap};
use tracing::{error, info, warn};

/// 一次对账的结果统计
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub created: usize,
    pub updated: usize,
    pub removed: usize,
    pub retried: usize,
    pub failed: usize,
}

impl SyncReport {
    /// 实际执行的生命周期动作数
    pub fn actions(&self) -> usize {
        self.created + self.updated + self.removed + self.retried
    }

    pub fn is_noop(&self) -> bool {
        self.actions() == 0 && self.failed == 0
    }
}

impl std::fmt::Display for SyncReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "created={} updated={} removed={} retried={} failed={}",
            self.created, self.updated, self.removed, self.retried, self.failed
        )
    }
}

impl InstanceManager {
    /// 按 id 做集合差，把本地实例对齐到远端期望状态
    pub async fn sync(&self, remote: &[RemoteInstance]) -> SyncReport {
        let mut desired: BTreeMap<u64, &RemoteInstance> = BTreeMap::new();
        for entry in remote {
            if desired.insert(entry.id, entry).is_some() {
                warn!("Duplicate instance id {} in remote config, using the last entry", entry.id);
            }
        }

        let snapshot: HashMap<u64, Instance> = self.instances.read().await.clone();
        let mut report = SyncReport::default();

        // 先删除，释放出来的端口可以给新实例使用
        let mut stale: Vec<&Instance> = snapshot
            .values()
            .filter(|inst| !desired.contains_key(&inst.id))
            .collect();
        stale.sort_by_key(|inst| inst.id);
        for instance in stale {
            self.remove_instance(instance.clone()).await;
            report.removed += 1;
        }

        for (id, entry) in desired {
            match snapshot.get(&id) {
                None => {
                    let mut instance = Instance::from_remote(entry, &self.paths);
                    match self.start(&mut instance).await {
                        Ok(()) => report.created += 1,
                        Err(e) => {
                            error!("Failed to start instance {}: {}", id, e);
                            instance.status = InstanceStatus::Error;
                            report.failed += 1;
                        }
                    }
                    self.store(instance).await;
                }
                Some(local) if local.differs_from(entry) => {
                    let mut instance = local.clone();
                    instance.apply_remote(entry);
                    info!("Instance {} changed remotely, restarting", id);
                    match self.restart(&mut instance).await {
                        Ok(()) => report.updated += 1,
                        Err(e) => {
                            error!("Failed to restart instance {}: {}", id, e);
                            instance.status = InstanceStatus::Error;
                            report.failed += 1;
                        }
                    }
                    self.store(instance).await;
                }
                Some(local) if local.status == InstanceStatus::Error => {
                    let mut instance = local.clone();
                    match self.start(&mut instance).await {
                        Ok(()) => {
                            info!("Instance {} recovered from error state", id);
                            report.retried += 1;
                        }
                        Err(e) => {
                            warn!("Retry of instance {} failed: {}", id, e);
                            instance.status = InstanceStatus::Error;
                            report.failed += 1;
                        }
                    }
                    self.store(instance).await;
                }
                Some(_) => {}
            }
        }

        self.refresh_running_gauge().await;
        if !report.is_noop() {
            info!("Instance sync finished: {}", report);
        }
        report
    }

    async fn store(&self, instance: Instance) {
        self.instances.write().await.insert(instance.id, instance);
    }

    async fn remove_instance(&self, mut instance: Instance) {
        let id = instance.id;
        if let Err(e) = self.stop(&mut instance).await {
            warn!("Failed to stop removed instance {}: {}", id, e);
        }
        remove_artifacts(&instance).await;
        self.instances.write().await.remove(&id);
        info!("Instance {} removed", id);
    }
}
