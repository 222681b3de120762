use super::{Instance, InstanceHandle, InstanceStatus, LifecycleBackend, ManagerError};
use crate::exec::{CommandRunner, args};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const SYSTEMCTL: &str = "systemctl";
const SYSTEMCTL_DEADLINE: Duration = Duration::from_secs(10);

/// systemd 后端：每个实例一个 service 单元
pub struct ServiceBackend {
    binary: PathBuf,
    unit_dir: PathBuf,
    runner: Arc<dyn CommandRunner>,
}

impl ServiceBackend {
    pub fn new(
        binary: impl Into<PathBuf>,
        unit_dir: impl Into<PathBuf>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            binary: binary.into(),
            unit_dir: unit_dir.into(),
            runner,
        }
    }

    pub fn unit_name(id: u64) -> String {
        format!("snell-instance-{}.service", id)
    }

    fn unit_path(&self, unit: &str) -> PathBuf {
        self.unit_dir.join(unit)
    }

    fn unit_of(instance: &Instance) -> String {
        match &instance.handle {
            Some(InstanceHandle::Service { unit }) => unit.clone(),
            _ => Self::unit_name(instance.id),
        }
    }

    pub fn render_unit(&self, instance: &Instance) -> String {
        let log = instance.log_file.display();
        format!(
            "[Unit]\n\
             Description=Snell Server Instance {id}\n\
             After=network.target\n\
             \n\
             [Service]\n\
             Type=simple\n\
             ExecStart={bin} -c {conf}\n\
             Restart=on-failure\n\
             RestartSec=5\n\
             StandardOutput=append:{log}\n\
             StandardError=append:{log}\n\
             \n\
             [Install]\n\
             WantedBy=multi-user.target\n",
            id = instance.id,
            bin = self.binary.display(),
            conf = instance.config_file.display(),
            log = log,
        )
    }

    async fn systemctl(&self, id: u64, argv: &[&str]) -> Result<(), ManagerError> {
        let output = self
            .runner
            .run(SYSTEMCTL, &args(argv), SYSTEMCTL_DEADLINE)
            .await?;
        if output.success {
            Ok(())
        } else {
            Err(ManagerError::Command {
                id,
                detail: format!(
                    "systemctl {} exited with {:?}: {}",
                    argv.join(" "),
                    output.code,
                    output.output.trim()
                ),
            })
        }
    }

    async fn is_active(&self, unit: &str) -> Result<bool, ManagerError> {
        let output = self
            .runner
            .run(
                SYSTEMCTL,
                &args(["is-active", "--quiet", unit]),
                SYSTEMCTL_DEADLINE,
            )
            .await?;
        Ok(output.success)
    }
}

#[async_trait]
impl LifecycleBackend for ServiceBackend {
    fn name(&self) -> &'static str {
        "service"
    }

    async fn start(&self, instance: &Instance) -> Result<InstanceHandle, ManagerError> {
        let unit = Self::unit_name(instance.id);
        let path = self.unit_path(&unit);

        tokio::fs::create_dir_all(&self.unit_dir).await?;
        tokio::fs::write(&path, self.render_unit(instance)).await?;
        debug!("Wrote unit file {}", path.display());

        self.systemctl(instance.id, &["daemon-reload"]).await?;
        self.systemctl(instance.id, &["enable", "--now", &unit]).await?;
        // enable --now 不会重启已在运行的单元，restart 让新配置生效
        self.systemctl(instance.id, &["restart", &unit]).await?;

        Ok(InstanceHandle::Service { unit })
    }

    async fn stop(&self, instance: &Instance) -> Result<(), ManagerError> {
        let unit = Self::unit_of(instance);
        let path = self.unit_path(&unit);
        if instance.handle.is_none() && !path.exists() {
            return Ok(());
        }

        if let Err(e) = self.systemctl(instance.id, &["disable", "--now", &unit]).await {
            warn!("Failed to disable {}: {}", unit, e);
        }

        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        self.systemctl(instance.id, &["daemon-reload"]).await
    }

    async fn status(&self, instance: &Instance) -> InstanceStatus {
        let unit = Self::unit_of(instance);
        match self.is_active(&unit).await {
            Ok(true) => InstanceStatus::Running,
            Ok(false) => InstanceStatus::Stopped,
            Err(e) => {
                warn!("Failed to query {}: {}", unit, e);
                InstanceStatus::Error
            }
        }
    }

    async fn holds_port(&self, instance: &Instance) -> bool {
        self.is_active(&Self::unit_of(instance))
            .await
            .unwrap_or(false)
    }

    /// 停用 unit_dir 中遗留的 snell-instance-*.service
    async fn recover_orphans(&self) -> Result<usize, ManagerError> {
        let mut entries = match tokio::fs::read_dir(&self.unit_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut units = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            if let Some(id) = name.to_str().and_then(parse_unit_name) {
                units.push((id, entry.path()));
            }
        }
        units.sort();

        let mut recovered = 0;
        for (id, path) in &units {
            let unit = Self::unit_name(*id);
            info!("Disabling leftover unit {}", unit);
            if let Err(e) = self.systemctl(*id, &["disable", "--now", &unit]).await {
                warn!("Failed to disable leftover unit {}: {}", unit, e);
                continue;
            }
            match tokio::fs::remove_file(path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
            }
            recovered += 1;
        }

        if recovered > 0 {
            if let Some((id, _)) = units.first() {
                self.systemctl(*id, &["daemon-reload"]).await?;
            }
        }
        Ok(recovered)
    }
}

/// snell-instance-{id}.service -> id
fn parse_unit_name(name: &str) -> Option<u64> {
    name.strip_prefix("snell-instance-")?
        .strip_suffix(".service")?
        .parse()
        .ok()
}
