use super::{Instance, ManagerError};
use std::os::unix::fs::PermissionsExt;
use tracing::debug;

/// 渲染 snell-server 配置文件内容
pub fn render_config(port: u16, psk: &str, obfs: &str) -> String {
    let mut content = format!("[snell-server]\nlisten = 0.0.0.0:{}\npsk = {}\n", port, psk);
    let obfs = obfs.trim();
    if !obfs.is_empty() {
        content.push_str(&format!("obfs = {}\n", obfs));
    }
    content
}

/// 写入实例配置文件，权限 0600
pub async fn write_config(instance: &Instance, port: u16) -> Result<(), ManagerError> {
    if let Some(parent) = instance.config_file.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let content = render_config(port, &instance.psk, &instance.obfs);
    tokio::fs::write(&instance.config_file, content).await?;
    tokio::fs::set_permissions(&instance.config_file, std::fs::Permissions::from_mode(0o600))
        .await?;

    debug!(
        "Wrote config for instance {} to {}",
        instance.id,
        instance.config_file.display()
    );
    Ok(())
}
