use crate::client::{ClientError, DistributionConfig, MasterClient};
use crate::exec::{CommandRunner, ExecError, args};
use std::fs::File;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const DOWNLOAD_DEADLINE: Duration = Duration::from_secs(5 * 60);
const VERSION_DEADLINE: Duration = Duration::from_secs(10);
const BINARY_PREFIX: &str = "snell-server";

/// 安装错误
#[derive(Debug, thiserror::Error)]
pub enum InstallError {
    #[error("unsupported architecture: {0}")]
    UnsupportedArch(String),

    #[error("no download url for architecture {0}")]
    MissingDownloadUrl(String),

    #[error("download failed: {0}")]
    Download(#[from] ClientError),

    #[error("invalid archive: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("archive entry escapes the extraction directory: {0}")]
    UnsafeEntry(String),

    #[error("no snell-server executable found in archive")]
    BinaryNotFound,

    #[error("version check failed: {0}")]
    Verify(String),

    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// 把 Rust 的架构名映射为发布包使用的名称
pub fn map_arch(arch: &str) -> Result<&'static str, InstallError> {
    match arch {
        "x86_64" => Ok("amd64"),
        "x86" => Ok("i386"),
        "aarch64" => Ok("aarch64"),
        "arm" => Ok("armv7l"),
        other => Err(InstallError::UnsupportedArch(other.to_string())),
    }
}

pub fn detect_arch() -> Result<&'static str, InstallError> {
    map_arch(std::env::consts::ARCH)
}

/// snell-server 安装器
pub struct Installer {
    client: Arc<MasterClient>,
    runner: Arc<dyn CommandRunner>,
    binary: PathBuf,
}

impl Installer {
    pub fn new(
        client: Arc<MasterClient>,
        runner: Arc<dyn CommandRunner>,
        binary: impl Into<PathBuf>,
    ) -> Self {
        Self {
            client,
            runner,
            binary: binary.into(),
        }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    pub fn is_installed(&self) -> bool {
        self.binary.is_file()
    }

    /// 调用 `<binary> -v` 读取版本
    pub async fn version(&self) -> Result<String, InstallError> {
        let program = self.binary.to_string_lossy();
        let output = self
            .runner
            .run(&program, &args(["-v"]), VERSION_DEADLINE)
            .await?;
        if !output.success {
            return Err(InstallError::Verify(output.output.trim().to_string()));
        }
        Ok(output.output.trim().to_string())
    }

    /// 缺少二进制时从 Master 获取下载配置并安装
    pub async fn ensure_installed(&self) -> Result<(), InstallError> {
        if self.is_installed() {
            match self.version().await {
                Ok(version) => info!("Snell server present: {}", version),
                Err(e) => warn!("Snell server present but version check failed: {}", e),
            }
            return Ok(());
        }

        info!(
            "Snell server not found at {}, installing",
            self.binary.display()
        );
        let distribution = self.client.fetch_distribution_config().await?;
        self.install(&distribution).await?;
        Ok(())
    }

    /// 下载、解压并安装二进制，返回探测到的版本
    pub async fn install(
        &self,
        distribution: &DistributionConfig,
    ) -> Result<Option<String>, InstallError> {
        let arch = detect_arch()?;
        let url = distribution
            .download_urls
            .get(arch)
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| InstallError::MissingDownloadUrl(arch.to_string()))?;

        info!(
            "Downloading snell-server {} for {} from {}",
            distribution.version, arch, url
        );

        let workdir = tempfile::Builder::new().prefix("snell-install-").tempdir()?;
        let archive = workdir.path().join("snell.zip");
        let extract_dir = workdir.path().join("extract");

        let size = self
            .client
            .download_to(url, &archive, DOWNLOAD_DEADLINE)
            .await?;
        debug!("Downloaded archive of {} bytes", size);

        let found = {
            let archive = archive.clone();
            let extract_dir = extract_dir.clone();
            tokio::task::spawn_blocking(move || {
                extract_archive(&archive, &extract_dir)?;
                find_binary(&extract_dir)
            })
            .await
            .map_err(|e| InstallError::Io(std::io::Error::other(e)))??
        };

        if let Some(parent) = self.binary.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        move_file(&found, &self.binary).await?;
        tokio::fs::set_permissions(&self.binary, std::fs::Permissions::from_mode(0o755)).await?;

        match self.version().await {
            Ok(version) => {
                info!("Snell server installed: {}", version);
                Ok(Some(version))
            }
            Err(e) => {
                warn!("Snell server installed but version check failed: {}", e);
                Ok(None)
            }
        }
    }
}

/// 解压 zip，任何越出目标目录的条目都会让整个归档被拒绝
pub fn extract_archive(archive: &Path, dest: &Path) -> Result<(), InstallError> {
    let mut zip = zip::ZipArchive::new(File::open(archive)?)?;
    std::fs::create_dir_all(dest)?;

    for i in 0..zip.len() {
        let mut entry = zip.by_index(i)?;
        let name = entry.name().to_string();
        let relative = entry
            .enclosed_name()
            .ok_or_else(|| InstallError::UnsafeEntry(name.clone()))?;
        let target = dest.join(relative);
        if !target.starts_with(dest) {
            return Err(InstallError::UnsafeEntry(name));
        }

        if entry.is_dir() {
            std::fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&target)?;
        std::io::copy(&mut entry, &mut out)?;
    }
    Ok(())
}

/// 在目录树中找第一个名字以 snell-server 开头的文件
pub fn find_binary(dir: &Path) -> Result<PathBuf, InstallError> {
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        let mut entries: Vec<_> = std::fs::read_dir(&current)?.collect::<Result<_, _>>()?;
        entries.sort_by_key(|entry| entry.file_name());

        for entry in entries {
            let path = entry.path();
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                pending.push(path);
            } else if file_type.is_file()
                && entry
                    .file_name()
                    .to_string_lossy()
                    .starts_with(BINARY_PREFIX)
            {
                return Ok(path);
            }
        }
    }
    Err(InstallError::BinaryNotFound)
}

/// rename，跨文件系统时退回 copy + remove
async fn move_file(from: &Path, to: &Path) -> Result<(), InstallError> {
    if tokio::fs::rename(from, to).await.is_ok() {
        return Ok(());
    }
    tokio::fs::copy(from, to).await?;
    tokio::fs::remove_file(from).await?;
    Ok(())
}
