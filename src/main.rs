use clap::{Arg, Command};
use snell_agent::{Agent, config::Settings, monitoring::setup_logging};
use tracing::{error, info};

// 版本信息常量
const VERSION: &str = env!("CARGO_PKG_VERSION");
const BUILD_TIME: &str = env!("BUILD_TIME");
const GIT_HASH: &str = env!("GIT_HASH");
const RUST_VERSION: &str = env!("RUST_VERSION");
const TARGET_ARCH: &str = env!("TARGET_ARCH");

fn get_version_info() -> String {
    format!(
        "Snell Agent v{}\n\
        Build Information:\n\
        ├─ Build Time: {}\n\
        ├─ Git Hash: {}\n\
        ├─ Rust Version: {}\n\
        └─ Target: {}",
        VERSION, BUILD_TIME, GIT_HASH, RUST_VERSION, TARGET_ARCH
    )
}

fn build_cli() -> Command {
    Command::new("snell-agent")
        .version(VERSION)
        .about("Node agent that keeps local snell-server instances in sync with the master")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Specify configuration file path")
                .default_value("/etc/snell-agent/agent.toml"),
        )
        .arg(
            Arg::new("version-info")
                .long("version-info")
                .help("Show detailed version and build information")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("Override log level (trace, debug, info, warn, error)"),
        )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let matches = build_cli().get_matches();

    if matches.get_flag("version-info") {
        println!("{}", get_version_info());
        return Ok(());
    }

    let config_path = matches
        .get_one::<String>("config")
        .map(String::as_str)
        .unwrap_or("/etc/snell-agent/agent.toml");

    let mut settings = Settings::load_from_path(config_path).await?;
    if let Some(level) = matches.get_one::<String>("log-level") {
        settings.logging.level = level.clone();
    }
    setup_logging(&settings.logging)?;

    info!("Starting Snell Agent v{}", VERSION);
    info!("Build: {} ({})", GIT_HASH, BUILD_TIME);
    info!(
        "Node: {} {} {}",
        settings.agent.node_name, settings.agent.location, settings.agent.country_code
    );
    info!("  Master: {}", settings.agent.master_url);
    info!("  Instance dir: {}", settings.agent.instance_dir.display());
    info!("  Backend: {}", settings.agent.backend);
    info!("  Process ID: {}", std::process::id());

    let agent = Agent::new(settings, VERSION)?;
    match agent.run().await {
        Ok(signal) => info!("Snell Agent stopped after {}", signal),
        Err(e) => {
            error!("Snell Agent failed: {:#}", e);
            return Err(e);
        }
    }

    Ok(())
}
