use anyhow::Result;
use clap::Parser;
use relay_server::{AppConfig, RelayApp};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, reload, EnvFilter};

/// 将受保护的上游直播流转封装为本地 HLS
#[derive(Debug, Parser)]
#[command(name = "hls-relay", version, about)]
struct Cli {
    /// 配置文件路径，不存在时写出默认配置
    #[arg(long, default_value = "hls-relay.toml")]
    config: PathBuf,

    /// 覆盖配置中的频道名称
    #[arg(long)]
    channel: Option<String>,

    /// 不自动启动会话，等待 API 请求
    #[arg(long)]
    no_auto_start: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 初始化日志：配置加载前先用 RUST_LOG 或 info，加载后按配置调整
    let rust_log_set = std::env::var_os("RUST_LOG").is_some();
    let initial = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let (filter, filter_handle) = reload::Layer::new(initial);
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .init();

    info!("🚀 HLS relay starting...");

    // 加载配置
    let mut config = AppConfig::load(&cli.config).await?;
    config.apply_env_overrides();
    if let Some(channel) = cli.channel {
        config.upstream.channel_name = channel;
    }
    if cli.no_auto_start {
        config.session.auto_start = false;
    }
    config.validate()?;

    // RUST_LOG 优先于配置中的日志级别
    if !rust_log_set {
        match EnvFilter::try_new(&config.logging.level) {
            Ok(level) => {
                if let Err(e) = filter_handle.reload(level) {
                    warn!("Failed to apply log level '{}': {}", config.logging.level, e);
                }
            }
            Err(e) => warn!("Invalid log level '{}': {}", config.logging.level, e),
        }
    }

    info!("✓ Configuration loaded from {}", cli.config.display());
    info!(
        "✓ Channel '{}' from {}",
        config.upstream.channel_name, config.upstream.descriptor_url
    );

    let app = RelayApp::from_config(config)?;
    info!("✓ Session supervisor initialized");
    info!("✓ Manifest will be published at {}", app.publisher().manifest_url());

    app.run(shutdown_signal()).await?;

    info!("👋 HLS relay stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
