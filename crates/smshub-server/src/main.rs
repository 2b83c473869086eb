use anyhow::Context;
use clap::Parser;
use smshub_core::{AssigneeGate, SmsHub};
use smshub_server::{AppState, config::ServerConfig, create_router};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "smshub-server", about = "Virtual number rental and SMS aggregation service")]
struct Args {
    /// TOML 配置文件
    #[arg(short, long, env = "SMSHUB_CONFIG")]
    config: Option<PathBuf>,

    /// 覆盖配置里的监听地址
    #[arg(long, env = "SMSHUB_BIND")]
    bind: Option<String>,

    #[arg(long, env = "SMSHUB_LOG_LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::default(),
    };
    if let Some(bind) = args.bind {
        config.bind = bind;
    }
    if let Some(level) = args.log_level {
        config.log_level = level;
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("🚀 smshub-server 启动中: providers={}", config.hub.providers.len());

    let hub = SmsHub::builder()
        .config(config.hub.clone())
        .access_gate(Arc::new(AssigneeGate::with_operators(config.operators.clone())))
        .build()
        .await
        .context("failed to initialize hub")?;
    hub.start().await.context("failed to start background tasks")?;

    let app = create_router(AppState::new(hub.clone()));
    let listener = tokio::net::TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;
    info!("✅ 监听 http://{}", config.bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    hub.shutdown().await.context("failed to shut down hub")?;
    info!("👋 已退出");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("无法监听退出信号: {}", e);
    }
    info!("收到退出信号，开始关闭");
}
