use anyhow::Result;
use clap::Parser;
use tracing::info;

/// 多协议隧道网关
#[derive(Debug, Parser)]
#[command(name = "edgegate", version, about)]
struct Cli {
    /// 配置文件路径
    #[arg(short, long, default_value = "config.yaml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = edgegate::config::load_config(&cli.config)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log.level)),
        )
        .init();

    info!(path = cli.config.as_str(), "EdgeGate starting");

    let app = edgegate::app::App::new(config)?;
    app.run().await?;

    Ok(())
}
