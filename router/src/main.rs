use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use scatter_router::{config::RouterConfig, server, spec::CompiledSpec, template};

#[derive(Debug, Parser)]
struct Args {
    /// Router config YAML. `${VAR}` placeholders are rendered from the environment.
    #[arg(long, env = "SCATTER_ROUTER_CONFIG")]
    config: PathBuf,
}

async fn read_template(path: &Path) -> anyhow::Result<String> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("read {}", path.display()))?;
    template::render_env_template(&raw).with_context(|| format!("render {}", path.display()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    tracing::info!(config = %args.config.display(), "starting");

    let cfg_yaml = read_template(&args.config).await?;
    let cfg = RouterConfig::from_yaml_bytes(cfg_yaml.as_bytes()).context("parse router config")?;

    let spec_yaml = read_template(&cfg.spec_path).await?;
    let spec = CompiledSpec::from_yaml_bytes(spec_yaml.as_bytes(), cfg.default_deadline_ms)
        .context("compile route spec")?;

    server::run(cfg, spec).await
}
