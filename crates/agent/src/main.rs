use agent::{Args, ClusterConfig};
use clap::Parser;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = ClusterConfig::try_from(args)?;

    agent::spawn_service(config).await;
    Ok(())
}
