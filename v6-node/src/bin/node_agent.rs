use clap::Parser;
use v6_node::{Agent, NodeConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    simple_logger::init_with_level(log::Level::Info).expect("failed to init logger");
    let config = NodeConfig::parse();

    let (agent, access_token) = Agent::boot(config).await?;
    log::info!("node agent authenticated, entering main loop");
    agent.run(access_token).await
}
