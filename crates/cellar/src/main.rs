use anyhow::Context;
use cellar::{execute, Cli};
use cellar_client::EnvSnapshot;
use cellar_worker::{connect, init_tracing, Settings};
use clap::Parser;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let settings = Settings::new(cli.config.as_deref()).context("loading settings")?;
    let validated = settings.validate()?;
    let client = connect(&settings, &EnvSnapshot::from_process())
        .await
        .context("connecting to the store")?;
    tracing::info!("Connected to {}", client.config().endpoint());

    execute(cli.command, &client, validated, settings.queue_capacity).await
}
