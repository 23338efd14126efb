use cellar_client::EnvSnapshot;
use cellar_worker::{connect, init_tracing, run_until_interrupted, Output, Pipeline, Settings, WorkerError};
use tokio::sync::mpsc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), WorkerError> {
    init_tracing();
    let settings = Settings::new(None)?;
    let validated = settings.validate()?;
    let client = connect(&settings, &EnvSnapshot::from_process()).await?;
    info!("Connected to {}", client.config().endpoint());

    let (sink, outputs) = mpsc::channel::<Output>(settings.queue_capacity);
    let pipeline = Pipeline::from_config(&client, validated, settings.queue_capacity, sink);
    if pipeline.is_idle() {
        warn!("Nothing to run: configure a scan or write section");
        return Ok(());
    }
    run_until_interrupted(pipeline, outputs).await
}
