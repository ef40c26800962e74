use std::sync::Arc;

use anyhow::Result;
use utils::version;

use crate::cmd::connect;
use crate::config::KubernetesArgs;

pub async fn run_serve(args: KubernetesArgs) -> Result<()> {
    tracing::info!("Starting podgrid {}", &**version::VERSION);

    let client = Arc::new(connect(&args).await?);
    let config = client.config();
    tracing::info!(
        app = %config.app_name,
        copy_strategy = ?client.copy_strategy(),
        image_pull_policy = %config.image_pull_policy,
        node_selector = ?config.node_selector,
        tolerations = config.tolerations.len(),
        scheduler_name = ?config.scheduler_name,
        "Effective configuration"
    );

    let exit_hook = client.initialize_environment().await;
    tracing::info!("Ready, waiting for termination signal");

    exit_hook.await?;
    tracing::info!("Shutdown complete");

    Ok(())
}
