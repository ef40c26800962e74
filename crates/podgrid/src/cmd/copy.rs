use anyhow::anyhow;
use anyhow::Context;
use anyhow::Result;

use crate::cmd::connect;
use crate::config::CopyArgs;
use crate::platform::k8s::artifacts;

pub async fn run_copy(args: CopyArgs) -> Result<()> {
    let client = connect(&args.kubernetes).await?;

    tokio::fs::create_dir_all(&args.output)
        .await
        .with_context(|| format!("create output directory {}", args.output.display()))?;

    let stream = client
        .copy_artifacts(&args.container, &args.folder)
        .await
        .map_err(|e| anyhow!("{e:?}"))?;
    let written = artifacts::write_to_dir(stream, &args.output)
        .await
        .map_err(|e| anyhow!("{e:?}"))?;

    tracing::info!(
        container_id = %args.container,
        copy_strategy = ?client.copy_strategy(),
        written,
        "Copied artifacts to {}",
        args.output.display()
    );
    println!("{written} artifacts written to {}", args.output.display());

    Ok(())
}
