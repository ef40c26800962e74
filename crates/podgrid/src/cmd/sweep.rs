use anyhow::anyhow;
use anyhow::Result;

use crate::cmd::connect;
use crate::config::KubernetesArgs;

pub async fn run_sweep(args: KubernetesArgs) -> Result<()> {
    let client = connect(&args).await?;

    let summary = client
        .delete_leftover_pods()
        .await
        .map_err(|e| anyhow!("{e:?}"))?;

    println!("deleted: {}, failed: {}", summary.deleted, summary.failed);
    if summary.failed > 0 {
        return Err(anyhow!("{} pods could not be deleted", summary.failed));
    }

    Ok(())
}
