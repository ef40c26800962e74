//! Command layer - Entry points for the podgrid subcommands

pub mod copy;
pub mod serve;
pub mod status;
pub mod sweep;

pub use copy::run_copy;
pub use serve::run_serve;
pub use status::run_status;
pub use sweep::run_sweep;

use anyhow::anyhow;
use anyhow::Result;

use crate::config::KubernetesArgs;
use crate::platform::k8s::ContainerClient;

async fn connect(args: &KubernetesArgs) -> Result<ContainerClient> {
    ContainerClient::init(args)
        .await
        .map_err(|e| anyhow!("{e:?}"))
}
