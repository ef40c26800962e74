use anyhow::Result;
use serde::Serialize;

use crate::cmd::connect;
use crate::config::StatusArgs;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusReport<'a> {
    container_id: &'a str,
    ready: bool,
    terminated: bool,
    ip: Option<String>,
}

pub async fn run_status(args: StatusArgs) -> Result<()> {
    let client = connect(&args.kubernetes).await?;

    let (ready, terminated, ip) = tokio::join!(
        client.is_ready(&args.container),
        client.is_terminated(&args.container),
        client.get_container_ip(&args.container),
    );

    let report = StatusReport {
        container_id: &args.container,
        ready,
        terminated,
        ip,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(())
}
