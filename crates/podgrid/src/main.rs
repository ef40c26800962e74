use anyhow::Result;
use clap::Parser;
use podgrid::cmd;
use podgrid::config::Cli;
use podgrid::config::Commands;
use utils::version;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();
    let _guard = utils::logging::init(cli.log_dir.as_deref());

    tracing::debug!("podgrid {}", &**version::VERSION);

    match cli.command {
        Commands::Serve(args) => cmd::run_serve(*args).await,
        Commands::Sweep(args) => cmd::run_sweep(*args).await,
        Commands::Copy(args) => cmd::run_copy(*args).await,
        Commands::Status(args) => cmd::run_status(*args).await,
    }
}
