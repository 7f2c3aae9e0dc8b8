//! Host entry point: parse flags, load config, start the lifecycle host,
//! serve the stdio transport until EOF, shutdown, or SIGINT.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use toolbridge::config::Config;
use toolbridge::host::LifecycleHost;

#[derive(Parser)]
#[command(name = "toolbridge", version, about = "Tool-serving bridge: code kernel, knowledge index, sub-agents")]
struct Args {
    /// Run the kernel as a bare subprocess instead of a container.
    #[arg(long)]
    no_kernel_container: bool,

    /// Attach to an already-running kernel at this URL.
    #[arg(long)]
    kernel_url: Option<String>,

    /// Path to a JSON config file.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    // Logs go to stderr; stdout carries the JSON-RPC transport.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let mut config = match Config::load(args.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "failed to load configuration");
            return ExitCode::from(2);
        }
    };
    if args.no_kernel_container {
        config.kernel.tier = 1;
    }
    if args.kernel_url.is_some() {
        config.kernel.url = args.kernel_url;
    }

    let mut host = match LifecycleHost::start(config).await {
        Ok(h) => h,
        Err(e) => {
            error!(error = %e, "startup failed");
            return ExitCode::from(1);
        }
    };

    let served = tokio::select! {
        result = host.serve_stdio() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
            Ok(())
        }
    };

    host.stop().await;

    match served {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "transport error");
            ExitCode::from(1)
        }
    }
}
