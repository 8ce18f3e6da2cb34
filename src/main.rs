use clap::Parser;
use pagefetch::{install_prometheus_exporter, load_config, setup_logging, validate_config, Cli, CliRunner, Commands};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();

    setup_logging(args.verbose)?;

    info!("Starting pagefetch v{}", env!("CARGO_PKG_VERSION"));

    if let Commands::Validate { path } = &args.command {
        return validate_config(path);
    }

    if let Some(port) = args.metrics_port {
        install_prometheus_exporter(port)?;
        info!("Serving metrics on port {}", port);
    }

    let config = load_config(&args)?;
    let runner = CliRunner::new(config).await?;

    let result = tokio::select! {
        result = runner.run(args.command) => {
            info!("Command completed");
            result
        }
        _ = shutdown_signal() => {
            info!("Received shutdown signal");
            Ok(())
        }
    };

    info!("Shutting down...");
    runner.service.shutdown().await;

    if let Err(e) = result {
        error!("{:#}", e);
        std::process::exit(1);
    }

    info!("pagefetch stopped");
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
        (Ok(mut sigint), Ok(mut sigterm)) => {
            tokio::select! {
                _ = sigint.recv() => info!("Received SIGINT"),
                _ = sigterm.recv() => info!("Received SIGTERM"),
            }
        }
        (Err(e), _) | (_, Err(e)) => {
            warn!("Cannot install signal handlers ({}); falling back to Ctrl-C", e);
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Cannot listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Cannot listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}
