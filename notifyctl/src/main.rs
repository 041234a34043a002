use clap::Parser;
use notifyctl::{Application, Config, config::Command, telemetry};

/// Resolves on Ctrl+C or, on unix, SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm = signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");
        let received = tokio::select! {
            _ = tokio::signal::ctrl_c() => "SIGINT",
            _ = sigterm.recv() => "SIGTERM",
        };
        tracing::info!(signal = received, "Shutting down, finishing in-flight requests");
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.expect("Failed to install Ctrl+C handler");
        tracing::info!(signal = "SIGINT", "Shutting down, finishing in-flight requests");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // The provider, scheduler and OTLP clients all need a rustls provider
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    let args = notifyctl::config::Args::parse();
    let config = Config::load(&args)?;

    if args.validate {
        println!("Configuration is valid.");
        return Ok(());
    }

    telemetry::init_telemetry(config.enable_otel_export)?;
    tracing::debug!("{:?}", args);

    let app = Application::new(config).await?;
    match args.command.unwrap_or_default() {
        Command::Serve => app.serve(shutdown_signal()).await,
        job => app.run_once(job).await,
    }
}
