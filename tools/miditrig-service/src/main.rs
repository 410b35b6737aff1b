//! MIDI Request Trigger service
//!
//! Loads the router configuration, connects every router to its MIDI
//! device and MQTT broker, and serves the request trigger URIs over HTTP
//! until interrupted.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use miditrig_bridge::{http, FatalError, MidiPortProvider, MidiRouter, MidirProvider, RouterContext};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod config;
mod logging;

use config::Config;

#[derive(Parser)]
#[command(name = "midi-request-trigger")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// HTTP bind address, overrides the configuration file
    #[arg(long)]
    http_bind: Option<String>,

    /// HTTP port, overrides the configuration file
    #[arg(long)]
    http_port: Option<u16>,

    /// List MIDI input and output ports and exit
    #[arg(short, long)]
    list: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let source = Config::discover(cli.config.as_deref());
    let loaded = source.as_deref().map(Config::load);
    let mut config = match &loaded {
        Some(Ok(config)) => config.clone(),
        _ => Config::default(),
    };

    if let Some(bind) = cli.http_bind {
        config.http.bind_addr = bind;
    }
    if let Some(port) = cli.http_port {
        config.http.port = port;
    }

    let (_log_guard, log_warnings) = logging::init(&config)?;
    for warning in log_warnings {
        warn!("{}", warning);
    }

    if let Some(path) = cli.config.as_deref().filter(|p| !p.is_file()) {
        warn!("Configuration file {} not found", path.display());
    }
    match (source, loaded) {
        (Some(path), Some(Ok(_))) => info!("Loaded configuration from {}", path.display()),
        (_, Some(Err(e))) => error!("{:#}. Using the default configuration.", e),
        _ => info!("No configuration file found. Using the default configuration."),
    }
    for warning in config.warnings() {
        warn!("{}", warning);
    }

    let provider = MidirProvider::default();
    if cli.list {
        list_ports(&provider);
        return Ok(());
    }
    if config.midi_routers.is_empty() {
        warn!("No midi routers configured");
        list_ports(&provider);
        return Ok(());
    }

    run(config, provider).await
}

fn list_ports(provider: &dyn MidiPortProvider) {
    match provider.input_ports() {
        Ok(ports) => {
            println!("MIDI inputs:");
            for port in ports {
                println!("  {}", port);
            }
        }
        Err(e) => error!("Failed to list MIDI inputs: {}", e),
    }

    match provider.output_ports() {
        Ok(ports) => {
            println!("MIDI outputs:");
            for port in ports {
                println!("  {}", port);
            }
        }
        Err(e) => error!("Failed to list MIDI outputs: {}", e),
    }
}

async fn run(config: Config, provider: MidirProvider) -> Result<()> {
    let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel::<FatalError>();
    let context = RouterContext::new(
        Arc::new(provider),
        Arc::new(miditrig_bridge::RumqttConnector),
    )
    .with_fatal_sink(fatal_tx);

    let mut routers = Vec::with_capacity(config.midi_routers.len());
    for router_config in config.midi_routers {
        let name = router_config.name.clone();
        let router = MidiRouter::new(router_config, context.clone())
            .with_context(|| format!("Failed to create router {}", name))?;
        routers.push(Arc::new(router));
    }
    drop(context);

    for router in &routers {
        router.connect()?;
        info!(router = %router.name(), "Router started for device: {}", router.config().device);
    }

    let addr = config.http.socket_addr()?;
    let listener = http::bind(addr)
        .await
        .with_context(|| format!("Failed to bind http server to {}", addr))?;
    let app = http::build_app(&routers, config.http.debug);

    let shutdown = CancellationToken::new();
    let mut server = tokio::spawn(http::serve(listener, app, shutdown.clone()));

    let outcome = tokio::select! {
        _ = shutdown_signal() => {
            info!("Received shutdown signal");
            Ok(())
        }
        Some(fatal) = fatal_rx.recv() => {
            error!("{}", fatal);
            Err(anyhow!("{}", fatal))
        }
        result = &mut server => {
            match result {
                Ok(Ok(())) => Err(anyhow!("HTTP server stopped unexpectedly")),
                Ok(Err(e)) => Err(anyhow!(e).context("HTTP server failed")),
                Err(e) => Err(anyhow!(e).context("HTTP server task failed")),
            }
        }
    };

    shutdown.cancel();
    if !server.is_finished() {
        match server.await {
            Ok(Err(e)) => error!("HTTP server error: {}", e),
            Err(e) => error!("HTTP server task error: {}", e),
            Ok(Ok(())) => {}
        }
    }

    for router in &routers {
        router.disconnect().await;
        info!(router = %router.name(), "Router stopped");
    }
    info!("Shutdown complete");

    outcome
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl+c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
