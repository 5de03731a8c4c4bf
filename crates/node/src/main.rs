use anyhow::Context;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use vantage_node::manager::CameraManager;
use vantage_node::signaling::SignalingEndpoint;
use vantage_protocol::NodeConfig;

fn parse_args() -> (PathBuf, Option<u16>) {
    let args: Vec<String> = std::env::args().collect();
    let mut config_path = PathBuf::from("./config/vantage.toml");
    let mut port_override = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config_path = PathBuf::from(&args[i + 1]);
                    i += 1;
                }
            }
            "--port" | "-p" => {
                if i + 1 < args.len() {
                    port_override = args[i + 1].parse().ok();
                    i += 1;
                }
            }
            "-V" | "--version" => {
                println!("vantage-node {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "-h" | "--help" => {
                println!("vantage-node - multi-camera RTSP to WebRTC streaming node");
                println!();
                println!("USAGE:");
                println!("    vantage-node [OPTIONS]");
                println!();
                println!("OPTIONS:");
                println!("    --config <PATH>    Configuration file [default: ./config/vantage.toml]");
                println!("    --port <PORT>      Override the signaling port");
                println!("    -V, --version      Print version");
                std::process::exit(0);
            }
            _ => {}
        }
        i += 1;
    }

    (config_path, port_override)
}

fn load_config(path: &PathBuf) -> anyhow::Result<NodeConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let config: NodeConfig = toml::from_str(&text)
        .with_context(|| format!("Failed to parse config file {}", path.display()))?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let (config_path, port_override) = parse_args();
    let mut config = load_config(&config_path)?;
    if let Some(port) = port_override {
        config.signaling.port = port;
    }

    if let Err(issues) = config.validate() {
        let has_errors = issues.iter().any(|i| i.starts_with("ERROR:"));
        for issue in &issues {
            if issue.starts_with("ERROR:") {
                error!("{issue}");
            } else {
                warn!("{issue}");
            }
        }
        if has_errors {
            anyhow::bail!("configuration is invalid, refusing to start");
        }
    }

    gstreamer::init().context("Failed to initialize GStreamer")?;

    info!(
        cameras = config.cameras.len(),
        bind = %config.signaling.bind,
        port = config.signaling.port,
        "Starting vantage-node"
    );

    let endpoint = SignalingEndpoint::new();
    let manager = CameraManager::new(Arc::clone(&endpoint), &config.signaling);
    for camera in config.cameras {
        manager.add(camera)?;
    }

    // Serial probing first; cameras that never come up are reported and
    // retried inside, fatal ones are disabled.
    manager.initialize_all().await;
    manager.start_all().await;

    let serve = tokio::spawn(
        Arc::clone(&endpoint).serve(config.signaling.bind.clone(), config.signaling.port),
    );

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT, shutting down");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down");
        }
    }

    serve.abort();
    manager.stop_all().await;
    info!("Shutdown complete");
    Ok(())
}
