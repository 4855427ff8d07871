//! Audio Receiver Application
//!
//! Connects to a streaming host, keeps the connection alive across drops,
//! and hands the live stream to a player.
//!
//! Usage: receiver [ENDPOINT] [IDENTIFIER] [--config PATH] [--output KIND]
//!                 [--format FORMAT] [--relay CODE] [--no-ui] [--list-devices]

use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lan_voice_receiver::{
    audio::{PipePlayerFactory, PlayerFactory},
    config::{AppConfig, OutputKind, RelayConfig, SavedSession},
    lifecycle::{Controller, ControllerConfig},
    network::WsConnector,
    ui::WebServer,
};

#[derive(Default)]
struct Args {
    endpoint: Option<String>,
    identifier: Option<String>,
    config_path: Option<PathBuf>,
    output: Option<String>,
    format: Option<String>,
    relay: Option<String>,
    no_ui: bool,
    list_devices: bool,
}

fn parse_args() -> Result<Args> {
    let mut args = Args::default();
    let mut positional = Vec::new();
    let mut iter = std::env::args().skip(1);

    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" => args.config_path = Some(iter.next().context("--config needs a path")?.into()),
            "--output" => args.output = Some(iter.next().context("--output needs a value")?),
            "--format" => args.format = Some(iter.next().context("--format needs a value")?),
            "--relay" => args.relay = Some(iter.next().context("--relay needs a session code")?),
            "--no-ui" => args.no_ui = true,
            "--list-devices" => args.list_devices = true,
            flag if flag.starts_with("--") => bail!("Unknown option {}", flag),
            _ => positional.push(arg),
        }
    }

    let mut positional = positional.into_iter();
    args.endpoint = positional.next();
    args.identifier = positional.next();
    if let Some(extra) = positional.next() {
        bail!("Unexpected argument {}", extra);
    }
    Ok(args)
}

// stdout | discard | file:PATH | device[:NAME]
fn apply_output(config: &mut AppConfig, output: &str) -> Result<()> {
    let (kind, rest) = match output.split_once(':') {
        Some((kind, rest)) => (kind, Some(rest)),
        None => (output, None),
    };

    match kind {
        "stdout" => config.output.kind = OutputKind::Stdout,
        "discard" => config.output.kind = OutputKind::Discard,
        "file" => {
            config.output.kind = OutputKind::File;
            config.output.path = Some(rest.context("file output needs a path")?.into());
        }
        "device" => {
            config.output.kind = OutputKind::Device;
            config.output.device = rest.map(str::to_string);
        }
        other => bail!("Unknown output kind {}", other),
    }
    Ok(())
}

fn player_factory(config: &AppConfig) -> Result<Arc<dyn PlayerFactory>> {
    let factory: Arc<dyn PlayerFactory> = match config.output.kind {
        OutputKind::Stdout => Arc::new(PipePlayerFactory::stdout()),
        OutputKind::Discard => Arc::new(PipePlayerFactory::discard()),
        OutputKind::File => {
            let path = config
                .output
                .path
                .clone()
                .context("output.path is required for file output")?;
            Arc::new(PipePlayerFactory::file(path))
        }
        #[cfg(feature = "cpal-output")]
        OutputKind::Device => Arc::new(lan_voice_receiver::audio::pcm::PcmPlayerFactory::new(
            config.output.clone(),
        )),
        #[cfg(not(feature = "cpal-output"))]
        OutputKind::Device => bail!("Device output requires the cpal-output feature"),
    };
    Ok(factory)
}

#[cfg(feature = "cpal-output")]
fn print_devices() {
    println!("\n=== Available Output Devices ===");
    for device in lan_voice_receiver::audio::device::list_output_devices() {
        let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
        println!("  {}{}:", device.name, default_marker);
        println!("    Sample rates: {:?}", device.sample_rates);
        println!("    Channels: {:?}", device.channels);
    }
    println!();
}

#[cfg(not(feature = "cpal-output"))]
fn print_devices() {
    println!("Device output is not available in this build");
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr; stdout may carry the raw stream
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = parse_args()?;
    if args.list_devices {
        print_devices();
        return Ok(());
    }

    tracing::info!("Starting LAN Voice Receiver");

    let config_path = args.config_path.clone().or_else(AppConfig::default_path);
    let mut config = match &config_path {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::default(),
    };

    if let Some(output) = &args.output {
        apply_output(&mut config, output)?;
    }
    if let Some(format) = &args.format {
        config.stream.format = format.clone();
    }
    if let Some(code) = &args.relay {
        config.stream.relay = Some(RelayConfig {
            session_code: code.clone(),
            ..RelayConfig::default()
        });
    }
    config.validate()?;

    let players = player_factory(&config)?;
    let controller = Controller::spawn(
        ControllerConfig::from(&config),
        Arc::new(WsConnector::new()),
        players,
    )?;

    let _web_handle = if config.ui.enabled && !args.no_ui {
        Some(WebServer::new(config.ui.clone(), controller.clone()).start_background())
    } else {
        None
    };

    let mut status = controller.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = status.recv().await {
            eprintln!("[{}] {}", event.at.format("%H:%M:%S"), event.status.message());
        }
    });

    let requested = match (&args.endpoint, &args.identifier) {
        (Some(endpoint), identifier) => Some(SavedSession {
            endpoint: endpoint.clone(),
            identifier: identifier.clone().unwrap_or_default(),
        }),
        (None, _) => config.last_session.clone(),
    };

    match requested {
        Some(session) => {
            let identity = controller.start(&session.endpoint, &session.identifier)?;
            tracing::info!("Receiving from {}", identity);

            config.last_session = Some(SavedSession {
                endpoint: identity.endpoint().to_string(),
                identifier: identity.identifier().to_string(),
            });
            if let Some(path) = &config_path {
                if let Err(e) = config.save(path) {
                    tracing::warn!("Could not remember session: {}", e);
                }
            }
        }
        None => tracing::info!("No session given; waiting for a start request"),
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    controller.stop()?;

    let mut watch = controller.watch();
    let _ = tokio::time::timeout(
        std::time::Duration::from_secs(2),
        watch.wait_for(|s| !s.state.is_active()),
    )
    .await;

    Ok(())
}
