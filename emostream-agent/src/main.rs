use std::sync::Arc;

use clap::Parser;
use emostream_core::{EmostreamConfig, RestSessionApi};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::{fmt, EnvFilter};

use emostream_agent::presenter::{self, Intent};
use emostream_agent::{CameraDevice, CaptureConstraints, ImageFileCamera, SessionController, SyntheticCamera};

#[derive(Parser, Debug)]
#[command(author, version, about = "Stream camera frames to an emotion inference service", long_about = None)]
struct Args {
    #[arg(short, long, default_value = "emostream.toml")]
    config: String,

    /// Replay this still image instead of the synthetic test pattern
    #[arg(long)]
    image: Option<String>,

    /// Width of the display; narrow viewports get the compact resolution
    #[arg(long)]
    viewport_width: Option<u32>,

    /// Start a session immediately instead of waiting for `s`
    #[arg(long)]
    autostart: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    let args = Args::parse();

    let config = match EmostreamConfig::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {}", args.config, e);
            std::process::exit(1);
        }
    };
    if let Err(e) = config.validate() {
        eprintln!("{e}");
        std::process::exit(1);
    }

    let directive: Directive = config
        .service
        .log_level
        .parse()
        .unwrap_or_else(|_| tracing::Level::INFO.into());
    fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(directive))
        .init();

    let api = Arc::new(RestSessionApi::from_config(&config)?);
    let camera: Arc<dyn CameraDevice> = match &args.image {
        Some(path) => Arc::new(ImageFileCamera::new(path)),
        None => Arc::new(SyntheticCamera::new()),
    };
    let constraints = CaptureConstraints::for_viewport(&config.capture, args.viewport_width);

    let controller = SessionController::spawn(config, api, camera, constraints)?;

    let (tx, _rx) = broadcast::channel(1);
    let shutdown_tx = tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown signal received");
        }
        let _ = shutdown_tx.send(());
    });

    let presenter_task = tokio::spawn(presenter::run_presenter(controller.subscribe(), tx.subscribe()));

    tracing::info!("Commands: s = start/stop, p = pause, r = resume, q = quit");
    if args.autostart {
        controller.start().await?;
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut shutdown = tx.subscribe();
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    // stdin closed: keep running until Ctrl+C
                    Ok(None) => {
                        let _ = shutdown.recv().await;
                        break;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to read stdin");
                        break;
                    }
                };
                match presenter::parse_intent(&line, controller.view().status) {
                    Some(Intent::Session(command)) => controller.send(command).await?,
                    Some(Intent::Quit) => break,
                    None => tracing::info!(input = %line.trim(), "Unknown command"),
                }
            }
        }
    }

    controller.shutdown().await;
    let _ = tx.send(());
    let _ = presenter_task.await;

    Ok(())
}
