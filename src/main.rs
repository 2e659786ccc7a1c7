use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use audio_transport::{AudioPlayer, OutputBackend, PlaybackEvent, PlayerConfig};
use clap::Parser;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Plays a file through the transport engine, exercising seek, play and volume.
#[derive(Parser, Debug)]
#[command(name = "audio-transport", version, about)]
struct Args {
    /// Audio file to play
    file: Option<PathBuf>,

    /// TOML file with player settings
    #[arg(long)]
    config: Option<PathBuf>,

    /// Discard audio instead of opening a device
    #[arg(long)]
    null_output: bool,

    /// Print output device names and exit
    #[arg(long)]
    list_devices: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    if args.list_devices {
        for name in AudioPlayer::output_devices()? {
            println!("{name}");
        }
        return Ok(());
    }

    let file = args
        .file
        .context("no audio file given (see --help)")?;

    let mut config = match &args.config {
        Some(path) => PlayerConfig::from_file(path)
            .with_context(|| format!("reading {}", path.display()))?,
        None => PlayerConfig::default(),
    };
    if args.null_output {
        config.output = OutputBackend::Null;
    }

    let player = AudioPlayer::with_config(config)?;

    let (finished_tx, mut finished_rx) = mpsc::unbounded_channel();
    player.set_event_callback(move |event, message| {
        println!("[{event}] {message}");
        if matches!(event, PlaybackEvent::Finished | PlaybackEvent::Error) {
            let _ = finished_tx.send(event);
        }
    });

    println!("loading {}", file.display());
    player.load(&file).await?;

    let status = player.status().await?;
    if let Some(duration) = status.duration {
        println!("duration: {:.1} s", duration.as_secs_f32());
    }
    if let Some(meta) = &status.metadata {
        if let Some(title) = &meta.title {
            println!("title: {title}");
        }
        if let Some(artist) = &meta.artist {
            println!("artist: {artist}");
        }
    }

    println!("seek to 2 s while paused");
    player.seek(2_000).await?;
    sleep(Duration::from_secs(2)).await;

    println!("play");
    player.play().await?;
    sleep(Duration::from_secs(2)).await;

    println!("seek back to the start");
    player.seek(0).await?;
    sleep(Duration::from_secs(5)).await;

    println!("seek to the start again, volume 10%");
    player.seek(0).await?;
    player.set_volume(0.1).await?;

    let status = player.status().await?;
    info!(state = %status.state, position_ms = status.position.as_millis() as u64, "waiting for the end");

    match finished_rx.recv().await {
        Some(PlaybackEvent::Error) => anyhow::bail!("playback failed"),
        _ => println!("done"),
    }
    Ok(())
}
