use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing_subscriber::EnvFilter;
use trackplay::{
    ChannelPayload, LoggingConsumer, MemorySource, PlaybackConfig, PlaybackController, PlaybackMode,
};

const VIDEO: &str = "cam/video";
const AUDIO: &str = "cam/audio";

fn archive() -> MemorySource {
    MemorySource::builder("archive")
        .track(VIDEO, "video/jpeg", 100.0, 1.0, 4)
        .track(AUDIO, "audio/basic", 100.0, 0.5, 8)
        .sealed()
        .build()
}

fn print_status(label: &str, controller: &PlaybackController) {
    let bounds = controller
        .query_bounds()
        .map(|b| format!("[{:.2}, {:.2}]", b.min, b.max))
        .unwrap_or_else(|| "unknown".to_string());
    println!(
        "{:<14} position={:?} bounds={} rate={:.2}fps state={}",
        label,
        controller.position(),
        bounds,
        controller.query_rate_estimate(),
        controller.state().name()
    );
}

async fn run_archive(config: PlaybackConfig) -> Result<()> {
    let mut controller =
        PlaybackController::spawn(config, Arc::new(archive()), Box::new(LoggingConsumer::new()))?;

    for mode in [
        PlaybackMode::JumpToStart,
        PlaybackMode::StepForward,
        PlaybackMode::StepForward,
        PlaybackMode::StepBackward,
        PlaybackMode::JumpToEnd,
    ] {
        let id = controller.submit(mode, None, false);
        controller.wait_idle(id).await;
        print_status(mode.name(), &controller);
    }

    let id = controller.set_position(101.5, false);
    controller.wait_idle(id).await;
    print_status("set-position", &controller);

    println!("\nPlaying forward at 1x from the current frame...");
    let id = controller.submit(PlaybackMode::PlayForward, None, false);
    controller.wait_idle(id).await;
    print_status("play-forward", &controller);

    println!("\nPlaying backward for 1.5s...");
    controller.submit(PlaybackMode::PlayBackward, None, false);
    tokio::time::sleep(Duration::from_millis(1500)).await;
    controller.stop().await;
    print_status("play-backward", &controller);

    println!("\n{}", controller.report());
    controller.terminate().await
}

async fn run_live(config: PlaybackConfig) -> Result<()> {
    let live = MemorySource::builder("live").build();
    let mut controller = PlaybackController::spawn(
        config,
        Arc::new(live.clone()),
        Box::new(LoggingConsumer::new()),
    )?;

    let producer = tokio::spawn(async move {
        for idx in 0..10 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let at = 200.0 + idx as f64 * 0.1;
            live.append(ChannelPayload::new(VIDEO, at, 0.1, vec![idx as u8]).with_mime("video/jpeg"))
                .await;
        }
        live.seal();
    });

    println!("\nFollowing live data...");
    // The bounds refresh needs at least one archived frame.
    tokio::time::sleep(Duration::from_millis(150)).await;
    let id = controller.submit(PlaybackMode::RealTime, None, false);
    controller.wait_idle(id).await;
    producer.await?;
    print_status("real-time", &controller);

    controller.terminate().await
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    println!("Track Playback Demo");
    println!("===================\n");

    let config = match std::env::args().nth(1) {
        Some(path) => PlaybackConfig::load(path)?,
        None => PlaybackConfig::new([VIDEO, AUDIO]),
    };

    run_archive(config.clone()).await?;
    run_live(PlaybackConfig::new([VIDEO])).await?;

    println!("\nDemo complete.");
    Ok(())
}
