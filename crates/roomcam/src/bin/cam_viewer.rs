use anyhow::Context;
use argh::FromArgs;
use futures::StreamExt;
use gstreamer::prelude::*;
use roomcam::capture::{self, redact};
use roomcam::config::{report_dotenv, CAMERA_URL_ENV};
use tokio::io::AsyncBufReadExt;

#[derive(FromArgs)]
/// Show an RTSP camera stream in a debug window. Type q and Enter to quit.
struct Args {
    /// stream URL (default: $CAMERA_RTSP_URL)
    #[argh(positional)]
    url: Option<String>,
}

enum Exit {
    Quit,
    EndOfStream,
    Failed(String),
}

/// Resolves when `q` is entered on the terminal
async fn wait_for_quit_key() {
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().eq_ignore_ascii_case("q") {
            return;
        }
    }
    // stdin closed, keep running until another exit condition
    std::future::pending::<()>().await
}

/// Start playback and wait up to 10 seconds for the stream to actually play.
/// A state change still pending at the deadline counts as not opened.
fn wait_until_playing(pipeline: &gstreamer::Pipeline) -> bool {
    if pipeline.set_state(gstreamer::State::Playing).is_err() {
        return false;
    }
    let (result, current, _pending) = pipeline.state(gstreamer::ClockTime::from_seconds(10));
    result.is_ok() && current == gstreamer::State::Playing
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let dotenv = dotenvy::dotenv();

    let env = env_logger::Env::default().default_filter_or("info");
    env_logger::init_from_env(env);

    report_dotenv(dotenv);

    let args: Args = argh::from_env();
    let Some(camera_url) = args.url.or_else(|| std::env::var(CAMERA_URL_ENV).ok()) else {
        log::error!("{} environment variable not set", CAMERA_URL_ENV);
        return Ok(());
    };

    capture::init().context("Failed to initialize GStreamer")?;

    let pipeline_desc = format!(
        "uridecodebin uri={camera_url} ! videoconvert ! autovideosink name=display sync=false"
    );
    let pipeline = gstreamer::parse::launch(&pipeline_desc)
        .context("Failed to build viewer pipeline")?
        .dynamic_cast::<gstreamer::Pipeline>()
        .map_err(|_| anyhow::anyhow!("Failed to downcast pipeline"))?;

    if !wait_until_playing(&pipeline) {
        log::error!("Could not open camera stream at {}", redact(&camera_url));
        let _ = pipeline.set_state(gstreamer::State::Null);
        return Ok(());
    }
    log::info!("Showing {} (q + Enter or Ctrl+C to quit)", redact(&camera_url));

    // Create shutdown channel
    let shutdown_tx = tokio::sync::watch::Sender::new(());
    let mut shutdown_rx = shutdown_tx.subscribe();

    // Set up Ctrl+C handler
    ctrlc::set_handler({
        let shutdown_tx = shutdown_tx.clone();
        move || {
            log::info!("Received Ctrl+C, closing viewer...");
            shutdown_tx.send(()).ok();
        }
    })?;

    let bus = pipeline
        .bus()
        .ok_or_else(|| anyhow::anyhow!("Pipeline has no bus"))?;
    let mut messages = bus.stream();

    let exit = tokio::select! {
        _ = wait_for_quit_key() => Exit::Quit,
        _ = shutdown_rx.changed() => Exit::Quit,
        exit = async {
            while let Some(msg) = messages.next().await {
                match msg.view() {
                    gstreamer::MessageView::Error(err) => {
                        return Exit::Failed(format!(
                            "{} ({})",
                            err.error(),
                            err.debug().map(|d| d.to_string()).unwrap_or_default()
                        ));
                    }
                    gstreamer::MessageView::Eos(_) => return Exit::EndOfStream,
                    _ => {}
                }
            }
            Exit::EndOfStream
        } => exit,
    };

    match exit {
        Exit::Quit => log::info!("Quit requested"),
        Exit::EndOfStream => log::info!("End of stream"),
        Exit::Failed(e) => log::error!("Failed to read frame: {}", e),
    }

    pipeline
        .set_state(gstreamer::State::Null)
        .context("Failed to stop viewer pipeline")?;
    Ok(())
}
