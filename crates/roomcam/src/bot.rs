//! Bot entry points: wire the camera into the room and run until someone leaves.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::capture::redact;
use crate::config::{BotConfig, CaptureParams, SourceConfig};
use crate::pipeline::{FrameProcessor, Pipeline, PipelineRunner, PipelineTask};
use crate::processors::{CaptureSource, FrameLogger, GstPipelineSource};
use crate::transport::RoomTransport;

/// Arguments of one bot session, as handed over by whoever starts the bot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionArguments {
    pub room_url: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    /// Free-form request body
    #[serde(default)]
    pub body: Option<serde_json::Value>,
}

/// Build the camera stage selected by the configuration
pub fn build_source(config: &BotConfig) -> anyhow::Result<Option<Box<dyn FrameProcessor>>> {
    let source: Box<dyn FrameProcessor> = match &config.source {
        SourceConfig::Gstreamer { .. } => {
            let description = config
                .source
                .launch_description()
                .ok_or_else(|| anyhow::anyhow!("gstreamer source without a pipeline"))?;
            Box::new(GstPipelineSource::new(
                &description,
                config.source.output_params(),
            )?)
        }
        SourceConfig::Capture {
            url,
            width,
            height,
            fps,
            retry_delay_ms,
        } => Box::new(CaptureSource::new(
            url.clone(),
            CaptureParams {
                width: *width,
                height: *height,
                fps: *fps,
                retry_delay: Duration::from_millis(*retry_delay_ms),
            },
        )),
        SourceConfig::None => return Ok(None),
    };
    Ok(Some(source))
}

/// Run one session: join the room, stream the camera, stop when a
/// participant leaves or the process is interrupted.
pub async fn run_session(
    args: &SessionArguments,
    config: &BotConfig,
    runner: PipelineRunner,
) -> anyhow::Result<()> {
    log::debug!("Starting bot in room: {}", args.room_url);

    let transport = RoomTransport::new(
        &args.room_url,
        args.token.clone(),
        &config.bot_name,
        config.transport.clone(),
    )?;

    let mut processors: Vec<Box<dyn FrameProcessor>> = Vec::new();
    if let Some(source) = build_source(config)? {
        if let Some(url) = config.source.url().filter(|u| !u.is_empty()) {
            log::info!("Camera source: {}", redact(url));
        }
        processors.push(source);
        if config.log_frames {
            processors.push(Box::new(FrameLogger::new("After camera processor")));
        }
    }
    processors.push(Box::new(transport.output()));

    let mut task = PipelineTask::new(Pipeline::new(processors), config.pipeline)?;

    transport.on_first_participant_joined(|participant| {
        log::info!("First participant joined: {}", participant.id);
    });

    let handle = task.handle();
    transport.on_participant_left(move |participant, reason| {
        log::info!(
            "Participant left: {} ({}), reason: {}",
            participant.name,
            participant.id,
            reason
        );
        handle.cancel();
    });

    runner.run(&mut task).await?;
    Ok(())
}

/// Bot entry point: logs the session and reports failures.
pub async fn bot(args: SessionArguments, config: BotConfig) -> anyhow::Result<()> {
    log::info!(
        "Bot process initialized {} (session {})",
        args.room_url,
        args.session_id.as_deref().unwrap_or("-")
    );
    log::info!("Bot config {:?}", BotConfigSummary(&config));

    match run_session(&args, &config, PipelineRunner::new()).await {
        Ok(()) => {
            log::info!("Bot process completed");
            Ok(())
        }
        Err(e) => {
            log::error!("Error in bot process: {:#}", e);
            Err(e)
        }
    }
}

/// Config as logged, with stream credentials hidden
struct BotConfigSummary<'a>(&'a BotConfig);

impl std::fmt::Debug for BotConfigSummary<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&redact(&format!("{:?}", self.0)))
    }
}
