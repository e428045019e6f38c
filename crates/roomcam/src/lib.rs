//! Streams an RTSP camera into a conferencing room.
//!
//! The bot builds a short [`pipeline`](crate::pipeline) of stages: a camera
//! source (a GStreamer launch pipeline or a polled capture handle), an
//! optional frame logger and the room output of a
//! [`RoomTransport`](crate::transport::RoomTransport). It runs until a
//! participant leaves the room or the process is interrupted.

pub mod bot;
pub mod capture;
pub mod config;
pub mod frames;
pub mod pipeline;
pub mod processors;
pub mod schemas;
pub mod transport;

// Re-export commonly used types
pub use bot::{bot, run_session, SessionArguments};
pub use config::{BotConfig, ConfigError, PipelineParams, SourceConfig, TransportParams};
pub use frames::{Frame, FrameDirection};
