//! Pipeline stages shipped with the bot.

mod capture_source;
mod frame_logger;
mod gst_source;

pub use capture_source::CaptureSource;
pub use frame_logger::FrameLogger;
pub use gst_source::GstPipelineSource;
