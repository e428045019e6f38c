//! Protobuf messages published to the room.

use crate::frames::{AudioRawFrame, ImageRawFrame};

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Header {
    /// Acquisition time in nanoseconds (stream clock)
    #[prost(uint64, tag = "1")]
    pub acq_time: u64,
    /// Publish time in nanoseconds since the Unix epoch
    #[prost(uint64, tag = "2")]
    pub pub_time: u64,
    #[prost(uint32, tag = "3")]
    pub sequence: u32,
    /// Participant id of the sender
    #[prost(string, tag = "4")]
    pub frame_id: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct VideoFrame {
    #[prost(message, optional, tag = "1")]
    pub header: ::core::option::Option<Header>,
    #[prost(uint32, tag = "2")]
    pub width: u32,
    #[prost(uint32, tag = "3")]
    pub height: u32,
    #[prost(string, tag = "4")]
    pub encoding: ::prost::alloc::string::String,
    #[prost(uint32, tag = "5")]
    pub step: u32,
    #[prost(bytes = "vec", tag = "6")]
    pub data: ::prost::alloc::vec::Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AudioFrame {
    #[prost(message, optional, tag = "1")]
    pub header: ::core::option::Option<Header>,
    #[prost(uint32, tag = "2")]
    pub sample_rate: u32,
    #[prost(uint32, tag = "3")]
    pub channels: u32,
    #[prost(bytes = "vec", tag = "4")]
    pub data: ::prost::alloc::vec::Vec<u8>,
}

pub(crate) fn pub_time() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

impl VideoFrame {
    pub fn from_image(image: &ImageRawFrame, sender: &str) -> Self {
        Self {
            header: Some(Header {
                acq_time: image.pts,
                pub_time: pub_time(),
                sequence: image.sequence,
                frame_id: sender.to_string(),
            }),
            width: image.width,
            height: image.height,
            encoding: image.format.clone(),
            step: image.step(),
            data: image.data.clone(),
        }
    }
}

impl AudioFrame {
    pub fn from_audio(audio: &AudioRawFrame, sequence: u32, sender: &str) -> Self {
        Self {
            header: Some(Header {
                acq_time: 0,
                pub_time: pub_time(),
                sequence,
                frame_id: sender.to_string(),
            }),
            sample_rate: audio.sample_rate,
            channels: audio.channels as u32,
            data: audio.data.clone(),
        }
    }
}
