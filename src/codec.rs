//! Capability contract of the external codec.
//!
//! The session never looks inside codec state. It asks an [`Analyzer`] for a
//! per-stream handle and drives that handle through the operations below;
//! packets coming out of it are framed into Ogg pages by the page multiplexer.

use bytes::Bytes;

use crate::error::Result;

/// Bitrate mode for encoding.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum BitrateMode {
    /// Constant Bitrate (CBR)
    CBR(u32), // kbps, e.g. 192
    /// Variable Bitrate (VBR) with quality target
    VBRQuality(f32), // typically 0.0..=1.0
}

/// Parameters of one logical stream.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EncoderConfig {
    /// 1 for mono, 2 for stereo
    pub channels: u16,
    /// Sample rate in Hz; must match the input
    pub sample_rate: u32,
    pub bitrate: BitrateMode,
}

impl EncoderConfig {
    /// Bytes of interleaved s16le PCM making up one frame.
    pub fn frame_bytes(&self) -> usize {
        usize::from(self.channels) * 2
    }
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            channels: 2,
            sample_rate: 44100,
            bitrate: BitrateMode::VBRQuality(0.7),
        }
    }
}

/// Per-block target supplied to the analysis step in managed (CBR) mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BitrateHint {
    pub kbps: u32,
}

/// Identification, comment and setup packets, in emission order.
#[derive(Clone, Debug)]
pub struct HeaderPackets {
    pub ident: Bytes,
    pub comment: Bytes,
    pub setup: Bytes,
}

/// One compressed packet ready for framing.
#[derive(Clone, Debug)]
pub struct Packet {
    pub data: Bytes,
    /// Granule position (samples per channel) at the end of this packet.
    pub granule: u64,
    /// Set on the final packet of the logical stream.
    pub last: bool,
}

/// Factory for per-stream codec handles.
pub trait Analyzer: Send {
    type Stream: AnalysisStream;

    /// Allocate resources for one logical stream. Rejected parameter
    /// combinations come back as [`crate::Error::Config`].
    fn init_stream(&mut self, config: &EncoderConfig) -> Result<Self::Stream>;
}

/// Opaque handle for one logical stream inside the codec.
pub trait AnalysisStream: Send {
    type Block;

    /// Register one comment. Called any number of times before
    /// [`header_packets`](Self::header_packets).
    fn add_comment(&mut self, key: &str, value: &str);

    fn header_packets(&mut self) -> HeaderPackets;

    /// Hand over one planar chunk, one slice per channel, samples in -1.0..1.0.
    fn submit_samples(&mut self, planar: &[Vec<f32>]);

    /// Signal that no more samples follow.
    fn submit_end_of_input(&mut self);

    /// Next block ready for analysis, if enough input has been submitted.
    fn next_completed_block(&mut self) -> Option<Self::Block>;

    fn analyze_block(&mut self, block: Self::Block, hint: Option<BitrateHint>) -> Packet;

    /// Release codec resources held by this handle.
    fn close(&mut self) {}
}
