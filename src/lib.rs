//! # OggChain
//!
//! OggChain buffers and sequences the output of a stateful streaming
//! encoder, so a consumer can pull encoded bytes at its own pace while
//! several logical streams (tracks, each with its own metadata) are chained
//! into one continuous Ogg stream, suitable for Icecast-style broadcasting.
//!
//! The codec itself sits behind the [`Analyzer`] / [`AnalysisStream`]
//! traits. [`PcmAnalyzer`] is a lossless reference implementation.
//!
//! ## Example
//! ```rust,no_run
//! use oggchain::{BitrateMode, EncoderConfig, PcmAnalyzer, StreamEncoder, Tags};
//!
//! let config = EncoderConfig {
//!     channels: 2,
//!     sample_rate: 44100,
//!     bitrate: BitrateMode::VBRQuality(0.7),
//! };
//! let mut encoder = StreamEncoder::new(PcmAnalyzer::new(), config)
//!     .with_metadata(Tags::new().with("TITLE", "First"));
//!
//! // Push raw interleaved s16le PCM...
//! let pcm = vec![0u8; 4096];
//! encoder.put_bytes(&pcm).unwrap();
//!
//! // ...switch track: the next push closes the first logical stream...
//! encoder.change_metadata(Tags::new().with("TITLE", "Second"));
//! encoder.put_bytes(&pcm).unwrap();
//! encoder.finish().unwrap();
//!
//! // ...and pull the chained Ogg stream out.
//! let mut buf = [0u8; 8192];
//! while encoder.get_bytes(&mut buf) > 0 {}
//! ```

mod codec;
mod comment;
mod encoder;
mod error;
mod mux;
mod pcm;
mod ring;
mod session;
pub mod stream;
mod timing;

// Re-export public API
pub use codec::{
    AnalysisStream, Analyzer, BitrateHint, BitrateMode, EncoderConfig, HeaderPackets, Packet,
};
pub use comment::Tags;
pub use encoder::{BufferConfig, EncodeHandle, StreamEncoder};
pub use error::{Error, Result};
pub use mux::{FramedPage, PageMux};
pub use pcm::{
    PcmAnalyzer, PcmBlock, PcmStream, BLOCK_FRAMES, CODE_INVALID, CODE_UNIMPLEMENTED, PCM_MAGIC,
};
pub use ring::{RingBuffer, MAX_CAPACITY};
pub use session::{deinterleave, CodecSession, SessionState};
