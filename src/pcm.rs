use bytes::{BufMut, Bytes, BytesMut};
use log::{trace, warn};

use crate::codec::{
    AnalysisStream, Analyzer, BitrateHint, BitrateMode, EncoderConfig, HeaderPackets, Packet,
};
use crate::comment::Tags;
use crate::error::{Error, Result};

/// Magic shared by the three header packets, after the packet-type byte.
pub const PCM_MAGIC: &[u8] = b"chainpcm";

/// Frames (samples per channel) carried by each audio packet.
pub const BLOCK_FRAMES: usize = 1024;

/// Invalid argument.
pub const CODE_INVALID: i32 = -131;
/// Unsupported mode.
pub const CODE_UNIMPLEMENTED: i32 = -130;

const VENDOR: &str = concat!("oggchain ", env!("CARGO_PKG_VERSION"));

/// Reference analyzer: packs blocks of 16-bit PCM into packets.
///
/// It performs no compression but honours the full codec contract (parameter
/// validation, three header packets, block-wise output and a terminal packet
/// after end of input), which makes it usable wherever a lossless Ogg
/// encapsulation is wanted and as a stand-in for a real encoder.
#[derive(Clone, Copy, Debug, Default)]
pub struct PcmAnalyzer;

impl PcmAnalyzer {
    pub fn new() -> Self {
        Self
    }

    fn validate(config: &EncoderConfig) -> Result<()> {
        if !(1..=2).contains(&config.channels) {
            return Err(Error::Config {
                code: CODE_INVALID,
                reason: format!("{} channels not supported", config.channels),
            });
        }
        if !(8000..=192_000).contains(&config.sample_rate) {
            return Err(Error::Config {
                code: CODE_INVALID,
                reason: format!("sample rate {} out of range", config.sample_rate),
            });
        }
        match config.bitrate {
            BitrateMode::VBRQuality(q) if !(-0.1..=1.0).contains(&q) => Err(Error::Config {
                code: CODE_INVALID,
                reason: format!("quality {q} outside -0.1..=1.0"),
            }),
            BitrateMode::CBR(kbps) if !(32..=500).contains(&kbps) => Err(Error::Config {
                code: CODE_UNIMPLEMENTED,
                reason: format!("no managed mode for {kbps} kbps"),
            }),
            _ => Ok(()),
        }
    }
}

impl Analyzer for PcmAnalyzer {
    type Stream = PcmStream;

    fn init_stream(&mut self, config: &EncoderConfig) -> Result<PcmStream> {
        Self::validate(config)?;
        Ok(PcmStream {
            config: *config,
            comments: Tags::new(),
            pending: vec![Vec::new(); usize::from(config.channels)],
            granule: 0,
            end_of_input: false,
            finished: false,
        })
    }
}

/// A block of planar samples awaiting analysis.
#[derive(Debug)]
pub struct PcmBlock {
    samples: Vec<Vec<f32>>,
    granule: u64,
    last: bool,
}

/// Per-stream state of [`PcmAnalyzer`].
pub struct PcmStream {
    config: EncoderConfig,
    comments: Tags,
    pending: Vec<Vec<f32>>,
    granule: u64,
    end_of_input: bool,
    finished: bool,
}

impl PcmStream {
    fn pending_frames(&self) -> usize {
        self.pending.first().map_or(0, Vec::len)
    }

    fn take_block(&mut self, frames: usize, last: bool) -> PcmBlock {
        let samples = self
            .pending
            .iter_mut()
            .map(|channel| channel.drain(..frames).collect())
            .collect();
        self.granule += frames as u64;
        PcmBlock {
            samples,
            granule: self.granule,
            last,
        }
    }

    fn ident_packet(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(24);
        out.put_u8(0x01);
        out.put_slice(PCM_MAGIC);
        out.put_u8(self.config.channels as u8);
        out.put_u32_le(self.config.sample_rate);
        match self.config.bitrate {
            BitrateMode::VBRQuality(q) => {
                out.put_u8(0);
                out.put_f32_le(q);
            }
            BitrateMode::CBR(kbps) => {
                out.put_u8(1);
                out.put_u32_le(kbps);
            }
        }
        out.put_u8(1);
        out.freeze()
    }
}

impl AnalysisStream for PcmStream {
    type Block = PcmBlock;

    fn add_comment(&mut self, key: &str, value: &str) {
        self.comments.push(key, value);
    }

    fn header_packets(&mut self) -> HeaderPackets {
        let mut comment_magic = vec![0x03];
        comment_magic.extend_from_slice(PCM_MAGIC);

        let mut setup = BytesMut::with_capacity(16);
        setup.put_u8(0x05);
        setup.put_slice(PCM_MAGIC);
        setup.put_u16_le(BLOCK_FRAMES as u16);
        setup.put_u8(1);

        HeaderPackets {
            ident: self.ident_packet(),
            comment: self.comments.to_packet(&comment_magic, VENDOR),
            setup: setup.freeze(),
        }
    }

    fn submit_samples(&mut self, planar: &[Vec<f32>]) {
        if self.end_of_input {
            warn!("samples submitted after end of input; ignoring");
            return;
        }
        for (pending, channel) in self.pending.iter_mut().zip(planar) {
            pending.extend_from_slice(channel);
        }
    }

    fn submit_end_of_input(&mut self) {
        self.end_of_input = true;
    }

    fn next_completed_block(&mut self) -> Option<PcmBlock> {
        let available = self.pending_frames();
        if available >= BLOCK_FRAMES && (!self.end_of_input || available > BLOCK_FRAMES) {
            Some(self.take_block(BLOCK_FRAMES, false))
        } else if self.end_of_input && !self.finished {
            self.finished = true;
            Some(self.take_block(available, true))
        } else {
            None
        }
    }

    fn analyze_block(&mut self, block: PcmBlock, hint: Option<BitrateHint>) -> Packet {
        if let Some(hint) = hint {
            trace!("analysing block at {} with {} kbps target", block.granule, hint.kbps);
        }
        let frames = block.samples.first().map_or(0, Vec::len);
        let mut data = BytesMut::with_capacity(frames * block.samples.len() * 2);
        for i in 0..frames {
            for channel in &block.samples {
                let scaled = (channel[i] * 32768.0).round();
                data.put_i16_le(scaled.clamp(i16::MIN as f32, i16::MAX as f32) as i16);
            }
        }
        Packet {
            data: data.freeze(),
            granule: block.granule,
            last: block.last,
        }
    }

    fn close(&mut self) {
        self.pending.iter_mut().for_each(Vec::clear);
        self.comments = Tags::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stereo(bitrate: BitrateMode) -> EncoderConfig {
        EncoderConfig {
            channels: 2,
            sample_rate: 44100,
            bitrate,
        }
    }

    #[test]
    fn test_rejects_bad_parameters() {
        let mut analyzer = PcmAnalyzer::new();
        let mut cfg = stereo(BitrateMode::VBRQuality(0.5));
        cfg.channels = 6;
        assert_eq!(analyzer.init_stream(&cfg).err().and_then(|e| e.code()), Some(CODE_INVALID));

        let cfg = stereo(BitrateMode::VBRQuality(1.5));
        assert_eq!(analyzer.init_stream(&cfg).err().and_then(|e| e.code()), Some(CODE_INVALID));

        let cfg = stereo(BitrateMode::CBR(8));
        assert_eq!(
            analyzer.init_stream(&cfg).err().and_then(|e| e.code()),
            Some(CODE_UNIMPLEMENTED)
        );

        assert!(analyzer.init_stream(&stereo(BitrateMode::CBR(192))).is_ok());
    }

    #[test]
    fn test_blocks_and_terminal_packet() {
        let mut stream = PcmAnalyzer::new()
            .init_stream(&stereo(BitrateMode::VBRQuality(0.7)))
            .unwrap();
        let chunk = vec![vec![0.25f32; BLOCK_FRAMES + 10]; 2];
        stream.submit_samples(&chunk);

        let block = stream.next_completed_block().unwrap();
        let packet = stream.analyze_block(block, None);
        assert_eq!(packet.granule, BLOCK_FRAMES as u64);
        assert_eq!(packet.data.len(), BLOCK_FRAMES * 4);
        assert!(!packet.last);
        assert!(stream.next_completed_block().is_none());

        stream.submit_end_of_input();
        let block = stream.next_completed_block().unwrap();
        let packet = stream.analyze_block(block, Some(BitrateHint { kbps: 128 }));
        assert!(packet.last);
        assert_eq!(packet.granule, BLOCK_FRAMES as u64 + 10);
        assert_eq!(&packet.data[..4], &[0x00, 0x20, 0x00, 0x20]);
        assert!(stream.next_completed_block().is_none());
    }

    #[test]
    fn test_end_of_input_without_samples_still_terminates() {
        let mut stream = PcmAnalyzer::new()
            .init_stream(&stereo(BitrateMode::VBRQuality(0.1)))
            .unwrap();
        stream.submit_end_of_input();
        let packet = {
            let block = stream.next_completed_block().unwrap();
            stream.analyze_block(block, None)
        };
        assert!(packet.last);
        assert!(packet.data.is_empty());
        assert_eq!(packet.granule, 0);
    }

    #[test]
    fn test_header_packets_carry_comments() {
        let mut stream = PcmAnalyzer::new()
            .init_stream(&stereo(BitrateMode::CBR(192)))
            .unwrap();
        stream.add_comment("TITLE", "We Are LSM");
        stream.add_comment("TITLE", "Again");
        let headers = stream.header_packets();

        assert_eq!(headers.ident[0], 0x01);
        assert_eq!(&headers.ident[1..9], PCM_MAGIC);
        assert_eq!(headers.setup[0], 0x05);

        let mut magic = vec![0x03];
        magic.extend_from_slice(PCM_MAGIC);
        let (_, tags) = Tags::from_packet(&magic, &headers.comment).unwrap();
        assert_eq!(tags.len(), 2);
        assert_eq!(tags.get("TITLE"), Some("We Are LSM"));
    }
}
