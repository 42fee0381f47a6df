use bytes::BytesMut;
use log::{debug, trace, warn};

use crate::codec::{AnalysisStream, Analyzer, BitrateHint, BitrateMode, EncoderConfig};
use crate::comment::Tags;
use crate::error::{Error, Result};
use crate::mux::PageMux;

/// Where a session is in the life of its current logical stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// No codec resources allocated.
    Uninitialized,
    /// Resources allocated; nothing encoded yet.
    Initialized,
    /// At least one encode call has gone through.
    Streaming,
    /// The codec emitted the terminal page.
    Ended,
}

/// Drives one external codec through a sequence of logical streams.
///
/// `initialize` allocates codec resources, `write_header` picks a fresh
/// random serial and queues the three header packets, and `encode` turns
/// interleaved s16le PCM into Ogg pages. A zero-length chunk starts
/// end-of-stream flushing; once the terminal page has been emitted the
/// session stays ended until `reinitialize`.
///
/// The session holds no lock and must be driven by one caller at a time.
pub struct CodecSession<A: Analyzer> {
    analyzer: A,
    config: EncoderConfig,
    metadata: Tags,
    stream: Option<A::Stream>,
    mux: Option<PageMux>,
    state: SessionState,
    bos: bool,
    eos: bool,
    first: bool,
    granule: u64,
}

impl<A: Analyzer> CodecSession<A> {
    pub fn new(analyzer: A, config: EncoderConfig) -> Self {
        Self {
            analyzer,
            config,
            metadata: Tags::new(),
            stream: None,
            mux: None,
            state: SessionState::Uninitialized,
            bos: true,
            eos: false,
            first: true,
            granule: 0,
        }
    }

    /// Metadata used by the next stream started without explicit tags.
    pub fn with_metadata(mut self, metadata: Tags) -> Self {
        self.metadata = metadata;
        self
    }

    /// Allocate codec resources for a new logical stream and register every
    /// tag of `metadata` (or of the stored metadata when `None`).
    pub fn initialize(&mut self, metadata: Option<&Tags>) -> Result<()> {
        if self.stream.is_some() {
            warn!("initialize called on a live stream; closing it first");
            self.close();
        }

        self.eos = false;
        self.bos = true;
        self.first = false;
        self.granule = 0;

        let tags = metadata.unwrap_or(&self.metadata);
        let mut stream = self.analyzer.init_stream(&self.config)?;
        for (key, value) in tags.iter() {
            stream.add_comment(key, value);
        }
        debug!(
            "Initialised stream: {} ch, {} Hz, {:?}, {} tags",
            self.config.channels,
            self.config.sample_rate,
            self.config.bitrate,
            tags.len()
        );

        self.stream = Some(stream);
        self.state = SessionState::Initialized;
        Ok(())
    }

    /// Close the current stream (if any) and initialise a new one.
    pub fn reinitialize(&mut self, metadata: Option<&Tags>) -> Result<()> {
        self.close();
        self.initialize(metadata)
    }

    /// Assign a random serial and queue the header packets ahead of any
    /// payload of this stream.
    pub fn write_header(&mut self) -> Result<()> {
        let stream = self.stream.as_mut().ok_or(Error::NotInitialized)?;
        let serial: u32 = rand::random();
        debug!("Writing headers with serial={:#x}", serial);

        let mut mux = PageMux::new(serial);
        mux.write_headers(&stream.header_packets())?;
        self.mux = Some(mux);
        Ok(())
    }

    /// Encode one chunk of interleaved s16le PCM, appending every page
    /// produced to `out`. An empty chunk signals end of input.
    ///
    /// Returns the number of bytes appended. Nothing is appended on error.
    pub fn encode(&mut self, pcm: &[u8], out: &mut BytesMut) -> Result<usize> {
        if self.eos {
            debug!("encode called after end of stream; nothing to do");
            return Ok(0);
        }
        let (Some(stream), Some(mux)) = (self.stream.as_mut(), self.mux.as_mut()) else {
            return Err(Error::NotInitialized);
        };

        let mut produced = BytesMut::new();

        // Audio of a new stream must start on a fresh page.
        if self.bos {
            while let Some(page) = mux.next_page()? {
                page.write_to(&mut produced);
            }
            self.bos = false;
        }

        if pcm.is_empty() {
            trace!("end of input on serial={:#x}", mux.serial());
            stream.submit_end_of_input();
        } else {
            stream.submit_samples(&deinterleave(pcm, self.config.channels));
        }

        let hint = match self.config.bitrate {
            BitrateMode::CBR(kbps) => Some(BitrateHint { kbps }),
            BitrateMode::VBRQuality(_) => None,
        };

        while let Some(block) = stream.next_completed_block() {
            let packet = stream.analyze_block(block, hint);
            mux.packet_in(&packet)?;

            while !self.eos {
                let Some(page) = mux.next_page()? else {
                    break;
                };
                page.write_to(&mut produced);
                if page.granule != u64::MAX {
                    self.granule = page.granule;
                }
                if page.terminal {
                    debug!("End of stream reached on serial={:#x}", mux.serial());
                    self.eos = true;
                }
            }
        }

        self.state = if self.eos {
            SessionState::Ended
        } else {
            SessionState::Streaming
        };
        out.extend_from_slice(&produced);
        Ok(produced.len())
    }

    /// Release the multiplexer, then the codec stream. Safe to call twice.
    pub fn close(&mut self) {
        if let Some(mux) = self.mux.take() {
            debug!("Closing stream serial={:#x}", mux.serial());
        }
        if let Some(mut stream) = self.stream.take() {
            stream.close();
        }
        self.state = SessionState::Uninitialized;
    }

    /// Replace the stored metadata and flag the start of a new stream.
    pub fn change_metadata(&mut self, metadata: Tags) {
        self.metadata = metadata;
        self.bos = true;
    }

    pub fn metadata(&self) -> &Tags {
        &self.metadata
    }

    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_beginning_of_stream(&self) -> bool {
        self.bos
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.eos
    }

    /// Headers written and the terminal page not yet emitted.
    pub fn has_open_stream(&self) -> bool {
        self.stream.is_some() && self.mux.is_some() && !self.eos
    }

    /// True until the first `initialize` call.
    pub fn is_first(&self) -> bool {
        self.first
    }

    /// Serial of the current stream, once its headers are written.
    pub fn serial(&self) -> Option<u32> {
        self.mux.as_ref().map(PageMux::serial)
    }

    /// Granule position of the last page emitted for the current stream.
    pub fn granule_position(&self) -> u64 {
        self.granule
    }
}

impl<A: Analyzer> Drop for CodecSession<A> {
    fn drop(&mut self) {
        self.close();
    }
}

/// Split interleaved s16le PCM into one float vector per channel.
///
/// Trailing bytes that do not make up a whole frame are ignored.
pub fn deinterleave(pcm: &[u8], channels: u16) -> Vec<Vec<f32>> {
    let channels = usize::from(channels.max(1));
    let frame_bytes = channels * 2;
    let frames = pcm.len() / frame_bytes;
    if pcm.len() % frame_bytes != 0 {
        warn!(
            "dropping {} trailing bytes of a partial frame",
            pcm.len() % frame_bytes
        );
    }

    let mut planar = vec![Vec::with_capacity(frames); channels];
    for frame in pcm.chunks_exact(frame_bytes) {
        for (ch, sample) in frame.chunks_exact(2).enumerate() {
            planar[ch].push(f32::from(i16::from_le_bytes([sample[0], sample[1]])) / 32768.0);
        }
    }
    planar
}
