use anyhow::{Context, Result};
use bytes::BytesMut;
use log::{debug, error, trace, warn};
use std::io::{ErrorKind, Read, Write};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::codec::{Analyzer, EncoderConfig};
use crate::comment::Tags;
use crate::ring::RingBuffer;
use crate::session::CodecSession;
use crate::timing::EncodeProgress;

/// Configuration for buffer management.
#[derive(Clone, Copy, Debug)]
pub struct BufferConfig {
    /// Bytes of PCM read from the source per iteration of the full-drain pipe
    pub chunk_size: usize,
    /// Ring capacity as a multiple of `first chunk × channels`
    pub ring_multiplier: usize,
    /// Attempts a blocking reader makes before reporting no data
    pub read_retries: u32,
    /// Pause between those attempts, and between writer space checks
    pub retry_interval: Duration,
}

impl BufferConfig {
    /// Defaults sized for `sample_rate`: ten bytes of read chunk per Hz.
    pub fn for_sample_rate(sample_rate: u32) -> Self {
        Self {
            chunk_size: sample_rate as usize * 10,
            ..Self::default()
        }
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            chunk_size: 441_000,
            ring_multiplier: 10,
            read_retries: 5,
            retry_interval: Duration::from_millis(10),
        }
    }
}

/// Encoder front end combining a [`CodecSession`] with a [`RingBuffer`].
///
/// Two ways to use it:
///
/// - Full drain: [`encode_stream`](Self::encode_stream) pulls PCM from a
///   reader and pushes pages into a writer until the logical stream ends.
///   [`spawn_encode`](Self::spawn_encode) runs the same loop on Tokio's
///   blocking pool and returns a pollable [`EncodeHandle`].
/// - Push/pull: [`put_bytes`](Self::put_bytes) encodes PCM into the internal
///   ring, [`get_bytes`](Self::get_bytes) drains it. The ring grows rather
///   than blocking the producer; see [`crate::stream`] for a bounded,
///   back-pressured variant.
///
/// [`change_metadata`](Self::change_metadata) ends the current logical
/// stream on the next push, so tracks are chained into one physical stream.
pub struct StreamEncoder<A: Analyzer> {
    session: CodecSession<A>,
    buffer_config: BufferConfig,
    ring: Option<Arc<RingBuffer>>,
    scratch: BytesMut,
    partial: Vec<u8>,
}

impl<A: Analyzer> StreamEncoder<A> {
    pub fn new(analyzer: A, config: EncoderConfig) -> Self {
        Self {
            session: CodecSession::new(analyzer, config),
            buffer_config: BufferConfig::for_sample_rate(config.sample_rate),
            ring: None,
            scratch: BytesMut::new(),
            partial: Vec::new(),
        }
    }

    pub fn with_buffer_config(mut self, config: BufferConfig) -> Self {
        self.buffer_config = config;
        self
    }

    /// Metadata for the first logical stream.
    pub fn with_metadata(mut self, metadata: Tags) -> Self {
        self.session.change_metadata(metadata);
        self
    }

    pub fn session(&self) -> &CodecSession<A> {
        &self.session
    }

    pub fn buffer_config(&self) -> &BufferConfig {
        &self.buffer_config
    }

    /// Replace the metadata and end the current logical stream on the next
    /// push or full-drain call.
    pub fn change_metadata(&mut self, metadata: Tags) {
        debug!("Metadata changed; next push starts a new logical stream");
        self.session.change_metadata(metadata);
    }

    /// Encode everything `input` yields as one logical stream, writing
    /// pages to `output` as they are produced. Returns the bytes written.
    ///
    /// A stream left open by [`put_bytes`](Self::put_bytes) is ended first;
    /// its tail goes to the internal ring behind the bytes already there.
    pub fn encode_stream<R: Read, W: Write>(&mut self, input: R, output: W) -> Result<u64> {
        let progress = EncodeProgress::new(self.session.config().sample_rate);
        self.encode_stream_with(input, output, &progress)
    }

    fn encode_stream_with<R: Read, W: Write>(
        &mut self,
        mut input: R,
        mut output: W,
        progress: &EncodeProgress,
    ) -> Result<u64> {
        if self.session.has_open_stream() {
            self.finish().context("ending buffered stream")?;
        }
        self.partial.clear();
        self.session
            .reinitialize(None)
            .context("initialising codec session")?;
        self.session.write_header().context("writing stream headers")?;

        let mut chunk = vec![0u8; self.buffer_config.chunk_size.max(1)];
        let mut total = 0u64;

        while !self.session.is_end_of_stream() {
            let len = read_chunk(&mut input, &mut chunk).context("reading PCM input")?;
            self.scratch.clear();
            let produced = self.session.encode(&chunk[..len], &mut self.scratch)?;
            if produced > 0 {
                output
                    .write_all(&self.scratch)
                    .context("writing encoded pages")?;
                output.flush().context("flushing output")?;
            }
            total += produced as u64;
            progress.record(total, self.session.granule_position());
        }

        debug!("Full-drain encode finished: {} bytes", total);
        Ok(total)
    }

    /// Encode `pcm` into the internal ring buffer.
    ///
    /// If a new logical stream is due (first push, metadata change, or the
    /// previous stream already ended), the tail of the previous one is
    /// flushed into the ring first, then the session is re-initialised and
    /// the new headers follow.
    ///
    /// Chunks need not be frame-aligned: a trailing partial frame is held
    /// back and prefixed to the next push.
    pub fn put_bytes(&mut self, pcm: &[u8]) -> crate::Result<()> {
        let ring = self.ring_for(pcm.len());
        let frames = self.whole_frames(pcm);
        // Only a truly empty push signals end of input.
        if frames.is_empty() && !pcm.is_empty() {
            return Ok(());
        }
        self.produce(&frames, |bytes| ring.write(bytes))
    }

    /// Read up to `buf.len()` encoded bytes. Returns 0 when nothing is
    /// buffered; never waits on the producer.
    pub fn get_bytes(&self, buf: &mut [u8]) -> usize {
        self.ring.as_ref().map_or(0, |ring| ring.read(buf))
    }

    /// End the current logical stream and buffer its tail.
    pub fn finish(&mut self) -> crate::Result<()> {
        let ring = self.ring_for(0);
        self.finish_with(|bytes| ring.write(bytes))
    }

    /// Encoded bytes waiting to be read.
    pub fn buffered(&self) -> usize {
        self.ring.as_ref().map_or(0, |ring| ring.count())
    }

    /// Ring shared with a consumer, created on first use from `chunk_len`.
    pub(crate) fn ring_for(&mut self, chunk_len: usize) -> Arc<RingBuffer> {
        let channels = usize::from(self.session.config().channels.max(1));
        let multiplier = self.buffer_config.ring_multiplier.max(1);
        let ring = self.ring.get_or_insert_with(|| {
            let capacity = chunk_len.max(1) * channels * multiplier;
            debug!("Creating ring buffer of {} bytes", capacity);
            Arc::new(RingBuffer::new(capacity))
        });
        Arc::clone(ring)
    }

    /// Append `pcm` to any held-back partial frame and take out the whole
    /// frames; the remainder stays for the next call.
    pub(crate) fn whole_frames(&mut self, pcm: &[u8]) -> Vec<u8> {
        let frame_bytes = self.session.config().frame_bytes().max(1);
        if self.partial.is_empty() && pcm.len() % frame_bytes == 0 {
            return pcm.to_vec();
        }
        self.partial.extend_from_slice(pcm);
        let whole = self.partial.len() - self.partial.len() % frame_bytes;
        self.partial.drain(..whole).collect()
    }

    /// Encode the end of input for the open stream, if any.
    pub(crate) fn finish_with<F>(&mut self, mut emit: F) -> crate::Result<()>
    where
        F: FnMut(&[u8]) -> crate::Result<()>,
    {
        if !self.partial.is_empty() {
            warn!("Dropping {} bytes of incomplete frame", self.partial.len());
            self.partial.clear();
        }
        if !self.session.has_open_stream() {
            return Ok(());
        }
        self.scratch.clear();
        self.session.encode(&[], &mut self.scratch)?;
        emit(&self.scratch)
    }

    /// Run the start-of-stream logic and encode `pcm`, handing every byte
    /// produced to `emit` in output order.
    pub(crate) fn produce<F>(&mut self, pcm: &[u8], mut emit: F) -> crate::Result<()>
    where
        F: FnMut(&[u8]) -> crate::Result<()>,
    {
        if self.session.is_beginning_of_stream() || self.session.is_end_of_stream() {
            if self.session.has_open_stream() {
                self.scratch.clear();
                self.session.encode(&[], &mut self.scratch)?;
                trace!("flushed {} tail bytes of previous stream", self.scratch.len());
                emit(&self.scratch)?;
            }
            self.session.reinitialize(None)?;
            self.session.write_header()?;
        }

        self.scratch.clear();
        self.session.encode(pcm, &mut self.scratch)?;
        emit(&self.scratch)
    }
}

impl<A> StreamEncoder<A>
where
    A: Analyzer + 'static,
{
    /// Run [`encode_stream`](Self::encode_stream) on Tokio's blocking pool.
    ///
    /// Must be called from within a Tokio runtime. The encoder is handed
    /// back through [`EncodeHandle::join`] so further streams can be
    /// chained onto it.
    pub fn spawn_encode<R, W>(mut self, input: R, output: W) -> EncodeHandle<A>
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        let progress = Arc::new(EncodeProgress::new(self.session.config().sample_rate));

        let task_progress = Arc::clone(&progress);
        let join = tokio::task::spawn_blocking(move || {
            let result = self.encode_stream_with(input, output, &task_progress);
            if let Err(e) = &result {
                error!("Background encode failed: {:?}", e);
            }
            result.map(|total| (self, total))
        });

        EncodeHandle { progress, join }
    }
}

/// Handle to a background full-drain encode.
pub struct EncodeHandle<A: Analyzer> {
    progress: Arc<EncodeProgress>,
    join: JoinHandle<Result<(StreamEncoder<A>, u64)>>,
}

impl<A: Analyzer> EncodeHandle<A> {
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Encoded bytes written to the sink so far.
    pub fn bytes_written(&self) -> u64 {
        self.progress.bytes_written()
    }

    /// Stream time covered by the pages written so far.
    pub fn position_secs(&self) -> f64 {
        self.progress.position_secs()
    }

    /// Encoding speed relative to real time.
    pub fn speed(&self) -> f64 {
        self.progress.speed()
    }

    /// Wait for the encode to end; returns the encoder and the byte total.
    pub async fn join(self) -> Result<(StreamEncoder<A>, u64)> {
        self.join.await.context("background encode task failed")?
    }
}

/// Fill `buf` from `input`, stopping early only at end of input.
fn read_chunk<R: Read>(input: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match input.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::BitrateMode;
    use crate::pcm::PcmAnalyzer;
    use ogg::reading::PacketReader;
    use std::io::Cursor;

    fn encoder() -> StreamEncoder<PcmAnalyzer> {
        StreamEncoder::new(
            PcmAnalyzer::new(),
            EncoderConfig {
                channels: 2,
                sample_rate: 44100,
                bitrate: BitrateMode::VBRQuality(0.7),
            },
        )
        .with_buffer_config(BufferConfig {
            chunk_size: 4096,
            ..BufferConfig::default()
        })
    }

    fn drain(enc: &StreamEncoder<PcmAnalyzer>) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 1000];
        loop {
            let n = enc.get_bytes(&mut buf);
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        out
    }

    #[test]
    fn test_read_chunk_fills_across_short_reads() {
        struct Trickle(Vec<u8>);
        impl Read for Trickle {
            fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
                let n = buf.len().min(self.0.len()).min(3);
                buf[..n].copy_from_slice(&self.0[..n]);
                self.0.drain(..n);
                Ok(n)
            }
        }
        let mut src = Trickle((0..10).collect());
        let mut buf = [0u8; 8];
        assert_eq!(read_chunk(&mut src, &mut buf).unwrap(), 8);
        assert_eq!(read_chunk(&mut src, &mut buf).unwrap(), 2);
        assert_eq!(read_chunk(&mut src, &mut buf).unwrap(), 0);
    }

    #[test]
    fn test_get_bytes_before_put_returns_zero() {
        let enc = encoder();
        let mut buf = [0u8; 16];
        assert_eq!(enc.get_bytes(&mut buf), 0);
        assert_eq!(enc.buffered(), 0);
    }

    #[test]
    fn test_ring_is_sized_from_first_chunk() {
        let mut enc = encoder();
        enc.put_bytes(&[0u8; 400]).unwrap();
        let ring = enc.ring_for(0);
        assert!(ring.capacity() >= 400 * 2 * 10);
    }

    #[test]
    fn test_encode_stream_writes_one_logical_stream() {
        let mut enc = encoder();
        let pcm = vec![0u8; 44100];
        let mut sink = Vec::new();
        let total = enc.encode_stream(Cursor::new(pcm), &mut sink).unwrap();
        assert_eq!(total as usize, sink.len());
        assert!(enc.session().is_end_of_stream());

        let mut reader = PacketReader::new(Cursor::new(sink));
        let mut packets = Vec::new();
        while let Some(p) = reader.read_packet().unwrap() {
            packets.push(p);
        }
        assert!(packets[0].first_in_stream());
        assert!(packets.last().unwrap().last_in_stream());
        let audio: usize = packets[3..].iter().map(|p| p.data.len()).sum();
        assert_eq!(audio, 44100);
    }

    #[test]
    fn test_finish_terminates_pushed_stream() {
        let mut enc = encoder();
        enc.put_bytes(&[1u8; 4000]).unwrap();
        enc.finish().unwrap();
        assert!(enc.session().is_end_of_stream());
        enc.finish().unwrap();

        let out = drain(&enc);
        let mut reader = PacketReader::new(Cursor::new(out));
        let mut last = None;
        while let Some(p) = reader.read_packet().unwrap() {
            last = Some(p);
        }
        assert!(last.unwrap().last_in_stream());
    }

    #[test]
    fn test_push_after_finish_starts_new_stream() {
        let mut enc = encoder();
        enc.put_bytes(&[1u8; 400]).unwrap();
        enc.finish().unwrap();
        let first_serial = enc.session().serial();
        enc.put_bytes(&[2u8; 400]).unwrap();
        enc.finish().unwrap();
        assert_ne!(enc.session().serial(), None);

        let mut reader = PacketReader::new(Cursor::new(drain(&enc)));
        let mut starts = 0;
        let mut ends = 0;
        while let Some(p) = reader.read_packet().unwrap() {
            starts += p.first_in_stream() as usize;
            ends += p.last_in_stream() as usize;
        }
        assert_eq!((starts, ends), (2, 2));
        assert!(first_serial.is_some());
    }

    /// Audio payload bytes of each logical stream, in order.
    fn audio_per_stream(data: Vec<u8>) -> Vec<(usize, bool)> {
        let mut reader = PacketReader::new(Cursor::new(data));
        let mut streams: Vec<(usize, bool)> = Vec::new();
        let mut index = 0;
        while let Some(p) = reader.read_packet().unwrap() {
            if p.first_in_stream() {
                streams.push((0, false));
                index = 0;
            }
            let current = streams.last_mut().unwrap();
            if index >= 3 {
                current.0 += p.data.len();
            }
            current.1 |= p.last_in_stream();
            index += 1;
        }
        streams
    }

    #[test]
    fn test_encode_stream_ends_pushed_stream_first() {
        let mut enc = encoder();
        enc.put_bytes(&[1u8; 2000]).unwrap();
        enc.change_metadata(Tags::new().with("TITLE", "Next"));

        let mut sink = Vec::new();
        enc.encode_stream(Cursor::new(vec![2u8; 4000]), &mut sink)
            .unwrap();

        let mut all = drain(&enc);
        all.extend_from_slice(&sink);
        assert_eq!(audio_per_stream(all), vec![(2000, true), (4000, true)]);
    }

    #[test]
    fn test_put_bytes_holds_back_partial_frame() {
        let mut enc = encoder();
        enc.put_bytes(&[1, 0, 2]).unwrap();
        enc.put_bytes(&[0, 3, 0, 4, 0, 9]).unwrap();
        enc.finish().unwrap();

        let mut reader = PacketReader::new(Cursor::new(drain(&enc)));
        let mut audio = Vec::new();
        let mut count = 0;
        while let Some(p) = reader.read_packet().unwrap() {
            if count >= 3 {
                audio.extend_from_slice(&p.data);
            }
            count += 1;
        }
        assert_eq!(audio, vec![1, 0, 2, 0, 3, 0, 4, 0]);
    }

    #[tokio::test]
    async fn test_spawn_encode_reports_progress() -> Result<()> {
        let enc = encoder();
        let pcm = vec![0u8; 44100 * 4];
        let handle = enc.spawn_encode(Cursor::new(pcm), std::io::sink());

        while !handle.is_finished() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let written = handle.bytes_written();
        assert!((handle.position_secs() - 1.0).abs() < 1e-6);

        let (enc, total) = handle.join().await?;
        assert_eq!(total, written);
        assert!(enc.session().is_end_of_stream());
        Ok(())
    }
}
