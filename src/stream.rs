//! Blocking, back-pressured stream halves around a [`StreamEncoder`].
//!
//! Unlike [`StreamEncoder::put_bytes`], which grows the ring whenever the
//! consumer falls behind, the writer half here waits until the ring has room
//! for each piece of encoded output. The reader half waits a bounded number
//! of times for data before reporting that none is available this call.

use bytes::BytesMut;
use log::{debug, trace};
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::codec::Analyzer;
use crate::comment::Tags;
use crate::encoder::StreamEncoder;
use crate::ring::RingBuffer;

struct Shared {
    ring: Arc<RingBuffer>,
    closed: AtomicBool,
}

/// Split an encoder into a PCM-accepting writer and an encoded-byte reader.
///
/// The ring is sized from the encoder's configured chunk size and is never
/// grown by the writer.
pub fn split<A: Analyzer>(mut encoder: StreamEncoder<A>) -> (EncoderWriter<A>, EncoderReader) {
    let config = *encoder.buffer_config();
    let ring = encoder.ring_for(config.chunk_size);
    let shared = Arc::new(Shared {
        ring,
        closed: AtomicBool::new(false),
    });

    let writer = EncoderWriter {
        encoder,
        shared: Arc::clone(&shared),
        pending: BytesMut::new(),
        retry_interval: config.retry_interval,
    };
    let reader = EncoderReader {
        shared,
        read_retries: config.read_retries,
        retry_interval: config.retry_interval,
    };
    (writer, reader)
}

fn to_io(err: crate::Error) -> io::Error {
    match err {
        crate::Error::Framing(e) => e,
        other => io::Error::new(io::ErrorKind::Other, other),
    }
}

/// Producer half: accepts interleaved s16le PCM through [`Write`].
pub struct EncoderWriter<A: Analyzer> {
    encoder: StreamEncoder<A>,
    shared: Arc<Shared>,
    pending: BytesMut,
    retry_interval: Duration,
}

impl<A: Analyzer> EncoderWriter<A> {
    /// End the current logical stream on the next write and start a new one
    /// tagged with `metadata`.
    pub fn change_metadata(&mut self, metadata: Tags) {
        self.encoder.change_metadata(metadata);
    }

    pub fn encoder(&self) -> &StreamEncoder<A> {
        &self.encoder
    }

    /// Encode the end of the current stream, wait for its tail to fit in the
    /// ring and signal end of data to the reader.
    pub fn finish(&mut self) -> io::Result<()> {
        let pending = &mut self.pending;
        pending.clear();
        self.encoder
            .finish_with(|bytes| {
                pending.extend_from_slice(bytes);
                Ok(())
            })
            .map_err(to_io)?;
        self.push_pending()?;
        self.shared.closed.store(true, Ordering::Release);
        debug!("Encoder writer finished");
        Ok(())
    }

    /// Move `pending` into the ring, waiting for room piece by piece.
    fn push_pending(&mut self) -> io::Result<()> {
        let ring = &self.shared.ring;
        let piece_len = ring.capacity() - 1;
        for piece in self.pending.chunks(piece_len) {
            while !ring.can_write(piece.len()) {
                if Arc::strong_count(&self.shared) == 1 {
                    return Err(io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        "encoded stream reader dropped",
                    ));
                }
                trace!("ring full; waiting for {} bytes of space", piece.len());
                thread::sleep(self.retry_interval);
            }
            ring.write(piece).map_err(to_io)?;
        }
        self.pending.clear();
        Ok(())
    }
}

impl<A: Analyzer> Write for EncoderWriter<A> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        if self.shared.closed.load(Ordering::Acquire) {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "encoder writer already finished",
            ));
        }

        // A split frame waits for the next write.
        let frames = self.encoder.whole_frames(buf);
        if frames.is_empty() {
            return Ok(buf.len());
        }

        let pending = &mut self.pending;
        pending.clear();
        self.encoder
            .produce(&frames, |bytes| {
                pending.extend_from_slice(bytes);
                Ok(())
            })
            .map_err(to_io)?;
        self.push_pending()?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<A: Analyzer> Drop for EncoderWriter<A> {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::Release);
    }
}

/// Consumer half: yields encoded bytes through [`Read`].
///
/// `read` returns `Ok(0)` only once the writer has finished (or been
/// dropped) and the ring is drained. When the ring stays empty for the
/// configured number of retries it fails with
/// [`io::ErrorKind::WouldBlock`]; callers should simply try again.
pub struct EncoderReader {
    shared: Arc<Shared>,
    read_retries: u32,
    retry_interval: Duration,
}

impl EncoderReader {
    /// Encoded bytes waiting to be read.
    pub fn buffered(&self) -> usize {
        self.shared.ring.count()
    }

    /// Writer done and everything read.
    pub fn is_finished(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire) && self.shared.ring.is_empty()
    }
}

impl Read for EncoderReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        for _ in 0..=self.read_retries {
            let closed = self.shared.closed.load(Ordering::Acquire);
            let n = self.shared.ring.read(buf);
            if n > 0 || closed {
                return Ok(n);
            }
            thread::sleep(self.retry_interval);
        }
        Err(io::Error::new(
            io::ErrorKind::WouldBlock,
            "no encoded data available yet",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{BitrateMode, EncoderConfig};
    use crate::encoder::BufferConfig;
    use crate::pcm::PcmAnalyzer;
    use ogg::reading::PacketReader;
    use std::io::Cursor;

    fn encoder(chunk_size: usize) -> StreamEncoder<PcmAnalyzer> {
        StreamEncoder::new(
            PcmAnalyzer::new(),
            EncoderConfig {
                channels: 2,
                sample_rate: 44100,
                bitrate: BitrateMode::CBR(192),
            },
        )
        .with_buffer_config(BufferConfig {
            chunk_size,
            ring_multiplier: 1,
            read_retries: 3,
            retry_interval: Duration::from_millis(1),
        })
    }

    fn read_all(reader: &mut EncoderReader) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 512];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => panic!("read failed: {e}"),
            }
        }
        out
    }

    #[test]
    fn test_reader_reports_would_block_while_writer_alive() {
        let (_writer, mut reader) = split(encoder(256));
        let mut buf = [0u8; 16];
        let err = reader.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn test_reader_sees_eof_after_writer_dropped() {
        let (writer, mut reader) = split(encoder(256));
        drop(writer);
        let mut buf = [0u8; 16];
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
        assert!(reader.is_finished());
    }

    #[test]
    fn test_back_pressure_keeps_ring_bounded() {
        let (mut writer, mut reader) = split(encoder(2048));
        let capacity = writer.shared.ring.capacity();

        let producer = thread::spawn(move || {
            let pcm = vec![7u8; 64 * 1024];
            for chunk in pcm.chunks(1000) {
                writer.write_all(chunk).unwrap();
            }
            writer.finish().unwrap();
            writer.shared.ring.capacity()
        });

        let out = read_all(&mut reader);
        let final_capacity = producer.join().unwrap();
        assert_eq!(final_capacity, capacity);

        let mut packets = PacketReader::new(Cursor::new(out));
        let mut audio = 0;
        let mut count = 0;
        let mut last = false;
        while let Some(p) = packets.read_packet().unwrap() {
            if count >= 3 {
                audio += p.data.len();
            }
            count += 1;
            last = p.last_in_stream();
        }
        assert_eq!(audio, 64 * 1024);
        assert!(last);
    }

    #[test]
    fn test_split_frames_are_carried_over() {
        let (mut writer, mut reader) = split(encoder(1 << 16));
        writer.write_all(&[1, 0, 2]).unwrap();
        writer.write_all(&[0, 3, 0, 4, 0]).unwrap();
        writer.write_all(&[9]).unwrap();
        writer.finish().unwrap();

        let out = read_all(&mut reader);
        let mut packets = PacketReader::new(Cursor::new(out));
        let mut audio = Vec::new();
        let mut count = 0;
        while let Some(p) = packets.read_packet().unwrap() {
            if count >= 3 {
                audio.extend_from_slice(&p.data);
            }
            count += 1;
        }
        assert_eq!(audio, vec![1, 0, 2, 0, 3, 0, 4, 0]);
    }

    #[test]
    fn test_write_after_finish_is_rejected() {
        let (mut writer, mut reader) = split(encoder(1 << 16));
        writer.write_all(&[0u8; 400]).unwrap();
        writer.finish().unwrap();
        let before = writer.shared.ring.count();

        let err = writer.write(&[0u8; 400]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        assert_eq!(writer.shared.ring.count(), before);

        let out = read_all(&mut reader);
        assert_eq!(out.len(), before);
    }

    #[test]
    fn test_writer_fails_when_reader_dropped() {
        let (mut writer, reader) = split(encoder(64));
        drop(reader);
        let pcm = vec![0u8; 16 * 1024];
        let err = writer.write_all(&pcm).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }
}
