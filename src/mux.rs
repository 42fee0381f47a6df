use bytes::{BufMut, Bytes, BytesMut};
use log::{debug, trace};
use ogg::writing::{PacketWriteEndInfo, PacketWriter};
use ogg_pager::Page;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io::{self, Cursor, Write};
use std::sync::Arc;

use crate::codec::{HeaderPackets, Packet};
use crate::error::Result;

/// Body bytes after which an audio page is closed, like libogg's pageout.
const PAGE_FILL_TARGET: usize = 4096;

/// Fixed part of an Ogg page header; the lacing table follows.
const PAGE_HEADER_FIXED: usize = 27;

/// One physical page as emitted by the multiplexer.
#[derive(Clone, Debug)]
pub struct FramedPage {
    pub header: Bytes,
    pub body: Bytes,
    pub serial: u32,
    pub granule: u64,
    /// Last page of the logical stream (EOS flag set).
    pub terminal: bool,
}

impl FramedPage {
    pub fn len(&self) -> usize {
        self.header.len() + self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append header then body to `out`.
    pub fn write_to(&self, out: &mut BytesMut) {
        out.put_slice(&self.header);
        out.put_slice(&self.body);
    }
}

/// Byte sink shared with the packet writer, which owns its writer by value.
#[derive(Clone, Default)]
struct PageSink(Arc<Mutex<BytesMut>>);

impl Write for PageSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().put_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Frames the packets of one logical stream into Ogg pages.
///
/// Header packets always close their page, so the first audio packet starts
/// on a fresh page. Audio pages are closed once they carry roughly
/// [`PAGE_FILL_TARGET`] bytes, and the final packet closes the stream with
/// the EOS flag.
pub struct PageMux {
    serial: u32,
    writer: PacketWriter<'static, PageSink>,
    sink: PageSink,
    ready: VecDeque<FramedPage>,
    page_fill: usize,
}

impl PageMux {
    pub fn new(serial: u32) -> Self {
        debug!("Creating PageMux with serial={:#x}", serial);
        let sink = PageSink::default();
        Self {
            serial,
            writer: PacketWriter::new(sink.clone()),
            sink,
            ready: VecDeque::new(),
            page_fill: 0,
        }
    }

    pub fn serial(&self) -> u32 {
        self.serial
    }

    /// Queue the identification packet on its own page, then the comment
    /// and setup packets on the page(s) that follow.
    pub fn write_headers(&mut self, headers: &HeaderPackets) -> Result<()> {
        self.write(headers.ident.clone(), PacketWriteEndInfo::EndPage, 0)?;
        self.write(headers.comment.clone(), PacketWriteEndInfo::NormalPacket, 0)?;
        self.write(headers.setup.clone(), PacketWriteEndInfo::EndPage, 0)?;
        self.page_fill = 0;
        Ok(())
    }

    /// Weld one audio packet into the bitstream.
    pub fn packet_in(&mut self, packet: &Packet) -> Result<()> {
        self.page_fill += packet.data.len();
        let info = if packet.last {
            PacketWriteEndInfo::EndStream
        } else if self.page_fill >= PAGE_FILL_TARGET {
            PacketWriteEndInfo::EndPage
        } else {
            PacketWriteEndInfo::NormalPacket
        };
        if !matches!(info, PacketWriteEndInfo::NormalPacket) {
            self.page_fill = 0;
        }
        self.write(packet.data.clone(), info, packet.granule)
    }

    /// Next completed page, if any.
    pub fn next_page(&mut self) -> Result<Option<FramedPage>> {
        if self.ready.is_empty() {
            self.collect_pages()?;
        }
        Ok(self.ready.pop_front())
    }

    fn write(&mut self, data: Bytes, info: PacketWriteEndInfo, granule: u64) -> Result<()> {
        self.writer
            .write_packet(data.to_vec(), self.serial, info, granule)?;
        Ok(())
    }

    /// Split whatever the writer has produced into pages.
    fn collect_pages(&mut self) -> Result<()> {
        let raw = {
            let mut pending = self.sink.0.lock();
            if pending.is_empty() {
                return Ok(());
            }
            pending.split().freeze()
        };

        let mut cursor = Cursor::new(&raw[..]);
        while (cursor.position() as usize) < raw.len() {
            let start = cursor.position() as usize;
            let page = Page::read(&mut cursor)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
            let end = cursor.position() as usize;

            let header_len = PAGE_HEADER_FIXED + usize::from(raw[start + PAGE_HEADER_FIXED - 1]);
            let terminal = (page.header().header_type_flag() & 0x04) != 0;
            if terminal {
                debug!("Detected EOS on serial={:#x}", self.serial);
            }
            trace!(
                "page seq={} serial={:#x} len={}",
                page.header().sequence_number,
                page.header().stream_serial,
                end - start
            );
            self.ready.push_back(FramedPage {
                header: raw.slice(start..start + header_len),
                body: raw.slice(start + header_len..end),
                serial: page.header().stream_serial,
                granule: page.header().abgp,
                terminal,
            });
        }
        Ok(())
    }
}
