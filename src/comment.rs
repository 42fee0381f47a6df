use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Ordered metadata tags for one logical stream.
///
/// Keys are not coalesced: pushing `ARTIST` twice yields two comment
/// entries, in insertion order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Tags {
    entries: Vec<(String, String)>,
}

impl Tags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.push((key.into(), value.into()));
    }

    /// Builder form of [`push`](Self::push).
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.push(key, value);
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// First value stored under `key`, compared case-insensitively.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serialise as a Xiph comment packet: `magic`, vendor string, entry
    /// count, `KEY=value` entries (all lengths u32 LE), then the framing bit.
    pub fn to_packet(&self, magic: &[u8], vendor: &str) -> Bytes {
        let mut out = BytesMut::new();
        out.put_slice(magic);
        out.put_u32_le(vendor.len() as u32);
        out.put_slice(vendor.as_bytes());
        out.put_u32_le(self.entries.len() as u32);
        for (key, value) in &self.entries {
            out.put_u32_le((key.len() + 1 + value.len()) as u32);
            out.put_slice(key.as_bytes());
            out.put_u8(b'=');
            out.put_slice(value.as_bytes());
        }
        out.put_u8(1);
        out.freeze()
    }

    /// Parse a packet produced by [`to_packet`](Self::to_packet). Returns the
    /// vendor string and the tags, or `None` if the packet is malformed.
    pub fn from_packet(magic: &[u8], packet: &[u8]) -> Option<(String, Tags)> {
        let mut buf = packet.strip_prefix(magic)?;
        let vendor = read_string(&mut buf)?;
        if buf.remaining() < 4 {
            return None;
        }
        let count = buf.get_u32_le();
        let mut tags = Tags::new();
        for _ in 0..count {
            let entry = read_string(&mut buf)?;
            let (key, value) = entry.split_once('=')?;
            tags.push(key, value);
        }
        Some((vendor, tags))
    }
}

fn read_string(buf: &mut &[u8]) -> Option<String> {
    if buf.remaining() < 4 {
        return None;
    }
    let len = buf.get_u32_le() as usize;
    if buf.remaining() < len {
        return None;
    }
    let s = String::from_utf8(buf[..len].to_vec()).ok()?;
    buf.advance(len);
    Some(s)
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Tags {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}
