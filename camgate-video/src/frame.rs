//! Typed records stored in the shared store's streams. Compressed packets
//! and decoded frames cross task boundaries only in these shapes, bincode
//! encoded.

use anyhow::Result;
use ffmpeg::{util::picture, Packet, Rational};
use serde::{Deserialize, Serialize};

/// One compressed video packet as it sits in the compressed ring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredPacket {
    pub data: Vec<u8>,
    pub pts: Option<i64>,
    pub dts: Option<i64>,
    pub duration: i64,
    /// (numerator, denominator) of the source stream's time base.
    pub time_base: (i32, i32),
    pub is_keyframe: bool,
    pub is_corrupt: bool,
}

impl StoredPacket {
    pub fn from_packet(packet: &Packet, time_base: Rational) -> StoredPacket {
        StoredPacket {
            data: packet.data().map(<[u8]>::to_vec).unwrap_or_default(),
            pts: packet.pts(),
            dts: packet.dts(),
            duration: packet.duration(),
            time_base: (time_base.numerator(), time_base.denominator()),
            is_keyframe: packet.is_key(),
            is_corrupt: packet.flags().contains(ffmpeg::packet::Flags::CORRUPT),
        }
    }

    /// Reconstitutes an ffmpeg packet that a decoder can consume.
    pub fn to_packet(&self) -> Packet {
        let mut packet = Packet::copy(&self.data);
        packet.set_pts(self.pts);
        packet.set_dts(self.dts);
        packet.set_duration(self.duration);
        packet
    }

    /// Wall-clock milliseconds of this packet, derivable because ingest
    /// demuxes with wallclock timestamps.
    pub fn timestamp_ms(&self) -> Option<i64> {
        let (num, den) = self.time_base;
        if den == 0 {
            return None;
        }
        self.pts
            .map(|pts| (pts as f64 * num as f64 / den as f64 * 1000.0) as i64)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<StoredPacket> {
        Ok(bincode::deserialize(bytes)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameKind {
    I,
    P,
    B,
    S,
    SI,
    SP,
    BI,
    Unknown,
}

impl From<picture::Type> for FrameKind {
    fn from(kind: picture::Type) -> FrameKind {
        match kind {
            picture::Type::I => FrameKind::I,
            picture::Type::P => FrameKind::P,
            picture::Type::B => FrameKind::B,
            picture::Type::S => FrameKind::S,
            picture::Type::SI => FrameKind::SI,
            picture::Type::SP => FrameKind::SP,
            picture::Type::BI => FrameKind::BI,
            picture::Type::None => FrameKind::Unknown,
        }
    }
}

/// One decoded BGR24 frame, as appended to the live ring and the
/// per-request decoded streams. The empty frame doubles as the sentinel a
/// consumer sees at the end of a historical request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodedFrame {
    /// Tightly packed BGR24 pixels, row major.
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// (rows, columns, channels)
    pub shape: (u32, u32, u32),
    pub timestamp_ms: i64,
    pub frame_kind: FrameKind,
    pub pts: Option<i64>,
    pub dts: Option<i64>,
    pub time_base: (i32, i32),
    pub is_keyframe: bool,
    pub is_corrupt: bool,
}

impl DecodedFrame {
    pub fn new(
        bgr: &ffmpeg::frame::Video,
        kind: FrameKind,
        source: &StoredPacket,
    ) -> DecodedFrame {
        let width = bgr.width();
        let height = bgr.height();
        DecodedFrame {
            data: packed_frame_data(bgr),
            width,
            height,
            shape: (height, width, 3),
            timestamp_ms: source
                .timestamp_ms()
                .unwrap_or_else(camgate_util::time::now_ms),
            frame_kind: kind,
            pts: source.pts,
            dts: source.dts,
            time_base: source.time_base,
            is_keyframe: source.is_keyframe,
            is_corrupt: source.is_corrupt,
        }
    }

    /// End-of-results marker for a request-scoped decoded stream.
    pub fn sentinel() -> DecodedFrame {
        DecodedFrame {
            data: Vec::new(),
            width: 0,
            height: 0,
            shape: (0, 0, 0),
            timestamp_ms: 0,
            frame_kind: FrameKind::Unknown,
            pts: None,
            dts: None,
            time_base: (0, 0),
            is_keyframe: false,
            is_corrupt: false,
        }
    }

    pub fn is_sentinel(&self) -> bool {
        self.data.is_empty() && self.width == 0 && self.height == 0
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<DecodedFrame> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Lazily (re)built BGR24 converter. Tracks the source geometry so a
/// mid-stream format change just recreates the scaling context.
#[derive(Default)]
pub(crate) struct BgrConverter {
    ctx: Option<ffmpeg::software::scaling::Context>,
    src: Option<(ffmpeg::format::Pixel, u32, u32)>,
}

impl BgrConverter {
    pub(crate) fn convert(&mut self, frame: &ffmpeg::frame::Video) -> Result<ffmpeg::frame::Video> {
        use ffmpeg::{format::Pixel, software::scaling};

        let src = (frame.format(), frame.width(), frame.height());
        if self.ctx.is_none() || self.src != Some(src) {
            self.ctx = Some(scaling::Context::get(
                src.0,
                src.1,
                src.2,
                Pixel::BGR24,
                src.1,
                src.2,
                scaling::Flags::BILINEAR,
            )?);
            self.src = Some(src);
        }
        let mut bgr = ffmpeg::frame::Video::empty();
        self.ctx
            .as_mut()
            .expect("converter just initialized")
            .run(frame, &mut bgr)?;
        bgr.set_pts(frame.pts());
        Ok(bgr)
    }
}

/// Copies plane 0 of a BGR24 frame into a tight buffer, dropping the
/// per-row alignment padding ffmpeg may have allocated.
fn packed_frame_data(frame: &ffmpeg::frame::Video) -> Vec<u8> {
    let width = frame.width() as usize;
    let height = frame.height() as usize;
    let stride = frame.stride(0);
    let line = width * 3;
    let src = frame.data(0);

    if stride == line {
        return src[..line * height].to_vec();
    }
    let mut out = Vec::with_capacity(line * height);
    for row in 0..height {
        out.extend_from_slice(&src[row * stride..][..line]);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stored(pts: Option<i64>, time_base: (i32, i32)) -> StoredPacket {
        StoredPacket {
            data: vec![0, 0, 0, 1],
            pts,
            dts: pts,
            duration: 0,
            time_base,
            is_keyframe: true,
            is_corrupt: false,
        }
    }

    #[test]
    fn test_timestamp_from_wallclock_pts() {
        // pts in 1/90000 ticks of unix seconds
        let unix_secs = 1_700_000_000i64;
        let packet = stored(Some(unix_secs * 90_000), (1, 90_000));
        assert_eq!(packet.timestamp_ms(), Some(unix_secs * 1000));

        assert_eq!(stored(None, (1, 90_000)).timestamp_ms(), None);
        assert_eq!(stored(Some(1), (0, 0)).timestamp_ms(), None);
    }

    #[test]
    fn test_stored_packet_codec_roundtrip() {
        let packet = stored(Some(42), (1, 1000));
        let decoded = StoredPacket::decode(&packet.encode().unwrap()).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_sentinel_is_recognizable() {
        let sentinel = DecodedFrame::sentinel();
        assert!(sentinel.is_sentinel());
        let bytes = sentinel.encode().unwrap();
        assert!(DecodedFrame::decode(&bytes).unwrap().is_sentinel());
    }
}
