//! Codec metadata published by ingest and consumed by every decoder.
//!
//! The record is written once per camera (re)connect. `extradata` carries
//! the out-of-band parameter sets (SPS/PPS for H.264), which is what lets
//! the historical decoder start from a bare keyframe without ever seeing
//! the container.

use anyhow::{anyhow, bail, Context, Result};
use camgate_store::Store;
use ffmpeg::{codec, format::Pixel};
use serde::{Deserialize, Serialize};

use crate::keys;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodecInfo {
    pub name: String,
    pub long_name: String,
    pub width: u32,
    pub height: u32,
    pub pix_fmt: String,
    pub extradata: Vec<u8>,
}

impl CodecInfo {
    pub fn from_stream(stream: &ffmpeg::format::stream::Stream) -> Result<CodecInfo> {
        let parameters = stream.parameters();
        let decoder = codec::Context::from_parameters(parameters.clone())?
            .decoder()
            .video()?;
        let codec = decoder
            .codec()
            .ok_or_else(|| anyhow!("video stream has no decodable codec"))?;
        let pix_fmt = decoder
            .format()
            .descriptor()
            .map(|d| d.name().to_owned())
            .ok_or_else(|| anyhow!("video stream has no pixel format"))?;

        let extradata = unsafe {
            let raw = parameters.as_ptr();
            let ptr = (*raw).extradata;
            let size = (*raw).extradata_size as usize;
            if ptr.is_null() || size == 0 {
                Vec::new()
            } else {
                std::slice::from_raw_parts(ptr, size).to_vec()
            }
        };

        Ok(CodecInfo {
            name: codec.name().to_owned(),
            long_name: codec.description().to_owned(),
            width: decoder.width(),
            height: decoder.height(),
            pix_fmt,
            extradata,
        })
    }

    pub fn pixel(&self) -> Result<Pixel> {
        let name = std::ffi::CString::new(self.pix_fmt.as_str())?;
        let format = unsafe { ffmpeg::ffi::av_get_pix_fmt(name.as_ptr()) };
        if format == ffmpeg::ffi::AVPixelFormat::AV_PIX_FMT_NONE {
            bail!("unknown pixel format '{}'", self.pix_fmt);
        }
        Ok(Pixel::from(format))
    }

    /// Builds a standalone decoder configured from this record, extradata
    /// included.
    pub fn open_decoder(&self) -> Result<ffmpeg::decoder::Video> {
        let codec = ffmpeg::decoder::find_by_name(&self.name)
            .ok_or_else(|| anyhow!("decoder '{}' not available", self.name))?;
        let mut ctx = codec::Context::new();
        let pix_fmt = self.pixel()?;

        unsafe {
            let raw = ctx.as_mut_ptr();
            (*raw).width = self.width as i32;
            (*raw).height = self.height as i32;
            (*raw).pix_fmt = pix_fmt.into();
            if !self.extradata.is_empty() {
                let size = self.extradata.len();
                let padded = size + ffmpeg::ffi::AV_INPUT_BUFFER_PADDING_SIZE as usize;
                let buf = ffmpeg::ffi::av_mallocz(padded as _) as *mut u8;
                if buf.is_null() {
                    bail!("failed to allocate extradata");
                }
                std::ptr::copy_nonoverlapping(self.extradata.as_ptr(), buf, size);
                (*raw).extradata = buf;
                (*raw).extradata_size = size as i32;
            }
        }

        Ok(ctx.decoder().open_as(codec)?.video()?)
    }

    pub fn publish(&self, store: &Store) -> Result<()> {
        store
            .put(keys::CODEC_VIDEO_INFO, bincode::serialize(self)?)
            .context("failed to publish codec info")
    }

    pub fn load(store: &Store) -> Result<Option<CodecInfo>> {
        match store.get(keys::CODEC_VIDEO_INFO)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_then_load() {
        let store = Store::new();
        assert!(CodecInfo::load(&store).unwrap().is_none());

        let info = CodecInfo {
            name: "h264".into(),
            long_name: "H.264 / AVC / MPEG-4 AVC".into(),
            width: 1280,
            height: 720,
            pix_fmt: "yuv420p".into(),
            extradata: vec![1, 100, 0, 31],
        };
        info.publish(&store).unwrap();
        assert_eq!(CodecInfo::load(&store).unwrap().unwrap(), info);
    }
}
