//! RTMP egress: forwards the compressed stream to a remote endpoint in an
//! FLV container, video templated from the camera, audio when the source
//! has it.

use anyhow::Result;
use ffmpeg::{codec, encoder, format, Packet, Rational};
use tracing::info;

use crate::gop::PacketGroup;

pub struct RtmpOutput {
    octx: format::context::Output,
    video_time_base: Rational,
    video_ost_time_base: Rational,
    audio: Option<AudioLane>,
}

struct AudioLane {
    ost_index: usize,
    time_base: Rational,
    ost_time_base: Rational,
}

impl RtmpOutput {
    pub fn open(
        url: &str,
        video_params: codec::Parameters,
        video_time_base: Rational,
        audio: Option<(codec::Parameters, Rational)>,
    ) -> Result<RtmpOutput> {
        let mut octx = format::output_as(&url, "flv")?;

        let mut video_ost = octx.add_stream(encoder::find(codec::Id::None))?;
        video_ost.set_parameters(video_params);
        unsafe {
            (*video_ost.parameters().as_mut_ptr()).codec_tag = 0;
        }

        let mut audio_lane = None;
        if let Some((params, time_base)) = audio {
            let mut audio_ost = octx.add_stream(encoder::find(codec::Id::None))?;
            audio_ost.set_parameters(params);
            unsafe {
                (*audio_ost.parameters().as_mut_ptr()).codec_tag = 0;
            }
            audio_lane = Some((audio_ost.index(), time_base));
        }

        octx.write_header()?;

        let video_ost_time_base = octx.stream(0).expect("video stream").time_base();
        let audio = audio_lane.map(|(ost_index, time_base)| AudioLane {
            ost_index,
            time_base,
            ost_time_base: octx.stream(ost_index).expect("audio stream").time_base(),
        });

        info!(url, "opened rtmp egress");
        Ok(RtmpOutput { octx, video_time_base, video_ost_time_base, audio })
    }

    pub fn write_video(&mut self, packet: &Packet) -> Result<()> {
        let mut out = packet.clone();
        out.set_stream(0);
        out.set_position(-1);
        out.rescale_ts(self.video_time_base, self.video_ost_time_base);
        out.write_interleaved(&mut self.octx)?;
        Ok(())
    }

    pub fn write_audio(&mut self, packet: &Packet) -> Result<()> {
        let Some(audio) = &self.audio else {
            return Ok(());
        };
        let mut out = packet.clone();
        out.set_stream(audio.ost_index);
        out.set_position(-1);
        out.rescale_ts(audio.time_base, audio.ost_time_base);
        out.write_interleaved(&mut self.octx)?;
        Ok(())
    }

    /// Re-emits the whole in-flight group. Used when egress is switched on
    /// mid-group: the remote decoder needs the group's keyframe before any
    /// of the packets that follow.
    pub fn flush_group(&mut self, group: &PacketGroup) -> Result<()> {
        for packet in &group.packets {
            self.write_video(packet)?;
        }
        Ok(())
    }
}
