//! Camera ingest: maintains a live RTSP demux and fans packets out to the
//! packet-group assembler, the compressed ring, the live decoder and the
//! optional RTMP egress.
//!
//! The demux loop enforces the invariant every downstream stage relies on:
//! nothing flows until the first keyframe, so all streams begin at a group
//! boundary.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use camgate_store::Store;
use ffmpeg::{codec, format, media, Dictionary, Rational};
use tracing::{info, instrument, trace, warn};

use crate::{
    archive::{ArchiveJob, Archiver},
    codec::CodecInfo,
    egress::RtmpOutput,
    frame::StoredPacket,
    gop::GroupAssembler,
    keys,
    live::{LiveHandle, LivePacket},
    ring::MemoryRing,
    settings::DeviceSettings,
};

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

pub struct IngestConfig {
    pub device_id: String,
    pub rtsp_url: String,
    pub rtmp_url: Option<String>,
}

pub struct Ingestor {
    pub store: Store,
    pub ring: MemoryRing,
    pub live: LiveHandle,
    pub archiver: Option<Archiver>,
    pub config: IngestConfig,
}

struct Session {
    ictx: format::context::Input,
    video_index: usize,
    video_time_base: Rational,
    video_params: codec::Parameters,
    audio_index: Option<usize>,
    egress: Option<RtmpOutput>,
}

impl Ingestor {
    /// Runs forever. Returns only on a fatal error: store failure during
    /// initial cleanup, or a camera that was never reachable.
    #[instrument(skip(self), fields(device_id = %self.config.device_id))]
    pub fn run(self) -> Result<()> {
        // a previous run's ring state would corrupt seeks and confuse
        // consumers, so clear it before the first packet
        self.ring
            .clear()
            .context("initial shared store cleanup failed")?;
        self.store
            .stream_delete(&keys::live_decoded(&self.config.device_id))
            .context("initial shared store cleanup failed")?;

        let mut connected_once = false;
        loop {
            match self.connect() {
                Ok(session) => {
                    connected_once = true;
                    if let Err(e) = self.demux(session) {
                        warn!(%e, "camera stream ended");
                    }
                }
                Err(e) if !connected_once => {
                    return Err(e).context("failed to connect to rtsp camera");
                }
                Err(e) => warn!(%e, "failed to reconnect to rtsp camera"),
            }
            std::thread::sleep(RECONNECT_DELAY);
            info!("waiting for camera to reappear");
        }
    }

    /// Opens the camera and publishes codec info. Repeated on every
    /// reconnect since the camera may come back with a different setup.
    fn connect(&self) -> Result<Session> {
        let mut options = Dictionary::new();
        options.set("rtsp_transport", "tcp");
        options.set("stimeout", "5000000");
        options.set("max_delay", "5000000");
        options.set("use_wallclock_as_timestamps", "1");
        options.set("fflags", "+genpts");

        let ictx = format::input_with_dictionary(&self.config.rtsp_url, options)?;
        let video = ictx
            .streams()
            .best(media::Type::Video)
            .ok_or_else(|| anyhow!("camera exposes no video stream"))?;
        let video_index = video.index();
        let video_time_base = video.time_base();
        let video_params = video.parameters();

        let info = CodecInfo::from_stream(&video)?;
        info!(
            codec = %info.name,
            width = info.width,
            height = info.height,
            pix_fmt = %info.pix_fmt,
            "connected to camera"
        );
        info.publish(&self.store)?;

        let audio = ictx
            .streams()
            .best(media::Type::Audio)
            .map(|s| (s.index(), s.parameters(), s.time_base()));
        let audio_index = audio.as_ref().map(|(index, ..)| *index);

        // egress failing to open must not take ingest down with it
        let egress = match &self.config.rtmp_url {
            Some(url) => match RtmpOutput::open(
                url,
                video_params.clone(),
                video_time_base,
                audio.map(|(_, params, tb)| (params, tb)),
            ) {
                Ok(output) => Some(output),
                Err(e) => {
                    warn!(%e, "failed to open rtmp egress, continuing without");
                    None
                }
            },
            None => None,
        };

        Ok(Session {
            ictx,
            video_index,
            video_time_base,
            video_params,
            audio_index,
            egress,
        })
    }

    fn demux(&self, mut session: Session) -> Result<()> {
        let mut assembler = GroupAssembler::new();
        let mut seen_keyframe = false;
        let mut should_mux = false;
        let mut group_start_ts = 0;

        for (stream, packet) in session.ictx.packets() {
            if packet.dts().is_none() {
                continue;
            }
            let is_video = stream.index() == session.video_index;
            let is_audio = Some(stream.index()) == session.audio_index;
            if !is_video && !is_audio {
                continue;
            }
            let is_keyframe = is_video && packet.is_key();

            if is_keyframe {
                seen_keyframe = true;
            }
            if !seen_keyframe {
                trace!("dropping packet before first keyframe");
                continue;
            }

            let settings = DeviceSettings::load(&self.store, &self.config.device_id)
                .unwrap_or_else(|e| {
                    warn!(%e, "failed to read device settings");
                    DeviceSettings::default()
                });
            let now = self.store.now_ms();

            if settings.query_fresh(now) {
                if let Some(last_query) = settings.last_query {
                    self.live.wake(last_query);
                }
            }

            let mux_was_on = should_mux;
            should_mux = settings.proxy_rtmp;
            let flush_group = should_mux && !mux_was_on;

            if is_keyframe {
                if let Some(group) = assembler.begin_group(now, session.video_time_base) {
                    if let Some(archiver) = &self.archiver {
                        archiver.submit(ArchiveJob {
                            group,
                            video_params: session.video_params.clone(),
                        });
                    }
                }
                group_start_ts = now;
            }

            if let Some(egress) = session.egress.as_mut() {
                if should_mux {
                    if flush_group {
                        if let Some(group) = assembler.current() {
                            if let Err(e) = egress.flush_group(group) {
                                warn!(%e, "failed to flush in-flight group to rtmp");
                            }
                        }
                    }
                    let muxed = if is_video {
                        egress.write_video(&packet)
                    } else {
                        egress.write_audio(&packet)
                    };
                    if let Err(e) = muxed {
                        warn!(%e, "failed muxing to rtmp");
                    }
                }
            }

            if is_video {
                let stored = StoredPacket::from_packet(&packet, session.video_time_base);
                if let Err(e) = self.ring.push(&stored) {
                    warn!(%e, "failed to append packet to memory ring");
                }
                self.live.deliver(LivePacket { group_start_ts, packet: stored });
                assembler.push(packet);
            }
        }
        Ok(())
    }
}
