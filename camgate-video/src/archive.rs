//! Segment archiving: a worker that turns each completed packet group into
//! one self-contained container file.
//!
//! The file name is the segment's only metadata:
//! `<device_dir>/<start_ts_ms>_<duration_ms>.mp4`. Timestamps inside the
//! file are rebased to zero so every segment plays standalone.

use std::{
    path::{Path, PathBuf},
    thread,
    time::Duration,
};

use anyhow::{Context, Result};
use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender};
use ffmpeg::{codec, encoder, format, Packet, Rational};
use tracing::{debug, instrument, warn};

use crate::gop::PacketGroup;

const QUEUE_DEPTH: usize = 8;
const POLL_INTERVAL: Duration = Duration::from_secs(5);

pub struct ArchiveJob {
    pub group: PacketGroup,
    /// Video stream parameters of the current camera connection, used to
    /// template the output stream.
    pub video_params: codec::Parameters,
}

pub struct Archiver {
    tx: Sender<ArchiveJob>,
}

impl Archiver {
    /// Creates the device's segment directory and starts the worker.
    pub fn spawn(disk_root: &Path, device_id: &str) -> Result<Archiver> {
        let dir = disk_root.join(device_id);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create segment dir {}", dir.display()))?;

        let (tx, rx) = bounded(QUEUE_DEPTH);
        thread::Builder::new()
            .name("archiver".into())
            .spawn(move || worker(rx, dir))
            .context("failed to spawn archiver")?;
        Ok(Archiver { tx })
    }

    /// Hands a completed group to the worker. Never blocks ingest: when the
    /// disk cannot keep up the group is dropped with a warning.
    pub fn submit(&self, job: ArchiveJob) {
        if self.tx.try_send(job).is_err() {
            warn!("archive queue full, dropping packet group");
        }
    }
}

fn worker(rx: Receiver<ArchiveJob>, dir: PathBuf) {
    loop {
        match rx.recv_timeout(POLL_INTERVAL) {
            Ok(job) => {
                if let Err(e) = write_segment(&dir, job) {
                    warn!(%e, "failed to write segment");
                }
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

#[instrument(skip_all, fields(start_ts = job.group.start_ts))]
fn write_segment(dir: &Path, job: ArchiveJob) -> Result<()> {
    let group = job.group;
    let length_ms = segment_length_ms(&group.packets, group.time_base);
    let path = dir.join(segment_file_name(group.start_ts, length_ms));

    let mut octx = format::output(&path)?;
    let mut ost = octx.add_stream(encoder::find(codec::Id::None))?;
    ost.set_parameters(job.video_params);
    // codec_tag of the source container is usually incompatible with mp4
    unsafe {
        (*ost.parameters().as_mut_ptr()).codec_tag = 0;
    }
    octx.write_header()?;
    let ost_time_base = octx.stream(0).expect("stream 0 just added").time_base();

    let min_dts = group
        .packets
        .iter()
        .filter_map(Packet::dts)
        .min()
        .unwrap_or(0);

    for mut packet in group.packets {
        if packet.dts().is_none() {
            continue;
        }
        packet.set_pts(packet.pts().map(|pts| pts - min_dts));
        packet.set_dts(packet.dts().map(|dts| dts - min_dts));
        packet.set_stream(0);
        packet.set_position(-1);
        packet.rescale_ts(group.time_base, ost_time_base);
        if let Err(e) = packet.write_interleaved(&mut octx) {
            warn!(%e, "failed to mux packet into segment");
        }
    }

    octx.write_trailer()?;
    debug!(path = %path.display(), "wrote segment");
    Ok(())
}

pub(crate) fn segment_file_name(start_ts: i64, length_ms: i64) -> String {
    format!("{start_ts}_{length_ms}.mp4")
}

/// Duration of a group in integer milliseconds. Prefers the per-packet
/// durations; cameras that do not fill them get the dts span instead.
pub(crate) fn segment_length_ms(packets: &[Packet], time_base: Rational) -> i64 {
    let tb = f64::from(time_base);
    let seconds = if !packets.is_empty() && packets.iter().all(|p| p.duration() > 0) {
        packets.iter().map(Packet::duration).sum::<i64>() as f64 * tb
    } else {
        let dts: Vec<i64> = packets.iter().filter_map(Packet::dts).collect();
        match (dts.iter().min(), dts.iter().max()) {
            (Some(min), Some(max)) => (max - min) as f64 * tb,
            _ => 0.0,
        }
    };
    (seconds * 1000.0).round() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(dts: i64, duration: i64) -> Packet {
        let mut packet = Packet::copy(&[0u8; 4]);
        packet.set_dts(Some(dts));
        packet.set_pts(Some(dts));
        packet.set_duration(duration);
        packet
    }

    #[test]
    fn test_length_from_durations() {
        crate::init();
        let tb = Rational::new(1, 90_000);
        // 50 packets x 3600 ticks = 2 s
        let packets: Vec<Packet> = (0..50).map(|i| packet(i * 3600, 3600)).collect();
        assert_eq!(segment_length_ms(&packets, tb), 2000);
    }

    #[test]
    fn test_length_from_dts_span_when_durations_missing() {
        crate::init();
        let tb = Rational::new(1, 1000);
        let packets = vec![packet(5000, 0), packet(5040, 0), packet(6500, 0)];
        assert_eq!(segment_length_ms(&packets, tb), 1500);
    }

    #[test]
    fn test_length_of_empty_group() {
        crate::init();
        assert_eq!(segment_length_ms(&[], Rational::new(1, 1000)), 0);
    }

    #[test]
    fn test_file_name_grammar() {
        let name = segment_file_name(1_700_000_000_000, 2000);
        assert_eq!(name, "1700000000000_2000.mp4");
        let (ts, rest) = name.split_once('_').unwrap();
        let (dur, ext) = rest.split_once('.').unwrap();
        assert!(ts.parse::<i64>().is_ok());
        assert!(dur.parse::<i64>().is_ok());
        assert_eq!(ext, "mp4");
    }
}
