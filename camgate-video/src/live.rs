//! Live decoder: keeps the freshest decoded frame available while someone
//! is actually watching.
//!
//! Ingest feeds it through two channels. The packet channel carries every
//! video packet of the current group; the single-slot wake channel carries
//! the consumer's `last_query` timestamp whenever it is fresh. The worker
//! selects over both and goes idle when wakes stop, so an unwatched camera
//! costs no decode CPU.

use std::time::{Duration, Instant};

use anyhow::Result;
use camgate_store::Store;
use crossbeam::{
    channel::{bounded, Receiver, Sender},
    select,
};
use tracing::{debug, info, trace, warn};

use crate::{
    codec::CodecInfo,
    frame::{BgrConverter, DecodedFrame, FrameKind, StoredPacket},
    keys,
    settings::DeviceSettings,
};

/// Sleep when no wake arrived for this long.
const IDLE_TIMEOUT: Duration = Duration::from_secs(10);
/// Packets buffered towards the decoder; sized for a couple of GOP-seconds.
const PACKET_BACKLOG: usize = 64;
/// The live ring is a hand-off slot, not a buffer.
const DECODED_RING_LEN: usize = 10;

pub struct LivePacket {
    /// Start timestamp of the group this packet belongs to. A change marks
    /// a group boundary even if the keyframe packet itself was shed.
    pub group_start_ts: i64,
    pub packet: StoredPacket,
}

#[derive(Clone)]
pub struct LiveHandle {
    packet_tx: Sender<LivePacket>,
    wake_tx: Sender<i64>,
}

impl LiveHandle {
    /// Delivers a packet without ever blocking ingest; a sleeping or slow
    /// decoder sheds load here.
    pub fn deliver(&self, packet: LivePacket) {
        if self.packet_tx.try_send(packet).is_err() {
            trace!("live decoder backlog full, dropping packet");
        }
    }

    /// Coalescing wake carrying the newest `last_query` timestamp.
    pub fn wake(&self, last_query: i64) {
        let _ = self.wake_tx.try_send(last_query);
    }
}

pub fn spawn(store: Store, device_id: String) -> Result<LiveHandle> {
    let (packet_tx, packet_rx) = bounded(PACKET_BACKLOG);
    let (wake_tx, wake_rx) = bounded(1);
    std::thread::Builder::new()
        .name("live-decoder".into())
        .spawn(move || {
            Worker::new(store, device_id).run(packet_rx, wake_rx);
        })?;
    Ok(LiveHandle { packet_tx, wake_tx })
}

struct Worker {
    store: Store,
    device_id: String,
    ring_key: String,

    decoder: Option<ffmpeg::decoder::Video>,
    converter: BgrConverter,

    /// Copy of the current group, reset at each group boundary.
    group: Vec<StoredPacket>,
    group_start_ts: i64,
    decoded_upto: usize,
    keyframe_count: u64,

    enabled: bool,
    last_wake: Instant,
    last_query_seen: i64,
    last_query_decoded: i64,
}

impl Worker {
    fn new(store: Store, device_id: String) -> Worker {
        let ring_key = keys::live_decoded(&device_id);
        Worker {
            store,
            device_id,
            ring_key,
            decoder: None,
            converter: BgrConverter::default(),
            group: Vec::new(),
            group_start_ts: 0,
            decoded_upto: 0,
            keyframe_count: 0,
            enabled: false,
            last_wake: Instant::now(),
            last_query_seen: 0,
            last_query_decoded: 0,
        }
    }

    fn run(mut self, packet_rx: Receiver<LivePacket>, wake_rx: Receiver<i64>) {
        info!("live decoder up");
        loop {
            select! {
                recv(packet_rx) -> msg => match msg {
                    Ok(packet) => self.on_packet(packet),
                    Err(_) => break,
                },
                recv(wake_rx) -> msg => match msg {
                    Ok(ts) => self.on_wake(ts),
                    Err(_) => break,
                },
                default(IDLE_TIMEOUT) => {
                    self.enabled = false;
                }
            }
        }
        info!("live decoder down");
    }

    fn on_packet(&mut self, packet: LivePacket) {
        if packet.group_start_ts != self.group_start_ts {
            // new group: buffered-but-undecoded leftovers are stale now
            self.group.clear();
            self.group_start_ts = packet.group_start_ts;
            self.decoded_upto = 0;
            self.keyframe_count += 1;
            self.enabled = false;
            trace!(
                keyframe_count = self.keyframe_count,
                group_start_ts = self.group_start_ts,
                "group boundary"
            );
        }
        self.group.push(packet.packet);
        if self.enabled && self.last_wake.elapsed() >= IDLE_TIMEOUT {
            self.enabled = false;
        }
        if self.enabled {
            self.decode_pending();
        }
    }

    fn on_wake(&mut self, last_query: i64) {
        self.enabled = true;
        self.last_wake = Instant::now();
        self.last_query_seen = last_query;
        self.decode_pending();
    }

    fn decode_pending(&mut self) {
        // a group whose keyframe was shed cannot be decoded
        if !self.group.first().is_some_and(|p| p.is_keyframe) {
            return;
        }
        let keyframe_only = DeviceSettings::load(&self.store, &self.device_id)
            .map(|s| s.keyframe_only)
            .unwrap_or(false);
        let query_advanced = self.last_query_seen > self.last_query_decoded;
        let plan = decode_plan(keyframe_only, self.decoded_upto, self.group.len(), query_advanced);
        if plan.is_empty() {
            return;
        }
        for index in plan.clone() {
            let packet = self.group[index].clone();
            if let Err(e) = self.decode_one(&packet) {
                debug!(%e, "failed to decode live packet");
            }
        }
        self.decoded_upto = plan.end;
        self.last_query_decoded = self.last_query_seen;
    }

    fn decode_one(&mut self, stored: &StoredPacket) -> Result<()> {
        if self.decoder.is_none() {
            let Some(info) = CodecInfo::load(&self.store)? else {
                trace!("codec info not published yet, skipping decode");
                return Ok(());
            };
            self.decoder = Some(info.open_decoder()?);
        }
        let decoder = self.decoder.as_mut().expect("decoder just initialized");

        let packet = stored.to_packet();
        decoder.send_packet(&packet)?;

        let mut decoded = ffmpeg::frame::Video::empty();
        while decoder.receive_frame(&mut decoded).is_ok() {
            let kind = FrameKind::from(decoded.kind());
            let bgr = self.converter.convert(&decoded)?;
            let frame = DecodedFrame::new(&bgr, kind, stored);
            if let Err(e) =
                self.store
                    .stream_append(&self.ring_key, frame.encode()?, DECODED_RING_LEN)
            {
                warn!(%e, "failed to append live frame");
            }
        }
        Ok(())
    }
}

/// Which packets of the current group to decode next.
///
/// While awake, the group's opening packet always decodes so every new
/// group yields at least one fresh frame; the rest of the group is decoded
/// as a catch-up whenever the consumer's query timestamp advanced. With
/// `keyframe_only` set, only the opening packet is ever decoded.
fn decode_plan(
    keyframe_only: bool,
    decoded_upto: usize,
    group_len: usize,
    query_advanced: bool,
) -> std::ops::Range<usize> {
    if group_len == 0 {
        return 0..0;
    }
    if keyframe_only {
        return if decoded_upto == 0 { 0..1 } else { decoded_upto..decoded_upto };
    }
    if decoded_upto == 0 || query_advanced {
        decoded_upto..group_len
    } else {
        decoded_upto..decoded_upto
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_plan_first_packet_always_decodes() {
        assert_eq!(decode_plan(false, 0, 1, false), 0..1);
        assert_eq!(decode_plan(false, 0, 5, false), 0..5);
    }

    #[test]
    fn test_decode_plan_catches_up_only_on_new_query() {
        // no query progress: buffered packets stay undecoded
        assert!(decode_plan(false, 1, 5, false).is_empty());
        // a fresh query decodes everything buffered since
        assert_eq!(decode_plan(false, 1, 5, true), 1..5);
        assert!(decode_plan(false, 5, 5, true).is_empty());
    }

    #[test]
    fn test_decode_plan_keyframe_only() {
        assert_eq!(decode_plan(true, 0, 5, true), 0..1);
        assert!(decode_plan(true, 1, 5, true).is_empty());
    }

    #[test]
    fn test_decode_plan_empty_group() {
        assert!(decode_plan(false, 0, 0, true).is_empty());
    }
}
