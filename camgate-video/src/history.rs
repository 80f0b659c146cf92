//! Historical decoding: serves time-ranged frame requests out of the
//! compressed ring.
//!
//! A dispatcher listens on the request pub/sub channel and spawns one
//! worker per request. The worker seeks the ring to the keyframe at or
//! before the requested start, decodes forward through a scaling filter
//! graph, and streams BGR24 frames into a request-scoped bounded stream
//! that the consumer drains. An empty sentinel frame terminates every
//! request, success or not.

use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use camgate_store::Store;
use ffmpeg::{filter, frame};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::{
    codec::CodecInfo,
    frame::{BgrConverter, DecodedFrame, FrameKind, StoredPacket},
    keys,
    ring::MemoryRing,
};

/// Ring entries fetched per range read.
const READ_BATCH: usize = 30;
/// Depth of a request's decoded output stream.
const OUTPUT_DEPTH: usize = 10;
/// How long a full output stream may stall before the request is abandoned.
const CONSUMER_DEADLINE: Duration = Duration::from_secs(10);
const CONSUMER_POLL: Duration = Duration::from_millis(100);

/// A consumer's request as published on the request channel. Field names
/// are the wire contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryRequest {
    pub request_id: String,
    pub device_id: String,
    pub from_timestamp: i64,
    pub to_timestamp: i64,
}

/// Starts the dispatcher. It blocks until codec info exists (nothing can
/// be decoded before ingest has connected once), then serves requests
/// until the store goes away.
pub fn spawn(store: Store, device_id: String, ring: MemoryRing, filter_scale: String) -> Result<()> {
    std::thread::Builder::new()
        .name("history-dispatcher".into())
        .spawn(move || {
            if let Err(e) = dispatch(store, device_id, ring, filter_scale) {
                warn!(%e, "history dispatcher exited");
            }
        })
        .context("failed to spawn history dispatcher")?;
    Ok(())
}

fn dispatch(store: Store, device_id: String, ring: MemoryRing, filter_scale: String) -> Result<()> {
    while CodecInfo::load(&store)?.is_none() {
        std::thread::sleep(Duration::from_millis(100));
    }
    let requests = store.subscribe(keys::REQUEST_CHANNEL)?;
    info!("listening for playback requests");

    for message in requests {
        let request: MemoryRequest = match serde_json::from_slice(&message) {
            Ok(request) => request,
            Err(e) => {
                warn!(%e, "rejecting malformed playback request");
                continue;
            }
        };
        if request.device_id != device_id {
            debug!(device_id = %request.device_id, "ignoring request for another device");
            continue;
        }

        let store = store.clone();
        let ring = ring.clone();
        let filter_scale = filter_scale.clone();
        std::thread::Builder::new()
            .name(format!("history-{}", request.request_id))
            .spawn(move || {
                if let Err(e) = serve_request(&store, &ring, &filter_scale, &request) {
                    warn!(%e, request_id = %request.request_id, "playback request failed");
                }
            })
            .context("failed to spawn request worker")?;
    }
    Ok(())
}

#[instrument(skip_all, fields(request_id = %request.request_id, from = request.from_timestamp, to = request.to_timestamp))]
fn serve_request(
    store: &Store,
    ring: &MemoryRing,
    filter_scale: &str,
    request: &MemoryRequest,
) -> Result<()> {
    let out_key = keys::request_decoded(&request.device_id, &request.request_id);
    let result = decode_range(store, ring, filter_scale, request, &out_key);
    // the consumer always gets its end-of-results marker, even after errors
    let sentinel = DecodedFrame::sentinel().encode()?;
    store.stream_append(&out_key, sentinel, OUTPUT_DEPTH)?;
    result
}

fn decode_range(
    store: &Store,
    ring: &MemoryRing,
    filter_scale: &str,
    request: &MemoryRequest,
    out_key: &str,
) -> Result<()> {
    let info = CodecInfo::load(store)?
        .ok_or_else(|| anyhow!("no codec info published"))?;
    let mut decoder = info.open_decoder()?;
    let mut graph = scale_graph(&info, filter_scale)?;
    let mut converter = BgrConverter::default();

    // never decode into the future
    let to_ts = request.to_timestamp.min(store.now_ms());

    let Some(mut cursor) = ring.seek(request.from_timestamp)? else {
        debug!("keyframe index empty, nothing to decode");
        return Ok(());
    };

    let mut seen_keyframe = false;
    loop {
        let batch = ring.read_after(cursor, READ_BATCH)?;
        let Some(&(last_id, _)) = batch.last() else {
            // ring drained; do not spin waiting for frames that may never come
            break;
        };

        for stored in decodable(&batch, &mut seen_keyframe, to_ts) {
            if let Err(e) = decode_entry(
                &mut decoder,
                &mut graph,
                &mut converter,
                stored,
                store,
                out_key,
            ) {
                if e.is::<ConsumerStalled>() {
                    return Err(e);
                }
                debug!(%e, "skipping undecodable ring entry");
            }
        }

        cursor = last_id;
        if last_id.ms >= to_ts {
            break;
        }
    }
    Ok(())
}

/// Entries of one ring batch that feed the decoder for a request ending at
/// `to_ts`. Leading non-keyframes are dropped — the seek lands on a
/// keyframe, but it may have been evicted between seek and read — and
/// entries past the requested range are not decoded.
fn decodable<'a>(
    batch: &'a [(camgate_store::SeqId, StoredPacket)],
    seen_keyframe: &mut bool,
    to_ts: i64,
) -> Vec<&'a StoredPacket> {
    let mut selected = Vec::new();
    for (id, stored) in batch {
        if !*seen_keyframe {
            if !stored.is_keyframe {
                continue;
            }
            *seen_keyframe = true;
        }
        if id.ms > to_ts {
            continue;
        }
        selected.push(stored);
    }
    selected
}

#[derive(Debug)]
struct ConsumerStalled;

impl std::fmt::Display for ConsumerStalled {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "consumer stalled, abandoning request")
    }
}

impl std::error::Error for ConsumerStalled {}

fn decode_entry(
    decoder: &mut ffmpeg::decoder::Video,
    graph: &mut filter::Graph,
    converter: &mut BgrConverter,
    stored: &StoredPacket,
    store: &Store,
    out_key: &str,
) -> Result<()> {
    let packet = stored.to_packet();
    decoder.send_packet(&packet)?;

    let mut decoded = frame::Video::empty();
    while decoder.receive_frame(&mut decoded).is_ok() {
        let kind = FrameKind::from(decoded.kind());
        graph
            .get("in")
            .ok_or_else(|| anyhow!("filter graph has no source"))?
            .source()
            .add(&decoded)?;

        for scaled in drain_graph(graph)? {
            let bgr = converter.convert(&scaled)?;
            let frame = DecodedFrame::new(&bgr, kind, stored);
            append_with_backpressure(
                store,
                out_key,
                frame.encode()?,
                CONSUMER_DEADLINE,
                CONSUMER_POLL,
            )?;
        }
    }
    Ok(())
}

/// Pulls the filter sink until it runs dry.
fn drain_graph(graph: &mut filter::Graph) -> Result<Vec<frame::Video>> {
    let mut sink = graph
        .get("out")
        .ok_or_else(|| anyhow!("filter graph has no sink"))?;
    let mut frames = Vec::new();
    let mut filtered = frame::Video::empty();
    while sink.sink().frame(&mut filtered).is_ok() {
        frames.push(std::mem::replace(&mut filtered, frame::Video::empty()));
    }
    Ok(frames)
}

/// `buffer → scale(<filter_scale>) → buffersink` over the stream's native
/// geometry. `filter_scale` is e.g. `-1:-1` (no scaling) or `640:-1`.
fn scale_graph(info: &CodecInfo, filter_scale: &str) -> Result<filter::Graph> {
    let mut graph = filter::Graph::new();
    let args = format!(
        "video_size={}x{}:pix_fmt={}:time_base=1/1000:pixel_aspect=1/1",
        info.width, info.height, info.pix_fmt
    );
    graph.add(
        &filter::find("buffer").ok_or_else(|| anyhow!("buffer filter missing"))?,
        "in",
        &args,
    )?;
    graph.add(
        &filter::find("buffersink").ok_or_else(|| anyhow!("buffersink filter missing"))?,
        "out",
        "",
    )?;
    graph
        .output("in", 0)?
        .input("out", 0)?
        .parse(&format!("scale={filter_scale}"))?;
    graph.validate()?;
    Ok(graph)
}

/// Appends to the request's output stream, waiting for the consumer to
/// drain it when full. Raw frames are large, so the stream depth is the
/// real memory bound of a request.
fn append_with_backpressure(
    store: &Store,
    key: &str,
    payload: Vec<u8>,
    deadline: Duration,
    poll: Duration,
) -> Result<()> {
    let started = Instant::now();
    while store.stream_len(key)? >= OUTPUT_DEPTH {
        if started.elapsed() >= deadline {
            bail!(ConsumerStalled);
        }
        std::thread::sleep(poll);
    }
    store.stream_append(key, payload, OUTPUT_DEPTH)?;
    Ok(())
}
