//! Shared store keyspace. These names are the external interface contract:
//! consumers read the decoded streams and write the settings map by these
//! exact keys.

/// Codec metadata of the currently ingested video stream.
pub const CODEC_VIDEO_INFO: &str = "codec_video_info";

/// Pub/sub channel on which consumers request time-ranged decoding.
pub const REQUEST_CHANNEL: &str = "memory_buffer_channel";

/// Compressed ring of the newest demuxed packets.
pub fn compressed_ring(device_id: &str) -> String {
    format!("in_memory_queue_{device_id}")
}

/// Keyframe index parallel to the compressed ring.
pub fn keyframe_index(device_id: &str) -> String {
    format!("memory_iframe_list_{device_id}")
}

/// Live decoded frames. The bare device id is the stream consumers already
/// poll for the latest frame.
pub fn live_decoded(device_id: &str) -> String {
    device_id.to_owned()
}

/// Per-request decoded output of the historical decoder.
pub fn request_decoded(device_id: &str, request_id: &str) -> String {
    format!("memory_decoded_{device_id}{request_id}")
}

/// Settings map written by consumers: `last_query`, `proxy_rtmp`,
/// `keyframe_only`.
pub fn settings(device_id: &str) -> String {
    format!("settings:{device_id}")
}
