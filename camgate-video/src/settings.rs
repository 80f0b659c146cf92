//! Per-device settings written by external consumers and polled by the
//! pipeline on every packet.

use anyhow::Result;
use camgate_store::Store;

use crate::keys;

/// How long a `last_query` keeps the live decoder awake.
pub const QUERY_FRESH_WINDOW_MS: i64 = 10_000;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceSettings {
    /// Wall-clock ms of the consumer's most recent latest-frame query.
    pub last_query: Option<i64>,
    /// Forward the stream to the RTMP egress.
    pub proxy_rtmp: bool,
    /// Restrict live decoding to the opening keyframe of each group.
    pub keyframe_only: bool,
}

impl DeviceSettings {
    pub fn load(store: &Store, device_id: &str) -> Result<DeviceSettings> {
        let map = store.map_get_all(&keys::settings(device_id))?;
        Ok(DeviceSettings {
            last_query: map.get("last_query").and_then(|v| v.parse().ok()),
            proxy_rtmp: map.get("proxy_rtmp").map(String::as_str) == Some("1"),
            keyframe_only: map
                .get("keyframe_only")
                .is_some_and(|v| v.eq_ignore_ascii_case("true")),
        })
    }

    /// Whether a consumer asked for frames recently enough that live
    /// decoding should run.
    pub fn query_fresh(&self, now_ms: i64) -> bool {
        self.last_query
            .is_some_and(|ts| now_ms - ts < QUERY_FRESH_WINDOW_MS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_defaults_and_values() {
        let store = Store::new();
        let empty = DeviceSettings::load(&store, "cam0").unwrap();
        assert_eq!(empty, DeviceSettings::default());

        let key = keys::settings("cam0");
        store.map_set(&key, "last_query", "1234").unwrap();
        store.map_set(&key, "proxy_rtmp", "1").unwrap();
        store.map_set(&key, "keyframe_only", "True").unwrap();
        let settings = DeviceSettings::load(&store, "cam0").unwrap();
        assert_eq!(settings.last_query, Some(1234));
        assert!(settings.proxy_rtmp);
        assert!(settings.keyframe_only);

        store.map_set(&key, "last_query", "soon").unwrap();
        store.map_set(&key, "proxy_rtmp", "0").unwrap();
        let settings = DeviceSettings::load(&store, "cam0").unwrap();
        assert_eq!(settings.last_query, None);
        assert!(!settings.proxy_rtmp);
    }

    #[test]
    fn test_query_freshness_window() {
        let now = 100_000;
        let fresh = DeviceSettings { last_query: Some(now - 9_999), ..Default::default() };
        let stale = DeviceSettings { last_query: Some(now - 10_000), ..Default::default() };
        let unset = DeviceSettings::default();
        assert!(fresh.query_fresh(now));
        assert!(!stale.query_fresh(now));
        assert!(!unset.query_fresh(now));
    }
}
