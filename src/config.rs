use std::{path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use camgate_video::pipeline::PipelineConfig;
use clap::Parser;

/// Edge video proxy: ingests an IP camera over RTSP, archives segmented
/// recordings, keeps a short in-memory frame buffer and optionally forwards
/// the stream to an RTMP endpoint.
#[derive(Parser, Debug)]
#[command(name = "camgate", version)]
pub struct Config {
    /// RTSP URL of the source camera.
    #[arg(long)]
    pub rtsp: String,

    /// RTMP URL to forward the stream to; egress is disabled when absent.
    #[arg(long)]
    pub rtmp: Option<String>,

    /// Stable identifier of this camera; namespaces all store keys and the
    /// segment directory.
    #[arg(long)]
    pub device_id: String,

    /// In-memory compressed ring length in frames. The default keeps only
    /// the newest frame, which effectively disables historical queries.
    #[arg(long, default_value_t = 1)]
    pub memory_buffer: usize,

    /// Scale expression applied to historical decoded frames, e.g. `-1:-1`
    /// (no scaling) or `640:-1`.
    #[arg(long, default_value = "-1:-1")]
    pub memory_scale: String,

    /// Root directory for segmented recordings; archiving is disabled when
    /// absent.
    #[arg(long)]
    pub disk_path: Option<PathBuf>,

    /// Delete segments older than this age, e.g. `30m`, `1h`, `7d`.
    #[arg(long, default_value = "1m")]
    pub disk_cleanup_rate: String,
}

impl Config {
    pub fn retention(&self) -> Result<Duration> {
        camgate_util::duration::parse_age(&self.disk_cleanup_rate)
            .with_context(|| format!("invalid disk_cleanup_rate '{}'", self.disk_cleanup_rate))
    }

    pub fn into_pipeline_config(self) -> Result<PipelineConfig> {
        let retention = self.retention()?;
        Ok(PipelineConfig {
            device_id: self.device_id,
            rtsp_url: self.rtsp,
            rtmp_url: self.rtmp,
            memory_buffer: self.memory_buffer,
            memory_scale: self.memory_scale,
            disk_path: self.disk_path,
            retention,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config =
            Config::parse_from(["camgate", "--rtsp", "rtsp://cam/stream", "--device-id", "cam0"]);
        assert_eq!(config.memory_buffer, 1);
        assert_eq!(config.memory_scale, "-1:-1");
        assert_eq!(config.retention().unwrap(), Duration::from_secs(60));
        assert!(config.rtmp.is_none());
        assert!(config.disk_path.is_none());
    }

    #[test]
    fn test_required_args() {
        assert!(Config::try_parse_from(["camgate", "--rtsp", "rtsp://cam/stream"]).is_err());
        assert!(Config::try_parse_from(["camgate", "--device-id", "cam0"]).is_err());
    }

    #[test]
    fn test_bad_retention_is_rejected() {
        let config = Config::parse_from([
            "camgate",
            "--rtsp",
            "rtsp://cam/stream",
            "--device-id",
            "cam0",
            "--disk-cleanup-rate",
            "sometime",
        ]);
        assert!(config.retention().is_err());
    }
}
